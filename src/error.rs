use thiserror::Error;

/// Precondition violations and recoverable failures surfaced by the taint
/// engine. Per spec §7, anything constructed here other than
/// `TooManyTaintSources`/`InvalidOperandSize`/`AddressOutOfRange` is a bug
/// in the dispatch layer, not in analyzed code.
#[derive(Debug, Error)]
pub enum TaintError {
    #[error("too many taint sources: attempted to introduce past the {max}-bit budget")]
    TooManyTaintSources { max: usize },

    #[error("invalid operand size {size} for {context}")]
    InvalidOperandSize { size: u32, context: &'static str },

    #[error("address 0x{addr:08x} is out of range for this operation")]
    AddressOutOfRange { addr: u32 },

    #[error("taint region offset {offset} + len {len} exceeds recorded taint count {count}")]
    RegionOutOfRange {
        offset: usize,
        len: usize,
        count: usize,
    },
}

/// Failures from the disassembly store (spec §4.3, §7).
#[derive(Debug, Error)]
pub enum DisasmError {
    #[error("EIP 0x{0:08x} does not lie in any known executable section")]
    NoSection(u32),

    #[error("instruction decode at 0x{0:08x} produced no bytes")]
    EmptyDecode(u32),
}

/// Archive (persisted-state) I/O failures. Missing file on load is not an
/// error (benign fresh state, per spec §7) and is therefore not a variant
/// here.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to read archive at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write archive at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize archive component {component}: {source}")]
    Serde {
        component: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
