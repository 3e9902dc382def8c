//! External interfaces the core consumes (spec §6), and the
//! decoder-agnostic instruction/operand model the disassembly store and
//! taint engine are both built on.
//!
//! The host emulator's own decoder, memory model and register file are
//! explicitly out of scope (spec §1) — the core only ever sees the types
//! defined here, produced by whatever decoder/processor implementation a
//! caller plugs in. Per spec §9's note on the Disassembler/Debugger
//! ownership cycle, the `Processor` is always passed explicitly at the
//! call site rather than owned by the core.

use crate::taint::cputaint::Gpr;

/// One contiguous executable memory section, as reported by the host's
/// memory model.
#[derive(Debug, Clone)]
pub struct MemorySection {
    pub base: u32,
    pub size: u32,
    pub description: String,
}

impl MemorySection {
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.base.saturating_add(self.size)
    }
}

/// Read-only processor state the core needs to resolve effective
/// addresses and to locate the section containing an address. Implemented
/// by the host emulator (or, in this crate's demonstration binary, by the
/// ptrace-based ambient host).
pub trait ProcessorView {
    fn eip(&self) -> u32;
    fn gpr(&self, reg: Gpr) -> u32;
    fn flags(&self) -> u32;
    fn section_containing(&self, addr: u32) -> Option<MemorySection>;
    fn read_bytes(&self, addr: u32, len: usize) -> Vec<u8>;
}

/// A decoder plugged in by the host (this crate's own `IcedDecoder` uses
/// `iced-x86`, matching the teacher's decoder choice). The disassembler
/// store never decodes bytes itself; it only caches what this returns.
pub trait InstructionDecoder {
    fn decode(&self, eip: u32, bytes: &[u8]) -> crate::disasm::inst::Inst;
}

/// `{ModuleName, FunctionName}` lookup by address, used to attach
/// DLL+function names to `call`/`jmp` targets that resolve through an
/// import address table.
pub trait ApiInfoTable {
    fn lookup(&self, addr: u32) -> Option<ApiInfo>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiInfo {
    pub module_name: String,
    pub function_name: String,
}

/// A no-op API table for hosts (and tests) that don't model imports.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoApiInfo;

impl ApiInfoTable for NoApiInfo {
    fn lookup(&self, _addr: u32) -> Option<ApiInfo> {
        None
    }
}
