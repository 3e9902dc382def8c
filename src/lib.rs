//! Dynamic taint analysis, disassembly store, trace buffer and protocol
//! message analyzer for x86-32 execution traces.
//!
//! The host emulator (register file, memory, decode) is out of scope for
//! this crate (spec §1): everything here is driven through the
//! [`host`] traits by whatever concrete host a caller plugs in. This
//! crate's own `lochstrace` binary plugs in a ptrace-based Linux host
//! ([`ptrace_host`]) purely so the library is runnable end-to-end.

pub mod archive;
pub mod config;
pub mod disasm;
pub mod error;
pub mod eventbus;
pub mod hashanalyzer;
pub mod host;
pub mod protocol;
pub mod ptrace_host;
pub mod taint;
pub mod trace;

pub use config::Config;
pub use error::{ArchiveError, DisasmError, TaintError};
pub use eventbus::{Engine, Event, EventKind, Plugin};
