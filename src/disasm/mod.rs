//! Decoder-agnostic instruction model and disassembly store (spec §4).

pub mod disassembler;
pub mod iced_decoder;
pub mod inst;
pub mod mem;
pub mod section;

pub use disassembler::Disassembler;
pub use iced_decoder::IcedDecoder;
pub use inst::{ArgKind, ArgType, Inst, MemOperand, PrefixFlags};
pub use mem::InstMem;
pub use section::InstSection;
