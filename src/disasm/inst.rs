//! `Inst`: the decoded-instruction record (spec §3). Ported from
//! `Prophet/static/disassembler.h`'s `Inst : public Instruction`.

use crate::taint::cputaint::Gpr;

/// Addressing-mode description for a memory operand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemOperand {
    pub base: Option<Gpr>,
    pub index: Option<Gpr>,
    pub scale: u8,
    pub displacement: i32,
    pub segment_override: bool,
}

/// The kind of one instruction argument, independent of its size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// A general-purpose register, tagged with whether it addresses the
    /// high byte of a 16-bit pair (AH/BH/CH/DH).
    Gpr { reg: Gpr, high_byte: bool },
    Mm(usize),
    Xmm(usize),
    Eip,
    Flags,
    Memory(MemOperand),
    Immediate(i64),
}

/// One decoded operand: its kind plus bit width (8/16/32/64/128, spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgType {
    pub kind: ArgKind,
    pub size: u32,
}

impl ArgType {
    pub fn is_register(&self) -> bool {
        matches!(
            self.kind,
            ArgKind::Gpr { .. } | ArgKind::Mm(_) | ArgKind::Xmm(_) | ArgKind::Eip | ArgKind::Flags
        )
    }

    pub fn is_memory(&self) -> bool {
        matches!(self.kind, ArgKind::Memory(_))
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.kind, ArgKind::Immediate(_))
    }

    pub fn memory(&self) -> Option<&MemOperand> {
        match &self.kind {
            ArgKind::Memory(m) => Some(m),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Prefix bits relevant to taint propagation (operand-size override,
    /// REP family, LOCK). Segment overrides are tracked on the memory
    /// operand itself.
    pub struct PrefixFlags: u8 {
        const OPERAND_SIZE_16 = 0b0000_0001;
        const ADDRESS_SIZE_16 = 0b0000_0010;
        const REP              = 0b0000_0100;
        const REPNE            = 0b0000_1000;
        const LOCK             = 0b0001_0000;
    }
}

/// A decoded instruction, keyed by its `eip` once inserted into an
/// `InstSection`. `index` is assigned by `InstSection::update_indices` and
/// is `None` until the section has been indexed at least once.
#[derive(Debug, Clone)]
pub struct Inst {
    pub eip: u32,
    pub length: u32,
    pub mnemonic: String,
    /// Opcode, with the `0F` two-byte escape folded in as the high byte
    /// (e.g. `0FAF` for `IMUL r,r/m`) so a single `u32` disambiguates
    /// one-byte from two-byte opcodes (spec §4.4: `INST_ONEBYTE`/
    /// `INST_TWOBYTE`).
    pub opcode: u32,
    pub modrm_reg: Option<u8>,
    pub prefix: PrefixFlags,
    pub args: [Option<ArgType>; 3],
    pub target: Option<u32>,
    pub entry: Option<u32>,
    pub target_module_name: Option<String>,
    pub target_func_name: Option<String>,
    pub is_invalid: bool,
    pub index: Option<usize>,
}

impl Inst {
    pub fn invalid(eip: u32) -> Self {
        Inst {
            eip,
            length: 1,
            mnemonic: "(bad)".to_string(),
            opcode: 0,
            modrm_reg: None,
            prefix: PrefixFlags::empty(),
            args: [None, None, None],
            target: None,
            entry: None,
            target_module_name: None,
            target_func_name: None,
            is_invalid: true,
            index: None,
        }
    }

    pub fn is_one_byte_opcode(&self) -> bool {
        self.opcode <= 0xFF
    }

    pub fn is_two_byte_opcode(&self) -> bool {
        self.opcode > 0xFF
    }

    /// Low byte used to index `HandlerOneByte`/`HandlerTwoBytes`.
    pub fn dispatch_opcode(&self) -> u8 {
        (self.opcode & 0xFF) as u8
    }

    pub fn arg(&self, n: usize) -> Option<&ArgType> {
        self.args.get(n).and_then(|a| a.as_ref())
    }

    /// Terminators per spec §4.3: `ret`/`retf`/`int3`/`int imm8`.
    pub fn is_terminator(&self) -> bool {
        self.is_invalid || matches!(self.dispatch_opcode(), 0xC3 | 0xCB | 0xC2 | 0xCA | 0xCC | 0xCD)
    }
}
