//! `IcedDecoder`: the `InstructionDecoder` implementation backed by
//! `iced-x86`, the same decoder `mttn` uses in `trace.rs::tracee_instr`.
//! Converts `iced_x86::Instruction` into this crate's decoder-agnostic
//! `Inst` model so the taint engine and disassembly store never touch
//! `iced_x86` types directly.

use iced_x86::{Code, Decoder, DecoderOptions, Instruction, OpCodeTableKind, OpKind, Register};

use crate::host::InstructionDecoder;
use crate::taint::cputaint::Gpr;

use super::inst::{ArgKind, ArgType, Inst, MemOperand, PrefixFlags};

pub struct IcedDecoder {
    bitness: u32,
}

impl IcedDecoder {
    pub fn new32() -> Self {
        IcedDecoder { bitness: 32 }
    }
}

impl Default for IcedDecoder {
    fn default() -> Self {
        Self::new32()
    }
}

impl InstructionDecoder for IcedDecoder {
    fn decode(&self, eip: u32, bytes: &[u8]) -> Inst {
        let mut decoder = Decoder::new(self.bitness, bytes, DecoderOptions::NONE);
        decoder.set_ip(eip as u64);
        let instr = decoder.decode();

        if instr.code() == Code::INVALID || instr.len() == 0 {
            return Inst::invalid(eip);
        }

        convert(eip, &instr)
    }
}

fn reg_to_gpr(reg: Register) -> Option<(Gpr, bool)> {
    use Register::*;
    Some(match reg {
        EAX | AX | AL => (Gpr::Eax, false),
        AH => (Gpr::Eax, true),
        ECX | CX | CL => (Gpr::Ecx, false),
        CH => (Gpr::Ecx, true),
        EDX | DX | DL => (Gpr::Edx, false),
        DH => (Gpr::Edx, true),
        EBX | BX | BL => (Gpr::Ebx, false),
        BH => (Gpr::Ebx, true),
        ESP | SP => (Gpr::Esp, false),
        EBP | BP => (Gpr::Ebp, false),
        ESI | SI => (Gpr::Esi, false),
        EDI | DI => (Gpr::Edi, false),
        _ => return Option::None,
    })
}

fn reg_size(reg: Register) -> u32 {
    reg.size() as u32 * 8
}

fn mm_index(reg: Register) -> Option<usize> {
    use Register::*;
    Some(match reg {
        MM0 => 0,
        MM1 => 1,
        MM2 => 2,
        MM3 => 3,
        MM4 => 4,
        MM5 => 5,
        MM6 => 6,
        MM7 => 7,
        _ => return Option::None,
    })
}

fn xmm_index(reg: Register) -> Option<usize> {
    use Register::*;
    Some(match reg {
        XMM0 => 0,
        XMM1 => 1,
        XMM2 => 2,
        XMM3 => 3,
        XMM4 => 4,
        XMM5 => 5,
        XMM6 => 6,
        XMM7 => 7,
        _ => return Option::None,
    })
}

fn register_arg(reg: Register) -> Option<ArgType> {
    if let Some((gpr, high_byte)) = reg_to_gpr(reg) {
        return Some(ArgType {
            kind: ArgKind::Gpr { reg: gpr, high_byte },
            size: reg_size(reg),
        });
    }
    if let Some(idx) = mm_index(reg) {
        return Some(ArgType {
            kind: ArgKind::Mm(idx),
            size: 64,
        });
    }
    if let Some(idx) = xmm_index(reg) {
        return Some(ArgType {
            kind: ArgKind::Xmm(idx),
            size: 128,
        });
    }
    None
}

fn memory_arg(instr: &Instruction) -> ArgType {
    let base = reg_to_gpr(instr.memory_base()).map(|(g, _)| g);
    let index = reg_to_gpr(instr.memory_index()).map(|(g, _)| g);
    let mem = MemOperand {
        base,
        index,
        scale: instr.memory_index_scale() as u8,
        displacement: instr.memory_displacement32() as i32,
        segment_override: instr.segment_prefix() != Register::None,
    };
    ArgType {
        kind: ArgKind::Memory(mem),
        size: instr.memory_size().size() as u32 * 8,
    }
}

fn immediate_arg(instr: &Instruction, n: u32, kind: OpKind) -> ArgType {
    let (value, size) = match kind {
        OpKind::Immediate8 | OpKind::Immediate8to32 | OpKind::Immediate8to64 | OpKind::Immediate8_2nd => {
            (instr.immediate(n) as i64, 8)
        }
        OpKind::Immediate16 => (instr.immediate(n) as i64, 16),
        OpKind::Immediate32 | OpKind::Immediate32to64 => (instr.immediate(n) as i64, 32),
        OpKind::Immediate64 => (instr.immediate(n) as i64, 64),
        _ => (instr.immediate(n) as i64, 32),
    };
    ArgType {
        kind: ArgKind::Immediate(value),
        size,
    }
}

fn convert_operand(instr: &Instruction, n: u32) -> Option<ArgType> {
    match instr.op_kind(n) {
        OpKind::Register => register_arg(instr.op_register(n)),
        OpKind::Memory => Some(memory_arg(instr)),
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => Some(ArgType {
            kind: ArgKind::Immediate(instr.near_branch_target() as i64),
            size: 32,
        }),
        kind @ (OpKind::Immediate8
        | OpKind::Immediate8to32
        | OpKind::Immediate8to64
        | OpKind::Immediate8_2nd
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate32to64
        | OpKind::Immediate64) => Some(immediate_arg(instr, n, kind)),
        _ => None,
    }
}

fn prefix_flags(instr: &Instruction) -> PrefixFlags {
    let mut flags = PrefixFlags::empty();
    if instr.code_size() == iced_x86::CodeSize::Code16 {
        flags |= PrefixFlags::OPERAND_SIZE_16;
    }
    if instr.has_rep_prefix() {
        flags |= PrefixFlags::REP;
    }
    if instr.has_repne_prefix() {
        flags |= PrefixFlags::REPNE;
    }
    if instr.has_lock_prefix() {
        flags |= PrefixFlags::LOCK;
    }
    flags
}

fn opcode_and_modrm(instr: &Instruction) -> (u32, Option<u8>) {
    let info = instr.op_code();
    let raw = info.op_code() as u32;
    let opcode = match info.table() {
        OpCodeTableKind::Normal => raw,
        _ => 0xF00 | raw,
    };
    let group_index = info.group_index();
    let modrm_reg = if group_index >= 0 { Some(group_index as u8) } else { None };
    (opcode, modrm_reg)
}

fn target_for(instr: &Instruction) -> Option<u32> {
    match instr.op0_kind() {
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
            Some(instr.near_branch_target() as u32)
        }
        _ => None,
    }
}

fn convert(eip: u32, instr: &Instruction) -> Inst {
    let (opcode, modrm_reg) = opcode_and_modrm(instr);

    let mut args: [Option<ArgType>; 3] = [None, None, None];
    for (n, slot) in args.iter_mut().enumerate() {
        if (n as u32) < instr.op_count() {
            *slot = convert_operand(instr, n as u32);
        }
    }

    Inst {
        eip,
        length: instr.len() as u32,
        mnemonic: format!("{:?}", instr.mnemonic()).to_lowercase(),
        opcode,
        modrm_reg,
        prefix: prefix_flags(instr),
        args,
        target: target_for(instr),
        entry: None,
        target_module_name: None,
        target_func_name: None,
        is_invalid: false,
        index: None,
    }
}
