//! One function per instruction-family handler. Ported section by section
//! from `taintengine.cpp`'s per-opcode handlers; each handler reads its
//! operand taint through `TaintEngine::get`/`set` so none of them touch
//! `ProcessorTaint`/`MemoryTaint` layout directly.
//!
//! String instructions (`movs`/`stos`/`lods`/`scas`/`cmps`) address through
//! ESI/EDI directly rather than through a decoded memory `ArgType`, mirroring
//! `mttn::trace`'s own note that REP'd instructions are single-stepped one
//! iteration at a time — each call here models exactly one iteration.

use anyhow::{anyhow, Result};

use crate::disasm::inst::{ArgKind, ArgType, Inst};
use crate::host::ProcessorView;
use crate::taint::cputaint::{Flag, Gpr};
use crate::taint::engine::{TaintEngine, TaintValue};
use crate::taint::flagtest::Condition;
use crate::taint::value::{Taint, Taint1, Taint4, TaintN};
use crate::trace::ExecFlags;

fn arg0<'a>(inst: &'a Inst) -> Result<&'a ArgType> {
    inst.arg(0).ok_or_else(|| anyhow!("{}: missing operand 0", inst.mnemonic))
}

fn arg1<'a>(inst: &'a Inst) -> Result<&'a ArgType> {
    inst.arg(1).ok_or_else(|| anyhow!("{}: missing operand 1", inst.mnemonic))
}

fn eax_arg(size: u32) -> ArgType {
    ArgType {
        kind: ArgKind::Gpr { reg: Gpr::Eax, high_byte: false },
        size,
    }
}

fn gpr_arg(reg: Gpr, size: u32) -> ArgType {
    ArgType {
        kind: ArgKind::Gpr { reg, high_byte: false },
        size,
    }
}

fn string_op_size_bits(mnemonic: &str) -> u32 {
    if mnemonic.ends_with('b') {
        8
    } else if mnemonic.ends_with('w') {
        16
    } else if mnemonic.ends_with('q') {
        64
    } else {
        32
    }
}

fn lanes_of(v: &TaintValue) -> Vec<Taint> {
    match v {
        TaintValue::B1(TaintN(a)) => a.to_vec(),
        TaintValue::B2(TaintN(a)) => a.to_vec(),
        TaintValue::B4(TaintN(a)) => a.to_vec(),
        TaintValue::B8(TaintN(a)) => a.to_vec(),
        TaintValue::B16(TaintN(a)) => a.to_vec(),
    }
}

/// `MOVZX`: zero-extend. New high lanes come from a constant `0`, so only
/// the low lanes carry the source's taint.
fn widen_zero(src: TaintValue, dst_bits: u32) -> TaintValue {
    let lanes = lanes_of(&src);
    match dst_bits {
        16 => TaintValue::B2(TaintN::<2>([lanes[0], Taint::new()])),
        32 if lanes.len() == 1 => TaintValue::B4(TaintN::<4>([lanes[0], Taint::new(), Taint::new(), Taint::new()])),
        32 => TaintValue::B4(TaintN::<4>([lanes[0], lanes[1], Taint::new(), Taint::new()])),
        _ => src,
    }
}

/// `MOVSX`: conservative sign-extend approximation (§9 Open Question) —
/// replicate the top source lane into every new lane, rather than the
/// top bit.
fn sign_extend_conservative(src: TaintValue, dst_bits: u32) -> TaintValue {
    let lanes = lanes_of(&src);
    let top = *lanes.last().unwrap();
    match dst_bits {
        16 => TaintValue::B2(TaintN::<2>([lanes[0], top])),
        32 if lanes.len() == 1 => TaintValue::B4(TaintN::<4>([lanes[0], top, top, top])),
        32 => TaintValue::B4(TaintN::<4>([lanes[0], lanes[1], top, top])),
        _ => src,
    }
}

fn reverse_lanes(v: TaintValue) -> TaintValue {
    match v {
        TaintValue::B4(TaintN(mut a)) => {
            a.reverse();
            TaintValue::B4(TaintN(a))
        }
        TaintValue::B8(TaintN(mut a)) => {
            a.reverse();
            TaintValue::B8(TaintN(a))
        }
        other => other,
    }
}

fn condition_suffix(mnemonic: &str) -> Option<&str> {
    if let Some(s) = mnemonic.strip_prefix("cmov") {
        Some(s)
    } else if let Some(s) = mnemonic.strip_prefix("set") {
        Some(s)
    } else if mnemonic.starts_with('j') && mnemonic != "jmp" {
        Some(&mnemonic[1..])
    } else {
        None
    }
}

fn map_condition(mnemonic: &str) -> Option<Condition> {
    use Condition::*;
    Some(match condition_suffix(mnemonic)? {
        "o" => O,
        "no" => No,
        "b" | "c" | "nae" => B,
        "ae" | "nb" | "nc" => Ae,
        "e" | "z" => E,
        "ne" | "nz" => Ne,
        "be" | "na" => Be,
        "a" | "nbe" => A,
        "s" => S,
        "ns" => Ns,
        "p" | "pe" => P,
        "np" | "po" => Np,
        "l" | "nge" => L,
        "ge" | "nl" => Ge,
        "le" | "ng" => Le,
        "g" | "nle" => G,
        _ => return None,
    })
}

fn eval_condition(cond: Condition, flags: u32) -> bool {
    let cf = flags & 0x0001 != 0;
    let pf = flags & 0x0004 != 0;
    let zf = flags & 0x0040 != 0;
    let sf = flags & 0x0080 != 0;
    let of = flags & 0x0800 != 0;
    use Condition::*;
    match cond {
        O => of,
        No => !of,
        B => cf,
        Ae => !cf,
        E => zf,
        Ne => !zf,
        Be => cf || zf,
        A => !cf && !zf,
        S => sf,
        Ns => !sf,
        P => pf,
        Np => !pf,
        L => sf != of,
        Ge => sf == of,
        Le => zf || (sf != of),
        G => !zf && (sf == of),
    }
}

pub fn handle_mov(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let (dst, src) = (arg0(inst)?, arg1(inst)?);
    let v = engine.get(src, proc);
    engine.set(dst, v, proc);
    Ok(())
}

pub fn handle_lea(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let (dst, src) = (arg0(inst)?, arg1(inst)?);
    let mem = src.memory().ok_or_else(|| anyhow!("lea: operand 1 is not memory"))?;
    let mut acc = Taint::new();
    if let Some(base) = mem.base {
        acc |= crate::taint::value::shrink(engine.cpu.gpr32(base)).value();
    }
    if let Some(index) = mem.index {
        acc |= crate::taint::value::shrink(engine.cpu.gpr32(index)).value();
    }
    engine.set(dst, TaintValue::extend_from(dst.size, Taint1::single(acc)), proc);
    Ok(())
}

pub fn handle_push(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let src = arg0(inst)?;
    let v = engine.get(src, proc);
    let esp = proc.gpr(Gpr::Esp);
    let addr = esp.wrapping_sub(src.size / 8);
    engine.mem_set(addr, v);
    Ok(())
}

pub fn handle_pop(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let dst = arg0(inst)?;
    let esp = proc.gpr(Gpr::Esp);
    let v = engine.mem_get(esp, dst.size);
    engine.set(dst, v, proc);
    Ok(())
}

pub fn handle_xchg(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let (a, b) = (arg0(inst)?, arg1(inst)?);
    let av = engine.get(a, proc);
    let bv = engine.get(b, proc);
    engine.set(a, bv, proc);
    engine.set(b, av, proc);
    Ok(())
}

pub fn handle_default_binop(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let (dst, src) = (arg0(inst)?, arg1(inst)?);
    let result = engine.get(dst, proc).or(&engine.get(src, proc));
    engine.set(dst, result, proc);
    engine.cpu.set_all_flags(result.shrink1());
    Ok(())
}

/// `XOR dst, dst` (self-zeroing idiom): the result is the architectural
/// constant zero regardless of `dst`'s prior taint, so taint is cleared
/// unconditionally rather than OR'd.
pub fn handle_xor(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let (dst, src) = (arg0(inst)?, arg1(inst)?);
    if dst.kind == src.kind {
        let zero = TaintValue::zero(dst.size);
        engine.set(dst, zero, proc);
        engine.cpu.set_all_flags(Taint1::default());
        return Ok(());
    }
    handle_default_binop(engine, inst, proc, _exec_flags)
}

pub fn handle_adc(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let (dst, src) = (arg0(inst)?, arg1(inst)?);
    let cf = engine.cpu.flag(Flag::Cf);
    let result = engine
        .get(dst, proc)
        .or(&engine.get(src, proc))
        .or(&TaintValue::extend_from(dst.size, cf));
    engine.set(dst, result, proc);
    engine.cpu.set_all_flags(result.shrink1());
    Ok(())
}

pub fn handle_sbb(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    handle_adc(engine, inst, proc, _exec_flags)
}

pub fn handle_cmp_test(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let (a, b) = (arg0(inst)?, arg1(inst)?);
    let combined = engine.get(a, proc).or(&engine.get(b, proc));
    engine.cpu.set_all_flags(combined.shrink1());
    Ok(())
}

pub fn handle_inc_dec(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let dst = arg0(inst)?;
    let v = engine.get(dst, proc);
    engine.cpu.set_flags_except_cf(v.shrink1());
    Ok(())
}

fn string_src_dst(mnemonic: &str, proc: &dyn ProcessorView) -> (u32, u32, u32) {
    let size_bits = string_op_size_bits(mnemonic);
    (proc.gpr(Gpr::Esi), proc.gpr(Gpr::Edi), size_bits)
}

pub fn handle_movs(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let (src, dst, size_bits) = string_src_dst(&inst.mnemonic, proc);
    let v = engine.mem_get(src, size_bits);
    engine.mem_set(dst, v);
    Ok(())
}

pub fn handle_stos(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let size_bits = string_op_size_bits(&inst.mnemonic);
    let dst = proc.gpr(Gpr::Edi);
    let v = engine.get(&eax_arg(size_bits), proc);
    engine.mem_set(dst, v);
    Ok(())
}

pub fn handle_lods(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let size_bits = string_op_size_bits(&inst.mnemonic);
    let src = proc.gpr(Gpr::Esi);
    let v = engine.mem_get(src, size_bits);
    engine.set(&eax_arg(size_bits), v, proc);
    Ok(())
}

pub fn handle_scas(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let size_bits = string_op_size_bits(&inst.mnemonic);
    let dst_addr = proc.gpr(Gpr::Edi);
    let mem_taint = engine.mem_get(dst_addr, size_bits);
    let eax_taint = engine.get(&eax_arg(size_bits), proc);
    engine.cpu.set_all_flags(mem_taint.or(&eax_taint).shrink1());
    Ok(())
}

/// `CMPS`: dedicated handler per §9 — flags-only, no destination write,
/// same shape as `CMP`/`TEST` but string-addressed through ESI/EDI.
pub fn handle_cmps(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let (src, dst, size_bits) = string_src_dst(&inst.mnemonic, proc);
    let a = engine.mem_get(src, size_bits);
    let b = engine.mem_get(dst, size_bits);
    engine.cpu.set_all_flags(a.or(&b).shrink1());
    Ok(())
}

pub fn handle_movzx(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let (dst, src) = (arg0(inst)?, arg1(inst)?);
    let v = engine.get(src, proc);
    engine.set(dst, widen_zero(v, dst.size), proc);
    Ok(())
}

pub fn handle_movsx(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let (dst, src) = (arg0(inst)?, arg1(inst)?);
    let v = engine.get(src, proc);
    engine.set(dst, sign_extend_conservative(v, dst.size), proc);
    Ok(())
}

pub fn handle_bswap(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let dst = arg0(inst)?;
    let v = engine.get(dst, proc);
    engine.set(dst, reverse_lanes(v), proc);
    Ok(())
}

pub fn handle_imul(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let result = match (inst.arg(0), inst.arg(1), inst.arg(2)) {
        (Some(dst), Some(src), Some(_imm)) => {
            let r = engine.get(dst, proc).or(&engine.get(src, proc));
            engine.set(dst, r, proc);
            r
        }
        (Some(dst), Some(src), None) => {
            let r = engine.get(dst, proc).or(&engine.get(src, proc));
            engine.set(dst, r, proc);
            r
        }
        (Some(src), None, None) => {
            let eax = eax_arg(src.size);
            let r = engine.get(&eax, proc).or(&engine.get(src, proc));
            engine.set(&eax, r, proc);
            if src.size >= 16 {
                let edx = gpr_arg(Gpr::Edx, src.size);
                engine.set(&edx, r, proc);
            }
            r
        }
        _ => return Err(anyhow!("imul: unsupported operand shape")),
    };
    engine.cpu.set_all_flags(result.shrink1());
    Ok(())
}

pub fn handle_mul(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let src = arg0(inst)?;
    let eax = eax_arg(src.size);
    let combined = engine.get(&eax, proc).or(&engine.get(src, proc));
    engine.set(&eax, combined, proc);
    let edx = gpr_arg(Gpr::Edx, src.size);
    engine.set(&edx, combined, proc);
    engine.cpu.set_all_flags(combined.shrink1());
    Ok(())
}

pub fn handle_div(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let src = arg0(inst)?;
    let eax = eax_arg(src.size);
    let edx = gpr_arg(Gpr::Edx, src.size);
    let combined = engine
        .get(&eax, proc)
        .or(&engine.get(&edx, proc))
        .or(&engine.get(src, proc));
    engine.set(&eax, combined, proc);
    engine.set(&edx, combined, proc);
    Ok(())
}

pub fn handle_idiv(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    handle_div(engine, inst, proc, _exec_flags)
}

pub fn handle_shift_rotate(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let dst = arg0(inst)?;
    let v = engine.get(dst, proc);
    engine.cpu.set_all_flags(v.shrink1());
    Ok(())
}

pub fn handle_shld(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let (dst, src) = (arg0(inst)?, arg1(inst)?);
    let result = engine.get(dst, proc).or(&engine.get(src, proc));
    engine.set(dst, result, proc);
    engine.cpu.set_all_flags(result.shrink1());
    Ok(())
}

pub fn handle_shrd(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    handle_shld(engine, inst, proc, _exec_flags)
}

/// `CALL abs` skips the `Eip := src` assignment when the host has flagged
/// this call as resolving into a known API (`WINAPI_CALL`), per spec
/// §4.4 and the original `CallAbs_Handler`'s `HasExecFlag` guard. The
/// return-address push onto the stack is unconditional either way.
pub fn handle_call(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, exec_flags: ExecFlags) -> Result<()> {
    let esp = proc.gpr(Gpr::Esp);
    engine.mem_set(esp.wrapping_sub(4), TaintValue::B4(engine.cpu.eip));
    if exec_flags.contains(ExecFlags::WINAPI_CALL) {
        return Ok(());
    }
    if let Some(target) = inst.arg(0) {
        if !target.is_constant() {
            let t = engine.get(target, proc);
            if let TaintValue::B4(v) = t {
                engine.cpu.eip = v;
            }
        }
    }
    Ok(())
}

pub fn handle_ret(engine: &mut TaintEngine, _inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let esp = proc.gpr(Gpr::Esp);
    if let TaintValue::B4(v) = engine.mem_get(esp, 32) {
        engine.cpu.eip = v;
    }
    Ok(())
}

/// `JMP rel` is a no-op (spec §4.4: "doesn't affect Eip" — the target is
/// statically known, so there's nothing to propagate). `JMP abs` writes
/// the resolved target's taint into Eip, unless the host has flagged this
/// jump as a known API entry (`WINAPI_JMP`), mirroring `JmpAbs_Handler`'s
/// `HasExecFlag` guard.
pub fn handle_jmp(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, exec_flags: ExecFlags) -> Result<()> {
    let target = match inst.arg(0) {
        Some(t) if !t.is_constant() => t,
        _ => return Ok(()),
    };
    if exec_flags.contains(ExecFlags::WINAPI_JMP) {
        return Ok(());
    }
    if let TaintValue::B4(v) = engine.get(target, proc) {
        engine.cpu.eip = v;
    }
    Ok(())
}

/// `Eip := Eip | flag_taint(tested)` (spec §4.4): the tested flag's taint
/// is OR'd into Eip, not assigned — a conditional branch's target is only
/// as uncertain as the flags it reads, on top of whatever uncertainty Eip
/// already carried getting here.
pub fn handle_cjmp(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let tested = if inst.mnemonic.starts_with("loop") || inst.mnemonic == "jecxz" {
        engine.get(&gpr_arg(Gpr::Ecx, 32), proc).shrink1()
    } else if let Some(cond) = map_condition(&inst.mnemonic) {
        cond.tested_taint(&engine.cpu)
    } else {
        Taint1::default()
    };
    if let TaintValue::B4(v) = TaintValue::extend_from(32, tested) {
        engine.cpu.eip = engine.cpu.eip | v;
    }
    Ok(())
}

pub fn handle_setcc(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let dst = arg0(inst)?;
    let tested = map_condition(&inst.mnemonic)
        .map(|c| c.tested_taint(&engine.cpu))
        .unwrap_or_default();
    engine.set(dst, TaintValue::extend_from(dst.size, tested), proc);
    Ok(())
}

pub fn handle_cmovcc(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let (dst, src) = (arg0(inst)?, arg1(inst)?);
    let cond = match map_condition(&inst.mnemonic) {
        Some(c) => c,
        None => return Ok(()),
    };
    let tested = cond.tested_taint(&engine.cpu);
    if tested.is_any_tainted() {
        let combined = engine
            .get(dst, proc)
            .or(&engine.get(src, proc))
            .or(&TaintValue::extend_from(dst.size, tested));
        engine.set(dst, combined, proc);
    } else if eval_condition(cond, proc.flags()) {
        let v = engine.get(src, proc);
        engine.set(dst, v, proc);
    }
    Ok(())
}

pub fn handle_sahf(engine: &mut TaintEngine, _inst: &Inst, _proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let ah = engine.cpu.gpr8(Gpr::Eax, true);
    for f in [Flag::Cf, Flag::Pf, Flag::Af, Flag::Zf, Flag::Sf] {
        engine.cpu.set_flag(f, Taint1::single(ah));
    }
    Ok(())
}

pub fn handle_cbw(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    match inst.mnemonic.as_str() {
        "cbw" => {
            let v = engine.get(&eax_arg(8), proc);
            engine.set(&eax_arg(16), sign_extend_conservative(v, 16), proc);
        }
        "cwde" => {
            let v = engine.get(&eax_arg(16), proc);
            engine.set(&eax_arg(32), sign_extend_conservative(v, 32), proc);
        }
        _ => {}
    }
    Ok(())
}

pub fn handle_cdq(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    match inst.mnemonic.as_str() {
        "cwd" => {
            let v = engine.get(&eax_arg(16), proc).shrink1();
            engine.set(&gpr_arg(Gpr::Edx, 16), TaintValue::extend_from(16, v), proc);
        }
        "cdq" => {
            let v = engine.get(&eax_arg(32), proc).shrink1();
            engine.set(&gpr_arg(Gpr::Edx, 32), TaintValue::extend_from(32, v), proc);
        }
        _ => {}
    }
    Ok(())
}

pub fn handle_cpuid(engine: &mut TaintEngine, _inst: &Inst, _proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    for reg in [Gpr::Eax, Gpr::Ebx, Gpr::Ecx, Gpr::Edx] {
        engine.cpu.set_gpr32(reg, Taint4::default());
    }
    Ok(())
}

/// `CMPXCHG`: approximated as an unconditional exchange (the comparison's
/// concrete outcome isn't modeled), matching the conservative-OR treatment
/// the rest of this module gives read-modify-write instructions.
pub fn handle_cmpxchg(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let (dst, src) = (arg0(inst)?, arg1(inst)?);
    let eax = eax_arg(dst.size);
    let dv = engine.get(dst, proc);
    let sv = engine.get(src, proc);
    let ev = engine.get(&eax, proc);
    engine.cpu.set_all_flags(dv.or(&ev).shrink1());
    engine.set(dst, sv, proc);
    engine.set(&eax, dv, proc);
    Ok(())
}

pub fn handle_xadd(engine: &mut TaintEngine, inst: &Inst, proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    let (dst, src) = (arg0(inst)?, arg1(inst)?);
    let dv = engine.get(dst, proc);
    let sv = engine.get(src, proc);
    let sum = dv.or(&sv);
    engine.set(src, dv, proc);
    engine.set(dst, sum, proc);
    engine.cpu.set_all_flags(sum.shrink1());
    Ok(())
}

pub fn handle_flag_const(engine: &mut TaintEngine, inst: &Inst, _proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    if matches!(inst.mnemonic.as_str(), "clc" | "stc") {
        engine.cpu.set_flag(Flag::Cf, Taint1::default());
    }
    Ok(())
}

pub fn handle_nop(_engine: &mut TaintEngine, _inst: &Inst, _proc: &dyn ProcessorView, _exec_flags: ExecFlags) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemorySection;
    use crate::taint::rules::TaintRules;
    use crate::taint::value::Taint16;

    struct FakeProc {
        regs: std::cell::RefCell<[u32; 8]>,
        flags: u32,
    }

    impl FakeProc {
        fn new() -> Self {
            FakeProc {
                regs: std::cell::RefCell::new([0; 8]),
                flags: 0,
            }
        }
    }

    impl ProcessorView for FakeProc {
        fn eip(&self) -> u32 {
            0
        }
        fn gpr(&self, reg: Gpr) -> u32 {
            self.regs.borrow()[reg as usize]
        }
        fn flags(&self) -> u32 {
            self.flags
        }
        fn section_containing(&self, _addr: u32) -> Option<MemorySection> {
            None
        }
        fn read_bytes(&self, _addr: u32, _len: usize) -> Vec<u8> {
            Vec::new()
        }
    }

    fn inst_with_args(mnemonic: &str, args: Vec<Option<ArgType>>) -> Inst {
        let mut i = Inst::invalid(0x1000);
        i.is_invalid = false;
        i.mnemonic = mnemonic.to_string();
        for (slot, a) in i.args.iter_mut().zip(args.into_iter().chain(std::iter::repeat(None))) {
            *slot = a;
        }
        i
    }

    fn reg32(reg: Gpr) -> ArgType {
        gpr_arg(reg, 32)
    }

    #[test]
    fn xor_self_clears_taint_even_if_tainted() {
        let mut engine = TaintEngine::new(TaintRules::empty());
        let t = engine.introduce_taint(0x1000).unwrap();
        engine.cpu.set_gpr32(Gpr::Eax, TaintN::<4>([t; 4]));
        let inst = inst_with_args("xor", vec![Some(reg32(Gpr::Eax)), Some(reg32(Gpr::Eax))]);
        handle_xor(&mut engine, &inst, &FakeProc::new(), ExecFlags::empty()).unwrap();
        assert!(!engine.cpu.gpr32(Gpr::Eax).is_any_tainted());
        assert!(!engine.cpu.flag(Flag::Zf).value().is_any_tainted());
    }

    #[test]
    fn default_binop_ors_operand_taint_into_flags() {
        let mut engine = TaintEngine::new(TaintRules::empty());
        let t = engine.introduce_taint(0x1000).unwrap();
        engine.cpu.set_gpr32(Gpr::Ebx, TaintN::<4>([t; 4]));
        let inst = inst_with_args("add", vec![Some(reg32(Gpr::Eax)), Some(reg32(Gpr::Ebx))]);
        handle_default_binop(&mut engine, &inst, &FakeProc::new(), ExecFlags::empty()).unwrap();
        assert_eq!(engine.cpu.gpr32(Gpr::Eax).0[0], t);
        assert_eq!(engine.cpu.flag(Flag::Zf).value(), t);
    }

    #[test]
    fn push_then_pop_round_trips_taint_through_memory() {
        let mut engine = TaintEngine::new(TaintRules::empty());
        let t = engine.introduce_taint(0x2000).unwrap();
        engine.cpu.set_gpr32(Gpr::Eax, TaintN::<4>([t; 4]));
        let proc = FakeProc::new();
        proc.regs.borrow_mut()[Gpr::Esp as usize] = 0x9000;

        let push = inst_with_args("push", vec![Some(reg32(Gpr::Eax))]);
        handle_push(&mut engine, &push, &proc, ExecFlags::empty()).unwrap();

        proc.regs.borrow_mut()[Gpr::Esp as usize] = 0x9000 - 4;
        let pop = inst_with_args("pop", vec![Some(reg32(Gpr::Ebx))]);
        handle_pop(&mut engine, &pop, &proc, ExecFlags::empty()).unwrap();

        assert_eq!(engine.cpu.gpr32(Gpr::Ebx).0[0], t);
    }

    #[test]
    fn movzx_byte_to_dword_zeroes_high_lanes() {
        let mut engine = TaintEngine::new(TaintRules::empty());
        let t = engine.introduce_taint(0x3000).unwrap();
        engine.cpu.set_gpr8(Gpr::Eax, false, t);
        let inst = inst_with_args(
            "movzx",
            vec![
                Some(reg32(Gpr::Ebx)),
                Some(ArgType {
                    kind: ArgKind::Gpr { reg: Gpr::Eax, high_byte: false },
                    size: 8,
                }),
            ],
        );
        handle_movzx(&mut engine, &inst, &FakeProc::new(), ExecFlags::empty()).unwrap();
        let lanes = engine.cpu.gpr32(Gpr::Ebx).0;
        assert_eq!(lanes[0], t);
        assert!(!lanes[1].is_any_tainted());
        assert!(!lanes[3].is_any_tainted());
    }

    #[test]
    fn movsx_replicates_top_lane_conservatively() {
        let mut engine = TaintEngine::new(TaintRules::empty());
        let t = engine.introduce_taint(0x3000).unwrap();
        engine.cpu.set_gpr8(Gpr::Eax, false, t);
        let inst = inst_with_args(
            "movsx",
            vec![
                Some(reg32(Gpr::Ebx)),
                Some(ArgType {
                    kind: ArgKind::Gpr { reg: Gpr::Eax, high_byte: false },
                    size: 8,
                }),
            ],
        );
        handle_movsx(&mut engine, &inst, &FakeProc::new(), ExecFlags::empty()).unwrap();
        let lanes = engine.cpu.gpr32(Gpr::Ebx).0;
        assert_eq!(lanes[0], t);
        assert_eq!(lanes[3], t);
    }

    #[test]
    fn bswap_reverses_lane_order() {
        let mut engine = TaintEngine::new(TaintRules::empty());
        let t0 = engine.introduce_taint(0x1).unwrap();
        let t1 = engine.introduce_taint(0x2).unwrap();
        engine.cpu.set_gpr32(Gpr::Eax, TaintN::<4>([t0, t1, Taint::new(), Taint::new()]));
        let inst = inst_with_args("bswap", vec![Some(reg32(Gpr::Eax))]);
        handle_bswap(&mut engine, &inst, &FakeProc::new(), ExecFlags::empty()).unwrap();
        let lanes = engine.cpu.gpr32(Gpr::Eax).0;
        assert_eq!(lanes[3], t0);
        assert_eq!(lanes[2], t1);
    }

    #[test]
    fn cmovcc_moves_when_condition_concretely_true_and_untainted() {
        let mut engine = TaintEngine::new(TaintRules::empty());
        let t = engine.introduce_taint(0x4000).unwrap();
        engine.cpu.set_gpr32(Gpr::Ebx, TaintN::<4>([t; 4]));
        let proc = FakeProc { regs: std::cell::RefCell::new([0; 8]), flags: 0x0040 };
        let inst = inst_with_args("cmove", vec![Some(reg32(Gpr::Eax)), Some(reg32(Gpr::Ebx))]);
        handle_cmovcc(&mut engine, &inst, &proc, ExecFlags::empty()).unwrap();
        assert_eq!(engine.cpu.gpr32(Gpr::Eax).0[0], t);
    }

    #[test]
    fn cmovcc_does_not_move_when_condition_false() {
        let mut engine = TaintEngine::new(TaintRules::empty());
        let t = engine.introduce_taint(0x4000).unwrap();
        engine.cpu.set_gpr32(Gpr::Ebx, TaintN::<4>([t; 4]));
        let proc = FakeProc { regs: std::cell::RefCell::new([0; 8]), flags: 0 };
        let inst = inst_with_args("cmove", vec![Some(reg32(Gpr::Eax)), Some(reg32(Gpr::Ebx))]);
        handle_cmovcc(&mut engine, &inst, &proc, ExecFlags::empty()).unwrap();
        assert!(!engine.cpu.gpr32(Gpr::Eax).is_any_tainted());
    }

    #[test]
    fn setcc_writes_tested_flag_taint() {
        let mut engine = TaintEngine::new(TaintRules::empty());
        let t = engine.introduce_taint(0x5000).unwrap();
        engine.cpu.set_flag(Flag::Zf, Taint1::single(t));
        let inst = inst_with_args(
            "sete",
            vec![Some(ArgType {
                kind: ArgKind::Gpr { reg: Gpr::Eax, high_byte: false },
                size: 8,
            })],
        );
        handle_setcc(&mut engine, &inst, &FakeProc::new(), ExecFlags::empty()).unwrap();
        assert_eq!(engine.cpu.gpr8(Gpr::Eax, false), t);
    }

    #[test]
    fn sahf_spreads_ah_taint_into_five_flags() {
        let mut engine = TaintEngine::new(TaintRules::empty());
        let t = engine.introduce_taint(0x6000).unwrap();
        engine.cpu.set_gpr8(Gpr::Eax, true, t);
        handle_sahf(&mut engine, &Inst::invalid(0), &FakeProc::new(), ExecFlags::empty()).unwrap();
        assert_eq!(engine.cpu.flag(Flag::Cf).value(), t);
        assert_eq!(engine.cpu.flag(Flag::Zf).value(), t);
        assert!(!engine.cpu.flag(Flag::Of).value().is_any_tainted());
    }

    #[test]
    fn xmm_move_preserves_128_bit_taint() {
        let mut engine = TaintEngine::new(TaintRules::empty());
        let t = engine.introduce_taint(0x7000).unwrap();
        engine.cpu.xmm[0] = TaintN::<16>([t; 16]);
        let inst = inst_with_args(
            "movaps",
            vec![
                Some(ArgType { kind: ArgKind::Xmm(1), size: 128 }),
                Some(ArgType { kind: ArgKind::Xmm(0), size: 128 }),
            ],
        );
        handle_mov(&mut engine, &inst, &FakeProc::new(), ExecFlags::empty()).unwrap();
        assert_eq!(engine.cpu.xmm[1].0[0], t);
    }
}
