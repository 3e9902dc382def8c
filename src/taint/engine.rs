//! The taint engine proper: per-instruction taint propagation driven by a
//! dispatch table keyed on opcode, honoring `TaintRules` for
//! address-register taint. Ported from `taintengine.cpp::OnExecuteTrace`,
//! `DoTaint`, `TryGetMemRegion`.

use crate::disasm::inst::{ArgKind, ArgType, Inst};
use crate::error::TaintError;
use crate::host::ProcessorView;
use crate::taint::cputaint::{Gpr, ProcessorTaint};
use crate::taint::memtaint::MemoryTaint;
use crate::taint::rules::TaintRules;
use crate::taint::snapshot::TSnapshot;
use crate::taint::value::{extend, shrink, Taint, Taint1, Taint16, Taint2, Taint4, Taint8, TaintDesc, WIDTH};
use crate::trace::ExecFlags;

use anyhow::Result;

/// A taint value of one of the five lane widths the instruction set uses.
/// Exists because `TaintN<N>`'s `N` is a compile-time constant but operand
/// width is only known at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaintValue {
    B1(Taint1),
    B2(Taint2),
    B4(Taint4),
    B8(Taint8),
    B16(Taint16),
}

impl TaintValue {
    pub fn zero(size_bits: u32) -> Self {
        match size_bits {
            8 => TaintValue::B1(Taint1::default()),
            16 => TaintValue::B2(Taint2::default()),
            64 => TaintValue::B8(Taint8::default()),
            128 => TaintValue::B16(Taint16::default()),
            _ => TaintValue::B4(Taint4::default()),
        }
    }

    pub fn single(t: Taint) -> Self {
        TaintValue::B1(Taint1::single(t))
    }

    pub fn shrink1(&self) -> Taint1 {
        match *self {
            TaintValue::B1(v) => v,
            TaintValue::B2(v) => shrink(v),
            TaintValue::B4(v) => shrink(v),
            TaintValue::B8(v) => shrink(v),
            TaintValue::B16(v) => shrink(v),
        }
    }

    pub fn is_any_tainted(&self) -> bool {
        match self {
            TaintValue::B1(v) => v.is_any_tainted(),
            TaintValue::B2(v) => v.is_any_tainted(),
            TaintValue::B4(v) => v.is_any_tainted(),
            TaintValue::B8(v) => v.is_any_tainted(),
            TaintValue::B16(v) => v.is_any_tainted(),
        }
    }

    /// Lane-wise OR. Panics if the two values aren't the same width — the
    /// dispatch layer never ORs mismatched operand sizes.
    pub fn or(&self, other: &Self) -> Self {
        match (*self, *other) {
            (TaintValue::B1(a), TaintValue::B1(b)) => TaintValue::B1(a | b),
            (TaintValue::B2(a), TaintValue::B2(b)) => TaintValue::B2(a | b),
            (TaintValue::B4(a), TaintValue::B4(b)) => TaintValue::B4(a | b),
            (TaintValue::B8(a), TaintValue::B8(b)) => TaintValue::B8(a | b),
            (TaintValue::B16(a), TaintValue::B16(b)) => TaintValue::B16(a | b),
            _ => panic!("TaintValue::or on mismatched widths"),
        }
    }

    /// `Extend<N>`: replicate a single-lane taint to this value's width.
    pub fn extend_from(size_bits: u32, t: Taint1) -> Self {
        match size_bits {
            8 => TaintValue::B1(t),
            16 => TaintValue::B2(extend(t)),
            64 => TaintValue::B8(extend(t)),
            128 => TaintValue::B16(extend(t)),
            _ => TaintValue::B4(extend(t)),
        }
    }

    pub fn size_bits(&self) -> u32 {
        match self {
            TaintValue::B1(_) => 8,
            TaintValue::B2(_) => 16,
            TaintValue::B4(_) => 32,
            TaintValue::B8(_) => 64,
            TaintValue::B16(_) => 128,
        }
    }
}

impl std::ops::BitOr for TaintValue {
    type Output = TaintValue;
    fn bitor(self, rhs: TaintValue) -> TaintValue {
        self.or(&rhs)
    }
}

pub type HandlerFn = fn(&mut TaintEngine, &Inst, &dyn ProcessorView, ExecFlags) -> Result<()>;

/// The full taint state: CPU bank, memory store, and the `WIDTH`-slot
/// taint-source descriptor table.
pub struct TaintEngine {
    pub cpu: ProcessorTaint,
    pub mem: MemoryTaint,
    pub desc: [TaintDesc; WIDTH],
    pub count: usize,
    pub rules: TaintRules,
}

impl TaintEngine {
    pub fn new(rules: TaintRules) -> Self {
        TaintEngine {
            cpu: ProcessorTaint::new(),
            mem: MemoryTaint::new(),
            desc: [TaintDesc::default(); WIDTH],
            count: 0,
            rules,
        }
    }

    /// Allocates the next unused taint-source bit and attributes it to
    /// `source_addr`. Fails once all `WIDTH` sources are in use (spec §4.1:
    /// sources are never recycled).
    pub fn introduce_taint(&mut self, source_addr: u32) -> Result<Taint, TaintError> {
        if self.count >= WIDTH {
            return Err(TaintError::TooManyTaintSources { max: WIDTH });
        }
        let idx = self.count;
        self.desc[idx] = TaintDesc { source_addr };
        self.count += 1;
        let mut t = Taint::new();
        t.set(idx);
        Ok(t)
    }

    pub fn snapshot(&self) -> TSnapshot {
        TSnapshot::capture(self.count, &self.desc, &self.cpu, &self.mem)
    }

    pub fn restore(&mut self, snap: &TSnapshot) {
        self.count = snap.count;
        self.desc = snap.desc;
        self.cpu.copy_from(&snap.cpu);
        self.mem.copy_from(&snap.mem);
    }

    /// The taint sources described by the `len` bits of `taint` starting at
    /// `offset`, as concrete addresses. Mirrors `TryGetMemRegion`'s
    /// precondition: `offset + len` must not exceed the number of sources
    /// introduced so far.
    pub fn try_get_mem_region(&self, offset: usize, len: usize) -> Result<Vec<u32>, TaintError> {
        if offset + len > self.count {
            return Err(TaintError::RegionOutOfRange {
                offset,
                len,
                count: self.count,
            });
        }
        Ok((offset..offset + len).map(|i| self.desc[i].source_addr).collect())
    }

    fn effective_addr(&self, mem: &crate::disasm::inst::MemOperand, proc: &dyn ProcessorView) -> u32 {
        let mut addr = mem.displacement as u32;
        if let Some(base) = mem.base {
            addr = addr.wrapping_add(proc.gpr(base));
        }
        if let Some(index) = mem.index {
            addr = addr.wrapping_add(proc.gpr(index).wrapping_mul(mem.scale.max(1) as u32));
        }
        addr
    }

    /// `GetTaintAddressingReg`: OR of the taint carried by the base/index
    /// registers used in a memory operand's addressing, gated on
    /// `TaintRules::LOADADDRREG`/`SAVEADDRREG`.
    fn addressing_taint(&self, mem: &crate::disasm::inst::MemOperand) -> Taint1 {
        let mut acc = Taint::new();
        if let Some(base) = mem.base {
            acc |= shrink(self.cpu.gpr32(base)).value();
        }
        if let Some(index) = mem.index {
            acc |= shrink(self.cpu.gpr32(index)).value();
        }
        Taint1::single(acc)
    }

    fn gpr_value(&self, reg: Gpr, high_byte: bool, size: u32) -> TaintValue {
        match size {
            8 => TaintValue::single(self.cpu.gpr8(reg, high_byte)),
            16 => TaintValue::B2(self.cpu.gpr16(reg)),
            _ => TaintValue::B4(self.cpu.gpr32(reg)),
        }
    }

    fn set_gpr_value(&mut self, reg: Gpr, high_byte: bool, val: TaintValue) {
        match val {
            TaintValue::B1(v) => self.cpu.set_gpr8(reg, high_byte, v.value()),
            TaintValue::B2(v) => self.cpu.set_gpr16(reg, v),
            TaintValue::B4(v) => self.cpu.set_gpr32(reg, v),
            _ => {}
        }
    }

    /// `GetTaint<N>`: reads the taint of an operand, whatever its kind.
    pub fn get(&self, arg: &ArgType, proc: &dyn ProcessorView) -> TaintValue {
        match &arg.kind {
            ArgKind::Gpr { reg, high_byte } => self.gpr_value(*reg, *high_byte, arg.size),
            ArgKind::Mm(i) => TaintValue::B8(self.cpu.mm[*i]),
            ArgKind::Xmm(i) => TaintValue::B16(self.cpu.xmm[*i]),
            ArgKind::Eip => TaintValue::B4(self.cpu.eip),
            ArgKind::Flags => {
                let mut acc = Taint::new();
                for f in crate::taint::cputaint::ALL_FLAGS {
                    acc |= self.cpu.flag(f).value();
                }
                TaintValue::single(acc)
            }
            ArgKind::Memory(mem) => {
                let addr = self.effective_addr(mem, proc);
                let mut val = match arg.size {
                    8 => TaintValue::B1(self.mem.get::<1>(addr)),
                    16 => TaintValue::B2(self.mem.get::<2>(addr)),
                    64 => TaintValue::B8(self.mem.get::<8>(addr)),
                    128 => TaintValue::B16(self.mem.get::<16>(addr)),
                    _ => TaintValue::B4(self.mem.get::<4>(addr)),
                };
                if self.rules.contains(TaintRules::LOADADDRREG) {
                    let addr_taint = self.addressing_taint(mem);
                    val = val.or(&TaintValue::extend_from(arg.size, addr_taint));
                }
                val
            }
            ArgKind::Immediate(_) => TaintValue::zero(arg.size),
        }
    }

    /// `SetTaint<N>`: writes the taint of an operand. Writing to an
    /// immediate is a dispatch-layer bug (immediates aren't assignable),
    /// so it's silently ignored rather than erroring.
    pub fn set(&mut self, arg: &ArgType, val: TaintValue, proc: &dyn ProcessorView) {
        match &arg.kind {
            ArgKind::Gpr { reg, high_byte } => self.set_gpr_value(*reg, *high_byte, val),
            ArgKind::Mm(i) => {
                if let TaintValue::B8(v) = val {
                    self.cpu.mm[*i] = v;
                }
            }
            ArgKind::Xmm(i) => {
                if let TaintValue::B16(v) = val {
                    self.cpu.xmm[*i] = v;
                }
            }
            ArgKind::Eip => {
                if let TaintValue::B4(v) = val {
                    self.cpu.eip = v;
                }
            }
            ArgKind::Flags => self.cpu.set_all_flags(val.shrink1()),
            ArgKind::Memory(mem) => {
                let addr = self.effective_addr(mem, proc);
                let mut val = val;
                if self.rules.contains(TaintRules::SAVEADDRREG) {
                    let addr_taint = self.addressing_taint(mem);
                    val = val.or(&TaintValue::extend_from(arg.size, addr_taint));
                }
                match val {
                    TaintValue::B1(v) => self.mem.set::<1>(addr, v),
                    TaintValue::B2(v) => self.mem.set::<2>(addr, v),
                    TaintValue::B4(v) => self.mem.set::<4>(addr, v),
                    TaintValue::B8(v) => self.mem.set::<8>(addr, v),
                    TaintValue::B16(v) => self.mem.set::<16>(addr, v),
                }
            }
            ArgKind::Immediate(_) => {}
        }
    }

    /// Raw memory taint read, independent of any `ArgType` — used by the
    /// string-instruction handlers, which address through ESI/EDI rather
    /// than a decoded memory operand.
    pub fn mem_get(&self, addr: u32, size_bits: u32) -> TaintValue {
        match size_bits {
            8 => TaintValue::B1(self.mem.get::<1>(addr)),
            16 => TaintValue::B2(self.mem.get::<2>(addr)),
            64 => TaintValue::B8(self.mem.get::<8>(addr)),
            128 => TaintValue::B16(self.mem.get::<16>(addr)),
            _ => TaintValue::B4(self.mem.get::<4>(addr)),
        }
    }

    pub fn mem_set(&mut self, addr: u32, val: TaintValue) {
        match val {
            TaintValue::B1(v) => self.mem.set::<1>(addr, v),
            TaintValue::B2(v) => self.mem.set::<2>(addr, v),
            TaintValue::B4(v) => self.mem.set::<4>(addr, v),
            TaintValue::B8(v) => self.mem.set::<8>(addr, v),
            TaintValue::B16(v) => self.mem.set::<16>(addr, v),
        }
    }

    /// Top-level entry point: dispatches `inst` to its propagation handler.
    /// Unhandled opcodes are a no-op (spec §4.4: "unmodeled instructions
    /// leave taint state unchanged"). `exec_flags` is the TContext exec-flag
    /// bitset (`WINAPI_CALL`/`WINAPI_JMP`/…) the caller has already
    /// determined for this step, passed through so handlers like CALL/JMP
    /// abs can honor the spec's "unless WINAPI_*" veto.
    pub fn on_execute_trace(&mut self, inst: &Inst, proc: &dyn ProcessorView, exec_flags: ExecFlags) -> Result<()> {
        if let Some(handler) = dispatch(inst) {
            handler(self, inst, proc, exec_flags)?;
        }
        Ok(())
    }
}

/// Opcode-keyed dispatch. Implemented as a match over mnemonic rather than
/// a literal `[Option<HandlerFn>; 256]` array, since `Inst::mnemonic` is
/// already the disambiguated, decoder-independent name; the compiler lowers
/// this to the same jump-table shape the original's per-opcode array gave.
fn dispatch(inst: &Inst) -> Option<HandlerFn> {
    use crate::taint::propagate as p;

    if inst.is_invalid {
        return None;
    }

    Some(match inst.mnemonic.as_str() {
        "mov" | "movd" | "movq" | "movaps" | "movups" | "movdqa" | "movdqu" => p::handle_mov,
        "lea" => p::handle_lea,
        "push" => p::handle_push,
        "pop" => p::handle_pop,
        "xchg" => p::handle_xchg,
        "xor" | "pxor" => p::handle_xor,
        "or" | "and" | "add" | "sub" | "por" | "pand" | "paddb" | "paddw" | "paddd" | "paddq" => {
            p::handle_default_binop
        }
        "adc" => p::handle_adc,
        "sbb" => p::handle_sbb,
        "cmp" | "test" => p::handle_cmp_test,
        "cmpsb" | "cmpsw" | "cmpsd" | "cmpsq" => p::handle_cmps,
        "inc" | "dec" => p::handle_inc_dec,
        "movsb" | "movsw" | "movsq" => p::handle_movs,
        "stosb" | "stosw" | "stosd" | "stosq" => p::handle_stos,
        "lodsb" | "lodsw" | "lodsd" | "lodsq" => p::handle_lods,
        "scasb" | "scasw" | "scasd" | "scasq" => p::handle_scas,
        "movzx" => p::handle_movzx,
        "movsx" | "movsxd" => p::handle_movsx,
        "bswap" => p::handle_bswap,
        "imul" => p::handle_imul,
        "mul" => p::handle_mul,
        "div" => p::handle_div,
        "idiv" => p::handle_idiv,
        "shl" | "sal" | "shr" | "sar" | "rol" | "ror" | "rcl" | "rcr" => p::handle_shift_rotate,
        "shld" => p::handle_shld,
        "shrd" => p::handle_shrd,
        "call" => p::handle_call,
        "ret" | "retf" => p::handle_ret,
        "jmp" => p::handle_jmp,
        m if m.starts_with('j') && m != "jmp" => p::handle_cjmp,
        "loop" | "loope" | "loopne" => p::handle_cjmp,
        m if m.starts_with("set") => p::handle_setcc,
        m if m.starts_with("cmov") => p::handle_cmovcc,
        "sahf" => p::handle_sahf,
        "cbw" | "cwde" | "cdqe" => p::handle_cbw,
        "cwd" | "cdq" | "cqo" => p::handle_cdq,
        "cpuid" => p::handle_cpuid,
        "cmpxchg" => p::handle_cmpxchg,
        "xadd" => p::handle_xadd,
        "clc" | "stc" | "cld" | "std" => p::handle_flag_const,
        "nop" => p::handle_nop,
        _ => return None,
    })
}
