//! `ProcessorTaint`: the taint bank mirroring the processor's register
//! file (spec §3). Ported from `Arietis/taint/taintengine.h`.

use super::value::{Taint, Taint1, Taint16, Taint4, Taint8, TaintN};

pub const GPR_COUNT: usize = 8;
pub const MM_COUNT: usize = 8;
pub const XMM_COUNT: usize = 8;

/// General-purpose register indices, x86-32 encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

pub const ALL_GPRS: [Gpr; GPR_COUNT] = [
    Gpr::Eax,
    Gpr::Ecx,
    Gpr::Edx,
    Gpr::Ebx,
    Gpr::Esp,
    Gpr::Ebp,
    Gpr::Esi,
    Gpr::Edi,
];

/// Flags tracked byte-granular, mirroring `InstContext::FLAG_COUNT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Flag {
    Cf = 0,
    Pf = 1,
    Af = 2,
    Zf = 3,
    Sf = 4,
    Of = 5,
}
pub const FLAG_COUNT: usize = 6;
pub const ALL_FLAGS: [Flag; FLAG_COUNT] = [Flag::Cf, Flag::Pf, Flag::Af, Flag::Zf, Flag::Sf, Flag::Of];

/// The full processor taint bank: 8 GPRs x4 bytes, 8 MMX x8 bytes, 8 XMM
/// x16 bytes, flags, EIP. `Clone`/`CopyFrom` are bitwise by construction
/// (derive(Clone) on plain arrays).
#[derive(Debug, Clone)]
pub struct ProcessorTaint {
    pub gpregs: [Taint4; GPR_COUNT],
    pub mm: [Taint8; MM_COUNT],
    pub xmm: [Taint16; XMM_COUNT],
    pub flags: [Taint1; FLAG_COUNT],
    pub eip: Taint4,
}

impl Default for ProcessorTaint {
    fn default() -> Self {
        ProcessorTaint {
            gpregs: [Taint4::default(); GPR_COUNT],
            mm: [Taint8::default(); MM_COUNT],
            xmm: [Taint16::default(); XMM_COUNT],
            flags: [Taint1::default(); FLAG_COUNT],
            eip: Taint4::default(),
        }
    }
}

impl ProcessorTaint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clone_deep(&self) -> Self {
        self.clone()
    }

    pub fn copy_from(&mut self, src: &Self) {
        *self = src.clone();
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn flag(&self, f: Flag) -> Taint1 {
        self.flags[f as usize]
    }

    pub fn set_flag(&mut self, f: Flag, t: Taint1) {
        self.flags[f as usize] = t;
    }

    /// Sets the standard arithmetic flags (CF, PF, AF, ZF, SF, OF) to the
    /// same value, e.g. after a binop (spec §4.4: "OR of all lanes of the
    /// operand taint, replicated to CF, PF, AF, ZF, SF, OF").
    pub fn set_all_flags(&mut self, t: Taint1) {
        for f in ALL_FLAGS {
            self.set_flag(f, t);
        }
    }

    /// Same as `set_all_flags` but leaves CF untouched (spec §4.4: INC/DEC
    /// "flags := Shrink(dst) minus CF").
    pub fn set_flags_except_cf(&mut self, t: Taint1) {
        for f in ALL_FLAGS {
            if f != Flag::Cf {
                self.set_flag(f, t);
            }
        }
    }

    /// `GetByte`-equivalent: the 8-bit sub-register taint, honoring
    /// AL/AH/BL/BH/... aliasing into the low two bytes of the owning GPR.
    pub fn gpr8(&self, reg: Gpr, high_byte: bool) -> Taint {
        let lanes = self.gpregs[reg as usize];
        lanes.0[if high_byte { 1 } else { 0 }]
    }

    pub fn set_gpr8(&mut self, reg: Gpr, high_byte: bool, t: Taint) {
        self.gpregs[reg as usize].0[if high_byte { 1 } else { 0 }] = t;
    }

    /// 16-bit sub-register (AX/BX/...): low two lanes of the GPR.
    pub fn gpr16(&self, reg: Gpr) -> super::value::Taint2 {
        super::value::from_taint(self.gpregs[reg as usize], 0)
    }

    pub fn set_gpr16(&mut self, reg: Gpr, t: super::value::Taint2) {
        self.gpregs[reg as usize] = super::value::to_taint(self.gpregs[reg as usize], t, 0);
    }

    pub fn gpr32(&self, reg: Gpr) -> Taint4 {
        self.gpregs[reg as usize]
    }

    pub fn set_gpr32(&mut self, reg: Gpr, t: Taint4) {
        self.gpregs[reg as usize] = t;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taint::value::shrink;

    #[test]
    fn clone_and_copy_from_are_independent() {
        let mut orig = ProcessorTaint::new();
        let mut t = Taint::new();
        t.set(1);
        orig.set_gpr32(Gpr::Eax, TaintN::<4>([t; 4]));

        let mut copy = ProcessorTaint::new();
        copy.copy_from(&orig);
        assert_eq!(shrink(copy.gpr32(Gpr::Eax)).value(), t);

        copy.set_gpr32(Gpr::Eax, Taint4::default());
        assert_eq!(shrink(orig.gpr32(Gpr::Eax)).value(), t);
        assert!(!shrink(copy.gpr32(Gpr::Eax)).value().is_any_tainted());
    }

    #[test]
    fn eight_bit_aliases_low_bytes_of_gpr32() {
        let mut cpu = ProcessorTaint::new();
        let mut al_t = Taint::new();
        al_t.set(0);
        let mut ah_t = Taint::new();
        ah_t.set(1);

        cpu.set_gpr8(Gpr::Eax, false, al_t);
        cpu.set_gpr8(Gpr::Eax, true, ah_t);

        assert_eq!(cpu.gpr8(Gpr::Eax, false), al_t);
        assert_eq!(cpu.gpr8(Gpr::Eax, true), ah_t);
        assert_eq!(cpu.gpr16(Gpr::Eax).0[0], al_t);
        assert_eq!(cpu.gpr16(Gpr::Eax).0[1], ah_t);
    }

    #[test]
    fn set_all_flags_vs_except_cf() {
        let mut cpu = ProcessorTaint::new();
        let mut t = Taint::new();
        t.set(3);
        cpu.set_all_flags(Taint1::single(t));
        for f in ALL_FLAGS {
            assert_eq!(cpu.flag(f).value(), t);
        }

        let mut cf = Taint::new();
        cf.set(9);
        cpu.set_flag(Flag::Cf, Taint1::single(cf));
        cpu.set_flags_except_cf(Taint1::default());
        assert_eq!(cpu.flag(Flag::Cf).value(), cf);
        assert!(!cpu.flag(Flag::Zf).value().is_any_tainted());
    }
}
