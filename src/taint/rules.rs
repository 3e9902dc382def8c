//! Configurable taint rules, gating the base/index-register mix-in
//! behavior described in spec §4.4 ("optionally OR-ing ... if the rule
//! `TAINT_LOADADDRREG`/`TAINT_SAVEADDRREG` is enabled"). Grounded on
//! `taintengine.cpp`'s `m_taintRule` and `GetTaintAddressingReg`, which the
//! distilled spec describes but the original source gates on a bitmask
//! read from config (SPEC_FULL.md supplement).

use bitflags::bitflags;

bitflags! {
    pub struct TaintRules: u32 {
        /// Mix the taint of a memory operand's base/index registers into
        /// the taint returned by a load.
        const LOADADDRREG = 0b0000_0001;
        /// Mix the taint of a memory operand's base/index registers into
        /// the taint written by a store.
        const SAVEADDRREG = 0b0000_0010;
    }
}

impl Default for TaintRules {
    fn default() -> Self {
        TaintRules::empty()
    }
}
