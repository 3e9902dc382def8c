//! `TSnapshot`: an immutable capture of taint-engine state, taken before
//! an analyzed sub-procedure and restored afterwards so the procedure's
//! own taint effects don't leak into the surrounding trace. Ported from
//! `taintengine.cpp::TSnapshot`/`ApplySnapshot`.

use super::cputaint::ProcessorTaint;
use super::memtaint::MemoryTaint;
use super::value::{TaintDesc, WIDTH};

#[derive(Clone)]
pub struct TSnapshot {
    pub count: usize,
    pub desc: [TaintDesc; WIDTH],
    pub cpu: ProcessorTaint,
    pub mem: MemoryTaint,
}

impl TSnapshot {
    pub fn capture(count: usize, desc: &[TaintDesc; WIDTH], cpu: &ProcessorTaint, mem: &MemoryTaint) -> Self {
        TSnapshot {
            count,
            desc: *desc,
            cpu: cpu.clone_deep(),
            mem: mem.clone_deep(),
        }
    }
}
