//! Byte-lane taint propagation over x86-32 instructions (spec §4.1, §4.4).

pub mod cputaint;
pub mod engine;
pub mod flagtest;
pub mod memtaint;
pub mod propagate;
pub mod rules;
pub mod snapshot;
pub mod value;

pub use cputaint::{Flag, Gpr, ProcessorTaint};
pub use engine::{TaintEngine, TaintValue};
pub use memtaint::MemoryTaint;
pub use rules::TaintRules;
pub use snapshot::TSnapshot;
pub use value::{Taint, TaintDesc, TaintRegion, WIDTH};
