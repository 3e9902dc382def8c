//! Trace buffer: a bounded history of per-step execution records and the
//! queries analyzers run against it (spec §4.5). Grounded on
//! `Prophet/protocol/runtrace.h`; register-file shape mirrors
//! `ptrace_host::RegisterFile`'s narrowing discipline without depending on
//! it — the trace buffer is host-agnostic, fed by whatever `ProcessorView`
//! the engine is driving.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::ArchiveError;

bitflags! {
    /// Per-step execution flags, set by the engine as it interprets a
    /// `call`/`jmp` against the API info table (spec §4.2's `WINAPI_CALL`
    /// skip behavior).
    #[derive(Default, Serialize, Deserialize)]
    pub struct ExecFlags: u32 {
        const WINAPI_CALL = 0b0000_0001;
        const WINAPI_JMP = 0b0000_0010;
        const PROC_ENTRY = 0b0000_0100;
        const PROC_EXIT = 0b0000_1000;
    }
}

/// A single logged memory access (`Mr`/`Mw` in the spec's notation).
/// `len` is always one of `{0, 1, 2, 4}`; `len == 0` means "no access".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemAccess {
    pub addr: u32,
    pub len: u8,
    pub val: u32,
}

impl MemAccess {
    pub const NONE: MemAccess = MemAccess { addr: 0, len: 0, val: 0 };

    pub fn is_present(&self) -> bool {
        self.len != 0
    }

    pub fn covers(&self, addr: u32) -> bool {
        self.is_present() && addr >= self.addr && addr < self.addr + self.len as u32
    }
}

/// One step of execution trace: the smallest unit the analyzers consume
/// (spec §4.5, glossary). `gprs` is fixed at 8 entries, x86-32-register
/// order (`Gpr` discriminant order in `taint::cputaint`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TContext {
    pub seq: u64,
    pub eip: u32,
    pub gprs: [u32; 8],
    pub flags: u32,
    pub mr: MemAccess,
    pub mw: MemAccess,
    pub exec_flags: ExecFlags,
    pub proc_entry: u32,
}

impl TContext {
    pub fn gpr_equals(&self, val: u32) -> bool {
        self.gprs.iter().any(|&g| g == val)
    }

    /// True if this record and `other` differ only in that one is a
    /// `call`/`jmp` stepping stone to the other — the shape `mergeCallJmp`
    /// collapses.
    fn is_call_jmp_artifact_of(&self, other: &TContext) -> bool {
        self.mr == other.mr
            && self.mw == other.mw
            && (self.exec_flags.intersects(ExecFlags::WINAPI_CALL | ExecFlags::WINAPI_JMP)
                || other.exec_flags.intersects(ExecFlags::WINAPI_CALL | ExecFlags::WINAPI_JMP))
    }
}

/// Bounded array of `TContext`, guarded by a single mutex per spec §5's
/// "RunTrace holds one mutex" discipline.
pub struct RunTrace {
    records: std::sync::Mutex<Vec<TContext>>,
    max_traces: usize,
    merge_call_jmp: bool,
    next_seq: std::sync::atomic::AtomicU64,
}

impl RunTrace {
    pub fn new(max_traces: usize, merge_call_jmp: bool) -> Self {
        RunTrace {
            records: std::sync::Mutex::new(Vec::with_capacity(max_traces.min(1024))),
            max_traces,
            merge_call_jmp,
            next_seq: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Clears the buffer and resets the sequence counter.
    pub fn begin(&self) {
        self.records.lock().unwrap().clear();
        self.next_seq.store(0, std::sync::atomic::Ordering::SeqCst);
    }

    /// No-op bookend matching the original's `Begin`/`Trace`/`End` triad;
    /// kept so callers mirror that lifecycle even though this
    /// implementation has nothing left to flush.
    pub fn end(&self) {}

    pub fn count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn max_traces(&self) -> usize {
        self.max_traces
    }

    /// Appends a `TContext` built from the current processor state plus
    /// any `Mr`/`Mw` logged since the previous call. Once `count ==
    /// max_traces` the oldest record is evicted (ring-buffer discipline);
    /// sequence numbers are never reused.
    pub fn trace(
        &self,
        eip: u32,
        gprs: [u32; 8],
        flags: u32,
        mr: MemAccess,
        mw: MemAccess,
        exec_flags: ExecFlags,
        proc_entry: u32,
    ) -> u64 {
        let seq = self.next_seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let record = TContext {
            seq,
            eip,
            gprs,
            flags,
            mr,
            mw,
            exec_flags,
            proc_entry,
        };

        let mut records = self.records.lock().unwrap();

        if self.merge_call_jmp {
            if let Some(last) = records.last() {
                if record.is_call_jmp_artifact_of(last) {
                    records.pop();
                }
            }
        }

        if records.len() >= self.max_traces {
            records.remove(0);
        }
        records.push(record);

        seq
    }

    /// Last index `i <= before_idx` where `Mr` covers `addr`.
    pub fn find_most_recent_mr_addr(&self, addr: u32, before_idx: usize) -> Option<usize> {
        let records = self.records.lock().unwrap();
        records[..=before_idx.min(records.len().saturating_sub(1))]
            .iter()
            .enumerate()
            .rev()
            .find(|(_, r)| r.mr.covers(addr))
            .map(|(i, _)| i)
    }

    /// Symmetric `Mw` query.
    pub fn find_most_recent_mw_addr(&self, addr: u32, before_idx: usize) -> Option<usize> {
        let records = self.records.lock().unwrap();
        records[..=before_idx.min(records.len().saturating_sub(1))]
            .iter()
            .enumerate()
            .rev()
            .find(|(_, r)| r.mw.covers(addr))
            .map(|(i, _)| i)
    }

    /// Lowest index where any of the 8 GPRs equals `val`.
    pub fn find_first_reg(&self, val: u32) -> Option<usize> {
        let records = self.records.lock().unwrap();
        records.iter().position(|r| r.gpr_equals(val))
    }

    /// Returns a snapshot clone of the record at `idx`, if present.
    pub fn get(&self, idx: usize) -> Option<TContext> {
        self.records.lock().unwrap().get(idx).cloned()
    }

    pub fn snapshot(&self) -> Vec<TContext> {
        self.records.lock().unwrap().clone()
    }

    /// Streams each retained record as one JSON line, for piping large
    /// traces without holding the whole serialized form in memory.
    pub fn dump_jsonl<W: std::io::Write>(&self, mut w: W) -> Result<(), ArchiveError> {
        for record in self.records.lock().unwrap().iter() {
            serde_json::to_writer(&mut w, record).map_err(|source| ArchiveError::Serde {
                component: "RunTrace",
                source,
            })?;
            writeln!(w).map_err(|source| ArchiveError::Write {
                path: "<jsonl stream>".to_string(),
                source,
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RunTraceContract {
    count: usize,
    max_traces: usize,
    merge_call_jmp: bool,
    records: Vec<TContext>,
}

impl crate::archive::Archivable for RunTrace {
    fn to_json(&self) -> serde_json::Value {
        let records = self.records.lock().unwrap();
        serde_json::to_value(RunTraceContract {
            count: records.len(),
            max_traces: self.max_traces,
            merge_call_jmp: self.merge_call_jmp,
            records: records.clone(),
        })
        .expect("RunTrace contract is always serializable")
    }

    fn from_json(value: serde_json::Value) -> Result<Self, ArchiveError> {
        let contract: RunTraceContract =
            serde_json::from_value(value).map_err(|source| ArchiveError::Serde {
                component: "RunTrace",
                source,
            })?;

        let trace = RunTrace::new(contract.max_traces, contract.merge_call_jmp);
        let next_seq = contract.records.last().map(|r| r.seq + 1).unwrap_or(0);
        *trace.records.lock().unwrap() = contract.records;
        trace.next_seq.store(next_seq, std::sync::atomic::Ordering::SeqCst);
        Ok(trace)
    }
}
