//! `MessageAccessLog`: observes execution trace records and logs every
//! byte-level read of a tracked `Message`, keyed by the call stack active
//! at the time (spec §4.7). Ported from
//! `Prophet/protocol/analyzers/msgaccess.cpp`.

use super::message::Message;
use crate::trace::TContext;

/// One logged read of a `Message` byte: which offset, the `TContext`
/// sequence number it happened in, and the procedure-entry call stack
/// active at the time (innermost last, matching `ctx->CallStack`'s order
/// implied by `GetProcStackHash`/`CallStack[0]->Entry()` walking
/// outermost-first in the original's dump).
#[derive(Debug, Clone)]
pub struct MessageAccess {
    pub offset: usize,
    pub seq: u64,
    pub call_stack: Vec<u32>,
}

/// Hashes a call stack so adjacent accesses from the same call path can be
/// compared cheaply, mirroring `StackHashComparator`.
pub struct StackHashComparator;

impl StackHashComparator {
    pub fn hash(&self, call_stack: &[u32]) -> u32 {
        call_stack.iter().fold(0u32, |acc, &entry| acc.rotate_left(5) ^ entry)
    }

    pub fn equals(&self, a: &MessageAccess, b: &MessageAccess) -> bool {
        self.hash(&a.call_stack) == self.hash(&b.call_stack)
    }
}

/// An ordered list of accesses to a given `Message`, built by observing
/// `ExecuteTrace` events as they happen.
pub struct MessageAccessLog<'a> {
    message: &'a Message,
    accesses: Vec<MessageAccess>,
}

impl<'a> MessageAccessLog<'a> {
    pub fn new(message: &'a Message) -> Self {
        MessageAccessLog {
            message,
            accesses: Vec::new(),
        }
    }

    pub fn accesses(&self) -> &[MessageAccess] {
        &self.accesses
    }

    /// Observes one `TContext`: if its `Mr` overlaps the tracked message,
    /// logs one `MessageAccess` per covered byte whose value matches the
    /// message's recorded content at that offset.
    pub fn on_execute_trace(&mut self, ctx: &TContext, call_stack: &[u32]) {
        if !ctx.mr.is_present() {
            return;
        }

        let data = ctx.mr.val.to_le_bytes();
        for i in 0..ctx.mr.len as u32 {
            self.on_mem_read(ctx.seq, ctx.mr.addr + i, data[i as usize], call_stack);
        }
    }

    fn on_mem_read(&mut self, seq: u64, addr: u32, data: u8, call_stack: &[u32]) {
        let offset = match self.message.offset_of(addr) {
            Some(o) => o,
            None => return,
        };

        if data != self.message.get(offset) {
            return;
        }

        self.accesses.push(MessageAccess {
            offset,
            seq,
            call_stack: call_stack.to_vec(),
        });
    }

    /// Heuristic repair for operand-reversal in adjacent byte reads: swaps
    /// adjacent accesses `(i, i+1)` whose offsets appear in descending
    /// order by exactly one and whose call stacks hash equal, since such
    /// pairs are almost always two halves of the same multi-byte read
    /// issued in reverse.
    pub fn on_complete(&mut self) {
        let cmp = StackHashComparator;
        let mut i = 0;
        while i + 1 < self.accesses.len() {
            if self.accesses[i].offset == self.accesses[i + 1].offset + 1
                && cmp.equals(&self.accesses[i], &self.accesses[i + 1])
            {
                self.accesses.swap(i, i + 1);
            }
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{ExecFlags, MemAccess};

    fn ctx(seq: u64, mr: MemAccess) -> TContext {
        TContext {
            seq,
            eip: 0,
            gprs: [0; 8],
            flags: 0,
            mr,
            mw: MemAccess::NONE,
            exec_flags: ExecFlags::empty(),
            proc_entry: 0,
        }
    }

    #[test]
    fn logs_one_access_per_matching_byte() {
        let msg = Message::new(0x4000, b"GET".to_vec());
        let mut log = MessageAccessLog::new(&msg);

        let mr = MemAccess { addr: 0x4000, len: 3, val: u32::from_le_bytes([b'G', b'E', b'T', 0]) };
        log.on_execute_trace(&ctx(1, mr), &[0x1000]);

        assert_eq!(log.accesses().len(), 3);
        assert_eq!(log.accesses()[0].offset, 0);
        assert_eq!(log.accesses()[2].offset, 2);
    }

    #[test]
    fn mismatched_byte_value_is_not_logged() {
        let msg = Message::new(0x4000, b"GET".to_vec());
        let mut log = MessageAccessLog::new(&msg);

        let mr = MemAccess { addr: 0x4000, len: 1, val: b'X' as u32 };
        log.on_execute_trace(&ctx(1, mr), &[]);

        assert!(log.accesses().is_empty());
    }

    #[test]
    fn reads_outside_message_range_are_ignored() {
        let msg = Message::new(0x4000, b"GET".to_vec());
        let mut log = MessageAccessLog::new(&msg);

        let mr = MemAccess { addr: 0x9999, len: 1, val: 0 };
        log.on_execute_trace(&ctx(1, mr), &[]);

        assert!(log.accesses().is_empty());
    }

    #[test]
    fn adjacent_reverse_order_pair_with_matching_stack_is_swapped() {
        let msg = Message::new(0, vec![0, 0]);
        let mut log = MessageAccessLog::new(&msg);
        log.accesses.push(MessageAccess { offset: 1, seq: 0, call_stack: vec![0x1000] });
        log.accesses.push(MessageAccess { offset: 0, seq: 1, call_stack: vec![0x1000] });

        log.on_complete();

        assert_eq!(log.accesses()[0].offset, 0);
        assert_eq!(log.accesses()[1].offset, 1);
    }

    #[test]
    fn adjacent_reverse_order_pair_with_different_stack_is_left_alone() {
        let msg = Message::new(0, vec![0, 0]);
        let mut log = MessageAccessLog::new(&msg);
        log.accesses.push(MessageAccess { offset: 1, seq: 0, call_stack: vec![0x1000] });
        log.accesses.push(MessageAccess { offset: 0, seq: 1, call_stack: vec![0x2000] });

        log.on_complete();

        assert_eq!(log.accesses()[0].offset, 1);
        assert_eq!(log.accesses()[1].offset, 0);
    }
}
