//! In-order response delivery under out-of-order completion.
//!
//! Handlers run concurrently and may finish in any order, but the wire
//! contract is strict: responses leave the socket in the exact order their
//! requests arrived. Each admitted request reserves the next arrival
//! sequence number; completed responses are buffered until every earlier
//! sequence number has been flushed.
//!
//! A response that never completes stalls everything behind it. That is the
//! deliberate ordering/backpressure trade-off; bounding it is the handler
//! boundary's job, not this buffer's.

use std::collections::BTreeMap;

use bytes::BytesMut;

/// Per-connection response re-ordering buffer.
#[derive(Default)]
pub struct ResponseSequencer {
    /// Next sequence number to hand out at admission.
    next_seq: u64,
    /// Sequence number of the next response to flush.
    next_flush: u64,
    /// Completed responses waiting for their turn, keyed by sequence.
    completed: BTreeMap<u64, BytesMut>,
}

impl ResponseSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the arrival slot for a newly admitted request.
    pub fn reserve(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Record a completed response for a previously reserved slot.
    pub fn complete(&mut self, seq: u64, response: BytesMut) {
        debug_assert!(seq < self.next_seq, "completion for unreserved slot {}", seq);
        debug_assert!(seq >= self.next_flush, "completion for flushed slot {}", seq);
        let previous = self.completed.insert(seq, response);
        debug_assert!(previous.is_none(), "duplicate completion for slot {}", seq);
    }

    /// Take the next flushable response, if the response at the flush cursor
    /// has completed. Call repeatedly: one completion can unblock several
    /// buffered successors.
    pub fn pop_ready(&mut self) -> Option<BytesMut> {
        let response = self.completed.remove(&self.next_flush)?;
        self.next_flush += 1;
        Some(response)
    }

    /// Slots reserved but not yet flushed.
    pub fn outstanding(&self) -> u64 {
        self.next_seq - self.next_flush
    }
}
