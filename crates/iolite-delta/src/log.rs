//! Sequence-numbered delta log.
//!
//! The log allocates the session's gap-free delta sequence and retains
//! sent-but-unacknowledged deltas so a reconnecting client can be caught
//! up by replay instead of a full snapshot. Capacity is bounded: when the
//! retention window no longer covers a client's last-seen sequence number,
//! the caller must fall back to a snapshot resync.

use crate::wire::{DeltaMsg, Seq};
use iolite_state::FlushSet;
use std::collections::VecDeque;

/// Default number of unacked deltas retained for replay.
pub const DEFAULT_LOG_CAP: usize = 256;

/// Per-session outgoing delta log.
#[derive(Clone, Debug)]
pub struct DeltaLog {
    session_token: String,
    /// Last allocated sequence number (0 = nothing but the snapshot).
    head: Seq,
    /// Highest sequence number the client has acknowledged.
    acked: Seq,
    /// Retained deltas awaiting acknowledgment, oldest first.
    retained: VecDeque<DeltaMsg>,
    cap: usize,
}

impl DeltaLog {
    pub fn new(session_token: impl Into<String>) -> Self {
        Self::with_capacity(session_token, DEFAULT_LOG_CAP)
    }

    pub fn with_capacity(session_token: impl Into<String>, cap: usize) -> Self {
        Self {
            session_token: session_token.into(),
            head: 0,
            acked: 0,
            retained: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    /// Last allocated sequence number.
    pub fn head(&self) -> Seq {
        self.head
    }

    pub fn acked(&self) -> Seq {
        self.acked
    }

    pub fn len(&self) -> usize {
        self.retained.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retained.is_empty()
    }

    /// Allocate the next sequence number and retain the delta built from a
    /// flush. Returns `None` for an empty flush (nothing changed, no
    /// sequence number is burned).
    pub fn append(&mut self, flush: FlushSet) -> Option<DeltaMsg> {
        if flush.is_empty() {
            return None;
        }
        let seq = self.head + 1;
        let delta = crate::encoder::encode_flush(&self.session_token, seq, flush);
        self.head = seq;
        self.retained.push_back(delta.clone());
        if self.retained.len() > self.cap {
            self.retained.pop_front();
        }
        Some(delta)
    }

    /// Record that the session's current state was snapshotted at `seq`;
    /// everything at or before it no longer needs retention.
    pub fn rebase(&mut self, seq: Seq) {
        self.head = self.head.max(seq);
        self.ack(seq);
    }

    /// Acknowledge receipt up to `seq`, pruning retained deltas.
    pub fn ack(&mut self, seq: Seq) {
        if seq > self.acked {
            self.acked = seq.min(self.head);
        }
        self.retained.retain(|d| d.seq > self.acked);
    }

    /// Whether replay can resume a client that last saw `seq`: either
    /// nothing newer exists, or every delta after `seq` is still retained.
    pub fn covers(&self, seq: Seq) -> bool {
        if seq >= self.head {
            return seq == self.head;
        }
        self.retained
            .front()
            .map(|oldest| oldest.seq <= seq + 1)
            .unwrap_or(false)
    }

    /// Retained deltas after `seq`, in order, for reconnect replay.
    pub fn since(&self, seq: Seq) -> Vec<DeltaMsg> {
        self.retained
            .iter()
            .filter(|d| d.seq > seq)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iolite_state::{NodePath, Value};

    fn flush_with(field: &str, value: i64) -> FlushSet {
        vec![(
            NodePath::root(),
            vec![(field.to_string(), Value::Int(value))],
        )]
    }

    #[test]
    fn test_sequences_are_gap_free() {
        let mut log = DeltaLog::new("tok");
        for i in 1..=5 {
            let delta = log.append(flush_with("count", i)).unwrap();
            assert_eq!(delta.seq, i as u64);
        }
        assert_eq!(log.head(), 5);
    }

    #[test]
    fn test_empty_flush_burns_no_seq() {
        let mut log = DeltaLog::new("tok");
        assert!(log.append(Vec::new()).is_none());
        assert_eq!(log.head(), 0);
    }

    #[test]
    fn test_replay_since() {
        let mut log = DeltaLog::new("tok");
        for i in 1..=4 {
            log.append(flush_with("count", i)).unwrap();
        }
        let replay = log.since(2);
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].seq, 3);
        assert_eq!(replay[1].seq, 4);
    }

    #[test]
    fn test_ack_prunes() {
        let mut log = DeltaLog::new("tok");
        for i in 1..=4 {
            log.append(flush_with("count", i)).unwrap();
        }
        log.ack(3);
        assert_eq!(log.len(), 1);
        assert_eq!(log.acked(), 3);

        // Acks never regress.
        log.ack(1);
        assert_eq!(log.acked(), 3);
    }

    #[test]
    fn test_coverage_window() {
        let mut log = DeltaLog::with_capacity("tok", 2);
        for i in 1..=5 {
            log.append(flush_with("count", i)).unwrap();
        }
        // Only deltas 4 and 5 survive the cap.
        assert!(log.covers(3));
        assert!(log.covers(5));
        assert!(!log.covers(2));
        assert!(!log.covers(7));
    }

    #[test]
    fn test_rebase_after_snapshot() {
        let mut log = DeltaLog::new("tok");
        for i in 1..=3 {
            log.append(flush_with("count", i)).unwrap();
        }
        log.rebase(3);
        assert!(log.is_empty());
        assert_eq!(log.head(), 3);

        let next = log.append(flush_with("count", 9)).unwrap();
        assert_eq!(next.seq, 4);
    }
}
