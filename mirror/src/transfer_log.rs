// Copyright 2026 Tandem Contributors
//! Ordered record of outstanding replicated writes.
//!
//! Entries are kept in transmission order.  When a write finishes while a
//! later write to an overlapping range is still outstanding, the peer must
//! see a barrier before the later write's data is applied, or cross-write
//! ordering is lost on replay.  `unlink` reports that condition; the volume
//! turns it into the barrier flag.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound::{Excluded, Unbounded};

use serde::{Deserialize, Serialize};

use crate::request::ReqId;
use tandem_common::BlockRange;

/// Wrapper type for a transfer-log sequence number.  Assigned once per
/// linked request, strictly increasing in transmission order.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    Hash,
    PartialEq,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct SeqNum(pub u64);

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Copy, Clone)]
struct TransferEntry {
    req: ReqId,
    range: BlockRange,
}

#[derive(Debug)]
pub(crate) struct TransferLog {
    entries: BTreeMap<SeqNum, TransferEntry>,
    next_seq: u64,
}

impl TransferLog {
    pub fn new() -> Self {
        TransferLog {
            entries: BTreeMap::new(),
            next_seq: 1,
        }
    }

    pub fn link(&mut self, req: ReqId, range: BlockRange) -> SeqNum {
        let seq = SeqNum(self.next_seq);
        self.next_seq += 1;
        self.entries.insert(seq, TransferEntry { req, range });
        seq
    }

    /// Remove `seq` and report whether any later-ordered entry overlaps its
    /// range (and therefore depended on it for ordering).  Unknown sequence
    /// numbers have already been drained by a teardown; nothing depends on
    /// them.
    pub fn unlink(&mut self, seq: SeqNum) -> bool {
        let Some(entry) = self.entries.remove(&seq) else {
            return false;
        };
        self.entries
            .range((Excluded(seq), Unbounded))
            .any(|(_, e)| e.range.overlaps(&entry.range))
    }

    /// Empty the log wholesale, in order.  Used when the connection goes
    /// away and every outstanding remote leg must settle as failed.
    pub fn drain(&mut self) -> Vec<(SeqNum, ReqId)> {
        let drained =
            self.entries.iter().map(|(s, e)| (*s, e.req)).collect();
        self.entries.clear();
        drained
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, seq: SeqNum) -> bool {
        self.entries.contains_key(&seq)
    }
}
