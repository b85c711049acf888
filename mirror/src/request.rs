// Copyright 2026 Tandem Contributors
//! In-flight mirrored write records and the bounded arena that owns them.

use std::fmt;

use bytes::Bytes;
use ringbuffer::{AllocRingBuffer, RingBuffer};

use crate::block_res::IoRes;
use crate::transfer_log::SeqNum;
use crate::RETIRED_RING_CAP;
use tandem_common::BlockRange;

/// Handle to a request slot.  The generation makes a handle held past
/// retirement harmless: a reused slot carries a new generation and the
/// stale handle no longer resolves.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct ReqId {
    pub slot: u32,
    pub gen: u32,
}

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slot, self.gen)
    }
}

/// The two legs of a mirrored write.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Leg {
    Local,
    Remote,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Local => write!(f, "local"),
            Leg::Remote => write!(f, "remote"),
        }
    }
}

/*
 * One in-flight replicated write.
 *
 * The caller's responder is taken out exactly once, when the second leg
 * lands.  `extent_pending` holds the slot until the activity log confirms
 * the extent, which normally arrives after local-leg completion.
 */
#[derive(Debug)]
pub(crate) struct Request {
    pub range: BlockRange,
    pub data: Bytes,

    /// Position in the transfer log; None until linked.
    pub seq: Option<SeqNum>,

    pub local_done: bool,
    pub local_ok: bool,
    pub remote_done: bool,
    pub remote_ok: bool,

    /// The responder has been taken and fired.
    pub finalized: bool,

    /// Still waiting on the extent-settled signal from local storage.
    pub extent_pending: bool,

    pub res: Option<IoRes>,
}

impl Request {
    /// A write on a node with local storage: both legs outstanding, extent
    /// confirmation required before retirement.
    pub fn new_mirrored(range: BlockRange, data: Bytes, res: IoRes) -> Self {
        Request {
            range,
            data,
            seq: None,
            local_done: false,
            local_ok: true,
            remote_done: false,
            remote_ok: true,
            finalized: false,
            extent_pending: true,
            res: Some(res),
        }
    }

    /// A write on a diskless node: only the remote leg is real, so the
    /// local leg starts settled successful and there is no extent to wait
    /// for.
    pub fn new_remote_only(range: BlockRange, data: Bytes, res: IoRes) -> Self {
        Request {
            local_done: true,
            extent_pending: false,
            ..Request::new_mirrored(range, data, res)
        }
    }

    pub fn legs_done(&self) -> bool {
        self.local_done && self.remote_done
    }

    /// Cumulative outcome: the AND of what each leg reported.
    pub fn success(&self) -> bool {
        self.local_ok && self.remote_ok
    }
}

struct Slot {
    gen: u32,
    req: Option<Request>,
}

/*
 * Bounded arena of request slots.  Allocation and lookup are O(1) and
 * never block; an empty free list is an immediate failure, not a wait.
 */
pub(crate) struct RequestArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    retired: AllocRingBuffer<SeqNum>,
}

impl RequestArena {
    pub fn new(cap: usize) -> Self {
        let slots = (0..cap).map(|_| Slot { gen: 0, req: None }).collect();
        // Hand out low slot numbers first.
        let free = (0..cap as u32).rev().collect();
        RequestArena {
            slots,
            free,
            retired: AllocRingBuffer::new(RETIRED_RING_CAP),
        }
    }

    /// Returns the request back on exhaustion so the caller can fail it.
    pub fn insert(&mut self, req: Request) -> Result<ReqId, Request> {
        let Some(slot) = self.free.pop() else {
            return Err(req);
        };
        let s = &mut self.slots[slot as usize];
        assert!(s.req.is_none());
        s.req = Some(req);
        Ok(ReqId { slot, gen: s.gen })
    }

    pub fn get(&self, id: ReqId) -> Option<&Request> {
        let s = self.slots.get(id.slot as usize)?;
        if s.gen != id.gen {
            return None;
        }
        s.req.as_ref()
    }

    pub fn get_mut(&mut self, id: ReqId) -> Option<&mut Request> {
        let s = self.slots.get_mut(id.slot as usize)?;
        if s.gen != id.gen {
            return None;
        }
        s.req.as_mut()
    }

    /// Free the slot for reuse under a new generation.
    pub fn retire(&mut self, id: ReqId) -> Option<Request> {
        let s = self.slots.get_mut(id.slot as usize)?;
        if s.gen != id.gen {
            return None;
        }
        let req = s.req.take()?;
        s.gen = s.gen.wrapping_add(1);
        self.free.push(id.slot);
        if let Some(seq) = req.seq {
            self.retired.push(seq);
        }
        Some(req)
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn retired(&self) -> Vec<SeqNum> {
        self.retired.iter().copied().collect()
    }
}
