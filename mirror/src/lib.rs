// Copyright 2026 Tandem Contributors

//! Replication dispatch for a mirrored block volume.
//!
//! A volume accepts ordinary block reads and writes, applies them to local
//! storage, and replicates writes to a peer over a network link.  A mirrored
//! write runs two legs in tandem: local persistence and remote
//! acknowledgment.  This crate is the layer that routes each I/O, merges the
//! two completion signals into one caller-visible outcome, coordinates
//! write-ordering barriers, and keeps the crash-consistency bookkeeping
//! (out-of-sync bitmap, activity log) straight while doing so.
//!
//! Wire encoding, connection management, bitmap and activity-log storage,
//! and the local storage submission machinery live behind the collaborator
//! traits at the bottom of this file.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use tandem_common::{
    build_logger, BlockRange, ExtentId, TandemError,
};

pub mod block_res;
pub use block_res::{
    io_channel, read_channel, IoRes, IoWaiter, ReadRes, ReadWaiter,
};

mod pending_reads;
mod request;
pub use request::ReqId;
mod transfer_log;
pub use transfer_log::SeqNum;

pub mod volume;
pub use volume::{Counts, Volume, VolumeIo};


// Default bound on in-flight mirrored writes.  Allocation past this point
// fails fast rather than waiting.
const REQUEST_POOL_CAP: usize = 1024;

// Default bound on in-flight peer read fetches across both registry lists.
const PENDING_READ_CAP: usize = 256;

// How many retired request sequence numbers we keep for debug.
const RETIRED_RING_CAP: usize = 2048;

/*
 * Connection state of a volume with respect to its peer.  The set is
 * totally ordered: everything below Connected means the link is down, and
 * the synchronization states sit above Connected.
 */
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    /*
     * Replication is administratively off; the volume runs alone.
     */
    StandAlone,
    /*
     * The link to the peer is down.
     */
    Unconnected,
    /*
     * A connection attempt is in progress; no I/O crosses the link yet.
     */
    Connecting,
    /*
     * The peer is reachable and writes are mirrored.
     */
    Connected,
    /*
     * Connected, and this node is feeding stale regions to the peer.
     */
    SyncSource,
    /*
     * Connected, and this node has stale regions being refreshed from
     * the peer.
     */
    SyncTarget,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnState::StandAlone => write!(f, "StandAlone"),
            ConnState::Unconnected => write!(f, "Unconnected"),
            ConnState::Connecting => write!(f, "Connecting"),
            ConnState::Connected => write!(f, "Connected"),
            ConnState::SyncSource => write!(f, "SyncSource"),
            ConnState::SyncTarget => write!(f, "SyncTarget"),
        }
    }
}

/*
 * Acknowledgment strictness of the replication link.
 *
 * A completes the remote leg on transmission, B and C on a later
 * acknowledgment from the peer (B acks on receipt, C on persistence; from
 * this layer both look like "an ack arrives later").  Only C clears bitmap
 * bits on confirmed dual-leg success.
 */
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireProtocol {
    A,
    B,
    C,
}

impl fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireProtocol::A => write!(f, "A"),
            WireProtocol::B => write!(f, "B"),
            WireProtocol::C => write!(f, "C"),
        }
    }
}

/// How a submitted write was routed.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteDisposition {
    /// Handed to local storage only; replication bookkeeping is done and
    /// the peer will be caught up by a later resynchronization.
    LocalOnly,
    /// In flight; the completion channel fires when every leg has settled.
    Deferred,
    /// Dead on arrival; the completion channel has already fired with the
    /// error.
    ImmediateFailure,
}

/// How a submitted read was routed.
#[derive(Debug)]
pub enum ReadDisposition {
    /// The range is locally consistent.  The responder comes back to the
    /// caller, who serves the read from local storage itself.
    LocalOnly(ReadRes),
    /// Being fetched from the peer; the responder fires on delivery.
    Deferred,
    /// Dead on arrival; the responder has already fired with the error.
    ImmediateFailure,
}

/// Reads and read-ahead follow the same routing policy; the distinction is
/// kept only for diagnostics.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadKind {
    Read,
    ReadAhead,
}

/*
 * Per-volume configuration.
 */
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeOpts {
    pub id: Uuid,
    pub protocol: WireProtocol,
    /// When set, a failed local leg latches the volume faulted in addition
    /// to the normal failure completion.
    pub fatal_local_error: bool,
    pub request_pool: usize,
    pub pending_reads: usize,
}

impl Default for VolumeOpts {
    fn default() -> Self {
        VolumeOpts {
            id: Uuid::new_v4(),
            protocol: WireProtocol::C,
            fatal_local_error: false,
            request_pool: REQUEST_POOL_CAP,
            pending_reads: PENDING_READ_CAP,
        }
    }
}

/// Completion routing for a write handed to local storage.
#[derive(Debug)]
pub enum WriteCompletion {
    /// The local leg of a mirrored write: on completion the storage task
    /// calls [`Volume::local_write_done`] and, once the extent is settled,
    /// [`Volume::extent_settled`].
    Leg(ReqId),
    /// A non-mirrored write: storage fires the responder itself.
    Direct(IoRes),
}

/// One write submission to local storage.  Mirrored writes submit a shadow
/// of the caller's descriptor: same payload, own completion routing.
#[derive(Debug)]
pub struct WriteDescriptor {
    pub range: BlockRange,
    pub data: Bytes,
    pub completion: WriteCompletion,
}

/// The local storage device under the volume.  Submission must not block;
/// completions arrive later through the `Volume` completion surfaces named
/// on [`WriteCompletion`].
pub trait LocalStorage: Send + Sync {
    fn submit(&self, wd: WriteDescriptor);

    /// Best-effort hint that queued writes should be pushed down.  Coalesced
    /// by the volume; see [`Volume::write_hint_fired`].
    fn queue_write_hint(&self);
}

/// Outgoing edge to the peer.  Both send operations report immediate
/// transmission success or failure; acknowledgments and fetch responses come
/// back through [`Volume::remote_ack`] and [`Volume::fetch_response`].
pub trait NetSender: Send + Sync {
    fn send_block(&self, req: ReqId, range: BlockRange, data: &Bytes) -> bool;

    fn send_read_request(&self, range: BlockRange, resync: bool) -> bool;

    /// Wake the sending task so a pending barrier goes out promptly.
    fn wake(&self);
}

/// The out-of-sync bitmap: per-range dirty map identifying regions that
/// need resynchronization.
pub trait SyncBitmap: Send + Sync {
    fn set_out_of_sync(&self, range: BlockRange);
    fn set_in_sync(&self, range: BlockRange);
    fn is_out_of_sync(&self, range: BlockRange) -> bool;
}

/// The activity log: bounded crash-consistent record of in-flight write
/// extents.  Every local write is bracketed begin/complete.
pub trait ActivityLog: Send + Sync {
    fn begin_extent(&self, extent: ExtentId);
    fn complete_extent(&self, extent: ExtentId);
}
