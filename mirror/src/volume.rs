// Copyright 2026 Tandem Contributors
//! Per-volume replication context: I/O routing and completion tracking.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use slog::{crit, debug, info, o, warn, Logger};
use tracing::instrument;
use uuid::Uuid;

use crate::block_res::{IoRes, ReadRes};
use crate::pending_reads::{PendingRead, PendingReads, ReadCause};
use crate::request::{Leg, Request, RequestArena};
use crate::transfer_log::{SeqNum, TransferLog};
use crate::{
    ActivityLog, ConnState, LocalStorage, NetSender, ReadDisposition,
    ReadKind, ReqId, SyncBitmap, VolumeOpts, WireProtocol, WriteCompletion,
    WriteDescriptor, WriteDisposition,
};
use tandem_common::{build_logger, BlockRange, TandemError};

/// Collaborator handles for one volume.  `storage: None` models the
/// diskless node: nothing to apply writes to, every read comes from the
/// peer.
pub struct VolumeIo {
    pub storage: Option<Arc<dyn LocalStorage>>,
    pub sender: Arc<dyn NetSender>,
    pub bitmap: Arc<dyn SyncBitmap>,
    pub activity_log: Arc<dyn ActivityLog>,
}

#[derive(Debug, Default)]
struct VolumeFlags {
    /// Coalesces the best-effort flush hint; re-armed by
    /// [`Volume::write_hint_fired`].
    write_hint_queued: AtomicBool,
    /// The next outgoing packet sequence must be preceded by a barrier.
    issue_barrier: AtomicBool,
    partner_diskless: AtomicBool,
    /// Latched when the fatal-local-error policy fires.
    faulted: AtomicBool,
}

/*
 * Byte counters are incremented without cross-leg synchronization and are
 * advisory only.
 */
#[derive(Debug, Default)]
struct IoCounters {
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
    pending_acks: AtomicU64,
}

/// Snapshot of the advisory counters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Counts {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub pending_acks: u64,
}

/// Everything needed to finish a request once its second leg has landed.
/// Copied out under the request lock so the lock is not held across the
/// transfer log, the bitmap, or the caller's responder.
struct Finalize {
    seq: Option<SeqNum>,
    range: BlockRange,
    local_ok: bool,
    success: bool,
    res: IoRes,
}

/**
 * One replicated volume.
 *
 * The three locks are disjoint: the request lock covers leg flag
 * check-and-set, the registry lock covers the pending-read lists, and the
 * transfer-log lock covers link/unlink/drain.  None of them is ever held
 * across a responder, a transmission, or an allocation, so completion
 * signals may arrive from any context, including ones that must not block.
 */
pub struct Volume {
    opts: VolumeOpts,
    state: RwLock<ConnState>,
    flags: VolumeFlags,
    counters: IoCounters,

    requests: Mutex<RequestArena>,
    reads: Mutex<PendingReads>,
    transfer_log: Mutex<TransferLog>,

    io: VolumeIo,
    log: Logger,
}

impl Volume {
    pub fn new(opts: VolumeOpts, io: VolumeIo, log: Option<Logger>) -> Arc<Volume> {
        let log = log.unwrap_or_else(build_logger);
        let log = log.new(o!("volume" => opts.id.to_string()));
        info!(log, "new volume, protocol {}", opts.protocol);
        Arc::new(Volume {
            state: RwLock::new(ConnState::StandAlone),
            flags: VolumeFlags::default(),
            counters: IoCounters::default(),
            requests: Mutex::new(RequestArena::new(opts.request_pool)),
            reads: Mutex::new(PendingReads::new(opts.pending_reads)),
            transfer_log: Mutex::new(TransferLog::new()),
            io,
            opts,
            log,
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.opts.id
    }

    pub fn conn_state(&self) -> ConnState {
        *self.state.read().unwrap()
    }

    pub fn set_conn_state(&self, new: ConnState) {
        let mut state = self.state.write().unwrap();
        if *state != new {
            info!(self.log, "connection state {} -> {}", *state, new);
            *state = new;
        }
    }

    pub fn set_partner_diskless(&self, diskless: bool) {
        self.flags
            .partner_diskless
            .store(diskless, Ordering::SeqCst);
    }

    pub fn is_faulted(&self) -> bool {
        self.flags.faulted.load(Ordering::SeqCst)
    }

    /// Consumed by the sending task before it builds the next packet
    /// sequence; a true return means that sequence must open with a
    /// barrier.
    pub fn take_barrier_flag(&self) -> bool {
        self.flags.issue_barrier.swap(false, Ordering::SeqCst)
    }

    pub fn barrier_pending(&self) -> bool {
        self.flags.issue_barrier.load(Ordering::SeqCst)
    }

    /// The storage hint task has run; the next write may queue another.
    pub fn write_hint_fired(&self) {
        self.flags.write_hint_queued.store(false, Ordering::SeqCst);
    }

    pub fn counts(&self) -> Counts {
        Counts {
            read_bytes: self.counters.read_bytes.load(Ordering::Relaxed),
            write_bytes: self.counters.write_bytes.load(Ordering::Relaxed),
            pending_acks: self.counters.pending_acks.load(Ordering::Relaxed),
        }
    }

    /*
     * Write dispatch.
     */

    /// Route a write.  `ImmediateFailure` means `res` has already fired;
    /// `LocalOnly` means the write went to local storage with no
    /// replication leg; `Deferred` means completion arrives through `res`
    /// once every leg has settled.
    #[instrument(skip(self, data, res))]
    pub fn submit_write(
        &self,
        range: BlockRange,
        data: Bytes,
        res: IoRes,
    ) -> WriteDisposition {
        let state = self.conn_state();

        let Some(storage) = self.io.storage.clone() else {
            return self.submit_write_remote_only(range, data, res, state);
        };

        if state == ConnState::SyncTarget
            && self.io.bitmap.is_out_of_sync(range)
        {
            // A local write supersedes any resync fetch still in flight
            // for the sector; its data must not be applied on arrival.
            if self.reads.lock().unwrap().discard(range.sector) {
                warn!(self.log, "discarding resync fetch for {range}");
            }
        }

        self.counters
            .write_bytes
            .fetch_add(u64::from(range.bytes), Ordering::Relaxed);

        if state < ConnState::Connected
            || self.flags.partner_diskless.load(Ordering::SeqCst)
        {
            // Not mirrored; a later resynchronization catches the peer
            // up.  The range is dirty in the bitmap before the write is
            // issued, so the activity-log extent can close immediately.
            self.io.bitmap.set_out_of_sync(range);
            self.io.activity_log.begin_extent(range.extent());
            storage.submit(WriteDescriptor {
                range,
                data,
                completion: WriteCompletion::Direct(res),
            });
            self.io.activity_log.complete_extent(range.extent());
            return WriteDisposition::LocalOnly;
        }

        // Mirrored write: a shadow of the caller's descriptor goes to
        // local storage while the block goes to the peer.
        let id = match self
            .alloc_request(Request::new_mirrored(range, data.clone(), res))
        {
            Ok(id) => id,
            Err(res) => {
                res.send_err(TandemError::AllocationExhausted);
                return WriteDisposition::ImmediateFailure;
            }
        };
        self.link_request(id, range);

        if !self.transmit_block(id, range, &data) {
            self.io.bitmap.set_out_of_sync(range);
        }

        self.queue_write_hint(&*storage);

        self.io.activity_log.begin_extent(range.extent());
        storage.submit(WriteDescriptor {
            range,
            data,
            completion: WriteCompletion::Leg(id),
        });

        WriteDisposition::Deferred
    }

    /// Writes on a diskless node have only the remote leg; the local leg
    /// is born settled.
    fn submit_write_remote_only(
        &self,
        range: BlockRange,
        data: Bytes,
        res: IoRes,
        state: ConnState,
    ) -> WriteDisposition {
        if state < ConnState::Connected {
            res.send_err(TandemError::NotConnected);
            return WriteDisposition::ImmediateFailure;
        }

        let id = match self
            .alloc_request(Request::new_remote_only(range, data.clone(), res))
        {
            Ok(id) => id,
            Err(res) => {
                res.send_err(TandemError::AllocationExhausted);
                return WriteDisposition::ImmediateFailure;
            }
        };
        self.link_request(id, range);
        self.transmit_block(id, range, &data);

        WriteDisposition::Deferred
    }

    fn alloc_request(&self, req: Request) -> Result<ReqId, IoRes> {
        match self.requests.lock().unwrap().insert(req) {
            Ok(id) => Ok(id),
            Err(mut req) => {
                warn!(
                    self.log,
                    "request pool exhausted; failing write for {}", req.range
                );
                Err(req.res.take().expect("fresh request has a responder"))
            }
        }
    }

    fn link_request(&self, id: ReqId, range: BlockRange) {
        let seq = self.transfer_log.lock().unwrap().link(id, range);
        if let Some(req) = self.requests.lock().unwrap().get_mut(id) {
            req.seq = Some(seq);
        }
    }

    /// Send the block, and settle the remote leg inline when no ack will
    /// arrive: either the transmission failed, or the protocol completes
    /// on send.
    fn transmit_block(
        &self,
        id: ReqId,
        range: BlockRange,
        data: &Bytes,
    ) -> bool {
        let send_ok = self.io.sender.send_block(id, range, data);
        if send_ok && self.opts.protocol != WireProtocol::A {
            self.counters.pending_acks.fetch_add(1, Ordering::Relaxed);
        }
        if !send_ok || self.opts.protocol == WireProtocol::A {
            self.complete_leg(id, Leg::Remote, send_ok, false);
        }
        send_ok
    }

    fn queue_write_hint(&self, storage: &dyn LocalStorage) {
        if !self.flags.write_hint_queued.swap(true, Ordering::SeqCst) {
            storage.queue_write_hint();
        }
    }

    /*
     * Read dispatch.
     */

    /// Route a read (or read-ahead, identically).  `LocalOnly` hands the
    /// responder back: the range is consistent here and the caller serves
    /// it from local storage itself.
    #[instrument(skip(self, res))]
    pub fn submit_read(
        &self,
        range: BlockRange,
        kind: ReadKind,
        res: ReadRes,
    ) -> ReadDisposition {
        let state = self.conn_state();

        if self.io.storage.is_none() {
            if state < ConnState::Connected {
                res.send_err(TandemError::NotConnected);
                return ReadDisposition::ImmediateFailure;
            }
            debug!(self.log, "{kind:?} for {range} goes to the peer");
            return self.register_app_fetch(range, res);
        }

        if state == ConnState::SyncTarget
            && self.io.bitmap.is_out_of_sync(range)
        {
            // Stale locally; serve from the peer.  A resync fetch already
            // in flight is upgraded rather than duplicated.
            let res = match self
                .reads
                .lock()
                .unwrap()
                .upgrade(range.sector, res)
            {
                Ok(()) => {
                    info!(
                        self.log,
                        "upgraded resync fetch for {range} to application read"
                    );
                    return ReadDisposition::Deferred;
                }
                Err(res) => res,
            };
            return self.register_app_fetch(range, res);
        }

        self.counters
            .read_bytes
            .fetch_add(u64::from(range.bytes), Ordering::Relaxed);
        ReadDisposition::LocalOnly(res)
    }

    /// Register an application fetch for `range`, piggybacking on any
    /// fetch already outstanding for the sector so at most one exists.
    fn register_app_fetch(
        &self,
        range: BlockRange,
        res: ReadRes,
    ) -> ReadDisposition {
        {
            let mut reads = self.reads.lock().unwrap();
            if let Some(pr) = reads.find(range.sector) {
                pr.responders.push(res);
                return ReadDisposition::Deferred;
            }
            let pr = PendingRead {
                range,
                cause: ReadCause::application(),
                responders: vec![res],
            };
            if let Err(pr) = reads.register(pr) {
                warn!(
                    self.log,
                    "fetch registry exhausted; failing read for {range}"
                );
                for res in pr.responders {
                    res.send_err(TandemError::AllocationExhausted);
                }
                return ReadDisposition::ImmediateFailure;
            }
        }

        // Transmit outside the registry lock.
        if !self.io.sender.send_read_request(range, false) {
            let taken = self.reads.lock().unwrap().take(range.sector);
            if let Some(pr) = taken {
                for res in pr.responders {
                    res.send_err(TandemError::TransmissionFailed);
                }
            }
            return ReadDisposition::ImmediateFailure;
        }
        ReadDisposition::Deferred
    }

    /// Entry point for the resynchronization engine: fetch a stale range
    /// from the peer.  Returns false if a fetch for the sector is already
    /// outstanding, the registry is full, or transmission failed.
    pub fn register_resync_fetch(&self, range: BlockRange) -> bool {
        {
            let mut reads = self.reads.lock().unwrap();
            if reads.find(range.sector).is_some() {
                return false;
            }
            let pr = PendingRead {
                range,
                cause: ReadCause::resync(),
                responders: vec![],
            };
            if reads.register(pr).is_err() {
                warn!(
                    self.log,
                    "fetch registry exhausted; skipping resync fetch for {range}"
                );
                return false;
            }
        }

        if !self.io.sender.send_read_request(range, true) {
            self.reads.lock().unwrap().take(range.sector);
            return false;
        }
        true
    }

    /*
     * Completion surfaces.  The local leg settles from the storage
     * completion context, the remote leg from the ack receiver; both paths
     * go through complete_leg.
     */

    pub fn local_write_done(&self, id: ReqId, success: bool) {
        self.complete_leg(id, Leg::Local, success, false);
    }

    pub fn remote_ack(&self, id: ReqId, success: bool) {
        // Advisory; teardown may have zeroed it already.
        let _ = self.counters.pending_acks.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |v| Some(v.saturating_sub(1)),
        );
        self.complete_leg(id, Leg::Remote, success, false);
    }

    /// The activity log has confirmed the extent behind `id`'s local
    /// write.  This normally lands shortly after local-leg completion and
    /// is the last gate before the request slot is reused.
    pub fn extent_settled(&self, id: ReqId) {
        let range = {
            let mut requests = self.requests.lock().unwrap();
            let Some(req) = requests.get_mut(id) else {
                warn!(self.log, "extent confirmation for unknown request {id}");
                return;
            };
            if !req.extent_pending {
                warn!(
                    self.log,
                    "duplicate extent confirmation for request {id}"
                );
                return;
            }
            req.extent_pending = false;
            req.range
        };
        self.io.activity_log.complete_extent(range.extent());
        self.retire_check(id);
    }

    /// The link is gone.  Every outstanding remote leg settles as failed
    /// and every outstanding fetch fails; local legs settle on their own
    /// schedule.
    pub fn connection_lost(&self) {
        self.set_conn_state(ConnState::Unconnected);

        let drained = self.transfer_log.lock().unwrap().drain();
        if !drained.is_empty() {
            warn!(
                self.log,
                "failing {} in-flight replicated writes",
                drained.len()
            );
        }
        for (_seq, id) in drained {
            self.complete_leg(id, Leg::Remote, false, true);
        }

        let reads = self.reads.lock().unwrap().drain_all();
        for pr in reads {
            for res in pr.responders {
                res.send_err(TandemError::NotConnected);
            }
        }

        self.counters.pending_acks.store(0, Ordering::Relaxed);
    }

    /*
     * The two-leg merge.  Exactly one call observes the second leg
     * landing; that call owns finalization, and the responder's ownership
     * makes firing it twice impossible.
     */
    fn complete_leg(&self, id: ReqId, leg: Leg, success: bool, teardown: bool) {
        // Flag check-and-set only under the request lock; everything that
        // can call out runs after it is dropped.
        let fin = {
            let mut requests = self.requests.lock().unwrap();
            let Some(req) = requests.get_mut(id) else {
                warn!(self.log, "{leg} completion for unknown request {id}");
                return;
            };
            let (done, ok) = match leg {
                Leg::Local => (&mut req.local_done, &mut req.local_ok),
                Leg::Remote => (&mut req.remote_done, &mut req.remote_ok),
            };
            if *done {
                // A collaborator violated its contract upstream; request
                // state is unchanged.
                warn!(
                    self.log,
                    "duplicate {leg} completion for request {id}"
                );
                return;
            }
            *done = true;
            *ok = success;
            if !req.legs_done() {
                return;
            }
            req.finalized = true;
            Finalize {
                seq: req.seq,
                range: req.range,
                local_ok: req.local_ok,
                success: req.success(),
                res: req.res.take().expect("responder fired twice"),
            }
        };

        let mut raise_barrier = false;
        if !teardown {
            if let Some(seq) = fin.seq {
                if self.transfer_log.lock().unwrap().unlink(seq) {
                    // A later-ordered overlapping write is still in
                    // flight; the peer must see a barrier first.
                    self.flags.issue_barrier.store(true, Ordering::SeqCst);
                    raise_barrier = true;
                }
            }
        }
        // (on teardown the log was emptied wholesale under its own lock,
        // and nothing orders against a dead link)

        if self.opts.protocol == WireProtocol::C
            && fin.success
            && self.conn_state() >= ConnState::Connected
        {
            self.io.bitmap.set_in_sync(fin.range);
        }

        let result = if fin.success {
            Ok(())
        } else if !fin.local_ok {
            Err(TandemError::LocalStorageFailed)
        } else {
            Err(TandemError::RemoteFailed)
        };
        fin.res.send_result(result);

        if self.opts.fatal_local_error && !fin.local_ok {
            crit!(
                self.log,
                "local storage failed under {}; volume is faulted",
                fin.range
            );
            self.flags.faulted.store(true, Ordering::SeqCst);
        }

        if raise_barrier {
            self.io.sender.wake();
        }

        self.retire_check(id);
    }

    /// Reuse the slot once the responder has fired and the extent is
    /// settled, whichever came last.
    fn retire_check(&self, id: ReqId) {
        let mut requests = self.requests.lock().unwrap();
        let ready = requests
            .get(id)
            .map(|req| req.finalized && !req.extent_pending)
            .unwrap_or(false);
        if ready {
            requests.retire(id);
            debug!(self.log, "retired request {id}");
        }
    }

    #[cfg(test)]
    pub(crate) fn active_requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn pending_read_count(&self) -> usize {
        self.reads.lock().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn transfer_log_len(&self) -> usize {
        self.transfer_log.lock().unwrap().len()
    }
}
