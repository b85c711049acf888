// Copyright 2026 Tandem Contributors
//! Registry of outstanding peer read fetches.
//!
//! A fetch exists for one of two reasons: an application read that cannot
//! be served locally, or the resynchronization engine pulling a stale
//! range.  The two meet at the same sector often enough that the registry
//! guarantees at most one fetch per sector: an application read against an
//! in-flight resync fetch upgrades it instead of duplicating it, and a
//! local write against one marks it discarded so the late-arriving data is
//! dropped on delivery.

use crate::block_res::ReadRes;
use tandem_common::BlockRange;

/// Why a fetch is outstanding.  Application and Resync can both be set
/// after an upgrade; Discard wins over everything at delivery time.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ReadCause {
    pub application: bool,
    pub resync: bool,
    pub discard: bool,
}

impl ReadCause {
    pub fn application() -> Self {
        ReadCause {
            application: true,
            ..Default::default()
        }
    }

    pub fn resync() -> Self {
        ReadCause {
            resync: true,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub(crate) struct PendingRead {
    pub range: BlockRange,
    pub cause: ReadCause,
    /// Application responders attached to this fetch.  Resync-originated
    /// entries start with none; an upgrade attaches the reader.
    pub responders: Vec<ReadRes>,
}

/*
 * Both lists live under one lock in the volume.  Scans are linear; the
 * registry is bounded well below the point where that matters.
 */
#[derive(Debug)]
pub(crate) struct PendingReads {
    app: Vec<PendingRead>,
    resync: Vec<PendingRead>,
    cap: usize,
}

impl PendingReads {
    pub fn new(cap: usize) -> Self {
        PendingReads {
            app: Vec::new(),
            resync: Vec::new(),
            cap,
        }
    }

    pub fn len(&self) -> usize {
        self.app.len() + self.resync.len()
    }

    pub fn find(&mut self, sector: u64) -> Option<&mut PendingRead> {
        self.app
            .iter_mut()
            .chain(self.resync.iter_mut())
            .find(|pr| pr.range.sector == sector)
    }

    /// Insert into the list matching the entry's cause.  Fails (returning
    /// the entry) when the registry is full; the caller fails the I/O
    /// rather than waiting.
    pub fn register(&mut self, pr: PendingRead) -> Result<(), PendingRead> {
        if self.len() >= self.cap {
            return Err(pr);
        }
        if pr.cause.application {
            self.app.push(pr);
        } else {
            self.resync.push(pr);
        }
        Ok(())
    }

    /// Mark the fetch covering `sector` discarded, if it was fetched for
    /// resynchronization.  The entry stays listed: removal happens at
    /// response delivery, which is what makes the late response safe to
    /// drop.  Returns true if an entry was marked.
    pub fn discard(&mut self, sector: u64) -> bool {
        match self.find(sector) {
            Some(pr) if pr.cause.resync && !pr.cause.discard => {
                pr.cause.discard = true;
                true
            }
            _ => false,
        }
    }

    /// Upgrade a resync-originated fetch to also serve an application
    /// read: add the cause, attach the responder, relocate to the
    /// application list.  Returns the responder back if no resync fetch is
    /// outstanding for the sector.
    pub fn upgrade(&mut self, sector: u64, res: ReadRes) -> Result<(), ReadRes> {
        let Some(idx) = self
            .resync
            .iter()
            .position(|pr| pr.range.sector == sector && !pr.cause.discard)
        else {
            return Err(res);
        };
        let mut pr = self.resync.remove(idx);
        pr.cause.application = true;
        pr.responders.push(res);
        self.app.push(pr);
        Ok(())
    }

    /// Remove the entry for `sector` so a response can be delivered (or
    /// dropped, if discarded).
    pub fn take(&mut self, sector: u64) -> Option<PendingRead> {
        if let Some(idx) =
            self.app.iter().position(|pr| pr.range.sector == sector)
        {
            return Some(self.app.remove(idx));
        }
        if let Some(idx) =
            self.resync.iter().position(|pr| pr.range.sector == sector)
        {
            return Some(self.resync.remove(idx));
        }
        None
    }

    /// Empty both lists; used at connection teardown.
    pub fn drain_all(&mut self) -> Vec<PendingRead> {
        let mut out = std::mem::take(&mut self.app);
        out.append(&mut self.resync);
        out
    }
}
