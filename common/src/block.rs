// Copyright 2026 Tandem Contributors
//! Sector addressing and activity-log extent arithmetic.

use std::fmt;

use serde::{Deserialize, Serialize};

/// All addressing in the replication layer is in 512 byte sectors.
pub const SECTOR_SHIFT: u32 = 9;
pub const SECTOR_SIZE: u32 = 1 << SECTOR_SHIFT;

/// An activity-log extent covers 4 MiB of the volume (8192 sectors).  A
/// dirty extent bounds how much must be resynchronized after a crash.
pub const EXTENT_SECTOR_SHIFT: u32 = 13;
pub const EXTENT_SECTORS: u64 = 1 << EXTENT_SECTOR_SHIFT;

/// Wrapper type for an activity-log extent index.
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
pub struct ExtentId(pub u64);

impl fmt::Display for ExtentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A contiguous run of sectors: the unit every dispatch and completion
/// operation is keyed on.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BlockRange {
    /// First sector of the range.
    pub sector: u64,
    /// Length in bytes; always a whole number of sectors.
    pub bytes: u32,
}

impl BlockRange {
    /// # Panics
    /// If `bytes` is not a multiple of the sector size.
    pub fn new(sector: u64, bytes: u32) -> Self {
        assert!(bytes % SECTOR_SIZE == 0, "unaligned length {bytes}");
        BlockRange { sector, bytes }
    }

    pub fn sectors(&self) -> u64 {
        u64::from(self.bytes >> SECTOR_SHIFT)
    }

    /// One past the last sector of the range.
    pub fn end_sector(&self) -> u64 {
        self.sector + self.sectors()
    }

    /// Two ranges conflict when any sector is covered by both.
    pub fn overlaps(&self, other: &BlockRange) -> bool {
        self.sector < other.end_sector() && other.sector < self.end_sector()
    }

    /// The activity-log extent holding the first sector of the range.
    pub fn extent(&self) -> ExtentId {
        ExtentId(self.sector >> EXTENT_SECTOR_SHIFT)
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.sector, self.end_sector())
    }
}
