// vim: tw=80
//! Common type definitions used throughout the virtual drive engine

use enum_primitive_derive::Primitive;
use num_traits::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use std::{
    fmt::{self, Display, Formatter},
    time::Duration,
};

/// Indexes a block.  Depending on context, this is either a per-disk
/// ("physical") address or a RAID-group-relative ("logical") address.
pub type LbaT = u64;

/// A count of blocks
pub type BlockT = u64;

/// Identifies an object in the storage topology, such as a provisioned drive
pub type ObjectId = u32;

/// Placeholder for "no object"
pub const OBJECT_ID_INVALID: ObjectId = 0x7fff_ffff;

/// Rebuild checkpoint value meaning "fully rebuilt, not rebuilding"
pub const END_MARKER: LbaT = LbaT::MAX;

/// Size of one block on disk, including the per-block metadata.
pub const BYTES_PER_BLOCK: u64 = 520;

/// Default RAID chunk size in blocks
pub const DEFAULT_CHUNK_SIZE: BlockT = 2048;

/// A virtual drive always has exactly two downstream edges
pub const VD_WIDTH: u32 = 2;

/// How long to wait before giving up on a drive that's merely missing
pub const DEFAULT_PERMANENT_SPARE_TRIGGER_TIME: Duration =
    Duration::from_secs(300);

/// How long to wait after a drive is marked End-Of-Life before asking for a
/// proactive spare
pub const PROACTIVE_COPY_TRIGGER_TIME: Duration = Duration::from_secs(30);

/// Once a drive is definitively faulted, give the fault this long to
/// propagate before swapping it out.
pub const DRIVE_FAULT_DEBOUNCE: Duration = Duration::from_secs(1);

/// Errors returned by the virtual drive engine.
///
/// The numeric values are stable, so they can be reported to other
/// components and over the CLI's exit status.
#[derive(Clone, Copy, Debug, Deserialize, Error, Eq, PartialEq, Primitive,
         Serialize)]
pub enum Error {
    #[error("Generic failure")]
    GenericFailure          = 1,
    #[error("Resource busy, retry later")]
    Busy                    = 2,
    #[error("Insufficient resources")]
    InsufficientResources   = 3,
    #[error("Downstream edge is not enabled")]
    EdgeNotEnabled          = 4,
    #[error("I/O failed and may not be retried")]
    IoFailedNotRetryable    = 5,
    #[error("Operation is not supported in this configuration mode")]
    InvalidConfigMode       = 6,
    #[error("Invalid edge index")]
    InvalidEdgeIndex        = 7,
    #[error("A swap request is already in progress")]
    SwapInProgress          = 8,
    #[error("Required flag is not set")]
    FlagNotSet              = 9,
    #[error("Non-paged metadata lock is already held")]
    LockHeld                = 10,
    #[error("Non-paged metadata is inconsistent")]
    MetadataCorruption      = 11,
    #[error("Metadata write failed")]
    MetadataWrite           = 12,
    #[error("Upstream object denied the request")]
    UpstreamDenied          = 13,
    #[error("Invalid configuration")]
    InvalidConfig           = 14,

    #[error("Unknown error")]
    Unknown                 = 255,
}

impl Error {
    /// Numeric code for this error
    pub fn code(self) -> i32 {
        self.to_i32().unwrap_or(255)
    }

    /// Convert a numeric code back into an `Error`
    pub fn from_code(code: i32) -> Self {
        Error::from_i32(code).unwrap_or(Error::Unknown)
    }
}

impl From<bincode::Error> for Error {
    fn from(_: bincode::Error) -> Self {
        Error::MetadataCorruption
    }
}

impl From<serde_yaml_ng::Error> for Error {
    fn from(_: serde_yaml_ng::Error) -> Self {
        Error::InvalidConfig
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

/// Outcome of an operation that may need to wait for an external completion.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[must_use]
pub enum Status {
    /// The operation is finished.
    Done,
    /// The operation was handed off to a collaborator.  The engine will be
    /// re-entered through a completion entry point.
    MoreProcessing,
}

/// Identifies one of a virtual drive's two downstream edges
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub enum EdgeIndex {
    First = 0,
    Second = 1,
}

impl EdgeIndex {
    pub const ALL: [EdgeIndex; 2] = [EdgeIndex::First, EdgeIndex::Second];

    /// Bit corresponding to this edge in a position bitmask
    pub const fn bit(self) -> u16 {
        1 << self as u16
    }

    pub const fn idx(self) -> usize {
        self as usize
    }

    /// The edge that isn't this one
    pub const fn other(self) -> Self {
        match self {
            EdgeIndex::First => EdgeIndex::Second,
            EdgeIndex::Second => EdgeIndex::First,
        }
    }
}

impl Display for EdgeIndex {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        (*self as u32).fmt(f)
    }
}

impl TryFrom<u32> for EdgeIndex {
    type Error = Error;

    fn try_from(i: u32) -> Result<Self> {
        match i {
            0 => Ok(EdgeIndex::First),
            1 => Ok(EdgeIndex::Second),
            _ => Err(Error::InvalidEdgeIndex)
        }
    }
}

impl From<EdgeIndex> for u32 {
    fn from(e: EdgeIndex) -> Self {
        e as u32
    }
}

/// Physical location of a drive, used to qualify event log entries
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct DriveLocation {
    pub bus: u32,
    pub enclosure: u32,
    pub slot: u32,
}

impl Display for DriveLocation {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}_{}_{}", self.bus, self.enclosure, self.slot)
    }
}

/// Lifecycle state of an object, as maintained by the scheduler
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum LifecycleState {
    Specialize,
    Activate,
    #[default]
    Ready,
    Hibernate,
    PendingHibernate,
    Fail,
    Destroy,
}

/// A block range
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Extent {
    pub lba: LbaT,
    pub blocks: BlockT,
}

impl Extent {
    pub const fn new(lba: LbaT, blocks: BlockT) -> Self {
        Extent {lba, blocks}
    }

    /// The first LBA past the end of the extent
    pub const fn end(&self) -> LbaT {
        self.lba + self.blocks
    }
}

// LCOV_EXCL_STOP
