// vim: tw=80
//! Interfaces to the collaborators that surround a virtual drive
//!
//! The engine never performs I/O itself.  Metadata persistence, spare
//! selection, upstream permission checks, rebuild I/O, notifications, the event
//! log, and the lifecycle scheduler are all reached through the traits in
//! this module.

use std::{fmt, future::Future, pin::Pin, time::Duration};

#[cfg(test)] use mockall::automock;
use num_enum::{FromPrimitive, IntoPrimitive};
use serde_derive::{Deserialize, Serialize};

use crate::{
    nonpaged::PagedEntry,
    types::*,
};

/// A boxed future returned by a collaborator
pub type BoxFut<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Operations that the job service performs on a virtual drive's behalf
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum SwapCommand {
    PermanentSpare,
    ProactiveCopy,
    UserCopy,
    UserCopyTo,
    CompleteCopy,
    AbortCopy,
    #[default]
    Invalid,
}

impl SwapCommand {
    pub fn is_user_copy(self) -> bool {
        matches!(self, SwapCommand::UserCopy | SwapCommand::UserCopyTo)
    }

    /// Does this command attach a new edge?
    pub fn is_swap_in(self) -> bool {
        matches!(self, SwapCommand::PermanentSpare | SwapCommand::ProactiveCopy
                 | SwapCommand::UserCopy | SwapCommand::UserCopyTo)
    }
}

impl fmt::Display for SwapCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Completion codes reported by the job service
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum JobError {
    #[default]
    NoError,
    PresentlyNoSpares,
    NoSuitableSpare,
    RaidGroupBroken,
    RaidGroupDenied,
    RaidGroupDegraded,
    HasCopyInProgress,
    SourceDriveDegraded,
    PermanentSpareNotRequired,
    ProactiveSpareNotRequired,
    VirtualDriveBroken,
    InvalidOriginalObjectId,
    SpareRaidGroupUnconsumed,
    InvalidSwapCommand,
    UpstreamDenied,
    Internal,
}

/// A configuration change request submitted to the job service
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SwapRequest {
    pub vd_id: ObjectId,
    /// Edge to swap in or out
    pub swap_idx: EdgeIndex,
    /// For a copy, the edge at the other end of the mirror
    pub mirror_idx: Option<EdgeIndex>,
    pub orig_pvd: ObjectId,
    pub command: SwapCommand,
    pub is_proactive_copy: bool,
    /// Should the job wait for the virtual drive to confirm each step?
    pub operation_confirmation: bool,
}

/// The job service, which serializes configuration changes across
/// controllers
#[cfg_attr(test, automock)]
pub trait JobService: Send + Sync {
    /// Queue a swap request.  The outcome arrives later through
    /// [`VirtualDrive::handle_swap_request_completion`](crate::virtual_drive::VirtualDrive::handle_swap_request_completion).
    fn submit_swap(&self, request: SwapRequest) -> Result<()>;
}

/// Durable storage for the virtual drive's metadata
#[cfg_attr(test, automock)]
pub trait MetadataStore: Send + Sync {
    /// Write and persist part of the non-paged record.
    ///
    /// `offset` is relative to the start of the record body, and the write
    /// is durable once the future resolves successfully.
    fn write_nonpaged(&self, offset: usize, data: Vec<u8>)
        -> BoxFut<Result<()>>;

    /// Paint `repeat` consecutive paged-metadata entries, starting at
    /// `chunk_offset`, with `entry`.
    fn write_paged_default(&self, chunk_offset: u64, repeat: u64,
                           entry: PagedEntry) -> BoxFut<Result<()>>;
}

/// Kinds of events sent to the upstream raid group
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventKind {
    /// Is this range consumed by any upstream client?
    PermitRequest,
    /// Mark this range for a later verify
    MarkVerify,
    /// May a user copy begin?
    CopyRequest,
    /// May an in-progress copy be abandoned, leaving the raid group
    /// degraded?
    AbortCopyRequest,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    /// Logical range the event concerns
    pub extent: Extent,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum EventStatus {
    #[default]
    Ok,
    Busy,
    /// No upstream client has data in the range
    NoUserData,
    Failed,
}

/// The upstream raid group's answer to an [`Event`]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EventReply {
    pub status: EventStatus,
    pub deny: bool,
    /// For a permit request, how many blocks of the range are not consumed
    pub unconsumed_blocks: BlockT,
    /// For a permit request, whether the range begins in consumed space
    pub start_consumed: bool,
}

impl EventReply {
    pub fn ok() -> Self {
        EventReply {
            start_consumed: true,
            ..Default::default()
        }
    }

    pub fn with_status(status: EventStatus) -> Self {
        EventReply { status, ..Self::ok() }
    }

    pub fn denied() -> Self {
        EventReply { deny: true, ..Self::ok() }
    }
}

/// The raid group that consumes this virtual drive
#[cfg_attr(test, automock)]
pub trait Upstream: Send + Sync {
    fn send_event(&self, event: Event) -> BoxFut<EventReply>;

    /// Set or clear the degraded-needs-rebuild path attribute on every
    /// upstream edge.
    fn set_path_attr_degraded_needs_rebuild(&self, set: bool);

    /// Shrink a range so that it lies within a single upstream client.
    /// Returns `None` if no change is needed.
    fn limit_to_one_client(&self, lba: LbaT, blocks: BlockT)
        -> Option<BlockT>;
}

/// Progress of a single rebuild request
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RebuildState {
    #[default]
    Unknown,
    /// Waiting on upstream permission
    Permit,
    RebuildIo,
    /// The range is unconsumed and its needs-rebuild bits are being cleared
    ClearNeedsRebuild,
}

/// State of one in-flight rebuild request
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RebuildContext {
    /// Physical (per-disk) start
    pub start_lba: LbaT,
    pub block_count: BlockT,
    /// Positions being rebuilt
    pub positions: u16,
    /// Upstream client that owns the range, if known
    pub lun_id: ObjectId,
    pub state: RebuildState,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IoOutcome {
    Success,
    MediaError,
    Failed,
}

/// The mirror I/O engine beneath the virtual drive
#[cfg_attr(test, automock)]
pub trait RebuildIo: Send + Sync {
    /// Issue one rebuild request.  With `break_context`, the request is
    /// queued rather than run on the caller's thread.
    fn rebuild(&self, ctx: RebuildContext, break_context: bool)
        -> BoxFut<IoOutcome>;

    /// Clear the needs-rebuild bits for the range without copying it
    fn clear_needs_rebuild(&self, ctx: RebuildContext) -> BoxFut<Result<()>>;

    fn abort_stripe_locks(&self);
    fn abort_paged(&self);
    fn abort_monitor_ops(&self);
}

/// Progress of a data reconstruction, as reported to drives
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReconstructionState {
    Start,
    InProgress,
    End,
}

/// Notifications sent to other objects
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Notification {
    DataReconstruction {
        state: ReconstructionState,
        percent: u32,
    },
    SwapInfo {
        orig_pvd: ObjectId,
        spare_pvd: ObjectId,
        command: SwapCommand,
        vd: ObjectId,
    },
}

#[cfg_attr(test, automock)]
pub trait Notifier: Send + Sync {
    fn send(&self, object_id: ObjectId, notification: Notification)
        -> Result<()>;

    /// Tell a provisioned drive how much of it has been rebuilt
    fn set_percent_rebuilt(&self, pvd: ObjectId, percent: u32)
        -> BoxFut<Result<()>>;
}

/// Event log message codes
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, IntoPrimitive, PartialEq)]
#[repr(u32)]
pub enum EventCode {
    SpareNoSparesAvailable = 0x0001,
    SpareNoSuitableSpareAvailable = 0x0002,
    SpareRaidGroupIsBroken = 0x0101,
    SwapFailedRaidGroupDenied = 0x0102,
    CopyRaidGroupDegraded = 0x0103,
    RaidGroupHasCopyInProgress = 0x0104,
    CopySourceDriveDegraded = 0x0105,
    CopySourceDriveRemoved = 0x0106,
    CopyDestinationDriveRemoved = 0x0107,
    SwapAbortCopyRequestDenied = 0x0108,
    PermanentSpareRequestDenied = 0x0109,
    ProactiveSpareRequestDenied = 0x010a,
    UserCopyRequestDenied = 0x010b,
    CopyCompleted = 0x0201,
    #[num_enum(default)]
    Unknown = 0xffff,
}

impl EventCode {
    /// Is this a warning, rather than an error or informational message?
    pub fn is_warning(self) -> bool {
        u32::from(self) < 0x100
    }
}

/// One event log entry
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EventLogEntry {
    pub code: EventCode,
    pub vd: ObjectId,
    pub orig_pvd: ObjectId,
    pub spare_pvd: ObjectId,
    /// Where the drive the message is about lives
    pub location: DriveLocation,
    /// For copy messages, where the destination drive lives
    pub dest_location: Option<DriveLocation>,
}

#[cfg_attr(test, automock)]
pub trait EventLog: Send + Sync {
    fn write(&self, entry: EventLogEntry) -> Result<()>;
}

/// Monitor conditions that the scheduler runs on the virtual drive's behalf
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Condition {
    NeedReplacementDrive,
    EvaluateDownstreamHealth,
    NeedProactiveSpare,
    StartUserCopy,
    SwapInEdge,
    SwapOutEdge,
    CopyComplete,
    AbortCopy,
    SwapOperationComplete,
    CopyFailedSetRebuildCheckpointToEndMarker,
    BackgroundMonitorOperation,
    IsCopyComplete,
    FailCheckDownstreamHealth,
    ClearNoSpareReported,
    /// Persist a no-spare report that so far is only recorded in memory
    SetNoSpareReported,
    ReportCopyDenied,
    CheckPowerSavings,
    Quiesce,
    Unquiesce,
    ConfigurationChange,
    SetRebuildCheckpointToEndMarker,
    DestDriveFailedSetRebuildCheckpointToEndMarker,
    EvalMarkNr,
    EdgeChangeDuringHibernation,
    JoinSync,
    /// No usable edge remains; the raid group fails until a drive returns
    DownstreamHealthBroken,
    /// An edge is disabled; the raid group drains I/O
    DownstreamHealthDisabled,
    EvalRebuildLogging,
}

impl Condition {
    /// Does the virtual drive run this condition itself?  The rest belong to
    /// the generic raid group.
    pub fn is_virtual_drive_condition(self) -> bool {
        matches!(self,
            Condition::EvaluateDownstreamHealth |
            Condition::NeedReplacementDrive |
            Condition::NeedProactiveSpare |
            Condition::StartUserCopy |
            Condition::SwapInEdge |
            Condition::SwapOutEdge |
            Condition::CopyComplete |
            Condition::IsCopyComplete |
            Condition::AbortCopy |
            Condition::SwapOperationComplete |
            Condition::ConfigurationChange |
            Condition::SetRebuildCheckpointToEndMarker |
            Condition::DestDriveFailedSetRebuildCheckpointToEndMarker |
            Condition::CopyFailedSetRebuildCheckpointToEndMarker |
            Condition::FailCheckDownstreamHealth |
            Condition::ClearNoSpareReported |
            Condition::SetNoSpareReported |
            Condition::ReportCopyDenied |
            Condition::CheckPowerSavings |
            Condition::BackgroundMonitorOperation)
    }
}

/// The lifecycle scheduler
#[cfg_attr(test, automock)]
pub trait Scheduler: Send + Sync {
    fn set_condition(&self, cond: Condition);
    /// Clear a condition, even if it is currently running
    fn clear_condition(&self, cond: Condition);
    /// Run the monitor again after `delay`
    fn reschedule(&self, delay: Duration);
}

// LCOV_EXCL_STOP
