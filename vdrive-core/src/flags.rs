// vim: tw=80
//! Transient, in-memory virtual drive flags
//!
//! These are never persisted.  A restart or failover starts with all of them
//! clear.

use bitfield::bitfield;
use tracing::error;

bitfield! {
    /// Transient virtual drive conditions
    #[derive(Clone, Copy, Default, Eq, PartialEq)]
    pub struct VdFlags(u32);
    impl Debug;
    /// A swap request has been submitted and not yet finished
    pub swap_request_in_progress, set_swap_request_in_progress: 0;
    /// A swap-in of an edge is underway
    pub swap_in_edge, set_swap_in_edge: 1;
    /// Cleanup for the current swap request has already run
    pub cleanup_swap_request, set_cleanup_swap_request: 2;
    /// The job service does not want operation confirmations
    pub confirmation_disabled, set_confirmation_disabled: 3;
    pub user_copy_started, set_user_copy_started: 4;
    pub user_copy_denied, set_user_copy_denied: 5;
    /// The scheduler gave up waiting for a downstream edge to attach
    pub attach_edge_timedout, set_attach_edge_timedout: 6;
    /// A no-spare warning has been logged since the last success
    pub no_spare_reported, set_no_spare_reported: 7;
    pub spare_request_denied, set_spare_request_denied: 8;
    pub proactive_request_denied, set_proactive_request_denied: 9;
    pub raid_group_broken_reported, set_raid_group_broken_reported: 10;
    pub raid_group_denied_reported, set_raid_group_denied_reported: 11;
    pub raid_group_degraded_reported, set_raid_group_degraded_reported: 12;
    pub copy_in_progress_reported, set_copy_in_progress_reported: 13;
    pub copy_source_drive_degraded, set_copy_source_drive_degraded: 14;
    pub abort_copy_request_denied, set_abort_copy_request_denied: 15;
    /// Upstream asked us to abort the in-progress copy
    pub request_abort_copy, set_request_abort_copy: 16;
    /// A mark-for-verify event is outstanding for a media error
    pub copy_mark_verify_in_progress, set_copy_mark_verify_in_progress: 17;
    pub u8, operation_complete_bits, set_operation_complete_bits: 23, 18;
}

impl VdFlags {
    /// Clear all of the one-shot "already reported" flags that are tied to
    /// the need-replacement-drive timer.
    pub fn clear_replacement_reports(&mut self) {
        self.set_no_spare_reported(false);
        self.set_spare_request_denied(false);
        self.set_raid_group_broken_reported(false);
        self.set_raid_group_denied_reported(false);
        self.set_raid_group_degraded_reported(false);
    }

    /// Clear the one-shot flags that are tied to the need-proactive-copy
    /// timer.  A permanent spare denial stays reported.
    pub fn clear_proactive_reports(&mut self) {
        self.set_no_spare_reported(false);
        self.set_proactive_request_denied(false);
        self.set_raid_group_broken_reported(false);
        self.set_raid_group_denied_reported(false);
        self.set_raid_group_degraded_reported(false);
        self.set_copy_in_progress_reported(false);
        self.set_copy_source_drive_degraded(false);
    }

    /// Is any operation-complete bit set?
    pub fn any_operation_complete(&self) -> bool {
        self.operation_complete_bits() != 0
    }

    pub fn operation_complete(&self) -> Option<OperationComplete> {
        OperationComplete::from_bits(self.operation_complete_bits())
    }

    /// Record that a step of the current swap operation is done.
    ///
    /// The bits are mutually exclusive, so any previously set bit is dropped.
    pub fn mark_operation_complete(&mut self, op: OperationComplete) {
        if self.any_operation_complete() {
            error!(bits = self.operation_complete_bits(), ?op,
                "operation complete already set; replacing");
        }
        self.set_operation_complete_bits(op.bit());
    }

    pub fn clear_operation_complete(&mut self) {
        self.set_operation_complete_bits(0);
    }
}

/// Steps of a swap operation that are reported back to the job service
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperationComplete {
    SwapInEdge,
    SwapOut,
    ChangeConfigMode,
    CopyCompleteSetCheckpoint,
    CopyFailedSetCheckpoint,
    OptimalCompleteCopy,
}

impl OperationComplete {
    const ALL: [OperationComplete; 6] = [
        OperationComplete::SwapInEdge,
        OperationComplete::SwapOut,
        OperationComplete::ChangeConfigMode,
        OperationComplete::CopyCompleteSetCheckpoint,
        OperationComplete::CopyFailedSetCheckpoint,
        OperationComplete::OptimalCompleteCopy,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    fn from_bits(bits: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.bit() == bits)
    }
}

// LCOV_EXCL_STOP
