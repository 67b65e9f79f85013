// vim: tw=80
//! Swap orchestration
//!
//! Debounces drive failures, builds swap requests for the job service,
//! answers the job service's validation callbacks, and cleans up once the job
//! service reports the outcome.  At most one swap request is in flight at a
//! time.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config_mode::ConfigMode,
    edge::PathState,
    flags::{OperationComplete, VdFlags},
    services::*,
    types::*,
    validation::*,
    virtual_drive::VirtualDrive,
};

type FlagGet = fn(&VdFlags) -> bool;
type FlagSet = fn(&mut VdFlags, bool);

/// The event logged, only once, when the job service refuses a spare or copy
fn refusal_report(status: JobError) -> Option<(EventCode, FlagGet, FlagSet)> {
    let r: (EventCode, FlagGet, FlagSet) = match status {
        JobError::PresentlyNoSpares => (EventCode::SpareNoSparesAvailable,
            VdFlags::no_spare_reported, VdFlags::set_no_spare_reported),
        JobError::NoSuitableSpare => (EventCode::SpareNoSuitableSpareAvailable,
            VdFlags::no_spare_reported, VdFlags::set_no_spare_reported),
        JobError::RaidGroupBroken => (EventCode::SpareRaidGroupIsBroken,
            VdFlags::raid_group_broken_reported,
            VdFlags::set_raid_group_broken_reported),
        JobError::RaidGroupDenied => (EventCode::SwapFailedRaidGroupDenied,
            VdFlags::raid_group_denied_reported,
            VdFlags::set_raid_group_denied_reported),
        JobError::RaidGroupDegraded => (EventCode::CopyRaidGroupDegraded,
            VdFlags::raid_group_degraded_reported,
            VdFlags::set_raid_group_degraded_reported),
        JobError::HasCopyInProgress => (EventCode::RaidGroupHasCopyInProgress,
            VdFlags::copy_in_progress_reported,
            VdFlags::set_copy_in_progress_reported),
        JobError::SourceDriveDegraded => (EventCode::CopySourceDriveDegraded,
            VdFlags::copy_source_drive_degraded,
            VdFlags::set_copy_source_drive_degraded),
        _ => return None
    };
    Some(r)
}

/// The job service's report that a swap request has finished
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SwapCompletion {
    pub command: SwapCommand,
    pub swap_idx: EdgeIndex,
    pub status: JobError,
    /// If set, cleanup runs later from the monitor.  Otherwise it runs
    /// immediately.
    pub operation_confirmation: bool,
}

/// A request from the job service to validate one step of a swap
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SwapValidation {
    pub command: SwapCommand,
    pub swap_idx: EdgeIndex,
    pub confirmation_enabled: bool,
}

impl VirtualDrive {
    pub fn set_need_replacement_drive_start_time(&mut self) {
        if self.timers.need_replacement_drive.is_running() {
            debug!(vd = self.id, "need-replacement timer already running");
        }
        self.timers.need_replacement_drive.start();
    }

    /// Stop the need-replacement timer and forget what has been reported
    /// about it.
    pub fn clear_need_replacement_drive_start_time(&mut self) {
        self.timers.need_replacement_drive.stop();
        self.flags.clear_replacement_reports();
    }

    /// Restart the need-replacement debounce from now.
    pub fn reset_need_replacement_drive_start_time(&mut self) -> Result<()> {
        self.timers.need_replacement_drive.restart()
    }

    pub fn need_replacement_drive_start_time(&self) -> Result<Instant> {
        self.timers.need_replacement_drive.started_at()
    }

    pub fn set_need_proactive_copy_start_time(&mut self) {
        if self.timers.need_proactive_copy.is_running() {
            debug!(vd = self.id, "proactive-copy timer already running");
        }
        self.timers.need_proactive_copy.start();
    }

    pub fn clear_need_proactive_copy_start_time(&mut self) {
        self.timers.need_proactive_copy.stop();
        self.flags.clear_proactive_reports();
    }

    pub fn reset_need_proactive_copy_start_time(&mut self) -> Result<()> {
        self.timers.need_proactive_copy.restart()
    }

    pub fn need_proactive_copy_start_time(&self) -> Result<Instant> {
        self.timers.need_proactive_copy.started_at()
    }

    /// Has a drive been missing long enough to ask for a permanent spare?
    ///
    /// A drive that has definitively faulted only needs the short drive-fault
    /// debounce.  One that merely disappeared must stay gone for the full
    /// trigger time, in case it comes back.
    pub fn check_if_permanent_sparing_can_start(&mut self) -> Result<bool> {
        if !self.flags.attach_edge_timedout() &&
            self.is_downstream_drive_broken()
        {
            let debounce = self.config.drive_fault_debounce();
            let timer = &mut self.timers.drive_fault;
            if !timer.is_running() {
                debug!(vd = self.id, "drive fault detected");
                timer.start();
                return Ok(false);
            }
            if timer.expired(debounce)? {
                timer.stop();
                return Ok(true);
            }
            return Ok(false);
        }
        self.timers.drive_fault.stop();
        let trigger = self.config.permanent_spare_trigger();
        self.timers.need_replacement_drive.expired(trigger)
    }

    /// Has a failed mirror edge been gone long enough to swap it out?
    pub fn check_if_swap_out_can_start(&mut self) -> Result<bool> {
        self.check_if_permanent_sparing_can_start()
    }

    /// Has a drive been End-Of-Life long enough to ask for a proactive copy?
    pub fn check_if_proactive_copy_can_start(&self) -> Result<bool> {
        self.timers.need_proactive_copy
            .expired(self.config.proactive_copy_trigger())
    }

    /// May this controller ask for a replacement drive now?
    ///
    /// Only the active controller asks.  If the peer is alive it must also
    /// have noticed the failure, unless only a mirror's destination failed.
    pub fn can_initiate_replacement_request(&self) -> bool {
        if !self.rg.active {
            return false;
        }
        let mode = self.mode();
        let dest_failed = mode.secondary()
            .filter(|_| mode.is_mirror())
            .map(|e| self.rg.path_state(e) != PathState::Enabled)
            .unwrap_or(false);
        let peer = self.rg.peer;
        if peer.alive && peer.lifecycle == LifecycleState::Ready &&
            !(mode.is_mirror() && dest_failed)
        {
            debug!(vd = self.id, %mode, "waiting for the peer");
            return false;
        }
        true
    }

    pub fn can_initiate_proactive_copy_request(&self) -> bool {
        if !self.rg.active || !self.mode().is_pass_thru() {
            return false;
        }
        self.mode().primary()
            .map(|e| self.edge(e).is_enabled())
            .unwrap_or(false)
    }

    /// Build a swap request and hand it to the job service.
    ///
    /// Returns `MoreProcessing` once the request is queued; the outcome
    /// arrives through
    /// [`handle_swap_request_completion`](Self::handle_swap_request_completion).
    #[instrument(skip(self), fields(vd = self.id))]
    pub fn initiate_swap_operation(&mut self, swap_idx: EdgeIndex,
                                   mirror_idx: Option<EdgeIndex>,
                                   command: SwapCommand) -> Result<Status>
    {
        if !self.rg.active {
            debug!(vd = self.id, "passive side doesn't initiate swaps");
            return Ok(Status::Done);
        }
        if self.flags.swap_request_in_progress() {
            error!(vd = self.id, %command, "a swap request is in progress");
            return Err(Error::SwapInProgress);
        }
        if !matches!(command, SwapCommand::ProactiveCopy |
                     SwapCommand::PermanentSpare | SwapCommand::CompleteCopy |
                     SwapCommand::AbortCopy)
        {
            error!(vd = self.id, %command, "unsupported swap command");
            return Err(Error::GenericFailure);
        }
        if self.flags.any_operation_complete() {
            error!(vd = self.id, bits = self.flags.operation_complete_bits(),
                   "stale operation-complete flags");
            self.flags.clear_operation_complete();
        }
        let request = SwapRequest {
            vd_id: self.id,
            swap_idx,
            mirror_idx,
            orig_pvd: self.orig_pvd,
            command,
            is_proactive_copy: command == SwapCommand::ProactiveCopy,
            operation_confirmation: self.config.operation_confirmation,
        };
        self.flags.set_swap_request_in_progress(true);
        self.rg.clustered.set_swap_job_in_progress(true);
        if let Err(e) = self.services.jobs.submit_swap(request) {
            error!(vd = self.id, error = ?e, "job submission failed");
            self.flags.set_swap_request_in_progress(false);
            self.rg.clustered.set_swap_job_in_progress(false);
            return Err(e);
        }
        info!(vd = self.id, %command, edge = %swap_idx, ?mirror_idx,
              "swap request submitted");
        Ok(Status::MoreProcessing)
    }

    /// Ask for a permanent spare to replace the failed pass-thru edge.
    pub fn request_permanent_spare(&mut self) -> Result<Status> {
        let Some(swap_idx) = self.get_permanent_spare_edge_index() else {
            error!(vd = self.id, mode = %self.mode(), "no edge to spare");
            return Err(Error::InvalidConfigMode);
        };
        self.initiate_swap_operation(swap_idx, None,
                                     SwapCommand::PermanentSpare)
    }

    /// Ask for a proactive spare to be swapped in next to the End-Of-Life
    /// edge.
    pub fn request_proactive_copy(&mut self) -> Result<Status> {
        match (self.check_if_proactive_spare_needed(), self.mode().primary()) {
            ((true, Some(swap_in)), Some(source)) =>
                self.initiate_swap_operation(swap_in, Some(source),
                                             SwapCommand::ProactiveCopy),
            _ => {
                debug!(vd = self.id, "proactive copy not needed");
                Ok(Status::Done)
            }
        }
    }

    /// Ask for the appropriate edge of a mirror to be swapped out.
    pub fn request_swap_out(&mut self, command: SwapCommand)
        -> Result<Status>
    {
        match self.get_swap_out_edge_index()? {
            Some(e) => self.initiate_swap_operation(e, Some(e.other()),
                                                    command),
            None => {
                debug!(vd = self.id, %command, "nothing to swap out");
                Ok(Status::Done)
            }
        }
    }

    /// The drive to name as "original" in event log entries
    fn original_pvd_for_logging(&self) -> ObjectId {
        if self.orig_pvd != OBJECT_ID_INVALID {
            self.orig_pvd
        } else {
            self.mode().primary()
                .map(|e| self.rg.server_id(e))
                .unwrap_or(OBJECT_ID_INVALID)
        }
    }

    pub(crate) fn write_event_log(&self, code: EventCode, orig_pvd: ObjectId,
                                  spare_pvd: ObjectId) -> Result<()>
    {
        let primary = self.mode().primary().unwrap_or(EdgeIndex::First);
        let entry = EventLogEntry {
            code,
            vd: self.id,
            orig_pvd,
            spare_pvd,
            location: self.edge(primary).location,
            dest_location: None,
        };
        if code.is_warning() {
            warn!(vd = self.id, ?code, orig_pvd, spare_pvd, "event log");
        } else {
            info!(vd = self.id, ?code, orig_pvd, spare_pvd, "event log");
        }
        self.services.event_log.write(entry)
    }

    /// Log a job service refusal, unless it was already logged.
    fn report_refusal_once(&mut self, status: JobError) -> Result<()> {
        let Some((code, reported, set_reported)) = refusal_report(status)
        else {
            return Ok(());
        };
        let no_spare = matches!(status, JobError::PresentlyNoSpares |
                                JobError::NoSuitableSpare);
        if reported(&self.flags) || (no_spare &&
                                     self.has_no_spare_been_reported())
        {
            return Ok(());
        }
        let orig = self.original_pvd_for_logging();
        self.write_event_log(code, orig, OBJECT_ID_INVALID)?;
        set_reported(&mut self.flags, true);
        if no_spare {
            // The persistent copy is written from the monitor
            self.services.scheduler
                .set_condition(Condition::SetNoSpareReported);
        }
        Ok(())
    }

    fn rearm_need_replacement_timer(&mut self) {
        if self.reset_need_replacement_drive_start_time().is_err() {
            debug!(vd = self.id, "need-replacement timer is not running");
        }
    }

    fn rearm_proactive_copy_timer(&mut self) {
        if self.reset_need_proactive_copy_start_time().is_err() {
            debug!(vd = self.id, "proactive-copy timer is not running");
        }
    }

    fn handle_permanent_spare_completion(&mut self, command: SwapCommand,
                                         status: JobError) -> Result<()>
    {
        self.flags.set_swap_in_edge(false);
        if command != SwapCommand::PermanentSpare {
            error!(vd = self.id, %command, "expected a permanent spare");
            return Err(Error::GenericFailure);
        }
        match status {
            JobError::NoError => self.clear_need_replacement_drive_start_time(),
            JobError::PresentlyNoSpares | JobError::NoSuitableSpare => {
                self.report_refusal_once(status)?;
            }
            JobError::RaidGroupBroken | JobError::RaidGroupDenied |
            JobError::RaidGroupDegraded => {
                self.rearm_need_replacement_timer();
                self.report_refusal_once(status)?;
            }
            JobError::PermanentSpareNotRequired |
            JobError::InvalidOriginalObjectId => {
                debug!(vd = self.id, ?status, "permanent spare race");
                self.clear_need_replacement_drive_start_time();
            }
            JobError::SpareRaidGroupUnconsumed =>
                self.rearm_need_replacement_timer(),
            JobError::HasCopyInProgress | JobError::SourceDriveDegraded |
            JobError::ProactiveSpareNotRequired |
            JobError::VirtualDriveBroken | JobError::InvalidSwapCommand |
            JobError::UpstreamDenied | JobError::Internal => {
                error!(vd = self.id, ?status,
                       "unexpected permanent spare status");
                self.clear_need_replacement_drive_start_time();
                return Err(Error::GenericFailure);
            }
        }
        Ok(())
    }

    fn handle_proactive_copy_completion(&mut self, command: SwapCommand,
                                        status: JobError) -> Result<()>
    {
        self.flags.set_swap_in_edge(false);
        if command != SwapCommand::ProactiveCopy {
            error!(vd = self.id, %command, "expected a proactive copy");
            return Err(Error::GenericFailure);
        }
        match status {
            JobError::NoError => {
                self.clear_need_proactive_copy_start_time();
                self.rg.attributes.proactive_sparing = true;
            }
            JobError::PresentlyNoSpares | JobError::NoSuitableSpare |
            JobError::RaidGroupBroken | JobError::RaidGroupDenied |
            JobError::RaidGroupDegraded | JobError::HasCopyInProgress |
            JobError::SourceDriveDegraded => {
                self.rearm_proactive_copy_timer();
                self.report_refusal_once(status)?;
                self.services.scheduler
                    .set_condition(Condition::NeedReplacementDrive);
            }
            JobError::ProactiveSpareNotRequired |
            JobError::VirtualDriveBroken |
            JobError::InvalidOriginalObjectId => {
                debug!(vd = self.id, ?status, "proactive copy race");
                self.clear_need_proactive_copy_start_time();
            }
            JobError::SpareRaidGroupUnconsumed =>
                self.rearm_proactive_copy_timer(),
            JobError::PermanentSpareNotRequired |
            JobError::InvalidSwapCommand | JobError::UpstreamDenied |
            JobError::Internal => {
                error!(vd = self.id, ?status,
                       "unexpected proactive copy status");
                self.clear_need_proactive_copy_start_time();
                return Err(Error::GenericFailure);
            }
        }
        Ok(())
    }

    /// Finish a swap request after the job service reports its outcome.
    ///
    /// Runs at most once per request.  A second call is traced and ignored.
    #[instrument(skip(self), fields(vd = self.id))]
    pub fn swap_completion_cleanup(&mut self) -> Result<()> {
        if self.flags.cleanup_swap_request() {
            error!(vd = self.id, "swap request already cleaned up");
            return Ok(());
        }
        self.flags.set_cleanup_swap_request(true);
        let status = self.job_status;
        let command = self.copy_request_type;
        if status != JobError::NoError {
            for cond in [Condition::SwapInEdge, Condition::SwapOutEdge,
                         Condition::ConfigurationChange,
                         Condition::SetRebuildCheckpointToEndMarker,
                         Condition::DestDriveFailedSetRebuildCheckpointToEndMarker]
            {
                self.services.scheduler.clear_condition(cond);
            }
        }
        let r = match command {
            SwapCommand::PermanentSpare =>
                self.handle_permanent_spare_completion(command, status),
            SwapCommand::ProactiveCopy =>
                self.handle_proactive_copy_completion(command, status),
            SwapCommand::UserCopy | SwapCommand::UserCopyTo => Ok(()),
            SwapCommand::CompleteCopy | SwapCommand::AbortCopy => {
                self.rg.attributes.proactive_sparing = false;
                if command == SwapCommand::CompleteCopy &&
                    status == JobError::NoError
                {
                    self.services.scheduler
                        .set_condition(Condition::CopyComplete);
                }
                if self.lifecycle() == LifecycleState::Ready {
                    self.services.scheduler
                        .set_condition(Condition::EvaluateDownstreamHealth);
                }
                Ok(())
            }
            SwapCommand::Invalid => {
                error!(vd = self.id, ?status, "no swap command to clean up");
                Err(Error::GenericFailure)
            }
        };
        self.rg.clustered.set_swap_job_in_progress(false);
        if self.rg.local_state.is_join_in_progress() {
            self.services.scheduler.set_condition(Condition::JoinSync);
        }
        info!(vd = self.id, %command, ?status, "swap request cleaned up");
        r
    }

    /// Accept the job service's report that a swap request has finished.
    #[instrument(skip(self), fields(vd = self.id))]
    pub fn handle_swap_request_completion(&mut self, c: SwapCompletion)
        -> Result<()>
    {
        if c.command.is_user_copy() && !self.flags.confirmation_disabled() &&
            !self.flags.user_copy_started()
        {
            if c.status == JobError::NoError {
                error!(vd = self.id, "user copy succeeded but never started");
                return Err(Error::GenericFailure);
            }
            debug!(vd = self.id, status = ?c.status,
                   "user copy failed before it started");
            return Ok(());
        }
        if !self.flags.swap_request_in_progress() &&
            (c.status == JobError::NoError || !c.command.is_user_copy())
        {
            error!(vd = self.id, command = %c.command,
                   "completion without a swap request in progress");
            return Err(Error::GenericFailure);
        }
        self.job_status = c.status;
        self.copy_request_type = c.command;
        if c.command.is_swap_in() {
            self.swap_in_edge = Some(c.swap_idx);
        } else {
            self.swap_out_edge = Some(c.swap_idx);
        }
        if !c.operation_confirmation {
            let r = self.swap_completion_cleanup();
            self.flags.set_cleanup_swap_request(false);
            return r;
        }
        self.services.scheduler.set_condition(Condition::SwapOperationComplete);
        self.services.scheduler.reschedule(Duration::ZERO);
        Ok(())
    }

    /// The job service's final acknowledgement of a swap request
    pub fn swap_command_complete(&mut self) {
        if !self.flags.swap_request_in_progress() {
            if self.copy_request_type.is_user_copy() {
                debug!(vd = self.id, "user copy completed before it started");
            } else {
                warn!(vd = self.id, command = %self.copy_request_type,
                      "swap command complete without a request");
            }
        }
        self.flags.set_confirmation_disabled(false);
        self.flags.clear_operation_complete();
        self.flags.set_swap_request_in_progress(false);
        self.flags.set_user_copy_started(false);
        self.flags.set_cleanup_swap_request(false);
        self.rg.clustered.set_swap_job_in_progress(false);
        info!(vd = self.id, command = %self.copy_request_type,
              "swap command complete");
    }

    /// A user copy was accepted by the job service and is starting.
    pub fn start_user_copy(&mut self) {
        if self.flags.any_operation_complete() {
            error!(vd = self.id, bits = self.flags.operation_complete_bits(),
                   "stale operation-complete flags");
            self.flags.clear_operation_complete();
        }
        self.flags.set_swap_request_in_progress(true);
        self.rg.clustered.set_swap_job_in_progress(true);
        if !self.flags.confirmation_disabled() {
            self.flags.set_user_copy_started(true);
        }
        info!(vd = self.id, command = %self.copy_request_type,
              "user copy started");
    }

    /// The job service asks for a user copy to begin.
    ///
    /// Without operation confirmation the copy starts now.  Otherwise the
    /// monitor starts it.
    #[instrument(skip(self), fields(vd = self.id))]
    pub fn initiate_user_copy(&mut self, command: SwapCommand,
                              operation_confirmation: bool) -> Result<()>
    {
        if !command.is_user_copy() {
            error!(vd = self.id, %command, "not a user copy");
            return Err(Error::GenericFailure);
        }
        self.copy_request_type = command;
        if !operation_confirmation {
            warn!(vd = self.id, %command, "confirmation disabled");
            self.flags.set_confirmation_disabled(true);
            self.start_user_copy();
            return Ok(());
        }
        self.services.scheduler.set_condition(Condition::StartUserCopy);
        self.services.scheduler.reschedule(Duration::ZERO);
        Ok(())
    }

    /// The job service attached a new edge at `e`.
    pub fn swap_in_edge_attached(&mut self, e: EdgeIndex) {
        self.swap_in_edge = Some(e);
        self.services.scheduler.set_condition(Condition::SwapInEdge);
        if self.flags.swap_request_in_progress() {
            self.services.scheduler.reschedule(Duration::ZERO);
        }
    }

    /// The job service detached the edge at `e`.
    pub fn swap_out_edge_detached(&mut self, e: EdgeIndex) {
        self.swap_out_edge = Some(e);
        self.services.scheduler.set_condition(Condition::SwapOutEdge);
        if self.flags.swap_request_in_progress() {
            self.services.scheduler.reschedule(Duration::ZERO);
        }
    }

    /// A checkpoint request is only valid during a swap request, once.
    fn check_checkpoint_request(&self) -> Result<()> {
        if !self.flags.swap_request_in_progress() {
            error!(vd = self.id, "checkpoint request without a swap request");
            return Err(Error::FlagNotSet);
        }
        if matches!(self.flags.operation_complete(),
                    Some(OperationComplete::CopyCompleteSetCheckpoint |
                         OperationComplete::CopyFailedSetCheckpoint))
        {
            error!(vd = self.id, bits = self.flags.operation_complete_bits(),
                   "checkpoints already set");
            return Err(Error::GenericFailure);
        }
        Ok(())
    }

    /// The copy finished and the source is swapped out.  Ask the monitor to
    /// move the destination's checkpoint to the end marker.
    #[instrument(skip(self), fields(vd = self.id))]
    pub fn set_checkpoint_copy_complete(&mut self) -> Result<()> {
        self.check_checkpoint_request()?;
        self.services.scheduler
            .set_condition(Condition::SetRebuildCheckpointToEndMarker);
        Ok(())
    }

    /// The copy failed and an edge is swapped out.  Ask the monitor to fix
    /// up the checkpoints.
    ///
    /// A Ready drive lost its destination, so the raid group quiesces while
    /// the source's checkpoints are preserved.  Otherwise the checkpoints are
    /// simply updated.
    #[instrument(skip(self), fields(vd = self.id))]
    pub fn set_checkpoint_copy_failed(&mut self) -> Result<()> {
        self.check_checkpoint_request()?;
        let cond = if self.lifecycle() == LifecycleState::Ready {
            Condition::DestDriveFailedSetRebuildCheckpointToEndMarker
        } else {
            Condition::CopyFailedSetRebuildCheckpointToEndMarker
        };
        self.services.scheduler.set_condition(cond);
        Ok(())
    }

    /// Log that a swap-in request was refused.
    fn log_request_denied(&mut self, command: SwapCommand, status: SwapStatus)
        -> Result<()>
    {
        let (code, reported, set_reported): (EventCode, FlagGet, FlagSet) =
            match command
        {
            SwapCommand::PermanentSpare => (
                EventCode::PermanentSpareRequestDenied,
                VdFlags::spare_request_denied,
                VdFlags::set_spare_request_denied),
            SwapCommand::ProactiveCopy => (
                EventCode::ProactiveSpareRequestDenied,
                VdFlags::proactive_request_denied,
                VdFlags::set_proactive_request_denied),
            SwapCommand::UserCopy | SwapCommand::UserCopyTo => {
                let orig = self.original_pvd_for_logging();
                return self.write_event_log(EventCode::UserCopyRequestDenied,
                                            orig, OBJECT_ID_INVALID);
            }
            _ => {
                error!(vd = self.id, %command, %status, "swap-in refused");
                return Ok(());
            }
        };
        if reported(&self.flags) {
            return Ok(());
        }
        warn!(vd = self.id, %command, %status, "swap request denied");
        let orig = self.original_pvd_for_logging();
        let spare = self.mode().secondary()
            .map(|e| self.rg.server_id(e))
            .unwrap_or(OBJECT_ID_INVALID);
        self.write_event_log(code, orig, spare)?;
        set_reported(&mut self.flags, true);
        Ok(())
    }

    /// Validate a swap-in step on the job service's behalf.
    ///
    /// The outer `Result` reports a failure to reach a decision, such as a
    /// busy upstream raid group.  The inner one is the decision.
    #[instrument(skip(self), fields(vd = self.id))]
    pub async fn validate_swap_in_command(&mut self, req: SwapValidation)
        -> Result<SwapResult>
    {
        if !req.confirmation_enabled {
            self.flags.set_confirmation_disabled(true);
        }
        self.copy_request_type = req.command;
        let r = match req.command {
            SwapCommand::PermanentSpare =>
                self.validate_permanent_spare_request(req.command,
                                                      req.swap_idx),
            SwapCommand::ProactiveCopy =>
                self.validate_proactive_copy_request(req.command,
                                                     req.swap_idx),
            SwapCommand::UserCopy | SwapCommand::UserCopyTo => {
                match self.check_if_user_copy_is_allowed() {
                    Ok(()) => self.ask_user_copy_permission().await?,
                    Err(status) => Err(status)
                }
            }
            _ => Err(SwapStatus::UnsupportedCommand)
        };
        match r {
            Ok(()) => {
                self.swap_in_edge = Some(req.swap_idx);
                self.flags.set_swap_in_edge(true);
            }
            Err(SwapStatus::PermanentSpareNotRequired |
                SwapStatus::ProactiveSpareNotRequired |
                SwapStatus::UpstreamDeniedUserCopy) => (),
            Err(status) => self.log_request_denied(req.command, status)?,
        }
        Ok(r)
    }

    /// Validate a swap-out step on the job service's behalf.
    pub fn validate_swap_out_command(&mut self, req: SwapValidation)
        -> SwapResult
    {
        if !req.confirmation_enabled {
            self.flags.set_confirmation_disabled(true);
        }
        self.copy_request_type = req.command;
        match req.command {
            SwapCommand::CompleteCopy | SwapCommand::AbortCopy => {
                if self.validate_swap_out_request(req.swap_idx).is_err() {
                    return Err(SwapStatus::ConfigModeDoesntSupport);
                }
                self.swap_out_edge = Some(req.swap_idx);
                Ok(())
            }
            _ => Err(SwapStatus::UnsupportedCommand)
        }
    }

    /// Ask the upstream raid group whether a user copy may begin.
    pub async fn ask_user_copy_permission(&mut self) -> Result<SwapResult> {
        let event = Event {
            kind: EventKind::CopyRequest,
            extent: Extent::new(0, self.rg.exported_capacity()),
        };
        let reply = self.services.upstream.send_event(event).await;
        match reply.status {
            EventStatus::Ok => (),
            EventStatus::Busy => return Err(Error::Busy),
            status => {
                error!(vd = self.id, ?status, "copy request failed");
                return Err(Error::GenericFailure);
            }
        }
        if reply.deny {
            info!(vd = self.id, "upstream denied the user copy");
            if !self.flags.user_copy_denied() {
                self.services.scheduler
                    .set_condition(Condition::ReportCopyDenied);
                self.flags.set_user_copy_denied(true);
            }
            return Ok(Err(SwapStatus::UpstreamDeniedUserCopy));
        }
        self.flags.set_user_copy_denied(false);
        Ok(Ok(()))
    }

    /// Ask the upstream raid group whether an in-progress copy may be
    /// abandoned, leaving it degraded.  Denial is reported as `Busy`, so that
    /// the caller retries later.
    #[instrument(skip(self), fields(vd = self.id))]
    pub async fn ask_copy_abort_go_degraded_permission(&mut self)
        -> Result<()>
    {
        let event = Event {
            kind: EventKind::AbortCopyRequest,
            extent: Extent::new(0, self.rg.exported_capacity()),
        };
        let reply = self.services.upstream.send_event(event).await;
        let swap_out = self.get_swap_out_edge_index()?;
        let source_failed = swap_out.is_some() &&
            swap_out == self.mode().primary();
        self.flags.set_request_abort_copy(false);
        match reply.status {
            EventStatus::Ok => (),
            EventStatus::Busy => return Err(Error::Busy),
            status => {
                error!(vd = self.id, ?status, "abort copy request failed");
                return Err(Error::GenericFailure);
            }
        }
        let orig = self.original_pvd_for_logging();
        let spare = self.mode().secondary()
            .map(|e| self.rg.server_id(e))
            .unwrap_or(OBJECT_ID_INVALID);
        if !reply.deny {
            self.flags.set_abort_copy_request_denied(false);
            let code = if source_failed {
                EventCode::CopySourceDriveRemoved
            } else {
                EventCode::CopyDestinationDriveRemoved
            };
            self.write_event_log(code, orig, spare)?;
            return Ok(());
        }
        if !self.flags.abort_copy_request_denied() {
            self.write_event_log(EventCode::SwapAbortCopyRequestDenied, orig,
                                 spare)?;
            self.flags.set_abort_copy_request_denied(true);
        }
        Err(Error::Busy)
    }

    /// Begin a configuration mode change.
    ///
    /// Decides which swap command the change carries out, then asks the
    /// monitor to drain I/O, change the edge topology, and resume I/O, in
    /// that order.
    #[instrument(skip(self), fields(vd = self.id))]
    pub fn change_configuration_mode(&mut self) -> Result<()> {
        let current = self.mode();
        let new = self.pending_mode();
        if new == ConfigMode::Unknown {
            return Ok(());
        }
        if current == ConfigMode::Unknown {
            error!(vd = self.id, %new, "current mode is unknown");
            return Err(Error::InvalidConfigMode);
        }
        if current.is_pass_thru() && new.is_mirror() {
            self.set_swap_in_command(new)?;
        } else if current.is_mirror() && new.is_pass_thru() {
            self.set_swap_out_command(new)?;
        }
        let ready = self.lifecycle() == LifecycleState::Ready;
        let scheduler = &self.services.scheduler;
        if ready {
            scheduler.set_condition(Condition::Quiesce);
        }
        scheduler.set_condition(Condition::ConfigurationChange);
        if ready {
            scheduler.set_condition(Condition::Unquiesce);
        }
        info!(vd = self.id, %current, %new,
              command = %self.copy_request_type, "configuration change");
        Ok(())
    }

    /// On the passive side, infer the swap-in command from the new mode.
    fn set_swap_in_command(&mut self, new: ConfigMode) -> Result<()> {
        if !self.rg.active {
            let source = match new {
                ConfigMode::MirrorFirst => Some(EdgeIndex::First),
                ConfigMode::MirrorSecond => Some(EdgeIndex::Second),
                _ => None
            };
            if let Some(source) = source {
                if self.edge(source).is_eol() {
                    self.copy_request_type = SwapCommand::ProactiveCopy;
                } else if !self.copy_request_type.is_user_copy() {
                    self.copy_request_type = SwapCommand::UserCopyTo;
                }
            }
        }
        if self.copy_request_type == SwapCommand::Invalid {
            error!(vd = self.id, %new, "no swap-in command");
            return Err(Error::GenericFailure);
        }
        Ok(())
    }

    /// On the passive side, infer the swap-out command from the new mode.
    fn set_swap_out_command(&mut self, new: ConfigMode) -> Result<()> {
        let current = self.mode();
        let already = matches!(self.copy_request_type,
                               SwapCommand::CompleteCopy |
                               SwapCommand::AbortCopy);
        if !self.rg.active && !already {
            // The kept edge was the destination iff the copy completed
            let completed = match (current, new) {
                (ConfigMode::MirrorSecond, ConfigMode::PassThruFirst) =>
                    self.edge(EdgeIndex::First).is_enabled(),
                (ConfigMode::MirrorFirst, ConfigMode::PassThruSecond) =>
                    self.edge(EdgeIndex::Second).is_enabled(),
                _ => false
            };
            self.copy_request_type = if completed {
                SwapCommand::CompleteCopy
            } else {
                SwapCommand::AbortCopy
            };
        }
        if self.copy_request_type == SwapCommand::Invalid {
            error!(vd = self.id, %new, "no swap-out command");
            return Err(Error::GenericFailure);
        }
        Ok(())
    }

    /// Remember which drive was in place before a spare replaced it.
    pub fn save_original_pvd_object_id(&mut self) -> Result<()> {
        let Some(primary) = self.mode().primary() else {
            error!(vd = self.id, "save original pvd: unknown mode");
            return Err(Error::InvalidConfigMode);
        };
        let id = self.rg.server_id(primary);
        if id != OBJECT_ID_INVALID && id != self.orig_pvd {
            debug!(vd = self.id, orig_pvd = id, "original drive saved");
            self.orig_pvd = id;
        }
        Ok(())
    }

    /// Announce the swap that is in progress.
    pub fn send_swap_notification(&self) -> Result<()> {
        let (orig_pvd, spare_pvd) = match self.mode() {
            ConfigMode::MirrorFirst =>
                (self.rg.server_id(EdgeIndex::First),
                 self.rg.server_id(EdgeIndex::Second)),
            ConfigMode::MirrorSecond =>
                (self.rg.server_id(EdgeIndex::Second),
                 self.rg.server_id(EdgeIndex::First)),
            ConfigMode::PassThruFirst =>
                (self.orig_pvd, self.rg.server_id(EdgeIndex::First)),
            ConfigMode::PassThruSecond =>
                (self.orig_pvd, self.rg.server_id(EdgeIndex::Second)),
            ConfigMode::Unknown => {
                error!(vd = self.id, "swap notification: unknown mode");
                return Err(Error::InvalidConfigMode);
            }
        };
        let command = self.copy_request_type;
        if command == SwapCommand::Invalid {
            error!(vd = self.id, "swap notification without a command");
        }
        let n = Notification::SwapInfo {
            orig_pvd,
            spare_pvd,
            command,
            vd: self.id,
        };
        debug!(vd = self.id, orig_pvd, spare_pvd, %command,
               "swap notification");
        self.services.notifier.send(self.id, n)
    }

    /// Once a permanent spare is in place, report which drive it replaced.
    pub fn check_and_send_notification(&mut self) -> Result<()> {
        let spare = self.get_permanent_spare_edge_index()
            .map(|e| self.rg.server_id(e))
            .unwrap_or(OBJECT_ID_INVALID);
        if self.orig_pvd == OBJECT_ID_INVALID || self.orig_pvd == spare {
            return Ok(());
        }
        let saved = self.copy_request_type;
        self.copy_request_type = SwapCommand::PermanentSpare;
        let r = self.send_swap_notification();
        self.copy_request_type = saved;
        r
    }

    /// Tell the upstream raid group whether the live pass-thru edge still
    /// needs a rebuild, and persist the answer.
    pub async fn set_degraded_needs_rebuild_if_needed(&mut self)
        -> Result<()>
    {
        let degraded = self.mode().is_pass_thru() &&
            self.mode().primary()
                .map(|e| self.rg.checkpoint(e) != END_MARKER)
                .unwrap_or(false);
        self.services.upstream.set_path_attr_degraded_needs_rebuild(degraded);
        if degraded && !self.is_degraded_needs_rebuild() {
            info!(vd = self.id, "degraded, needs rebuild");
            self.set_degraded_needs_rebuild().await?;
        }
        Ok(())
    }

    /// Claim the raid group for a copy-complete swap, unless the peer is
    /// joining.
    pub fn set_copy_complete_in_progress_if_allowed(&mut self) -> bool {
        if self.rg.local_state.is_join_in_progress() {
            debug!(vd = self.id, "copy complete waits for the join");
            return false;
        }
        self.rg.clustered.set_swap_job_in_progress(true);
        true
    }

    /// Claim the raid group for an abort-copy swap, unless the peer has
    /// asked to join.
    pub fn set_abort_copy_in_progress_if_allowed(&mut self) -> bool {
        if self.rg.local_state.join_request() {
            debug!(vd = self.id, "abort copy waits for the join request");
            return false;
        }
        self.rg.clustered.set_swap_job_in_progress(true);
        true
    }
}

// LCOV_EXCL_STOP
