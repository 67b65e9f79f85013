// vim: tw=80
//! Monitor conditions
//!
//! Turns downstream health and edge state changes into lifecycle conditions,
//! and runs the virtual drive's own condition handlers when the scheduler
//! fires them.  Conditions that belong to the generic raid group, such as
//! quiesce or rebuild-logging evaluation, are only ever set here.

use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::{
    config_mode::ConfigMode,
    edge::{DownstreamHealth, PathState},
    flags::OperationComplete,
    services::*,
    types::*,
    virtual_drive::VirtualDrive,
};

/// How long to wait before rechecking health while neither controller is
/// active
const NOT_ACTIVE_RECHECK: Duration = Duration::from_secs(1);

impl VirtualDrive {
    fn set_condition(&self, cond: Condition) {
        self.services.scheduler.set_condition(cond);
    }

    fn clear_condition(&self, cond: Condition) {
        self.services.scheduler.clear_condition(cond);
    }

    /// Set whichever monitor conditions `health` calls for.
    #[instrument(skip(self), fields(vd = self.id))]
    pub fn set_condition_based_on_downstream_health(&mut self,
        health: DownstreamHealth) -> Result<()>
    {
        let r = match health {
            DownstreamHealth::Optimal => self.set_optimal_conditions(),
            DownstreamHealth::Degraded => self.set_degraded_conditions(),
            DownstreamHealth::Broken => {
                // Wait for the source drive to come back
                self.set_condition(Condition::DownstreamHealthBroken);
                Ok(())
            }
            DownstreamHealth::Disabled => {
                self.set_condition(Condition::DownstreamHealthDisabled);
                Ok(())
            }
        };
        // After the active controller dies, this one may not have been made
        // active yet.  Keep checking until it is.
        if matches!(health, DownstreamHealth::Optimal |
                    DownstreamHealth::Degraded) &&
            !self.rg.active && !self.rg.peer.alive
        {
            debug!(vd = self.id, %health, "not active and no peer; recheck");
            self.set_condition(Condition::EvaluateDownstreamHealth);
            self.services.scheduler.reschedule(NOT_ACTIVE_RECHECK);
        }
        r
    }

    fn set_optimal_conditions(&mut self) -> Result<()> {
        let mode = self.mode();
        let active = self.rg.active;
        let waiting = self.timers.need_replacement_drive.is_running();
        let in_progress = self.flags.swap_request_in_progress();
        match mode {
            ConfigMode::MirrorFirst | ConfigMode::MirrorSecond => {
                let complete = self.is_copy_complete();
                if waiting {
                    self.set_condition(Condition::NeedReplacementDrive);
                }
                if active && complete && !in_progress &&
                    self.flags.operation_complete() !=
                        Some(OperationComplete::OptimalCompleteCopy)
                {
                    self.flags.mark_operation_complete(
                        OperationComplete::OptimalCompleteCopy);
                    self.set_condition(Condition::IsCopyComplete);
                }
                // An End-Of-Life destination won't finish the copy
                if active && !complete && !self.is_secondary_edge_healthy() {
                    self.set_condition(Condition::IsCopyComplete);
                }
            }
            ConfigMode::PassThruFirst | ConfigMode::PassThruSecond => {
                if waiting {
                    self.set_condition(Condition::NeedReplacementDrive);
                }
                if active && !in_progress {
                    self.set_condition(Condition::SwapOutEdge);
                }
            }
            ConfigMode::Unknown => {
                error!(vd = self.id, "optimal health: unknown mode");
                return Err(Error::InvalidConfigMode);
            }
        }
        Ok(())
    }

    fn set_degraded_conditions(&mut self) -> Result<()> {
        match self.mode() {
            ConfigMode::MirrorFirst | ConfigMode::MirrorSecond =>
                self.set_degraded_mirror_conditions(),
            ConfigMode::PassThruFirst | ConfigMode::PassThruSecond =>
                self.set_degraded_pass_thru_conditions(),
            ConfigMode::Unknown => {
                error!(vd = self.id, "degraded health: unknown mode");
                Err(Error::InvalidConfigMode)
            }
        }
    }

    fn set_degraded_mirror_conditions(&mut self) -> Result<()> {
        let Some(dest) = self.mode().secondary() else {
            return Err(Error::InvalidConfigMode);
        };
        let first = *self.edge(EdgeIndex::First);
        let second = *self.edge(EdgeIndex::Second);
        if first.is_enabled() && second.is_enabled() {
            if first.is_eol() && second.is_eol() {
                self.set_condition(Condition::AbortCopy);
            } else {
                self.set_condition(Condition::EvalMarkNr);
            }
            return Ok(());
        }
        let dest_failed = !self.edge(dest).is_enabled();
        if self.timers.need_replacement_drive.is_running() || dest_failed {
            self.set_condition(Condition::NeedReplacementDrive);
        }
        self.set_condition(Condition::EvalRebuildLogging);
        Ok(())
    }

    fn set_degraded_pass_thru_conditions(&mut self) -> Result<()> {
        if self.lifecycle() != LifecycleState::Ready {
            debug!(vd = self.id, lifecycle = ?self.lifecycle(),
                   "degraded pass-thru: not ready");
            self.set_condition(Condition::EvaluateDownstreamHealth);
            return Ok(());
        }
        let Some(primary) = self.mode().primary() else {
            return Err(Error::InvalidConfigMode);
        };
        if self.edge(primary).is_enabled() {
            if self.check_if_proactive_spare_needed().0 {
                self.set_condition(Condition::NeedProactiveSpare);
            }
        } else {
            self.set_condition(Condition::EvalRebuildLogging);
        }
        if self.has_no_spare_been_reported() {
            self.set_condition(Condition::ClearNoSpareReported);
        }
        Ok(())
    }

    /// Record a downstream edge's new path state.
    ///
    /// In mirror mode, a newly enabled edge may need to be marked for rebuild,
    /// and a newly unavailable one must not leave the monitor stuck behind
    /// stripe locks, paged metadata or memory.
    #[instrument(skip(self), fields(vd = self.id))]
    pub fn handle_edge_state_change(&mut self, e: EdgeIndex, state: PathState)
    {
        self.rg.edge_mut(e).path_state = state;
        self.set_condition(Condition::EvaluateDownstreamHealth);
        if !self.mode().is_mirror() {
            return;
        }
        if state != PathState::Slumber {
            self.set_condition(Condition::EdgeChangeDuringHibernation);
        }
        let state = if self.edge(e).attr.timeout_errors {
            PathState::Broken
        } else {
            state
        };
        match state {
            PathState::Enabled => {
                self.rg.local_state.set_eval_mark_nr_request(true);
                self.set_condition(Condition::EvalMarkNr);
                info!(vd = self.id, edge = %e, "edge enabled; eval mark NR");
            }
            PathState::Slumber => (),
            _ if self.rg.is_rebuild_logging(e) => (),
            _ => {
                info!(vd = self.id, edge = %e, %state,
                      "edge unavailable; aborting monitor waiters");
                let rebuild = &self.services.rebuild;
                rebuild.abort_stripe_locks();
                rebuild.abort_paged();
                rebuild.abort_monitor_ops();
            }
        }
    }

    /// Run one of the virtual drive's monitor conditions.
    ///
    /// A handler clears its condition once it has nothing left to do.  A
    /// handler that must wait leaves the condition set so the scheduler runs
    /// it again.
    #[instrument(skip(self), fields(vd = self.id))]
    pub async fn run_condition(&mut self, cond: Condition) -> Result<Status> {
        match cond {
            Condition::EvaluateDownstreamHealth => {
                self.clear_condition(cond);
                let health = self.downstream_health();
                self.set_condition_based_on_downstream_health(health)?;
                Ok(Status::Done)
            }
            Condition::NeedReplacementDrive => self.need_replacement_drive(),
            Condition::NeedProactiveSpare => self.need_proactive_spare(),
            Condition::StartUserCopy => {
                self.clear_condition(cond);
                self.start_user_copy();
                Ok(Status::Done)
            }
            Condition::SwapInEdge => self.swap_in_edge_cond(),
            Condition::SwapOutEdge => self.swap_out_edge_cond(),
            Condition::CopyComplete => {
                self.clear_condition(cond);
                let e = self.swapped_out_edge()?;
                self.log_all_copies_complete(e.other())?;
                Ok(Status::Done)
            }
            Condition::IsCopyComplete => self.is_copy_complete_cond(),
            Condition::AbortCopy => self.abort_copy().await,
            Condition::SwapOperationComplete => {
                self.clear_condition(cond);
                self.swap_completion_cleanup()?;
                Ok(Status::Done)
            }
            Condition::ConfigurationChange => {
                self.configuration_change().await?;
                self.clear_condition(cond);
                Ok(Status::Done)
            }
            Condition::SetRebuildCheckpointToEndMarker => {
                let e = self.swapped_out_edge()?;
                self.copy_complete_set_checkpoints(e).await?;
                self.flags.mark_operation_complete(
                    OperationComplete::CopyCompleteSetCheckpoint);
                self.clear_condition(cond);
                Ok(Status::Done)
            }
            Condition::DestDriveFailedSetRebuildCheckpointToEndMarker => {
                let e = self.swapped_out_edge()?;
                self.dest_failed_set_checkpoints(e).await?;
                self.flags.mark_operation_complete(
                    OperationComplete::CopyFailedSetCheckpoint);
                self.clear_condition(cond);
                Ok(Status::Done)
            }
            Condition::CopyFailedSetRebuildCheckpointToEndMarker => {
                let e = self.swapped_out_edge()?;
                self.copy_failed_set_checkpoints(e).await?;
                self.flags.mark_operation_complete(
                    OperationComplete::CopyFailedSetCheckpoint);
                self.clear_condition(cond);
                Ok(Status::Done)
            }
            Condition::FailCheckDownstreamHealth =>
                Ok(self.fail_check_downstream_health()),
            Condition::ClearNoSpareReported => {
                if self.has_no_spare_been_reported() {
                    self.clear_no_spare_reported().await?;
                }
                self.clear_condition(cond);
                Ok(Status::Done)
            }
            Condition::SetNoSpareReported => {
                if self.flags.no_spare_reported() &&
                    !self.has_no_spare_been_reported()
                {
                    self.set_no_spare_reported().await?;
                }
                self.clear_condition(cond);
                Ok(Status::Done)
            }
            Condition::ReportCopyDenied => {
                self.clear_condition(cond);
                let orig = self.mode().primary()
                    .map(|e| self.rg.server_id(e))
                    .unwrap_or(OBJECT_ID_INVALID);
                self.write_event_log(EventCode::UserCopyRequestDenied, orig,
                                     OBJECT_ID_INVALID)?;
                Ok(Status::Done)
            }
            Condition::BackgroundMonitorOperation => {
                self.generate_notifications().await?;
                Ok(Status::Done)
            }
            Condition::CheckPowerSavings => Ok(self.check_power_savings()),
            _ => {
                debug!(vd = self.id, ?cond, "not a virtual drive condition");
                Ok(Status::Done)
            }
        }
    }

    fn swapped_out_edge(&self) -> Result<EdgeIndex> {
        self.swap_out_edge().ok_or_else(|| {
            error!(vd = self.id, "no swapped-out edge");
            Error::InvalidEdgeIndex
        })
    }

    /// Finish swapping in a new edge, once it has appeared.
    fn swap_in_edge_cond(&mut self) -> Result<Status> {
        let cond = Condition::SwapInEdge;
        let Some(e) = self.swap_in_edge() else {
            self.clear_condition(cond);
            error!(vd = self.id, "no swapped-in edge");
            return Err(Error::InvalidEdgeIndex);
        };
        if self.edge(e).path_state == PathState::Invalid {
            debug!(vd = self.id, edge = %e, "waiting for the new edge");
            return Ok(Status::Done);
        }
        self.clear_condition(cond);
        info!(vd = self.id, edge = %e, state = %self.edge(e).path_state,
              "edge swapped in");
        if self.flags.swap_request_in_progress() {
            self.flags.mark_operation_complete(OperationComplete::SwapInEdge);
        }
        self.set_condition(Condition::EvaluateDownstreamHealth);
        Ok(Status::Done)
    }

    /// Finish swapping out an edge.
    ///
    /// Outside of a swap request this is an optimal pass-thru drive whose
    /// unused edge is still attached.  It stays attached until a swap
    /// request removes it.
    fn swap_out_edge_cond(&mut self) -> Result<Status> {
        self.clear_condition(Condition::SwapOutEdge);
        if !self.flags.swap_request_in_progress() {
            debug!(vd = self.id, mode = %self.mode(),
                   "no swap request; unused edge stays attached");
            return Ok(Status::Done);
        }
        let e = self.swapped_out_edge()?;
        info!(vd = self.id, edge = %e, "edge swapped out");
        self.flags.mark_operation_complete(OperationComplete::SwapOut);
        self.set_condition(Condition::EvaluateDownstreamHealth);
        Ok(Status::Done)
    }

    /// While failed, wait for a usable edge to return.
    fn fail_check_downstream_health(&mut self) -> Status {
        let cond = Condition::FailCheckDownstreamHealth;
        if self.lifecycle() != LifecycleState::Fail {
            debug!(vd = self.id, lifecycle = ?self.lifecycle(), "not failed");
            self.clear_condition(cond);
            return Status::Done;
        }
        let health = self.downstream_health();
        if health == DownstreamHealth::Broken {
            debug!(vd = self.id, "downstream still broken");
            return Status::Done;
        }
        info!(vd = self.id, ?health, "downstream health restored");
        self.clear_condition(cond);
        self.set_condition(Condition::EvaluateDownstreamHealth);
        Status::Done
    }

    /// A drive that is copying or swapping must not hibernate.
    fn check_power_savings(&mut self) -> Status {
        self.clear_condition(Condition::CheckPowerSavings);
        let busy = self.flags.swap_request_in_progress() ||
            (self.mode().is_mirror() && !self.is_copy_complete());
        if busy && self.lifecycle() == LifecycleState::PendingHibernate {
            info!(vd = self.id, "copy in progress; hibernation cancelled");
            self.rg.lifecycle = LifecycleState::Ready;
        }
        Status::Done
    }

    /// Wait out the replacement trigger time, then ask for a spare.
    fn need_replacement_drive(&mut self) -> Result<Status> {
        let cond = Condition::NeedReplacementDrive;
        if !self.can_initiate_replacement_request() {
            return Ok(Status::Done);
        }
        let needed = if self.mode().is_mirror() {
            self.find_broken_edge()?.is_some()
        } else {
            self.check_if_permanent_spare_needed()
        };
        if !needed {
            debug!(vd = self.id, "replacement no longer needed");
            self.clear_need_replacement_drive_start_time();
            self.clear_condition(cond);
            return Ok(Status::Done);
        }
        if !self.timers.need_replacement_drive.is_running() {
            self.set_need_replacement_drive_start_time();
        }
        if !self.check_if_permanent_sparing_can_start()? {
            return Ok(Status::Done);
        }
        self.clear_condition(cond);
        if self.mode().is_mirror() {
            // A failed mirror edge is swapped out, with upstream's blessing
            self.set_condition(Condition::AbortCopy);
            Ok(Status::Done)
        } else {
            self.request_permanent_spare()
        }
    }

    /// Wait out the proactive trigger time, then ask for a proactive copy.
    fn need_proactive_spare(&mut self) -> Result<Status> {
        let cond = Condition::NeedProactiveSpare;
        if !self.can_initiate_proactive_copy_request() ||
            !self.check_if_proactive_spare_needed().0
        {
            self.clear_need_proactive_copy_start_time();
            self.clear_condition(cond);
            return Ok(Status::Done);
        }
        if !self.timers.need_proactive_copy.is_running() {
            self.set_need_proactive_copy_start_time();
        }
        if !self.check_if_proactive_copy_can_start()? {
            return Ok(Status::Done);
        }
        self.clear_condition(cond);
        self.request_proactive_copy()
    }

    /// Swap out the source of a finished copy, or the destination of a copy
    /// that can't finish.
    fn is_copy_complete_cond(&mut self) -> Result<Status> {
        let cond = Condition::IsCopyComplete;
        if !self.rg.active || !self.mode().is_mirror() ||
            self.flags.swap_request_in_progress()
        {
            self.clear_condition(cond);
            return Ok(Status::Done);
        }
        if self.flags.operation_complete() ==
            Some(OperationComplete::OptimalCompleteCopy)
        {
            self.flags.clear_operation_complete();
        }
        if !self.is_copy_complete() {
            self.clear_condition(cond);
            if !self.is_secondary_edge_healthy() {
                info!(vd = self.id, "destination is unhealthy; abort copy");
                self.set_condition(Condition::AbortCopy);
            }
            return Ok(Status::Done);
        }
        if !self.set_copy_complete_in_progress_if_allowed() {
            return Ok(Status::Done);
        }
        self.clear_condition(cond);
        let r = self.request_swap_out(SwapCommand::CompleteCopy);
        if !matches!(r, Ok(Status::MoreProcessing)) {
            self.rg.clustered.set_swap_job_in_progress(false);
        }
        r
    }

    /// Abandon an in-progress copy and go degraded, once upstream allows it.
    async fn abort_copy(&mut self) -> Result<Status> {
        let cond = Condition::AbortCopy;
        if !self.rg.active || !self.mode().is_mirror() ||
            self.flags.swap_request_in_progress()
        {
            self.clear_condition(cond);
            return Ok(Status::Done);
        }
        match self.ask_copy_abort_go_degraded_permission().await {
            Ok(()) => (),
            Err(Error::Busy) => {
                debug!(vd = self.id, "abort copy must wait for upstream");
                return Ok(Status::Done);
            }
            Err(e) => return Err(e)
        }
        if !self.set_abort_copy_in_progress_if_allowed() {
            return Ok(Status::Done);
        }
        self.clear_condition(cond);
        let r = self.request_swap_out(SwapCommand::AbortCopy);
        if !matches!(r, Ok(Status::MoreProcessing)) {
            self.rg.clustered.set_swap_job_in_progress(false);
        }
        r
    }

    /// Commit the pending configuration mode with I/O quiesced.
    async fn configuration_change(&mut self) -> Result<()> {
        let before = self.mode();
        let after = self.commit_mode()?;
        if before.is_pass_thru() && after.is_mirror() {
            if self.rg.active {
                self.set_swap_operation_start_nonpaged_flags().await?;
            }
            if let Err(e) = self.send_swap_notification() {
                warn!(vd = self.id, error = ?e, "swap notification failed");
            }
        } else if after.is_pass_thru() {
            self.set_degraded_needs_rebuild_if_needed().await?;
            self.check_and_send_notification()?;
        }
        if self.flags.swap_request_in_progress() {
            self.flags.mark_operation_complete(
                OperationComplete::ChangeConfigMode);
        }
        Ok(())
    }
}

// LCOV_EXCL_STOP
