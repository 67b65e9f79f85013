// vim: tw=80
//! Copy notifications
//!
//! Tells the source and destination drives when a copy starts, how far it
//! has progressed, and when it ends.  What has already been said is kept in
//! [`CopyTracking`](crate::virtual_drive::CopyTracking), so that each
//! transition is announced once.

use tracing::{debug, error, info, instrument, warn};

use crate::{
    services::*,
    types::*,
    virtual_drive::VirtualDrive,
};

impl VirtualDrive {
    /// Percentage of the destination edge that has been copied
    fn copy_percent(&self, dest: EdgeIndex) -> u32 {
        if self.is_copy_complete() {
            return 100;
        }
        let cp = self.rg.checkpoint(dest);
        let capacity = self.rg.exported_capacity();
        if cp == END_MARKER {
            100
        } else if cp > capacity || capacity == 0 {
            0
        } else {
            // At most 100, since cp <= capacity
            (u128::from(cp) * 100 / u128::from(capacity)) as u32
        }
    }

    /// Push the rebuilt percentage down to the destination drive.
    async fn update_pvd_percent_rebuilt(&self, dest: EdgeIndex, pvd: ObjectId,
                                        percent: u32) -> Result<()>
    {
        let state = self.rg.path_state(dest);
        if !self.edge(dest).is_enabled() {
            warn!(vd = self.id, edge = %dest, %state,
                  "destination edge is not enabled");
            return Err(Error::EdgeNotEnabled);
        }
        self.services.notifier.set_percent_rebuilt(pvd, percent).await
    }

    fn notify(&self, pvd: ObjectId, n: Notification) {
        if let Err(e) = self.services.notifier.send(pvd, n) {
            error!(vd = self.id, pvd, error = ?e, "notification failed");
        }
    }

    /// Announce the start or end of a copy to both drives.
    async fn send_start_end(&mut self, src: EdgeIndex, dst: EdgeIndex,
                            state: ReconstructionState) -> Result<()>
    {
        if src == dst || state == ReconstructionState::InProgress {
            error!(vd = self.id, %src, %dst, ?state, "bad start/end request");
            return Err(Error::GenericFailure);
        }
        let n = Notification::DataReconstruction {
            state,
            percent: self.tracking.previous_percent[dst.idx()],
        };
        self.tracking.blocks_rebuilt = [0; 2];
        let src_pvd = self.tracking.rebuilt_pvds[src.idx()];
        if src_pvd != OBJECT_ID_INVALID {
            info!(vd = self.id, edge = %src, pvd = src_pvd, ?state,
                  "copy source");
            self.notify(src_pvd, n);
            if state == ReconstructionState::End {
                self.tracking.rebuilt_pvds[src.idx()] = OBJECT_ID_INVALID;
            }
        }
        let dst_pvd = self.tracking.rebuilt_pvds[dst.idx()];
        if dst_pvd != OBJECT_ID_INVALID {
            let percent = u32::from(state == ReconstructionState::Start);
            if let Err(e) = self.update_pvd_percent_rebuilt(dst, dst_pvd,
                                                            percent).await
            {
                if state == ReconstructionState::End {
                    debug!(vd = self.id, pvd = dst_pvd, error = ?e,
                           "percent rebuilt not updated");
                } else {
                    error!(vd = self.id, pvd = dst_pvd, error = ?e,
                           "percent rebuilt not updated");
                    self.tracking.reset();
                    return Err(e);
                }
            }
            info!(vd = self.id, edge = %dst, pvd = dst_pvd, ?state,
                  "copy destination");
            self.notify(dst_pvd, n);
            if state == ReconstructionState::End {
                self.tracking.rebuilt_pvds[dst.idx()] = OBJECT_ID_INVALID;
            }
        }
        self.tracking.previous_percent = [0; 2];
        Ok(())
    }

    /// Report copy progress to both drives.
    async fn send_progress(&mut self, src: EdgeIndex, dst: EdgeIndex,
                           percent: u32) -> Result<()>
    {
        let src_pvd = self.tracking.rebuilt_pvds[src.idx()];
        let dst_pvd = self.tracking.rebuilt_pvds[dst.idx()];
        if src == dst || src_pvd == OBJECT_ID_INVALID ||
            dst_pvd == OBJECT_ID_INVALID
        {
            error!(vd = self.id, src_pvd, dst_pvd, "progress without drives");
            return Err(Error::GenericFailure);
        }
        if let Err(e) = self.update_pvd_percent_rebuilt(dst, dst_pvd, percent)
            .await
        {
            error!(vd = self.id, pvd = dst_pvd, error = ?e,
                   "percent rebuilt not updated");
            self.tracking.reset();
            return Err(e);
        }
        let n = Notification::DataReconstruction {
            state: ReconstructionState::InProgress,
            percent,
        };
        debug!(vd = self.id, src_pvd, dst_pvd, percent, "copy progress");
        self.notify(src_pvd, n);
        self.notify(dst_pvd, n);
        self.tracking.previous_percent[src.idx()] = 0;
        self.tracking.previous_percent[dst.idx()] = percent;
        Ok(())
    }

    /// Send whatever copy notifications the current state calls for.
    ///
    /// Called from each monitor cycle.  In mirror mode that is a Start on
    /// first observation, Progress when the percentage changes, and End once
    /// the copy reaches 100% or is aborted.  In pass-thru mode, a copy that
    /// was reporting progress gets its End.
    #[instrument(skip(self), fields(vd = self.id))]
    pub async fn generate_notifications(&mut self) -> Result<()> {
        let mode = self.mode();
        let (src, dst) = match (mode.primary(), mode.secondary()) {
            (Some(p), Some(s)) => (p, s),
            _ => {
                error!(vd = self.id, %mode, "notifications: unknown mode");
                return Err(Error::InvalidConfigMode);
            }
        };
        let copy_complete = self.is_copy_complete();
        let aborted = self.copy_request_type == SwapCommand::AbortCopy;
        let never_reported = self.tracking.previous_percent == [0; 2];

        if mode.is_pass_thru() {
            if never_reported {
                if self.tracking.rebuilt_pvds != [OBJECT_ID_INVALID; 2] {
                    debug!(vd = self.id, %mode, "not copying");
                    self.tracking.rebuilt_pvds = [OBJECT_ID_INVALID; 2];
                }
                return Ok(());
            }
            return self.send_start_end(src, dst, ReconstructionState::End)
                .await;
        }

        let cp = self.rg.checkpoint(dst);
        let capacity = self.rg.exported_capacity();
        let percent = self.copy_percent(dst);
        let pvds = self.tracking.rebuilt_pvds;
        if (pvds[src.idx()] == OBJECT_ID_INVALID ||
            pvds[dst.idx()] == OBJECT_ID_INVALID) && never_reported
        {
            if copy_complete {
                return Ok(());
            }
            for e in [src, dst] {
                if self.tracking.rebuilt_pvds[e.idx()] != OBJECT_ID_INVALID {
                    continue;
                }
                match self.rg.server_id(e) {
                    0 | OBJECT_ID_INVALID => error!(vd = self.id, %mode,
                        edge = %e, "no drive to notify"),
                    id => self.tracking.rebuilt_pvds[e.idx()] = id,
                }
            }
            return self.send_start_end(src, dst, ReconstructionState::Start)
                .await;
        }

        let changed = self.tracking.previous_percent[dst.idx()] != percent;
        let progressing = self.rg.rl_bitmask() == 0 && changed &&
            self.rg.is_rebuild_needed() &&
            (cp <= capacity || cp == END_MARKER);
        if progressing || (copy_complete && changed) {
            self.send_progress(src, dst, percent).await?;
        }
        if percent == 100 || aborted {
            self.send_start_end(src, dst, ReconstructionState::End).await?;
        }
        Ok(())
    }

    /// Log that every copy to `dest` has finished.
    pub fn log_all_copies_complete(&self, dest: EdgeIndex) -> Result<()> {
        let source = dest.other();
        let entry = EventLogEntry {
            code: EventCode::CopyCompleted,
            vd: self.id,
            orig_pvd: self.rg.server_id(source),
            spare_pvd: self.rg.server_id(dest),
            location: self.edge(source).location,
            dest_location: Some(self.edge(dest).location),
        };
        info!(vd = self.id, source = %entry.location,
              dest = %self.edge(dest).location, "all copies complete");
        self.services.event_log.write(entry)
    }

}

// LCOV_EXCL_STOP
