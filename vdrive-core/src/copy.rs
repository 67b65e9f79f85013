// vim: tw=80
//! Copy progress
//!
//! Sizes each copy request, asks the upstream raid group which parts of it
//! hold user data, and issues the rebuild I/O.  Ranges that no client has
//! consumed are skipped by clearing their needs-rebuild marks instead of
//! copying them.

use tracing::{debug, error, info, instrument, warn};

use crate::{
    services::*,
    types::*,
    virtual_drive::VirtualDrive,
};

impl VirtualDrive {
    /// How many per-disk blocks to copy, starting at per-disk `lba`.
    ///
    /// The request is sized to the consumption budget, rounded down to whole
    /// chunks, and truncated so that it never crosses the end of the user
    /// area or the end of the paged metadata.
    pub fn get_copy_block_count(&self, lba: LbaT) -> BlockT {
        let geometry = &self.rg.geometry;
        let data_disks = geometry.data_disks.max(1);
        let chunk = self.config.chunk_size;
        let exported = geometry.logical_capacity();
        let paged_end = geometry.paged_end();
        let start = lba * data_disks;
        let budget = self.config.copy_consumption_blocks();
        let mut count = (budget / chunk * chunk).max(chunk);
        let end = start + count - 1;
        if start < exported && end >= exported {
            count = exported - start;
        } else if start >= geometry.paged_md_lba && end >= paged_end {
            count = paged_end.saturating_sub(start);
        }
        let blocks = count / data_disks;
        debug!(vd = self.id, lba, blocks, "copy block count");
        blocks
    }

    /// Hand `ctx` to the rebuild engine and process the outcome.
    async fn issue_rebuild_io(&mut self, ctx: &mut RebuildContext,
                              break_context: bool) -> Result<Status>
    {
        ctx.state = RebuildState::RebuildIo;
        let outcome = self.services.rebuild.rebuild(*ctx, break_context).await;
        self.rebuild_process_io_completion(ctx, outcome).await?;
        Ok(Status::MoreProcessing)
    }

    /// Skip the range in `ctx`: nothing upstream has data there.
    async fn clear_needs_rebuild(&mut self, ctx: &mut RebuildContext)
        -> Result<Status>
    {
        ctx.state = RebuildState::ClearNeedsRebuild;
        debug!(vd = self.id, lba = ctx.start_lba, blocks = ctx.block_count,
               "skipping unconsumed range");
        self.services.rebuild.clear_needs_rebuild(*ctx).await?;
        Ok(Status::MoreProcessing)
    }

    /// Decide what to do with the next copy request.
    ///
    /// Metadata ranges are copied without asking.  User ranges first go
    /// upstream as a permit request: consumed ranges are copied, unconsumed
    /// ones have their needs-rebuild marks cleared, and a busy or denying
    /// upstream yields `Busy` so that the scheduler retries later.  `ctx` is
    /// updated in place to describe what was actually done.
    #[instrument(skip(self), fields(vd = self.id))]
    pub async fn copy_send_event_to_check_lba(&mut self,
                                              ctx: &mut RebuildContext)
        -> Result<Status>
    {
        let data_disks = self.rg.geometry.data_disks.max(1);
        let exported = self.rg.geometry.logical_capacity();
        let start = ctx.start_lba * data_disks;
        let mut blocks = ctx.block_count * data_disks;
        if start >= exported {
            debug!(vd = self.id, lba = start, blocks, "metadata copy");
            return self.issue_rebuild_io(ctx, false).await;
        }
        if let Some(limited) = self.services.upstream
            .limit_to_one_client(start, blocks)
        {
            debug!(vd = self.id, lba = start, blocks, limited,
                   "limited to one client");
            blocks = limited;
            ctx.block_count = blocks / data_disks;
        }
        ctx.state = RebuildState::Permit;
        let event = Event {
            kind: EventKind::PermitRequest,
            extent: Extent::new(start, blocks),
        };
        let reply = self.services.upstream.send_event(event).await;
        if self.flags.copy_mark_verify_in_progress() || reply.deny ||
            reply.status == EventStatus::Busy
        {
            debug!(vd = self.id, lba = start, ?reply, "permit refused");
            return Err(Error::Busy);
        }
        let unconsumed = reply.unconsumed_blocks;
        match reply.status {
            EventStatus::Ok if reply.start_consumed => {
                if unconsumed > 0 && unconsumed < blocks {
                    // Copy only the consumed prefix this time around
                    ctx.block_count = (blocks - unconsumed) / data_disks;
                }
                self.issue_rebuild_io(ctx, true).await
            }
            EventStatus::Ok => {
                if unconsumed > 0 && unconsumed < blocks {
                    ctx.block_count = unconsumed / data_disks;
                }
                self.clear_needs_rebuild(ctx).await
            }
            EventStatus::NoUserData => self.clear_needs_rebuild(ctx).await,
            status => {
                error!(vd = self.id, ?status, "unexpected permit status");
                Err(Error::GenericFailure)
            }
        }
    }

    /// Process the outcome of one rebuild I/O.
    ///
    /// A media error in user space is tolerated after asking upstream to
    /// mark the range for verify.  Any other failure fails the request so
    /// that the checkpoint does not advance.
    pub async fn rebuild_process_io_completion(&mut self,
                                               ctx: &RebuildContext,
                                               outcome: IoOutcome)
        -> Result<()>
    {
        let data_disks = self.rg.geometry.data_disks.max(1);
        let start = ctx.start_lba * data_disks;
        match outcome {
            IoOutcome::Success => Ok(()),
            IoOutcome::MediaError
                if start < self.rg.geometry.logical_capacity() =>
            {
                warn!(vd = self.id, lba = start, blocks = ctx.block_count,
                      "media error; marking for verify");
                self.flags.set_copy_mark_verify_in_progress(true);
                let event = Event {
                    kind: EventKind::MarkVerify,
                    extent: Extent::new(start,
                                        ctx.block_count * data_disks),
                };
                let reply = self.services.upstream.send_event(event).await;
                self.copy_mark_verify_completion(reply);
                Ok(())
            }
            outcome => {
                error!(vd = self.id, lba = start, ?outcome,
                       "rebuild I/O failed");
                Err(Error::IoFailedNotRetryable)
            }
        }
    }

    /// Upstream has recorded the range to verify.
    pub fn copy_mark_verify_completion(&mut self, reply: EventReply) {
        if reply.status != EventStatus::Ok {
            error!(vd = self.id, ?reply, "mark verify failed");
        } else {
            info!(vd = self.id, "mark verify complete");
        }
        self.flags.set_copy_mark_verify_in_progress(false);
    }
}

// LCOV_EXCL_STOP
