// vim: tw=80
//! Rebuild checkpoint rewrites at the end of a copy
//!
//! Once a swap-out has committed pass-thru mode, the rebuild checkpoints and
//! the rebuild-logging bitmask must be rewritten to describe the surviving
//! edge.  Each rewrite holds the non-paged lock for the duration of a single
//! persisted write, and releases it whether or not the write succeeds.

use tracing::{error, info, instrument};

use crate::{
    nonpaged::{CheckpointSlot, RebuildInfo},
    types::*,
    virtual_drive::VirtualDrive,
};

/// Which way a copy ended
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CopyOutcome {
    /// The destination holds a full copy and the source was swapped out
    Complete,
    /// The destination failed and was swapped out
    DestinationFailed,
    /// The source, and possibly the destination too, failed
    Failed,
}

/// Compute the rebuild state for a virtual drive whose `gone` edge was
/// swapped out, given the current rebuild state.
pub fn rebuild_info_after(outcome: CopyOutcome, current: &RebuildInfo,
                          gone: EdgeIndex) -> Result<RebuildInfo>
{
    let survivor = gone.other();
    let mut rl = current.rl_bitmask;
    rl &= !survivor.bit();
    rl |= gone.bit();
    let slot1 = match outcome {
        CopyOutcome::Complete => CheckpointSlot::UNUSED,
        CopyOutcome::DestinationFailed => {
            // The source may still have been rebuilding itself
            match current.checkpoint(survivor) {
                END_MARKER => CheckpointSlot::UNUSED,
                cp => CheckpointSlot::new(cp, survivor)
            }
        }
        CopyOutcome::Failed => {
            let survivor_cp = current.checkpoint(survivor);
            if survivor_cp == END_MARKER {
                // Both drives failed.  Nothing survives to rebuild from.
                CheckpointSlot::UNUSED
            } else if current.checkpoint(gone) == END_MARKER {
                // Only the source failed.  The destination keeps its
                // progress.
                CheckpointSlot::new(survivor_cp, survivor)
            } else {
                error!(edge = %gone, gone_cp = current.checkpoint(gone),
                       survivor_cp, "neither checkpoint is the end marker");
                return Err(Error::MetadataCorruption);
            }
        }
    };
    Ok(RebuildInfo {
        rl_bitmask: rl,
        slots: [CheckpointSlot::new(0, gone), slot1],
    })
}

impl VirtualDrive {
    /// Rewrite the rebuild checkpoints after a copy ends with `outcome` and
    /// `swap_out` has been detached.
    #[instrument(skip(self), fields(vd = self.id))]
    pub async fn write_copy_checkpoints(&mut self, outcome: CopyOutcome,
                                        swap_out: EdgeIndex) -> Result<()>
    {
        self.validate_swapped_out_edge_index(swap_out)?;
        self.rg.lock_np()?;
        let r = match rebuild_info_after(outcome, &self.rg.np.rebuild,
                                         swap_out)
        {
            Ok(rebuild) => self.write_rebuild_info(rebuild).await,
            Err(e) => Err(e)
        };
        self.rg.unlock_np();
        self.set_checkpoint_to_end_marker_completion(outcome, &r);
        r
    }

    /// The source was copied in full and has been swapped out.
    pub async fn copy_complete_set_checkpoints(&mut self, swap_out: EdgeIndex)
        -> Result<()>
    {
        self.write_copy_checkpoints(CopyOutcome::Complete, swap_out).await
    }

    /// The destination failed and has been swapped out.
    pub async fn dest_failed_set_checkpoints(&mut self, swap_out: EdgeIndex)
        -> Result<()>
    {
        self.write_copy_checkpoints(CopyOutcome::DestinationFailed, swap_out)
            .await
    }

    /// The source failed mid-copy and has been swapped out.
    pub async fn copy_failed_set_checkpoints(&mut self, swap_out: EdgeIndex)
        -> Result<()>
    {
        self.write_copy_checkpoints(CopyOutcome::Failed, swap_out).await
    }

    /// Final step of every checkpoint rewrite.  Only reports; never changes
    /// the result.
    fn set_checkpoint_to_end_marker_completion(&self, outcome: CopyOutcome,
                                               r: &Result<()>)
    {
        let rebuild = &self.rg.np.rebuild;
        match r {
            Ok(()) => info!(vd = self.id, ?outcome, rl = rebuild.rl_bitmask,
                            slots = ?rebuild.slots,
                            "rebuild checkpoints rewritten"),
            Err(e) => error!(vd = self.id, ?outcome, error = ?e,
                             "rebuild checkpoint rewrite failed"),
        }
    }
}

// LCOV_EXCL_STOP
