// vim: tw=80
//! Persistent flag store
//!
//! Every change to the non-paged metadata goes through a single-field write.
//! The in-core copy is updated only once the write has been persisted, so a
//! failed write leaves the in-core and on-disk copies in agreement.

use tracing::{debug, error, info, instrument};

use crate::{
    nonpaged::*,
    services::SwapCommand,
    types::*,
    virtual_drive::VirtualDrive,
};

/// The individually settable persistent flags
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum NpFlag {
    SwappedIn,
    NoSpareReported,
    SourceDriveFailed,
    DegradedNeedsRebuild,
}

impl NpFlag {
    fn get(self, flags: NpFlags) -> bool {
        match self {
            NpFlag::SwappedIn => flags.swapped_in(),
            NpFlag::NoSpareReported => flags.no_spare_reported(),
            NpFlag::SourceDriveFailed => flags.source_drive_failed(),
            NpFlag::DegradedNeedsRebuild => flags.degraded_needs_rebuild(),
        }
    }

    fn set(self, flags: &mut NpFlags, value: bool) {
        match self {
            NpFlag::SwappedIn => flags.set_swapped_in(value),
            NpFlag::NoSpareReported => flags.set_no_spare_reported(value),
            NpFlag::SourceDriveFailed => flags.set_source_drive_failed(value),
            NpFlag::DegradedNeedsRebuild =>
                flags.set_degraded_needs_rebuild(value),
        }
    }
}

impl VirtualDrive {
    /// Persist one field of `np`, then adopt `np` as the in-core copy.
    async fn write_np_field(&mut self, field: NpField, np: NonPagedMetadata)
        -> Result<()>
    {
        let data = np.encode_field(field);
        if let Err(e) = self.services.metadata
            .write_nonpaged(field.offset(), data).await
        {
            error!(vd = self.id, ?field, error = ?e, "non-paged write failed");
            return Err(e);
        }
        self.rg.np = np;
        self.rg.np_initialized = true;
        Ok(())
    }

    /// Persist a new flags word.
    #[instrument(skip(self), fields(vd = self.id))]
    pub async fn write_nonpaged_flags(&mut self, flags: NpFlags) -> Result<()>
    {
        let mut np = self.rg.np;
        np.flags = flags;
        self.write_np_field(NpField::Flags, np).await
    }

    /// Apply `changes` to the current flags and persist the result.
    pub async fn update_nonpaged_flags(&mut self, changes: FlagChanges)
        -> Result<()>
    {
        let flags = determine_flags(self.rg.np.flags, changes);
        self.write_nonpaged_flags(flags).await
    }

    async fn write_np_flag(&mut self, flag: NpFlag, value: bool) -> Result<()>
    {
        let mut flags = self.rg.np.flags;
        flag.set(&mut flags, value);
        debug!(vd = self.id, ?flag, value, "write non-paged flag");
        self.write_nonpaged_flags(flags).await
    }

    pub async fn set_edge_swapped(&mut self) -> Result<()> {
        self.write_np_flag(NpFlag::SwappedIn, true).await
    }

    pub async fn clear_edge_swapped(&mut self) -> Result<()> {
        self.write_np_flag(NpFlag::SwappedIn, false).await
    }

    pub async fn set_no_spare_reported(&mut self) -> Result<()> {
        self.write_np_flag(NpFlag::NoSpareReported, true).await
    }

    pub async fn clear_no_spare_reported(&mut self) -> Result<()> {
        self.write_np_flag(NpFlag::NoSpareReported, false).await
    }

    pub async fn set_source_failed(&mut self) -> Result<()> {
        self.write_np_flag(NpFlag::SourceDriveFailed, true).await
    }

    pub async fn clear_source_failed(&mut self) -> Result<()> {
        self.write_np_flag(NpFlag::SourceDriveFailed, false).await
    }

    pub async fn set_degraded_needs_rebuild(&mut self) -> Result<()> {
        self.write_np_flag(NpFlag::DegradedNeedsRebuild, true).await
    }

    pub async fn clear_degraded_needs_rebuild(&mut self) -> Result<()> {
        self.write_np_flag(NpFlag::DegradedNeedsRebuild, false).await
    }

    pub fn is_edge_swapped(&self) -> bool {
        NpFlag::SwappedIn.get(self.rg.np.flags)
    }

    pub fn has_no_spare_been_reported(&self) -> bool {
        NpFlag::NoSpareReported.get(self.rg.np.flags)
    }

    pub fn is_source_failed(&self) -> bool {
        NpFlag::SourceDriveFailed.get(self.rg.np.flags)
    }

    pub fn is_degraded_needs_rebuild(&self) -> bool {
        NpFlag::DegradedNeedsRebuild.get(self.rg.np.flags)
    }

    pub fn is_mark_nr_required(&self) -> bool {
        self.rg.np.flags.mark_nr_required()
    }

    /// Record in the persistent flags that a swap has begun.
    ///
    /// Every swap marks the edge swapped.  Copies also require the new edge
    /// to be marked needs-rebuild, but a permanent spare is marked by the
    /// rebuild-logging evaluation instead.
    pub async fn set_swap_operation_start_nonpaged_flags(&mut self)
        -> Result<()>
    {
        let mark_nr = if self.copy_request_type == SwapCommand::PermanentSpare {
            FlagChange::Keep
        } else {
            FlagChange::Set
        };
        let changes = FlagChanges {
            swapped_in: FlagChange::Set,
            mark_nr_required: mark_nr,
            ..Default::default()
        };
        self.update_nonpaged_flags(changes).await
    }

    /// Persist new rebuild checkpoints and rebuild-logging bitmask.
    pub(crate) async fn write_rebuild_info(&mut self, rebuild: RebuildInfo)
        -> Result<()>
    {
        let mut np = self.rg.np;
        np.rebuild = rebuild;
        self.write_np_field(NpField::RebuildInfo, np).await
    }

    /// Reinitialize the whole non-paged record.
    ///
    /// The generic fields are reset and the rebuild state and flags are
    /// kept.  Used when the source drive fails mid-copy and the surviving
    /// drive's metadata can no longer be trusted.
    #[instrument(skip(self), fields(vd = self.id))]
    pub async fn write_default_nonpaged_metadata(&mut self) -> Result<()> {
        let np = NonPagedMetadata {
            flags: self.rg.np.flags,
            rebuild: self.rg.np.rebuild,
            verify_checkpoints: [END_MARKER; 3],
            glitching_bitmask: 0,
            paged_summary: PagedEntry {
                valid: true,
                ..Default::default()
            },
        };
        if let Err(e) = self.services.metadata
            .write_nonpaged(0, np.encode_body()).await
        {
            error!(vd = self.id, error = ?e, "default non-paged write failed");
            return Err(e);
        }
        self.rg.np = np;
        self.rg.np_initialized = true;
        info!(vd = self.id, "default non-paged metadata written");
        Ok(())
    }

    /// Reinitialize every paged metadata entry to "valid, nothing to rebuild
    /// or verify".  Only a pass-thru virtual drive may do this.
    #[instrument(skip(self), fields(vd = self.id))]
    pub async fn write_default_paged_metadata(&mut self) -> Result<()> {
        let mode = self.mode();
        if !mode.is_pass_thru() {
            error!(vd = self.id, %mode, "default paged write: mode");
            return Err(Error::InvalidConfigMode);
        }
        let capacity = self.rg.geometry.paged_md_capacity;
        let repeat = capacity * BYTES_PER_BLOCK / PAGED_ENTRY_LEN;
        let entry = PagedEntry {
            valid: true,
            ..Default::default()
        };
        self.services.metadata.write_paged_default(0, repeat, entry).await
            .map_err(|e| {
                error!(vd = self.id, error = ?e, "default paged write failed");
                e
            })?;
        info!(vd = self.id, repeat, "default paged metadata written");
        Ok(())
    }
}

// LCOV_EXCL_STOP
