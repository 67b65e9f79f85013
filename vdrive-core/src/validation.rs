// vim: tw=80
//! Swap validation
//!
//! Decides whether a permanent spare, proactive copy, user copy, or swap-out
//! is currently allowed, and which edge each one concerns.  Everything here
//! is a pure function of the edges, the rebuild checkpoints and the lifecycle
//! state.  Nothing here performs I/O.

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::{
    config_mode::ConfigMode,
    edge::*,
    services::SwapCommand,
    types::*,
    virtual_drive::VirtualDrive,
};

/// Reasons that a swap request may be refused
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum SwapStatus {
    #[error("The request carried the wrong command")]
    InvalidCommand,
    #[error("The current configuration mode doesn't support the request")]
    ConfigModeDoesntSupport,
    #[error("The virtual drive is degraded")]
    VirtualDriveDegraded,
    #[error("The virtual drive is broken")]
    VirtualDriveBroken,
    #[error("The request doesn't match the virtual drive's state")]
    InternalError,
    #[error("A permanent spare is not required")]
    PermanentSpareNotRequired,
    #[error("A proactive spare is not required")]
    ProactiveSpareNotRequired,
    #[error("The upstream raid group denied the user copy")]
    UpstreamDeniedUserCopy,
    #[error("Unsupported swap command")]
    UnsupportedCommand,
}

/// Outcome of a swap validation
pub type SwapResult = std::result::Result<(), SwapStatus>;

/// Could the drive behind an edge in this state still service I/O?
fn is_gone(state: PathState) -> bool {
    matches!(state, PathState::Disabled | PathState::Broken | PathState::Gone
             | PathState::Invalid)
}

impl VirtualDrive {
    /// The primary edge is not End-Of-Life
    pub fn is_primary_edge_healthy(&self) -> bool {
        self.mode().primary()
            .map(|e| !self.edge(e).is_eol())
            .unwrap_or(false)
    }

    /// The primary edge can't be used for I/O
    pub fn is_primary_edge_broken(&self) -> bool {
        self.mode().primary()
            .map(|e| is_gone(self.rg.path_state(e)))
            .unwrap_or(false)
    }

    /// The secondary edge is not End-Of-Life
    pub fn is_secondary_edge_healthy(&self) -> bool {
        self.mode().secondary()
            .map(|e| !self.edge(e).is_eol())
            .unwrap_or(false)
    }

    /// The secondary edge is Disabled or Broken.  An Invalid secondary is
    /// merely absent.
    pub fn is_secondary_edge_broken(&self) -> bool {
        self.mode().secondary()
            .map(|e| self.rg.path_state(e).is_unavailable())
            .unwrap_or(false)
    }

    /// Has the copy to the destination edge finished?
    ///
    /// A virtual drive whose non-paged metadata was never written has nothing
    /// to copy.  In pass-thru mode the live edge is checked.  In mirror mode
    /// the destination edge is checked.
    pub fn is_copy_complete(&self) -> bool {
        if !self.rg.np_initialized {
            return true;
        }
        let pending = self.rg.metadata_rebuild_pending;
        let exported = self.rg.exported_capacity();
        match self.mode() {
            mode @ (ConfigMode::PassThruFirst | ConfigMode::PassThruSecond) =>
            {
                let Some(e) = mode.primary() else { return false };
                let cp = self.rg.checkpoint(e);
                cp != END_MARKER && !pending && cp == exported
            }
            mode @ (ConfigMode::MirrorFirst | ConfigMode::MirrorSecond) => {
                let Some(dest) = mode.secondary() else { return false };
                let cp = self.rg.checkpoint(dest);
                !pending && (cp == END_MARKER || cp == exported)
            }
            ConfigMode::Unknown => {
                error!(vd = self.id, "is_copy_complete: unknown mode");
                false
            }
        }
    }

    /// Aggregate the health of both downstream edges.
    ///
    /// While a copy is incomplete, an enabled mirror edge that is still
    /// rebuild logging can't service reads, so it counts as broken.
    pub fn downstream_health(&self) -> DownstreamHealth {
        let mode = self.mode();
        let mut counts = self.rg.path_state_counts();
        if mode.is_mirror() && !self.is_copy_complete() {
            for e in EdgeIndex::ALL {
                let edge = self.edge(e);
                if edge.is_enabled() && !edge.attr.timeout_errors &&
                    self.rg.is_rebuild_logging(e)
                {
                    counts.enabled -= 1;
                    counts.broken += 1;
                }
            }
        }
        let health = match mode {
            ConfigMode::MirrorFirst | ConfigMode::MirrorSecond => {
                if counts.enabled == VD_WIDTH {
                    DownstreamHealth::Optimal
                } else if counts.enabled > 0 {
                    DownstreamHealth::Degraded
                } else if counts.disabled > 0 {
                    DownstreamHealth::Disabled
                } else {
                    DownstreamHealth::Broken
                }
            }
            ConfigMode::PassThruFirst | ConfigMode::PassThruSecond => {
                // A pass-thru virtual drive is never optimal
                if counts.enabled > 0 {
                    if self.is_primary_edge_broken() {
                        DownstreamHealth::Broken
                    } else {
                        DownstreamHealth::Degraded
                    }
                } else if counts.disabled > 0 {
                    DownstreamHealth::Disabled
                } else {
                    DownstreamHealth::Broken
                }
            }
            ConfigMode::Unknown => {
                error!(vd = self.id, "downstream_health: unknown mode");
                DownstreamHealth::Broken
            }
        };
        debug!(vd = self.id, %mode, %health, ?counts, "downstream health");
        health
    }

    /// Find the edge that should be considered failed.
    ///
    /// When both edges are equally unhealthy, the choice is a fixed function
    /// of the configuration mode.
    pub fn find_broken_edge(&self) -> Result<Option<EdgeIndex>> {
        use EdgeIndex::{First, Second};

        let mode = self.mode();
        if mode == ConfigMode::Unknown {
            error!(vd = self.id, "find_broken_edge: unknown mode");
            return Err(Error::InvalidConfigMode);
        }
        let first = self.edge(First);
        let second = self.edge(Second);
        let tie = if mode.is_first_based() { Second } else { First };
        let broken = PathState::Broken;
        let r = if first.path_state == broken && second.path_state == broken {
            Some(tie)
        } else if first.path_state == broken {
            Some(First)
        } else if second.path_state == broken {
            Some(Second)
        } else if first.is_enabled() && second.is_enabled() {
            let cp_first = self.rg.checkpoint(First);
            let cp_second = self.rg.checkpoint(Second);
            let mut e = if first.is_eol() && second.is_eol() {
                Some(tie)
            } else {
                match mode {
                    ConfigMode::MirrorFirst if cp_second == END_MARKER =>
                        Some(First),
                    ConfigMode::MirrorSecond if cp_first == END_MARKER =>
                        Some(Second),
                    ConfigMode::PassThruFirst => Some(Second),
                    ConfigMode::PassThruSecond => Some(First),
                    _ => None
                }
            };
            if cp_first == END_MARKER && cp_second == END_MARKER {
                e = match mode {
                    ConfigMode::MirrorFirst | ConfigMode::PassThruSecond =>
                        Some(First),
                    _ => Some(Second)
                };
            }
            e
        } else {
            None
        };
        debug!(vd = self.id, %mode, edge = ?r, "find_broken_edge");
        Ok(r)
    }

    /// Has the drive on the failed edge definitively faulted, rather than
    /// merely gone missing?
    pub fn is_downstream_drive_broken(&self) -> bool {
        match self.find_broken_edge() {
            Ok(Some(e)) => self.edge(e).attr.drive_fault,
            _ => false
        }
    }

    /// Does the virtual drive need a permanent spare?
    pub fn check_if_permanent_spare_needed(&self) -> bool {
        match self.downstream_health() {
            DownstreamHealth::Broken => true,
            DownstreamHealth::Disabled => self.flags.attach_edge_timedout(),
            _ => false
        }
    }

    /// Does the virtual drive need a proactive spare?  If so, also returns
    /// the edge that the spare should be swapped into.
    pub fn check_if_proactive_spare_needed(&self) -> (bool, Option<EdgeIndex>)
    {
        let (live, absent) = match self.mode() {
            ConfigMode::PassThruFirst => (EdgeIndex::First, EdgeIndex::Second),
            ConfigMode::PassThruSecond =>
                (EdgeIndex::Second, EdgeIndex::First),
            _ => return (false, None)
        };
        let edge = self.edge(live);
        if edge.is_enabled() && edge.is_eol() &&
            self.rg.checkpoint(live) == END_MARKER &&
            self.rg.path_state(absent) == PathState::Invalid
        {
            (true, Some(absent))
        } else {
            (false, None)
        }
    }

    /// The edge that a permanent spare would replace
    pub fn get_permanent_spare_edge_index(&self) -> Option<EdgeIndex> {
        match self.mode() {
            ConfigMode::PassThruFirst => Some(EdgeIndex::First),
            ConfigMode::PassThruSecond => Some(EdgeIndex::Second),
            _ => None
        }
    }

    /// The edge that should be swapped out, if any
    pub fn get_swap_out_edge_index(&self) -> Result<Option<EdgeIndex>> {
        use EdgeIndex::{First, Second};

        let mode = self.mode();
        let r = match mode {
            ConfigMode::PassThruFirst => Some(Second),
            ConfigMode::PassThruSecond => Some(First),
            ConfigMode::MirrorFirst | ConfigMode::MirrorSecond => {
                let first = self.rg.path_state(First);
                let second = self.rg.path_state(Second);
                if first == PathState::Invalid || second == PathState::Invalid
                {
                    None
                } else if first.is_unavailable() && second.is_unavailable() {
                    // Remove the nominal primary
                    mode.primary()
                } else if first.is_unavailable() {
                    Some(First)
                } else if second.is_unavailable() {
                    Some(Second)
                } else if first == PathState::Enabled &&
                    second == PathState::Enabled
                {
                    let (src, dst) = if mode == ConfigMode::MirrorFirst {
                        (First, Second)
                    } else {
                        (Second, First)
                    };
                    if self.is_copy_complete() {
                        Some(src)
                    } else if !self.is_secondary_edge_healthy() {
                        Some(dst)
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
            ConfigMode::Unknown => {
                error!(vd = self.id, "get_swap_out_edge_index: unknown mode");
                return Err(Error::InvalidConfigMode);
            }
        };
        debug!(vd = self.id, %mode, edge = ?r, "swap-out edge");
        Ok(r)
    }

    /// Is a proactive spare already swapped in?
    pub fn is_proactive_spare_swapped_in(&self) -> bool {
        match self.mode() {
            ConfigMode::PassThruFirst =>
                self.rg.path_state(EdgeIndex::Second) != PathState::Invalid,
            ConfigMode::PassThruSecond =>
                self.rg.path_state(EdgeIndex::First) != PathState::Invalid,
            ConfigMode::MirrorFirst | ConfigMode::MirrorSecond => true,
            ConfigMode::Unknown => false,
        }
    }

    fn check_lifecycle_allows_copy(&self) -> SwapResult {
        match self.lifecycle() {
            LifecycleState::Ready | LifecycleState::Hibernate |
            LifecycleState::PendingHibernate => Ok(()),
            state => {
                warn!(vd = self.id, ?state, "copy refused: lifecycle");
                Err(SwapStatus::VirtualDriveBroken)
            }
        }
    }

    /// A copy needs a single live source edge with no peer.
    fn check_pass_thru_source(&self)
        -> std::result::Result<EdgeIndex, SwapStatus>
    {
        let mode = self.mode();
        let source = match mode {
            ConfigMode::PassThruFirst => EdgeIndex::First,
            ConfigMode::PassThruSecond => EdgeIndex::Second,
            _ => {
                warn!(vd = self.id, %mode, "copy refused: mode");
                return Err(SwapStatus::ConfigModeDoesntSupport);
            }
        };
        let state = self.rg.path_state(source);
        let other = self.rg.path_state(source.other());
        if !matches!(state, PathState::Enabled | PathState::Slumber) ||
            other != PathState::Invalid
        {
            warn!(vd = self.id, %mode, %state, %other,
                  "copy refused: edge states");
            return Err(SwapStatus::ConfigModeDoesntSupport);
        }
        Ok(source)
    }

    /// The source of a copy must be fully rebuilt.
    fn check_source_not_degraded(&self, source: EdgeIndex) -> SwapResult {
        let cp = self.rg.checkpoint(source);
        if self.rg.is_rebuild_logging(source) || cp != END_MARKER {
            warn!(vd = self.id, edge = %source, checkpoint = cp,
                  rl = self.rg.rl_bitmask(), "copy refused: source degraded");
            return Err(SwapStatus::VirtualDriveDegraded);
        }
        Ok(())
    }

    /// May a user-initiated copy begin now?
    pub fn check_if_user_copy_is_allowed(&self) -> SwapResult {
        self.check_lifecycle_allows_copy()?;
        let source = self.check_pass_thru_source()?;
        self.check_source_not_degraded(source)
    }

    /// Validate a permanent spare request from the job service
    pub fn validate_permanent_spare_request(&self, command: SwapCommand,
                                            swap_idx: EdgeIndex) -> SwapResult
    {
        if command != SwapCommand::PermanentSpare {
            error!(vd = self.id, %command, "permanent spare: wrong command");
            return Err(SwapStatus::InvalidCommand);
        }
        let mode = self.mode();
        let Some(primary) = self.get_permanent_spare_edge_index() else {
            warn!(vd = self.id, %mode, "permanent spare: mode");
            return Err(SwapStatus::ConfigModeDoesntSupport);
        };
        if swap_idx != primary {
            error!(vd = self.id, %mode, edge = %swap_idx,
                   "permanent spare: wrong edge");
            return Err(SwapStatus::InternalError);
        }
        if !self.check_if_permanent_spare_needed() {
            debug!(vd = self.id, "permanent spare not required");
            return Err(SwapStatus::PermanentSpareNotRequired);
        }
        let state = self.rg.path_state(swap_idx);
        if is_gone(state) {
            Ok(())
        } else {
            error!(vd = self.id, edge = %swap_idx, %state,
                   "permanent spare: edge is still usable");
            Err(SwapStatus::InternalError)
        }
    }

    /// Validate a proactive copy request from the job service
    pub fn validate_proactive_copy_request(&self, command: SwapCommand,
                                           swap_idx: EdgeIndex) -> SwapResult
    {
        if command != SwapCommand::ProactiveCopy {
            error!(vd = self.id, %command, "proactive copy: wrong command");
            return Err(SwapStatus::InvalidCommand);
        }
        self.check_lifecycle_allows_copy()?;
        let source = self.check_pass_thru_source()?;
        self.check_source_not_degraded(source)?;
        match self.check_if_proactive_spare_needed() {
            (true, Some(e)) if e == swap_idx => Ok(()),
            (true, e) => {
                error!(vd = self.id, edge = %swap_idx, expected = ?e,
                       "proactive copy: wrong edge");
                Err(SwapStatus::InternalError)
            }
            (false, _) => Err(SwapStatus::ProactiveSpareNotRequired)
        }
    }

    /// Is `swap_idx` the edge that should be swapped out right now?
    pub fn validate_swap_out_request(&self, swap_idx: EdgeIndex) -> Result<()>
    {
        match self.get_swap_out_edge_index()? {
            Some(e) if e == swap_idx => Ok(()),
            e => {
                error!(vd = self.id, edge = %swap_idx, expected = ?e,
                       "swap-out: wrong edge");
                Err(Error::InvalidEdgeIndex)
            }
        }
    }

    /// After a swap-out has committed pass-thru mode, the swapped-out edge
    /// must be the one that is no longer in use.
    pub fn validate_swapped_out_edge_index(&self, swap_out: EdgeIndex)
        -> Result<()>
    {
        let expected = match self.mode() {
            ConfigMode::PassThruFirst => EdgeIndex::Second,
            ConfigMode::PassThruSecond => EdgeIndex::First,
            mode => {
                error!(vd = self.id, %mode, "swapped-out edge: mode");
                return Err(Error::InvalidConfigMode);
            }
        };
        if swap_out != expected {
            error!(vd = self.id, edge = %swap_out, %expected,
                   "swapped-out edge: mismatch");
            return Err(Error::InvalidEdgeIndex);
        }
        Ok(())
    }

    /// Check that the non-paged rebuild state agrees with a completed
    /// swap-out of `swap_out`.
    pub fn swap_out_validate_nonpaged_metadata(&self, swap_out: EdgeIndex)
        -> Result<()>
    {
        let mode = self.mode();
        if !mode.is_pass_thru() || mode.secondary() != Some(swap_out) {
            error!(vd = self.id, %mode, edge = %swap_out,
                   "swap-out metadata: mode");
            return Err(Error::GenericFailure);
        }
        let primary = swap_out.other();
        let rg = &self.rg;
        let ok = !rg.is_rebuild_logging(primary) &&
            rg.is_rebuild_logging(swap_out) &&
            rg.checkpoint(swap_out) == 0 &&
            (self.lifecycle() == LifecycleState::Fail ||
             rg.checkpoint(primary) == END_MARKER);
        if ok {
            Ok(())
        } else {
            error!(vd = self.id, edge = %swap_out, rl = rg.rl_bitmask(),
                   primary_cp = rg.checkpoint(primary),
                   swap_out_cp = rg.checkpoint(swap_out),
                   "swap-out metadata: inconsistent");
            Err(Error::GenericFailure)
        }
    }
}

// LCOV_EXCL_STOP
