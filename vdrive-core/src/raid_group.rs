// vim: tw=80
//! The two-way RAID group state that a virtual drive is built on
//!
//! A virtual drive is a degenerate mirror.  This module holds the generic
//! RAID-group fields it shares with other raid groups: edges, geometry, the
//! in-core non-paged metadata and its lock, and the clustered and local state
//! used to coordinate with the peer controller.

use bitfield::bitfield;
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::{
    edge::*,
    nonpaged::*,
    types::*,
};

/// Fixed layout of the raid group
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Geometry {
    /// Number of data disks.  Always 1 for a virtual drive.
    pub data_disks: u64,
    /// Per-disk capacity exported to upstream clients
    pub exported_capacity: BlockT,
    /// Logical address of the start of the paged metadata
    pub paged_md_lba: LbaT,
    /// Size of the paged metadata area, in blocks
    pub paged_md_capacity: BlockT,
}

impl Geometry {
    /// First logical address past the paged metadata
    pub fn paged_end(&self) -> LbaT {
        self.paged_md_lba + self.paged_md_capacity
    }

    /// Exported capacity in logical blocks
    pub fn logical_capacity(&self) -> LbaT {
        self.exported_capacity * self.data_disks
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry {
            data_disks: 1,
            exported_capacity: 0x10_0000,
            paged_md_lba: 0x10_0000,
            paged_md_capacity: 0x800,
        }
    }
}

bitfield! {
    /// RAID-group flags that are visible to the peer controller
    #[derive(Clone, Copy, Default, Deserialize, Eq, PartialEq, Serialize)]
    pub struct ClusteredFlags(u8);
    impl Debug;
    /// A configuration change job owns this raid group
    pub swap_job_in_progress, set_swap_job_in_progress: 0;
}

bitfield! {
    /// RAID-group state that is private to this controller
    #[derive(Clone, Copy, Default, Deserialize, Eq, PartialEq, Serialize)]
    pub struct LocalState(u8);
    impl Debug;
    pub join_request, set_join_request: 0;
    pub join_started, set_join_started: 1;
    pub join_done, set_join_done: 2;
    /// The needs-rebuild marks for a newly enabled edge must be evaluated
    pub eval_mark_nr_request, set_eval_mark_nr_request: 3;
}

impl LocalState {
    const JOIN_MASK: u8 = 0b111;

    /// Is the peer in any phase of joining this raid group?
    pub fn is_join_in_progress(&self) -> bool {
        self.0 & Self::JOIN_MASK != 0
    }
}

/// What this controller knows of its peer
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PeerState {
    pub alive: bool,
    pub lifecycle: LifecycleState,
}

/// RAID-group attributes that other objects may query
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RaidAttributes {
    /// A proactive copy has been accepted by the job service
    pub proactive_sparing: bool,
}

/// The raid group a virtual drive is composed around
#[derive(Clone, Debug)]
pub struct RaidGroupCore {
    pub edges: [Edge; 2],
    pub geometry: Geometry,
    pub lifecycle: LifecycleState,
    /// In-core copy of the non-paged metadata
    pub np: NonPagedMetadata,
    /// Has the non-paged metadata ever been written?
    pub np_initialized: bool,
    np_locked: bool,
    pub clustered: ClusteredFlags,
    pub local_state: LocalState,
    pub peer: PeerState,
    /// Is this the active side of the redundant pair?
    pub active: bool,
    pub attributes: RaidAttributes,
    /// Rebuild of the paged metadata's own chunks is still outstanding
    pub metadata_rebuild_pending: bool,
    /// Background rebuild operations are allowed to run
    pub background_rebuild_enabled: bool,
    /// Position that mirror reads should prefer
    pub mirror_preferred_position: Option<EdgeIndex>,
}

impl RaidGroupCore {
    pub fn new(edges: [Edge; 2], geometry: Geometry) -> Self {
        RaidGroupCore {
            edges,
            geometry,
            lifecycle: LifecycleState::Ready,
            np: NonPagedMetadata::default(),
            np_initialized: true,
            np_locked: false,
            clustered: ClusteredFlags::default(),
            local_state: LocalState::default(),
            peer: PeerState::default(),
            active: true,
            attributes: RaidAttributes::default(),
            metadata_rebuild_pending: false,
            background_rebuild_enabled: true,
            mirror_preferred_position: None,
        }
    }

    pub fn edge(&self, e: EdgeIndex) -> &Edge {
        &self.edges[e.idx()]
    }

    pub fn edge_mut(&mut self, e: EdgeIndex) -> &mut Edge {
        &mut self.edges[e.idx()]
    }

    pub fn path_state(&self, e: EdgeIndex) -> PathState {
        self.edges[e.idx()].path_state
    }

    pub fn server_id(&self, e: EdgeIndex) -> ObjectId {
        self.edges[e.idx()].server_id
    }

    pub fn checkpoint(&self, e: EdgeIndex) -> LbaT {
        self.np.rebuild.checkpoint(e)
    }

    pub fn rl_bitmask(&self) -> u16 {
        self.np.rebuild.rl_bitmask
    }

    pub fn is_rebuild_logging(&self, e: EdgeIndex) -> bool {
        self.np.rebuild.is_rebuild_logging(e)
    }

    pub fn exported_capacity(&self) -> BlockT {
        self.geometry.exported_capacity
    }

    /// Does any position still have data to rebuild?
    pub fn is_rebuild_needed(&self) -> bool {
        self.background_rebuild_enabled &&
            EdgeIndex::ALL.iter().any(|&e| {
                self.checkpoint(e) != END_MARKER && !self.is_rebuild_logging(e)
            })
    }

    /// Acquire the non-paged metadata lock.
    pub fn lock_np(&mut self) -> Result<()> {
        if self.np_locked {
            error!("non-paged metadata lock is already held");
            return Err(Error::LockHeld);
        }
        debug!("non-paged metadata locked");
        self.np_locked = true;
        Ok(())
    }

    /// Release the non-paged metadata lock.
    pub fn unlock_np(&mut self) {
        if !self.np_locked {
            error!("releasing a non-paged metadata lock that isn't held");
        }
        debug!("non-paged metadata unlocked");
        self.np_locked = false;
    }

    pub fn is_np_locked(&self) -> bool {
        self.np_locked
    }

    /// Count the edges in each path state.  An edge reporting timeout errors
    /// counts as broken regardless of its state.
    pub fn path_state_counts(&self) -> PathStateCounts {
        let mut counts = PathStateCounts::default();
        for edge in self.edges.iter() {
            if edge.attr.timeout_errors {
                counts.broken += 1;
                continue;
            }
            match edge.path_state {
                PathState::Enabled | PathState::Slumber => counts.enabled += 1,
                PathState::Disabled => counts.disabled += 1,
                PathState::Broken | PathState::Gone => counts.broken += 1,
                PathState::Invalid => counts.invalid += 1,
            }
        }
        counts
    }
}

/// How many of a raid group's edges are in each class of path state
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PathStateCounts {
    pub enabled: u32,
    pub disabled: u32,
    pub broken: u32,
    pub invalid: u32,
}

// LCOV_EXCL_STOP
