// vim: tw=80
//! The virtual drive aggregate
//!
//! A [`VirtualDrive`] owns its raid group state, its transient flags and
//! timers, and handles to every collaborator.  The sparing, copy, checkpoint
//! and notification logic live in their own modules as further `impl
//! VirtualDrive` blocks.

use std::fmt;

use serde::{de, Deserializer};
use serde_derive::{Deserialize, Serialize};
use tracing::info;

use crate::{
    config::VdConfig,
    config_mode::*,
    edge::*,
    flags::VdFlags,
    nonpaged::*,
    raid_group::*,
    services::*,
    timer::Timers,
    types::*,
};

/// Handles to the collaborators that a virtual drive talks to
pub struct Services {
    pub metadata: Box<dyn MetadataStore>,
    pub jobs: Box<dyn JobService>,
    pub upstream: Box<dyn Upstream>,
    pub rebuild: Box<dyn RebuildIo>,
    pub notifier: Box<dyn Notifier>,
    pub event_log: Box<dyn EventLog>,
    pub scheduler: Box<dyn Scheduler>,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

#[cfg(test)]
impl Services {
    /// Mock collaborators with no expectations.  Tests replace the ones they
    /// expect to be used.
    pub fn mocked() -> Self {
        Services {
            metadata: Box::new(MockMetadataStore::new()),
            jobs: Box::new(MockJobService::new()),
            upstream: Box::new(MockUpstream::new()),
            rebuild: Box::new(MockRebuildIo::new()),
            notifier: Box::new(MockNotifier::new()),
            event_log: Box::new(MockEventLog::new()),
            scheduler: Box::new(MockScheduler::new()),
        }
    }
}

/// What the copy notifier has already told the world about the current copy
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CopyTracking {
    /// Provisioned drives that were sent a Start notification, indexed by
    /// edge
    pub rebuilt_pvds: [ObjectId; 2],
    /// Last percentage reported, indexed by edge
    pub previous_percent: [u32; 2],
    pub blocks_rebuilt: [BlockT; 2],
}

impl CopyTracking {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl Default for CopyTracking {
    fn default() -> Self {
        CopyTracking {
            rebuilt_pvds: [OBJECT_ID_INVALID; 2],
            previous_percent: [0; 2],
            blocks_rebuilt: [0; 2],
        }
    }
}

/// A two-edge virtual drive
#[derive(Debug)]
pub struct VirtualDrive {
    pub(crate) id: ObjectId,
    pub(crate) config: VdConfig,
    pub(crate) mode: ConfigModeModel,
    pub(crate) flags: VdFlags,
    pub(crate) swap_in_edge: Option<EdgeIndex>,
    pub(crate) swap_out_edge: Option<EdgeIndex>,
    pub(crate) timers: Timers,
    pub(crate) copy_request_type: SwapCommand,
    /// Last completion code from the job service
    pub(crate) job_status: JobError,
    /// The drive that was in place before any spare was swapped in
    pub(crate) orig_pvd: ObjectId,
    pub(crate) tracking: CopyTracking,
    pub(crate) rg: RaidGroupCore,
    pub(crate) services: Services,
}

impl VirtualDrive {
    pub fn new(id: ObjectId, mode: ConfigMode, rg: RaidGroupCore,
               config: VdConfig, services: Services) -> Self
    {
        let mut rg = rg;
        rg.mirror_preferred_position = mode.mirror_preferred_position();
        VirtualDrive {
            id,
            config,
            mode: ConfigModeModel::new(mode),
            flags: VdFlags::default(),
            swap_in_edge: None,
            swap_out_edge: None,
            timers: Timers::default(),
            copy_request_type: SwapCommand::Invalid,
            job_status: JobError::NoError,
            orig_pvd: OBJECT_ID_INVALID,
            tracking: CopyTracking::default(),
            rg,
            services,
        }
    }

    /// Build a virtual drive from a YAML-friendly description
    pub fn from_description(desc: DriveDescription, services: Services)
        -> Result<Self>
    {
        if desc.mode == ConfigMode::Unknown {
            return Err(Error::InvalidConfigMode);
        }
        let mut rg = RaidGroupCore::new(desc.edges, desc.geometry);
        rg.lifecycle = desc.lifecycle;
        rg.active = desc.active;
        rg.peer = desc.peer;
        rg.metadata_rebuild_pending = desc.metadata_rebuild_pending;
        rg.np.rebuild = RebuildInfo::from_parts(desc.checkpoints,
                                                desc.rebuild_logging);
        rg.np.flags = desc.np_flags.into();
        let mut vd = VirtualDrive::new(desc.id, desc.mode, rg, desc.config,
                                       services);
        vd.flags.set_attach_edge_timedout(desc.attach_edge_timedout);
        if let Some(orig) = desc.orig_pvd {
            vd.orig_pvd = orig;
        }
        info!(vd = vd.id, mode = %vd.mode(), "virtual drive loaded");
        Ok(vd)
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn config(&self) -> &VdConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut VdConfig {
        &mut self.config
    }

    /// The current configuration mode
    pub fn mode(&self) -> ConfigMode {
        self.mode.current()
    }

    pub fn pending_mode(&self) -> ConfigMode {
        self.mode.pending()
    }

    /// Record a configuration mode that the next configuration change will
    /// commit.
    pub fn set_new_mode(&mut self, mode: ConfigMode) {
        self.mode.set_new(mode);
    }

    /// Make the pending configuration mode current.
    pub fn commit_mode(&mut self) -> Result<ConfigMode> {
        let mode = self.mode.commit()?;
        self.rg.mirror_preferred_position = mode.mirror_preferred_position();
        info!(vd = self.id, %mode, "configuration mode changed");
        Ok(mode)
    }

    pub fn flags(&self) -> VdFlags {
        self.flags
    }

    pub fn flags_mut(&mut self) -> &mut VdFlags {
        &mut self.flags
    }

    pub fn np(&self) -> &NonPagedMetadata {
        &self.rg.np
    }

    pub fn rg(&self) -> &RaidGroupCore {
        &self.rg
    }

    pub fn rg_mut(&mut self) -> &mut RaidGroupCore {
        &mut self.rg
    }

    pub fn swap_in_edge(&self) -> Option<EdgeIndex> {
        self.swap_in_edge
    }

    pub fn swap_out_edge(&self) -> Option<EdgeIndex> {
        self.swap_out_edge
    }

    pub fn set_swap_in_edge(&mut self, e: Option<EdgeIndex>) {
        self.swap_in_edge = e;
    }

    pub fn set_swap_out_edge(&mut self, e: Option<EdgeIndex>) {
        self.swap_out_edge = e;
    }

    pub fn copy_request_type(&self) -> SwapCommand {
        self.copy_request_type
    }

    pub fn set_copy_request_type(&mut self, cmd: SwapCommand) {
        self.copy_request_type = cmd;
    }

    pub fn job_status(&self) -> JobError {
        self.job_status
    }

    pub fn orig_pvd(&self) -> ObjectId {
        self.orig_pvd
    }

    pub fn tracking(&self) -> &CopyTracking {
        &self.tracking
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.rg.lifecycle
    }

    pub fn edge(&self, e: EdgeIndex) -> &Edge {
        self.rg.edge(e)
    }
}

/// Persistent flags as written in a drive description
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct NpFlagsDescription {
    pub swapped_in: bool,
    pub no_spare_reported: bool,
    pub source_drive_failed: bool,
    pub mark_nr_required: bool,
    pub degraded_needs_rebuild: bool,
}

impl From<NpFlagsDescription> for NpFlags {
    fn from(d: NpFlagsDescription) -> Self {
        let mut flags = NpFlags::default();
        flags.set_swapped_in(d.swapped_in);
        flags.set_no_spare_reported(d.no_spare_reported);
        flags.set_source_drive_failed(d.source_drive_failed);
        flags.set_mark_nr_required(d.mark_nr_required);
        flags.set_degraded_needs_rebuild(d.degraded_needs_rebuild);
        flags
    }
}

/// Description of a virtual drive's state, as loaded by the CLI
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DriveDescription {
    pub id: ObjectId,
    pub mode: ConfigMode,
    pub lifecycle: LifecycleState,
    pub active: bool,
    pub peer: PeerState,
    /// One or two edges.  A missing second edge is not attached.
    #[serde(deserialize_with = "deserialize_edges")]
    pub edges: [Edge; 2],
    pub geometry: Geometry,
    /// Rebuild checkpoint per edge.  Omit for a fully rebuilt edge.
    pub checkpoints: [Option<LbaT>; 2],
    pub rebuild_logging: [bool; 2],
    pub np_flags: NpFlagsDescription,
    pub metadata_rebuild_pending: bool,
    pub attach_edge_timedout: bool,
    pub orig_pvd: Option<ObjectId>,
    pub config: VdConfig,
}

fn deserialize_edges<'de, D>(d: D) -> std::result::Result<[Edge; 2], D::Error>
    where D: Deserializer<'de>
{
    let v = <Vec<Edge> as serde::Deserialize>::deserialize(d)?;
    if v.len() > 2 {
        return Err(de::Error::invalid_length(v.len(), &"at most two edges"));
    }
    let mut edges = [Edge::default(); 2];
    for (slot, edge) in edges.iter_mut().zip(v) {
        *slot = edge;
    }
    Ok(edges)
}

impl DriveDescription {
    pub fn from_yaml(s: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(s)?)
    }
}

impl Default for DriveDescription {
    fn default() -> Self {
        DriveDescription {
            id: 1,
            mode: ConfigMode::PassThruFirst,
            lifecycle: LifecycleState::Ready,
            active: true,
            peer: PeerState::default(),
            edges: [Edge::default(); 2],
            geometry: Geometry::default(),
            checkpoints: [None; 2],
            rebuild_logging: [false; 2],
            np_flags: NpFlagsDescription::default(),
            metadata_rebuild_pending: false,
            attach_edge_timedout: false,
            orig_pvd: None,
            config: VdConfig::default(),
        }
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use pretty_assertions::assert_eq;

    use super::*;

    const YAML: &str = r#"
id: 7
mode: MirrorFirst
edges:
  - path_state: Enabled
    server_id: 100
    attr:
      eol: true
  - path_state: Enabled
    server_id: 101
checkpoints: [null, 4096]
rebuild_logging: [false, false]
np_flags:
  swapped_in: true
config:
  permanent_spare_trigger_time: 10
"#;

    #[test]
    fn from_description() {
        let desc = DriveDescription::from_yaml(YAML).unwrap();
        let vd = VirtualDrive::from_description(desc, Services::mocked())
            .unwrap();
        assert_eq!(vd.id(), 7);
        assert_eq!(vd.mode(), ConfigMode::MirrorFirst);
        assert_eq!(vd.rg().checkpoint(EdgeIndex::Second), 4096);
        assert_eq!(vd.rg().checkpoint(EdgeIndex::First), END_MARKER);
        assert!(vd.np().flags.swapped_in());
        assert!(vd.edge(EdgeIndex::First).is_eol());
        assert_eq!(vd.config().permanent_spare_trigger_time, 10);
        assert_eq!(vd.rg().mirror_preferred_position,
                   Some(EdgeIndex::First));
        assert_eq!(vd.orig_pvd(), OBJECT_ID_INVALID);
    }

    #[test]
    fn one_edge() {
        let desc = DriveDescription::from_yaml(r#"
mode: PassThruSecond
edges:
  - path_state: Enabled
    server_id: 100
"#).unwrap();
        assert_eq!(desc.edges[0].server_id, 100);
        assert_eq!(desc.edges[1], Edge::default());
    }

    #[test]
    fn three_edges() {
        let r = DriveDescription::from_yaml(r#"
edges:
  - path_state: Enabled
  - path_state: Enabled
  - path_state: Enabled
"#);
        assert_eq!(r.err(), Some(Error::InvalidConfig));
    }

    #[test]
    fn from_description_unknown_mode() {
        let desc = DriveDescription {
            mode: ConfigMode::Unknown,
            ..Default::default()
        };
        let r = VirtualDrive::from_description(desc, Services::mocked());
        assert_eq!(r.err(), Some(Error::InvalidConfigMode));
    }

    #[test]
    fn commit_mode_updates_preferred_position() {
        let desc = DriveDescription::default();
        let mut vd = VirtualDrive::from_description(desc, Services::mocked())
            .unwrap();
        assert_eq!(vd.rg().mirror_preferred_position, None);
        vd.set_new_mode(ConfigMode::MirrorSecond);
        assert_eq!(vd.commit_mode(), Ok(ConfigMode::MirrorSecond));
        assert_eq!(vd.rg().mirror_preferred_position,
                   Some(EdgeIndex::Second));
    }

    #[test]
    fn tracking_reset() {
        let mut t = CopyTracking {
            rebuilt_pvds: [3, 4],
            previous_percent: [0, 50],
            blocks_rebuilt: [1, 2],
        };
        t.reset();
        assert_eq!(t, CopyTracking::default());
    }
}
// LCOV_EXCL_STOP
