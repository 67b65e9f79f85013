// vim: tw=80
//! Downstream edges: the connections from a virtual drive to its drives

use std::fmt;

use serde_derive::{Deserialize, Serialize};

use crate::types::*;

/// Connection state of a downstream edge
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum PathState {
    /// No drive attached
    #[default]
    Invalid,
    Enabled,
    /// Attached, but temporarily unusable
    Disabled,
    /// Attached, but failed
    Broken,
    /// Attached and spun down
    Slumber,
    /// Drive removed
    Gone,
}

impl PathState {
    /// Is the edge unable to service I/O right now?
    pub fn is_unavailable(self) -> bool {
        matches!(self, PathState::Disabled | PathState::Broken)
    }
}

impl fmt::Display for PathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Attributes that a drive advertises on its upstream edge
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct PathAttr {
    /// The drive is predicted to fail soon
    pub eol: bool,
    /// The drive has definitively faulted
    pub drive_fault: bool,
    /// I/O to the drive is timing out
    pub timeout_errors: bool,
}

/// One downstream edge of a virtual drive
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Edge {
    pub path_state: PathState,
    pub attr: PathAttr,
    /// Object id of the provisioned drive on the other end
    pub server_id: ObjectId,
    pub location: DriveLocation,
}

impl Edge {
    pub fn new(path_state: PathState, server_id: ObjectId) -> Self {
        Edge {
            path_state,
            server_id,
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.path_state == PathState::Enabled
    }

    pub fn is_eol(&self) -> bool {
        self.attr.eol
    }
}

impl Default for Edge {
    fn default() -> Self {
        Edge {
            path_state: PathState::Invalid,
            attr: PathAttr::default(),
            server_id: OBJECT_ID_INVALID,
            location: DriveLocation::default(),
        }
    }
}

/// Aggregate health of a virtual drive's downstream edges
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DownstreamHealth {
    Optimal,
    Degraded,
    Disabled,
    Broken,
}

impl fmt::Display for DownstreamHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// LCOV_EXCL_STOP
