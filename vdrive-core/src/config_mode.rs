// vim: tw=80
//! Virtual drive configuration modes
//!
//! A virtual drive is either in pass-through mode, where exactly one
//! downstream edge carries data, or in mirror mode, where a second edge is
//! being rebuilt from the first.

use std::{fmt, str::FromStr};

use serde_derive::{Deserialize, Serialize};

use crate::types::*;

/// How the two downstream edges of a virtual drive are being used
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
         Serialize)]
pub enum ConfigMode {
    /// Only the first edge is live
    PassThruFirst,
    /// Only the second edge is live
    PassThruSecond,
    /// The first edge is the source; the second is being copied to.
    MirrorFirst,
    /// The second edge is the source; the first is being copied to.
    MirrorSecond,
    #[default]
    Unknown,
}

impl ConfigMode {
    pub fn is_pass_thru(self) -> bool {
        matches!(self, ConfigMode::PassThruFirst | ConfigMode::PassThruSecond)
    }

    pub fn is_mirror(self) -> bool {
        matches!(self, ConfigMode::MirrorFirst | ConfigMode::MirrorSecond)
    }

    /// The edge that is the data source in this mode
    pub fn primary(self) -> Option<EdgeIndex> {
        match self {
            ConfigMode::PassThruFirst | ConfigMode::MirrorFirst =>
                Some(EdgeIndex::First),
            ConfigMode::PassThruSecond | ConfigMode::MirrorSecond =>
                Some(EdgeIndex::Second),
            ConfigMode::Unknown => None
        }
    }

    /// The edge that is either absent (pass-thru) or the copy destination
    /// (mirror)
    pub fn secondary(self) -> Option<EdgeIndex> {
        self.primary().map(EdgeIndex::other)
    }

    /// Mirror I/O prefers to read from the source position
    pub fn mirror_preferred_position(self) -> Option<EdgeIndex> {
        match self {
            ConfigMode::MirrorFirst => Some(EdgeIndex::First),
            ConfigMode::MirrorSecond => Some(EdgeIndex::Second),
            _ => None
        }
    }

    /// Does this mode name the first edge as its primary?
    ///
    /// Used by tie-breaks that pick a fixed edge per mode.
    pub fn is_first_based(self) -> bool {
        matches!(self, ConfigMode::PassThruFirst | ConfigMode::MirrorFirst)
    }
}

impl fmt::Display for ConfigMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfigMode::PassThruFirst => "pass-thru-first",
            ConfigMode::PassThruSecond => "pass-thru-second",
            ConfigMode::MirrorFirst => "mirror-first",
            ConfigMode::MirrorSecond => "mirror-second",
            ConfigMode::Unknown => "unknown",
        };
        s.fmt(f)
    }
}

impl FromStr for ConfigMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pass-thru-first" => Ok(ConfigMode::PassThruFirst),
            "pass-thru-second" => Ok(ConfigMode::PassThruSecond),
            "mirror-first" => Ok(ConfigMode::MirrorFirst),
            "mirror-second" => Ok(ConfigMode::MirrorSecond),
            _ => Err(Error::InvalidConfigMode)
        }
    }
}

/// The current configuration mode plus the one being transitioned to.
///
/// A mode change is two-phase: the orchestrator records the pending mode
/// with [`set_new`](Self::set_new), drains I/O, and only then calls
/// [`commit`](Self::commit).
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ConfigModeModel {
    current: ConfigMode,
    new: ConfigMode,
}

impl ConfigModeModel {
    pub fn new(mode: ConfigMode) -> Self {
        ConfigModeModel { current: mode, new: mode }
    }

    pub fn current(&self) -> ConfigMode {
        self.current
    }

    pub fn pending(&self) -> ConfigMode {
        self.new
    }

    pub fn set_current(&mut self, mode: ConfigMode) {
        self.current = mode;
    }

    pub fn set_new(&mut self, mode: ConfigMode) {
        self.new = mode;
    }

    /// Is there a mode change waiting to be committed?
    pub fn is_change_pending(&self) -> bool {
        self.new != ConfigMode::Unknown && self.new != self.current
    }

    /// Make the pending mode current.
    pub fn commit(&mut self) -> Result<ConfigMode> {
        if self.new == ConfigMode::Unknown {
            return Err(Error::InvalidConfigMode);
        }
        self.current = self.new;
        Ok(self.current)
    }

    pub fn is_pass_thru(&self) -> bool {
        self.current.is_pass_thru()
    }

    pub fn is_mirror(&self) -> bool {
        self.current.is_mirror()
    }
}

// LCOV_EXCL_STOP
