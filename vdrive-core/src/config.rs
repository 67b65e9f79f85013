// vim: tw=80
//! Virtual drive tunables

use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::types::*;

/// Tunables for a virtual drive's sparing and copy behavior.
///
/// Every field has a default, so a YAML document may name only the fields it
/// wants to change.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct VdConfig {
    /// Seconds to wait after a drive goes missing before asking for a
    /// permanent spare.
    pub permanent_spare_trigger_time: u64,

    /// Seconds to wait after a drive is marked End-Of-Life before asking for
    /// a proactive spare.
    pub proactive_copy_trigger_time: u64,

    /// Seconds to wait after a drive is seen to have faulted.
    pub drive_fault_debounce: u64,

    /// Default consumption budget for one copy request, in MiB
    pub copy_consumption_mb: u64,

    /// RAID chunk size in blocks
    pub chunk_size: BlockT,

    /// When false, swap completions are cleaned up synchronously instead of
    /// in monitor context.
    pub operation_confirmation: bool,
}

impl VdConfig {
    pub fn permanent_spare_trigger(&self) -> Duration {
        Duration::from_secs(self.permanent_spare_trigger_time)
    }

    pub fn proactive_copy_trigger(&self) -> Duration {
        Duration::from_secs(self.proactive_copy_trigger_time)
    }

    pub fn drive_fault_debounce(&self) -> Duration {
        Duration::from_secs(self.drive_fault_debounce)
    }

    /// The default consumption budget, in blocks
    pub fn copy_consumption_blocks(&self) -> BlockT {
        self.copy_consumption_mb * 1024 * 1024 / BYTES_PER_BLOCK
    }

    /// Parse a YAML document
    pub fn from_yaml(s: &str) -> Result<Self> {
        let config: VdConfig = serde_yaml_ng::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.copy_consumption_blocks() == 0 {
            Err(Error::InvalidConfig)
        } else {
            Ok(())
        }
    }

    /// Apply a single tunable override
    pub fn set(&mut self, tunable: Tunable) -> Result<()> {
        let old = *self;
        match tunable {
            Tunable::PermanentSpareTriggerTime(v) =>
                self.permanent_spare_trigger_time = v,
            Tunable::ProactiveCopyTriggerTime(v) =>
                self.proactive_copy_trigger_time = v,
            Tunable::DriveFaultDebounce(v) => self.drive_fault_debounce = v,
            Tunable::CopyConsumptionMb(v) => self.copy_consumption_mb = v,
            Tunable::ChunkSize(v) => self.chunk_size = v,
            Tunable::OperationConfirmation(v) =>
                self.operation_confirmation = v,
        }
        self.validate().inspect_err(|_| *self = old)
    }
}

impl Default for VdConfig {
    fn default() -> Self {
        VdConfig {
            permanent_spare_trigger_time:
                DEFAULT_PERMANENT_SPARE_TRIGGER_TIME.as_secs(),
            proactive_copy_trigger_time: PROACTIVE_COPY_TRIGGER_TIME.as_secs(),
            drive_fault_debounce: DRIVE_FAULT_DEBOUNCE.as_secs(),
            copy_consumption_mb: 8,
            chunk_size: DEFAULT_CHUNK_SIZE,
            operation_confirmation: true,
        }
    }
}

/// A single `name=value` override of one [`VdConfig`] field
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Tunable {
    PermanentSpareTriggerTime(u64),
    ProactiveCopyTriggerTime(u64),
    DriveFaultDebounce(u64),
    CopyConsumptionMb(u64),
    ChunkSize(BlockT),
    OperationConfirmation(bool),
}

impl TryFrom<&str> for Tunable {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        let (name, value) = s.split_once('=').ok_or(Error::InvalidConfig)?;
        let num = || value.parse::<u64>().map_err(|_| Error::InvalidConfig);
        match name {
            "permanent_spare_trigger_time" =>
                num().map(Tunable::PermanentSpareTriggerTime),
            "proactive_copy_trigger_time" =>
                num().map(Tunable::ProactiveCopyTriggerTime),
            "drive_fault_debounce" => num().map(Tunable::DriveFaultDebounce),
            "copy_consumption_mb" => num().map(Tunable::CopyConsumptionMb),
            "chunk_size" => num().map(Tunable::ChunkSize),
            "operation_confirmation" => match value {
                "true" | "on" => Ok(Tunable::OperationConfirmation(true)),
                "false" | "off" => Ok(Tunable::OperationConfirmation(false)),
                _ => Err(Error::InvalidConfig)
            },
            _ => Err(Error::InvalidConfig)
        }
    }
}

// LCOV_EXCL_STOP
