// vim: tw=80
//! Non-paged metadata: the small, always-resident, crash-persistent record
//! kept for each virtual drive.

use std::hash::{Hash, Hasher};

use bitfield::bitfield;
use byteorder::{BigEndian, ByteOrder};
use metrohash::MetroHash64;
use serde_derive::{Deserialize, Serialize};

use crate::types::*;

/*
 * On-disk Non-Paged Record Format (all integers big-endian):
 *
 * Checksum:    8 bytes     MetroHash64 over everything that follows
 * Flags:       1 byte      NpFlags
 * Pad:         1 byte
 * RL bitmask:  2 bytes     Rebuild-logging positions
 * Slot 0:      16 bytes    Checkpoint (8) + position (1) + pad (7)
 * Slot 1:      16 bytes    Checkpoint (8) + position (1) + pad (7)
 * Verify:      24 bytes    Error, incomplete-write, and system verify
 *                          checkpoints
 * Glitching:   2 bytes     Positions that glitched since the last write
 * Paged sum.:  4 bytes     valid (1) + verify (1) + needs-rebuild (2)
 * Pad:         2 bytes
 *
 * Field offsets below are relative to the start of Flags, which is how the
 * metadata service addresses single-field writes.
 */
const CHECKSUM_LEN: usize = 8;
const FLAGS_OFFSET: usize = 0;
const REBUILD_OFFSET: usize = 2;
const SLOT_LEN: usize = 16;
const REBUILD_LEN: usize = 2 + 2 * SLOT_LEN;
const VERIFY_OFFSET: usize = REBUILD_OFFSET + REBUILD_LEN;
const VERIFY_LEN: usize = 24;
const GLITCH_OFFSET: usize = VERIFY_OFFSET + VERIFY_LEN;
const PAGED_OFFSET: usize = GLITCH_OFFSET + 2;
const PAGED_LEN: usize = 4;
/// Size of the record body, excluding the checksum
pub const NP_BODY_LEN: usize = PAGED_OFFSET + PAGED_LEN + 2;
/// Size of the complete record
pub const NP_RECORD_LEN: usize = CHECKSUM_LEN + NP_BODY_LEN;
const POSITION_INVALID: u8 = 0xff;

bitfield! {
    /// Persistent virtual drive flags
    #[derive(Clone, Copy, Default, Deserialize, Eq, PartialEq, Serialize)]
    pub struct NpFlags(u8);
    impl Debug;
    /// An edge was swapped in and the swap has not yet been finalised
    pub swapped_in, set_swapped_in: 0;
    /// The no-spare warning has been logged
    pub no_spare_reported, set_no_spare_reported: 1;
    /// The copy source failed mid-copy
    pub source_drive_failed, set_source_drive_failed: 2;
    /// The swapped-in edge must be marked needs-rebuild
    pub mark_nr_required, set_mark_nr_required: 3;
    pub reconstruct_required, _: 4;
    pub error_verify_required, _: 5;
    /// Pass-thru, but the live edge isn't fully rebuilt
    pub degraded_needs_rebuild, set_degraded_needs_rebuild: 6;
    pub iw_verify_required, _: 7;
}

/// Tri-state modifier for one persistent flag
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FlagChange {
    /// Leave the flag as it is
    #[default]
    Keep,
    Set,
    Clear,
}

impl FlagChange {
    /// Build from the `(modify, value)` pair convention
    pub fn from_pair(modify: bool, value: bool) -> Self {
        match (modify, value) {
            (false, _) => FlagChange::Keep,
            (true, true) => FlagChange::Set,
            (true, false) => FlagChange::Clear,
        }
    }

    fn apply(self, current: bool) -> bool {
        match self {
            FlagChange::Keep => current,
            FlagChange::Set => true,
            FlagChange::Clear => false,
        }
    }
}

/// Requested changes to the four independently-modifiable persistent flags
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlagChanges {
    pub swapped_in: FlagChange,
    pub mark_nr_required: FlagChange,
    pub source_drive_failed: FlagChange,
    pub degraded_needs_rebuild: FlagChange,
}

/// Compute a new flags word from `current` and the requested changes.
pub fn determine_flags(current: NpFlags, changes: FlagChanges) -> NpFlags {
    let mut flags = current;
    flags.set_swapped_in(changes.swapped_in.apply(current.swapped_in()));
    flags.set_mark_nr_required(
        changes.mark_nr_required.apply(current.mark_nr_required()));
    flags.set_source_drive_failed(
        changes.source_drive_failed.apply(current.source_drive_failed()));
    flags.set_degraded_needs_rebuild(
        changes.degraded_needs_rebuild.apply(current.degraded_needs_rebuild()));
    flags
}

/// One rebuild checkpoint slot.  A slot with no position is unused.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CheckpointSlot {
    pub checkpoint: LbaT,
    pub position: Option<EdgeIndex>,
}

impl CheckpointSlot {
    pub const UNUSED: Self = CheckpointSlot {
        checkpoint: END_MARKER,
        position: None
    };

    pub const fn new(checkpoint: LbaT, position: EdgeIndex) -> Self {
        CheckpointSlot { checkpoint, position: Some(position) }
    }
}

impl Default for CheckpointSlot {
    fn default() -> Self {
        Self::UNUSED
    }
}

/// Rebuild checkpoints and the rebuild-logging bitmask
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RebuildInfo {
    /// Positions that are currently excluded from redundancy
    pub rl_bitmask: u16,
    pub slots: [CheckpointSlot; 2],
}

impl RebuildInfo {
    /// Rebuild checkpoint of `edge`.  An edge without a slot is fully
    /// rebuilt.
    pub fn checkpoint(&self, edge: EdgeIndex) -> LbaT {
        self.slots.iter()
            .find(|s| s.position == Some(edge))
            .map(|s| s.checkpoint)
            .unwrap_or(END_MARKER)
    }

    /// Build from per-edge checkpoints and rebuild-logging bits.  An edge
    /// whose checkpoint is `None` is not rebuilding and gets no slot.
    pub fn from_parts(checkpoints: [Option<LbaT>; 2], rl: [bool; 2]) -> Self
    {
        let mut ri = RebuildInfo::default();
        let mut slots = ri.slots.iter_mut();
        for e in EdgeIndex::ALL {
            if rl[e.idx()] {
                ri.rl_bitmask |= e.bit();
            }
            if let Some(cp) = checkpoints[e.idx()] {
                if let Some(slot) = slots.next() {
                    *slot = CheckpointSlot::new(cp, e);
                }
            }
        }
        ri
    }

    pub fn is_rebuild_logging(&self, edge: EdgeIndex) -> bool {
        self.rl_bitmask & edge.bit() != 0
    }

    /// Does every edge satisfy "checkpoint is the end marker iff its
    /// rebuild-logging bit is clear"?
    pub fn is_consistent(&self) -> bool {
        EdgeIndex::ALL.iter().all(|&e| {
            (self.checkpoint(e) == END_MARKER) != self.is_rebuild_logging(e)
        })
    }
}

/// Size of one encoded paged-metadata chunk entry
pub const PAGED_ENTRY_LEN: u64 = PAGED_LEN as u64;

/// Paged-metadata chunk entry
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PagedEntry {
    pub valid: bool,
    pub verify: u8,
    pub needs_rebuild: u16,
}

/// In-core copy of a virtual drive's non-paged metadata
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct NonPagedMetadata {
    pub flags: NpFlags,
    pub rebuild: RebuildInfo,
    /// Error, incomplete-write, and system verify checkpoints
    pub verify_checkpoints: [LbaT; 3],
    pub glitching_bitmask: u16,
    /// Summary of the paged metadata's own metadata chunks
    pub paged_summary: PagedEntry,
}

/// Individually writable fields of the non-paged record
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NpField {
    Flags,
    RebuildInfo,
    VerifyCheckpoints,
    GlitchingBitmask,
    PagedSummary,
}

impl NpField {
    pub const ALL: [NpField; 5] = [
        NpField::Flags,
        NpField::RebuildInfo,
        NpField::VerifyCheckpoints,
        NpField::GlitchingBitmask,
        NpField::PagedSummary,
    ];

    /// Byte offset of the field within the record body
    pub const fn offset(self) -> usize {
        match self {
            NpField::Flags => FLAGS_OFFSET,
            NpField::RebuildInfo => REBUILD_OFFSET,
            NpField::VerifyCheckpoints => VERIFY_OFFSET,
            NpField::GlitchingBitmask => GLITCH_OFFSET,
            NpField::PagedSummary => PAGED_OFFSET,
        }
    }

    pub const fn len(self) -> usize {
        match self {
            NpField::Flags => 1,
            NpField::RebuildInfo => REBUILD_LEN,
            NpField::VerifyCheckpoints => VERIFY_LEN,
            NpField::GlitchingBitmask => 2,
            NpField::PagedSummary => PAGED_LEN,
        }
    }

    /// Find the field that begins at `offset`
    pub fn at(offset: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.offset() == offset)
    }
}

fn encode_position(p: Option<EdgeIndex>) -> u8 {
    p.map(|e| e as u8).unwrap_or(POSITION_INVALID)
}

fn decode_position(b: u8) -> Result<Option<EdgeIndex>> {
    match b {
        POSITION_INVALID => Ok(None),
        _ => EdgeIndex::try_from(u32::from(b))
            .map(Some)
            .map_err(|_| Error::MetadataCorruption)
    }
}

impl NonPagedMetadata {
    /// Encode a single field, as it would be written by a single-field
    /// non-paged write.
    pub fn encode_field(&self, field: NpField) -> Vec<u8> {
        let mut buf = vec![0u8; field.len()];
        match field {
            NpField::Flags => buf[0] = self.flags.0,
            NpField::RebuildInfo => {
                BigEndian::write_u16(&mut buf[0..2], self.rebuild.rl_bitmask);
                for (i, slot) in self.rebuild.slots.iter().enumerate() {
                    let base = 2 + i * SLOT_LEN;
                    BigEndian::write_u64(&mut buf[base..base + 8],
                                         slot.checkpoint);
                    buf[base + 8] = encode_position(slot.position);
                }
            }
            NpField::VerifyCheckpoints => {
                BigEndian::write_u64_into(&self.verify_checkpoints, &mut buf);
            }
            NpField::GlitchingBitmask => {
                BigEndian::write_u16(&mut buf, self.glitching_bitmask);
            }
            NpField::PagedSummary => {
                buf[0] = u8::from(self.paged_summary.valid);
                buf[1] = self.paged_summary.verify;
                BigEndian::write_u16(&mut buf[2..4],
                                     self.paged_summary.needs_rebuild);
            }
        }
        buf
    }

    /// Apply the result of a single-field write to this in-core copy.
    pub fn decode_field(&mut self, field: NpField, buf: &[u8]) -> Result<()> {
        if buf.len() != field.len() {
            return Err(Error::MetadataCorruption);
        }
        match field {
            NpField::Flags => self.flags = NpFlags(buf[0]),
            NpField::RebuildInfo => {
                self.rebuild.rl_bitmask = BigEndian::read_u16(&buf[0..2]);
                for i in 0..2 {
                    let base = 2 + i * SLOT_LEN;
                    self.rebuild.slots[i] = CheckpointSlot {
                        checkpoint: BigEndian::read_u64(&buf[base..base + 8]),
                        position: decode_position(buf[base + 8])?,
                    };
                }
            }
            NpField::VerifyCheckpoints => {
                BigEndian::read_u64_into(buf, &mut self.verify_checkpoints);
            }
            NpField::GlitchingBitmask => {
                self.glitching_bitmask = BigEndian::read_u16(buf);
            }
            NpField::PagedSummary => {
                self.paged_summary = PagedEntry {
                    valid: buf[0] != 0,
                    verify: buf[1],
                    needs_rebuild: BigEndian::read_u16(&buf[2..4]),
                };
            }
        }
        Ok(())
    }

    /// Encode the record body, without its checksum.  This is what a
    /// whole-record non-paged write carries.
    pub fn encode_body(&self) -> Vec<u8> {
        let mut body = vec![0u8; NP_BODY_LEN];
        for field in NpField::ALL {
            let start = field.offset();
            body[start..start + field.len()]
                .copy_from_slice(&self.encode_field(field));
        }
        body
    }

    fn checksum(body: &[u8]) -> u64 {
        let mut hasher = MetroHash64::new();
        (body.len() as u64).to_be().hash(&mut hasher);
        hasher.write(body);
        hasher.finish()
    }

    /// Serialize the whole record, including its checksum
    pub fn to_record(&self) -> Vec<u8> {
        let body = self.encode_body();
        let mut record = vec![0u8; CHECKSUM_LEN];
        BigEndian::write_u64(&mut record, Self::checksum(&body));
        record.extend_from_slice(&body);
        record
    }

    /// Deserialize a whole record, verifying its checksum
    pub fn from_record(record: &[u8]) -> Result<Self> {
        if record.len() != NP_RECORD_LEN {
            return Err(Error::MetadataCorruption);
        }
        let body = &record[CHECKSUM_LEN..];
        if BigEndian::read_u64(&record[..CHECKSUM_LEN]) != Self::checksum(body)
        {
            return Err(Error::MetadataCorruption);
        }
        Self::decode_body(body)
    }

    /// Decode a record body, as produced by
    /// [`encode_body`](Self::encode_body)
    pub fn decode_body(body: &[u8]) -> Result<Self> {
        if body.len() != NP_BODY_LEN {
            return Err(Error::MetadataCorruption);
        }
        let mut np = NonPagedMetadata::default();
        for field in NpField::ALL {
            let start = field.offset();
            np.decode_field(field, &body[start..start + field.len()])?;
        }
        Ok(np)
    }
}

// LCOV_EXCL_STOP
