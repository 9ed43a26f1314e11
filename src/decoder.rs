//! Conversion of logged streaming frames into per-axis sample sequences.
//!
//! Data frame payload:
//!
//! ```text
//! byte 0     streaming format (echo)
//! byte 1     sequence counter, wraps at 256
//! bytes 2..8 three little-endian u16 sample slots
//! ```

use log::debug;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::frame::LogEntry;
use crate::identifier::Identifier;
use crate::streaming::{DataSetLayout, StreamingFormat};

const COUNTER_OFFSET: usize = 1;
const SAMPLE_OFFSET: usize = 2;
const SLOTS: usize = 3;
const DATA_FRAME_LEN: usize = SAMPLE_OFFSET + 2 * SLOTS;

/// Decoded samples of one streaming run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleSet {
    /// One sequence per axis, empty when the axis was not streamed.
    pub axes: [Vec<u16>; 3],
    /// Sequence counter of the frame every sample came from, parallel to `axes`.
    pub counters: Option<[Vec<u8>; 3]>,
}

impl SampleSet {
    pub fn axis(&self, axis: usize) -> &[u16] {
        &self.axes[axis]
    }

    /// Total number of samples over all axes.
    pub fn len(&self) -> usize {
        self.axes.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames lost according to the sequence counters (0 without counters).
    pub fn sequence_gaps(&self) -> usize {
        self.counters
            .as_ref()
            .and_then(|counters| counters.iter().find(|c| !c.is_empty()))
            .map_or(0, |counters| sequence_gaps(counters))
    }
}

/// Count missing frames in a counter sequence.
///
/// Consecutive equal values belong to the same frame (several retained
/// samples per frame) and are not gaps. Every other jump counts as loss,
/// modulo 256: the log keeps arrival order, so a counter going backwards
/// means the sequence wrapped past the frames in between.
pub fn sequence_gaps(counters: &[u8]) -> usize {
    let mut gaps = 0usize;
    let mut last: Option<u8> = None;
    for &counter in counters {
        if let Some(prev) = last {
            if counter != prev {
                gaps += counter.wrapping_sub(prev.wrapping_add(1)) as usize;
            }
        }
        last = Some(counter);
    }
    gaps
}

/// Axis every sample slot of a frame is assigned to, `None` for unused slots.
fn slot_axes(layout: DataSetLayout, axes: [bool; 3]) -> [Option<usize>; SLOTS] {
    let mut slots = [None; SLOTS];
    match layout {
        DataSetLayout::Interleaved3 => {
            for (axis, &enabled) in axes.iter().enumerate() {
                if enabled {
                    slots[axis] = Some(axis);
                }
            }
        }
        DataSetLayout::Single => {
            let enabled: Vec<usize> = (0..3).filter(|&axis| axes[axis]).collect();
            if let [only] = enabled.as_slice() {
                slots = [Some(*only); SLOTS];
            } else {
                for (slot, axis) in enabled.into_iter().enumerate() {
                    slots[slot] = Some(axis);
                }
            }
        }
    }
    slots
}

/// Visit every retained sample as `(axis, value, counter)`.
fn walk<F>(
    layout: DataSetLayout,
    axes: [bool; 3],
    expected: Identifier,
    entries: &[LogEntry],
    mut emit: F,
) -> Result<()>
where
    F: FnMut(usize, u16, u8),
{
    let slots = slot_axes(layout, axes);
    let mut skipped = 0usize;
    for entry in entries {
        let frame = &entry.frame;
        if frame.identifier != expected || frame.len() < DATA_FRAME_LEN {
            skipped += 1;
            continue;
        }
        let payload = frame.payload();
        let format = StreamingFormat::from_byte(payload[0])?;
        if format.layout.is_none() {
            // stop acknowledgement
            skipped += 1;
            continue;
        }
        let counter = payload[COUNTER_OFFSET];
        for (slot, axis) in slots.iter().enumerate() {
            if let Some(axis) = *axis {
                let at = SAMPLE_OFFSET + 2 * slot;
                emit(axis, u16::from_le_bytes([payload[at], payload[at + 1]]), counter);
            }
        }
    }
    if skipped > 0 {
        debug!("decoder skipped {skipped} of {} frames", entries.len());
    }
    Ok(())
}

/// Decode the samples of `entries` that carry the `expected` identifier.
pub fn decode(
    layout: DataSetLayout,
    axes: [bool; 3],
    expected: Identifier,
    entries: &[LogEntry],
) -> Result<SampleSet> {
    let mut set = SampleSet::default();
    walk(layout, axes, expected, entries, |axis, value, _| {
        set.axes[axis].push(value)
    })?;
    Ok(set)
}

/// Sequence counters parallel to what [`decode`] returns.
pub fn decode_counters(
    layout: DataSetLayout,
    axes: [bool; 3],
    expected: Identifier,
    entries: &[LogEntry],
) -> Result<[Vec<u8>; 3]> {
    let mut counters: [Vec<u8>; 3] = Default::default();
    walk(layout, axes, expected, entries, |axis, _, counter| {
        counters[axis].push(counter)
    })?;
    Ok(counters)
}
