//! Append-only log of received frames.
//!
//! The background receiver is the only writer. Readers address entries by a
//! global index that stays valid for the whole session: a reset discards the
//! stored entries but keeps counting, so an index handed out before the reset
//! never refers to a different frame afterwards.

use std::ops::Range;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::frame::{Frame, LogEntry};

struct LogState {
    /// Number of entries dropped by earlier resets.
    discarded: usize,
    entries: Vec<LogEntry>,
    host_base: Instant,
    device_base: Option<Duration>,
}

pub struct FrameLog {
    state: RwLock<LogState>,
}

impl Default for FrameLog {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameLog {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LogState {
                discarded: 0,
                entries: Vec::new(),
                host_base: Instant::now(),
                device_base: None,
            }),
        }
    }

    /// Index the next appended frame will get (high-water mark).
    pub fn index(&self) -> usize {
        let state = self.state.read();
        state.discarded + state.entries.len()
    }

    /// Oldest index still stored.
    pub fn first_index(&self) -> usize {
        self.state.read().discarded
    }

    /// Host time on the same time base as [`LogEntry::host_time`].
    pub fn host_elapsed(&self) -> Duration {
        self.state.read().host_base.elapsed()
    }

    /// Append a frame received at `device_timestamp` (raw driver clock).
    /// Returns the index of the new entry.
    pub fn append(&self, frame: Frame, device_timestamp: Duration) -> usize {
        let mut state = self.state.write();
        let base = *state.device_base.get_or_insert(device_timestamp);
        let entry = LogEntry {
            frame,
            host_time: state.host_base.elapsed(),
            device_time: device_timestamp.saturating_sub(base),
        };
        state.entries.push(entry);
        state.discarded + state.entries.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<LogEntry> {
        let state = self.state.read();
        index
            .checked_sub(state.discarded)
            .and_then(|i| state.entries.get(i))
            .cloned()
    }

    /// Look for the first entry at or after `from` satisfying `pred`.
    ///
    /// Returns the match (if any) and the index scanning should resume from,
    /// so repeated calls only look at frames that arrived in between.
    pub fn scan<F>(&self, from: usize, mut pred: F) -> (Option<LogEntry>, usize)
    where
        F: FnMut(&LogEntry) -> bool,
    {
        let state = self.state.read();
        let start = from.saturating_sub(state.discarded);
        for (offset, entry) in state.entries.iter().enumerate().skip(start) {
            if pred(entry) {
                return (Some(entry.clone()), state.discarded + offset + 1);
            }
        }
        (None, state.discarded + state.entries.len())
    }

    /// Copy of the stored entries within `range` (clamped to what is stored).
    pub fn range(&self, range: Range<usize>) -> Vec<LogEntry> {
        let state = self.state.read();
        let len = state.entries.len();
        let start = range.start.saturating_sub(state.discarded).min(len);
        let end = range.end.saturating_sub(state.discarded).min(len);
        if start >= end {
            return Vec::new();
        }
        state.entries[start..end].to_vec()
    }

    /// Drop all entries and restart the host and device time bases.
    ///
    /// The log alone cannot tell a frame read before the reset from one read
    /// after it; callers that poll hardware must keep reads and appends
    /// exclusive with the reset (see `FrameTransport::reset`).
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.discarded += state.entries.len();
        state.entries = Vec::new();
        state.host_base = Instant::now();
        state.device_base = None;
    }
}
