use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThroughputEntry {
    pub requested_at_us: i64,
    pub first_byte_at_us: i64,
    pub last_byte_at_us: i64,
    pub bytes: u64,
}

impl ThroughputEntry {
    /// Request to last byte.
    pub fn download_time_us(&self) -> i64 {
        self.last_byte_at_us - self.requested_at_us
    }

    /// First byte to last byte.
    pub fn transfer_time_us(&self) -> i64 {
        self.last_byte_at_us - self.first_byte_at_us
    }
}

/// One entry per completed segment download. Append-only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThroughputHistory {
    entries: Vec<ThroughputEntry>,
}

impl ThroughputHistory {
    pub fn push(&mut self, entry: ThroughputEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ThroughputEntry> {
        self.entries.get(index)
    }

    pub fn last(&self) -> Option<&ThroughputEntry> {
        self.entries.last()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ThroughputEntry> {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[ThroughputEntry] {
        &self.entries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferEntry {
    pub at_us: i64,
    pub level_before_us: i64,
    pub level_after_us: i64,
}

/// Buffer level around every completed download, in microseconds of content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferHistory {
    entries: Vec<BufferEntry>,
}

impl BufferHistory {
    pub fn push(&mut self, entry: BufferEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&BufferEntry> {
        self.entries.get(index)
    }

    pub fn last(&self) -> Option<&BufferEntry> {
        self.entries.last()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &BufferEntry> {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[BufferEntry] {
        &self.entries
    }

    /// Level after the last admitted segment, drained by the time elapsed since.
    /// May be negative when playback would have stalled.
    pub fn level_at(&self, now_us: i64) -> Option<i64> {
        self.entries
            .last()
            .map(|last| last.level_after_us - (now_us - last.at_us))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackEntry {
    pub segment_index: usize,
    pub representation: usize,
    pub started_at_us: i64,
}

/// Representation decided for each segment plus the playback start of each
/// segment. Both series are append-only and indexed by segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackHistory {
    decisions: Vec<usize>,
    starts: Vec<PlaybackEntry>,
}

impl PlaybackHistory {
    pub fn record_decision(&mut self, representation: usize) {
        self.decisions.push(representation);
    }

    pub fn record_start(&mut self, started_at_us: i64) -> Option<PlaybackEntry> {
        let segment_index = self.starts.len();
        let representation = *self.decisions.get(segment_index)?;
        let entry = PlaybackEntry {
            segment_index,
            representation,
            started_at_us,
        };
        self.starts.push(entry);
        Some(entry)
    }

    pub fn decisions(&self) -> &[usize] {
        &self.decisions
    }

    pub fn decision(&self, segment: usize) -> Option<usize> {
        self.decisions.get(segment).copied()
    }

    pub fn last_decision(&self) -> Option<usize> {
        self.decisions.last().copied()
    }

    pub fn starts(&self) -> &[PlaybackEntry] {
        &self.starts
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }
}
