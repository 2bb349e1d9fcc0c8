use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DownloadRecord {
    pub segment_index: usize,
    pub representation: usize,
    pub requested_at_us: i64,
    pub first_byte_at_us: i64,
    pub completed_at_us: i64,
    pub bytes: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlaybackRecord {
    pub playback_index: usize,
    pub started_at_us: i64,
    pub representation: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdaptationRecord {
    pub segment_index: usize,
    pub representation: usize,
    pub decided_at_us: i64,
    pub delay_us: i64,
    pub decision_case: u8,
    pub delay_case: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferRecord {
    pub at_us: i64,
    pub level_before_us: i64,
    pub level_after_us: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnderrunPhase {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnderrunRecord {
    pub phase: UnderrunPhase,
    pub at_us: i64,
    pub playback_index: usize,
}

/// One transport arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThroughputRecord {
    pub at_us: i64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DiagnosticRecord {
    Download(DownloadRecord),
    Playback(PlaybackRecord),
    Adaptation(AdaptationRecord),
    Buffer(BufferRecord),
    Underrun(UnderrunRecord),
    Throughput(ThroughputRecord),
}

impl DiagnosticRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            DiagnosticRecord::Download(_) => "download",
            DiagnosticRecord::Playback(_) => "playback",
            DiagnosticRecord::Adaptation(_) => "adaptation",
            DiagnosticRecord::Buffer(_) => "buffer",
            DiagnosticRecord::Underrun(_) => "underrun",
            DiagnosticRecord::Throughput(_) => "throughput",
        }
    }
}

/// Sink for the controller's structured records. Persistence is up to the
/// implementor; the controller never blocks on it.
pub trait DiagnosticsObserver {
    fn record(&mut self, record: DiagnosticRecord);
}

impl DiagnosticsObserver for () {
    fn record(&mut self, _record: DiagnosticRecord) {}
}

impl DiagnosticsObserver for Vec<DiagnosticRecord> {
    fn record(&mut self, record: DiagnosticRecord) {
        self.push(record);
    }
}

impl<O: DiagnosticsObserver + ?Sized> DiagnosticsObserver for &mut O {
    fn record(&mut self, record: DiagnosticRecord) {
        (**self).record(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_serialize_without_tag() {
        let record = DiagnosticRecord::Underrun(UnderrunRecord {
            phase: UnderrunPhase::Start,
            at_us: 5,
            playback_index: 2,
        });
        assert_eq!(record.kind(), "underrun");
        assert_eq!(
            serde_json::to_string(&record).unwrap(),
            r#"{"phase":"start","at_us":5,"playback_index":2}"#
        );
    }

    #[test]
    fn borrowed_observer_forwards() {
        fn feed<O: DiagnosticsObserver>(mut observer: O) {
            observer.record(DiagnosticRecord::Throughput(ThroughputRecord {
                at_us: 1,
                bytes: 9,
            }));
        }

        let mut sink = Vec::new();
        feed(&mut sink);
        feed(&mut sink);
        feed(());
        assert_eq!(sink.len(), 2);
    }
}
