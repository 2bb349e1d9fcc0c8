#![forbid(unsafe_code)]

mod diagnostics;
mod driver;

use std::path::Path;

use segflow_abr::{AdaptationAlgorithm, AlgorithmKind, AlgorithmParams, Decision, SessionView};
use segflow_media::{
    BufferEntry, BufferHistory, CatalogError, DEFAULT_SEGMENT_DURATION_US, PlaybackHistory,
    SegmentCatalog, ThroughputEntry, ThroughputHistory,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub use diagnostics::{
    AdaptationRecord, BufferRecord, DiagnosticRecord, DiagnosticsObserver, DownloadRecord,
    PlaybackRecord, ThroughputRecord, UnderrunPhase, UnderrunRecord,
};
pub use driver::{DriverError, RequestQueue, Scheduler, SessionDriver, TimerQueue, Transport};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub segment_duration_us: i64,
    pub algorithm: AlgorithmKind,
    pub params: AlgorithmParams,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            segment_duration_us: DEFAULT_SEGMENT_DURATION_US,
            algorithm: AlgorithmKind::Tobasco,
            params: AlgorithmParams::default(),
        }
    }
}

impl SessionConfig {
    pub fn load_catalog(&self, path: &Path) -> Result<SegmentCatalog, CatalogError> {
        SegmentCatalog::load_file(path, self.segment_duration_us)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Initial,
    Downloading,
    DownloadingPlaying,
    Playing,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerEvent {
    Init,
    DownloadFinished,
    PlaybackFinished,
    InterRequestDelayFinished,
}

impl ControllerEvent {
    fn is_timer(&self) -> bool {
        matches!(
            self,
            ControllerEvent::PlaybackFinished | ControllerEvent::InterRequestDelayFinished
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Request {
        segment: usize,
        representation: usize,
        bytes: u64,
    },
    Schedule {
        event: ControllerEvent,
        after_us: i64,
    },
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ClientState,
    pub to: ClientState,
    pub actions: Vec<Action>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("invalid transition from {from:?} with event {event:?}")]
    InvalidTransition {
        from: ClientState,
        event: ControllerEvent,
    },
    #[error(
        "representation {representation} for segment {segment} exceeds highest index {highest}"
    )]
    RepresentationOutOfRange {
        segment: usize,
        representation: usize,
        highest: usize,
    },
    #[error("segment {segment} received {received} bytes, expected {expected}")]
    ByteOverrun {
        segment: usize,
        expected: u64,
        received: u64,
    },
    #[error("received {bytes} bytes with no download outstanding")]
    UnexpectedBytes { bytes: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingDownload {
    segment: usize,
    representation: usize,
    bytes: u64,
    requested_at_us: i64,
    first_byte_at_us: Option<i64>,
    received: u64,
}

/// Mutable per-client playback state. Only the controller writes to it.
#[derive(Debug, Clone)]
pub struct ClientSession {
    state: ClientState,
    segment_counter: usize,
    playback_index: usize,
    segments_in_buffer: usize,
    underrun_active: bool,
    underrun_count: usize,
    next_representation: usize,
    next_delay_us: i64,
    pending: Option<PendingDownload>,
    throughput: ThroughputHistory,
    buffer: BufferHistory,
    playback: PlaybackHistory,
}

impl Default for ClientSession {
    fn default() -> Self {
        Self {
            state: ClientState::Initial,
            segment_counter: 0,
            playback_index: 0,
            segments_in_buffer: 0,
            underrun_active: false,
            underrun_count: 0,
            next_representation: 0,
            next_delay_us: 0,
            pending: None,
            throughput: ThroughputHistory::default(),
            buffer: BufferHistory::default(),
            playback: PlaybackHistory::default(),
        }
    }
}

impl ClientSession {
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Segment most recently requested (or about to be).
    pub fn segment_counter(&self) -> usize {
        self.segment_counter
    }

    /// Segments whose playback has started.
    pub fn playback_index(&self) -> usize {
        self.playback_index
    }

    pub fn segments_in_buffer(&self) -> usize {
        self.segments_in_buffer
    }

    pub fn underrun_active(&self) -> bool {
        self.underrun_active
    }

    pub fn underrun_count(&self) -> usize {
        self.underrun_count
    }

    pub fn next_delay_us(&self) -> i64 {
        self.next_delay_us
    }

    pub fn download_in_flight(&self) -> bool {
        self.pending.is_some()
    }

    pub fn throughput(&self) -> &ThroughputHistory {
        &self.throughput
    }

    pub fn buffer(&self) -> &BufferHistory {
        &self.buffer
    }

    pub fn playback(&self) -> &PlaybackHistory {
        &self.playback
    }
}

/// Drives one streaming session: owns the histories, consults the adaptation
/// algorithm once per segment and tells its driver which requests to send and
/// which timers to arm.
#[derive(Debug)]
pub struct ClientController<O> {
    catalog: SegmentCatalog,
    algorithm: AdaptationAlgorithm,
    session: ClientSession,
    observer: O,
}

impl<O: DiagnosticsObserver> ClientController<O> {
    /// Panics when the catalog holds no representation.
    pub fn new(catalog: SegmentCatalog, config: &SessionConfig, observer: O) -> Self {
        let algorithm = AdaptationAlgorithm::new(config.algorithm, &config.params, &catalog);
        Self {
            catalog,
            algorithm,
            session: ClientSession::default(),
            observer,
        }
    }

    pub fn state(&self) -> ClientState {
        self.session.state
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    pub fn catalog(&self) -> &SegmentCatalog {
        &self.catalog
    }

    pub fn algorithm(&self) -> &AdaptationAlgorithm {
        &self.algorithm
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn into_observer(self) -> O {
        self.observer
    }

    pub fn handle(
        &mut self,
        event: ControllerEvent,
        now_us: i64,
    ) -> Result<Transition, ControllerError> {
        let from = self.session.state;
        let last = self.catalog.last_segment_index();
        let segment_us = self.catalog.segment_duration_us();
        let playback_tick = Action::Schedule {
            event: ControllerEvent::PlaybackFinished,
            after_us: segment_us,
        };
        let mut actions = Vec::new();

        let to = match (from, event) {
            (ClientState::Initial, ControllerEvent::Init) => {
                self.request_rep_index(now_us)?;
                actions.push(self.issue_download(now_us));
                ClientState::Downloading
            }
            (ClientState::Downloading, ControllerEvent::DownloadFinished) => {
                self.playback_handle(now_us);
                let to = if self.session.segment_counter < last {
                    self.session.segment_counter += 1;
                    self.request_rep_index(now_us)?;
                    actions.push(self.issue_download(now_us));
                    ClientState::DownloadingPlaying
                } else {
                    ClientState::Playing
                };
                actions.push(playback_tick);
                to
            }
            (ClientState::DownloadingPlaying, ControllerEvent::DownloadFinished) => {
                if self.session.segment_counter >= last {
                    ClientState::Playing
                } else {
                    self.session.segment_counter += 1;
                    self.request_rep_index(now_us)?;
                    if self.session.next_delay_us > 0 {
                        actions.push(Action::Schedule {
                            event: ControllerEvent::InterRequestDelayFinished,
                            after_us: self.session.next_delay_us,
                        });
                        ClientState::Playing
                    } else {
                        actions.push(self.issue_download(now_us));
                        ClientState::DownloadingPlaying
                    }
                }
            }
            (ClientState::DownloadingPlaying, ControllerEvent::PlaybackFinished) => {
                if self.playback_handle(now_us) {
                    actions.push(playback_tick);
                    ClientState::DownloadingPlaying
                } else {
                    // stalled: the next completed download restarts the clock
                    ClientState::Downloading
                }
            }
            (ClientState::Playing, ControllerEvent::InterRequestDelayFinished) => {
                actions.push(self.issue_download(now_us));
                ClientState::DownloadingPlaying
            }
            (ClientState::Playing, ControllerEvent::PlaybackFinished) => {
                if self.session.playback_index < self.catalog.segment_count() {
                    self.playback_handle(now_us);
                    actions.push(playback_tick);
                    ClientState::Playing
                } else {
                    info!(
                        at_us = now_us,
                        segments = self.session.playback_index,
                        underruns = self.session.underrun_count,
                        "playback finished"
                    );
                    actions.push(Action::Close);
                    ClientState::Terminal
                }
            }
            (state, event) if event.is_timer() => {
                debug!(?state, ?event, at_us = now_us, "ignoring stale timer");
                state
            }
            (from, event) => return Err(ControllerError::InvalidTransition { from, event }),
        };

        self.session.state = to;
        Ok(Transition { from, to, actions })
    }

    /// Accounts `bytes` arriving for the outstanding download. Returns the
    /// transition triggered by a completed segment.
    pub fn on_bytes_received(
        &mut self,
        now_us: i64,
        bytes: u64,
    ) -> Result<Option<Transition>, ControllerError> {
        let Some(pending) = self.session.pending.as_mut() else {
            return Err(ControllerError::UnexpectedBytes { bytes });
        };
        if bytes == 0 {
            return Ok(None);
        }
        pending.first_byte_at_us.get_or_insert(now_us);
        pending.received += bytes;
        if pending.received > pending.bytes {
            return Err(ControllerError::ByteOverrun {
                segment: pending.segment,
                expected: pending.bytes,
                received: pending.received,
            });
        }
        let complete = pending.received == pending.bytes;
        self.observer.record(DiagnosticRecord::Throughput(ThroughputRecord {
            at_us: now_us,
            bytes,
        }));

        if !complete {
            return Ok(None);
        }
        self.segment_received_handle(now_us);
        self.handle(ControllerEvent::DownloadFinished, now_us).map(Some)
    }

    fn request_rep_index(&mut self, now_us: i64) -> Result<Decision, ControllerError> {
        let segment = self.session.segment_counter;
        let view = SessionView {
            catalog: &self.catalog,
            throughput: &self.session.throughput,
            buffer: &self.session.buffer,
            playback: &self.session.playback,
            now_us,
        };
        let decision = self.algorithm.next_representation(segment, &view);
        check_representation(&self.catalog, segment, &decision)?;

        self.session.playback.record_decision(decision.representation);
        self.session.next_representation = decision.representation;
        self.session.next_delay_us = decision.delay_us;
        self.observer.record(DiagnosticRecord::Adaptation(AdaptationRecord {
            segment_index: segment,
            representation: decision.representation,
            decided_at_us: decision.decided_at_us,
            delay_us: decision.delay_us,
            decision_case: decision.decision_case,
            delay_case: decision.delay_case,
        }));
        Ok(decision)
    }

    fn issue_download(&mut self, now_us: i64) -> Action {
        let segment = self.session.segment_counter;
        let representation = self.session.next_representation;
        let bytes = self.catalog.segment_size(representation, segment);
        self.session.pending = Some(PendingDownload {
            segment,
            representation,
            bytes,
            requested_at_us: now_us,
            first_byte_at_us: None,
            received: 0,
        });
        Action::Request {
            segment,
            representation,
            bytes,
        }
    }

    /// Starts the next buffered segment. Returns false when nothing could be
    /// played, opening an underrun if segments are still due.
    fn playback_handle(&mut self, now_us: i64) -> bool {
        let session = &mut self.session;
        if session.segments_in_buffer == 0 {
            let segments_due = session.playback_index < self.catalog.segment_count();
            if segments_due && !session.underrun_active {
                session.underrun_active = true;
                session.underrun_count += 1;
                info!(
                    at_us = now_us,
                    playback_index = session.playback_index,
                    "playback underrun"
                );
                self.observer.record(DiagnosticRecord::Underrun(UnderrunRecord {
                    phase: UnderrunPhase::Start,
                    at_us: now_us,
                    playback_index: session.playback_index,
                }));
            }
            return false;
        }

        if session.underrun_active {
            session.underrun_active = false;
            debug!(
                at_us = now_us,
                playback_index = session.playback_index,
                "underrun cleared"
            );
            self.observer.record(DiagnosticRecord::Underrun(UnderrunRecord {
                phase: UnderrunPhase::End,
                at_us: now_us,
                playback_index: session.playback_index,
            }));
        }
        session.segments_in_buffer -= 1;
        if let Some(entry) = session.playback.record_start(now_us) {
            self.observer.record(DiagnosticRecord::Playback(PlaybackRecord {
                playback_index: entry.segment_index,
                started_at_us: entry.started_at_us,
                representation: entry.representation,
            }));
        }
        session.playback_index += 1;
        true
    }

    fn segment_received_handle(&mut self, now_us: i64) {
        let Some(pending) = self.session.pending.take() else {
            return;
        };
        let session = &mut self.session;
        let level_before_us = session
            .buffer
            .level_at(now_us)
            .map(|level| level.max(0))
            .unwrap_or_default();
        let level_after_us = level_before_us + self.catalog.segment_duration_us();
        let first_byte_at_us = pending.first_byte_at_us.unwrap_or(now_us);

        session.throughput.push(ThroughputEntry {
            requested_at_us: pending.requested_at_us,
            first_byte_at_us,
            last_byte_at_us: now_us,
            bytes: pending.bytes,
        });
        session.buffer.push(BufferEntry {
            at_us: now_us,
            level_before_us,
            level_after_us,
        });
        session.segments_in_buffer += 1;
        if session.segment_counter == self.catalog.last_segment_index() {
            session.next_delay_us = 0;
        }

        self.observer.record(DiagnosticRecord::Download(DownloadRecord {
            segment_index: pending.segment,
            representation: pending.representation,
            requested_at_us: pending.requested_at_us,
            first_byte_at_us,
            completed_at_us: now_us,
            bytes: pending.bytes,
            success: true,
        }));
        self.observer.record(DiagnosticRecord::Buffer(BufferRecord {
            at_us: now_us,
            level_before_us,
            level_after_us,
        }));
    }
}

fn check_representation(
    catalog: &SegmentCatalog,
    segment: usize,
    decision: &Decision,
) -> Result<(), ControllerError> {
    if decision.representation > catalog.highest_index() {
        return Err(ControllerError::RepresentationOutOfRange {
            segment,
            representation: decision.representation,
            highest: catalog.highest_index(),
        });
    }
    Ok(())
}
