#![forbid(unsafe_code)]

//! Bitrate adaptation for segmented streaming.
//!
//! Every algorithm answers one question per segment: which representation to
//! fetch next and how long to wait before requesting it. Algorithms read the
//! session histories through a [`SessionView`] and keep only their own small
//! state between calls.

mod festive;
mod panda;
mod tobasco;

use std::{fmt, str::FromStr};

use segflow_media::{BufferHistory, PlaybackHistory, SegmentCatalog, ThroughputHistory};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use festive::{Festive, FestiveParams};
pub use panda::{Panda, PandaParams};
pub use tobasco::{Tobasco2, TobascoParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmKind {
    #[serde(alias = "tobasco2")]
    Tobasco,
    Panda,
    Festive,
}

impl AlgorithmKind {
    pub fn name(&self) -> &'static str {
        match self {
            AlgorithmKind::Tobasco => "tobasco",
            AlgorithmKind::Panda => "panda",
            AlgorithmKind::Festive => "festive",
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AlgorithmKind {
    type Err = AlgorithmError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tobasco" | "tobasco2" => Ok(AlgorithmKind::Tobasco),
            "panda" => Ok(AlgorithmKind::Panda),
            "festive" => Ok(AlgorithmKind::Festive),
            _ => Err(AlgorithmError::UnknownAlgorithm(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AlgorithmError {
    #[error("unknown adaptation algorithm '{0}'")]
    UnknownAlgorithm(String),
}

/// Tuning for all variants; only the selected variant's record is used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgorithmParams {
    pub tobasco: TobascoParams,
    pub panda: PandaParams,
    pub festive: FestiveParams,
}

/// Outcome of one adaptation call. The case tags only name the branch that
/// fired and are never fed back into control logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub representation: usize,
    pub delay_us: i64,
    pub decided_at_us: i64,
    pub decision_case: u8,
    pub delay_case: u8,
}

impl Decision {
    pub fn initial(decided_at_us: i64) -> Self {
        Self {
            representation: 0,
            delay_us: 0,
            decided_at_us,
            decision_case: 0,
            delay_case: 0,
        }
    }
}

/// Read-only snapshot of a session at decision time.
#[derive(Debug, Clone, Copy)]
pub struct SessionView<'a> {
    pub catalog: &'a SegmentCatalog,
    pub throughput: &'a ThroughputHistory,
    pub buffer: &'a BufferHistory,
    pub playback: &'a PlaybackHistory,
    pub now_us: i64,
}

impl SessionView<'_> {
    /// Buffered content right now, in microseconds. Negative values mean the
    /// buffer would already have run dry.
    pub fn buffer_now_us(&self) -> i64 {
        self.buffer.level_at(self.now_us).unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub enum AdaptationAlgorithm {
    Tobasco(Tobasco2),
    Panda(Panda),
    Festive(Festive),
}

impl AdaptationAlgorithm {
    /// Panics when the catalog holds no representation.
    pub fn new(kind: AlgorithmKind, params: &AlgorithmParams, catalog: &SegmentCatalog) -> Self {
        match kind {
            AlgorithmKind::Tobasco => {
                AdaptationAlgorithm::Tobasco(Tobasco2::new(params.tobasco.clone(), catalog))
            }
            AlgorithmKind::Panda => {
                AdaptationAlgorithm::Panda(Panda::new(params.panda.clone(), catalog))
            }
            AlgorithmKind::Festive => {
                AdaptationAlgorithm::Festive(Festive::new(params.festive.clone(), catalog))
            }
        }
    }

    pub fn kind(&self) -> AlgorithmKind {
        match self {
            AdaptationAlgorithm::Tobasco(_) => AlgorithmKind::Tobasco,
            AdaptationAlgorithm::Panda(_) => AlgorithmKind::Panda,
            AdaptationAlgorithm::Festive(_) => AlgorithmKind::Festive,
        }
    }

    /// Called once per segment in increasing order, with the histories
    /// covering every segment before `segment_counter`.
    pub fn next_representation(
        &mut self,
        segment_counter: usize,
        view: &SessionView<'_>,
    ) -> Decision {
        match self {
            AdaptationAlgorithm::Tobasco(algo) => algo.next_representation(segment_counter, view),
            AdaptationAlgorithm::Panda(algo) => algo.next_representation(segment_counter, view),
            AdaptationAlgorithm::Festive(algo) => algo.next_representation(segment_counter, view),
        }
    }
}

/// Highest representation index of a ladder with `representation_count` tiers.
fn assert_has_representations(representation_count: usize) -> usize {
    assert!(
        representation_count >= 1,
        "the highest representation index should be >= 0"
    );
    representation_count - 1
}

#[cfg(test)]
pub(crate) mod testing {
    use segflow_media::{
        BufferEntry, BufferHistory, PlaybackHistory, SegmentCatalog, ThroughputEntry,
        ThroughputHistory,
    };

    use super::SessionView;

    pub const SEGMENT_US: i64 = 2_000_000;

    /// Histories filled the way the controller fills them.
    #[derive(Debug, Default)]
    pub struct Fixture {
        pub throughput: ThroughputHistory,
        pub buffer: BufferHistory,
        pub playback: PlaybackHistory,
    }

    impl Fixture {
        pub fn decide(&mut self, representation: usize) {
            self.playback.record_decision(representation);
        }

        /// Appends one completed download of `bytes`, requested at
        /// `requested_at_us` and taking `download_us`.
        pub fn download(&mut self, requested_at_us: i64, download_us: i64, bytes: u64) {
            let end = requested_at_us + download_us;
            let before = match self.buffer.level_at(end) {
                Some(level) => level.max(0),
                None => 0,
            };
            self.throughput.push(ThroughputEntry {
                requested_at_us,
                first_byte_at_us: requested_at_us + download_us / 10,
                last_byte_at_us: end,
                bytes,
            });
            self.buffer.push(BufferEntry {
                at_us: end,
                level_before_us: before,
                level_after_us: before + SEGMENT_US,
            });
        }

        pub fn view<'a>(&'a self, catalog: &'a SegmentCatalog, now_us: i64) -> SessionView<'a> {
            SessionView {
                catalog,
                throughput: &self.throughput,
                buffer: &self.buffer,
                playback: &self.playback,
                now_us,
            }
        }
    }

    /// Constant-size ladder; every segment of representation `i` has `sizes[i]` bytes.
    pub fn ladder(sizes: &[u64], segments: usize) -> SegmentCatalog {
        let rows = sizes.iter().map(|size| vec![*size; segments]).collect();
        SegmentCatalog::from_rows(rows, SEGMENT_US).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Fixture, ladder};
    use super::*;

    #[test]
    fn parses_algorithm_names_case_insensitively() {
        assert_eq!("TOBASCO".parse::<AlgorithmKind>().unwrap(), AlgorithmKind::Tobasco);
        assert_eq!("tobasco2".parse::<AlgorithmKind>().unwrap(), AlgorithmKind::Tobasco);
        assert_eq!("Panda".parse::<AlgorithmKind>().unwrap(), AlgorithmKind::Panda);
        assert_eq!(" festive ".parse::<AlgorithmKind>().unwrap(), AlgorithmKind::Festive);

        let err = "bola".parse::<AlgorithmKind>().unwrap_err();
        assert_eq!(err, AlgorithmError::UnknownAlgorithm("bola".to_string()));
    }

    #[test]
    fn every_variant_starts_at_lowest_representation() {
        let catalog = ladder(&[50_000, 100_000, 200_000], 10);
        let fixture = Fixture::default();
        for kind in [AlgorithmKind::Tobasco, AlgorithmKind::Panda, AlgorithmKind::Festive] {
            let mut algo = AdaptationAlgorithm::new(kind, &AlgorithmParams::default(), &catalog);
            let decision = algo.next_representation(0, &fixture.view(&catalog, 1_234));
            assert_eq!(algo.kind(), kind);
            assert_eq!(decision, Decision::initial(1_234));
        }
    }

    #[test]
    fn decisions_stay_within_catalog() {
        let catalog = ladder(&[20_000, 60_000, 120_000, 400_000], 40);
        for kind in [AlgorithmKind::Tobasco, AlgorithmKind::Panda, AlgorithmKind::Festive] {
            let mut algo = AdaptationAlgorithm::new(kind, &AlgorithmParams::default(), &catalog);
            let mut fixture = Fixture::default();
            let mut now = 0;
            for segment in 0..40 {
                let decision = algo.next_representation(segment, &fixture.view(&catalog, now));
                assert!(decision.representation <= catalog.highest_index());
                assert!(decision.delay_us >= 0);
                fixture.decide(decision.representation);
                now += decision.delay_us;
                // alternate fast and very slow links
                let download = if segment % 3 == 0 { 3_500_000 } else { 150_000 };
                let bytes = catalog.segment_size(decision.representation, segment);
                fixture.download(now, download, bytes);
                now += download;
            }
        }
    }

    #[test]
    #[should_panic(expected = "highest representation index should be >= 0")]
    fn empty_ladder_is_rejected() {
        assert_has_representations(0);
    }

    #[test]
    fn highest_index_follows_ladder() {
        let catalog = ladder(&[1_000, 2_000, 3_000], 2);
        assert_eq!(assert_has_representations(catalog.representation_count()), 2);
    }

    #[test]
    fn params_accept_partial_json() {
        let params: AlgorithmParams =
            serde_json::from_str(r#"{"tobasco":{"a1":0.5},"festive":{"seed":7}}"#).unwrap();
        assert_eq!(params.tobasco.a1, 0.5);
        assert_eq!(params.tobasco.a2, TobascoParams::default().a2);
        assert_eq!(params.festive.seed, Some(7));
        assert_eq!(params.panda, PandaParams::default());
    }
}
