use rand::{Rng, SeedableRng, rngs::StdRng};
use segflow_media::{MICROS_PER_SECOND, SegmentCatalog};
use serde::{Deserialize, Serialize};

use crate::{Decision, SessionView, assert_has_representations};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FestiveParams {
    pub target_buffer_us: i64,
    /// Half-width of the randomized target buffer; defaults to one segment.
    pub delta_us: Option<i64>,
    pub alpha: f64,
    pub throughput_threshold: f64,
    /// Consecutive segments at one tier before a switch up is allowed.
    pub smooth_steps: usize,
    pub estimation_window: usize,
    pub min_downloads: usize,
    pub switch_window_us: i64,
    pub seed: Option<u64>,
}

impl Default for FestiveParams {
    fn default() -> Self {
        Self {
            target_buffer_us: 30_000_000,
            delta_us: None,
            alpha: 12.0,
            throughput_threshold: 0.85,
            smooth_steps: 5,
            estimation_window: 20,
            min_downloads: 20,
            switch_window_us: 20_000_000,
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Festive {
    params: FestiveParams,
    delta_us: i64,
    highest_index: usize,
    rng: StdRng,
}

impl Festive {
    pub fn new(params: FestiveParams, catalog: &SegmentCatalog) -> Self {
        let highest_index = assert_has_representations(catalog.representation_count());
        let delta_us = params
            .delta_us
            .unwrap_or(catalog.segment_duration_us())
            .max(0);
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            params,
            delta_us,
            highest_index,
            rng,
        }
    }

    /// Lowest buffer the randomized target can take.
    pub fn target_floor_us(&self) -> i64 {
        self.params.target_buffer_us - self.delta_us
    }

    pub fn next_representation(
        &mut self,
        segment_counter: usize,
        view: &SessionView<'_>,
    ) -> Decision {
        let now = view.now_us;
        if segment_counter == 0 {
            return Decision::initial(now);
        }
        let mut decision = Decision {
            decision_case: 1,
            ..Decision::initial(now)
        };

        let Some(estimate) = self.harmonic_mean_throughput(view) else {
            return decision;
        };
        let Some(current) = view.playback.last_decision() else {
            return decision;
        };
        let catalog = view.catalog;

        let lower = self.params.target_buffer_us - self.delta_us;
        let upper = self.params.target_buffer_us + self.delta_us;
        let target = self.rng.random_range(lower..=upper);
        let buffer_now = view.buffer_now_us();
        if buffer_now > target {
            decision.delay_us = buffer_now - target;
            decision.delay_case = 1;
        }

        let reference = if current > 0
            && catalog.average_bitrate(current) > estimate * self.params.throughput_threshold
        {
            Some(current - 1)
        } else if current < self.highest_index
            && self.stable_segments(view, current) >= self.params.smooth_steps
            && catalog.average_bitrate(current + 1) <= estimate
        {
            Some(current + 1)
        } else {
            None
        };

        let Some(reference) = reference else {
            decision.representation = current;
            decision.decision_case = 3;
            return decision;
        };

        let switches = self.recent_switches(view);
        let stability = 2f64.powi(switches.min(i32::MAX as usize) as i32);
        let denominator = estimate.min(catalog.average_bitrate(reference));
        let efficiency = |index: usize| (catalog.average_bitrate(index) / denominator - 1.0).abs();
        let score_current = stability + self.params.alpha * efficiency(current);
        let score_reference = stability + 1.0 + self.params.alpha * efficiency(reference);

        if score_current < score_reference {
            decision.representation = current;
            decision.decision_case = 4;
        } else {
            decision.representation = reference;
        }
        decision
    }

    /// Harmonic mean over the most recent non-empty downloads, in bits per
    /// second. `None` until enough downloads have completed.
    fn harmonic_mean_throughput(&self, view: &SessionView<'_>) -> Option<f64> {
        if view.throughput.len() < self.params.min_downloads {
            return None;
        }
        let samples: Vec<f64> = view
            .throughput
            .iter()
            .rev()
            .filter(|entry| entry.bytes > 0)
            .take(self.params.estimation_window)
            .map(|entry| {
                let secs = entry.download_time_us().max(1) as f64 / MICROS_PER_SECOND;
                8.0 * entry.bytes as f64 / secs
            })
            .collect();
        let required = self.params.min_downloads.min(self.params.estimation_window);
        if samples.is_empty() || samples.len() < required {
            return None;
        }
        let denominator: f64 = samples.iter().map(|bps| 1.0 / bps).sum();
        Some(samples.len() as f64 / denominator)
    }

    /// Segments before the latest one that were fetched at `current`, counted
    /// backwards and capped at `smooth_steps`.
    fn stable_segments(&self, view: &SessionView<'_>, current: usize) -> usize {
        view.playback
            .decisions()
            .iter()
            .rev()
            .skip(1)
            .take_while(|representation| **representation == current)
            .take(self.params.smooth_steps)
            .count()
    }

    /// Representation changes among the playback starts inside the switch window.
    fn recent_switches(&self, view: &SessionView<'_>) -> usize {
        let since = view.now_us - self.params.switch_window_us;
        let recent: Vec<usize> = view
            .playback
            .starts()
            .iter()
            .filter(|entry| entry.started_at_us >= since)
            .map(|entry| entry.representation)
            .collect();
        recent.windows(2).filter(|pair| pair[0] != pair[1]).count()
    }
}
