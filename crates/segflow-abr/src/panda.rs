use segflow_media::{MICROS_PER_SECOND, SegmentCatalog};
use serde::{Deserialize, Serialize};

use crate::{Decision, SessionView, assert_has_representations};

const BITS_PER_MEGABIT: f64 = 1_000_000.0;

/// Probe-and-adapt constants. Bandwidth terms are in Mbit/s, buffer terms in
/// seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PandaParams {
    pub kappa: f64,
    pub omega: f64,
    pub alpha: f64,
    pub beta: f64,
    pub epsilon: f64,
    pub b_min_secs: f64,
}

impl Default for PandaParams {
    fn default() -> Self {
        Self {
            kappa: 0.28,
            omega: 0.3,
            alpha: 0.2,
            beta: 0.2,
            epsilon: 0.15,
            b_min_secs: 26.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Panda {
    params: PandaParams,
    highest_index: usize,
    last_video_index: usize,
    last_bandwidth_share: f64,
    last_smoothed_share: f64,
    last_buffer_secs: f64,
    last_target_inter_request_secs: f64,
}

impl Panda {
    pub fn new(params: PandaParams, catalog: &SegmentCatalog) -> Self {
        let highest_index = assert_has_representations(catalog.representation_count());
        Self {
            params,
            highest_index,
            last_video_index: 0,
            last_bandwidth_share: 0.0,
            last_smoothed_share: 0.0,
            last_buffer_secs: catalog.segment_duration_secs(),
            last_target_inter_request_secs: 0.0,
        }
    }

    pub fn bandwidth_share(&self) -> f64 {
        self.last_bandwidth_share
    }

    pub fn smoothed_share(&self) -> f64 {
        self.last_smoothed_share
    }

    pub fn target_inter_request_secs(&self) -> f64 {
        self.last_target_inter_request_secs
    }

    pub fn next_representation(
        &mut self,
        segment_counter: usize,
        view: &SessionView<'_>,
    ) -> Decision {
        let now = view.now_us;
        let catalog = view.catalog;
        let (Some(last), true) = (view.throughput.last(), segment_counter > 0) else {
            self.last_video_index = 0;
            self.last_buffer_secs = catalog.segment_duration_secs();
            self.last_target_inter_request_secs = 0.0;
            return Decision::initial(now);
        };
        let p = &self.params;
        let mbps = |index: usize| catalog.average_bitrate(index) / BITS_PER_MEGABIT;

        let download_secs = last.download_time_us().max(1) as f64 / MICROS_PER_SECOND;
        let measured =
            mbps(self.last_video_index) * catalog.segment_duration_secs() / download_secs;
        if segment_counter == 1 {
            self.last_bandwidth_share = measured;
            self.last_smoothed_share = measured;
        }

        let since_request_secs = (now - last.requested_at_us) as f64 / MICROS_PER_SECOND;
        let inter_request_secs = since_request_secs.max(self.last_target_inter_request_secs);

        // probe upward by kappa * omega per second, back off in proportion to
        // how far the share overshoots the measured throughput
        let overshoot = (self.last_bandwidth_share - measured + p.omega).max(0.0);
        let share = (p.kappa * (p.omega - overshoot) * inter_request_secs
            + self.last_bandwidth_share)
            .max(0.0);
        let smoothed = -p.alpha * (self.last_smoothed_share - share) * inter_request_secs
            + self.last_smoothed_share;
        self.last_bandwidth_share = share;
        self.last_smoothed_share = smoothed;

        let up = self.find_largest(catalog, smoothed, p.omega + p.epsilon * smoothed);
        let down = self.find_largest(catalog, smoothed, p.omega);
        let current = self.last_video_index;
        let video_index = if mbps(current) < mbps(up) {
            up
        } else if mbps(up) <= mbps(current) && mbps(current) <= mbps(down) {
            current
        } else {
            down
        };
        self.last_video_index = video_index;

        let segment_megabits = mbps(video_index) * catalog.segment_duration_secs();
        let fetch_secs = if smoothed > 0.0 {
            segment_megabits / smoothed
        } else {
            0.0
        };
        let target_secs = (fetch_secs + p.beta * (self.last_buffer_secs - p.b_min_secs)).max(0.0);

        let previous_target_us = self.last_target_inter_request_secs * MICROS_PER_SECOND;
        let download_us = last.download_time_us() as f64;
        let delay_us = if download_us < previous_target_us {
            (previous_target_us - download_us) as i64
        } else {
            0
        };

        self.last_target_inter_request_secs = target_secs;
        self.last_buffer_secs = view.buffer_now_us() as f64 / MICROS_PER_SECOND;

        Decision {
            representation: video_index,
            delay_us,
            decided_at_us: now,
            decision_case: 0,
            delay_case: 0,
        }
    }

    /// Highest representation whose bitrate fits under `share - margin`, or 0.
    fn find_largest(&self, catalog: &SegmentCatalog, share: f64, margin: f64) -> usize {
        (0..=self.highest_index)
            .filter(|index| {
                catalog.average_bitrate(*index) / BITS_PER_MEGABIT <= share - margin
            })
            .last()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, ladder};

    // 0.5, 1, 2 and 4 Mbit/s with 2 s segments
    fn catalog() -> SegmentCatalog {
        ladder(&[125_000, 250_000, 500_000, 1_000_000], 30)
    }

    #[test]
    fn first_measurement_seeds_both_shares() {
        let catalog = catalog();
        let mut algo = Panda::new(PandaParams::default(), &catalog);
        let mut fixture = Fixture::default();

        algo.next_representation(0, &fixture.view(&catalog, 0));
        fixture.decide(0);
        // 1 Mbit in 0.25 s = 4 Mbit/s
        fixture.download(0, 250_000, 125_000);
        let decision = algo.next_representation(1, &fixture.view(&catalog, 250_000));

        // inter-request time is 0.25 s, overshoot is omega, so the share stays put
        assert!((algo.bandwidth_share() - 4.0).abs() < 1e-9);
        assert!((algo.smoothed_share() - 4.0).abs() < 1e-9);
        // up: 4 - (0.3 + 0.6) = 3.1 -> 2 Mbit/s; down: 3.7 -> 2 Mbit/s
        assert_eq!(decision.representation, 2);
        assert_eq!(decision.delay_us, 0);
    }

    #[test]
    fn share_tracks_slow_link() {
        let catalog = catalog();
        let mut algo = Panda::new(PandaParams::default(), &catalog);
        let mut fixture = Fixture::default();

        let mut now = 0;
        let mut last = 0;
        for segment in 0..8 {
            let decision = algo.next_representation(segment, &fixture.view(&catalog, now));
            fixture.decide(decision.representation);
            last = decision.representation;
            now += decision.delay_us;
            // link is fixed at roughly 0.9 Mbit/s
            let bytes = catalog.segment_size(decision.representation, segment);
            let download = (bytes as f64 * 8.0 / 0.9) as i64;
            fixture.download(now, download, bytes);
            now += download;
        }

        assert!(algo.bandwidth_share() < 1.0);
        assert_eq!(last, 0);
    }

    #[test]
    fn find_largest_respects_margin() {
        let catalog = catalog();
        let algo = Panda::new(PandaParams::default(), &catalog);
        // with a 1.5 Mbit/s share: up margin 0.525 -> 0.975 fits tier 0,
        // down margin 0.3 -> 1.2 fits tier 1
        assert_eq!(algo.find_largest(&catalog, 1.5, 0.3 + 0.15 * 1.5), 0);
        assert_eq!(algo.find_largest(&catalog, 1.5, 0.3), 1);
        assert_eq!(algo.find_largest(&catalog, 0.1, 0.3), 0);
    }

    #[test]
    fn keeps_current_tier_inside_hysteresis_band() {
        let catalog = catalog();
        let params = PandaParams::default();
        let mut algo = Panda::new(params.clone(), &catalog);
        algo.last_video_index = 2;
        let mut fixture = Fixture::default();

        fixture.decide(2);
        // 4 Mbit of tier 2 in 1.6 s = 2.5 Mbit/s
        fixture.download(0, 1_600_000, 500_000);
        let decision = algo.next_representation(1, &fixture.view(&catalog, 1_600_000));

        let smoothed = algo.smoothed_share();
        assert!((smoothed - 2.5).abs() < 1e-9);
        // up: 2.5 - 0.675 = 1.825 -> tier 1; down: 2.2 -> tier 2
        let up = algo.find_largest(&catalog, smoothed, params.omega + params.epsilon * smoothed);
        let down = algo.find_largest(&catalog, smoothed, params.omega);
        assert_eq!((up, down), (1, 2));
        assert_eq!(decision.representation, 2);
    }

    #[test]
    fn delay_pads_short_downloads_to_target_spacing() {
        let catalog = catalog();
        let params = PandaParams {
            b_min_secs: 0.0,
            ..PandaParams::default()
        };
        let mut algo = Panda::new(params, &catalog);
        let mut fixture = Fixture::default();

        algo.next_representation(0, &fixture.view(&catalog, 0));
        fixture.decide(0);
        fixture.download(0, 250_000, 125_000);
        let first = algo.next_representation(1, &fixture.view(&catalog, 250_000));
        fixture.decide(first.representation);
        let target = algo.target_inter_request_secs();
        assert!(target > 0.0);

        // next download is faster than the target spacing
        fixture.download(250_000, 100_000, catalog.segment_size(first.representation, 1));
        let second = algo.next_representation(2, &fixture.view(&catalog, 350_000));
        let expected = (target * MICROS_PER_SECOND - 100_000.0) as i64;
        assert_eq!(second.delay_us, expected);
    }
}
