use segflow_media::{MICROS_PER_SECOND, SegmentCatalog, ThroughputEntry};
use serde::{Deserialize, Serialize};

use crate::{Decision, SessionView, assert_has_representations};

/// Throughput fractions (`a1`..`a5`) and buffer thresholds in microseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TobascoParams {
    pub a1: f64,
    pub a2: f64,
    pub a3: f64,
    pub a4: f64,
    pub a5: f64,
    pub b_min_us: i64,
    pub b_low_us: i64,
    pub b_high_us: i64,
    pub delta_beta_us: i64,
    pub delta_time_us: i64,
}

impl Default for TobascoParams {
    fn default() -> Self {
        Self {
            a1: 0.75,
            a2: 0.33,
            a3: 0.5,
            a4: 0.75,
            a5: 0.9,
            b_min_us: 5_000_000,
            b_low_us: 20_000_000,
            b_high_us: 40_000_000,
            delta_beta_us: 1_000_000,
            delta_time_us: 10_000_000,
        }
    }
}

impl TobascoParams {
    pub fn b_opt_us(&self) -> i64 {
        (self.b_low_us + self.b_high_us) / 2
    }
}

/// Buffer-threshold controller with an aggressive fast-start ramp.
#[derive(Debug, Clone)]
pub struct Tobasco2 {
    params: TobascoParams,
    highest_index: usize,
    last_index: usize,
    running_fast_start: bool,
}

impl Tobasco2 {
    pub fn new(params: TobascoParams, catalog: &SegmentCatalog) -> Self {
        let highest_index = assert_has_representations(catalog.representation_count());
        Self {
            params,
            highest_index,
            last_index: 0,
            running_fast_start: true,
        }
    }

    pub fn running_fast_start(&self) -> bool {
        self.running_fast_start
    }

    pub fn next_representation(
        &mut self,
        segment_counter: usize,
        view: &SessionView<'_>,
    ) -> Decision {
        let now = view.now_us;
        let (Some(last_download), true) = (view.throughput.last(), segment_counter > 0) else {
            self.last_index = 0;
            return Decision::initial(now);
        };

        let catalog = view.catalog;
        let p = &self.params;
        let last = self.last_index;
        let buffer_now = view.buffer_now_us();
        let average_throughput =
            self.average_segment_throughput(view, now - p.delta_time_us, now);
        let current_bitrate = catalog.average_bitrate(last);
        let next_bitrate = catalog.average_bitrate((last + 1).min(self.highest_index));

        let mut next = last;
        let mut decision_case = 0;
        let mut delay_case = 0;
        let mut holdback_us = None;

        if self.running_fast_start
            && last != self.highest_index
            && self.minimum_buffer_level_observed(view)
            && current_bitrate <= p.a1 * average_throughput
        {
            if buffer_now < p.b_min_us {
                if next_bitrate <= p.a2 * average_throughput {
                    decision_case = 1;
                    next = last + 1;
                }
            } else if buffer_now < p.b_low_us {
                if next_bitrate <= p.a3 * average_throughput {
                    decision_case = 2;
                    next = last + 1;
                }
            } else {
                if next_bitrate <= p.a4 * average_throughput {
                    decision_case = 3;
                    next = last + 1;
                }
                if buffer_now > p.b_high_us {
                    delay_case = 1;
                    holdback_us = Some(p.b_high_us - catalog.segment_duration_us());
                }
            }
        } else {
            self.running_fast_start = false;
            let steady_holdback = (buffer_now - catalog.segment_duration_us()).max(p.b_opt_us());
            let next_unaffordable =
                last == self.highest_index || next_bitrate >= p.a5 * average_throughput;
            if buffer_now < p.b_min_us {
                decision_case = 4;
                next = 0;
            } else if buffer_now < p.b_low_us {
                let segment = segment_counter - 1;
                let last_throughput = segment_throughput(catalog, last, segment, last_download);
                if last != 0 && catalog.segment_bitrate(last, segment) >= last_throughput {
                    decision_case = 5;
                    next = (0..=self.highest_index)
                        .rev()
                        .find(|index| catalog.segment_bitrate(*index, segment) < last_throughput)
                        .unwrap_or(last);
                    if next >= last {
                        next = last - 1;
                    }
                }
            } else if buffer_now < p.b_high_us {
                if next_unaffordable {
                    delay_case = 2;
                    holdback_us = Some(steady_holdback);
                }
            } else if next_unaffordable {
                delay_case = 3;
                holdback_us = Some(steady_holdback);
            } else {
                decision_case = 6;
                next = last + 1;
            }
        }

        let delay_us = match holdback_us {
            Some(holdback) if holdback <= buffer_now => buffer_now - holdback,
            _ => 0,
        };

        self.last_index = next;
        Decision {
            representation: next,
            delay_us,
            decided_at_us: now,
            decision_case,
            delay_case,
        }
    }

    /// True while the last two downloads completed closer together than
    /// `min(delta_beta, segment_duration)`, i.e. the buffer is still filling.
    fn minimum_buffer_level_observed(&self, view: &SessionView<'_>) -> bool {
        let entries = view.throughput.as_slice();
        let [.., previous, last] = entries else {
            return true;
        };
        let gap = last.last_byte_at_us - previous.last_byte_at_us;
        gap < self.params.delta_beta_us.min(view.catalog.segment_duration_us())
    }

    /// Time-weighted mean throughput of the downloads overlapping `[t1, t2]`,
    /// in bits per second. A download that started before `t1` only counts
    /// for the part of it inside the window.
    fn average_segment_throughput(&self, view: &SessionView<'_>, t1: i64, t2: i64) -> f64 {
        let t1 = t1.max(0);
        let entries = view.throughput.as_slice();
        let Some(last) = entries.last() else {
            return 0.0;
        };
        let sample = |index: usize, entry: &ThroughputEntry| {
            let representation = view.playback.decision(index).unwrap_or_default();
            let content_bits =
                view.catalog.average_bitrate(representation) * view.catalog.segment_duration_secs();
            content_bits / seconds(entry.download_time_us())
        };

        let mut weighted = 0.0;
        let mut total_us = 0.0;
        for (index, entry) in entries.iter().enumerate() {
            if entry.last_byte_at_us < t1 {
                continue;
            }
            if entry.last_byte_at_us > t2 {
                break;
            }
            let span_us = if entry.requested_at_us < t1 {
                entry.last_byte_at_us - t1
            } else {
                entry.download_time_us()
            };
            weighted += sample(index, entry) * span_us as f64;
            total_us += span_us as f64;
        }

        if total_us > 0.0 {
            weighted / total_us
        } else {
            // nothing finished inside the window, fall back to the latest download
            sample(entries.len() - 1, last)
        }
    }
}

fn seconds(us: i64) -> f64 {
    us.max(1) as f64 / MICROS_PER_SECOND
}

fn segment_throughput(
    catalog: &SegmentCatalog,
    representation: usize,
    segment: usize,
    entry: &ThroughputEntry,
) -> f64 {
    8.0 * catalog.segment_size(representation, segment) as f64 / seconds(entry.transfer_time_us())
}
