/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Four-timestamp clock offset estimation (lightweight NTP over the control
//! channel).
//!
//! The coordinator stamps t1 on SYNC, the agent stamps t2/t3 on SYNC_REPLY,
//! the coordinator stamps t4 on receipt. Offset is defined as
//! `agent_clock - coordinator_clock`, so a positive offset means the agent's
//! clock is ahead.

use crate::time::wall_clock_ms;
use std::collections::VecDeque;

const WINDOW: usize = 8;
const OUTLIER_FACTOR: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSample {
    /// Coordinator send time (coordinator clock, utc ms).
    pub t1: i64,
    /// Agent receive time (agent clock, utc ms).
    pub t2: i64,
    /// Agent reply-send time (agent clock, utc ms).
    pub t3: i64,
    /// Coordinator receive time (coordinator clock, utc ms).
    pub t4: i64,
}

impl SyncSample {
    pub fn rtt_ms(&self) -> i64 {
        (self.t4 - self.t1) - (self.t3 - self.t2)
    }

    pub fn offset_ms(&self) -> f64 {
        ((self.t2 - self.t1) + (self.t3 - self.t4)) as f64 / 2.0
    }
}

/// Rolling window of sync samples with an RTT-outlier-rejecting offset
/// estimate.
///
/// Samples with rtt above twice the window's median rtt are queueing spikes
/// and carry an untrustworthy offset, so they are excluded from the median
/// once at least three samples exist.
#[derive(Debug, Clone, Default)]
pub struct ClockOffsetState {
    samples: VecDeque<SyncSample>,
    offset_ms: f64,
}

impl ClockOffsetState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sample(&mut self, sample: SyncSample) {
        self.samples.push_back(sample);
        if self.samples.len() > WINDOW {
            self.samples.pop_front();
        }
        self.recompute();
    }

    fn recompute(&mut self) {
        if self.samples.is_empty() {
            self.offset_ms = 0.0;
            return;
        }
        let retained: Vec<&SyncSample> = if self.samples.len() >= 3 {
            let mut rtts: Vec<i64> = self.samples.iter().map(SyncSample::rtt_ms).collect();
            rtts.sort_unstable();
            let median_rtt = median_i64(&rtts);
            self.samples
                .iter()
                .filter(|s| s.rtt_ms() as f64 <= median_rtt * OUTLIER_FACTOR)
                .collect()
        } else {
            self.samples.iter().collect()
        };
        if !retained.is_empty() {
            self.offset_ms = median_offset(&retained);
        }
    }

    /// Current estimate of `agent_clock - coordinator_clock`. 0 before the
    /// first sample so that `master_now_ms` degrades to the local clock.
    pub fn offset_ms(&self) -> f64 {
        self.offset_ms
    }

    /// Converts a local utc-ms timestamp to estimated master (coordinator)
    /// time; defaults to the current wall clock.
    pub fn master_now_ms(&self, local_utc_ms: Option<i64>) -> i64 {
        let local = local_utc_ms.unwrap_or_else(wall_clock_ms);
        local - self.offset_ms as i64
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

fn median_i64(sorted: &[i64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2] as f64
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) as f64 / 2.0
    }
}

// Equal offsets are ordered by lower t1 to keep the estimate deterministic.
fn median_offset(samples: &[&SyncSample]) -> f64 {
    let mut pairs: Vec<(f64, i64)> = samples.iter().map(|s| (s.offset_ms(), s.t1)).collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    let n = pairs.len();
    if n % 2 == 1 {
        pairs[n / 2].0
    } else {
        (pairs[n / 2 - 1].0 + pairs[n / 2].0) / 2.0
    }
}
