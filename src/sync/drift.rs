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

use serde::{Deserialize, Serialize};
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftAction {
    None,
    RateAdjust,
    HardSeek,
}

impl Display for DriftAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DriftAction::None => "none",
            DriftAction::RateAdjust => "rate_adjust",
            DriftAction::HardSeek => "hard_seek",
        };
        write!(f, "{s}")
    }
}

/// Decides how to correct playback drift.
///
/// `drift_ms = actual_pos - expected_pos`; positive means playing ahead of
/// schedule. Within `max_drift_ms` the rate is adjusted proportionally,
/// between `max_drift_ms` and `hard_seek_threshold_ms` the rate pins to the
/// nearest bound, and beyond the threshold the caller must seek to the
/// expected position and reset the rate to 1.0.
pub fn compute_drift_correction(
    drift_ms: f64,
    max_drift_ms: i64,
    hard_seek_threshold_ms: i64,
    rate_min: f64,
    rate_max: f64,
) -> (DriftAction, f64) {
    let abs_drift = drift_ms.abs();
    if abs_drift > hard_seek_threshold_ms as f64 {
        return (DriftAction::HardSeek, 1.0);
    }
    if abs_drift <= max_drift_ms as f64 {
        let scale = abs_drift / max_drift_ms as f64;
        let rate = if drift_ms > 0.0 {
            (1.0 - scale * (1.0 - rate_min)).max(rate_min)
        } else if drift_ms < 0.0 {
            (1.0 + scale * (rate_max - 1.0)).min(rate_max)
        } else {
            1.0
        };
        return (DriftAction::RateAdjust, round4(rate));
    }
    // Above the proportional band but below the seek threshold the rate
    // saturates.
    let rate = if drift_ms > 0.0 { rate_min } else { rate_max };
    (DriftAction::RateAdjust, round4(rate))
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
