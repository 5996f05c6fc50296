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

use chrono::Utc;
use std::time::Instant;

/// Current wall clock in UTC milliseconds. All protocol timestamps use this.
pub fn wall_clock_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Wall clock frozen to a monotonic base.
///
/// Elapsed-playback computations must not jump when the wall clock steps,
/// so the anchor captures the wall time once and extrapolates it from
/// `Instant`.
#[derive(Debug, Clone)]
pub struct MonotonicAnchor {
    origin_wall_ms: i64,
    origin: Instant,
}

impl MonotonicAnchor {
    pub fn now() -> Self {
        Self {
            origin_wall_ms: wall_clock_ms(),
            origin: Instant::now(),
        }
    }

    pub fn wall_ms(&self) -> i64 {
        self.origin_wall_ms + self.origin.elapsed().as_millis() as i64
    }
}
