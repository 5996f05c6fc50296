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

use crate::show::{Cue, Show};

/// Cursor over a show's cue list while the operator is running it.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub current_cue_index: Option<usize>,
    pub is_playing: bool,
    pub is_paused: bool,
    pub blackout: bool,
    pub testscreen: bool,
    pub master_start_utc_ms: i64,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_cue<'a>(&self, show: &'a Show) -> Option<&'a Cue> {
        self.current_cue_index.and_then(|i| show.cues.get(i))
    }

    pub fn next_cue<'a>(&self, show: &'a Show) -> Option<&'a Cue> {
        let next = self.current_cue_index.map(|i| i + 1).unwrap_or(0);
        show.cues.get(next)
    }

    /// Advances the cursor, saturating at the last cue.
    pub fn go_next<'a>(&mut self, show: &'a Show) -> Option<&'a Cue> {
        if show.cues.is_empty() {
            return None;
        }
        let next = self.current_cue_index.map(|i| i + 1).unwrap_or(0);
        self.current_cue_index = Some(next.min(show.cues.len() - 1));
        self.current_cue(show)
    }

    pub fn go_prev<'a>(&mut self, show: &'a Show) -> Option<&'a Cue> {
        if show.cues.is_empty() {
            return None;
        }
        self.current_cue_index = Some(self.current_cue_index.unwrap_or(0).saturating_sub(1));
        self.current_cue(show)
    }

    pub fn go_first<'a>(&mut self, show: &'a Show) -> Option<&'a Cue> {
        if show.cues.is_empty() {
            return None;
        }
        self.current_cue_index = Some(0);
        self.current_cue(show)
    }

    pub fn jump_to_cue<'a>(&mut self, show: &'a Show, cue_id: &str) -> Option<&'a Cue> {
        let index = show.cues.iter().position(|c| c.id == cue_id)?;
        self.current_cue_index = Some(index);
        show.cues.get(index)
    }
}
