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

//! Local media player abstraction.
//!
//! The agent core only depends on these operations; mpv is the shipped
//! backend.

pub mod mpv;

use crate::error::PlayerResult;
use std::path::PathBuf;

/// Everything the player needs to prepare one cue. The asset path is
/// already resolved against the agent's media root.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub abs_path: PathBuf,
    pub start_time_ms: i64,
    pub end_time_ms: Option<i64>,
    pub volume: u8,
    pub looping: bool,
    pub fullscreen: bool,
    pub fade_in_ms: i64,
    pub fade_out_ms: i64,
}

#[allow(async_fn_in_trait)]
pub trait MediaPlayer: Send + 'static {
    /// Loads a cue and leaves the player paused at its start position.
    async fn load(&mut self, request: &LoadRequest) -> PlayerResult<()>;
    async fn play(&mut self) -> PlayerResult<()>;
    async fn pause(&mut self) -> PlayerResult<()>;
    async fn stop(&mut self) -> PlayerResult<()>;
    async fn seek(&mut self, position_ms: i64) -> PlayerResult<()>;
    async fn set_rate(&mut self, rate: f64) -> PlayerResult<()>;
    async fn set_volume(&mut self, volume: u8) -> PlayerResult<()>;
    /// Current playback position; `None` when the player has no position
    /// (e.g. nothing loaded yet).
    async fn position_ms(&mut self) -> PlayerResult<Option<i64>>;

    async fn blackout(&mut self) -> PlayerResult<()> {
        self.stop().await
    }

    async fn show_testscreen(&mut self, on: bool) -> PlayerResult<()> {
        if !on {
            self.stop().await?;
        }
        Ok(())
    }
}
