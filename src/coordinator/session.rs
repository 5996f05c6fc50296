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

use crate::{
    protocol::{CoordinatorMessage, PlaybackState},
    sync::ClockOffsetState,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    fmt::Display,
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tracing::warn;

/// Sessions older than this without any inbound traffic are flagged stale
/// but not disconnected.
pub const STALE_HEARTBEAT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionStatus {
    #[default]
    Pending,
    Accepted,
    Rejected,
}

impl Display for AdmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionStatus::Pending => write!(f, "pending"),
            AdmissionStatus::Accepted => write!(f, "accepted"),
            AdmissionStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// One connected agent as the coordinator sees it. Owned by the server
/// actor; there is exactly one live session per agent id, a later HELLO with
/// the same id supersedes it.
pub struct AgentSession {
    pub conn_id: u64,
    pub agent_id: String,
    pub hostname: String,
    pub platform: String,
    pub capabilities: HashMap<String, Value>,
    pub token: Option<String>,
    pub name: String,
    pub status: AdmissionStatus,
    pub state: PlaybackState,
    pub cue_id: Option<String>,
    pub position_ms: i64,
    pub rate: f64,
    pub volume: u8,
    pub drift_ms: f64,
    pub last_heartbeat: Instant,
    pub last_error: Option<String>,
    pub clock: ClockOffsetState,
    outbound: mpsc::Sender<String>,
}

impl AgentSession {
    pub fn new(
        conn_id: u64,
        outbound: mpsc::Sender<String>,
        agent_id: String,
        hostname: String,
        platform: String,
        capabilities: HashMap<String, Value>,
    ) -> Self {
        Self {
            conn_id,
            agent_id,
            name: hostname.clone(),
            hostname,
            platform,
            capabilities,
            token: None,
            status: AdmissionStatus::Pending,
            state: PlaybackState::Idle,
            cue_id: None,
            position_ms: 0,
            rate: 1.0,
            volume: 100,
            drift_ms: 0.0,
            last_heartbeat: Instant::now(),
            last_error: None,
            clock: ClockOffsetState::new(),
            outbound,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == AdmissionStatus::Accepted
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.elapsed()
    }

    /// Queues a message for this session's connection. A full or closed
    /// queue is logged and ignored so that fan-outs never abort.
    pub fn send(&self, msg: &CoordinatorMessage) {
        if let Err(e) = self.outbound.try_send(msg.to_frame()) {
            warn!(
                "Failed to send {} to agent {}: {e}",
                msg.msg_type(),
                self.agent_id
            );
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let heartbeat_age = self.heartbeat_age();
        SessionSnapshot {
            agent_id: self.agent_id.clone(),
            hostname: self.hostname.clone(),
            platform: self.platform.clone(),
            name: self.name.clone(),
            status: self.status,
            state: self.state,
            cue_id: self.cue_id.clone(),
            position_ms: self.position_ms,
            rate: self.rate,
            volume: self.volume,
            drift_ms: self.drift_ms,
            heartbeat_age_s: heartbeat_age.as_secs_f64(),
            stale: heartbeat_age > STALE_HEARTBEAT,
            last_error: self.last_error.clone(),
            offset_ms: self.clock.offset_ms(),
            sample_count: self.clock.sample_count(),
        }
    }
}

/// Copy of a session's observable state for the operator layer.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub agent_id: String,
    pub hostname: String,
    pub platform: String,
    pub name: String,
    pub status: AdmissionStatus,
    pub state: PlaybackState,
    pub cue_id: Option<String>,
    pub position_ms: i64,
    pub rate: f64,
    pub volume: u8,
    pub drift_ms: f64,
    pub heartbeat_age_s: f64,
    pub stale: bool,
    pub last_error: Option<String>,
    pub offset_ms: f64,
    pub sample_count: usize,
}
