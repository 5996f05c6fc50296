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
    coordinator::session::SessionSnapshot,
    error::CoordinatorResult,
    protocol::{DriftReport, LogRecord},
    show::{Cue, manifest::AgentPreflight},
};
use std::{path::PathBuf, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    time::sleep,
};
use tracing::instrument;

/// What happened on the control plane, for the operator layer. Subscribers
/// receive these over the channel handed to the server at start.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    Hello(SessionSnapshot),
    SessionChanged(SessionSnapshot),
    Ready {
        agent_id: String,
        cue_id: String,
    },
    Drift {
        agent_id: String,
        report: DriftReport,
    },
    Log {
        agent_id: String,
        record: LogRecord,
    },
    Disconnected {
        agent_id: String,
    },
}

#[derive(Debug)]
pub(crate) enum CoordinatorApiMessage {
    Accept {
        agent_id: String,
        name: Option<String>,
        result: oneshot::Sender<CoordinatorResult<()>>,
    },
    Reject {
        agent_id: String,
        reason: String,
        result: oneshot::Sender<CoordinatorResult<()>>,
    },
    LoadCue(Box<Cue>),
    PlayAt {
        cue_id: String,
        start_lead_ms: i64,
        result: oneshot::Sender<i64>,
    },
    Pause,
    Stop,
    SeekTo(i64),
    SetRate(f64),
    SetVolume(u8),
    Blackout(bool),
    ShowTestscreen(bool),
    RequestStatus,
    Sessions(oneshot::Sender<Vec<SessionSnapshot>>),
    AgentLogs {
        agent_id: String,
        result: oneshot::Sender<Vec<LogRecord>>,
    },
    Preflight {
        media_root: PathBuf,
        cue_files: Vec<String>,
        result: oneshot::Sender<Vec<AgentPreflight>>,
    },
}

/// Handle to a running coordinator server. Cheap to clone; all methods go
/// through the server actor's queue.
#[derive(Debug, Clone)]
pub struct CoordinatorApi {
    api_tx: mpsc::Sender<CoordinatorApiMessage>,
    controller_id: String,
    port: u16,
}

impl CoordinatorApi {
    pub(crate) fn new(
        api_tx: mpsc::Sender<CoordinatorApiMessage>,
        controller_id: String,
        port: u16,
    ) -> Self {
        Self {
            api_tx,
            controller_id,
            port,
        }
    }

    pub fn controller_id(&self) -> &str {
        &self.controller_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    #[instrument(skip(self))]
    pub async fn accept(&self, agent_id: &str, name: Option<String>) -> CoordinatorResult<()> {
        let (tx, rx) = oneshot::channel();
        self.api_tx
            .send(CoordinatorApiMessage::Accept {
                agent_id: agent_id.to_owned(),
                name,
                result: tx,
            })
            .await
            .ok();
        rx.await?
    }

    #[instrument(skip(self))]
    pub async fn reject(&self, agent_id: &str, reason: &str) -> CoordinatorResult<()> {
        let (tx, rx) = oneshot::channel();
        self.api_tx
            .send(CoordinatorApiMessage::Reject {
                agent_id: agent_id.to_owned(),
                reason: reason.to_owned(),
                result: tx,
            })
            .await
            .ok();
        rx.await?
    }

    #[instrument(skip(self, cue))]
    pub async fn send_load_cue(&self, cue: &Cue) {
        self.api_tx
            .send(CoordinatorApiMessage::LoadCue(Box::new(cue.clone())))
            .await
            .ok();
    }

    /// Fires one cue: broadcasts LOAD_CUE, gives agents half the start
    /// lead to prepare, then schedules the synchronized start. Returns the
    /// chosen master start instant.
    #[instrument(skip(self, cue))]
    pub async fn go_cue(&self, cue: &Cue, start_lead_ms: i64) -> CoordinatorResult<i64> {
        self.send_load_cue(cue).await;
        sleep(Duration::from_millis((start_lead_ms / 2).max(0) as u64)).await;
        self.send_play_at(&cue.id, start_lead_ms).await
    }

    /// Broadcasts PLAY_AT and returns the chosen master start instant.
    #[instrument(skip(self))]
    pub async fn send_play_at(&self, cue_id: &str, start_lead_ms: i64) -> CoordinatorResult<i64> {
        let (tx, rx) = oneshot::channel();
        self.api_tx
            .send(CoordinatorApiMessage::PlayAt {
                cue_id: cue_id.to_owned(),
                start_lead_ms,
                result: tx,
            })
            .await
            .ok();
        Ok(rx.await?)
    }

    #[instrument(skip(self))]
    pub async fn send_pause(&self) {
        self.api_tx.send(CoordinatorApiMessage::Pause).await.ok();
    }

    #[instrument(skip(self))]
    pub async fn send_stop(&self) {
        self.api_tx.send(CoordinatorApiMessage::Stop).await.ok();
    }

    #[instrument(skip(self))]
    pub async fn send_seek(&self, position_ms: i64) {
        self.api_tx
            .send(CoordinatorApiMessage::SeekTo(position_ms))
            .await
            .ok();
    }

    #[instrument(skip(self))]
    pub async fn send_set_rate(&self, rate: f64) {
        self.api_tx
            .send(CoordinatorApiMessage::SetRate(rate))
            .await
            .ok();
    }

    #[instrument(skip(self))]
    pub async fn send_set_volume(&self, volume: u8) {
        self.api_tx
            .send(CoordinatorApiMessage::SetVolume(volume))
            .await
            .ok();
    }

    #[instrument(skip(self))]
    pub async fn send_blackout(&self, on: bool) {
        self.api_tx
            .send(CoordinatorApiMessage::Blackout(on))
            .await
            .ok();
    }

    #[instrument(skip(self))]
    pub async fn send_testscreen(&self, on: bool) {
        self.api_tx
            .send(CoordinatorApiMessage::ShowTestscreen(on))
            .await
            .ok();
    }

    #[instrument(skip(self))]
    pub async fn request_status_all(&self) {
        self.api_tx
            .send(CoordinatorApiMessage::RequestStatus)
            .await
            .ok();
    }

    #[instrument(skip(self))]
    pub async fn sessions(&self) -> CoordinatorResult<Vec<SessionSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.api_tx
            .send(CoordinatorApiMessage::Sessions(tx))
            .await
            .ok();
        Ok(rx.await?)
    }

    #[instrument(skip(self))]
    pub async fn agent_logs(&self, agent_id: &str) -> CoordinatorResult<Vec<LogRecord>> {
        let (tx, rx) = oneshot::channel();
        self.api_tx
            .send(CoordinatorApiMessage::AgentLogs {
                agent_id: agent_id.to_owned(),
                result: tx,
            })
            .await
            .ok();
        Ok(rx.await?)
    }

    /// Hashes the coordinator's own media copies for every cue file and
    /// reports the check per accepted agent.
    #[instrument(skip(self, cue_files))]
    pub async fn preflight(
        &self,
        media_root: PathBuf,
        cue_files: Vec<String>,
    ) -> CoordinatorResult<Vec<AgentPreflight>> {
        let (tx, rx) = oneshot::channel();
        self.api_tx
            .send(CoordinatorApiMessage::Preflight {
                media_root,
                cue_files,
                result: tx,
            })
            .await
            .ok();
        Ok(rx.await?)
    }
}
