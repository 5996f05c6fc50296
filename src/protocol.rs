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

//! Wire protocol between coordinator and agents.
//!
//! Every frame is one JSON envelope per line: a tagged record with a string
//! `type`, the sender's wall clock in `ts_utc_ms` and a `payload` map. The
//! typed message layer decodes payloads strictly, one record type per
//! catalog entry.

use crate::{
    error::{ProtocolError, ProtocolResult},
    show::CueKind,
    sync::DriftAction,
    time::wall_clock_ms,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::{collections::HashMap, fmt::Display};

pub const DEFAULT_PORT: u16 = 9420;

// Coordinator → Agent
pub const MSG_HELLO_ACK: &str = "HELLO_ACK";
pub const MSG_ACCEPT: &str = "ACCEPT";
pub const MSG_REJECT: &str = "REJECT";
pub const MSG_LOAD_CUE: &str = "LOAD_CUE";
pub const MSG_PLAY_AT: &str = "PLAY_AT";
pub const MSG_PAUSE: &str = "PAUSE";
pub const MSG_STOP: &str = "STOP";
pub const MSG_SEEK_TO: &str = "SEEK_TO";
pub const MSG_SET_RATE: &str = "SET_RATE";
pub const MSG_SET_VOLUME: &str = "SET_VOLUME";
pub const MSG_BLACKOUT: &str = "BLACKOUT";
pub const MSG_SHOW_TESTSCREEN: &str = "SHOW_TESTSCREEN";
pub const MSG_REQUEST_STATUS: &str = "REQUEST_STATUS";
pub const MSG_SYNC: &str = "SYNC";

// Agent → Coordinator
pub const MSG_HELLO: &str = "HELLO";
pub const MSG_AUTH: &str = "AUTH";
pub const MSG_READY: &str = "READY";
pub const MSG_STATUS: &str = "STATUS";
pub const MSG_DRIFT: &str = "DRIFT";
pub const MSG_HEARTBEAT: &str = "HEARTBEAT";
pub const MSG_LOG: &str = "LOG";
pub const MSG_SYNC_REPLY: &str = "SYNC_REPLY";
pub const MSG_ERROR: &str = "ERROR";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub ts_utc_ms: i64,
    #[serde(default = "empty_payload")]
    pub payload: Value,
}

fn empty_payload() -> Value {
    Value::Object(Map::new())
}

pub fn encode(msg_type: &str, payload: Value) -> String {
    let envelope = Envelope {
        msg_type: msg_type.to_owned(),
        ts_utc_ms: wall_clock_ms(),
        payload,
    };
    serde_json::to_string(&envelope).unwrap_or_else(|_| String::from("{}"))
}

pub fn decode(raw: &str) -> ProtocolResult<Envelope> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))?;
    let Value::Object(ref map) = value else {
        return Err(ProtocolError::MalformedEnvelope(
            "frame is not a JSON object".to_owned(),
        ));
    };
    if !map.get("type").is_some_and(Value::is_string) {
        return Err(ProtocolError::MalformedEnvelope(
            "missing string 'type' field".to_owned(),
        ));
    }
    if map.get("payload").is_some_and(|p| !p.is_object()) {
        return Err(ProtocolError::MalformedEnvelope(
            "'payload' is not a map".to_owned(),
        ));
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))
}

/// Playback state of an agent's media layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
    Error,
    Black,
}

impl Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Loading => "loading",
            PlaybackState::Ready => "ready",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Error => "error",
            PlaybackState::Black => "black",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub agent_id: String,
    pub hostname: String,
    pub platform: String,
    #[serde(default)]
    pub capabilities: HashMap<String, Value>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAck {
    pub coordinator_id: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Accept {
    pub token: String,
    pub assigned_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reject {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadCue {
    pub cue_id: String,
    #[serde(rename = "type")]
    pub kind: CueKind,
    pub asset_relpath: String,
    #[serde(default)]
    pub start_time_ms: i64,
    pub volume: u8,
    #[serde(rename = "loop")]
    pub looping: bool,
    #[serde(default)]
    pub fade_in_ms: i64,
    #[serde(default)]
    pub fade_out_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayAt {
    pub cue_id: String,
    pub master_start_utc_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeekTo {
    pub position_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetRate {
    pub rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetVolume {
    pub volume: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blackout {
    pub on: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowTestscreen {
    pub on: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncProbe {
    pub t1_utc_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ready {
    pub cue_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: PlaybackState,
    #[serde(default)]
    pub cue_id: Option<String>,
    #[serde(default)]
    pub position_ms: i64,
    pub rate: f64,
    pub volume: u8,
    pub fullscreen: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
    pub offset_ms: f64,
    pub drift_ms: f64,
    pub action: DriftAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub local_utc_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub ts_utc_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReply {
    pub t1_utc_ms: i64,
    pub t2_client_recv_utc_ms: i64,
    pub t3_client_send_utc_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    #[serde(default)]
    pub cue_id: Option<String>,
    pub reason: String,
}

/// Messages the coordinator sends to agents.
#[derive(Debug, Clone)]
pub enum CoordinatorMessage {
    HelloAck(HelloAck),
    Accept(Accept),
    Reject(Reject),
    LoadCue(LoadCue),
    PlayAt(PlayAt),
    Pause,
    Stop,
    SeekTo(SeekTo),
    SetRate(SetRate),
    SetVolume(SetVolume),
    Blackout(Blackout),
    ShowTestscreen(ShowTestscreen),
    RequestStatus,
    Sync(SyncProbe),
}

impl CoordinatorMessage {
    pub fn msg_type(&self) -> &'static str {
        match self {
            CoordinatorMessage::HelloAck(_) => MSG_HELLO_ACK,
            CoordinatorMessage::Accept(_) => MSG_ACCEPT,
            CoordinatorMessage::Reject(_) => MSG_REJECT,
            CoordinatorMessage::LoadCue(_) => MSG_LOAD_CUE,
            CoordinatorMessage::PlayAt(_) => MSG_PLAY_AT,
            CoordinatorMessage::Pause => MSG_PAUSE,
            CoordinatorMessage::Stop => MSG_STOP,
            CoordinatorMessage::SeekTo(_) => MSG_SEEK_TO,
            CoordinatorMessage::SetRate(_) => MSG_SET_RATE,
            CoordinatorMessage::SetVolume(_) => MSG_SET_VOLUME,
            CoordinatorMessage::Blackout(_) => MSG_BLACKOUT,
            CoordinatorMessage::ShowTestscreen(_) => MSG_SHOW_TESTSCREEN,
            CoordinatorMessage::RequestStatus => MSG_REQUEST_STATUS,
            CoordinatorMessage::Sync(_) => MSG_SYNC,
        }
    }

    pub fn to_frame(&self) -> String {
        let payload = match self {
            CoordinatorMessage::HelloAck(p) => payload_of(p),
            CoordinatorMessage::Accept(p) => payload_of(p),
            CoordinatorMessage::Reject(p) => payload_of(p),
            CoordinatorMessage::LoadCue(p) => payload_of(p),
            CoordinatorMessage::PlayAt(p) => payload_of(p),
            CoordinatorMessage::SeekTo(p) => payload_of(p),
            CoordinatorMessage::SetRate(p) => payload_of(p),
            CoordinatorMessage::SetVolume(p) => payload_of(p),
            CoordinatorMessage::Blackout(p) => payload_of(p),
            CoordinatorMessage::ShowTestscreen(p) => payload_of(p),
            CoordinatorMessage::Sync(p) => payload_of(p),
            CoordinatorMessage::Pause
            | CoordinatorMessage::Stop
            | CoordinatorMessage::RequestStatus => empty_payload(),
        };
        encode(self.msg_type(), payload)
    }

    pub fn from_envelope(envelope: &Envelope) -> ProtocolResult<Self> {
        let msg = match envelope.msg_type.as_str() {
            MSG_HELLO_ACK => CoordinatorMessage::HelloAck(typed_payload(envelope)?),
            MSG_ACCEPT => CoordinatorMessage::Accept(typed_payload(envelope)?),
            MSG_REJECT => CoordinatorMessage::Reject(typed_payload(envelope)?),
            MSG_LOAD_CUE => CoordinatorMessage::LoadCue(typed_payload(envelope)?),
            MSG_PLAY_AT => CoordinatorMessage::PlayAt(typed_payload(envelope)?),
            MSG_PAUSE => CoordinatorMessage::Pause,
            MSG_STOP => CoordinatorMessage::Stop,
            MSG_SEEK_TO => CoordinatorMessage::SeekTo(typed_payload(envelope)?),
            MSG_SET_RATE => CoordinatorMessage::SetRate(typed_payload(envelope)?),
            MSG_SET_VOLUME => CoordinatorMessage::SetVolume(typed_payload(envelope)?),
            MSG_BLACKOUT => CoordinatorMessage::Blackout(typed_payload(envelope)?),
            MSG_SHOW_TESTSCREEN => CoordinatorMessage::ShowTestscreen(typed_payload(envelope)?),
            MSG_REQUEST_STATUS => CoordinatorMessage::RequestStatus,
            MSG_SYNC => CoordinatorMessage::Sync(typed_payload(envelope)?),
            other => return Err(ProtocolError::UnknownMessageType(other.to_owned())),
        };
        Ok(msg)
    }
}

/// Messages agents send to the coordinator.
#[derive(Debug, Clone)]
pub enum AgentMessage {
    Hello(Hello),
    Auth(Auth),
    Ready(Ready),
    Status(StatusReport),
    Drift(DriftReport),
    Heartbeat(Heartbeat),
    Log(LogRecord),
    SyncReply(SyncReply),
    Error(ErrorReport),
}

impl AgentMessage {
    pub fn msg_type(&self) -> &'static str {
        match self {
            AgentMessage::Hello(_) => MSG_HELLO,
            AgentMessage::Auth(_) => MSG_AUTH,
            AgentMessage::Ready(_) => MSG_READY,
            AgentMessage::Status(_) => MSG_STATUS,
            AgentMessage::Drift(_) => MSG_DRIFT,
            AgentMessage::Heartbeat(_) => MSG_HEARTBEAT,
            AgentMessage::Log(_) => MSG_LOG,
            AgentMessage::SyncReply(_) => MSG_SYNC_REPLY,
            AgentMessage::Error(_) => MSG_ERROR,
        }
    }

    pub fn to_frame(&self) -> String {
        let payload = match self {
            AgentMessage::Hello(p) => payload_of(p),
            AgentMessage::Auth(p) => payload_of(p),
            AgentMessage::Ready(p) => payload_of(p),
            AgentMessage::Status(p) => payload_of(p),
            AgentMessage::Drift(p) => payload_of(p),
            AgentMessage::Heartbeat(p) => payload_of(p),
            AgentMessage::Log(p) => payload_of(p),
            AgentMessage::SyncReply(p) => payload_of(p),
            AgentMessage::Error(p) => payload_of(p),
        };
        encode(self.msg_type(), payload)
    }

    pub fn from_envelope(envelope: &Envelope) -> ProtocolResult<Self> {
        let msg = match envelope.msg_type.as_str() {
            MSG_HELLO => AgentMessage::Hello(typed_payload(envelope)?),
            MSG_AUTH => AgentMessage::Auth(typed_payload(envelope)?),
            MSG_READY => AgentMessage::Ready(typed_payload(envelope)?),
            MSG_STATUS => AgentMessage::Status(typed_payload(envelope)?),
            MSG_DRIFT => AgentMessage::Drift(typed_payload(envelope)?),
            MSG_HEARTBEAT => AgentMessage::Heartbeat(typed_payload(envelope)?),
            MSG_LOG => AgentMessage::Log(typed_payload(envelope)?),
            MSG_SYNC_REPLY => AgentMessage::SyncReply(typed_payload(envelope)?),
            MSG_ERROR => AgentMessage::Error(typed_payload(envelope)?),
            other => return Err(ProtocolError::UnknownMessageType(other.to_owned())),
        };
        Ok(msg)
    }
}

fn typed_payload<T: DeserializeOwned>(envelope: &Envelope) -> ProtocolResult<T> {
    serde_json::from_value(envelope.payload.clone()).map_err(|e| ProtocolError::InvalidPayload {
        msg_type: envelope.msg_type.clone(),
        source: e,
    })
}

fn payload_of<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or_else(|_| empty_payload())
}
