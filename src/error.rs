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

use miette::Diagnostic;
use std::io;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing_subscriber::{
    filter::{FromEnvError, ParseError},
    util::TryInitError,
};

#[derive(Error, Debug, Diagnostic)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("Invalid {msg_type} payload: {source}")]
    InvalidPayload {
        msg_type: String,
        source: serde_json::Error,
    },
}

#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Tracing init error: {0}")]
    TryInitError(#[from] TryInitError),
    #[error("Tracing config parse error: {0}")]
    ParseError(#[from] ParseError),
    #[error("Tracing env filter error: {0}")]
    FromEnvError(#[from] FromEnvError),
}

#[derive(Error, Debug, Diagnostic)]
pub enum ShowError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerError(#[from] toml::ser::Error),
}

#[derive(Error, Debug, Diagnostic)]
pub enum PlayerError {
    #[error("Media player unavailable: {0}")]
    Unavailable(String),
    #[error("Media player command timed out: {0}")]
    Timeout(String),
    #[error("Media player IPC error: {0}")]
    Ipc(String),
    #[error("Media player rejected command: {0}")]
    Rejected(String),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON serde error: {0}")]
    JsonSerdeError(#[from] serde_json::Error),
}

#[derive(Error, Debug, Diagnostic)]
pub enum DiscoveryError {
    #[error("mDNS error: {0}")]
    MdnsError(#[from] mdns_sd::Error),
    #[error("Multicast DNS unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Diagnostic)]
pub enum CoordinatorError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Protocol error: {0}")]
    ProtocolError(#[from] ProtocolError),
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("JSON serde error: {0}")]
    JsonSerdeError(#[from] serde_json::Error),
    #[error("Discovery error: {0}")]
    DiscoveryError(#[from] DiscoveryError),
    #[error("API error.")]
    ApiError(#[from] oneshot::error::RecvError),
    #[error("No such agent: {0}")]
    NoSuchAgent(String),
}

#[derive(Error, Debug, Diagnostic)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Protocol error: {0}")]
    ProtocolError(#[from] ProtocolError),
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("JSON serde error: {0}")]
    JsonSerdeError(#[from] serde_json::Error),
    #[error("Media player error: {0}")]
    PlayerError(#[from] PlayerError),
    #[error("Discovery error: {0}")]
    DiscoveryError(#[from] DiscoveryError),
    #[error("No coordinator found.")]
    NoCoordinator,
}

#[derive(Error, Debug, Diagnostic)]
pub enum CueMeshError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Show file error: {0}")]
    ShowError(#[from] ShowError),
    #[error("Protocol error: {0}")]
    ProtocolError(#[from] ProtocolError),
    #[error("Coordinator error: {0}")]
    CoordinatorError(#[from] CoordinatorError),
    #[error("Agent error: {0}")]
    AgentError(#[from] AgentError),
    #[error("Media player error: {0}")]
    PlayerError(#[from] PlayerError),
    #[error("Discovery error: {0}")]
    DiscoveryError(#[from] DiscoveryError),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type ShowResult<T> = Result<T, ShowError>;
pub type PlayerResult<T> = Result<T, PlayerError>;
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
pub type AgentResult<T> = Result<T, AgentError>;
pub type CueMeshResult<T> = Result<T, CueMeshError>;
