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

//! Persistent agent identity.
//!
//! The agent id is generated once and reused forever; the trust token is
//! filled in when the operator accepts the agent and re-presented on every
//! HELLO.

use serde::{Deserialize, Serialize};
use std::{fs, io, path::Path, path::PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub token: Option<String>,
}

impl AgentIdentity {
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cuemesh")
            .join("agent_identity.json")
    }

    pub fn load_or_create(path: &Path) -> Self {
        if let Ok(content) = fs::read_to_string(path) {
            match serde_json::from_str::<AgentIdentity>(&content) {
                Ok(identity) => return identity,
                Err(e) => warn!(
                    "Agent identity file {} is corrupt, generating a new identity: {e}",
                    path.display()
                ),
            }
        }
        let identity = AgentIdentity {
            agent_id: hex::encode(rand::random::<[u8; 16]>()),
            token: None,
        };
        info!("Generated new agent id {}", identity.agent_id);
        if let Err(e) = identity.save(path) {
            warn!("Could not persist agent identity: {e}");
        }
        identity
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
    }
}
