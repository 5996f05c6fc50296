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

//! Persistent agent trust tokens.
//!
//! An agent that re-presents the token it was issued on ACCEPT is admitted
//! without operator action, across coordinator restarts. Only the server
//! actor mutates the store.

use std::{collections::HashMap, fs, io, path::PathBuf};
use tracing::{info, warn};

pub struct TrustStore {
    path: PathBuf,
    tokens: HashMap<String, String>,
}

impl TrustStore {
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cuemesh")
            .join("trusted_agents.json")
    }

    pub fn load(path: PathBuf) -> Self {
        let tokens = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(tokens) => tokens,
                Err(e) => {
                    warn!(
                        "Trust store {} is corrupt, starting empty: {e}",
                        path.display()
                    );
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        if !tokens.is_empty() {
            info!("Loaded {} trusted agent(s) from {}", tokens.len(), path.display());
        }
        Self { path, tokens }
    }

    pub fn token_matches(&self, agent_id: &str, token: &str) -> bool {
        self.tokens.get(agent_id).is_some_and(|t| t == token)
    }

    pub fn insert(&mut self, agent_id: String, token: String) -> io::Result<()> {
        self.tokens.insert(agent_id, token);
        self.persist()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn persist(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.tokens)?;
        fs::write(&self.path, content)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn scratch_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("cuemesh-trust-{}", hex::encode(rand::random::<[u8; 8]>())))
            .join("trusted_agents.json")
    }

    #[test]
    fn tokens_survive_reload() {
        let path = scratch_path();
        let mut store = TrustStore::load(path.clone());
        assert!(store.is_empty());
        store
            .insert("agent-1".to_owned(), "tok1".to_owned())
            .expect("persist failed");

        let reloaded = TrustStore::load(path);
        assert_eq!(1, reloaded.len());
        assert!(reloaded.token_matches("agent-1", "tok1"));
        assert!(!reloaded.token_matches("agent-1", "tok2"));
        assert!(!reloaded.token_matches("agent-2", "tok1"));
    }

    #[test]
    fn corrupt_store_starts_empty() {
        let path = scratch_path();
        fs::create_dir_all(path.parent().expect("no parent")).expect("mkdir failed");
        fs::write(&path, "not json").expect("write failed");
        let store = TrustStore::load(path);
        assert!(store.is_empty());
    }
}
