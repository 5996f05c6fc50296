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

//! Media manifests for preflight: agents must already have every cue asset,
//! so before a show the coordinator hashes its copies and compares.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeMap,
    fmt::Display,
    fs::File,
    io::{self, Read},
    path::Path,
};

const CHUNK_SIZE: usize = 65536;

/// SHA-256 hex digest of a file, streamed in chunks.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Maps each relative path to its digest, `None` for missing files.
pub fn build_media_manifest(
    media_root: &Path,
    cue_files: &[String],
) -> BTreeMap<String, Option<String>> {
    let mut manifest = BTreeMap::new();
    for rel in cue_files {
        let path = media_root.join(rel);
        let digest = if path.is_file() {
            sha256_file(&path).ok()
        } else {
            None
        };
        manifest.insert(rel.clone(), digest);
    }
    manifest
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCheckStatus {
    Ok,
    Missing,
    Mismatch,
    MissingOnCoordinator,
    Unknown,
}

impl Display for FileCheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileCheckStatus::Ok => "ok",
            FileCheckStatus::Missing => "missing",
            FileCheckStatus::Mismatch => "mismatch",
            FileCheckStatus::MissingOnCoordinator => "missing_on_controller",
            FileCheckStatus::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCheck {
    pub rel_path: String,
    pub coordinator_hash: Option<String>,
    pub agent_hash: Option<String>,
    pub status: FileCheckStatus,
}

impl FileCheck {
    pub fn new(
        rel_path: String,
        coordinator_hash: Option<String>,
        agent_hash: Option<String>,
    ) -> Self {
        let status = match (&coordinator_hash, &agent_hash) {
            (None, _) => FileCheckStatus::MissingOnCoordinator,
            (Some(_), None) => FileCheckStatus::Missing,
            (Some(c), Some(a)) if c == a => FileCheckStatus::Ok,
            _ => FileCheckStatus::Mismatch,
        };
        Self {
            rel_path,
            coordinator_hash,
            agent_hash,
            status,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPreflight {
    pub agent_id: String,
    pub files: Vec<FileCheck>,
}

impl AgentPreflight {
    pub fn all_ok(&self) -> bool {
        self.files.iter().all(|f| f.status == FileCheckStatus::Ok)
    }
}
