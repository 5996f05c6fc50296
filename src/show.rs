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

//! Show files: an ordered cue list plus playback and sync settings, stored
//! as TOML.

pub mod manifest;
pub mod run;

use crate::error::ShowResult;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{
    fmt::Display,
    path::{Path, PathBuf},
};
use tokio::fs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CueKind {
    #[default]
    Video,
    Image,
}

impl Display for CueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CueKind::Video => write!(f, "video"),
            CueKind::Image => write!(f, "image"),
        }
    }
}

/// What an agent does with its player when the control connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DropoutPolicy {
    #[default]
    Continue,
    Freeze,
    Black,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncCorrection {
    pub rate_min: f64,
    pub rate_max: f64,
    pub hard_seek_threshold_ms: i64,
    pub sync_interval_ms: u64,
}

impl Default for SyncCorrection {
    fn default() -> Self {
        Self {
            rate_min: 0.98,
            rate_max: 1.02,
            hard_seek_threshold_ms: 300,
            sync_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub mode: String,
    pub max_drift_ms: i64,
    pub start_lead_ms: i64,
    pub correction: SyncCorrection,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: "medium".to_owned(),
            max_drift_ms: 150,
            start_lead_ms: 250,
            correction: SyncCorrection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    pub fullscreen: bool,
    pub default_volume: u8,
    pub default_fade_in_ms: i64,
    pub default_fade_out_ms: i64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            fullscreen: true,
            default_volume: 100,
            default_fade_in_ms: 0,
            default_fade_out_ms: 0,
        }
    }
}

/// A known agent pinned in the show file so its display name survives
/// restarts.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AgentEntry {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Cue {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: CueKind,
    pub file: String,
    pub start_time_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time_ms: Option<i64>,
    pub volume: u8,
    #[serde(rename = "loop")]
    pub looping: bool,
    pub fade_in_ms: i64,
    pub fade_out_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_follow_ms: Option<i64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub notes: String,
}

impl Default for Cue {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            kind: CueKind::Video,
            file: String::new(),
            start_time_ms: 0,
            end_time_ms: None,
            volume: 100,
            looping: false,
            fade_in_ms: 0,
            fade_out_ms: 0,
            auto_follow_ms: None,
            notes: String::new(),
        }
    }
}

impl Cue {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.id.is_empty() {
            errors.push("Cue missing 'id'".to_owned());
        } else if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            errors.push(format!("Cue id '{}' contains invalid characters", self.id));
        }
        if self.file.is_empty() {
            errors.push(format!("Cue '{}': file is required", self.id));
        }
        if self.volume > 100 {
            errors.push(format!("Cue '{}': volume must be 0-100", self.id));
        }
        errors
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShowMeta {
    pub title: String,
    pub version: u32,
    pub created_utc: String,
    pub modified_utc: String,
    pub media_root: String,
    pub dropout_policy: DropoutPolicy,
    pub sync: SyncConfig,
    pub settings: GlobalSettings,
}

impl Default for ShowMeta {
    fn default() -> Self {
        Self {
            title: "Untitled Show".to_owned(),
            version: 1,
            created_utc: String::new(),
            modified_utc: String::new(),
            media_root: "~/cuemesh_media".to_owned(),
            dropout_policy: DropoutPolicy::Continue,
            sync: SyncConfig::default(),
            settings: GlobalSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Show {
    pub show: ShowMeta,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
    #[serde(default)]
    pub cues: Vec<Cue>,
}

impl Show {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut ids_seen = std::collections::HashSet::new();
        for cue in &self.cues {
            errors.extend(cue.validate());
            if !ids_seen.insert(cue.id.clone()) {
                errors.push(format!("Duplicate cue id: {}", cue.id));
            }
        }
        errors
    }

    /// Resolves every cue asset against `base_path`/media_root and reports
    /// whether it exists.
    pub fn validate_media_paths(&self, base_path: &Path) -> Vec<(String, PathBuf, bool)> {
        let media_root = base_path.join(&self.show.media_root);
        self.cues
            .iter()
            .map(|cue| {
                let resolved = media_root.join(&cue.file);
                let exists = resolved.exists();
                (cue.id.clone(), resolved, exists)
            })
            .collect()
    }

    pub fn cue(&self, cue_id: &str) -> Option<&Cue> {
        self.cues.iter().find(|c| c.id == cue_id)
    }
}

pub async fn load_show(path: &Path) -> ShowResult<Show> {
    let content = fs::read_to_string(path).await?;
    Ok(toml::from_str(&content)?)
}

pub async fn save_show(show: &mut Show, path: &Path) -> ShowResult<()> {
    let now = Utc::now().to_rfc3339();
    if show.show.created_utc.is_empty() {
        show.show.created_utc = now.clone();
    }
    show.show.modified_utc = now;
    let content = toml::to_string_pretty(&show)?;
    fs::write(path, content).await?;
    Ok(())
}
