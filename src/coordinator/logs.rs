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

use crate::protocol::LogRecord;
use std::collections::{HashMap, VecDeque};

/// Max LOG records kept in memory per agent, drop-oldest.
const MAX_AGENT_LOGS: usize = 5000;

/// In-memory store of log records forwarded by agents.
#[derive(Default)]
pub struct LogAggregator {
    buffers: HashMap<String, VecDeque<LogRecord>>,
}

impl LogAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, agent_id: &str, record: LogRecord) {
        let buffer = self.buffers.entry(agent_id.to_owned()).or_default();
        buffer.push_back(record);
        if buffer.len() > MAX_AGENT_LOGS {
            buffer.pop_front();
        }
    }

    pub fn snapshot(&self, agent_id: &str) -> Vec<LogRecord> {
        self.buffers
            .get(agent_id)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.buffers.keys().cloned().collect()
    }
}
