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

//! mpv backend driven over its JSON IPC socket.
//!
//! mpv runs as a child process with `--input-ipc-server`; commands are
//! newline-delimited JSON with a request id. The agent issues at most one
//! command at a time, so responses are read inline, skipping interleaved
//! event notifications.

use crate::{
    error::{PlayerError, PlayerResult},
    player::{LoadRequest, MediaPlayer},
};
use serde_json::{Value, json};
use std::{path::PathBuf, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
    process::{Child, Command},
    time::{sleep, timeout},
};
use tracing::{debug, info, instrument, warn};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);
const SOCKET_WAIT_ATTEMPTS: u32 = 50;
const SOCKET_WAIT_INTERVAL: Duration = Duration::from_millis(100);

const BLACK_SOURCE: &str = "lavfi://color=black:s=1920x1080:d=86400";
const TESTSCREEN_SOURCE: &str = "lavfi://smptebars=s=1920x1080:d=86400";

pub struct MpvPlayer {
    child: Child,
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    socket_path: PathBuf,
    request_id: u64,
}

impl MpvPlayer {
    /// Spawns mpv and connects to its IPC socket.
    #[instrument]
    pub async fn spawn() -> PlayerResult<Self> {
        let socket_path =
            std::env::temp_dir().join(format!("cuemesh_mpv_{}.sock", std::process::id()));
        if socket_path.exists() {
            tokio::fs::remove_file(&socket_path).await.ok();
        }

        let child = Command::new("mpv")
            .arg("--no-config")
            .arg("--idle=yes")
            .arg("--fs")
            .arg("--no-terminal")
            .arg("--keep-open=yes")
            .arg("--loop=no")
            .arg(format!("--input-ipc-server={}", socket_path.display()))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PlayerError::Unavailable(format!("could not start mpv (is it installed?): {e}"))
            })?;

        info!("mpv process started");

        let mut attempts = 0;
        while !socket_path.exists() {
            attempts += 1;
            if attempts > SOCKET_WAIT_ATTEMPTS {
                return Err(PlayerError::Unavailable(
                    "mpv IPC socket did not appear within 5s".to_owned(),
                ));
            }
            sleep(SOCKET_WAIT_INTERVAL).await;
        }

        let stream = UnixStream::connect(&socket_path)
            .await
            .map_err(|e| PlayerError::Unavailable(format!("could not connect to mpv IPC: {e}")))?;
        let (read_half, writer) = stream.into_split();
        let reader = BufReader::new(read_half).lines();

        info!("Connected to mpv IPC socket at {}", socket_path.display());

        Ok(Self {
            child,
            reader,
            writer,
            socket_path,
            request_id: 0,
        })
    }

    pub async fn shutdown(mut self) {
        self.child.kill().await.ok();
        tokio::fs::remove_file(&self.socket_path).await.ok();
        info!("mpv stopped.");
    }

    async fn command(&mut self, args: Vec<Value>) -> PlayerResult<Value> {
        self.request_id += 1;
        let request_id = self.request_id;
        let command_name = args
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let mut frame =
            serde_json::to_string(&json!({"command": args, "request_id": request_id}))?;
        frame.push('\n');

        timeout(COMMAND_TIMEOUT, async {
            self.writer.write_all(frame.as_bytes()).await?;
            loop {
                let Some(line) = self.reader.next_line().await? else {
                    return Err(PlayerError::Ipc("mpv closed the IPC socket".to_owned()));
                };
                let response: Value = match serde_json::from_str(&line) {
                    Ok(it) => it,
                    Err(e) => {
                        debug!("Skipping unparseable mpv line: {e}");
                        continue;
                    }
                };
                if response.get("event").is_some() {
                    continue;
                }
                if response.get("request_id").and_then(Value::as_u64) != Some(request_id) {
                    continue;
                }
                let error = response
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                if error != "success" {
                    return Err(PlayerError::Rejected(error.to_owned()));
                }
                return Ok(response.get("data").cloned().unwrap_or(Value::Null));
            }
        })
        .await
        .map_err(|_| PlayerError::Timeout(command_name))?
    }

    async fn set_property(&mut self, name: &str, value: Value) -> PlayerResult<()> {
        self.command(vec![json!("set_property"), json!(name), value])
            .await?;
        Ok(())
    }

    async fn load_source(&mut self, source: &str) -> PlayerResult<()> {
        self.command(vec![json!("loadfile"), json!(source), json!("replace")])
            .await?;
        Ok(())
    }

    /// Loading is asynchronous in mpv; the `file-loaded` event marks the
    /// point from which seeks are valid.
    async fn wait_for_event(&mut self, event: &str) -> PlayerResult<()> {
        timeout(COMMAND_TIMEOUT, async {
            loop {
                let Some(line) = self.reader.next_line().await? else {
                    return Err(PlayerError::Ipc("mpv closed the IPC socket".to_owned()));
                };
                if let Ok(response) = serde_json::from_str::<Value>(&line) {
                    if response.get("event").and_then(Value::as_str) == Some(event) {
                        return Ok(());
                    }
                }
            }
        })
        .await
        .map_err(|_| PlayerError::Timeout(format!("waiting for {event}")))?
    }
}

impl MediaPlayer for MpvPlayer {
    async fn load(&mut self, request: &LoadRequest) -> PlayerResult<()> {
        if !request.abs_path.is_file() {
            return Err(PlayerError::Rejected(format!(
                "no such file: {}",
                request.abs_path.display()
            )));
        }

        // Loaded paused at the cue's start position; PLAY_AT flips pause off.
        self.set_property("pause", json!(true)).await?;
        let end = match request.end_time_ms {
            Some(end_ms) => json!(format!("{:.3}", end_ms as f64 / 1000.0)),
            None => json!("none"),
        };
        self.set_property("end", end).await?;

        let path = request.abs_path.display().to_string();
        info!("Loading {path}");
        self.load_source(&path).await?;
        self.wait_for_event("file-loaded").await?;

        if request.start_time_ms > 0 {
            self.seek(request.start_time_ms).await?;
        }
        self.set_property("volume", json!(request.volume.min(100)))
            .await?;
        self.set_property("loop-file", json!(if request.looping { "inf" } else { "no" }))
            .await?;
        self.set_property("fullscreen", json!(request.fullscreen))
            .await?;

        Ok(())
    }

    async fn play(&mut self) -> PlayerResult<()> {
        self.set_property("pause", json!(false)).await
    }

    async fn pause(&mut self) -> PlayerResult<()> {
        self.set_property("pause", json!(true)).await
    }

    async fn stop(&mut self) -> PlayerResult<()> {
        self.command(vec![json!("stop")]).await?;
        Ok(())
    }

    async fn seek(&mut self, position_ms: i64) -> PlayerResult<()> {
        self.command(vec![
            json!("seek"),
            json!(position_ms as f64 / 1000.0),
            json!("absolute"),
        ])
        .await?;
        Ok(())
    }

    async fn set_rate(&mut self, rate: f64) -> PlayerResult<()> {
        self.set_property("speed", json!(rate)).await
    }

    async fn set_volume(&mut self, volume: u8) -> PlayerResult<()> {
        self.set_property("volume", json!(volume.min(100))).await
    }

    async fn position_ms(&mut self) -> PlayerResult<Option<i64>> {
        match self.command(vec![json!("get_property"), json!("time-pos")]).await {
            Ok(Value::Number(n)) => Ok(n.as_f64().map(|secs| (secs * 1000.0) as i64)),
            Ok(_) => Ok(None),
            Err(PlayerError::Rejected(e)) => {
                debug!("mpv has no playback position: {e}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn blackout(&mut self) -> PlayerResult<()> {
        self.stop().await?;
        self.set_property("pause", json!(false)).await?;
        if let Err(e) = self.load_source(BLACK_SOURCE).await {
            warn!("Could not load black source, screen stays on idle: {e}");
        }
        Ok(())
    }

    async fn show_testscreen(&mut self, on: bool) -> PlayerResult<()> {
        if on {
            self.set_property("pause", json!(false)).await?;
            self.load_source(TESTSCREEN_SOURCE).await
        } else {
            self.stop().await
        }
    }
}
