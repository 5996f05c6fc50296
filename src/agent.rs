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

//! The agent: one persistent connection to the coordinator, one media
//! player, one clock-offset estimate, one drift loop.

pub mod identity;

use crate::{
    agent::identity::AgentIdentity,
    config::{AgentConfig, Config},
    discovery::browse_coordinators,
    error::AgentResult,
    player::{LoadRequest, MediaPlayer},
    protocol::{
        self, AgentMessage, CoordinatorMessage, DriftReport, ErrorReport, Heartbeat, Hello,
        LoadCue, PlaybackState, Ready, StatusReport, SyncReply,
    },
    show::DropoutPolicy,
    socket::connect_tcp,
    sync::{ClockOffsetState, DriftAction, SyncSample, compute_drift_correction},
    time::{MonotonicAnchor, wall_clock_ms},
};
use serde_json::json;
use std::{collections::HashMap, path::PathBuf, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpStream, tcp::OwnedWriteHalf},
    select,
    sync::mpsc,
    time::{Instant, MissedTickBehavior, interval, sleep, sleep_until},
};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{debug, error, info, instrument, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// What the agent's display layer needs to react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    StateChanged(PlaybackState),
    Testscreen(bool),
}

/// Runs the agent until shutdown: discovers a coordinator (unless one is
/// configured), connects, and reconnects with a small delay after every
/// lost connection.
#[instrument(skip(subsys, config, player, events))]
pub async fn run_agent<P: MediaPlayer>(
    subsys: SubsystemHandle,
    config: Config,
    player: P,
    events: mpsc::Sender<AgentEvent>,
) -> AgentResult<()> {
    let identity_path = config
        .agent
        .identity_path
        .clone()
        .unwrap_or_else(AgentIdentity::default_path);
    let identity = AgentIdentity::load_or_create(&identity_path);
    let mut driver = AgentDriver::new(
        config.agent.clone(),
        identity,
        identity_path,
        player,
        events,
    );

    let (found_tx, mut found_rx) = mpsc::channel(16);
    if config.agent.coordinator_host.is_none() {
        subsys.start(SubsystemBuilder::new("discovery", move |s| async move {
            if let Err(e) = browse_coordinators(s, found_tx).await {
                warn!("Discovery unavailable, configure the coordinator address manually: {e}");
            }
            Ok::<(), crate::error::DiscoveryError>(())
        }));
    }

    let mut last_target: Option<(String, u16)> = None;
    loop {
        let target = match &config.agent.coordinator_host {
            Some(host) => Some((host.clone(), config.agent.coordinator_port)),
            // Reconnects go to the coordinator discovered last; browsing
            // only blocks until the first one shows up.
            None => match last_target.clone() {
                Some(target) => Some(target),
                None => select! {
                    found = found_rx.recv() => found.map(|c| (c.host.to_string(), c.port)),
                    _ = subsys.on_shutdown_requested() => None,
                },
            },
        };
        let Some((host, port)) = target else {
            break;
        };
        last_target = Some((host.clone(), port));

        select! {
            result = async {
                info!("Connecting to coordinator at {host}:{port}");
                let stream = connect_tcp(&host, port, &config.socket).await?;
                driver.run_connection(stream).await
            } => match result {
                Ok(()) => info!("Connection to coordinator closed."),
                Err(e) => warn!("Connection to coordinator failed: {e}"),
            },
            _ = subsys.on_shutdown_requested() => break,
        }

        select! {
            _ = sleep(RECONNECT_DELAY) => (),
            _ = subsys.on_shutdown_requested() => break,
        }
    }

    Ok(())
}

struct PendingPlay {
    deadline: Instant,
    cue_id: String,
    master_start_utc_ms: i64,
    cue_start_time_ms: i64,
}

pub struct AgentDriver<P> {
    config: AgentConfig,
    identity: AgentIdentity,
    identity_path: PathBuf,
    player: P,
    events: mpsc::Sender<AgentEvent>,
    clock: ClockOffsetState,
    state: PlaybackState,
    current_cue: Option<LoadCue>,
    master_start: Option<i64>,
    cue_start_time_ms: i64,
    anchor: Option<MonotonicAnchor>,
    rate: f64,
    volume: u8,
    last_error: Option<String>,
}

impl<P: MediaPlayer> AgentDriver<P> {
    pub fn new(
        config: AgentConfig,
        identity: AgentIdentity,
        identity_path: PathBuf,
        player: P,
        events: mpsc::Sender<AgentEvent>,
    ) -> Self {
        Self {
            config,
            identity,
            identity_path,
            player,
            events,
            clock: ClockOffsetState::new(),
            state: PlaybackState::Idle,
            current_cue: None,
            master_start: None,
            cue_start_time_ms: 0,
            anchor: None,
            rate: 1.0,
            volume: 100,
            last_error: None,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn clock(&self) -> &ClockOffsetState {
        &self.clock
    }

    /// Drives one connection until it is closed, then applies the dropout
    /// policy. The clock offset estimate is kept (frozen) across
    /// connections.
    pub async fn run_connection(&mut self, stream: TcpStream) -> AgentResult<()> {
        let (read_half, mut writer) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        self.send_hello(&mut writer).await;

        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let sync_interval_ms = self.config.sync.correction.sync_interval_ms.max(1);
        let mut drift_tick = interval(Duration::from_millis(sync_interval_ms));
        drift_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending_play: Option<PendingPlay> = None;

        loop {
            let play_deadline = pending_play.as_ref().map(|p| p.deadline);
            select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        self.handle_frame(&mut writer, &mut pending_play, &line).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Read error on coordinator connection: {e}");
                        break;
                    }
                },
                _ = heartbeat.tick() => {
                    send(&mut writer, &AgentMessage::Heartbeat(Heartbeat {
                        local_utc_ms: wall_clock_ms(),
                    }))
                    .await;
                    self.send_status(&mut writer).await;
                },
                _ = sleep_until(play_deadline.unwrap_or_else(far_future)), if play_deadline.is_some() => {
                    if let Some(pending) = pending_play.take() {
                        self.start_playback(&mut writer, pending).await;
                        drift_tick.reset();
                    }
                },
                _ = drift_tick.tick(), if self.state == PlaybackState::Playing => {
                    self.correct_drift(&mut writer).await;
                },
            }
        }

        self.handle_dropout().await;

        Ok(())
    }

    async fn send_hello(&mut self, writer: &mut OwnedWriteHalf) {
        let mut capabilities = HashMap::new();
        capabilities.insert("mpv".to_owned(), json!(true));
        send(
            writer,
            &AgentMessage::Hello(Hello {
                agent_id: self.identity.agent_id.clone(),
                hostname: gethostname::gethostname().to_string_lossy().to_string(),
                platform: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
                capabilities,
                token: self.identity.token.clone(),
            }),
        )
        .await;
    }

    async fn handle_frame(
        &mut self,
        writer: &mut OwnedWriteHalf,
        pending_play: &mut Option<PendingPlay>,
        line: &str,
    ) {
        let envelope = match protocol::decode(line) {
            Ok(it) => it,
            Err(e) => {
                warn!("Dropping frame: {e}");
                return;
            }
        };
        let msg = match CoordinatorMessage::from_envelope(&envelope) {
            Ok(it) => it,
            Err(e) => {
                warn!("Dropping frame: {e}");
                return;
            }
        };
        debug!("Recv: {}", msg.msg_type());

        match msg {
            CoordinatorMessage::HelloAck(ack) => {
                info!("Connected to coordinator session {}", ack.session_id);
            }
            CoordinatorMessage::Accept(accept) => {
                self.identity.token = Some(accept.token);
                if let Err(e) = self.identity.save(&self.identity_path) {
                    warn!("Could not persist trust token: {e}");
                }
                info!("Accepted by coordinator as '{}'", accept.assigned_name);
            }
            CoordinatorMessage::Reject(reject) => {
                warn!("Coordinator rejected this agent: {}", reject.reason);
            }
            CoordinatorMessage::LoadCue(cue) => self.handle_load_cue(writer, cue).await,
            CoordinatorMessage::PlayAt(play_at) => {
                let now_local = wall_clock_ms();
                let master_now = self.clock.master_now_ms(Some(now_local));
                let delay_ms = play_at.master_start_utc_ms - master_now;
                info!("Scheduled play for cue {} in {delay_ms}ms", play_at.cue_id);
                // A new PLAY_AT replaces any still-pending scheduled start.
                *pending_play = Some(PendingPlay {
                    deadline: Instant::now() + Duration::from_millis(delay_ms.max(0) as u64),
                    cue_id: play_at.cue_id,
                    master_start_utc_ms: play_at.master_start_utc_ms,
                    cue_start_time_ms: self
                        .current_cue
                        .as_ref()
                        .map(|c| c.start_time_ms)
                        .unwrap_or(0),
                });
            }
            CoordinatorMessage::Pause => {
                *pending_play = None;
                if let Err(e) = self.player.pause().await {
                    warn!("Could not pause player: {e}");
                }
                self.set_state(PlaybackState::Paused);
            }
            CoordinatorMessage::Stop => {
                *pending_play = None;
                if let Err(e) = self.player.stop().await {
                    warn!("Could not stop player: {e}");
                }
                self.set_state(PlaybackState::Idle);
            }
            CoordinatorMessage::SeekTo(seek) => {
                if let Err(e) = self.player.seek(seek.position_ms).await {
                    warn!("Could not seek: {e}");
                }
            }
            CoordinatorMessage::SetRate(set_rate) => {
                if let Err(e) = self.player.set_rate(set_rate.rate).await {
                    warn!("Could not set rate: {e}");
                } else {
                    self.rate = set_rate.rate;
                }
            }
            CoordinatorMessage::SetVolume(set_volume) => {
                if let Err(e) = self.player.set_volume(set_volume.volume).await {
                    warn!("Could not set volume: {e}");
                } else {
                    self.volume = set_volume.volume;
                }
            }
            CoordinatorMessage::Blackout(blackout) => {
                if blackout.on {
                    *pending_play = None;
                    if let Err(e) = self.player.blackout().await {
                        warn!("Could not black out: {e}");
                    }
                    self.set_state(PlaybackState::Black);
                } else {
                    self.set_state(PlaybackState::Idle);
                }
            }
            CoordinatorMessage::ShowTestscreen(testscreen) => {
                if let Err(e) = self.player.show_testscreen(testscreen.on).await {
                    warn!("Could not switch test screen: {e}");
                }
                self.events.try_send(AgentEvent::Testscreen(testscreen.on)).ok();
            }
            CoordinatorMessage::RequestStatus => self.send_status(writer).await,
            CoordinatorMessage::Sync(probe) => {
                let t2 = wall_clock_ms();
                send(
                    writer,
                    &AgentMessage::SyncReply(SyncReply {
                        t1_utc_ms: probe.t1_utc_ms,
                        t2_client_recv_utc_ms: t2,
                        t3_client_send_utc_ms: t2,
                    }),
                )
                .await;
                // The agent never sees the return leg, so the probe is
                // applied one-way with t4 mirrored from t1.
                self.clock.add_sample(SyncSample {
                    t1: probe.t1_utc_ms,
                    t2,
                    t3: t2,
                    t4: probe.t1_utc_ms,
                });
            }
        }
    }

    async fn handle_load_cue(&mut self, writer: &mut OwnedWriteHalf, cue: LoadCue) {
        self.set_state(PlaybackState::Loading);
        info!("Loading cue {}: {}", cue.cue_id, cue.asset_relpath);

        let request = LoadRequest {
            abs_path: self.config.media_root.join(&cue.asset_relpath),
            start_time_ms: cue.start_time_ms,
            end_time_ms: cue.end_time_ms,
            volume: cue.volume,
            looping: cue.looping,
            fullscreen: true,
            fade_in_ms: cue.fade_in_ms,
            fade_out_ms: cue.fade_out_ms,
        };

        match self.player.load(&request).await {
            Ok(()) => {
                self.volume = cue.volume;
                self.last_error = None;
                self.set_state(PlaybackState::Ready);
                info!("Cue {} ready", cue.cue_id);
                send(
                    writer,
                    &AgentMessage::Ready(Ready {
                        cue_id: cue.cue_id.clone(),
                    }),
                )
                .await;
            }
            Err(e) => {
                let reason = format!("Failed to load {}: {e}", cue.asset_relpath);
                error!("{reason}");
                self.last_error = Some(reason.clone());
                self.set_state(PlaybackState::Error);
                send(
                    writer,
                    &AgentMessage::Error(ErrorReport {
                        cue_id: Some(cue.cue_id.clone()),
                        reason,
                    }),
                )
                .await;
            }
        }

        self.current_cue = Some(cue);
    }

    async fn start_playback(&mut self, writer: &mut OwnedWriteHalf, pending: PendingPlay) {
        match self.player.play().await {
            Ok(()) => {
                self.master_start = Some(pending.master_start_utc_ms);
                self.cue_start_time_ms = pending.cue_start_time_ms;
                // Elapsed playback time is measured against a monotonic
                // anchor so a wall clock step cannot fake drift.
                self.anchor = Some(MonotonicAnchor::now());
                self.set_state(PlaybackState::Playing);
                info!("Playback of cue {} started", pending.cue_id);
            }
            Err(e) => {
                let reason = format!("Could not start playback: {e}");
                error!("{reason}");
                self.last_error = Some(reason.clone());
                self.set_state(PlaybackState::Error);
                send(
                    writer,
                    &AgentMessage::Error(ErrorReport {
                        cue_id: Some(pending.cue_id),
                        reason,
                    }),
                )
                .await;
            }
        }
    }

    async fn correct_drift(&mut self, writer: &mut OwnedWriteHalf) {
        let Some(master_start) = self.master_start else {
            return;
        };
        let Some(local_now) = self.anchor.as_ref().map(MonotonicAnchor::wall_ms) else {
            return;
        };

        let master_now = self.clock.master_now_ms(Some(local_now));
        let elapsed = master_now - master_start;
        let expected_pos = elapsed + self.cue_start_time_ms;

        let actual_pos = match self.player.position_ms().await {
            Ok(Some(pos)) => pos,
            Ok(None) => return,
            Err(e) => {
                warn!("Could not query playback position: {e}");
                return;
            }
        };

        let drift_ms = (actual_pos - expected_pos) as f64;
        let (action, rate) = compute_drift_correction(
            drift_ms,
            self.config.sync.max_drift_ms,
            self.config.sync.correction.hard_seek_threshold_ms,
            self.config.sync.correction.rate_min,
            self.config.sync.correction.rate_max,
        );

        match action {
            DriftAction::RateAdjust => {
                if let Err(e) = self.player.set_rate(rate).await {
                    warn!("Could not adjust rate: {e}");
                } else {
                    self.rate = rate;
                }
            }
            DriftAction::HardSeek => {
                if let Err(e) = self.player.seek(expected_pos.max(0)).await {
                    warn!("Could not hard-seek: {e}");
                }
                if let Err(e) = self.player.set_rate(1.0).await {
                    warn!("Could not reset rate: {e}");
                } else {
                    self.rate = 1.0;
                }
            }
            DriftAction::None => (),
        }

        debug!("Drift: {drift_ms:.1}ms -> action={action} rate={rate:.4}");

        send(
            writer,
            &AgentMessage::Drift(DriftReport {
                offset_ms: self.clock.offset_ms(),
                drift_ms,
                action,
            }),
        )
        .await;
    }

    async fn send_status(&mut self, writer: &mut OwnedWriteHalf) {
        let position_ms = match self.player.position_ms().await {
            Ok(Some(pos)) => pos,
            Ok(None) => 0,
            Err(e) => {
                warn!("Could not query playback position: {e}");
                0
            }
        };
        send(
            writer,
            &AgentMessage::Status(StatusReport {
                state: self.state,
                cue_id: self.current_cue.as_ref().map(|c| c.cue_id.clone()),
                position_ms,
                rate: self.rate,
                volume: self.volume,
                fullscreen: true,
                last_error: self.last_error.clone(),
            }),
        )
        .await;
    }

    async fn handle_dropout(&mut self) {
        warn!(
            "Coordinator connection lost, dropout policy is {:?}",
            self.config.dropout_policy
        );
        match self.config.dropout_policy {
            DropoutPolicy::Continue => (),
            DropoutPolicy::Freeze => {
                if let Err(e) = self.player.pause().await {
                    warn!("Could not freeze playback: {e}");
                }
                self.set_state(PlaybackState::Paused);
            }
            DropoutPolicy::Black => {
                if let Err(e) = self.player.blackout().await {
                    warn!("Could not black out: {e}");
                }
                self.set_state(PlaybackState::Black);
            }
        }
        // The drift loop dies with the connection; the offset estimate
        // stays frozen at its last value.
        self.master_start = None;
        self.anchor = None;
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state != state {
            info!("Playback state: {state}");
        }
        self.state = state;
        self.events.try_send(AgentEvent::StateChanged(state)).ok();
    }
}

async fn send(writer: &mut OwnedWriteHalf, msg: &AgentMessage) {
    let mut frame = msg.to_frame();
    frame.push('\n');
    if let Err(e) = writer.write_all(frame.as_bytes()).await {
        warn!("Send error: {e}");
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        error::{PlayerError, PlayerResult},
        protocol::{Blackout, PlayAt, SyncProbe},
        show::CueKind,
    };
    use std::{
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, Ordering},
        },
        time::Instant as StdInstant,
    };
    use tokio::{
        io::Lines,
        net::{TcpListener, tcp::OwnedReadHalf},
        time::timeout,
    };

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Load(String),
        Play,
        Pause,
        Stop,
        Seek(i64),
        Rate(f64),
        Volume(u8),
        Blackout,
        Testscreen(bool),
    }

    #[derive(Clone, Default)]
    struct FakePlayer {
        ops: Arc<Mutex<Vec<Op>>>,
        play_times: Arc<Mutex<Vec<StdInstant>>>,
        position: Arc<Mutex<Option<i64>>>,
        fail_load: Arc<AtomicBool>,
    }

    impl FakePlayer {
        fn record(&self, op: Op) {
            self.ops.lock().expect("poisoned").push(op);
        }

        fn ops(&self) -> Vec<Op> {
            self.ops.lock().expect("poisoned").clone()
        }

        fn set_position(&self, position: Option<i64>) {
            *self.position.lock().expect("poisoned") = position;
        }
    }

    impl MediaPlayer for FakePlayer {
        async fn load(&mut self, request: &LoadRequest) -> PlayerResult<()> {
            if self.fail_load.load(Ordering::SeqCst) {
                return Err(PlayerError::Rejected("scripted load failure".to_owned()));
            }
            self.record(Op::Load(request.abs_path.display().to_string()));
            Ok(())
        }

        async fn play(&mut self) -> PlayerResult<()> {
            self.play_times.lock().expect("poisoned").push(StdInstant::now());
            self.record(Op::Play);
            Ok(())
        }

        async fn pause(&mut self) -> PlayerResult<()> {
            self.record(Op::Pause);
            Ok(())
        }

        async fn stop(&mut self) -> PlayerResult<()> {
            self.record(Op::Stop);
            Ok(())
        }

        async fn seek(&mut self, position_ms: i64) -> PlayerResult<()> {
            self.record(Op::Seek(position_ms));
            Ok(())
        }

        async fn set_rate(&mut self, rate: f64) -> PlayerResult<()> {
            self.record(Op::Rate(rate));
            Ok(())
        }

        async fn set_volume(&mut self, volume: u8) -> PlayerResult<()> {
            self.record(Op::Volume(volume));
            Ok(())
        }

        async fn position_ms(&mut self) -> PlayerResult<Option<i64>> {
            Ok(*self.position.lock().expect("poisoned"))
        }

        async fn blackout(&mut self) -> PlayerResult<()> {
            self.record(Op::Blackout);
            Ok(())
        }

        async fn show_testscreen(&mut self, on: bool) -> PlayerResult<()> {
            self.record(Op::Testscreen(on));
            Ok(())
        }
    }

    struct TestCoordinator {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl TestCoordinator {
        async fn send(&mut self, msg: &CoordinatorMessage) {
            let mut frame = msg.to_frame();
            frame.push('\n');
            self.writer
                .write_all(frame.as_bytes())
                .await
                .expect("send failed");
        }

        async fn recv_until<F: Fn(&AgentMessage) -> bool>(&mut self, predicate: F) -> AgentMessage {
            let deadline = Duration::from_secs(5);
            timeout(deadline, async {
                loop {
                    let line = self
                        .lines
                        .next_line()
                        .await
                        .expect("read failed")
                        .expect("agent closed the connection");
                    let envelope = protocol::decode(&line).expect("decode failed");
                    let msg =
                        AgentMessage::from_envelope(&envelope).expect("unexpected message type");
                    if predicate(&msg) {
                        return msg;
                    }
                }
            })
            .await
            .expect("expected frame never arrived")
        }
    }

    struct Rig {
        coordinator: TestCoordinator,
        driver_handle: tokio::task::JoinHandle<AgentDriver<FakePlayer>>,
        events: mpsc::Receiver<AgentEvent>,
        player: FakePlayer,
        media_root: PathBuf,
    }

    impl Rig {
        async fn start(config: AgentConfig) -> Self {
            Self::start_with_player(config, FakePlayer::default()).await
        }

        async fn start_with_player(mut config: AgentConfig, player: FakePlayer) -> Self {
            let media_root = std::env::temp_dir().join(format!(
                "cuemesh-agent-test-{}",
                hex::encode(rand::random::<[u8; 8]>())
            ));
            config.media_root = media_root.clone();

            let listener = TcpListener::bind(("127.0.0.1", 0))
                .await
                .expect("bind failed");
            let addr = listener.local_addr().expect("no local addr");
            let (agent_stream, server_side) =
                tokio::join!(TcpStream::connect(addr), listener.accept());
            let agent_stream = agent_stream.expect("connect failed");
            let (server_stream, _) = server_side.expect("accept failed");

            let (events_tx, events) = mpsc::channel(256);
            let identity = AgentIdentity {
                agent_id: "agent-under-test".to_owned(),
                token: None,
            };
            let identity_path = media_root.join("identity.json");
            let mut driver = AgentDriver::new(
                config,
                identity,
                identity_path,
                player.clone(),
                events_tx,
            );
            let driver_handle = tokio::spawn(async move {
                driver.run_connection(agent_stream).await.ok();
                driver
            });

            let (read_half, writer) = server_stream.into_split();
            let mut coordinator = TestCoordinator {
                lines: BufReader::new(read_half).lines(),
                writer,
            };

            let AgentMessage::Hello(hello) = coordinator
                .recv_until(|m| matches!(m, AgentMessage::Hello(_)))
                .await
            else {
                panic!("expected HELLO");
            };
            assert_eq!("agent-under-test", hello.agent_id);

            Self {
                coordinator,
                driver_handle,
                events,
                player,
                media_root,
            }
        }

        async fn wait_for_state(&mut self, state: PlaybackState) {
            timeout(Duration::from_secs(5), async {
                loop {
                    match self.events.recv().await.expect("event channel closed") {
                        AgentEvent::StateChanged(s) if s == state => break,
                        _ => (),
                    }
                }
            })
            .await
            .unwrap_or_else(|_| panic!("agent never reached state {state}"));
        }

        async fn finish(self) -> AgentDriver<FakePlayer> {
            drop(self.coordinator);
            timeout(Duration::from_secs(5), self.driver_handle)
                .await
                .expect("driver did not stop")
                .expect("driver panicked")
        }
    }

    fn load_cue_msg(cue_id: &str, start_time_ms: i64) -> CoordinatorMessage {
        CoordinatorMessage::LoadCue(LoadCue {
            cue_id: cue_id.to_owned(),
            kind: CueKind::Video,
            asset_relpath: format!("{cue_id}.mp4"),
            start_time_ms,
            volume: 90,
            looping: false,
            fade_in_ms: 0,
            fade_out_ms: 0,
            end_time_ms: None,
        })
    }

    /// TCP pair for driving driver methods directly: frames written to the
    /// returned writer come out of the returned line reader.
    async fn frame_pipe() -> (
        OwnedWriteHalf,
        Lines<BufReader<OwnedReadHalf>>,
        (OwnedReadHalf, OwnedWriteHalf),
    ) {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind failed");
        let addr = listener.local_addr().expect("no local addr");
        let (a, b) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let a = a.expect("connect failed");
        let (b, _) = b.expect("accept failed");
        let (read_a, write_a) = a.into_split();
        let (read_b, write_b) = b.into_split();
        (write_a, BufReader::new(read_b).lines(), (read_a, write_b))
    }

    fn bare_driver(player: FakePlayer) -> AgentDriver<FakePlayer> {
        let (events_tx, _events) = mpsc::channel(256);
        AgentDriver::new(
            AgentConfig::default(),
            AgentIdentity {
                agent_id: "agent-under-test".to_owned(),
                token: None,
            },
            std::env::temp_dir().join("cuemesh-agent-test-identity.json"),
            player,
            events_tx,
        )
    }

    async fn recv_drift(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> DriftReport {
        let line = timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("no DRIFT frame")
            .expect("read failed")
            .expect("connection closed");
        let envelope = protocol::decode(&line).expect("decode failed");
        let AgentMessage::Drift(report) =
            AgentMessage::from_envelope(&envelope).expect("unexpected message")
        else {
            panic!("expected DRIFT");
        };
        report
    }

    #[tokio::test]
    async fn heartbeat_carries_status() {
        let mut rig = Rig::start(AgentConfig::default()).await;
        let AgentMessage::Heartbeat(beat) = rig
            .coordinator
            .recv_until(|m| matches!(m, AgentMessage::Heartbeat(_)))
            .await
        else {
            panic!("expected HEARTBEAT");
        };
        assert!(beat.local_utc_ms > 0);
        let AgentMessage::Status(status) = rig
            .coordinator
            .recv_until(|m| matches!(m, AgentMessage::Status(_)))
            .await
        else {
            panic!("expected STATUS");
        };
        assert_eq!(PlaybackState::Idle, status.state);
        rig.finish().await;
    }

    #[tokio::test]
    async fn load_cue_reports_ready() {
        let mut rig = Rig::start(AgentConfig::default()).await;
        rig.coordinator.send(&load_cue_msg("c1", 0)).await;

        let AgentMessage::Ready(ready) = rig
            .coordinator
            .recv_until(|m| matches!(m, AgentMessage::Ready(_)))
            .await
        else {
            panic!("expected READY");
        };
        assert_eq!("c1", ready.cue_id);
        rig.wait_for_state(PlaybackState::Ready).await;

        let expected_path = rig.media_root.join("c1.mp4").display().to_string();
        assert!(rig.player.ops().contains(&Op::Load(expected_path)));
        rig.finish().await;
    }

    #[tokio::test]
    async fn load_failure_reports_error_and_recovers() {
        let player = FakePlayer::default();
        player.fail_load.store(true, Ordering::SeqCst);
        let mut rig = Rig::start_with_player(AgentConfig::default(), player).await;

        rig.coordinator.send(&load_cue_msg("c1", 0)).await;
        let AgentMessage::Error(report) = rig
            .coordinator
            .recv_until(|m| matches!(m, AgentMessage::Error(_)))
            .await
        else {
            panic!("expected ERROR");
        };
        assert_eq!(Some("c1".to_owned()), report.cue_id);
        rig.wait_for_state(PlaybackState::Error).await;

        // A later LOAD_CUE leaves the error state again.
        rig.player.fail_load.store(false, Ordering::SeqCst);
        rig.coordinator.send(&load_cue_msg("c2", 0)).await;
        rig.coordinator
            .recv_until(|m| matches!(m, AgentMessage::Ready(_)))
            .await;
        rig.wait_for_state(PlaybackState::Ready).await;
        rig.finish().await;
    }

    #[tokio::test]
    async fn scheduled_play_waits_for_master_start() {
        let mut rig = Rig::start(AgentConfig::default()).await;
        rig.coordinator.send(&load_cue_msg("c1", 0)).await;
        rig.coordinator
            .recv_until(|m| matches!(m, AgentMessage::Ready(_)))
            .await;

        let sent_at = StdInstant::now();
        rig.coordinator
            .send(&CoordinatorMessage::PlayAt(PlayAt {
                cue_id: "c1".to_owned(),
                master_start_utc_ms: wall_clock_ms() + 300,
            }))
            .await;
        rig.wait_for_state(PlaybackState::Playing).await;

        let play_times = rig.player.play_times.lock().expect("poisoned").clone();
        assert_eq!(1, play_times.len());
        let waited = play_times[0].duration_since(sent_at);
        assert!(
            waited >= Duration::from_millis(250),
            "played after only {waited:?}"
        );
        assert!(waited < Duration::from_millis(1500), "played after {waited:?}");
        rig.finish().await;
    }

    #[tokio::test]
    async fn stop_cancels_pending_scheduled_play() {
        let mut rig = Rig::start(AgentConfig::default()).await;
        rig.coordinator.send(&load_cue_msg("c1", 0)).await;
        rig.coordinator
            .recv_until(|m| matches!(m, AgentMessage::Ready(_)))
            .await;

        rig.coordinator
            .send(&CoordinatorMessage::PlayAt(PlayAt {
                cue_id: "c1".to_owned(),
                master_start_utc_ms: wall_clock_ms() + 500,
            }))
            .await;
        sleep(Duration::from_millis(100)).await;
        rig.coordinator.send(&CoordinatorMessage::Stop).await;
        rig.wait_for_state(PlaybackState::Idle).await;

        sleep(Duration::from_millis(700)).await;
        assert!(rig.player.play_times.lock().expect("poisoned").is_empty());
        let driver = rig.finish().await;
        assert_eq!(PlaybackState::Idle, driver.state());
    }

    #[tokio::test]
    async fn new_play_at_supersedes_pending_one() {
        let mut rig = Rig::start(AgentConfig::default()).await;
        rig.coordinator.send(&load_cue_msg("c1", 0)).await;
        rig.coordinator
            .recv_until(|m| matches!(m, AgentMessage::Ready(_)))
            .await;

        rig.coordinator
            .send(&CoordinatorMessage::PlayAt(PlayAt {
                cue_id: "c1".to_owned(),
                master_start_utc_ms: wall_clock_ms() + 5000,
            }))
            .await;
        rig.coordinator
            .send(&CoordinatorMessage::PlayAt(PlayAt {
                cue_id: "c1".to_owned(),
                master_start_utc_ms: wall_clock_ms() + 150,
            }))
            .await;

        rig.wait_for_state(PlaybackState::Playing).await;
        // Only the superseding schedule fired.
        assert_eq!(1, rig.player.play_times.lock().expect("poisoned").len());
        rig.finish().await;
    }

    #[tokio::test]
    async fn small_drift_triggers_rate_adjust() {
        let (mut writer, mut lines, _keep) = frame_pipe().await;
        let player = FakePlayer::default();
        // 75ms ahead of the expected position.
        player.set_position(Some(12075));
        let mut driver = bare_driver(player.clone());
        driver.state = PlaybackState::Playing;
        driver.master_start = Some(wall_clock_ms() - 12000);
        driver.cue_start_time_ms = 0;
        driver.anchor = Some(MonotonicAnchor::now());

        driver.correct_drift(&mut writer).await;

        let report = recv_drift(&mut lines).await;
        assert_eq!(DriftAction::RateAdjust, report.action);
        assert!(
            (report.drift_ms - 75.0).abs() < 10.0,
            "drift was {}",
            report.drift_ms
        );

        let rate = player
            .ops()
            .iter()
            .filter_map(|op| match op {
                Op::Rate(r) => Some(*r),
                _ => None,
            })
            .next_back()
            .expect("no rate adjustment recorded");
        assert!((rate - 0.99).abs() < 0.002, "rate was {rate}");
        assert_eq!(rate, driver.rate);
    }

    #[tokio::test]
    async fn negative_drift_speeds_playback_up() {
        let (mut writer, mut lines, _keep) = frame_pipe().await;
        let player = FakePlayer::default();
        // 75ms behind the expected position.
        player.set_position(Some(11925));
        let mut driver = bare_driver(player.clone());
        driver.state = PlaybackState::Playing;
        driver.master_start = Some(wall_clock_ms() - 12000);
        driver.cue_start_time_ms = 0;
        driver.anchor = Some(MonotonicAnchor::now());

        driver.correct_drift(&mut writer).await;

        let report = recv_drift(&mut lines).await;
        assert_eq!(DriftAction::RateAdjust, report.action);
        let rate = driver.rate;
        assert!(rate > 1.0 && rate <= 1.02, "rate was {rate}");
    }

    #[tokio::test]
    async fn large_drift_triggers_hard_seek() {
        let (mut writer, mut lines, _keep) = frame_pipe().await;
        let player = FakePlayer::default();
        // 400ms ahead: past the hard seek threshold.
        player.set_position(Some(12400));
        let mut driver = bare_driver(player.clone());
        driver.state = PlaybackState::Playing;
        driver.master_start = Some(wall_clock_ms() - 12000);
        driver.cue_start_time_ms = 0;
        driver.anchor = Some(MonotonicAnchor::now());

        driver.correct_drift(&mut writer).await;

        let report = recv_drift(&mut lines).await;
        assert_eq!(DriftAction::HardSeek, report.action);

        let ops = player.ops();
        let seek_target = ops
            .iter()
            .filter_map(|op| match op {
                Op::Seek(pos) => Some(*pos),
                _ => None,
            })
            .next_back()
            .expect("no seek recorded");
        // Seeks back to the expected position and resets the rate.
        assert!(
            (seek_target - 12000).abs() < 50,
            "seek target was {seek_target}"
        );
        assert!(ops.contains(&Op::Rate(1.0)));
        assert_eq!(1.0, driver.rate);
    }

    #[tokio::test]
    async fn unavailable_position_skips_the_drift_iteration() {
        let (mut writer, mut lines, _keep) = frame_pipe().await;
        let player = FakePlayer::default();
        player.set_position(None);
        let mut driver = bare_driver(player.clone());
        driver.state = PlaybackState::Playing;
        driver.master_start = Some(wall_clock_ms() - 12000);
        driver.anchor = Some(MonotonicAnchor::now());

        driver.correct_drift(&mut writer).await;
        drop(writer);

        // No DRIFT was emitted and no correction was applied.
        let line = timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("read timed out")
            .expect("read failed");
        assert_eq!(None, line);
        assert!(player.ops().is_empty());
    }

    #[tokio::test]
    async fn dropout_freeze_pauses_playback() {
        let config = AgentConfig {
            dropout_policy: DropoutPolicy::Freeze,
            ..Default::default()
        };
        let mut rig = Rig::start(config).await;

        rig.coordinator.send(&load_cue_msg("c1", 0)).await;
        rig.coordinator
            .recv_until(|m| matches!(m, AgentMessage::Ready(_)))
            .await;
        rig.coordinator
            .send(&CoordinatorMessage::PlayAt(PlayAt {
                cue_id: "c1".to_owned(),
                master_start_utc_ms: wall_clock_ms(),
            }))
            .await;
        rig.wait_for_state(PlaybackState::Playing).await;

        let driver = rig.finish().await;
        assert_eq!(PlaybackState::Paused, driver.state());
        assert!(driver.player.ops().contains(&Op::Pause));
    }

    #[tokio::test]
    async fn sync_probe_is_answered_and_sampled() {
        let mut rig = Rig::start(AgentConfig::default()).await;
        let t1 = wall_clock_ms();
        rig.coordinator
            .send(&CoordinatorMessage::Sync(SyncProbe { t1_utc_ms: t1 }))
            .await;

        let AgentMessage::SyncReply(reply) = rig
            .coordinator
            .recv_until(|m| matches!(m, AgentMessage::SyncReply(_)))
            .await
        else {
            panic!("expected SYNC_REPLY");
        };
        assert_eq!(t1, reply.t1_utc_ms);
        assert!(reply.t2_client_recv_utc_ms >= t1);
        assert!(reply.t3_client_send_utc_ms >= reply.t2_client_recv_utc_ms);

        let driver = rig.finish().await;
        assert_eq!(1, driver.clock().sample_count());
    }

    #[tokio::test]
    async fn blackout_toggles_black_state() {
        let mut rig = Rig::start(AgentConfig::default()).await;
        rig.coordinator
            .send(&CoordinatorMessage::Blackout(Blackout { on: true }))
            .await;
        rig.wait_for_state(PlaybackState::Black).await;
        assert!(rig.player.ops().contains(&Op::Blackout));

        rig.coordinator
            .send(&CoordinatorMessage::Blackout(Blackout { on: false }))
            .await;
        rig.wait_for_state(PlaybackState::Idle).await;
        rig.finish().await;
    }

    #[tokio::test]
    async fn accept_persists_token() {
        let mut rig = Rig::start(AgentConfig::default()).await;
        let identity_path = rig.media_root.join("identity.json");
        rig.coordinator
            .send(&CoordinatorMessage::Accept(protocol::Accept {
                token: "tok-42".to_owned(),
                assigned_name: "Stage Left".to_owned(),
            }))
            .await;

        timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(content) = std::fs::read_to_string(&identity_path) {
                    if content.contains("tok-42") {
                        break;
                    }
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("token was never persisted");
        rig.finish().await;
    }
}
