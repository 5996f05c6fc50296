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

//! The coordinator: accepts agent connections, manages admission and trust,
//! fans out playback commands, probes agent clocks and aggregates
//! telemetry.

pub mod api;
pub mod logs;
pub mod session;
pub mod trust;

use crate::{
    config::Config,
    coordinator::{
        api::{CoordinatorApi, CoordinatorApiMessage, CoordinatorEvent},
        logs::LogAggregator,
        session::{AgentSession, SessionSnapshot},
        trust::TrustStore,
    },
    error::{CoordinatorError, CoordinatorResult},
    protocol::{
        self, Accept, AgentMessage, CoordinatorMessage, Envelope, Hello, HelloAck, LoadCue,
        PlayAt, PlaybackState, Reject, SeekTo, SetRate, SetVolume, SyncProbe,
    },
    show::Cue,
    socket::{apply_keepalive, init_tcp_listener},
    sync::SyncSample,
    time::wall_clock_ms,
};
use std::{collections::HashMap, net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
    time::{MissedTickBehavior, interval},
};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{info, instrument, warn};

const SYNC_PROBE_INTERVAL: Duration = Duration::from_secs(5);
const OUTBOUND_QUEUE: usize = 64;

/// Starts the coordinator as a subsystem and hands back its API.
#[instrument(skip(subsys, config, events))]
pub async fn start_coordinator(
    subsys: &SubsystemHandle,
    config: Config,
    events: mpsc::Sender<CoordinatorEvent>,
) -> CoordinatorResult<CoordinatorApi> {
    let (server, coordinator_api) = CoordinatorServer::bind(config, events).await?;
    subsys.start(SubsystemBuilder::new("coordinator", move |s| async move {
        select! {
            _ = server.run() => (),
            _ = s.on_shutdown_requested() => (),
        }
        Ok::<(), CoordinatorError>(())
    }));
    Ok(coordinator_api)
}

enum NetEvent {
    Frame { conn_id: u64, envelope: Envelope },
    Closed { conn_id: u64 },
}

pub struct CoordinatorServer {
    config: Config,
    controller_id: String,
    session_id: String,
    listener: TcpListener,
    api_rx: mpsc::Receiver<CoordinatorApiMessage>,
    net_tx: mpsc::Sender<NetEvent>,
    net_rx: mpsc::Receiver<NetEvent>,
    events: mpsc::Sender<CoordinatorEvent>,
    conns: HashMap<u64, mpsc::Sender<String>>,
    conn_sessions: HashMap<u64, String>,
    sessions: HashMap<String, AgentSession>,
    trust: TrustStore,
    logs: LogAggregator,
    next_conn_id: u64,
}

impl CoordinatorServer {
    /// Binds the listening socket and loads the trust store. The server
    /// does nothing until [`run`](Self::run) is awaited.
    pub async fn bind(
        config: Config,
        events: mpsc::Sender<CoordinatorEvent>,
    ) -> CoordinatorResult<(Self, CoordinatorApi)> {
        let controller_id = hex::encode(rand::random::<[u8; 16]>());
        let session_id = hex::encode(rand::random::<[u8; 16]>());

        let listener =
            init_tcp_listener(config.coordinator.bind_address, config.coordinator.port).await?;
        let port = listener.local_addr()?.port();

        let trust_path = config
            .coordinator
            .trust_store_path
            .clone()
            .unwrap_or_else(TrustStore::default_path);
        let trust = TrustStore::load(trust_path);

        let (api_tx, api_rx) = mpsc::channel(1024);
        let (net_tx, net_rx) = mpsc::channel(1024);
        let coordinator_api = CoordinatorApi::new(api_tx, controller_id.clone(), port);

        info!("Coordinator {controller_id} listening on port {port}");

        let server = Self {
            config,
            controller_id,
            session_id,
            listener,
            api_rx,
            net_tx,
            net_rx,
            events,
            conns: HashMap::new(),
            conn_sessions: HashMap::new(),
            sessions: HashMap::new(),
            trust,
            logs: LogAggregator::new(),
            next_conn_id: 0,
        };

        Ok((server, coordinator_api))
    }

    /// Runs until every API handle has been dropped.
    pub async fn run(mut self) {
        let mut sync_timer = interval(SYNC_PROBE_INTERVAL);
        sync_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.spawn_connection(stream, addr),
                    Err(e) => warn!("Could not accept connection: {e}"),
                },
                msg = self.api_rx.recv() => match msg {
                    Some(msg) => self.handle_api(msg).await,
                    None => break,
                },
                Some(event) = self.net_rx.recv() => self.handle_net(event).await,
                _ = sync_timer.tick() => self.sync_probe(),
            }
        }

        info!("Coordinator {} stopped.", self.controller_id);
    }

    fn spawn_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        self.next_conn_id += 1;
        let conn_id = self.next_conn_id;

        if let Err(e) = apply_keepalive(&stream, &self.config.socket) {
            warn!("Could not configure keepalive for {addr}: {e}");
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        self.conns.insert(conn_id, outbound_tx);
        tokio::spawn(connection_task(
            conn_id,
            stream,
            outbound_rx,
            self.net_tx.clone(),
        ));

        info!("Connection {conn_id} opened from {addr}");
    }

    async fn handle_net(&mut self, event: NetEvent) {
        match event {
            NetEvent::Frame { conn_id, envelope } => {
                let msg = match AgentMessage::from_envelope(&envelope) {
                    Ok(it) => it,
                    Err(e) => {
                        warn!("Dropping frame on connection {conn_id}: {e}");
                        return;
                    }
                };
                self.handle_message(conn_id, msg).await;
            }
            NetEvent::Closed { conn_id } => self.handle_closed(conn_id).await,
        }
    }

    async fn handle_message(&mut self, conn_id: u64, msg: AgentMessage) {
        let msg = match msg {
            AgentMessage::Hello(hello) => {
                self.handle_hello(conn_id, hello).await;
                return;
            }
            other => other,
        };

        let Some(agent_id) = self.conn_sessions.get(&conn_id).cloned() else {
            warn!("Dropping message on connection {conn_id} without HELLO");
            return;
        };
        let Some(session) = self.sessions.get_mut(&agent_id) else {
            return;
        };

        // Any inbound traffic counts as liveness.
        session.last_heartbeat = std::time::Instant::now();

        if let AgentMessage::Auth(auth) = &msg {
            if self.trust.token_matches(&agent_id, &auth.token) {
                session.token = Some(auth.token.clone());
                session.status = session::AdmissionStatus::Accepted;
                info!("Agent authenticated via token: {agent_id}");
                let snapshot = session.snapshot();
                self.emit(CoordinatorEvent::SessionChanged(snapshot));
            }
            return;
        }

        if let AgentMessage::Heartbeat(_) = &msg {
            return;
        }

        if !session.is_accepted() {
            warn!("Dropping {} from non-accepted agent {agent_id}", msg.msg_type());
            return;
        }

        match msg {
            AgentMessage::Status(status) => {
                session.state = status.state;
                session.cue_id = status.cue_id;
                session.position_ms = status.position_ms;
                session.rate = status.rate;
                session.volume = status.volume;
                session.last_error = status.last_error;
                let snapshot = session.snapshot();
                self.emit(CoordinatorEvent::SessionChanged(snapshot));
            }
            AgentMessage::Ready(ready) => {
                session.state = PlaybackState::Ready;
                session.cue_id = Some(ready.cue_id.clone());
                self.emit(CoordinatorEvent::Ready {
                    agent_id,
                    cue_id: ready.cue_id,
                });
            }
            AgentMessage::Drift(report) => {
                session.drift_ms = report.drift_ms;
                self.emit(CoordinatorEvent::Drift { agent_id, report });
            }
            AgentMessage::Log(record) => {
                self.logs.add(&agent_id, record.clone());
                self.emit(CoordinatorEvent::Log { agent_id, record });
            }
            AgentMessage::SyncReply(reply) => {
                let t4 = wall_clock_ms();
                session.clock.add_sample(SyncSample {
                    t1: reply.t1_utc_ms,
                    t2: reply.t2_client_recv_utc_ms,
                    t3: reply.t3_client_send_utc_ms,
                    t4,
                });
            }
            AgentMessage::Error(report) => {
                warn!(
                    "Agent {agent_id} reported error on cue {:?}: {}",
                    report.cue_id, report.reason
                );
                session.last_error = Some(report.reason);
                let snapshot = session.snapshot();
                self.emit(CoordinatorEvent::SessionChanged(snapshot));
            }
            AgentMessage::Hello(_) | AgentMessage::Auth(_) | AgentMessage::Heartbeat(_) => (),
        }
    }

    async fn handle_hello(&mut self, conn_id: u64, hello: Hello) {
        let Hello {
            agent_id,
            hostname,
            platform,
            capabilities,
            token,
        } = hello;

        // A reconnect supersedes the previous session: closing its queue
        // closes the old socket before the new session is installed.
        if let Some(old) = self.sessions.remove(&agent_id) {
            info!("Superseding existing session of agent {agent_id}");
            self.conn_sessions.remove(&old.conn_id);
            self.conns.remove(&old.conn_id);
        }

        let Some(outbound) = self.conns.get(&conn_id).cloned() else {
            warn!("HELLO from unknown connection {conn_id}");
            return;
        };

        let mut session = AgentSession::new(
            conn_id,
            outbound,
            agent_id.clone(),
            hostname.clone(),
            platform,
            capabilities,
        );

        session.send(&CoordinatorMessage::HelloAck(HelloAck {
            coordinator_id: self.controller_id.clone(),
            session_id: self.session_id.clone(),
        }));

        match token {
            Some(token) if self.trust.token_matches(&agent_id, &token) => {
                session.token = Some(token);
                session.status = session::AdmissionStatus::Accepted;
                info!("Agent auto-accepted (trusted): {agent_id}");
            }
            _ => info!("Agent pending: {agent_id} ({hostname})"),
        }

        self.conn_sessions.insert(conn_id, agent_id.clone());
        let snapshot = session.snapshot();
        self.sessions.insert(agent_id, session);
        self.emit(CoordinatorEvent::Hello(snapshot));
    }

    async fn handle_closed(&mut self, conn_id: u64) {
        self.conns.remove(&conn_id);
        let Some(agent_id) = self.conn_sessions.remove(&conn_id) else {
            return;
        };
        // The trust entry is retained; only the live session goes away.
        if self
            .sessions
            .get(&agent_id)
            .is_some_and(|s| s.conn_id == conn_id)
        {
            self.sessions.remove(&agent_id);
            info!("Agent disconnected: {agent_id}");
            self.emit(CoordinatorEvent::Disconnected { agent_id });
        }
    }

    async fn handle_api(&mut self, msg: CoordinatorApiMessage) {
        match msg {
            CoordinatorApiMessage::Accept {
                agent_id,
                name,
                result,
            } => {
                result.send(self.accept_agent(&agent_id, name)).ok();
            }
            CoordinatorApiMessage::Reject {
                agent_id,
                reason,
                result,
            } => {
                result.send(self.reject_agent(&agent_id, &reason)).ok();
            }
            CoordinatorApiMessage::LoadCue(cue) => self.send_load_cue(&cue),
            CoordinatorApiMessage::PlayAt {
                cue_id,
                start_lead_ms,
                result,
            } => {
                let master_start = wall_clock_ms() + start_lead_ms;
                self.broadcast(&CoordinatorMessage::PlayAt(PlayAt {
                    cue_id,
                    master_start_utc_ms: master_start,
                }));
                result.send(master_start).ok();
            }
            CoordinatorApiMessage::Pause => self.broadcast(&CoordinatorMessage::Pause),
            CoordinatorApiMessage::Stop => self.broadcast(&CoordinatorMessage::Stop),
            CoordinatorApiMessage::SeekTo(position_ms) => {
                self.broadcast(&CoordinatorMessage::SeekTo(SeekTo { position_ms }));
            }
            CoordinatorApiMessage::SetRate(rate) => {
                self.broadcast(&CoordinatorMessage::SetRate(SetRate { rate }));
            }
            CoordinatorApiMessage::SetVolume(volume) => {
                self.broadcast(&CoordinatorMessage::SetVolume(SetVolume { volume }));
            }
            CoordinatorApiMessage::Blackout(on) => {
                self.broadcast(&CoordinatorMessage::Blackout(protocol::Blackout { on }));
            }
            CoordinatorApiMessage::ShowTestscreen(on) => {
                self.broadcast(&CoordinatorMessage::ShowTestscreen(protocol::ShowTestscreen {
                    on,
                }));
            }
            CoordinatorApiMessage::RequestStatus => {
                self.broadcast(&CoordinatorMessage::RequestStatus);
            }
            CoordinatorApiMessage::Sessions(result) => {
                let snapshots: Vec<SessionSnapshot> =
                    self.sessions.values().map(AgentSession::snapshot).collect();
                result.send(snapshots).ok();
            }
            CoordinatorApiMessage::AgentLogs { agent_id, result } => {
                result.send(self.logs.snapshot(&agent_id)).ok();
            }
            CoordinatorApiMessage::Preflight {
                media_root,
                cue_files,
                result,
            } => {
                result.send(self.preflight(&media_root, &cue_files)).ok();
            }
        }
    }

    fn accept_agent(&mut self, agent_id: &str, name: Option<String>) -> CoordinatorResult<()> {
        let Some(session) = self.sessions.get_mut(agent_id) else {
            return Err(CoordinatorError::NoSuchAgent(agent_id.to_owned()));
        };

        let token = hex::encode(rand::random::<[u8; 16]>());
        session.token = Some(token.clone());
        session.status = session::AdmissionStatus::Accepted;
        if let Some(name) = name {
            session.name = name;
        }

        if let Err(e) = self.trust.insert(agent_id.to_owned(), token.clone()) {
            warn!("Could not persist trust store: {e}");
        }

        let Some(session) = self.sessions.get(agent_id) else {
            return Err(CoordinatorError::NoSuchAgent(agent_id.to_owned()));
        };
        session.send(&CoordinatorMessage::Accept(Accept {
            token,
            assigned_name: session.name.clone(),
        }));
        info!("Accepted agent {agent_id} as '{}'", session.name);
        self.emit(CoordinatorEvent::SessionChanged(session.snapshot()));

        Ok(())
    }

    fn reject_agent(&mut self, agent_id: &str, reason: &str) -> CoordinatorResult<()> {
        let Some(session) = self.sessions.get_mut(agent_id) else {
            return Err(CoordinatorError::NoSuchAgent(agent_id.to_owned()));
        };

        // The connection stays open; the operator may still change their
        // mind.
        session.status = session::AdmissionStatus::Rejected;
        session.send(&CoordinatorMessage::Reject(Reject {
            reason: reason.to_owned(),
        }));
        info!("Rejected agent {agent_id}: {reason}");
        let snapshot = session.snapshot();
        self.emit(CoordinatorEvent::SessionChanged(snapshot));

        Ok(())
    }

    fn send_load_cue(&mut self, cue: &Cue) {
        self.broadcast(&CoordinatorMessage::LoadCue(LoadCue {
            cue_id: cue.id.clone(),
            kind: cue.kind,
            asset_relpath: cue.file.clone(),
            start_time_ms: cue.start_time_ms,
            volume: cue.volume,
            looping: cue.looping,
            fade_in_ms: cue.fade_in_ms,
            fade_out_ms: cue.fade_out_ms,
            end_time_ms: cue.end_time_ms,
        }));
    }

    /// Sends to all accepted sessions; pending and rejected ones are
    /// skipped.
    fn broadcast(&self, msg: &CoordinatorMessage) {
        for session in self.sessions.values().filter(|s| s.is_accepted()) {
            session.send(msg);
        }
    }

    fn sync_probe(&mut self) {
        let t1_utc_ms = wall_clock_ms();
        self.broadcast(&CoordinatorMessage::Sync(SyncProbe { t1_utc_ms }));
    }

    fn preflight(
        &self,
        media_root: &std::path::Path,
        cue_files: &[String],
    ) -> Vec<crate::show::manifest::AgentPreflight> {
        use crate::show::manifest::{AgentPreflight, FileCheck, build_media_manifest};

        let manifest = build_media_manifest(media_root, cue_files);
        self.sessions
            .values()
            .filter(|s| s.is_accepted())
            .map(|session| AgentPreflight {
                agent_id: session.agent_id.clone(),
                // Agent-side hashes require media transfer support; the
                // coordinator-side check alone already catches missing
                // masters.
                files: manifest
                    .iter()
                    .map(|(rel, digest)| FileCheck::new(rel.clone(), digest.clone(), None))
                    .collect(),
            })
            .collect()
    }

    fn emit(&self, event: CoordinatorEvent) {
        if self.events.try_send(event).is_err() {
            warn!("Event channel full or closed, dropping coordinator event");
        }
    }
}

async fn connection_task(
    conn_id: u64,
    stream: TcpStream,
    mut outbound: mpsc::Receiver<String>,
    net_tx: mpsc::Sender<NetEvent>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match protocol::decode(&line) {
                    Ok(envelope) => {
                        net_tx
                            .send(NetEvent::Frame { conn_id, envelope })
                            .await
                            .ok();
                    }
                    Err(e) => warn!("Dropping malformed frame on connection {conn_id}: {e}"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Read error on connection {conn_id}: {e}");
                    break;
                }
            },
            frame = outbound.recv() => match frame {
                Some(mut frame) => {
                    frame.push('\n');
                    if write_half.write_all(frame.as_bytes()).await.is_err() {
                        break;
                    }
                }
                // Queue dropped by the server: session superseded or
                // coordinator shutting down.
                None => break,
            },
        }
    }

    net_tx.send(NetEvent::Closed { conn_id }).await.ok();
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::{AgentMessage, Hello, LogRecord, StatusReport, SyncReply};
    use std::{net::IpAddr, path::PathBuf, time::Duration};
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
        net::tcp::{OwnedReadHalf, OwnedWriteHalf},
        time::timeout,
    };

    fn test_config() -> Config {
        let scratch = std::env::temp_dir().join(format!(
            "cuemesh-coordinator-test-{}",
            hex::encode(rand::random::<[u8; 8]>())
        ));
        Config {
            coordinator: crate::config::CoordinatorConfig {
                bind_address: IpAddr::from([127, 0, 0, 1]),
                port: 0,
                trust_store_path: Some(scratch.join("trusted_agents.json")),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn start_server(
        config: Config,
    ) -> (CoordinatorApi, mpsc::Receiver<CoordinatorEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let (server, coordinator_api) = CoordinatorServer::bind(config, events_tx)
            .await
            .expect("bind failed");
        tokio::spawn(server.run());
        (coordinator_api, events_rx)
    }

    struct TestAgent {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl TestAgent {
        async fn connect(port: u16) -> Self {
            let stream = TcpStream::connect(("127.0.0.1", port))
                .await
                .expect("connect failed");
            let (read_half, writer) = stream.into_split();
            Self {
                lines: BufReader::new(read_half).lines(),
                writer,
            }
        }

        async fn send(&mut self, msg: &AgentMessage) {
            let mut frame = msg.to_frame();
            frame.push('\n');
            self.writer
                .write_all(frame.as_bytes())
                .await
                .expect("send failed");
        }

        async fn send_raw(&mut self, frame: &str) {
            self.writer
                .write_all(format!("{frame}\n").as_bytes())
                .await
                .expect("send failed");
        }

        async fn recv(&mut self) -> CoordinatorMessage {
            let line = timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("recv timed out")
                .expect("read failed")
                .expect("connection closed");
            let envelope = protocol::decode(&line).expect("decode failed");
            CoordinatorMessage::from_envelope(&envelope).expect("unexpected message")
        }

        async fn expect_silence(&mut self, wait: Duration) {
            let result = timeout(wait, self.lines.next_line()).await;
            assert!(result.is_err(), "expected no frame, got {result:?}");
        }

        async fn hello(&mut self, agent_id: &str, token: Option<&str>) {
            self.send(&AgentMessage::Hello(Hello {
                agent_id: agent_id.to_owned(),
                hostname: "displaybox".to_owned(),
                platform: "linux x86_64".to_owned(),
                capabilities: Default::default(),
                token: token.map(ToOwned::to_owned),
            }))
            .await;
            let CoordinatorMessage::HelloAck(_) = self.recv().await else {
                panic!("expected HELLO_ACK");
            };
        }
    }

    async fn session_of(
        coordinator_api: &CoordinatorApi,
        agent_id: &str,
    ) -> Option<SessionSnapshot> {
        coordinator_api
            .sessions()
            .await
            .expect("sessions query failed")
            .into_iter()
            .find(|s| s.agent_id == agent_id)
    }

    async fn wait_for<F: Fn(&SessionSnapshot) -> bool>(
        coordinator_api: &CoordinatorApi,
        agent_id: &str,
        predicate: F,
    ) -> SessionSnapshot {
        for _ in 0..100 {
            if let Some(snapshot) = session_of(coordinator_api, agent_id).await {
                if predicate(&snapshot) {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("session {agent_id} never reached the expected state");
    }

    #[tokio::test]
    async fn hello_creates_pending_session() {
        let (coordinator_api, _events) = start_server(test_config()).await;
        let mut agent = TestAgent::connect(coordinator_api.port()).await;
        agent.hello("A", None).await;

        let snapshot = wait_for(&coordinator_api, "A", |_| true).await;
        assert_eq!(session::AdmissionStatus::Pending, snapshot.status);
        assert_eq!("displaybox", snapshot.hostname);
    }

    #[tokio::test]
    async fn accept_issues_token_and_enables_trusted_reconnect() {
        let (coordinator_api, _events) = start_server(test_config()).await;
        let mut agent = TestAgent::connect(coordinator_api.port()).await;
        agent.hello("A", None).await;
        wait_for(&coordinator_api, "A", |_| true).await;

        coordinator_api
            .accept("A", Some("Stage Left".to_owned()))
            .await
            .expect("accept failed");

        let CoordinatorMessage::Accept(accept) = agent.recv().await else {
            panic!("expected ACCEPT");
        };
        assert_eq!("Stage Left", accept.assigned_name);
        assert!(!accept.token.is_empty());

        let snapshot = wait_for(&coordinator_api, "A", |s| {
            s.status == session::AdmissionStatus::Accepted
        })
        .await;
        assert_eq!("Stage Left", snapshot.name);

        // Reconnect with the issued token: no operator action required.
        let mut reconnected = TestAgent::connect(coordinator_api.port()).await;
        reconnected.hello("A", Some(&accept.token)).await;
        wait_for(&coordinator_api, "A", |s| {
            s.status == session::AdmissionStatus::Accepted
        })
        .await;
    }

    #[tokio::test]
    async fn second_hello_supersedes_prior_session() {
        let (coordinator_api, _events) = start_server(test_config()).await;
        let mut first = TestAgent::connect(coordinator_api.port()).await;
        first.hello("A", None).await;
        wait_for(&coordinator_api, "A", |_| true).await;

        let mut second = TestAgent::connect(coordinator_api.port()).await;
        second.hello("A", None).await;

        // The superseded connection gets closed by the coordinator.
        let closed = timeout(Duration::from_secs(5), first.lines.next_line())
            .await
            .expect("old connection was not closed");
        assert!(matches!(closed, Ok(None) | Err(_)));

        let sessions = coordinator_api.sessions().await.expect("sessions failed");
        assert_eq!(1, sessions.iter().filter(|s| s.agent_id == "A").count());
    }

    #[tokio::test]
    async fn fan_out_reaches_only_accepted_sessions() {
        let (coordinator_api, _events) = start_server(test_config()).await;
        let mut accepted = TestAgent::connect(coordinator_api.port()).await;
        accepted.hello("A", None).await;
        let mut pending = TestAgent::connect(coordinator_api.port()).await;
        pending.hello("B", None).await;
        wait_for(&coordinator_api, "B", |_| true).await;

        coordinator_api.accept("A", None).await.expect("accept failed");
        let CoordinatorMessage::Accept(_) = accepted.recv().await else {
            panic!("expected ACCEPT");
        };

        coordinator_api.send_stop().await;

        assert!(matches!(accepted.recv().await, CoordinatorMessage::Stop));
        pending.expect_silence(Duration::from_millis(300)).await;
    }

    #[tokio::test]
    async fn play_at_returns_broadcast_master_start() {
        let (coordinator_api, _events) = start_server(test_config()).await;
        let mut agent = TestAgent::connect(coordinator_api.port()).await;
        agent.hello("A", None).await;
        wait_for(&coordinator_api, "A", |_| true).await;
        coordinator_api.accept("A", None).await.expect("accept failed");
        let CoordinatorMessage::Accept(_) = agent.recv().await else {
            panic!("expected ACCEPT");
        };

        let before = wall_clock_ms();
        let master_start = coordinator_api
            .send_play_at("c1", 250)
            .await
            .expect("play_at failed");
        let after = wall_clock_ms();
        assert!(master_start >= before + 250);
        assert!(master_start <= after + 250);

        let CoordinatorMessage::PlayAt(play_at) = agent.recv().await else {
            panic!("expected PLAY_AT");
        };
        assert_eq!("c1", play_at.cue_id);
        assert_eq!(master_start, play_at.master_start_utc_ms);
    }

    #[tokio::test]
    async fn go_cue_loads_before_scheduling_the_start() {
        let (coordinator_api, _events) = start_server(test_config()).await;
        let mut agent = TestAgent::connect(coordinator_api.port()).await;
        agent.hello("A", None).await;
        wait_for(&coordinator_api, "A", |_| true).await;
        coordinator_api.accept("A", None).await.expect("accept failed");
        let CoordinatorMessage::Accept(_) = agent.recv().await else {
            panic!("expected ACCEPT");
        };

        let cue = Cue {
            id: "c1".to_owned(),
            file: "intro.mp4".to_owned(),
            ..Cue::default()
        };
        let master_start = coordinator_api
            .go_cue(&cue, 100)
            .await
            .expect("go_cue failed");

        let CoordinatorMessage::LoadCue(load) = agent.recv().await else {
            panic!("expected LOAD_CUE");
        };
        assert_eq!("c1", load.cue_id);
        assert_eq!("intro.mp4", load.asset_relpath);

        let CoordinatorMessage::PlayAt(play_at) = agent.recv().await else {
            panic!("expected PLAY_AT");
        };
        assert_eq!(master_start, play_at.master_start_utc_ms);
    }

    #[tokio::test]
    async fn sync_replies_update_session_offset() {
        let (coordinator_api, _events) = start_server(test_config()).await;
        let mut agent = TestAgent::connect(coordinator_api.port()).await;
        agent.hello("A", None).await;
        wait_for(&coordinator_api, "A", |_| true).await;
        coordinator_api.accept("A", None).await.expect("accept failed");
        let CoordinatorMessage::Accept(_) = agent.recv().await else {
            panic!("expected ACCEPT");
        };

        // Agent clock pretends to run one second ahead of the coordinator.
        for _ in 0..8 {
            let t1 = wall_clock_ms();
            agent
                .send(&AgentMessage::SyncReply(SyncReply {
                    t1_utc_ms: t1,
                    t2_client_recv_utc_ms: t1 + 1003,
                    t3_client_send_utc_ms: t1 + 1004,
                }))
                .await;
        }

        let snapshot = wait_for(&coordinator_api, "A", |s| s.sample_count == 8).await;
        assert!(
            (snapshot.offset_ms - 1000.0).abs() < 50.0,
            "offset was {}",
            snapshot.offset_ms
        );
    }

    #[tokio::test]
    async fn telemetry_from_non_accepted_sessions_is_dropped() {
        let (coordinator_api, _events) = start_server(test_config()).await;
        let mut pending = TestAgent::connect(coordinator_api.port()).await;
        pending.hello("B", None).await;
        wait_for(&coordinator_api, "B", |_| true).await;

        pending
            .send(&AgentMessage::Status(StatusReport {
                state: PlaybackState::Playing,
                cue_id: Some("c9".to_owned()),
                position_ms: 1234,
                rate: 1.0,
                volume: 100,
                fullscreen: true,
                last_error: None,
            }))
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = session_of(&coordinator_api, "B").await.expect("no session");
        assert_eq!(PlaybackState::Idle, snapshot.state);
        assert_eq!(0, snapshot.position_ms);
    }

    #[tokio::test]
    async fn malformed_frames_keep_the_connection_alive() {
        let (coordinator_api, _events) = start_server(test_config()).await;
        let mut agent = TestAgent::connect(coordinator_api.port()).await;
        agent.send_raw("this is not json").await;
        agent.send_raw(r#"{"payload":{}}"#).await;
        agent.hello("A", None).await;
        wait_for(&coordinator_api, "A", |_| true).await;
    }

    #[tokio::test]
    async fn logs_are_aggregated_per_agent() {
        let (coordinator_api, mut events) = start_server(test_config()).await;
        let mut agent = TestAgent::connect(coordinator_api.port()).await;
        agent.hello("A", None).await;
        wait_for(&coordinator_api, "A", |_| true).await;
        coordinator_api.accept("A", None).await.expect("accept failed");
        let CoordinatorMessage::Accept(_) = agent.recv().await else {
            panic!("expected ACCEPT");
        };

        agent
            .send(&AgentMessage::Log(LogRecord {
                level: "warning".to_owned(),
                message: "playback stutter".to_owned(),
                ts_utc_ms: wall_clock_ms(),
            }))
            .await;

        let records = loop {
            let records = coordinator_api.agent_logs("A").await.expect("logs failed");
            if !records.is_empty() {
                break records;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert_eq!("playback stutter", records[0].message);

        let mut saw_log_event = false;
        while let Ok(Some(event)) =
            timeout(Duration::from_millis(200), events.recv()).await
        {
            if matches!(event, CoordinatorEvent::Log { .. }) {
                saw_log_event = true;
                break;
            }
        }
        assert!(saw_log_event);
    }

    #[tokio::test]
    async fn disconnect_evicts_session_but_keeps_trust() {
        let config = test_config();
        let trust_path = config
            .coordinator
            .trust_store_path
            .clone()
            .expect("no trust path");
        let (coordinator_api, _events) = start_server(config).await;
        {
            let mut agent = TestAgent::connect(coordinator_api.port()).await;
            agent.hello("A", None).await;
            wait_for(&coordinator_api, "A", |_| true).await;
            coordinator_api.accept("A", None).await.expect("accept failed");
            let CoordinatorMessage::Accept(_) = agent.recv().await else {
                panic!("expected ACCEPT");
            };
        }

        for _ in 0..100 {
            if session_of(&coordinator_api, "A").await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(session_of(&coordinator_api, "A").await.is_none());
        assert!(TrustStore::load(trust_path).len() == 1);
    }

    #[tokio::test]
    async fn preflight_reports_missing_masters() {
        let media_root = std::env::temp_dir().join(format!(
            "cuemesh-preflight-{}",
            hex::encode(rand::random::<[u8; 8]>())
        ));
        std::fs::create_dir_all(&media_root).expect("mkdir failed");
        std::fs::write(media_root.join("intro.mp4"), b"fake video").expect("write failed");

        let (coordinator_api, _events) = start_server(test_config()).await;
        let mut agent = TestAgent::connect(coordinator_api.port()).await;
        agent.hello("A", None).await;
        wait_for(&coordinator_api, "A", |_| true).await;
        coordinator_api.accept("A", None).await.expect("accept failed");
        let CoordinatorMessage::Accept(_) = agent.recv().await else {
            panic!("expected ACCEPT");
        };

        let results = coordinator_api
            .preflight(
                PathBuf::from(&media_root),
                vec!["intro.mp4".to_owned(), "missing.mp4".to_owned()],
            )
            .await
            .expect("preflight failed");
        assert_eq!(1, results.len());
        assert_eq!("A", results[0].agent_id);
        let intro = results[0]
            .files
            .iter()
            .find(|f| f.rel_path == "intro.mp4")
            .expect("no intro check");
        assert!(intro.coordinator_hash.is_some());
        let missing = results[0]
            .files
            .iter()
            .find(|f| f.rel_path == "missing.mp4")
            .expect("no missing check");
        assert!(missing.coordinator_hash.is_none());
    }
}
