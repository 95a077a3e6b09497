//! Master driver.
//!
//! The master owns the authoritative scene and paces every slave through
//! each frame in three barriers:
//! - [`ClusterServer::update`]: ship creates and dirty state, start the
//!   frame, wait until every participant reports `DRAW_READY`;
//! - [`ClusterServer::render`]: send `DRAW`, wait for `DRAWING`;
//! - [`ClusterServer::swap`]: wait for `DRAW_DONE`, close the frame.
//!
//! A barrier never waits longer than `barrier_timeout`. Slaves still missing
//! after the grace period are benched for the rest of the frame and reported
//! as [`ServerEvent::ClientStalled`]; they are never disconnected.
//!
//! Between frames the application calls [`ClusterServer::poll`] so that
//! setup requests keep flowing.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

use anyhow::Context;
use bytes::Bytes;
use cluster_shared::{
    config::{ClusterConfig, EnvironmentConfig, ProjectConfig},
    console::{parse_command_line, Console, CvarFlags, CvarValue},
    endpoint::{Endpoint, Incoming},
    message::{MessageType, Timestamp},
    protocol::{Ack, ClusterMsg},
    resources::ResourceStore,
    session::Session,
    transport::{Transport, UdpTransport},
    updates::FrameUpdate,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    connection::{ClientId, ClientInfo, PendingSetup, SlaveConnection},
    fsm::{GlobalEvent, GlobalMachine, GlobalState, Health, LinkEvent, LinkRender, LinkSetup, Rejection, Transition},
};

/// The three frame barriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Update,
    Render,
    Swap,
}

/// How a barrier ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// Every participant arrived.
    Complete,
    /// The barrier timed out; `stalled` sit out the rest of the frame.
    Degraded { stalled: Vec<ClientId> },
    /// The phase did not run, e.g. `update` with no ready slave.
    Skipped(Rejection<GlobalState, GlobalEvent>),
}

impl BarrierOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, BarrierOutcome::Complete)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, BarrierOutcome::Skipped(_))
    }
}

/// Outcomes of one [`ClusterServer::run_frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameReport {
    pub frame: u32,
    pub update: BarrierOutcome,
    pub render: BarrierOutcome,
    pub swap: BarrierOutcome,
}

/// Things the application may want to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ClientConnected { client: ClientId, addr: SocketAddr },
    ClientReady { client: ClientId },
    ClientStalled { client: ClientId, phase: Phase, frame: u32 },
    Input { client: ClientId, data: Bytes },
    Print { client: ClientId, text: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub frames_complete: u64,
    pub frames_degraded: u64,
    pub frames_skipped: u64,
    pub snapshots_sent: u64,
    pub setup_resends: u64,
    pub out_of_frame: u64,
    pub rejected_events: u64,
}

/// The render master.
pub struct ClusterServer<T: Transport> {
    config: ClusterConfig,
    endpoint: Endpoint<T>,
    global: GlobalMachine,
    clients: BTreeMap<SocketAddr, SlaveConnection>,
    next_client_id: u32,
    session: Session,
    resources: ResourceStore,
    environment: Option<EnvironmentConfig>,
    project: Option<ProjectConfig>,
    /// Frame in progress, or the last one run.
    frame: u32,
    last_update_frame: u32,
    frame_degraded: bool,
    events: Vec<ServerEvent>,
    stats: ServerStats,
    pub console: Console,
    console_rx: Option<mpsc::Receiver<String>>,
    quit_requested: bool,
}

impl ClusterServer<UdpTransport> {
    /// Binds `config.server_addr`.
    pub async fn bind(config: ClusterConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = config.server_addr.parse().context("parse server_addr")?;
        let transport = UdpTransport::bind(addr, config.socket_buffer_bytes)
            .await
            .context("bind master socket")?;
        let server = Self::new(transport, config);
        info!(local = %server.local_addr()?, "Master bound");
        Ok(server)
    }
}

impl<T: Transport> ClusterServer<T> {
    pub fn new(transport: T, config: ClusterConfig) -> Self {
        let mut console = Console::new();
        Self::register_cvars(&mut console, &config);
        Self {
            endpoint: Endpoint::new(transport, &config),
            config,
            global: GlobalMachine::new(),
            clients: BTreeMap::new(),
            next_client_id: 1,
            session: Session::master(),
            resources: ResourceStore::new(),
            environment: None,
            project: None,
            frame: 0,
            last_update_frame: 0,
            frame_degraded: false,
            events: Vec::new(),
            stats: ServerStats::default(),
            console,
            console_rx: None,
            quit_requested: false,
        }
    }

    fn register_cvars(console: &mut Console, config: &ClusterConfig) {
        console.register_cvar(
            "sv_barrier_timeout_ms",
            CvarValue::Int(config.barrier_timeout_ms as i64),
            "Longest a frame barrier waits for slaves",
            CvarFlags::MASTER_ONLY,
        );
        console.register_cvar(
            "sv_error_grace_ms",
            CvarValue::Int(config.error_grace_ms as i64),
            "Drain period after a barrier timeout",
            CvarFlags::MASTER_ONLY,
        );
        console.register_cvar(
            "sv_frame",
            CvarValue::Int(0),
            "Last frame started",
            CvarFlags::READ_ONLY,
        );
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    pub fn endpoint(&self) -> &Endpoint<T> {
        &self.endpoint
    }

    pub fn global_state(&self) -> GlobalState {
        self.global.state()
    }

    pub fn health(&self) -> Health {
        self.global.health()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The authoritative scene. Register and mutate objects here between
    /// frames; the next [`Self::update`] ships the changes.
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn resources(&self) -> &ResourceStore {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceStore {
        &mut self.resources
    }

    pub fn environment(&self) -> Option<&EnvironmentConfig> {
        self.environment.as_ref()
    }

    pub fn project(&self) -> Option<&ProjectConfig> {
        self.project.as_ref()
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn last_update_frame(&self) -> u32 {
        self.last_update_frame
    }

    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.clients
            .values()
            .map(|c| c.info(self.endpoint.last_heard(c.addr), self.endpoint.oldest_unacked(c.addr)))
            .collect()
    }

    pub fn client(&self, id: ClientId) -> Option<ClientInfo> {
        self.clients
            .values()
            .find(|c| c.id == id)
            .map(|c| c.info(self.endpoint.last_heard(c.addr), self.endpoint.oldest_unacked(c.addr)))
    }

    pub fn ready_clients(&self) -> usize {
        self.clients.values().filter(|c| c.link.is_ready()).count()
    }

    /// Takes every event raised since the last call.
    pub fn drain_events(&mut self) -> Vec<ServerEvent> {
        std::mem::take(&mut self.events)
    }

    /// Sets the environment and answers slaves that asked for it before it
    /// existed.
    pub async fn set_environment(&mut self, environment: EnvironmentConfig) -> anyhow::Result<()> {
        info!(name = %environment.name, displays = environment.displays.len(), "Environment set");
        self.environment = Some(environment.clone());
        for addr in self.addrs_in(LinkSetup::InitRequested) {
            self.send_setup(addr, ClusterMsg::Environment(environment.clone()), 0).await;
        }
        Ok(())
    }

    /// Sets the project and answers slaves waiting for it.
    pub async fn set_project(&mut self, project: ProjectConfig) -> anyhow::Result<()> {
        info!(name = %project.name, "Project set");
        self.project = Some(project.clone());
        for addr in self.addrs_in(LinkSetup::LoadRequested) {
            self.send_setup(addr, ClusterMsg::Project(project.clone()), 0).await;
        }
        Ok(())
    }

    /// Drains the network and handles everything that arrived.
    pub async fn poll(&mut self) -> anyhow::Result<()> {
        for incoming in self.endpoint.poll().await {
            self.dispatch(incoming).await?;
        }
        self.resend_stale_setup().await;
        Ok(())
    }

    /// Starts `frame`: ships scene changes to every subscribed slave, sends
    /// `FRAME_START` to every ready slave and waits for their `DRAW_READY`.
    pub async fn update(&mut self, frame: u32, timestamp: Timestamp) -> anyhow::Result<BarrierOutcome> {
        self.poll().await?;
        if frame <= self.last_update_frame {
            anyhow::bail!("frame {frame} does not advance past {}", self.last_update_frame);
        }
        if matches!(
            self.global.state(),
            GlobalState::Updating | GlobalState::Rendering | GlobalState::Swapping
        ) {
            warn!(open = self.frame, frame, "Abandoning unfinished frame");
            self.global.handle(GlobalEvent::Abandon);
            self.close_frame();
        }

        let ready_clients = self.ready_clients();
        if let Transition::Rejected(r) = self.global.handle(GlobalEvent::BeginUpdate { ready_clients }) {
            self.stats.frames_skipped += 1;
            debug!(frame, ready_clients, "Update skipped");
            return Ok(BarrierOutcome::Skipped(r));
        }
        self.frame = frame;
        self.frame_degraded = false;
        self.console.set_internal("sv_frame", CvarValue::Int(i64::from(frame)));

        let subscribers: Vec<SocketAddr> = self
            .clients
            .values()
            .filter(|c| c.link.receives_updates())
            .map(|c| c.addr)
            .collect();
        let creates = self.session.pack_create();
        let created = u32::try_from(creates.records.len()).unwrap_or(u32::MAX);
        if !creates.is_empty() {
            debug!(frame, objects = creates.records.len(), "Shipping creates");
            self.broadcast(&subscribers, ClusterMsg::SgCreate(creates), frame, timestamp)
                .await;
        }
        let update = FrameUpdate {
            prev_frame: self.last_update_frame,
            frame,
            creates: created,
            batch: self.session.pack_updates(),
        };
        debug!(
            frame,
            records = update.batch.records.len(),
            tombstones = update.batch.tombstones.len(),
            "Shipping update"
        );
        self.broadcast(&subscribers, ClusterMsg::SgUpdate(update), frame, timestamp)
            .await;
        self.last_update_frame = frame;

        let mut starting = Vec::new();
        for conn in self.clients.values_mut() {
            conn.rendering_enabled = true;
            if conn.link.is_ready() && conn.link.handle(LinkEvent::FrameStarted { frame }).is_applied() {
                starting.push(conn.addr);
            }
        }
        self.broadcast(&starting, ClusterMsg::FrameStart, frame, timestamp).await;

        self.wait_for(Phase::Update, frame).await
    }

    /// Tells every slave that is ready for `frame` to draw it and waits for
    /// their `DRAWING`.
    pub async fn render(&mut self, frame: u32) -> anyhow::Result<BarrierOutcome> {
        self.poll().await?;
        if self.global.state() == GlobalState::Updating && frame != self.frame {
            anyhow::bail!("render({frame}) while frame {} is open", self.frame);
        }
        if let Transition::Rejected(r) = self.global.handle(GlobalEvent::BeginRender) {
            return Ok(BarrierOutcome::Skipped(r));
        }

        let mut drawing = Vec::new();
        for conn in self.clients.values_mut() {
            if conn.rendering_enabled
                && conn.link.update_satisfied(frame)
                && conn.link.handle(LinkEvent::DrawSent { frame }).is_applied()
            {
                drawing.push(conn.addr);
            }
        }
        self.broadcast(&drawing, ClusterMsg::Draw, frame, Timestamp::now()).await;

        self.wait_for(Phase::Render, frame).await
    }

    /// Waits for every drawing slave to finish `frame`, then closes it.
    pub async fn swap(&mut self, frame: u32) -> anyhow::Result<BarrierOutcome> {
        self.poll().await?;
        if self.global.state() == GlobalState::Rendering && frame != self.frame {
            anyhow::bail!("swap({frame}) while frame {} is open", self.frame);
        }
        if let Transition::Rejected(r) = self.global.handle(GlobalEvent::BeginSwap) {
            return Ok(BarrierOutcome::Skipped(r));
        }

        let outcome = self.wait_for(Phase::Swap, frame).await?;
        self.global.handle(GlobalEvent::EndFrame);
        self.close_frame();
        if self.frame_degraded {
            self.stats.frames_degraded += 1;
        } else {
            self.stats.frames_complete += 1;
        }
        Ok(outcome)
    }

    /// `update`, `render` and `swap` in a row. A skipped update skips the
    /// rest.
    pub async fn run_frame(&mut self, frame: u32, timestamp: Timestamp) -> anyhow::Result<FrameReport> {
        let update = self.update(frame, timestamp).await?;
        if let BarrierOutcome::Skipped(r) = &update {
            let skipped = BarrierOutcome::Skipped(r.clone());
            return Ok(FrameReport {
                frame,
                update,
                render: skipped.clone(),
                swap: skipped,
            });
        }
        let render = self.render(frame).await?;
        let swap = self.swap(frame).await?;
        Ok(FrameReport {
            frame,
            update,
            render,
            swap,
        })
    }

    /// Sends a console line to one slave, or all of them. Returns how many
    /// slaves it went to.
    pub async fn send_command(&mut self, target: Option<ClientId>, line: &str) -> anyhow::Result<usize> {
        let targets = self.targets(target);
        self.broadcast(&targets, ClusterMsg::Command(line.to_string()), self.frame, Timestamp::now())
            .await;
        Ok(targets.len())
    }

    /// Asks slaves to send their console output back as `PRINT`.
    pub async fn register_output(&mut self, target: Option<ClientId>) -> anyhow::Result<usize> {
        let targets = self.targets(target);
        for addr in &targets {
            if let Some(conn) = self.clients.get_mut(addr) {
                conn.output_registered = true;
            }
        }
        self.broadcast(&targets, ClusterMsg::RegOutput, 0, Timestamp::now()).await;
        Ok(targets.len())
    }

    /// Makes slaves stall once for `millis`.
    pub async fn inject_lag(&mut self, target: Option<ClientId>, millis: u32) -> anyhow::Result<usize> {
        let targets = self.targets(target);
        warn!(?target, millis, "Injecting lag");
        self.broadcast(&targets, ClusterMsg::InjectLag { millis }, 0, Timestamp::now())
            .await;
        Ok(targets.len())
    }

    /// Sends `SHUTDOWN` to every slave and waits up to `shutdown_timeout` for
    /// the acks. Returns how many slaves acknowledged.
    pub async fn shutdown(&mut self) -> anyhow::Result<usize> {
        let mut sent = Vec::new();
        let addrs: Vec<SocketAddr> = self.clients.keys().copied().collect();
        for addr in addrs {
            match self.endpoint.send(addr, &ClusterMsg::Shutdown, self.frame).await {
                Ok(msg_id) => sent.push((addr, msg_id)),
                Err(e) => warn!(%addr, error = %e, "Shutdown not sent"),
            }
        }
        info!(slaves = sent.len(), "Shutting down");

        let deadline = Instant::now() + self.config.shutdown_timeout();
        loop {
            self.poll().await?;
            let acked = sent
                .iter()
                .filter(|(addr, id)| self.endpoint.is_acked(*addr, *id))
                .count();
            if acked == sent.len() || Instant::now() >= deadline {
                if acked < sent.len() {
                    warn!(acked, expected = sent.len(), "Shutdown not acknowledged by every slave");
                }
                return Ok(acked);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Sets the channel the server reads console lines from.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    pub fn quit_requested(&self) -> bool {
        self.quit_requested
    }

    /// Executes every console line waiting on the input channel and prints
    /// the output.
    pub async fn process_console_commands(&mut self) -> anyhow::Result<()> {
        let lines: Vec<String> = match self.console_rx.as_mut() {
            Some(rx) => {
                let mut collected = Vec::new();
                while let Ok(line) = rx.try_recv() {
                    collected.push(line);
                }
                collected
            }
            None => Vec::new(),
        };
        for line in lines {
            for out in self.exec_console(&line).await? {
                println!("{out}");
            }
        }
        Ok(())
    }

    /// Executes one console line. Master commands come first:
    /// `status`, `cmd [#id] <line>`, `output [#id]`, `lag <#id|all> <ms>`,
    /// `quit`. Anything else goes to the console.
    pub async fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens = parse_command_line(line);
        let Some(head) = tokens.first() else {
            return Ok(Vec::new());
        };

        match head.as_str() {
            "status" => {
                let mut out = vec![format!(
                    "state={:?} health={:?} frame={} last_update={} objects={}",
                    self.global.state(),
                    self.global.health(),
                    self.frame,
                    self.last_update_frame,
                    self.session.len()
                )];
                out.extend(self.clients().iter().map(ToString::to_string));
                Ok(out)
            }
            "cmd" => {
                let (target, rest) = split_target(&tokens[1..]);
                if rest.is_empty() {
                    return Ok(vec!["Usage: cmd [#id] <line>".to_string()]);
                }
                let n = self.send_command(target, &rest.join(" ")).await?;
                Ok(vec![format!("Sent to {n} slave(s)")])
            }
            "output" => {
                let (target, _) = split_target(&tokens[1..]);
                let n = self.register_output(target).await?;
                Ok(vec![format!("Output registered on {n} slave(s)")])
            }
            "lag" => {
                let (target, rest) = split_target(&tokens[1..]);
                let rest = if rest.first().map(String::as_str) == Some("all") {
                    &rest[1..]
                } else {
                    rest
                };
                let Some(millis) = rest.first().and_then(|ms| ms.parse::<u32>().ok()) else {
                    return Ok(vec!["Usage: lag <#id|all> <ms>".to_string()]);
                };
                let n = self.inject_lag(target, millis).await?;
                Ok(vec![format!("Lag of {millis} ms sent to {n} slave(s)")])
            }
            "quit" => {
                self.quit_requested = true;
                Ok(vec!["Shutting down".to_string()])
            }
            _ => {
                let out = self.console.exec(line)?;
                self.sync_cvars();
                Ok(out)
            }
        }
    }

    fn sync_cvars(&mut self) {
        let read = |name: &str| {
            self.console
                .get_cvar(name)
                .and_then(CvarValue::as_int)
                .and_then(|v| u64::try_from(v).ok())
        };
        if let Some(ms) = read("sv_barrier_timeout_ms") {
            self.config.barrier_timeout_ms = ms;
        }
        if let Some(ms) = read("sv_error_grace_ms") {
            self.config.error_grace_ms = ms;
        }
    }

    async fn dispatch(&mut self, incoming: Incoming) -> anyhow::Result<()> {
        let from = incoming.from;
        let frame = incoming.frame;
        let client = self.connection_for(from);

        match incoming.msg {
            ClusterMsg::RegUpdates => {
                if self.link_event(from, LinkEvent::RegUpdates) {
                    match self.environment.clone() {
                        Some(env) => self.send_setup(from, ClusterMsg::Environment(env), 0).await,
                        None => debug!(client_id = %client, "Environment requested before it is set"),
                    }
                }
            }
            ClusterMsg::RegRendering => {
                if self.link_event(from, LinkEvent::RegRendering) {
                    match self.project.clone() {
                        Some(project) => self.send_setup(from, ClusterMsg::Project(project), 0).await,
                        None => debug!(client_id = %client, "Project requested before it is set"),
                    }
                }
            }
            ClusterMsg::ReqSgUpdate { last_applied } => {
                let resync = self.clients.get(&from).is_some_and(|c| c.link.is_ready());
                if self.link_event(from, LinkEvent::ReqGraph) {
                    if resync {
                        info!(client_id = %client, last_applied, at = self.last_update_frame, "Resynchronizing slave");
                        if let Some(conn) = self.clients.get_mut(&from) {
                            conn.resyncs += 1;
                        }
                    }
                    self.send_snapshot(from).await;
                }
            }
            ClusterMsg::Ack(ack) => self.on_ack(from, ack),
            ClusterMsg::DrawReady => self.on_phase_reply(from, LinkEvent::DrawReady { frame }),
            ClusterMsg::Drawing => self.on_phase_reply(from, LinkEvent::Drawing { frame }),
            ClusterMsg::DrawDone => self.on_phase_reply(from, LinkEvent::DrawDone { frame }),
            ClusterMsg::Input(data) => self.events.push(ServerEvent::Input { client, data }),
            ClusterMsg::Print(text) => {
                info!(client_id = %client, "{text}");
                self.events.push(ServerEvent::Print { client, text });
            }
            ClusterMsg::RegResource(name) => match self.resources.get(&name) {
                Some(data) => {
                    debug!(client_id = %client, %name, bytes = data.len(), "Sending resource");
                    self.send_to(from, ClusterMsg::Resource { name, data }, 0).await;
                }
                None => warn!(client_id = %client, %name, "Unknown resource requested"),
            },
            other => warn!(client_id = %client, kind = ?other.kind(), "Unexpected message for the master"),
        }
        Ok(())
    }

    fn connection_for(&mut self, addr: SocketAddr) -> ClientId {
        if let Some(conn) = self.clients.get(&addr) {
            return conn.id;
        }
        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;
        info!(client_id = %id, %addr, "Slave connected");
        self.clients.insert(addr, SlaveConnection::new(id, addr));
        if self.global.state() == GlobalState::Unknown {
            self.global.handle(GlobalEvent::ClientSeen);
        }
        self.events.push(ServerEvent::ClientConnected { client: id, addr });
        id
    }

    /// Feeds one slave's machine. Returns whether the event applied.
    fn link_event(&mut self, addr: SocketAddr, event: LinkEvent) -> bool {
        let Some(conn) = self.clients.get_mut(&addr) else {
            return false;
        };
        match conn.link.handle(event) {
            Transition::Applied => true,
            Transition::OutOfFrame { .. } => {
                self.stats.out_of_frame += 1;
                false
            }
            Transition::Rejected(_) => {
                self.stats.rejected_events += 1;
                false
            }
        }
    }

    fn on_phase_reply(&mut self, from: SocketAddr, event: LinkEvent) {
        if !self.link_event(from, event) {
            return;
        }
        if let Some(conn) = self.clients.get_mut(&from) {
            match event {
                LinkEvent::DrawReady { frame } => conn.acked.draw_ready = frame,
                LinkEvent::Drawing { frame } => conn.acked.drawing = frame,
                LinkEvent::DrawDone { frame } => conn.acked.draw_done = frame,
                _ => {}
            }
        }
    }

    /// Message-level acks of setup messages advance the link's setup state.
    ///
    /// The ack of `DRAW` is only recorded in
    /// [`PhaseFrames::draw_delivered`](crate::connection::PhaseFrames::draw_delivered).
    /// The render barrier waits for `DRAWING`, which a slave sends after
    /// taking `DRAW` and which, unlike the ack, names the frame being drawn.
    fn on_ack(&mut self, from: SocketAddr, ack: Ack) {
        if !ack.is_message_level() {
            return;
        }
        let event = match ack.of {
            MessageType::Environment => LinkEvent::EnvironmentAcked,
            MessageType::Project => LinkEvent::ProjectAcked,
            MessageType::SgInit => LinkEvent::SnapshotAcked,
            MessageType::Draw => {
                if let Some(conn) = self.clients.get_mut(&from) {
                    if matches!(conn.link.render(), LinkRender::DrawSent | LinkRender::Drawing | LinkRender::FrameDone) {
                        conn.acked.draw_delivered = conn.link.frame();
                    }
                }
                return;
            }
            _ => return,
        };
        let Some(conn) = self.clients.get_mut(&from) else {
            return;
        };
        if conn.pending_setup.is_some_and(|p| p.msg_id == ack.msg_id) {
            conn.pending_setup = None;
        }
        let was_ready = conn.link.is_ready();
        let id = conn.id;
        if self.link_event(from, event) && !was_ready && self.clients.get(&from).is_some_and(|c| c.link.is_ready()) {
            info!(client_id = %id, %from, "Slave ready");
            self.events.push(ServerEvent::ClientReady { client: id });
            if self.global.state() == GlobalState::Initing {
                self.global.handle(GlobalEvent::ClientReady);
            }
        }
    }

    /// Participants of `frame` that have not yet reached `phase`.
    fn pending(&self, phase: Phase, frame: u32) -> Vec<SocketAddr> {
        self.clients
            .values()
            .filter(|c| c.rendering_enabled && c.link.frame() == frame && c.link.render() != LinkRender::NotRendering)
            .filter(|c| match phase {
                Phase::Update => !c.link.update_satisfied(frame),
                Phase::Render => !c.link.draw_started(frame),
                Phase::Swap => !c.link.draw_finished(frame),
            })
            .map(|c| c.addr)
            .collect()
    }

    /// Polls until every participant reached `phase` or the barrier times
    /// out.
    async fn wait_for(&mut self, phase: Phase, frame: u32) -> anyhow::Result<BarrierOutcome> {
        let deadline = Instant::now() + self.config.barrier_timeout();
        loop {
            let pending = self.pending(phase, frame);
            if pending.is_empty() {
                return Ok(BarrierOutcome::Complete);
            }
            if Instant::now() >= deadline {
                warn!(?phase, frame, waiting = pending.len(), "Barrier timed out");
                break;
            }
            tokio::task::yield_now().await;
            self.poll().await?;
        }

        self.global.set_health(Health::Error);
        let grace_end = Instant::now() + self.config.error_grace();
        while Instant::now() < grace_end {
            tokio::task::yield_now().await;
            self.poll().await?;
        }

        let mut stalled = Vec::new();
        for addr in self.pending(phase, frame) {
            let Some(conn) = self.clients.get_mut(&addr) else {
                continue;
            };
            conn.link.handle(LinkEvent::Reset);
            conn.rendering_enabled = false;
            conn.stalls += 1;
            warn!(client_id = %conn.id, %addr, ?phase, frame, "Slave stalled the barrier");
            self.events.push(ServerEvent::ClientStalled {
                client: conn.id,
                phase,
                frame,
            });
            stalled.push(conn.id);
        }
        self.global.set_health(Health::AllOk);

        if stalled.is_empty() {
            Ok(BarrierOutcome::Complete)
        } else {
            self.frame_degraded = true;
            Ok(BarrierOutcome::Degraded { stalled })
        }
    }

    fn close_frame(&mut self) {
        for conn in self.clients.values_mut() {
            if conn.link.render() != LinkRender::NotRendering {
                conn.link.handle(LinkEvent::Reset);
            }
            conn.rendering_enabled = true;
        }
    }

    fn addrs_in(&self, setup: LinkSetup) -> Vec<SocketAddr> {
        self.clients
            .values()
            .filter(|c| c.link.setup() == setup)
            .map(|c| c.addr)
            .collect()
    }

    fn targets(&self, target: Option<ClientId>) -> Vec<SocketAddr> {
        self.clients
            .values()
            .filter(|c| target.map_or(true, |id| c.id == id))
            .map(|c| c.addr)
            .collect()
    }

    async fn send_snapshot(&mut self, to: SocketAddr) {
        self.stats.snapshots_sent += 1;
        let batch = self.session.pack_snapshot();
        debug!(%to, objects = batch.records.len(), frame = self.last_update_frame, "Sending snapshot");
        self.send_setup(to, ClusterMsg::SgInit(batch), self.last_update_frame).await;
    }

    /// Sends a setup message and remembers it until the slave acknowledges.
    async fn send_setup(&mut self, to: SocketAddr, msg: ClusterMsg, frame: u32) {
        let kind = msg.kind();
        match self.endpoint.send(to, &msg, frame).await {
            Ok(msg_id) => {
                if let Some(conn) = self.clients.get_mut(&to) {
                    conn.pending_setup = Some(PendingSetup {
                        kind,
                        msg_id,
                        sent_at: Instant::now(),
                    });
                }
            }
            Err(e) => warn!(%to, ?kind, error = %e, "Setup message not sent"),
        }
    }

    /// Re-sends setup messages whose ack has not arrived in time.
    async fn resend_stale_setup(&mut self) {
        let timeout = self.config.barrier_timeout();
        let mut due = Vec::new();
        for conn in self.clients.values_mut() {
            let Some(pending) = conn.pending_setup else {
                continue;
            };
            let awaiting = match pending.kind {
                MessageType::Environment => LinkSetup::InitRequested,
                MessageType::Project => LinkSetup::LoadRequested,
                _ => LinkSetup::GraphRequested,
            };
            if conn.link.setup() != awaiting {
                conn.pending_setup = None;
            } else if pending.sent_at.elapsed() >= timeout {
                due.push((conn.addr, pending.kind));
            }
        }

        for (addr, kind) in due {
            warn!(%addr, ?kind, "Setup message unacknowledged, resending");
            self.stats.setup_resends += 1;
            match kind {
                MessageType::Environment => {
                    if let Some(env) = self.environment.clone() {
                        self.send_setup(addr, ClusterMsg::Environment(env), 0).await;
                    }
                }
                MessageType::Project => {
                    if let Some(project) = self.project.clone() {
                        self.send_setup(addr, ClusterMsg::Project(project), 0).await;
                    }
                }
                _ => self.send_snapshot(addr).await,
            }
        }
    }

    async fn send_to(&mut self, to: SocketAddr, msg: ClusterMsg, frame: u32) {
        if let Err(e) = self.endpoint.send(to, &msg, frame).await {
            warn!(%to, kind = ?msg.kind(), error = %e, "Send failed");
        }
    }

    async fn broadcast(&mut self, targets: &[SocketAddr], msg: ClusterMsg, frame: u32, timestamp: Timestamp) {
        if targets.is_empty() {
            return;
        }
        if let Err(e) = self.endpoint.send_many_stamped(targets, &msg, frame, timestamp).await {
            warn!(kind = ?msg.kind(), frame, error = %e, "Broadcast incomplete");
        }
    }
}

/// Binds a master on an ephemeral loopback port. The returned config points
/// at it, ready to hand to slaves.
pub async fn bind_ephemeral(config: ClusterConfig) -> anyhow::Result<(ClusterServer<UdpTransport>, ClusterConfig)> {
    let cfg = ClusterConfig {
        server_addr: format!("{}:{}", IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        ..config
    };
    let mut server = ClusterServer::bind(cfg).await?;
    let addr = server.local_addr()?;
    server.config.server_addr = addr.to_string();
    let cfg = server.config.clone();
    Ok((server, cfg))
}

/// Splits an optional leading `#id` off console arguments.
fn split_target(args: &[String]) -> (Option<ClientId>, &[String]) {
    match args.first().and_then(|a| a.strip_prefix('#')).and_then(|n| n.parse().ok()) {
        Some(n) => (Some(ClientId(n)), &args[1..]),
        None => (None, args),
    }
}

#[cfg(test)]
mod tests {
    use cluster_shared::{
        objects::Transform,
        session::ObjectBatch,
        transport::{MemoryNetwork, MemoryTransport},
    };

    use super::*;

    /// A master plus a hand-driven slave endpoint.
    struct Rig {
        server: ClusterServer<MemoryTransport>,
        slave: Endpoint<MemoryTransport>,
    }

    impl Rig {
        fn new() -> Self {
            let net = MemoryNetwork::new(11);
            let config = ClusterConfig {
                barrier_timeout_ms: 50,
                error_grace_ms: 10,
                ..ClusterConfig::default()
            };
            let slave = Endpoint::new(net.bind(), &config);
            let server = ClusterServer::new(net.bind(), config);
            Self { server, slave }
        }

        fn master(&self) -> SocketAddr {
            self.server.endpoint().transport().addr()
        }

        fn slave_addr(&self) -> SocketAddr {
            self.slave.transport().addr()
        }

        async fn to_master(&mut self, msg: ClusterMsg, frame: u32) {
            let to = self.master();
            self.slave.send(to, &msg, frame).await.unwrap();
        }

        /// Slave-side view of what the master sent, acks excluded.
        async fn from_master(&mut self) -> Vec<(ClusterMsg, u32)> {
            self.slave
                .poll()
                .await
                .into_iter()
                .filter(|i| !matches!(i.msg, ClusterMsg::Ack(_)))
                .map(|i| (i.msg, i.frame))
                .collect()
        }

        /// Drives the slave side of setup by hand.
        async fn make_ready(&mut self) {
            self.server.set_environment(EnvironmentConfig::default()).await.unwrap();
            self.server.set_project(ProjectConfig::new("demo")).await.unwrap();
            self.to_master(ClusterMsg::RegUpdates, 0).await;
            self.server.poll().await.unwrap();
            self.from_master().await;
            self.server.poll().await.unwrap();
            self.to_master(ClusterMsg::RegRendering, 0).await;
            self.server.poll().await.unwrap();
            self.from_master().await;
            self.to_master(ClusterMsg::ReqSgUpdate { last_applied: 0 }, 0).await;
            self.server.poll().await.unwrap();
            self.from_master().await;
            self.server.poll().await.unwrap();
            assert_eq!(self.server.ready_clients(), 1);
        }
    }

    /// Slave side of a barrier: waits for `expect`, then replies.
    async fn answer(
        slave: &mut Endpoint<MemoryTransport>,
        master: SocketAddr,
        expect: MessageType,
        reply: ClusterMsg,
        frame: u32,
    ) {
        loop {
            if slave.poll().await.iter().any(|i| i.msg.kind() == expect) {
                slave.send(master, &reply, frame).await.unwrap();
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn environment_request_waits_for_environment() {
        let mut rig = Rig::new();
        rig.to_master(ClusterMsg::RegUpdates, 0).await;
        rig.server.poll().await.unwrap();
        assert!(rig.from_master().await.is_empty());
        assert_eq!(rig.server.global_state(), GlobalState::Initing);

        rig.server.set_environment(EnvironmentConfig::default()).await.unwrap();
        let sent = rig.from_master().await;
        assert_eq!(sent, vec![(ClusterMsg::Environment(EnvironmentConfig::default()), 0)]);

        rig.server.poll().await.unwrap();
        let info = rig.server.clients().remove(0);
        assert_eq!(info.setup, LinkSetup::InitDone);
        assert_eq!(
            rig.server.drain_events(),
            vec![ServerEvent::ClientConnected {
                client: ClientId(1),
                addr: rig.slave_addr(),
            }]
        );
    }

    #[tokio::test]
    async fn snapshot_ack_makes_slave_ready() {
        let mut rig = Rig::new();
        rig.make_ready().await;
        assert_eq!(rig.server.global_state(), GlobalState::NotRendering);
        assert!(rig
            .server
            .drain_events()
            .contains(&ServerEvent::ClientReady { client: ClientId(1) }));
    }

    #[tokio::test]
    async fn update_without_ready_slave_is_skipped() {
        let mut rig = Rig::new();
        let outcome = rig.server.update(1, Timestamp::now()).await.unwrap();
        assert!(outcome.is_skipped());
        assert_eq!(rig.server.last_update_frame(), 0);
        assert_eq!(rig.server.stats().frames_skipped, 1);
    }

    #[tokio::test]
    async fn update_ships_creates_update_and_frame_start() {
        let mut rig = Rig::new();
        rig.make_ready().await;
        rig.server.session_mut().insert(Transform::new("root")).unwrap();

        // Nobody answers DRAW_READY, so the barrier times out.
        let outcome = rig.server.update(1, Timestamp::now()).await.unwrap();
        assert_eq!(outcome, BarrierOutcome::Degraded { stalled: vec![ClientId(1)] });
        assert_eq!(rig.server.health(), Health::AllOk);

        let kinds: Vec<_> = rig
            .from_master()
            .await
            .into_iter()
            .map(|(m, f)| (m.kind(), f))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (MessageType::SgCreate, 1),
                (MessageType::SgUpdate, 1),
                (MessageType::FrameStart, 1),
            ]
        );
        assert!(rig
            .server
            .drain_events()
            .contains(&ServerEvent::ClientStalled {
                client: ClientId(1),
                phase: Phase::Update,
                frame: 1,
            }));
    }

    #[tokio::test]
    async fn hand_driven_frame_completes() {
        let mut rig = Rig::new();
        rig.make_ready().await;
        let master = rig.master();
        let Rig { server, slave } = &mut rig;

        let (outcome, ()) = tokio::join!(
            server.update(1, Timestamp::now()),
            answer(slave, master, MessageType::FrameStart, ClusterMsg::DrawReady, 1)
        );
        assert_eq!(outcome.unwrap(), BarrierOutcome::Complete);

        let (outcome, ()) = tokio::join!(
            server.render(1),
            answer(slave, master, MessageType::Draw, ClusterMsg::Drawing, 1)
        );
        assert_eq!(outcome.unwrap(), BarrierOutcome::Complete);

        slave.send(master, &ClusterMsg::DrawDone, 1).await.unwrap();
        assert_eq!(server.swap(1).await.unwrap(), BarrierOutcome::Complete);

        assert_eq!(server.global_state(), GlobalState::NotRendering);
        assert_eq!(server.stats().frames_complete, 1);
        let info = server.clients().remove(0);
        assert_eq!(info.acked.draw_delivered, 1);
        assert_eq!(info.acked.draw_done, 1);
        assert_eq!(info.render, LinkRender::NotRendering);
    }

    #[tokio::test]
    async fn draw_ack_is_recorded_but_drawing_drives_the_barrier() {
        let mut rig = Rig::new();
        rig.make_ready().await;
        let master = rig.master();
        let Rig { server, slave } = &mut rig;
        let (outcome, ()) = tokio::join!(
            server.update(1, Timestamp::now()),
            answer(slave, master, MessageType::FrameStart, ClusterMsg::DrawReady, 1)
        );
        assert!(outcome.unwrap().is_complete());

        // The slave endpoint acks DRAW on receipt but never sends DRAWING.
        let (outcome, ()) = tokio::join!(server.render(1), async {
            while !slave.poll().await.iter().any(|i| i.msg.kind() == MessageType::Draw) {
                tokio::task::yield_now().await;
            }
        });
        assert_eq!(outcome.unwrap(), BarrierOutcome::Degraded { stalled: vec![ClientId(1)] });
        assert_eq!(server.clients()[0].acked.draw_delivered, 1);
        assert_eq!(server.clients()[0].acked.drawing, 0);
    }

    #[tokio::test]
    async fn frames_must_advance() {
        let mut rig = Rig::new();
        rig.make_ready().await;
        rig.server.update(3, Timestamp::now()).await.unwrap();
        assert!(rig.server.update(3, Timestamp::now()).await.is_err());
    }

    #[tokio::test]
    async fn early_reply_does_not_satisfy_the_barrier() {
        let mut rig = Rig::new();
        rig.make_ready().await;
        // Arrives before FRAME_START went out, so it is rejected.
        rig.to_master(ClusterMsg::DrawReady, 1).await;
        let outcome = rig.server.update(1, Timestamp::now()).await.unwrap();
        assert!(matches!(outcome, BarrierOutcome::Degraded { .. }));
        assert_eq!(rig.server.stats().rejected_events, 1);
    }

    #[tokio::test]
    async fn out_of_frame_reply_is_counted_not_fatal() {
        let mut rig = Rig::new();
        rig.make_ready().await;
        let master = rig.master();
        let Rig { server, slave } = &mut rig;
        let (outcome, ()) = tokio::join!(
            server.update(1, Timestamp::now()),
            answer(slave, master, MessageType::FrameStart, ClusterMsg::DrawReady, 9)
        );
        assert!(outcome.unwrap().is_complete());
        assert_eq!(server.stats().out_of_frame, 1);
        assert_eq!(server.ready_clients(), 1);
        assert_eq!(server.clients()[0].render, LinkRender::NotRendering);
    }

    #[tokio::test]
    async fn resync_request_gets_snapshot_at_last_update_frame() {
        let mut rig = Rig::new();
        rig.make_ready().await;
        let master = rig.master();
        {
            let Rig { server, slave } = &mut rig;
            let (outcome, ()) = tokio::join!(
                server.update(1, Timestamp::now()),
                answer(slave, master, MessageType::FrameStart, ClusterMsg::DrawReady, 1)
            );
            assert!(outcome.unwrap().is_complete());
        }
        rig.from_master().await;

        rig.to_master(ClusterMsg::ReqSgUpdate { last_applied: 0 }, 0).await;
        rig.server.poll().await.unwrap();
        let sent = rig.from_master().await;
        assert_eq!(sent, vec![(ClusterMsg::SgInit(ObjectBatch::default()), 1)]);
        assert_eq!(rig.server.clients()[0].resyncs, 1);
    }

    #[tokio::test]
    async fn resources_commands_and_input() {
        let mut rig = Rig::new();
        rig.server.resources_mut().insert("shader", &b"void main() {}"[..]);
        rig.to_master(ClusterMsg::RegResource("shader".into()), 0).await;
        rig.to_master(ClusterMsg::RegResource("missing".into()), 0).await;
        rig.to_master(ClusterMsg::Input(Bytes::from_static(b"key:a")), 0).await;
        rig.server.poll().await.unwrap();
        assert_eq!(
            rig.from_master().await,
            vec![(
                ClusterMsg::Resource {
                    name: "shader".into(),
                    data: Bytes::from_static(b"void main() {}"),
                },
                0
            )]
        );
        assert!(rig.server.drain_events().contains(&ServerEvent::Input {
            client: ClientId(1),
            data: Bytes::from_static(b"key:a"),
        }));

        let out = rig.server.exec_console("cmd #1 r_show_stats 1").await.unwrap();
        assert_eq!(out, vec!["Sent to 1 slave(s)".to_string()]);
        assert_eq!(
            rig.from_master().await,
            vec![(ClusterMsg::Command("r_show_stats 1".into()), 0)]
        );
    }

    #[tokio::test]
    async fn console_cvars_tune_the_barrier() {
        let mut rig = Rig::new();
        rig.server.exec_console("sv_barrier_timeout_ms 75").await.unwrap();
        assert_eq!(rig.server.config().barrier_timeout_ms, 75);
        rig.server.exec_console("quit").await.unwrap();
        assert!(rig.server.quit_requested());
    }

    #[test]
    fn split_target_parses_ids() {
        let args: Vec<String> = ["#2", "echo", "hi"].iter().map(|s| s.to_string()).collect();
        let (target, rest) = split_target(&args);
        assert_eq!(target, Some(ClientId(2)));
        assert_eq!(rest.len(), 2);
        let (target, rest) = split_target(&args[1..]);
        assert_eq!(target, None);
        assert_eq!(rest.len(), 2);
    }
}
