//! Slave driver.
//!
//! The driver owns:
//! - the network [`Endpoint`] talking to the master,
//! - the [`SlaveMachine`] and the effects it asks for,
//! - the replicated scene ([`Session`]) and the [`UpdateSequencer`] feeding it,
//! - a console for master-issued commands and a [`FrameRenderer`].
//!
//! One call to [`ClusterClient::poll`] is one slave tick: drain the network,
//! dispatch every message, apply whatever updates became contiguous, and
//! carry out the resulting effects.

use std::{
    collections::{BTreeMap, VecDeque},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::{Duration, Instant},
};

use anyhow::Context;
use bytes::Bytes;
use cluster_shared::{
    config::{ClusterConfig, EnvironmentConfig, ProjectConfig},
    console::{Console, CvarFlags, CvarValue},
    endpoint::{Endpoint, Incoming},
    error::ProtocolResult,
    message::Timestamp,
    protocol::ClusterMsg,
    render::FrameRenderer,
    session::{ObjectBatch, Session},
    transport::{Transport, UdpTransport},
    updates::{FrameUpdate, Queued, ReadyFrame, UpdateSequencer},
};
use tracing::{debug, info, warn};

use crate::fsm::{RenderState, SetupState, SlaveEffect, SlaveEvent, SlaveMachine, Transition};

/// Counters for one slave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub frames_drawn: u64,
    pub updates_applied: u64,
    pub environment_requests: u64,
    pub resyncs_requested: u64,
    pub rejected_events: u64,
    pub apply_errors: u64,
}

/// One rendering slave.
pub struct ClusterClient<T: Transport> {
    config: ClusterConfig,
    endpoint: Endpoint<T>,
    server: SocketAddr,
    machine: SlaveMachine,
    session: Session,
    sequencer: UpdateSequencer,
    console: Console,
    renderer: Box<dyn FrameRenderer>,
    environment: Option<EnvironmentConfig>,
    project: Option<ProjectConfig>,
    resources: BTreeMap<String, Bytes>,
    output_registered: bool,
    last_environment_request: Option<Instant>,
    /// Set while a resync snapshot is outstanding.
    resync_requested_at: Option<Instant>,
    pending_lag: Option<Duration>,
    frame_timestamp: Timestamp,
    stats: ClientStats,
}

impl ClusterClient<UdpTransport> {
    /// Binds an ephemeral UDP port and targets `config.server_addr`.
    pub async fn connect(config: ClusterConfig, renderer: Box<dyn FrameRenderer>) -> anyhow::Result<Self> {
        let server: SocketAddr = config.server_addr.parse().context("parse server_addr")?;
        let bind_ip = match server.ip() {
            ip if ip.is_loopback() => ip,
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let transport = UdpTransport::bind(SocketAddr::new(bind_ip, 0), config.socket_buffer_bytes)
            .await
            .context("bind client socket")?;
        let client = Self::new(transport, server, config, renderer);
        info!(local = %client.endpoint.local_addr()?, %server, "Slave bound");
        Ok(client)
    }
}

impl<T: Transport> ClusterClient<T> {
    pub fn new(transport: T, server: SocketAddr, config: ClusterConfig, renderer: Box<dyn FrameRenderer>) -> Self {
        let mut console = Console::new();
        Self::register_cvars(&mut console);
        Self {
            endpoint: Endpoint::new(transport, &config),
            sequencer: UpdateSequencer::new(config.max_update_gap),
            config,
            server,
            machine: SlaveMachine::new(),
            session: Session::slave(),
            console,
            renderer,
            environment: None,
            project: None,
            resources: BTreeMap::new(),
            output_registered: false,
            last_environment_request: None,
            resync_requested_at: None,
            pending_lag: None,
            frame_timestamp: Timestamp::ZERO,
            stats: ClientStats::default(),
        }
    }

    fn register_cvars(console: &mut Console) {
        console.register_cvar(
            "r_show_stats",
            CvarValue::Bool(false),
            "Overlay frame statistics",
            CvarFlags::REMOTE,
        );
        console.register_cvar(
            "r_clear_color",
            CvarValue::String("0 0 0".into()),
            "Background color override",
            CvarFlags::REMOTE,
        );
        console.register_cvar(
            "cl_node",
            CvarValue::String(String::new()),
            "Name of this render node",
            CvarFlags::READ_ONLY,
        );
    }

    pub fn machine(&self) -> &SlaveMachine {
        &self.machine
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn environment(&self) -> Option<&EnvironmentConfig> {
        self.environment.as_ref()
    }

    pub fn project(&self) -> Option<&ProjectConfig> {
        self.project.as_ref()
    }

    pub fn resource(&self, name: &str) -> Option<Bytes> {
        self.resources.get(name).cloned()
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn endpoint(&self) -> &Endpoint<T> {
        &self.endpoint
    }

    pub fn renderer(&self) -> &dyn FrameRenderer {
        self.renderer.as_ref()
    }

    /// Master timestamp of the latest accepted `FRAME_START`.
    pub fn frame_timestamp(&self) -> Timestamp {
        self.frame_timestamp
    }

    pub fn last_applied_frame(&self) -> u32 {
        self.sequencer.last_applied()
    }

    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    pub fn is_terminated(&self) -> bool {
        self.machine.is_terminated()
    }

    /// Starts the setup sequence by requesting the environment.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        self.apply(SlaveEvent::Begin).await
    }

    /// Sends an input event to the master.
    pub async fn send_input(&mut self, data: Bytes) -> anyhow::Result<()> {
        self.send(ClusterMsg::Input(data), 0).await
    }

    /// Asks the master for a named resource. It arrives through [`Self::poll`].
    pub async fn request_resource(&mut self, name: &str) -> anyhow::Result<()> {
        self.send(ClusterMsg::RegResource(name.to_string()), 0).await
    }

    /// One slave tick. Returns `false` once terminated.
    pub async fn poll(&mut self) -> anyhow::Result<bool> {
        if self.is_terminated() {
            return Ok(false);
        }

        if self.machine.setup() == SetupState::Initing {
            let due = self
                .last_environment_request
                .map_or(true, |at| at.elapsed() >= self.config.environment_retry());
            if due {
                self.apply(SlaveEvent::RetryTimer).await?;
            }
        }

        for incoming in self.endpoint.poll().await {
            if self.is_terminated() {
                break;
            }
            if incoming.from != self.server {
                warn!(from = %incoming.from, kind = ?incoming.msg.kind(), "Ignoring message from unknown peer");
                continue;
            }
            self.dispatch(incoming).await?;
        }

        if !self.is_terminated() {
            self.apply_ready_updates().await?;
            self.check_resync().await?;
        }

        if let Some(lag) = self.pending_lag.take() {
            warn!(?lag, "Injected lag");
            tokio::time::sleep(lag).await;
        }
        Ok(!self.is_terminated())
    }

    /// Polls until terminated, sleeping `tick` between polls.
    pub async fn run(&mut self, tick: Duration) -> anyhow::Result<()> {
        self.start().await?;
        while self.poll().await? {
            tokio::time::sleep(tick).await;
        }
        info!(frames = self.stats.frames_drawn, "Slave terminated");
        Ok(())
    }

    async fn dispatch(&mut self, incoming: Incoming) -> anyhow::Result<()> {
        let frame = incoming.frame;
        match incoming.msg {
            ClusterMsg::Environment(env) => {
                if self.apply_checked(SlaveEvent::EnvironmentReceived).await? {
                    info!(name = %env.name, displays = env.displays.len(), "Environment received");
                    self.environment = Some(env);
                }
            }
            ClusterMsg::Project(project) => {
                if self.apply_checked(SlaveEvent::ProjectReceived).await? {
                    info!(name = %project.name, "Project received");
                    self.project = Some(project);
                }
            }
            ClusterMsg::SgInit(batch) => self.on_snapshot(frame, &batch).await?,
            ClusterMsg::SgCreate(batch) => {
                if self.machine.has_project() {
                    let records = batch.records.len();
                    match self.sequencer.push_creates(frame, batch) {
                        Queued::Accepted => debug!(frame, records, "Create queued"),
                        other => debug!(frame, ?other, "Create not queued"),
                    }
                }
            }
            ClusterMsg::SgUpdate(update) => self.on_update(update),
            ClusterMsg::FrameStart => {
                if self.apply_checked(SlaveEvent::FrameStart { frame }).await? {
                    self.frame_timestamp = incoming.timestamp;
                    let through = self.sequencer.last_applied();
                    self.apply(SlaveEvent::UpdatesApplied { through }).await?;
                }
            }
            ClusterMsg::Draw => self.apply(SlaveEvent::Draw { frame }).await?,
            ClusterMsg::Command(line) => self.on_command(&line).await?,
            ClusterMsg::RegOutput => {
                debug!("Master registered for console output");
                self.output_registered = true;
            }
            ClusterMsg::Resource { name, data } => {
                debug!(%name, bytes = data.len(), "Resource received");
                self.resources.insert(name, data);
            }
            ClusterMsg::InjectLag { millis } => {
                self.pending_lag = Some(Duration::from_millis(u64::from(millis)));
            }
            ClusterMsg::Shutdown => {
                info!("Shutdown received");
                self.apply(SlaveEvent::Shutdown).await?;
            }
            ClusterMsg::Ack(_) => {}
            other => warn!(kind = ?other.kind(), "Unexpected message for a slave"),
        }
        Ok(())
    }

    async fn on_snapshot(&mut self, frame: u32, batch: &ObjectBatch) -> anyhow::Result<()> {
        let loading = self.machine.setup() == SetupState::GraphLoading;
        if !loading && !self.machine.is_ready() {
            debug!(frame, "Snapshot before project; ignored");
            return Ok(());
        }
        match self.session.apply_snapshot(batch) {
            Ok(report) => info!(frame, objects = report.created + report.applied, "Scene graph applied"),
            Err(e) => {
                self.stats.apply_errors += 1;
                warn!(frame, error = %e, "Snapshot discarded");
                return Ok(());
            }
        }
        self.sequencer.reset(frame);
        self.resync_requested_at = None;
        if loading {
            self.apply(SlaveEvent::GraphReceived).await?;
        }
        Ok(())
    }

    fn on_update(&mut self, update: FrameUpdate) {
        let frame = update.frame;
        match self.sequencer.push(update) {
            Queued::Accepted => {}
            other => debug!(frame, ?other, "Update not queued"),
        }
    }

    /// Applies every frame that continues the chain, then reports progress.
    ///
    /// A frame that fails to apply breaks the chain: `last_applied` stays on
    /// the frame before it and a snapshot is requested.
    async fn apply_ready_updates(&mut self) -> anyhow::Result<()> {
        if !self.machine.is_ready() {
            return Ok(());
        }
        let mut progressed = false;
        while let Some(ready) = self.sequencer.pop_ready() {
            match self.apply_frame(&ready) {
                Ok(dropped) => {
                    progressed = true;
                    self.stats.updates_applied += 1;
                    if dropped > 0 {
                        warn!(frame = ready.frame, dropped, "Updates for unknown objects");
                        self.request_resync().await?;
                    }
                }
                Err(e) => {
                    self.stats.apply_errors += 1;
                    warn!(frame = ready.frame, error = %e, "Update failed");
                    self.sequencer.fail(ready.prev_frame);
                    self.request_resync().await?;
                    break;
                }
            }
        }
        if progressed && matches!(self.machine.render(), RenderState::FrameStarted | RenderState::Updating) {
            let through = self.sequencer.last_applied();
            self.apply(SlaveEvent::UpdatesApplied { through }).await?;
        }
        Ok(())
    }

    /// Creates first, then the update. Returns how many records were dropped.
    fn apply_frame(&mut self, ready: &ReadyFrame) -> ProtocolResult<usize> {
        let mut dropped = 0;
        if !ready.creates.is_empty() {
            let report = self.session.apply_create(&ready.creates)?;
            debug!(frame = ready.frame, created = report.created, "Applied create");
            dropped += report.dropped.len();
        }
        let report = self.session.apply_update(&ready.update)?;
        Ok(dropped + report.dropped.len())
    }

    async fn check_resync(&mut self) -> anyhow::Result<()> {
        if self.machine.is_ready() && self.sequencer.needs_resync() {
            self.request_resync().await?;
        }
        Ok(())
    }

    async fn request_resync(&mut self) -> anyhow::Result<()> {
        let waiting = self
            .resync_requested_at
            .is_some_and(|at| at.elapsed() < self.config.barrier_timeout());
        if waiting {
            return Ok(());
        }
        let last_applied = self.sequencer.last_applied();
        warn!(last_applied, pending = self.sequencer.pending(), "Requesting resync");
        self.stats.resyncs_requested += 1;
        self.resync_requested_at = Some(Instant::now());
        self.send(ClusterMsg::ReqSgUpdate { last_applied }, 0).await
    }

    async fn on_command(&mut self, line: &str) -> anyhow::Result<()> {
        let output = match self.console.exec_remote(line) {
            Ok(lines) => lines,
            Err(e) => vec![format!("Error: {e:#}")],
        };
        debug!(%line, lines = output.len(), "Executed remote command");
        if self.output_registered && !output.is_empty() {
            self.send(ClusterMsg::Print(output.join("\n")), 0).await?;
        }
        Ok(())
    }

    async fn send(&mut self, msg: ClusterMsg, frame: u32) -> anyhow::Result<()> {
        if let Err(e) = self.endpoint.send(self.server, &msg, frame).await {
            warn!(kind = ?msg.kind(), error = %e, "Send to master failed");
        }
        Ok(())
    }

    async fn apply_checked(&mut self, event: SlaveEvent) -> anyhow::Result<bool> {
        let transition = self.machine.handle(event);
        let applied = transition.is_applied();
        if !applied {
            self.stats.rejected_events += 1;
        }
        self.run_effects(transition.effects()).await?;
        Ok(applied)
    }

    async fn apply(&mut self, event: SlaveEvent) -> anyhow::Result<()> {
        self.apply_checked(event).await.map(|_| ())
    }

    /// Carries out effects. Effects that complete locally feed their
    /// follow-up event back into the machine.
    async fn run_effects(&mut self, effects: Vec<SlaveEffect>) -> anyhow::Result<()> {
        let mut queue: VecDeque<SlaveEffect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            let follow_up = match effect {
                SlaveEffect::RequestEnvironment => {
                    self.stats.environment_requests += 1;
                    self.last_environment_request = Some(Instant::now());
                    debug!("Requesting environment");
                    self.send(ClusterMsg::RegUpdates, 0).await?;
                    None
                }
                SlaveEffect::RequestProject => {
                    self.send(ClusterMsg::RegRendering, 0).await?;
                    Some(SlaveEvent::ProjectRequested)
                }
                SlaveEffect::RequestGraph => {
                    let last_applied = self.sequencer.last_applied();
                    self.send(ClusterMsg::ReqSgUpdate { last_applied }, 0).await?;
                    Some(SlaveEvent::GraphRequested)
                }
                SlaveEffect::SendDrawReady { frame } => {
                    self.send(ClusterMsg::DrawReady, frame).await?;
                    None
                }
                SlaveEffect::SendDrawing { frame } => {
                    self.send(ClusterMsg::Drawing, frame).await?;
                    Some(SlaveEvent::DrawStarted)
                }
                SlaveEffect::Render { frame } => {
                    if let Err(e) = self.renderer.draw(frame, &self.session) {
                        warn!(frame, error = %e, "Renderer failed");
                    }
                    Some(SlaveEvent::DrawFinished { frame })
                }
                SlaveEffect::SendDrawDone { frame } => {
                    self.send(ClusterMsg::DrawDone, frame).await?;
                    self.renderer.present(frame);
                    self.stats.frames_drawn += 1;
                    None
                }
                SlaveEffect::Terminate => {
                    info!(frames = self.stats.frames_drawn, "Terminating");
                    None
                }
            };
            if let Some(event) = follow_up {
                match self.machine.handle(event) {
                    Transition::Applied(more) => queue.extend(more),
                    Transition::Rejected(r) => {
                        self.stats.rejected_events += 1;
                        warn!(rejection = %r, "Follow-up event rejected");
                    }
                }
            }
        }
        Ok(())
    }
}
