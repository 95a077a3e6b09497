//! Harness for the end-to-end tests.
//!
//! Slaves run as tokio tasks on a [`MemoryNetwork`] (or real UDP) while the
//! test drives the master directly. A slave task ends when the slave
//! receives `SHUTDOWN`; joining it hands the slave back for inspection.

use std::{
    collections::BTreeSet,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use cluster_client::ClusterClient;
use cluster_server::ClusterServer;
use cluster_shared::{
    config::{ClusterConfig, EnvironmentConfig, ProjectConfig},
    message::{MessagePart, MessageType},
    render::{DrawnFrame, FrameLog, FrameRenderer},
    session::Session,
    transport::{MemoryNetwork, MemoryTransport, Transport},
};
use tokio::task::JoinHandle;

/// Installs a test-friendly subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Short timers so failure paths finish quickly.
pub fn test_config() -> ClusterConfig {
    ClusterConfig {
        barrier_timeout_ms: 500,
        error_grace_ms: 20,
        environment_retry_ms: 10,
        shutdown_timeout_ms: 500,
        ..ClusterConfig::default()
    }
}

/// A [`FrameLog`] the test can read while the slave task owns the renderer.
#[derive(Debug, Clone, Default)]
pub struct SharedLog(Arc<Mutex<FrameLog>>);

impl SharedLog {
    pub fn frames(&self) -> Vec<DrawnFrame> {
        self.0.lock().map(|log| log.frames().to_vec()).unwrap_or_default()
    }

    pub fn presented(&self) -> Vec<u32> {
        self.0.lock().map(|log| log.presented().to_vec()).unwrap_or_default()
    }
}

impl FrameRenderer for SharedLog {
    fn draw(&mut self, frame: u32, scene: &Session) -> anyhow::Result<()> {
        let mut log = self.0.lock().map_err(|_| anyhow::anyhow!("frame log poisoned"))?;
        log.draw(frame, scene)
    }

    fn present(&mut self, frame: u32) {
        if let Ok(mut log) = self.0.lock() {
            log.present(frame);
        }
    }
}

/// A slave running in its own task.
pub struct Slave<T: Transport + 'static> {
    pub addr: SocketAddr,
    pub log: SharedLog,
    handle: JoinHandle<anyhow::Result<ClusterClient<T>>>,
}

impl<T: Transport + 'static> Slave<T> {
    /// Spawns `client` after sending it resource requests.
    pub fn spawn(mut client: ClusterClient<T>, log: SharedLog, resources: Vec<String>) -> anyhow::Result<Self> {
        let addr = client.endpoint().local_addr()?;
        let handle = tokio::spawn(async move {
            for name in &resources {
                client.request_resource(name).await?;
            }
            client.run(Duration::from_millis(1)).await?;
            Ok(client)
        });
        Ok(Self { addr, log, handle })
    }

    /// Spawns `client`, which sends `input` to the master once it is ready.
    pub fn spawn_with_input(mut client: ClusterClient<T>, log: SharedLog, input: Vec<Bytes>) -> anyhow::Result<Self> {
        let addr = client.endpoint().local_addr()?;
        let handle = tokio::spawn(async move {
            client.start().await?;
            let mut input = input.into_iter();
            while client.poll().await? {
                if client.machine().is_ready() {
                    for data in input.by_ref() {
                        client.send_input(data).await?;
                    }
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            Ok(client)
        });
        Ok(Self { addr, log, handle })
    }

    /// Waits for the slave to terminate and returns it.
    pub async fn join(self) -> anyhow::Result<ClusterClient<T>> {
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .context("slave did not terminate")?
            .context("slave task panicked")?
    }
}

/// Spawns a slave on `net` that talks to `master`.
pub fn spawn_slave(
    net: &MemoryNetwork,
    master: SocketAddr,
    config: ClusterConfig,
) -> anyhow::Result<Slave<MemoryTransport>> {
    spawn_slave_requesting(net, master, config, &[])
}

/// Like [`spawn_slave`], asking for the named resources first.
pub fn spawn_slave_requesting(
    net: &MemoryNetwork,
    master: SocketAddr,
    config: ClusterConfig,
    resources: &[&str],
) -> anyhow::Result<Slave<MemoryTransport>> {
    let log = SharedLog::default();
    let client = ClusterClient::new(net.bind(), master, config, Box::new(log.clone()));
    Slave::spawn(client, log, resources.iter().map(|s| s.to_string()).collect())
}

/// A [`MemoryTransport`] that loses every received message of the chosen
/// types, on top of whatever the network itself does.
#[derive(Clone)]
pub struct DroppingTransport {
    inner: MemoryTransport,
    kinds: Arc<Mutex<BTreeSet<MessageType>>>,
}

impl DroppingTransport {
    pub fn new(inner: MemoryTransport) -> Self {
        Self {
            inner,
            kinds: Arc::default(),
        }
    }

    /// Starts losing incoming messages of `kind`.
    pub fn drop_incoming(&self, kind: MessageType) {
        if let Ok(mut kinds) = self.kinds.lock() {
            kinds.insert(kind);
        }
    }

    fn loses(&self, datagram: &[u8]) -> bool {
        let Ok(part) = MessagePart::decode(datagram) else {
            return false;
        };
        self.kinds.lock().is_ok_and(|kinds| kinds.contains(&part.kind))
    }
}

#[async_trait]
impl Transport for DroppingTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    async fn send_to(&self, datagram: &[u8], to: SocketAddr) -> io::Result<()> {
        self.inner.send_to(datagram, to).await
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        loop {
            match self.inner.try_recv_from(buf)? {
                Some((n, _)) if self.loses(&buf[..n]) => continue,
                other => return Ok(other),
            }
        }
    }
}

/// A master on `net` with a default environment and project already set.
pub async fn memory_master(net: &MemoryNetwork, config: ClusterConfig) -> anyhow::Result<ClusterServer<MemoryTransport>> {
    let mut server = ClusterServer::new(net.bind(), config);
    server.set_environment(EnvironmentConfig::default()).await?;
    server.set_project(ProjectConfig::new("scenario")).await?;
    Ok(server)
}

/// Polls the master until `done` holds or `timeout` passes.
pub async fn poll_until<T, F>(server: &mut ClusterServer<T>, timeout: Duration, mut done: F) -> anyhow::Result<()>
where
    T: Transport,
    F: FnMut(&ClusterServer<T>) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        server.poll().await?;
        if done(server) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            anyhow::bail!("condition not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Polls the master until `n` slaves are ready.
pub async fn wait_ready<T: Transport>(server: &mut ClusterServer<T>, n: usize) -> anyhow::Result<()> {
    poll_until(server, Duration::from_secs(5), |s| s.ready_clients() >= n)
        .await
        .with_context(|| format!("waiting for {n} ready slave(s)"))
}
