//! Datagram transports.
//!
//! The cluster only needs three things from a transport: send a datagram,
//! drain received datagrams without blocking, and report the local address.
//!
//! - [`UdpTransport`]: the real thing; kernel buffers sized through `socket2`.
//! - [`MemoryNetwork`] / [`MemoryTransport`]: an in-process network with
//!   seeded loss, reordering and link blocking, for tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use socket2::Socket;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Largest datagram a transport will hand back.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// Unreliable datagram channel.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    async fn send_to(&self, datagram: &[u8], to: SocketAddr) -> io::Result<()>;

    /// Returns `Ok(None)` when nothing is waiting.
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;
}

/// UDP socket with enlarged kernel buffers.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds and requests `buffer_bytes` of send and receive buffer.
    pub async fn bind(addr: SocketAddr, buffer_bytes: usize) -> io::Result<Self> {
        let std_socket = std::net::UdpSocket::bind(addr)?;
        let raw = Socket::from(std_socket.try_clone()?);
        // Kernels clamp these silently or refuse; neither is fatal.
        if let Err(e) = raw.set_recv_buffer_size(buffer_bytes) {
            warn!(error = %e, buffer_bytes, "Could not size receive buffer");
        }
        if let Err(e) = raw.set_send_buffer_size(buffer_bytes) {
            warn!(error = %e, buffer_bytes, "Could not size send buffer");
        }
        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket)?;
        debug!(addr = %socket.local_addr()?, "UDP transport bound");
        Ok(Self { socket })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    async fn send_to(&self, datagram: &[u8], to: SocketAddr) -> io::Result<()> {
        self.socket.send_to(datagram, to).await.map(|_| ())
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.try_recv_from(buf) {
            Ok(got) => Ok(Some(got)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Impairments applied by a [`MemoryNetwork`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkConditions {
    /// Probability that a datagram is lost.
    pub loss: f64,
    /// Probability that a datagram jumps ahead of queued ones.
    pub reorder: f64,
}

impl LinkConditions {
    pub const PERFECT: Self = Self {
        loss: 0.0,
        reorder: 0.0,
    };
}

impl Default for LinkConditions {
    fn default() -> Self {
        Self::PERFECT
    }
}

/// Delivery counters for a [`MemoryNetwork`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub delivered: u64,
    pub lost: u64,
    pub blocked: u64,
    pub unroutable: u64,
}

type Datagram = (Vec<u8>, SocketAddr);

struct NetworkState {
    inboxes: HashMap<SocketAddr, VecDeque<Datagram>>,
    blocked: HashSet<(SocketAddr, SocketAddr)>,
    conditions: LinkConditions,
    rng: StdRng,
    next_port: u16,
    stats: NetworkStats,
}

/// In-process datagram network shared by any number of [`MemoryTransport`]s.
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new(0)
    }
}

impl MemoryNetwork {
    /// Perfect network; `seed` drives any impairment added later.
    pub fn new(seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                inboxes: HashMap::new(),
                blocked: HashSet::new(),
                conditions: LinkConditions::PERFECT,
                rng: StdRng::seed_from_u64(seed),
                next_port: 40_000,
                stats: NetworkStats::default(),
            })),
        }
    }

    pub fn with_conditions(seed: u64, conditions: LinkConditions) -> Self {
        let net = Self::new(seed);
        net.set_conditions(conditions);
        net
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_conditions(&self, conditions: LinkConditions) {
        self.state().conditions = conditions;
    }

    /// Attaches a transport at a fresh loopback address.
    pub fn bind(&self) -> MemoryTransport {
        let mut state = self.state();
        let port = state.next_port;
        state.next_port = state.next_port.wrapping_add(1);
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        state.inboxes.insert(addr, VecDeque::new());
        MemoryTransport {
            addr,
            net: self.clone(),
        }
    }

    /// Drops every datagram from `from` to `to` until unblocked.
    pub fn block(&self, from: SocketAddr, to: SocketAddr) {
        self.state().blocked.insert((from, to));
    }

    pub fn unblock(&self, from: SocketAddr, to: SocketAddr) {
        self.state().blocked.remove(&(from, to));
    }

    pub fn stats(&self) -> NetworkStats {
        self.state().stats
    }

    fn deliver(&self, datagram: &[u8], from: SocketAddr, to: SocketAddr) {
        let mut state = self.state();
        let NetworkState {
            inboxes,
            blocked,
            conditions,
            rng,
            stats,
            ..
        } = &mut *state;

        if blocked.contains(&(from, to)) {
            stats.blocked += 1;
            return;
        }
        let Some(inbox) = inboxes.get_mut(&to) else {
            stats.unroutable += 1;
            return;
        };
        if conditions.loss > 0.0 && rng.gen_bool(conditions.loss.min(1.0)) {
            stats.lost += 1;
            return;
        }
        let entry = (datagram.to_vec(), from);
        if conditions.reorder > 0.0 && !inbox.is_empty() && rng.gen_bool(conditions.reorder.min(1.0)) {
            let at = rng.gen_range(0..inbox.len());
            inbox.insert(at, entry);
        } else {
            inbox.push_back(entry);
        }
        stats.delivered += 1;
    }

    fn take(&self, addr: SocketAddr) -> Option<Datagram> {
        self.state().inboxes.get_mut(&addr)?.pop_front()
    }
}

/// One endpoint on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    addr: SocketAddr,
    net: MemoryNetwork,
}

impl MemoryTransport {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }

    async fn send_to(&self, datagram: &[u8], to: SocketAddr) -> io::Result<()> {
        self.net.deliver(datagram, self.addr, to);
        Ok(())
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        Ok(self.net.take(self.addr).map(|(data, from)| {
            // Oversized datagrams truncate, as with a real socket.
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            (n, from)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv(t: &impl Transport) -> Option<(Vec<u8>, SocketAddr)> {
        let mut buf = [0u8; 64];
        t.try_recv_from(&mut buf)
            .unwrap()
            .map(|(n, from)| (buf[..n].to_vec(), from))
    }

    #[tokio::test]
    async fn memory_transport_delivers_in_order() {
        let net = MemoryNetwork::new(1);
        let a = net.bind();
        let b = net.bind();
        a.send_to(b"one", b.addr()).await.unwrap();
        a.send_to(b"two", b.addr()).await.unwrap();
        assert_eq!(recv(&b), Some((b"one".to_vec(), a.addr())));
        assert_eq!(recv(&b), Some((b"two".to_vec(), a.addr())));
        assert_eq!(recv(&b), None);
    }

    #[tokio::test]
    async fn blocked_link_drops_one_direction_only() {
        let net = MemoryNetwork::new(1);
        let a = net.bind();
        let b = net.bind();
        net.block(a.addr(), b.addr());
        a.send_to(b"x", b.addr()).await.unwrap();
        b.send_to(b"y", a.addr()).await.unwrap();
        assert_eq!(recv(&b), None);
        assert!(recv(&a).is_some());
        assert_eq!(net.stats().blocked, 1);

        net.unblock(a.addr(), b.addr());
        a.send_to(b"x", b.addr()).await.unwrap();
        assert!(recv(&b).is_some());
    }

    #[tokio::test]
    async fn total_loss_delivers_nothing() {
        let net = MemoryNetwork::with_conditions(
            7,
            LinkConditions {
                loss: 1.0,
                reorder: 0.0,
            },
        );
        let a = net.bind();
        let b = net.bind();
        for _ in 0..10 {
            a.send_to(b"x", b.addr()).await.unwrap();
        }
        assert_eq!(recv(&b), None);
        assert_eq!(net.stats().lost, 10);
    }

    #[tokio::test]
    async fn unknown_destination_is_silently_dropped() {
        let net = MemoryNetwork::new(1);
        let a = net.bind();
        a.send_to(b"x", "10.0.0.1:9".parse().unwrap()).await.unwrap();
        assert_eq!(net.stats().unroutable, 1);
    }

    #[tokio::test]
    async fn udp_transport_binds_ephemeral_and_loops_back() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), 1 << 20)
            .await
            .unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), 1 << 20)
            .await
            .unwrap();
        assert_ne!(a.local_addr().unwrap().port(), 0);

        a.send_to(b"ping", b.local_addr().unwrap()).await.unwrap();
        let mut got = None;
        for _ in 0..200 {
            if let Some(d) = recv(&b) {
                got = Some(d);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(got.map(|(d, _)| d), Some(b"ping".to_vec()));
    }
}
