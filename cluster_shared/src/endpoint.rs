//! Message endpoint.
//!
//! Glue between a [`Transport`] and typed [`ClusterMsg`]s:
//! - outgoing: encode, fragment, send every part;
//! - incoming: drain datagrams, acknowledge every part, reassemble per peer,
//!   decode;
//! - acknowledgement bookkeeping for message types that need a message-level
//!   ack, plus when each peer was last heard from.
//!
//! Errors local to one datagram or message are logged and counted, never
//! returned: a bad packet must not take the loop down.

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use anyhow::Context;
use tracing::{debug, trace, warn};

use crate::{
    config::ClusterConfig,
    message::{MessageFactory, MessagePart, MessageType, Timestamp},
    protocol::{Ack, ClusterMsg},
    reassembly::Reassembler,
    transport::{Transport, MAX_DATAGRAM},
};

/// Upper bound on datagrams handled by one [`Endpoint::poll`].
const MAX_DATAGRAMS_PER_POLL: usize = 4096;

/// A decoded message and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    pub from: SocketAddr,
    pub id: u64,
    pub frame: u32,
    pub timestamp: Timestamp,
    pub msg: ClusterMsg,
}

/// Counters kept by an [`Endpoint`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub messages_sent: u64,
    pub parts_sent: u64,
    pub messages_received: u64,
    pub parts_received: u64,
    pub part_acks_received: u64,
    pub message_acks_received: u64,
    pub decode_errors: u64,
    pub send_errors: u64,
    /// Messages forgotten after waiting `ack_timeout` for their ack.
    pub acks_expired: u64,
}

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    kind: MessageType,
    sent_at: Instant,
}

/// Sends and receives cluster messages over one transport.
pub struct Endpoint<T: Transport> {
    transport: T,
    factory: MessageFactory,
    partial_timeout: Duration,
    ack_timeout: Duration,
    reassemblers: HashMap<SocketAddr, Reassembler>,
    /// Sent messages still waiting for their message-level ack.
    outstanding: HashMap<(SocketAddr, u64), Outstanding>,
    last_heard: HashMap<SocketAddr, Instant>,
    stats: LinkStats,
    recv_buf: Vec<u8>,
}

impl<T: Transport> Endpoint<T> {
    pub fn new(transport: T, config: &ClusterConfig) -> Self {
        Self {
            transport,
            factory: MessageFactory::for_mtu(config.link_mtu),
            partial_timeout: config.partial_timeout(),
            // Shutdown waits on the book, so entries outlive that wait.
            ack_timeout: config.ack_timeout().max(config.shutdown_timeout()),
            reassemblers: HashMap::new(),
            outstanding: HashMap::new(),
            last_heard: HashMap::new(),
            stats: LinkStats::default(),
            recv_buf: vec![0; MAX_DATAGRAM],
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.transport.local_addr().context("transport local addr")
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn last_heard(&self, peer: SocketAddr) -> Option<Instant> {
        self.last_heard.get(&peer).copied()
    }

    /// Messages to `peer` still waiting for a message-level ack.
    pub fn unacked(&self, peer: SocketAddr) -> usize {
        self.outstanding.keys().filter(|(p, _)| *p == peer).count()
    }

    pub fn is_acked(&self, peer: SocketAddr, msg_id: u64) -> bool {
        !self.outstanding.contains_key(&(peer, msg_id))
    }

    /// Oldest unacked message to `peer`, if any.
    pub fn oldest_unacked(&self, peer: SocketAddr) -> Option<(MessageType, Duration)> {
        self.outstanding
            .iter()
            .filter(|((p, _), _)| *p == peer)
            .min_by_key(|(_, o)| o.sent_at)
            .map(|(_, o)| (o.kind, o.sent_at.elapsed()))
    }

    /// Sends one message to one peer. Returns its message id.
    pub async fn send(&mut self, to: SocketAddr, msg: &ClusterMsg, frame: u32) -> anyhow::Result<u64> {
        self.send_many(&[to], msg, frame).await
    }

    /// Sends the same message to several peers. The parts are built once.
    pub async fn send_many(
        &mut self,
        targets: &[SocketAddr],
        msg: &ClusterMsg,
        frame: u32,
    ) -> anyhow::Result<u64> {
        self.send_many_stamped(targets, msg, frame, Timestamp::now()).await
    }

    /// [`Self::send_many`] with a caller-chosen timestamp.
    pub async fn send_many_stamped(
        &mut self,
        targets: &[SocketAddr],
        msg: &ClusterMsg,
        frame: u32,
        timestamp: Timestamp,
    ) -> anyhow::Result<u64> {
        let kind = msg.kind();
        let payload = msg.encode().with_context(|| format!("encode {kind:?}"))?;
        let (message, parts) = self
            .factory
            .build_parts(kind, frame, timestamp, payload)
            .with_context(|| format!("fragment {kind:?}"))?;
        let datagrams: Vec<_> = parts.iter().map(MessagePart::encode).collect();

        let now = Instant::now();
        let mut failed = None;
        for to in targets {
            for datagram in &datagrams {
                if let Err(e) = self.transport.send_to(datagram, *to).await {
                    self.stats.send_errors += 1;
                    warn!(%to, ?kind, error = %e, "Send failed");
                    failed = Some(e);
                    continue;
                }
                self.stats.parts_sent += 1;
            }
            if kind.needs_message_ack() {
                self.outstanding.insert((*to, message.id), Outstanding { kind, sent_at: now });
            }
        }
        self.stats.messages_sent += 1;
        trace!(?kind, id = message.id, frame, parts = datagrams.len(), "Sent message");

        match failed {
            Some(e) => Err(e).with_context(|| format!("send {kind:?}")),
            None => Ok(message.id),
        }
    }

    async fn send_ack(&mut self, to: SocketAddr, ack: Ack) {
        if let Err(e) = self.send(to, &ClusterMsg::Ack(ack), 0).await {
            debug!(%to, error = %e, "Ack not sent");
        }
    }

    /// Drains the transport and returns every message completed by it.
    pub async fn poll(&mut self) -> Vec<Incoming> {
        let mut datagrams = Vec::new();
        while datagrams.len() < MAX_DATAGRAMS_PER_POLL {
            match self.transport.try_recv_from(&mut self.recv_buf) {
                Ok(Some((n, from))) => datagrams.push((self.recv_buf[..n].to_vec(), from)),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Receive failed");
                    break;
                }
            }
        }

        let now = Instant::now();
        let mut out = Vec::new();
        for (datagram, from) in datagrams {
            if let Some(incoming) = self.handle_datagram(&datagram, from, now).await {
                out.push(incoming);
            }
        }

        for reassembler in self.reassemblers.values_mut() {
            reassembler.purge_stale(now);
        }
        self.expire_unacked(now);
        out
    }

    /// Forgets messages whose ack did not arrive within `ack_timeout`.
    fn expire_unacked(&mut self, now: Instant) {
        let timeout = self.ack_timeout;
        let before = self.outstanding.len();
        self.outstanding.retain(|(peer, id), o| {
            let live = now.saturating_duration_since(o.sent_at) < timeout;
            if !live {
                debug!(%peer, id, kind = ?o.kind, "Ack never arrived");
            }
            live
        });
        let expired = before - self.outstanding.len();
        if expired > 0 {
            self.stats.acks_expired += expired as u64;
            warn!(expired, waiting = self.outstanding.len(), "Expired unacknowledged messages");
        }
    }

    async fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr, now: Instant) -> Option<Incoming> {
        let part = match MessagePart::decode(datagram) {
            Ok(part) => part,
            Err(e) => {
                self.stats.decode_errors += 1;
                warn!(%from, error = %e, "Discarding datagram");
                return None;
            }
        };
        self.stats.parts_received += 1;
        self.last_heard.insert(from, now);

        let kind = part.kind;
        if kind != MessageType::Ack {
            self.send_ack(from, Ack::part(kind, part.msg_id, part.part_index)).await;
        }

        let timeout = self.partial_timeout;
        let reassembler = self
            .reassemblers
            .entry(from)
            .or_insert_with(|| Reassembler::new(timeout));
        let message = match reassembler.accept_at(part, now) {
            Ok(Some(message)) => message,
            Ok(None) => return None,
            Err(e) => {
                self.stats.decode_errors += 1;
                warn!(%from, ?kind, error = %e, "Discarding part");
                return None;
            }
        };

        let msg = match ClusterMsg::decode(message.kind, &message.payload) {
            Ok(msg) => msg,
            Err(e) => {
                self.stats.decode_errors += 1;
                warn!(%from, ?kind, id = message.id, error = %e, "Discarding message");
                return None;
            }
        };

        if let ClusterMsg::Ack(ack) = &msg {
            if !ack.is_message_level() {
                self.stats.part_acks_received += 1;
                return None;
            }
            self.stats.message_acks_received += 1;
            self.outstanding.remove(&(from, ack.msg_id));
        } else {
            self.stats.messages_received += 1;
            if kind.needs_message_ack() {
                self.send_ack(from, Ack::message(kind, message.id)).await;
            }
        }

        trace!(%from, ?kind, id = message.id, frame = message.frame, "Received message");
        Some(Incoming {
            from,
            id: message.id,
            frame: message.frame,
            timestamp: message.timestamp,
            msg,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{
        config::ProjectConfig,
        transport::{MemoryNetwork, MemoryTransport},
    };

    fn pair(net: &MemoryNetwork) -> (Endpoint<MemoryTransport>, Endpoint<MemoryTransport>) {
        let cfg = ClusterConfig::default();
        (Endpoint::new(net.bind(), &cfg), Endpoint::new(net.bind(), &cfg))
    }

    fn addr(e: &Endpoint<MemoryTransport>) -> SocketAddr {
        e.transport().addr()
    }

    #[tokio::test]
    async fn small_message_arrives_with_frame() {
        let net = MemoryNetwork::new(1);
        let (mut a, mut b) = pair(&net);
        a.send(addr(&b), &ClusterMsg::FrameStart, 42).await.unwrap();

        let got = b.poll().await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].msg, ClusterMsg::FrameStart);
        assert_eq!(got[0].frame, 42);
        assert_eq!(got[0].from, addr(&a));
        assert!(b.last_heard(addr(&a)).is_some());
    }

    #[tokio::test]
    async fn every_part_is_acknowledged() {
        let net = MemoryNetwork::new(1);
        let (mut a, mut b) = pair(&net);
        let big = ClusterMsg::Resource {
            name: "blob".into(),
            data: Bytes::from(vec![7u8; 5000]),
        };
        a.send(addr(&b), &big, 0).await.unwrap();
        let parts = a.stats().parts_sent;
        assert!(parts > 1);

        let got = b.poll().await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].msg, big);

        // Acks are consumed by the endpoint, not surfaced.
        assert!(a.poll().await.is_empty());
        assert_eq!(a.stats().part_acks_received, parts);
    }

    #[tokio::test]
    async fn message_level_ack_clears_the_book() {
        let net = MemoryNetwork::new(1);
        let (mut a, mut b) = pair(&net);
        let id = a
            .send(addr(&b), &ClusterMsg::Project(ProjectConfig::new("demo")), 0)
            .await
            .unwrap();
        assert!(!a.is_acked(addr(&b), id));
        assert_eq!(a.unacked(addr(&b)), 1);

        b.poll().await;
        let acks = a.poll().await;
        assert_eq!(acks.len(), 1);
        assert_eq!(
            acks[0].msg,
            ClusterMsg::Ack(Ack::message(MessageType::Project, id))
        );
        assert!(a.is_acked(addr(&b), id));
    }

    #[tokio::test]
    async fn unacked_messages_expire_from_the_book() {
        let net = MemoryNetwork::new(1);
        let cfg = ClusterConfig {
            ack_timeout_ms: 200,
            shutdown_timeout_ms: 200,
            ..ClusterConfig::default()
        };
        let mut master = Endpoint::new(net.bind(), &cfg);
        let mut slave = Endpoint::new(net.bind(), &cfg);
        net.block(addr(&slave), addr(&master));

        for frame in 1..=1000 {
            master.send(addr(&slave), &ClusterMsg::Draw, frame).await.unwrap();
        }
        assert_eq!(slave.poll().await.len(), 1000);
        master.poll().await;
        assert_eq!(master.unacked(addr(&slave)), 1000);
        assert_eq!(master.oldest_unacked(addr(&slave)).map(|(kind, _)| kind), Some(MessageType::Draw));

        net.unblock(addr(&slave), addr(&master));
        tokio::time::sleep(Duration::from_millis(250)).await;
        let fresh = master.send(addr(&slave), &ClusterMsg::Draw, 1001).await.unwrap();
        master.poll().await;
        assert_eq!(master.stats().acks_expired, 1000);
        assert_eq!(master.unacked(addr(&slave)), 1);
        assert!(!master.is_acked(addr(&slave), fresh));
    }

    #[tokio::test]
    async fn garbage_datagram_is_counted_and_skipped() {
        let net = MemoryNetwork::new(1);
        let (a, mut b) = pair(&net);
        a.transport()
            .send_to(&[1, 2, 3], addr(&b))
            .await
            .unwrap();
        assert!(b.poll().await.is_empty());
        assert_eq!(b.stats().decode_errors, 1);
    }

    #[tokio::test]
    async fn send_many_shares_one_message_id() {
        let net = MemoryNetwork::new(1);
        let cfg = ClusterConfig::default();
        let mut master = Endpoint::new(net.bind(), &cfg);
        let mut s1 = Endpoint::new(net.bind(), &cfg);
        let mut s2 = Endpoint::new(net.bind(), &cfg);
        let targets = [addr(&s1), addr(&s2)];
        let id = master.send_many(&targets, &ClusterMsg::Draw, 5).await.unwrap();

        assert_eq!(s1.poll().await[0].id, id);
        assert_eq!(s2.poll().await[0].id, id);
        master.poll().await;
        assert!(master.is_acked(targets[0], id) && master.is_acked(targets[1], id));
    }
}
