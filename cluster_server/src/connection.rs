//! Per-slave bookkeeping on the master.

use std::{
    fmt,
    net::SocketAddr,
    time::{Duration, Instant},
};

use cluster_shared::message::MessageType;

use crate::fsm::{ClientLink, LinkRender, LinkSetup};

/// Master-assigned slave number, in order of first contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Last frame each phase reply arrived for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseFrames {
    pub draw_ready: u32,
    /// Message-level ack of `DRAW`.
    pub draw_delivered: u32,
    pub drawing: u32,
    pub draw_done: u32,
}

/// A setup message sent to the slave and not yet acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingSetup {
    pub kind: MessageType,
    pub msg_id: u64,
    pub sent_at: Instant,
}

/// One slave as the master sees it. Created on the first datagram from an
/// unknown address and kept for the life of the server.
#[derive(Debug, Clone)]
pub struct SlaveConnection {
    pub id: ClientId,
    pub addr: SocketAddr,
    pub link: ClientLink,
    pub acked: PhaseFrames,
    /// Cleared while the slave sits out the rest of a frame it stalled.
    pub rendering_enabled: bool,
    pub output_registered: bool,
    pub pending_setup: Option<PendingSetup>,
    pub stalls: u32,
    pub resyncs: u32,
}

impl SlaveConnection {
    pub fn new(id: ClientId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            link: ClientLink::new(),
            acked: PhaseFrames::default(),
            rendering_enabled: true,
            output_registered: false,
            pending_setup: None,
            stalls: 0,
            resyncs: 0,
        }
    }

    /// `oldest_unacked` comes from the endpoint's ack book.
    pub fn info(&self, last_heard: Option<Instant>, oldest_unacked: Option<(MessageType, Duration)>) -> ClientInfo {
        ClientInfo {
            id: self.id,
            addr: self.addr,
            setup: self.link.setup(),
            render: self.link.render(),
            frame: self.link.frame(),
            acked: self.acked,
            output_registered: self.output_registered,
            silent_for_ms: last_heard.map(|t| t.elapsed().as_millis() as u64),
            oldest_unacked: oldest_unacked.map(|(kind, age)| (kind, age.as_millis() as u64)),
            stalls: self.stalls,
            resyncs: self.resyncs,
        }
    }
}

/// Snapshot of a slave for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub addr: SocketAddr,
    pub setup: LinkSetup,
    pub render: LinkRender,
    pub frame: u32,
    pub acked: PhaseFrames,
    pub output_registered: bool,
    pub silent_for_ms: Option<u64>,
    /// Oldest message still waiting for its ack, with its age in ms.
    pub oldest_unacked: Option<(MessageType, u64)>,
    pub stalls: u32,
    pub resyncs: u32,
}

impl fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:?}/{:?} frame={} stalls={} resyncs={}",
            self.id, self.addr, self.setup, self.render, self.frame, self.stalls, self.resyncs
        )?;
        if let Some(ms) = self.silent_for_ms {
            write!(f, " silent={ms}ms")?;
        }
        if let Some((kind, ms)) = self.oldest_unacked {
            write!(f, " unacked={kind:?}/{ms}ms")?;
        }
        Ok(())
    }
}
