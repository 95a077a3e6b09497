//! Message reassembly.
//!
//! Parts accumulate per `(type, id)` until every index is present. A partial
//! message is private to this module; callers only ever see complete
//! [`Message`]s.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tracing::warn;

use crate::{
    error::{ProtocolError, ProtocolResult},
    message::{Message, MessagePart, MessageType},
};

/// Incomplete parts dropped after this long without completing.
pub const DEFAULT_PARTIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct PartialMessage {
    total_parts: u16,
    parts: Vec<Option<Bytes>>,
    received: usize,
    created_at: Instant,
}

impl PartialMessage {
    fn new(total_parts: u16, now: Instant) -> Self {
        Self {
            total_parts,
            parts: vec![None; total_parts as usize],
            received: 0,
            created_at: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.total_parts as usize
    }

    fn body(self) -> Vec<u8> {
        self.parts.into_iter().flatten().fold(Vec::new(), |mut acc, part| {
            acc.extend_from_slice(&part);
            acc
        })
    }
}

/// Per-peer reassembly state.
#[derive(Debug)]
pub struct Reassembler {
    partial: HashMap<(MessageType, u64), PartialMessage>,
    timeout: Duration,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_PARTIAL_TIMEOUT)
    }
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            partial: HashMap::new(),
            timeout,
        }
    }

    /// Number of messages still waiting for parts.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    /// Accepts one part. Returns the message once its last part arrives.
    pub fn accept(&mut self, part: MessagePart) -> ProtocolResult<Option<Message>> {
        self.accept_at(part, Instant::now())
    }

    pub fn accept_at(&mut self, part: MessagePart, now: Instant) -> ProtocolResult<Option<Message>> {
        if part.total_parts == 1 {
            return Message::decode_body(part.kind, part.msg_id, &part.payload).map(Some);
        }

        let key = (part.kind, part.msg_id);
        let entry = self
            .partial
            .entry(key)
            .or_insert_with(|| PartialMessage::new(part.total_parts, now));

        if entry.total_parts != part.total_parts {
            return Err(ProtocolError::MalformedHeader(format!(
                "part claims {} total parts, message has {}",
                part.total_parts, entry.total_parts
            )));
        }

        let slot = entry
            .parts
            .get_mut(part.part_index as usize)
            .ok_or_else(|| {
                ProtocolError::MalformedHeader(format!("part index {} out of range", part.part_index))
            })?;
        if slot.is_some() {
            return Err(ProtocolError::DuplicatePart {
                kind: part.kind,
                msg_id: part.msg_id,
                index: part.part_index,
            });
        }
        *slot = Some(part.payload);
        entry.received += 1;

        if !entry.is_complete() {
            return Ok(None);
        }

        match self.partial.remove(&key) {
            Some(done) => Message::decode_body(key.0, key.1, &done.body()).map(Some),
            None => Ok(None),
        }
    }

    /// Drops partial messages older than the timeout. Returns how many went.
    pub fn purge_stale(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.partial.len();
        self.partial
            .retain(|_, p| now.saturating_duration_since(p.created_at) <= timeout);
        let dropped = before - self.partial.len();
        if dropped > 0 {
            warn!(dropped, ?timeout, "Dropped incomplete messages");
        }
        dropped
    }
}
