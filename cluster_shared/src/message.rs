//! Message framing.
//!
//! A [`Message`] is the logical unit exchanged between master and slaves. It
//! never crosses the wire whole: [`fragment`] splits it into [`MessagePart`]s
//! sized to fit one physical network frame, and the receiver's
//! [`Reassembler`](crate::reassembly::Reassembler) puts them back together.
//!
//! Wire layout (native byte order, no padding):
//!
//! ```text
//! MessagePart = { type:u32, msg_id:u64, total_parts:u16, part_index:u16, len:u16, payload[len] }
//! Message     = { frame:u32, timestamp:{sec:i64,usec:i64}, size:u32, data[size] }
//! ```
//!
//! The message header travels at the start of part 0, so the receiver learns
//! the frame, timestamp and total size from the first part.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ProtocolError, ProtocolResult},
    stream::ByteStream,
};

/// Ethernet payload size.
pub const DEFAULT_LINK_MTU: usize = 1500;
pub const UDP_HEADER_SIZE: usize = 8;
pub const IP_HEADER_SIZE: usize = 20;
/// `type + msg_id + total_parts + part_index + len`.
pub const PART_HEADER_SIZE: usize = 4 + 8 + 2 + 2 + 2;
/// `frame + timestamp.sec + timestamp.usec + size`.
pub const MESSAGE_HEADER_SIZE: usize = 4 + 8 + 8 + 4;
pub const MAX_PARTS: usize = u16::MAX as usize;

/// Payload bytes available per part for a link MTU.
pub fn part_capacity(link_mtu: usize) -> usize {
    link_mtu.saturating_sub(UDP_HEADER_SIZE + IP_HEADER_SIZE + PART_HEADER_SIZE)
}

/// Message type tags. The numeric values are part of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u32)]
pub enum MessageType {
    Undefined = 0,
    Ack = 1,
    RegUpdates = 2,
    RegRendering = 3,
    Environment = 4,
    Project = 5,
    SgCreate = 6,
    FrameStart = 7,
    ReqSgUpdate = 8,
    SgInit = 9,
    SgUpdate = 10,
    Input = 11,
    DrawReady = 12,
    Draw = 13,
    Drawing = 14,
    DrawDone = 15,
    Command = 16,
    RegOutput = 17,
    Print = 18,
    Shutdown = 19,
    RegResource = 20,
    Resource = 21,
    InjectLag = 22,
}

impl MessageType {
    pub const ALL: [MessageType; 23] = [
        MessageType::Undefined,
        MessageType::Ack,
        MessageType::RegUpdates,
        MessageType::RegRendering,
        MessageType::Environment,
        MessageType::Project,
        MessageType::SgCreate,
        MessageType::FrameStart,
        MessageType::ReqSgUpdate,
        MessageType::SgInit,
        MessageType::SgUpdate,
        MessageType::Input,
        MessageType::DrawReady,
        MessageType::Draw,
        MessageType::Drawing,
        MessageType::DrawDone,
        MessageType::Command,
        MessageType::RegOutput,
        MessageType::Print,
        MessageType::Shutdown,
        MessageType::RegResource,
        MessageType::Resource,
        MessageType::InjectLag,
    ];

    pub fn from_u32(v: u32) -> ProtocolResult<Self> {
        Self::ALL
            .get(v as usize)
            .copied()
            .ok_or(ProtocolError::UnknownMessageType(v))
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Types acknowledged once fully reassembled, in addition to per-part acks.
    /// These acks drive the master's per-client state machine.
    pub fn needs_message_ack(self) -> bool {
        matches!(
            self,
            MessageType::Environment
                | MessageType::Project
                | MessageType::SgInit
                | MessageType::Draw
                | MessageType::Shutdown
        )
    }
}

/// Wall-clock timestamp carried by every message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub sec: i64,
    pub usec: i64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { sec: 0, usec: 0 };

    pub fn new(sec: i64, usec: i64) -> Self {
        Self { sec, usec }
    }

    pub fn now() -> Self {
        let now = chrono::Utc::now();
        Self {
            sec: now.timestamp(),
            usec: i64::from(now.timestamp_subsec_micros()),
        }
    }

    pub fn as_micros(self) -> i64 {
        self.sec * 1_000_000 + self.usec
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

/// A fully assembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub id: u64,
    /// Simulation frame; 0 for out-of-band traffic.
    pub frame: u32,
    pub timestamp: Timestamp,
    pub payload: Bytes,
}

impl Message {
    /// Serializes the message header followed by the payload.
    pub fn encode_body(&self) -> Bytes {
        let mut s = ByteStream::with_capacity(MESSAGE_HEADER_SIZE + self.payload.len());
        s.write_u32(self.frame);
        s.write_i64(self.timestamp.sec);
        s.write_i64(self.timestamp.usec);
        s.write_u32(self.payload.len() as u32);
        s.write(&self.payload);
        s.into_bytes()
    }

    /// Parses an assembled body back into a message.
    pub fn decode_body(kind: MessageType, id: u64, body: &[u8]) -> ProtocolResult<Self> {
        let mut s = ByteStream::from_bytes(body);
        let frame = s.read_u32()?;
        let sec = s.read_i64()?;
        let usec = s.read_i64()?;
        let declared = s.read_u32()? as usize;
        if declared != s.len() {
            return Err(ProtocolError::ShortMessage {
                declared,
                actual: s.len(),
            });
        }
        let payload = s.read(declared)?;
        Ok(Self {
            kind,
            id,
            frame,
            timestamp: Timestamp::new(sec, usec),
            payload,
        })
    }
}

/// The unit that actually crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePart {
    pub kind: MessageType,
    pub msg_id: u64,
    pub total_parts: u16,
    pub part_index: u16,
    pub payload: Bytes,
}

impl MessagePart {
    /// Encodes the part as one datagram.
    pub fn encode(&self) -> Bytes {
        let mut s = ByteStream::with_capacity(PART_HEADER_SIZE + self.payload.len());
        s.write_u32(self.kind.as_u32());
        s.write_u64(self.msg_id);
        s.write_u16(self.total_parts);
        s.write_u16(self.part_index);
        s.write_u16(self.payload.len() as u16);
        s.write(&self.payload);
        s.into_bytes()
    }

    /// Decodes one datagram, validating the header.
    pub fn decode(datagram: &[u8]) -> ProtocolResult<Self> {
        if datagram.len() < PART_HEADER_SIZE {
            return Err(ProtocolError::MalformedHeader(format!(
                "datagram of {} bytes is shorter than the part header",
                datagram.len()
            )));
        }
        let mut s = ByteStream::from_bytes(datagram);
        let kind = MessageType::from_u32(s.read_u32()?)?;
        let msg_id = s.read_u64()?;
        let total_parts = s.read_u16()?;
        let part_index = s.read_u16()?;
        let len = s.read_u16()? as usize;

        if total_parts == 0 {
            return Err(ProtocolError::MalformedHeader("zero total parts".into()));
        }
        if part_index >= total_parts {
            return Err(ProtocolError::MalformedHeader(format!(
                "part index {part_index} out of {total_parts}"
            )));
        }
        if len != s.len() {
            return Err(ProtocolError::MalformedHeader(format!(
                "declared {len} payload bytes, datagram carries {}",
                s.len()
            )));
        }

        Ok(Self {
            kind,
            msg_id,
            total_parts,
            part_index,
            payload: s.read(len)?,
        })
    }
}

/// Splits a message into parts of at most `capacity` payload bytes.
pub fn fragment(message: &Message, capacity: usize) -> ProtocolResult<Vec<MessagePart>> {
    if capacity == 0 || capacity > u16::MAX as usize {
        return Err(ProtocolError::MalformedHeader(format!(
            "unusable part capacity {capacity}"
        )));
    }
    let body = message.encode_body();
    let total = body.len().div_ceil(capacity).max(1);
    if total > MAX_PARTS {
        return Err(ProtocolError::MessageTooLarge {
            size: message.payload.len(),
            max: MAX_PARTS,
        });
    }

    let parts = (0..total)
        .map(|index| {
            let start = index * capacity;
            let end = (start + capacity).min(body.len());
            MessagePart {
                kind: message.kind,
                msg_id: message.id,
                total_parts: total as u16,
                part_index: index as u16,
                payload: body.slice(start..end),
            }
        })
        .collect();
    Ok(parts)
}

/// Builds outgoing messages and owns the message-id counter.
#[derive(Debug, Clone)]
pub struct MessageFactory {
    last_id: u64,
    part_capacity: usize,
}

impl MessageFactory {
    pub fn new(part_capacity: usize) -> Self {
        Self {
            last_id: 0,
            part_capacity,
        }
    }

    /// Factory sized for a link MTU.
    pub fn for_mtu(link_mtu: usize) -> Self {
        Self::new(part_capacity(link_mtu))
    }

    pub fn part_capacity(&self) -> usize {
        self.part_capacity
    }

    pub fn last_id(&self) -> u64 {
        self.last_id
    }

    /// Creates a message with the next id.
    pub fn create(
        &mut self,
        kind: MessageType,
        frame: u32,
        timestamp: Timestamp,
        payload: Bytes,
    ) -> Message {
        self.last_id += 1;
        Message {
            kind,
            id: self.last_id,
            frame,
            timestamp,
            payload,
        }
    }

    /// Creates a message and splits it for the wire.
    pub fn build_parts(
        &mut self,
        kind: MessageType,
        frame: u32,
        timestamp: Timestamp,
        payload: Bytes,
    ) -> ProtocolResult<(Message, Vec<MessagePart>)> {
        let message = self.create(kind, frame, timestamp, payload);
        let parts = fragment(&message, self.part_capacity)?;
        Ok((message, parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(len: usize) -> Message {
        Message {
            kind: MessageType::SgUpdate,
            id: 9,
            frame: 3,
            timestamp: Timestamp::new(100, 250),
            payload: Bytes::from((0..len).map(|i| i as u8).collect::<Vec<_>>()),
        }
    }

    #[test]
    fn type_tags_follow_protocol_order() {
        assert_eq!(MessageType::Undefined.as_u32(), 0);
        assert_eq!(MessageType::Ack.as_u32(), 1);
        assert_eq!(MessageType::FrameStart.as_u32(), 7);
        assert_eq!(MessageType::InjectLag.as_u32(), 22);
        for kind in MessageType::ALL {
            assert_eq!(MessageType::from_u32(kind.as_u32()).unwrap(), kind);
        }
        assert_eq!(
            MessageType::from_u32(23),
            Err(ProtocolError::UnknownMessageType(23))
        );
    }

    #[test]
    fn part_budget_fits_one_ethernet_frame() {
        let cap = part_capacity(DEFAULT_LINK_MTU);
        assert_eq!(cap, 1500 - 8 - 20 - 18);
        assert_eq!(
            cap + PART_HEADER_SIZE + UDP_HEADER_SIZE + IP_HEADER_SIZE,
            DEFAULT_LINK_MTU
        );
    }

    #[test]
    fn empty_message_is_one_part() {
        let parts = fragment(&message(0), 1400).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].payload.len(), MESSAGE_HEADER_SIZE);
    }

    #[test]
    fn five_thousand_bytes_make_four_parts() {
        let parts = fragment(&message(5000), 1400).unwrap();
        assert_eq!(parts.len(), 4);
        assert!(parts.iter().all(|p| p.total_parts == 4 && p.msg_id == 9));
        assert!(parts.iter().all(|p| p.kind == MessageType::SgUpdate));
        let total: usize = parts.iter().map(|p| p.payload.len()).sum();
        assert_eq!(total, MESSAGE_HEADER_SIZE + 5000);
    }

    #[test]
    fn part_encoding_is_header_plus_payload() {
        let part = fragment(&message(10), 1400).unwrap().remove(0);
        let wire = part.encode();
        assert_eq!(wire.len(), PART_HEADER_SIZE + part.payload.len());
        assert_eq!(MessagePart::decode(&wire).unwrap(), part);
    }

    #[test]
    fn decode_rejects_bad_headers() {
        let part = fragment(&message(10), 1400).unwrap().remove(0);
        let wire = part.encode();

        assert!(matches!(
            MessagePart::decode(&wire[..PART_HEADER_SIZE - 1]),
            Err(ProtocolError::MalformedHeader(_))
        ));
        assert!(matches!(
            MessagePart::decode(&wire[..wire.len() - 1]),
            Err(ProtocolError::MalformedHeader(_))
        ));

        let mut bad_type = wire.to_vec();
        bad_type[..4].copy_from_slice(&999u32.to_ne_bytes());
        assert_eq!(
            MessagePart::decode(&bad_type),
            Err(ProtocolError::UnknownMessageType(999))
        );

        let mut bad_index = wire.to_vec();
        bad_index[14..16].copy_from_slice(&5u16.to_ne_bytes());
        assert!(matches!(
            MessagePart::decode(&bad_index),
            Err(ProtocolError::MalformedHeader(_))
        ));
    }

    #[test]
    fn body_size_mismatch_is_short_message() {
        let mut body = message(8).encode_body().to_vec();
        body.pop();
        assert_eq!(
            Message::decode_body(MessageType::SgUpdate, 1, &body),
            Err(ProtocolError::ShortMessage {
                declared: 8,
                actual: 7
            })
        );
    }

    #[test]
    fn factory_ids_increase() {
        let mut factory = MessageFactory::new(1400);
        let a = factory.create(MessageType::Draw, 1, Timestamp::ZERO, Bytes::new());
        let b = factory.create(MessageType::Draw, 1, Timestamp::ZERO, Bytes::new());
        assert!(b.id > a.id);
        assert_eq!(factory.last_id(), b.id);
    }
}
