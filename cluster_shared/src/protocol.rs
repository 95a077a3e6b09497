//! Cluster protocol messages.
//!
//! [`ClusterMsg`] is the typed view of a message payload. The wire type tag
//! comes from [`ClusterMsg::kind`]; the frame number travels in the message
//! header, not in the payload.
//!
//! Payload layouts use [`ByteStream`] conventions. `ENVIRONMENT` and `PROJECT`
//! carry JSON so their contents can evolve without touching the codec.

use bytes::Bytes;

use crate::{
    config::{EnvironmentConfig, ProjectConfig},
    error::{ProtocolError, ProtocolResult},
    message::MessageType,
    session::ObjectBatch,
    stream::ByteStream,
    updates::FrameUpdate,
};

/// `part` value meaning "the whole message".
pub const MESSAGE_LEVEL_ACK: u16 = 0xFFFF;

/// Acknowledgement of a part or of a whole message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ack {
    pub of: MessageType,
    pub msg_id: u64,
    /// `None` for a message-level ack.
    pub part: Option<u16>,
}

impl Ack {
    pub fn part(of: MessageType, msg_id: u64, index: u16) -> Self {
        Self {
            of,
            msg_id,
            part: Some(index),
        }
    }

    pub fn message(of: MessageType, msg_id: u64) -> Self {
        Self {
            of,
            msg_id,
            part: None,
        }
    }

    pub fn is_message_level(&self) -> bool {
        self.part.is_none()
    }
}

/// Every message master and slaves exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterMsg {
    Ack(Ack),

    // ─── Setup (slave -> master requests, master -> slave answers) ───
    /// Slave asks for the environment.
    RegUpdates,
    /// Slave asks for the project.
    RegRendering,
    Environment(EnvironmentConfig),
    Project(ProjectConfig),
    /// Slave asks for a full scene graph; also used to resynchronize.
    ReqSgUpdate {
        last_applied: u32,
    },
    /// Full scene graph snapshot.
    SgInit(ObjectBatch),

    // ─── Frame loop ───
    /// Objects registered since the previous create.
    SgCreate(ObjectBatch),
    SgUpdate(FrameUpdate),
    FrameStart,
    DrawReady,
    Draw,
    Drawing,
    DrawDone,

    // ─── Side channels ───
    /// Slave -> master: opaque input event.
    Input(Bytes),
    /// Master -> slave: console line.
    Command(String),
    /// Master registers for console output.
    RegOutput,
    /// Slave -> master: console output.
    Print(String),
    RegResource(String),
    Resource {
        name: String,
        data: Bytes,
    },
    /// Master -> slave: stall once for this long.
    InjectLag {
        millis: u32,
    },

    Shutdown,
}

impl ClusterMsg {
    pub fn kind(&self) -> MessageType {
        match self {
            ClusterMsg::Ack(_) => MessageType::Ack,
            ClusterMsg::RegUpdates => MessageType::RegUpdates,
            ClusterMsg::RegRendering => MessageType::RegRendering,
            ClusterMsg::Environment(_) => MessageType::Environment,
            ClusterMsg::Project(_) => MessageType::Project,
            ClusterMsg::ReqSgUpdate { .. } => MessageType::ReqSgUpdate,
            ClusterMsg::SgInit(_) => MessageType::SgInit,
            ClusterMsg::SgCreate(_) => MessageType::SgCreate,
            ClusterMsg::SgUpdate(_) => MessageType::SgUpdate,
            ClusterMsg::FrameStart => MessageType::FrameStart,
            ClusterMsg::DrawReady => MessageType::DrawReady,
            ClusterMsg::Draw => MessageType::Draw,
            ClusterMsg::Drawing => MessageType::Drawing,
            ClusterMsg::DrawDone => MessageType::DrawDone,
            ClusterMsg::Input(_) => MessageType::Input,
            ClusterMsg::Command(_) => MessageType::Command,
            ClusterMsg::RegOutput => MessageType::RegOutput,
            ClusterMsg::Print(_) => MessageType::Print,
            ClusterMsg::RegResource(_) => MessageType::RegResource,
            ClusterMsg::Resource { .. } => MessageType::Resource,
            ClusterMsg::InjectLag { .. } => MessageType::InjectLag,
            ClusterMsg::Shutdown => MessageType::Shutdown,
        }
    }

    /// Serializes the payload.
    pub fn encode(&self) -> ProtocolResult<Bytes> {
        let mut s = ByteStream::new();
        match self {
            ClusterMsg::Ack(ack) => {
                s.write_u32(ack.of.as_u32());
                s.write_u64(ack.msg_id);
                s.write_u16(ack.part.unwrap_or(MESSAGE_LEVEL_ACK));
            }
            ClusterMsg::Environment(env) => s.write(&to_json(self.kind(), env)?),
            ClusterMsg::Project(project) => s.write(&to_json(self.kind(), project)?),
            ClusterMsg::ReqSgUpdate { last_applied } => s.write_u32(*last_applied),
            ClusterMsg::SgInit(batch) | ClusterMsg::SgCreate(batch) => batch.write_to(&mut s),
            ClusterMsg::SgUpdate(update) => return Ok(update.encode()),
            ClusterMsg::Input(data) => return Ok(data.clone()),
            ClusterMsg::Command(line) | ClusterMsg::Print(line) | ClusterMsg::RegResource(line) => {
                s.write_str(line)
            }
            ClusterMsg::Resource { name, data } => {
                s.write_str(name);
                s.write_blob(data);
            }
            ClusterMsg::InjectLag { millis } => s.write_u32(*millis),
            ClusterMsg::RegUpdates
            | ClusterMsg::RegRendering
            | ClusterMsg::FrameStart
            | ClusterMsg::DrawReady
            | ClusterMsg::Draw
            | ClusterMsg::Drawing
            | ClusterMsg::DrawDone
            | ClusterMsg::RegOutput
            | ClusterMsg::Shutdown => {}
        }
        Ok(s.into_bytes())
    }

    /// Parses a payload of the given type.
    pub fn decode(kind: MessageType, payload: &Bytes) -> ProtocolResult<Self> {
        let mut s = ByteStream::from_bytes(payload);
        let msg = match kind {
            MessageType::Undefined => return Err(ProtocolError::UnknownMessageType(0)),
            MessageType::Ack => {
                let of = MessageType::from_u32(s.read_u32()?)?;
                let msg_id = s.read_u64()?;
                let part = match s.read_u16()? {
                    MESSAGE_LEVEL_ACK => None,
                    index => Some(index),
                };
                ClusterMsg::Ack(Ack { of, msg_id, part })
            }
            MessageType::RegUpdates => ClusterMsg::RegUpdates,
            MessageType::RegRendering => ClusterMsg::RegRendering,
            MessageType::Environment => ClusterMsg::Environment(from_json(kind, payload)?),
            MessageType::Project => ClusterMsg::Project(from_json(kind, payload)?),
            MessageType::ReqSgUpdate => ClusterMsg::ReqSgUpdate {
                last_applied: s.read_u32()?,
            },
            MessageType::SgInit => ClusterMsg::SgInit(ObjectBatch::read_from(&mut s)?),
            MessageType::SgCreate => ClusterMsg::SgCreate(ObjectBatch::read_from(&mut s)?),
            MessageType::SgUpdate => return Ok(ClusterMsg::SgUpdate(FrameUpdate::decode(payload)?)),
            MessageType::FrameStart => ClusterMsg::FrameStart,
            MessageType::DrawReady => ClusterMsg::DrawReady,
            MessageType::Draw => ClusterMsg::Draw,
            MessageType::Drawing => ClusterMsg::Drawing,
            MessageType::DrawDone => ClusterMsg::DrawDone,
            MessageType::Input => return Ok(ClusterMsg::Input(payload.clone())),
            MessageType::Command => ClusterMsg::Command(s.read_string()?),
            MessageType::RegOutput => ClusterMsg::RegOutput,
            MessageType::Print => ClusterMsg::Print(s.read_string()?),
            MessageType::Shutdown => ClusterMsg::Shutdown,
            MessageType::RegResource => ClusterMsg::RegResource(s.read_string()?),
            MessageType::Resource => ClusterMsg::Resource {
                name: s.read_string()?,
                data: s.read_blob()?,
            },
            MessageType::InjectLag => ClusterMsg::InjectLag {
                millis: s.read_u32()?,
            },
        };
        // JSON payloads were parsed from the raw bytes and left `s` untouched.
        if !s.is_empty() && !matches!(kind, MessageType::Environment | MessageType::Project) {
            return Err(ProtocolError::InvalidPayload(
                kind,
                format!("{} trailing bytes", s.len()),
            ));
        }
        Ok(msg)
    }
}

fn to_json<T: serde::Serialize>(kind: MessageType, value: &T) -> ProtocolResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| ProtocolError::InvalidPayload(kind, e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(kind: MessageType, payload: &[u8]) -> ProtocolResult<T> {
    serde_json::from_slice(payload).map_err(|e| ProtocolError::InvalidPayload(kind, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: ClusterMsg) -> ClusterMsg {
        let bytes = msg.encode().unwrap();
        ClusterMsg::decode(msg.kind(), &bytes).unwrap()
    }

    #[test]
    fn ack_distinguishes_part_and_message_level() {
        let part = ClusterMsg::Ack(Ack::part(MessageType::SgUpdate, 12, 3));
        let whole = ClusterMsg::Ack(Ack::message(MessageType::Draw, 13));
        assert_eq!(round_trip(part.clone()), part);
        assert_eq!(round_trip(whole.clone()), whole);
        assert_eq!(whole.encode().unwrap().len(), 4 + 8 + 2);
    }

    #[test]
    fn signals_have_empty_payloads() {
        for msg in [
            ClusterMsg::FrameStart,
            ClusterMsg::DrawReady,
            ClusterMsg::Draw,
            ClusterMsg::Shutdown,
        ] {
            assert!(msg.encode().unwrap().is_empty());
            assert_eq!(round_trip(msg.clone()), msg);
        }
    }

    #[test]
    fn config_payloads_travel_as_json() {
        let env = ClusterMsg::Environment(EnvironmentConfig::default());
        let bytes = env.encode().unwrap();
        assert_eq!(bytes.first(), Some(&b'{'));
        assert_eq!(round_trip(env.clone()), env);

        let project = ClusterMsg::Project(ProjectConfig::new("demo"));
        assert_eq!(round_trip(project.clone()), project);
    }

    #[test]
    fn resource_carries_name_and_data() {
        let msg = ClusterMsg::Resource {
            name: "textures/wall.png".into(),
            data: Bytes::from_static(&[1, 2, 3]),
        };
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            ClusterMsg::decode(MessageType::Project, &Bytes::from_static(b"nope")),
            Err(ProtocolError::InvalidPayload(MessageType::Project, _))
        ));
        assert!(matches!(
            ClusterMsg::decode(MessageType::InjectLag, &Bytes::from_static(&[1])),
            Err(ProtocolError::ShortBuffer { .. })
        ));
        assert!(matches!(
            ClusterMsg::decode(MessageType::DrawDone, &Bytes::from_static(&[1])),
            Err(ProtocolError::InvalidPayload(MessageType::DrawDone, _))
        ));
    }
}
