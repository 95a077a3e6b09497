//! Protocol error taxonomy.
//!
//! Every parse/pack/unpack operation in this crate returns a
//! [`ProtocolResult`]. Callers on the message path log the error and discard
//! the offending message; nothing here is fatal to a connection.

use thiserror::Error;

use crate::{distributed::ObjectId, message::MessageType, session::Role};

/// Errors raised while encoding, decoding or applying cluster traffic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("short buffer: needed {needed} bytes, {remaining} remaining")]
    ShortBuffer { needed: usize, remaining: usize },

    #[error("short message: header declares {declared} bytes, assembled {actual}")]
    ShortMessage { declared: usize, actual: usize },

    #[error("malformed part header: {0}")]
    MalformedHeader(String),

    #[error("unknown message type tag {0}")]
    UnknownMessageType(u32),

    #[error("duplicate part {index} for {kind:?} message {msg_id}")]
    DuplicatePart {
        kind: MessageType,
        msg_id: u64,
        index: u16,
    },

    #[error("message of {size} bytes needs more than {max} parts")]
    MessageTooLarge { size: usize, max: usize },

    #[error("unexpected payload for {0:?}: {1}")]
    InvalidPayload(MessageType, String),

    #[error("unknown distributed type tag {0}")]
    UnknownObjectType(u32),

    #[error("record for {record:?} routed to object {object:?}")]
    IdMismatch { record: ObjectId, object: ObjectId },

    #[error("record for {id:?} carries type {record} but the object is type {object}")]
    TypeMismatch { id: ObjectId, record: u32, object: u32 },

    #[error("object id {0:?} is already registered")]
    DuplicateId(ObjectId),

    #[error("object already carries id {0:?}")]
    AlreadyRegistered(ObjectId),

    #[error("undefined object id")]
    UndefinedId,

    #[error("operation requires a {expected:?} session")]
    WrongRole { expected: Role },

    #[error("record for {id:?} left {remaining} unread bytes")]
    TrailingBytes { id: ObjectId, remaining: usize },

    #[error("invalid utf-8 string in stream")]
    InvalidString,
}

/// Result alias used by the protocol layer.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
