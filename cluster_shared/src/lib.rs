//! `cluster_shared`
//!
//! Protocol and replication libraries used by both master and slaves.
//!
//! Layers, bottom up:
//! - [`stream`]: typed byte cursor every codec is built on.
//! - [`message`], [`reassembly`]: framing, fragmentation and reassembly.
//! - [`distributed`], [`objects`], [`session`], [`updates`]: the replicated
//!   object model and its registry.
//! - [`protocol`], [`transport`], [`endpoint`]: typed messages over datagrams.
//! - [`config`], [`console`], [`resources`], [`render`]: process plumbing.
//!
//! No `unsafe`.

pub mod config;
pub mod console;
pub mod distributed;
pub mod endpoint;
pub mod error;
pub mod math;
pub mod message;
pub mod objects;
pub mod protocol;
pub mod reassembly;
pub mod render;
pub mod resources;
pub mod session;
pub mod stream;
pub mod transport;
pub mod updates;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::{ClusterConfig, EnvironmentConfig, ProjectConfig};
    pub use crate::distributed::{DirtyMask, Distributed, ObjectId};
    pub use crate::endpoint::{Endpoint, Incoming};
    pub use crate::error::{ProtocolError, ProtocolResult};
    pub use crate::math::*;
    pub use crate::message::{MessageType, Timestamp};
    pub use crate::objects::{Camera, NodeList, Transform};
    pub use crate::protocol::{Ack, ClusterMsg};
    pub use crate::session::{Role, Session};
    pub use crate::transport::{MemoryNetwork, MemoryTransport, Transport, UdpTransport};
}
