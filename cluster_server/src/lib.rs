//! `cluster_server`
//!
//! Render master:
//! - [`fsm`]: per-slave link machine and the global frame machine
//! - [`connection`]: what the master tracks about each slave
//! - [`server`]: the driver with the update/render/swap barriers
//!
//! Networking model:
//! - one UDP socket, every slave talks to it
//! - the master never opens a connection; a slave exists once it is heard from

pub mod connection;
pub mod fsm;
pub mod server;

pub use connection::ClientId;
pub use server::{BarrierOutcome, ClusterServer, Phase, ServerEvent};
