//! `cluster_client`
//!
//! Render slave:
//! - [`fsm`]: setup and per-frame state machine, pure and unit-tested
//! - [`client`]: the driver wiring the machine to the network, the replicated
//!   scene and a renderer

pub mod client;
pub mod fsm;

pub use client::ClusterClient;
