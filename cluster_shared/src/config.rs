//! Configuration system.
//!
//! - [`ClusterConfig`]: process settings for master and slaves, loaded from
//!   JSON (file IO left to the binaries).
//! - [`EnvironmentConfig`] / [`ProjectConfig`]: what the master ships to
//!   slaves during setup, as JSON inside `ENVIRONMENT` and `PROJECT`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message::DEFAULT_LINK_MTU;

/// Root configuration shared by client/server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Master listen address, e.g. `127.0.0.1:40100`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    #[serde(default = "default_link_mtu")]
    pub link_mtu: usize,
    /// Requested kernel send/receive buffer size.
    #[serde(default = "default_socket_buffer_bytes")]
    pub socket_buffer_bytes: usize,
    /// How long a barrier waits for every ready slave.
    #[serde(default = "default_barrier_timeout_ms")]
    pub barrier_timeout_ms: u64,
    /// Drain window after a barrier timeout.
    #[serde(default = "default_error_grace_ms")]
    pub error_grace_ms: u64,
    #[serde(default = "default_environment_retry_ms")]
    pub environment_retry_ms: u64,
    #[serde(default = "default_partial_timeout_ms")]
    pub partial_timeout_ms: u64,
    /// How long a sent message waits for its message-level ack before the
    /// endpoint forgets it.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Queued updates tolerated behind a missing one before a slave resyncs.
    #[serde(default = "default_max_update_gap")]
    pub max_update_gap: usize,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Master frame rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
}

fn default_server_addr() -> String {
    "127.0.0.1:40100".to_string()
}

fn default_link_mtu() -> usize {
    DEFAULT_LINK_MTU
}

fn default_socket_buffer_bytes() -> usize {
    32 * 1024 * 1024
}

fn default_barrier_timeout_ms() -> u64 {
    2000
}

fn default_error_grace_ms() -> u64 {
    100
}

fn default_environment_retry_ms() -> u64 {
    100
}

fn default_partial_timeout_ms() -> u64 {
    5000
}

fn default_ack_timeout_ms() -> u64 {
    10_000
}

fn default_max_update_gap() -> usize {
    2
}

fn default_shutdown_timeout_ms() -> u64 {
    500
}

fn default_tick_hz() -> u32 {
    60
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            link_mtu: default_link_mtu(),
            socket_buffer_bytes: default_socket_buffer_bytes(),
            barrier_timeout_ms: default_barrier_timeout_ms(),
            error_grace_ms: default_error_grace_ms(),
            environment_retry_ms: default_environment_retry_ms(),
            partial_timeout_ms: default_partial_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_update_gap: default_max_update_gap(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            tick_hz: default_tick_hz(),
        }
    }
}

impl ClusterConfig {
    /// Parses config from JSON. Missing fields take their defaults.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }

    pub fn error_grace(&self) -> Duration {
        Duration::from_millis(self.error_grace_ms)
    }

    pub fn environment_retry(&self) -> Duration {
        Duration::from_millis(self.environment_retry_ms)
    }

    pub fn partial_timeout(&self) -> Duration {
        Duration::from_millis(self.partial_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Duration of one master frame.
    pub fn tick(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_hz.max(1)))
    }
}

/// One output surface driven by a slave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub fullscreen: bool,
    /// Viewport offset inside the shared wall, in pixels.
    #[serde(default)]
    pub offset: (i32, i32),
}

/// Render environment shared by every slave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    #[serde(default)]
    pub displays: Vec<DisplayConfig>,
    #[serde(default = "default_vsync")]
    pub vsync: bool,
    #[serde(default)]
    pub background: [f32; 3],
}

fn default_vsync() -> bool {
    true
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            displays: Vec::new(),
            vsync: default_vsync(),
            background: [0.0; 3],
        }
    }
}

/// The application project slaves load before the scene graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    /// Scene the master will replicate.
    #[serde(default)]
    pub scene: String,
    /// Resources slaves may fetch with `REG_RESOURCE`.
    #[serde(default)]
    pub resources: Vec<String>,
}

impl ProjectConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}
