//! Standalone render slave.
//!
//! Usage:
//!   cargo run -p cluster_client -- [--config cluster.json] [--addr 127.0.0.1:40100] [--tick-hz 60]
//!
//! Flags apply in order, so put `--config` first.
//!
//! The slave requests the environment, project and scene graph from the
//! master, then renders every frame the master drives until it receives
//! `SHUTDOWN`. Rendering is headless: each frame is summarized in the log.

use std::env;
use std::time::Duration;

use anyhow::Context;
use cluster_client::ClusterClient;
use cluster_shared::{config::ClusterConfig, render::FrameRenderer, session::Session};
use tracing::{debug, info};

fn parse_args() -> anyhow::Result<ClusterConfig> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = ClusterConfig::default();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                let text = std::fs::read_to_string(&args[i + 1])
                    .with_context(|| format!("read {}", args[i + 1]))?;
                cfg = ClusterConfig::from_json_str(&text).context("parse config")?;
                i += 2;
            }
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().context("parse --tick-hz")?;
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

/// Logs a one-line summary of every frame.
struct LogRenderer;

impl FrameRenderer for LogRenderer {
    fn draw(&mut self, frame: u32, scene: &Session) -> anyhow::Result<()> {
        if frame % 60 == 0 {
            info!(frame, objects = scene.len(), "Frame");
        } else {
            debug!(frame, objects = scene.len(), "Frame");
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(server = %cfg.server_addr, tick_hz = cfg.tick_hz, "Starting slave");

    // Four polls per master tick.
    let tick = Duration::from_secs_f64(1.0 / f64::from(cfg.tick_hz.max(1) * 4));
    let mut client = ClusterClient::connect(cfg, Box::new(LogRenderer))
        .await
        .context("connect")?;
    client.run(tick).await?;

    let stats = client.stats();
    info!(
        frames = stats.frames_drawn,
        updates = stats.updates_applied,
        resyncs = stats.resyncs_requested,
        "Slave exiting"
    );
    Ok(())
}
