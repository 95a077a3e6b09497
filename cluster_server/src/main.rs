//! Standalone render master.
//!
//! Usage:
//!   cargo run -p cluster_server -- [--config cluster.json] [--addr 127.0.0.1:40100] [--tick-hz 60]
//!                                  [--environment env.json] [--project project.json]
//!
//! The master serves the environment, project and scene graph to every slave
//! that connects, animates a small demo scene and paces all ready slaves
//! through each frame.
//!
//! Console commands:
//!   status                 - Show global state and every slave
//!   cmd [#id] <line>       - Run a console line on slaves
//!   output [#id]           - Have slaves send their console output back
//!   lag <#id|all> <ms>     - Make slaves stall once
//!   quit                   - Shut every slave down and exit

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use cluster_server::{server::FrameReport, BarrierOutcome, ClusterServer, ServerEvent};
use cluster_shared::{
    config::{ClusterConfig, EnvironmentConfig, ProjectConfig},
    distributed::ObjectId,
    math::{Quat, Vec3},
    message::Timestamp,
    objects::{Camera, NodeList, Transform},
    session::Session,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

struct Args {
    cfg: ClusterConfig,
    environment: EnvironmentConfig,
    project: ProjectConfig,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &str) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read {path}"))?;
    serde_json::from_str(&text).with_context(|| format!("parse {path}"))
}

fn parse_args() -> anyhow::Result<Args> {
    let mut parsed = Args {
        cfg: ClusterConfig::default(),
        environment: EnvironmentConfig::default(),
        project: ProjectConfig::new("demo"),
    };
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                parsed.cfg = read_json(&args[i + 1])?;
                i += 2;
            }
            "--addr" if i + 1 < args.len() => {
                parsed.cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                parsed.cfg.tick_hz = args[i + 1].parse().context("parse --tick-hz")?;
                i += 2;
            }
            "--environment" if i + 1 < args.len() => {
                parsed.environment = read_json(&args[i + 1])?;
                i += 2;
            }
            "--project" if i + 1 < args.len() => {
                parsed.project = read_json(&args[i + 1])?;
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(parsed)
}

/// A camera looking at a ring of spinning nodes. Returns the spinners.
fn build_scene(session: &mut Session) -> anyhow::Result<Vec<ObjectId>> {
    let mut camera = Camera::new("main");
    camera.look_at(Vec3::new(0.0, 2.0, 8.0), Vec3::ZERO);
    let camera = session.insert(camera)?;

    let mut spinners = Vec::new();
    for i in 0..8 {
        let angle = i as f32 * std::f32::consts::TAU / 8.0;
        let mut node = Transform::new(format!("spinner{i}"));
        node.set_position(Vec3::new(3.0 * angle.cos(), 0.0, 3.0 * angle.sin()));
        spinners.push(session.insert(node)?);
    }

    let mut root = NodeList::new("root");
    root.push(camera);
    for id in &spinners {
        root.push(*id);
    }
    session.insert(root)?;
    Ok(spinners)
}

fn animate(session: &mut Session, spinners: &[ObjectId], frame: u32) {
    for (i, id) in spinners.iter().enumerate() {
        if let Some(node) = session.get_mut::<Transform>(*id) {
            let speed = 0.01 * (i + 1) as f32;
            node.set_rotation(Quat::from_yaw(frame as f32 * speed));
        }
    }
}

fn log_report(report: &FrameReport) {
    for (phase, outcome) in [("update", &report.update), ("render", &report.render), ("swap", &report.swap)] {
        if let BarrierOutcome::Degraded { stalled } = outcome {
            warn!(frame = report.frame, phase, stalled = stalled.len(), "Degraded frame");
        }
    }
    if report.frame % 600 == 0 && report.swap.is_complete() {
        info!(frame = report.frame, "Frame");
    }
}

fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::ClientConnected { client, addr } => info!(client_id = %client, %addr, "Slave connected"),
        ServerEvent::ClientReady { client } => info!(client_id = %client, "Slave rendering"),
        ServerEvent::ClientStalled { client, phase, frame } => {
            warn!(client_id = %client, ?phase, frame, "Slave stalled")
        }
        ServerEvent::Input { client, data } => info!(client_id = %client, bytes = data.len(), "Input"),
        ServerEvent::Print { .. } => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Args {
        cfg,
        environment,
        project,
    } = parse_args()?;
    info!(addr = %cfg.server_addr, tick_hz = cfg.tick_hz, "Starting master");

    let tick_interval = cfg.tick();
    let mut server = ClusterServer::bind(cfg).await.context("create master")?;
    server.set_environment(environment).await?;
    server.set_project(project).await?;
    let spinners = build_scene(server.session_mut()).context("build scene")?;

    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Master ready. Type 'status' for info, 'quit' to exit.");
    println!();

    let mut frame = 0u32;
    let mut next_tick = tokio::time::Instant::now();
    loop {
        server.process_console_commands().await?;
        if server.quit_requested() {
            break;
        }

        frame += 1;
        animate(server.session_mut(), &spinners, frame);
        let report = server.run_frame(frame, Timestamp::now()).await?;
        log_report(&report);
        for event in server.drain_events() {
            log_event(&event);
        }

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }

    let acked = server.shutdown().await?;
    let stats = server.stats();
    info!(
        acked,
        frames = stats.frames_complete,
        degraded = stats.frames_degraded,
        "Master exiting"
    );
    Ok(())
}
