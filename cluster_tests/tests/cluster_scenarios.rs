//! Master and slaves on an in-process network.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use bytes::Bytes;
use cluster_client::ClusterClient;
use cluster_server::{
    fsm::{GlobalState, LinkSetup},
    BarrierOutcome, ClientId, ClusterServer, Phase, ServerEvent,
};
use cluster_shared::{
    config::{ClusterConfig, EnvironmentConfig, ProjectConfig},
    console::CvarValue,
    distributed::ObjectId,
    math::Vec3,
    message::{MessageType, Timestamp},
    objects::{Camera, Transform},
    session::Session,
    transport::{LinkConditions, MemoryNetwork, MemoryTransport},
};
use cluster_tests::{
    init_tracing, memory_master, poll_until, spawn_slave, spawn_slave_requesting, test_config, wait_ready,
    DroppingTransport, SharedLog, Slave,
};

/// A camera and `n` transforms. Returns the transforms.
fn build_scene(session: &mut Session, n: usize) -> Vec<ObjectId> {
    let mut camera = Camera::new("main");
    camera.look_at(Vec3::new(0.0, 1.0, 5.0), Vec3::ZERO);
    session.insert(camera).unwrap();
    (0..n)
        .map(|i| session.insert(Transform::new(format!("node{i}"))).unwrap())
        .collect()
}

fn step(session: &mut Session, nodes: &[ObjectId], frame: u32) {
    for (i, id) in nodes.iter().enumerate() {
        let node = session.get_mut::<Transform>(*id).unwrap();
        node.set_position(Vec3::new(frame as f32, i as f32, -(frame as f32)));
    }
}

fn assert_same_transforms(master: &Session, slave: &Session, nodes: &[ObjectId]) {
    for id in nodes {
        let expected = master.get::<Transform>(*id).unwrap();
        let got = slave
            .get::<Transform>(*id)
            .unwrap_or_else(|| panic!("object {id:?} missing on slave"));
        assert_eq!(got.name(), expected.name());
        assert_eq!(got.position(), expected.position(), "object {id:?}");
    }
}

fn client_at(server: &ClusterServer<MemoryTransport>, addr: SocketAddr) -> ClientId {
    server
        .clients()
        .into_iter()
        .find(|c| c.addr == addr)
        .map(|c| c.id)
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn environment_set_after_request_still_reaches_slave() {
    init_tracing();
    let net = MemoryNetwork::new(1);
    let mut server = ClusterServer::new(net.bind(), test_config());
    let master = server.local_addr().unwrap();
    let slave = spawn_slave(&net, master, test_config()).unwrap();

    poll_until(&mut server, Duration::from_secs(2), |s| {
        s.clients().iter().any(|c| c.setup == LinkSetup::InitRequested)
    })
    .await
    .unwrap();
    assert_eq!(server.global_state(), GlobalState::Initing);
    assert_eq!(server.ready_clients(), 0);

    let environment = EnvironmentConfig {
        name: "wall".into(),
        ..EnvironmentConfig::default()
    };
    server.set_environment(environment).await.unwrap();
    server.set_project(ProjectConfig::new("museum")).await.unwrap();
    wait_ready(&mut server, 1).await.unwrap();
    assert_eq!(server.global_state(), GlobalState::NotRendering);

    assert_eq!(server.shutdown().await.unwrap(), 1);
    let client = slave.join().await.unwrap();
    assert!(client.is_terminated());
    assert_eq!(client.environment().unwrap().name, "wall");
    assert_eq!(client.project().unwrap().name, "museum");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_frames_replicate_the_scene() {
    init_tracing();
    let net = MemoryNetwork::new(2);
    let mut server = memory_master(&net, test_config()).await.unwrap();
    let nodes = build_scene(server.session_mut(), 3);
    let master = server.local_addr().unwrap();
    let a = spawn_slave(&net, master, test_config()).unwrap();
    let b = spawn_slave(&net, master, test_config()).unwrap();
    wait_ready(&mut server, 2).await.unwrap();

    for frame in 1..=5 {
        step(server.session_mut(), &nodes, frame);
        let report = server.run_frame(frame, Timestamp::now()).await.unwrap();
        assert!(report.update.is_complete(), "frame {frame}: {:?}", report.update);
        assert!(report.render.is_complete(), "frame {frame}: {:?}", report.render);
        assert!(report.swap.is_complete(), "frame {frame}: {:?}", report.swap);
    }
    assert_eq!(server.stats().frames_complete, 5);
    assert_eq!(server.global_state(), GlobalState::NotRendering);

    assert_eq!(server.shutdown().await.unwrap(), 2);
    for slave in [a, b] {
        let log = slave.log.clone();
        let client = slave.join().await.unwrap();
        assert_same_transforms(server.session(), client.session(), &nodes);
        assert_eq!(client.last_applied_frame(), 5);
        assert_eq!(log.presented(), vec![1, 2, 3, 4, 5]);
        let last = log.frames().last().cloned().unwrap();
        assert_eq!(last.frame, 5);
        assert_eq!(last.objects, 4);
        assert_eq!(last.transforms, 3);
        assert_eq!(last.camera.as_deref(), Some("main"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_slave_degrades_one_frame_then_rejoins() {
    init_tracing();
    let net = MemoryNetwork::new(3);
    let mut server = memory_master(&net, test_config()).await.unwrap();
    let nodes = build_scene(server.session_mut(), 2);
    let master = server.local_addr().unwrap();
    let a = spawn_slave(&net, master, test_config()).unwrap();
    let b = spawn_slave(&net, master, test_config()).unwrap();
    wait_ready(&mut server, 2).await.unwrap();
    let b_id = client_at(&server, b.addr);

    for frame in 1..=6 {
        step(server.session_mut(), &nodes, frame);
        assert!(server.run_frame(frame, Timestamp::now()).await.unwrap().swap.is_complete());
    }
    server.drain_events();

    net.block(b.addr, master);
    step(server.session_mut(), &nodes, 7);
    let update = server.update(7, Timestamp::now()).await.unwrap();
    assert_eq!(update, BarrierOutcome::Degraded { stalled: vec![b_id] });
    assert!(server.render(7).await.unwrap().is_complete());
    assert!(server.swap(7).await.unwrap().is_complete());
    assert_eq!(server.stats().frames_degraded, 1);
    assert!(server.drain_events().iter().any(|e| matches!(
        e,
        ServerEvent::ClientStalled { client, phase: Phase::Update, frame: 7 } if *client == b_id
    )));
    assert_eq!(server.client(b_id).unwrap().stalls, 1);

    net.unblock(b.addr, master);
    step(server.session_mut(), &nodes, 8);
    let report = server.run_frame(8, Timestamp::now()).await.unwrap();
    assert!(report.update.is_complete(), "{:?}", report.update);
    assert!(report.swap.is_complete(), "{:?}", report.swap);
    assert_eq!(server.client(b_id).unwrap().acked.draw_done, 8);

    server.shutdown().await.unwrap();
    let a_log = a.log.clone();
    let b_log = b.log.clone();
    a.join().await.unwrap();
    let b_client = b.join().await.unwrap();
    assert_eq!(a_log.presented(), (1..=8).collect::<Vec<_>>());
    assert_eq!(b_log.presented(), vec![1, 2, 3, 4, 5, 6, 8]);
    assert_same_transforms(server.session(), b_client.session(), &nodes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_joiner_starts_from_a_snapshot() {
    init_tracing();
    let net = MemoryNetwork::new(4);
    let mut server = memory_master(&net, test_config()).await.unwrap();
    let nodes = build_scene(server.session_mut(), 4);
    let master = server.local_addr().unwrap();
    let early = spawn_slave(&net, master, test_config()).unwrap();
    wait_ready(&mut server, 1).await.unwrap();

    for frame in 1..=3 {
        step(server.session_mut(), &nodes, frame);
        assert!(server.run_frame(frame, Timestamp::now()).await.unwrap().swap.is_complete());
    }
    let extra = server.session_mut().insert(Transform::new("late")).unwrap();

    let late = spawn_slave(&net, master, test_config()).unwrap();
    wait_ready(&mut server, 2).await.unwrap();
    step(server.session_mut(), &nodes, 4);
    let report = server.run_frame(4, Timestamp::now()).await.unwrap();
    assert!(report.update.is_complete(), "{:?}", report.update);
    assert!(report.swap.is_complete(), "{:?}", report.swap);

    server.shutdown().await.unwrap();
    let late_log = late.log.clone();
    early.join().await.unwrap();
    let client = late.join().await.unwrap();
    assert_eq!(late_log.presented(), vec![4]);
    assert_eq!(client.last_applied_frame(), 4);
    assert_same_transforms(server.session(), client.session(), &nodes);
    assert!(client.session().get::<Transform>(extra).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lossy_network_converges_once_clean() {
    init_tracing();
    let config = ClusterConfig {
        barrier_timeout_ms: 100,
        ..test_config()
    };
    let net = MemoryNetwork::new(5);
    let mut server = memory_master(&net, config.clone()).await.unwrap();
    let nodes = build_scene(server.session_mut(), 5);
    let master = server.local_addr().unwrap();
    let a = spawn_slave(&net, master, config.clone()).unwrap();
    let b = spawn_slave(&net, master, config.clone()).unwrap();
    wait_ready(&mut server, 2).await.unwrap();

    net.set_conditions(LinkConditions {
        loss: 0.05,
        reorder: 0.05,
    });
    let mut frame = 0;
    while frame < 20 {
        frame += 1;
        step(server.session_mut(), &nodes, frame);
        server.run_frame(frame, Timestamp::now()).await.unwrap();
    }
    assert!(net.stats().lost > 0);

    net.set_conditions(LinkConditions::PERFECT);
    let mut converged = false;
    while frame < 100 && !converged {
        frame += 1;
        step(server.session_mut(), &nodes, frame);
        server.run_frame(frame, Timestamp::now()).await.unwrap();
        converged = server.clients().iter().all(|c| c.acked.draw_done == frame);
    }
    assert!(converged, "slaves still behind at frame {frame}");

    assert_eq!(server.shutdown().await.unwrap(), 2);
    for slave in [a, b] {
        let log = slave.log.clone();
        let client = slave.join().await.unwrap();
        assert_eq!(log.presented().last(), Some(&frame));
        assert_same_transforms(server.session(), client.session(), &nodes);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lost_create_is_recovered_by_resync() {
    init_tracing();
    let config = ClusterConfig {
        barrier_timeout_ms: 100,
        ..test_config()
    };
    let net = MemoryNetwork::new(8);
    let mut server = memory_master(&net, config.clone()).await.unwrap();
    let nodes = build_scene(server.session_mut(), 2);
    let master = server.local_addr().unwrap();

    let transport = DroppingTransport::new(net.bind());
    let log = SharedLog::default();
    let client = ClusterClient::new(transport.clone(), master, config, Box::new(log.clone()));
    let slave = Slave::spawn(client, log, Vec::new()).unwrap();
    wait_ready(&mut server, 1).await.unwrap();

    // Created once and never touched again, so no update ever names it.
    transport.drop_incoming(MessageType::SgCreate);
    let fixed = server.session_mut().insert(Transform::new("static")).unwrap();

    let mut frame = 0;
    let mut converged = false;
    while frame < 30 && !converged {
        frame += 1;
        step(server.session_mut(), &nodes, frame);
        server.run_frame(frame, Timestamp::now()).await.unwrap();
        converged = server.clients().iter().all(|c| c.acked.draw_done == frame);
    }
    assert!(converged, "slave still behind at frame {frame}");
    assert!(server.stats().snapshots_sent >= 2);

    assert_eq!(server.shutdown().await.unwrap(), 1);
    let client = slave.join().await.unwrap();
    assert!(client.stats().resyncs_requested >= 1);
    assert_eq!(client.session().get::<Transform>(fixed).map(Transform::name), Some("static"));
    assert_same_transforms(server.session(), client.session(), &nodes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slave_input_reaches_the_master() {
    init_tracing();
    let net = MemoryNetwork::new(9);
    let mut server = memory_master(&net, test_config()).await.unwrap();
    let master = server.local_addr().unwrap();
    let log = SharedLog::default();
    let client = ClusterClient::new(net.bind(), master, test_config(), Box::new(log.clone()));
    let input = vec![Bytes::from_static(b"key:space"), Bytes::from_static(b"pointer:12,40")];
    let slave = Slave::spawn_with_input(client, log, input.clone()).unwrap();
    wait_ready(&mut server, 1).await.unwrap();
    let id = client_at(&server, slave.addr);

    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while received.len() < input.len() && Instant::now() < deadline {
        server.poll().await.unwrap();
        received.extend(server.drain_events().into_iter().filter_map(|event| match event {
            ServerEvent::Input { client, data } if client == id => Some(data),
            _ => None,
        }));
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(received, input);

    assert_eq!(server.shutdown().await.unwrap(), 1);
    slave.join().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_command_output_comes_back_as_print() {
    init_tracing();
    let net = MemoryNetwork::new(6);
    let mut server = memory_master(&net, test_config()).await.unwrap();
    let master = server.local_addr().unwrap();
    let slave = spawn_slave(&net, master, test_config()).unwrap();
    wait_ready(&mut server, 1).await.unwrap();
    let id = client_at(&server, slave.addr);
    server.drain_events();

    let out = server.exec_console(&format!("output {id}")).await.unwrap();
    assert_eq!(out, vec!["Output registered on 1 slave(s)".to_string()]);
    let out = server.exec_console(&format!("cmd {id} r_show_stats 1")).await.unwrap();
    assert_eq!(out, vec!["Sent to 1 slave(s)".to_string()]);

    let mut printed = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while printed.is_empty() && Instant::now() < deadline {
        server.poll().await.unwrap();
        for event in server.drain_events() {
            if let ServerEvent::Print { client, text } = event {
                assert_eq!(client, id);
                printed.push(text);
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(printed.len(), 1);
    assert!(printed[0].starts_with("r_show_stats = "), "{}", printed[0]);

    server.shutdown().await.unwrap();
    let client = slave.join().await.unwrap();
    assert_eq!(client.console().get_cvar("r_show_stats"), Some(&CvarValue::Bool(true)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_resource_crosses_in_many_parts() {
    init_tracing();
    let net = MemoryNetwork::new(7);
    let mut server = memory_master(&net, test_config()).await.unwrap();
    let atlas: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    server.resources_mut().insert("atlas", atlas.clone());
    let master = server.local_addr().unwrap();
    let slave = spawn_slave_requesting(&net, master, test_config(), &["atlas", "missing"]).unwrap();
    wait_ready(&mut server, 1).await.unwrap();

    server.shutdown().await.unwrap();
    let client = slave.join().await.unwrap();
    assert_eq!(client.resource("atlas").as_deref(), Some(&atlas[..]));
    assert!(client.resource("missing").is_none());
    assert!(net.stats().delivered > (atlas.len() / 1454) as u64);
}
