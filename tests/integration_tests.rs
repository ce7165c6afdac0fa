//! Integration tests for the frame relay
//!
//! These tests run the real TCP listeners and drive them the way a simulator
//! and viewers would.

use feeder::network::FeedClient;
use feeder::sim::Simulation;
use rand::rngs::StdRng;
use rand::SeedableRng;
use server::config::ServerConfig;
use server::distributor::{LiveDistributor, SeekMode};
use server::network::Server;
use shared::roads::RoadNetwork;
use shared::{read_packet, write_packet, IngestReply, Packet, Point2D};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

struct Relay {
    viewer_addr: SocketAddr,
    ingest_addr: SocketAddr,
    distributor: Arc<LiveDistributor>,
}

async fn start_relay(config: ServerConfig) -> Relay {
    let store = tokio_test::assert_ok!(config.initial_store());
    let distributor = Arc::new(
        LiveDistributor::new(store, config.outbox_capacity).with_seek_mode(config.seek_mode),
    );
    let server = Server::bind(&config, Arc::clone(&distributor)).await.unwrap();
    let relay = Relay {
        viewer_addr: server.viewer_addr().unwrap(),
        ingest_addr: server.ingest_addr().unwrap(),
        distributor,
    };
    tokio::spawn(server.run());
    relay
}

/// Raw JSON-lines simulator connection.
struct Simulator {
    lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Simulator {
    async fn connect(addr: SocketAddr) -> Self {
        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Simulator {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send(&mut self, line: &str) -> IngestReply {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        let reply = timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .expect("timed out waiting for reply")
            .unwrap()
            .expect("relay closed connection");
        serde_json::from_str(&reply).unwrap()
    }
}

async fn connect_viewer(relay: &Relay) -> TcpStream {
    let before = relay.distributor.session_count().await;
    let stream = TcpStream::connect(relay.viewer_addr).await.unwrap();
    timeout(Duration::from_secs(2), async {
        while relay.distributor.session_count().await <= before {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("viewer was never registered");
    stream
}

async fn next_packet(stream: &mut TcpStream) -> Packet {
    timeout(Duration::from_secs(2), read_packet(stream))
        .await
        .expect("timed out waiting for packet")
        .unwrap()
        .expect("relay closed connection")
}

async fn assert_silent(stream: &mut TcpStream) {
    let result = timeout(Duration::from_millis(100), read_packet(stream)).await;
    assert!(result.is_err(), "expected no packet, got {:?}", result);
}

fn frame_index(packet: &Packet) -> u64 {
    match packet {
        Packet::Frame(update) => update.frame_index,
        other => panic!("Expected frame push, got {:?}", other),
    }
}

/// VIEWER PROTOCOL TESTS
mod protocol_tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Tests that packets survive a real TCP connection with framing intact
    #[tokio::test]
    async fn framing_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let echo = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            while let Some(packet) = read_packet(&mut stream).await.unwrap() {
                write_packet(&mut stream, &packet).await.unwrap();
            }
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let packets = vec![
            Packet::Subscribe,
            Packet::RequestFrame { index: -1 },
            Packet::Error {
                reason: "x".repeat(10_000),
            },
        ];
        for packet in &packets {
            write_packet(&mut client, packet).await.unwrap();
        }
        for packet in &packets {
            assert_eq!(&next_packet(&mut client).await, packet);
        }

        drop(client);
        echo.await.unwrap();
    }
}

/// END-TO-END RELAY TESTS
mod relay_tests {
    use super::*;

    /// Tests the identity-ingest scenario end to end
    #[tokio::test]
    async fn ingest_reaches_store_and_viewer() {
        let relay = start_relay(ServerConfig::ephemeral()).await;
        let mut viewer = connect_viewer(&relay).await;
        let mut sim = Simulator::connect(relay.ingest_addr).await;

        let reply = sim
            .send(r#"[{"id":1,"x":0,"y":0},{"id":2,"x":10,"y":10}]"#)
            .await;
        assert_eq!(
            reply,
            IngestReply::Success {
                frame: 0,
                accepted: 2,
                rejected: Vec::new()
            }
        );

        match next_packet(&mut viewer).await {
            Packet::Frame(update) => {
                assert_eq!(update.frame_index, 0);
                assert_eq!(update.total_frames, 1);
                assert_eq!(update.agents.len(), 2);
                assert_eq!(update.agents[1].position(), Point2D::new(10.0, 10.0));
            }
            other => panic!("Expected frame push, got {:?}", other),
        }
    }

    /// Tests late-joiner catch-up without backlog replay
    #[tokio::test]
    async fn late_joiner_gets_exactly_latest_frame() {
        let relay = start_relay(ServerConfig::ephemeral()).await;
        let mut sim = Simulator::connect(relay.ingest_addr).await;
        for i in 0..5 {
            let reply = sim.send(&format!(r#"[{{"id":1,"x":{},"y":0}}]"#, i)).await;
            assert!(matches!(reply, IngestReply::Success { .. }));
        }

        let mut viewer = connect_viewer(&relay).await;
        let packet = next_packet(&mut viewer).await;
        assert_eq!(frame_index(&packet), 4);
        assert_silent(&mut viewer).await;
    }

    /// Tests that a fully malformed batch stores nothing
    #[tokio::test]
    async fn malformed_batch_is_rejected() {
        let relay = start_relay(ServerConfig::ephemeral()).await;
        let mut sim = Simulator::connect(relay.ingest_addr).await;

        let reply = sim.send(r#"[{"id":1,"x":"bad","y":0}]"#).await;
        match reply {
            IngestReply::Error { rejected, .. } => {
                assert_eq!(rejected.len(), 1);
                assert_eq!(rejected[0].position, 0);
            }
            other => panic!("Expected error reply, got {:?}", other),
        }
        assert_eq!(relay.distributor.total_frames().await, 0);

        // the connection stays usable
        let reply = sim.send(r#"[{"id":1,"x":1,"y":1}]"#).await;
        assert!(matches!(reply, IngestReply::Success { frame: 0, .. }));
    }

    /// Tests that pausing freezes viewers while frames keep being stored
    #[tokio::test]
    async fn pause_freezes_viewers_but_not_history() {
        let relay = start_relay(ServerConfig::ephemeral()).await;
        let mut sim = Simulator::connect(relay.ingest_addr).await;
        sim.send(r#"[{"id":1,"x":0,"y":0}]"#).await;

        let mut viewer = connect_viewer(&relay).await;
        assert_eq!(frame_index(&next_packet(&mut viewer).await), 0);

        write_packet(&mut viewer, &Packet::Pause).await.unwrap();
        match next_packet(&mut viewer).await {
            Packet::Playback(status) => {
                assert!(status.is_paused);
                assert_eq!(status.current_frame, 0);
            }
            other => panic!("Expected playback status, got {:?}", other),
        }

        for _ in 0..3 {
            sim.send(r#"[{"id":1,"x":5,"y":5}]"#).await;
        }
        assert_silent(&mut viewer).await;

        write_packet(&mut viewer, &Packet::Resume).await.unwrap();
        match next_packet(&mut viewer).await {
            Packet::Playback(status) => {
                assert!(!status.is_paused);
                assert_eq!(status.total_frames, 4);
            }
            other => panic!("Expected playback status, got {:?}", other),
        }

        let mut late = connect_viewer(&relay).await;
        assert_eq!(frame_index(&next_packet(&mut late).await), 3);

        sim.send(r#"[{"id":1,"x":6,"y":6}]"#).await;
        assert_eq!(frame_index(&next_packet(&mut viewer).await), 4);
    }

    /// Tests that a seek answers only the requesting viewer
    #[tokio::test]
    async fn per_session_seek() {
        let relay = start_relay(ServerConfig::ephemeral()).await;
        let mut sim = Simulator::connect(relay.ingest_addr).await;
        for _ in 0..3 {
            sim.send("[]").await;
        }

        let mut a = connect_viewer(&relay).await;
        let mut b = connect_viewer(&relay).await;
        assert_eq!(frame_index(&next_packet(&mut a).await), 2);
        assert_eq!(frame_index(&next_packet(&mut b).await), 2);

        write_packet(&mut a, &Packet::RequestFrame { index: 0 }).await.unwrap();
        assert_eq!(frame_index(&next_packet(&mut a).await), 0);
        assert_silent(&mut b).await;

        write_packet(&mut a, &Packet::RequestFrame { index: 3 }).await.unwrap();
        assert!(matches!(next_packet(&mut a).await, Packet::Error { .. }));
        assert_eq!(relay.distributor.playback_status().await.current_frame, 2);
    }

    /// Tests the explicit shared-timeline seek mode
    #[tokio::test]
    async fn shared_seek_moves_everyone() {
        let mut config = ServerConfig::ephemeral();
        config.seek_mode = SeekMode::Shared;
        let relay = start_relay(config).await;
        let mut sim = Simulator::connect(relay.ingest_addr).await;
        for _ in 0..3 {
            sim.send("[]").await;
        }

        let mut a = connect_viewer(&relay).await;
        let mut b = connect_viewer(&relay).await;
        next_packet(&mut a).await;
        next_packet(&mut b).await;

        write_packet(&mut a, &Packet::RequestFrame { index: 1 }).await.unwrap();
        assert_eq!(frame_index(&next_packet(&mut a).await), 1);
        assert_eq!(frame_index(&next_packet(&mut b).await), 1);
        assert_eq!(relay.distributor.playback_status().await.current_frame, 1);
    }

    /// Tests that unsubscribed viewers stop receiving live frames
    #[tokio::test]
    async fn unsubscribe_and_resubscribe() {
        let relay = start_relay(ServerConfig::ephemeral()).await;
        let mut sim = Simulator::connect(relay.ingest_addr).await;
        let mut viewer = connect_viewer(&relay).await;

        write_packet(&mut viewer, &Packet::Unsubscribe).await.unwrap();
        // an acknowledged control round trip guarantees the unsubscribe landed
        write_packet(&mut viewer, &Packet::RequestFrame { index: 0 }).await.unwrap();
        assert!(matches!(next_packet(&mut viewer).await, Packet::Error { .. }));

        sim.send("[]").await;
        sim.send("[]").await;
        assert_silent(&mut viewer).await;

        write_packet(&mut viewer, &Packet::Subscribe).await.unwrap();
        assert_eq!(frame_index(&next_packet(&mut viewer).await), 1);
    }

    /// Tests the settings round trip between viewers and the simulator
    #[tokio::test]
    async fn settings_flow_from_viewer_to_simulator() {
        let relay = start_relay(ServerConfig::ephemeral()).await;
        let mut viewer = connect_viewer(&relay).await;
        let mut sim = Simulator::connect(relay.ingest_addr).await;

        let mut settings = shared::SimSettings::default();
        settings.sim_speed = 4.0;
        settings.policies.insert("switch2".to_string(), true);
        write_packet(&mut viewer, &Packet::UpdateSettings(settings.clone()))
            .await
            .unwrap();
        assert_eq!(next_packet(&mut viewer).await, Packet::Settings(settings.clone()));

        let reply = sim.send(r#"{"command":"get_settings"}"#).await;
        assert_eq!(reply, IngestReply::Settings { settings });
    }

    /// Tests that calibrated positions arrive in display space
    #[tokio::test]
    async fn calibration_maps_ingested_positions() {
        let mut config = ServerConfig::ephemeral();
        let src = [
            Point2D::new(0.0, 0.0),
            Point2D::new(1.0, 0.0),
            Point2D::new(1.0, 1.0),
            Point2D::new(0.0, 1.0),
        ];
        let dst = [
            Point2D::new(100.0, 200.0),
            Point2D::new(300.0, 200.0),
            Point2D::new(300.0, 400.0),
            Point2D::new(100.0, 400.0),
        ];
        config.mapper = server::mapper::CoordinateMapper::fit(&src, &dst).unwrap();
        let relay = start_relay(config).await;
        let mut sim = Simulator::connect(relay.ingest_addr).await;

        sim.send(r#"[{"id":9,"x":0.5,"y":0.25}]"#).await;

        let frame = relay.distributor.latest().await.unwrap();
        assert_approx_eq::assert_approx_eq!(frame.agents[0].position.x, 200.0, 1e-6);
        assert_approx_eq::assert_approx_eq!(frame.agents[0].position.y, 250.0, 1e-6);
    }

    /// Tests that a restored snapshot keeps indices and serves late joiners
    #[tokio::test]
    async fn restore_from_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.json");
        std::fs::write(
            &path,
            r#"{"total_frames":2,"first_index":10,"frames":[[{"id":1,"x":1.0,"y":1.0}],[{"id":1,"x":2.0,"y":2.0}]]}"#,
        )
        .unwrap();

        let mut config = ServerConfig::ephemeral();
        config.restore = true;
        config.snapshot_path = path;
        let relay = start_relay(config).await;

        let mut viewer = connect_viewer(&relay).await;
        match next_packet(&mut viewer).await {
            Packet::Frame(update) => {
                assert_eq!(update.frame_index, 11);
                assert_eq!(update.total_frames, 12);
            }
            other => panic!("Expected frame push, got {:?}", other),
        }

        let mut sim = Simulator::connect(relay.ingest_addr).await;
        let reply = sim.send("[]").await;
        assert!(matches!(reply, IngestReply::Success { frame: 12, .. }));
    }
}

/// FEEDER TESTS
mod feeder_tests {
    use super::*;

    /// Tests the feeder binary's loop against a real relay
    #[tokio::test]
    async fn feeder_streams_into_relay() {
        let relay = start_relay(ServerConfig::ephemeral()).await;
        let network = RoadNetwork::from_polylines(vec![vec![
            Point2D::new(0.0, 0.0),
            Point2D::new(50.0, 0.0),
            Point2D::new(50.0, 50.0),
        ]]);
        let mut sim = Simulation::new(network, 6, 1.0, StdRng::seed_from_u64(11));

        let mut client = FeedClient::connect(&relay.ingest_addr.to_string())
            .await
            .unwrap();
        feeder::network::run(&mut client, &mut sim, Duration::from_millis(1), 2, Some(5))
            .await
            .unwrap();

        assert_eq!(relay.distributor.total_frames().await, 5);
        let latest = relay.distributor.latest().await.unwrap();
        assert_eq!(latest.agents.len(), 6);
    }
}

/// STRESS TESTS
mod stress_tests {
    use super::*;

    /// Tests that many viewers all receive a burst of frames
    #[tokio::test]
    async fn many_viewers_receive_live_frames() {
        let relay = start_relay(ServerConfig::ephemeral()).await;
        let mut viewers = Vec::new();
        for _ in 0..20 {
            viewers.push(connect_viewer(&relay).await);
        }

        let mut sim = Simulator::connect(relay.ingest_addr).await;
        sim.send(r#"[{"id":1,"x":0,"y":0}]"#).await;

        for viewer in &mut viewers {
            assert_eq!(frame_index(&next_packet(viewer).await), 0);
        }
    }

    /// Tests that a viewer that never reads does not stall ingestion
    #[tokio::test]
    async fn stalled_viewer_does_not_block_ingest() {
        let relay = start_relay(ServerConfig::ephemeral()).await;
        let _stalled = connect_viewer(&relay).await;
        let mut sim = Simulator::connect(relay.ingest_addr).await;

        let agents: Vec<String> = (0..200)
            .map(|i| format!(r#"{{"id":{},"x":{},"y":{}}}"#, i, i, i))
            .collect();
        let batch = format!("[{}]", agents.join(","));

        let result = timeout(Duration::from_secs(10), async {
            for _ in 0..300 {
                sim.send(&batch).await;
            }
        })
        .await;

        assert!(result.is_ok(), "ingest stalled behind a slow viewer");
        assert_eq!(relay.distributor.total_frames().await, 300);
    }
}
