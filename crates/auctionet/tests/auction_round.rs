// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test/bench code readability over pedantic
#![allow(clippy::float_cmp)] // Test assertions with constants
#![allow(clippy::missing_panics_doc)] // Tests/examples panic on failure

//! Agent and server over loopback UDP
//!
//! Both nodes are configured from files on disk, exactly as the CLI does.

use auctionet::{
    AuctionAgent, AuctionServer, Definitions, ModuleConfig, ModuleLoader, NodeConfig, ObjectKey,
    ObjectKind,
};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn write_temp(content: &str, suffix: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

const SERVER_TOML: &str = r#"
name = "test-server"

[server]
bind_address = "127.0.0.1"
port = 0

[protocol]
handshake_timeout_ms = 2000

[modules.first_price]
capacity = "10"
"#;

const AUCTIONS_JSON: &str = r#"{
    "resources": [{ "key": "res.bw" }],
    "auctions": [{
        "key": "auctions.bw1", "resource": "res.bw", "module": "first_price",
        "duration_ms": 1500, "interval_ms": 300
    }]
}"#;

const REQUESTS_JSON: &str = r#"{
    "requests": [{
        "key": "requests.r1", "resource": "res.bw", "module": "fixed_bidder",
        "intervals": [{ "duration_ms": 1000, "params": { "budget": "6", "quantity": "2" } }]
    }]
}"#;

async fn start_server() -> Arc<AuctionServer> {
    let config_file = write_temp(SERVER_TOML, ".toml");
    let config = NodeConfig::from_file(config_file.path()).unwrap();
    let server = Arc::new(AuctionServer::bind(config, ModuleLoader::with_builtin()).await.unwrap());

    let defs_file = write_temp(AUCTIONS_JSON, ".json");
    let report = server.load_definitions(&Definitions::from_file(defs_file.path()).unwrap());
    assert_eq!(report.auctions, 1);
    assert!(report.rejected.is_empty(), "{:?}", report.rejected);

    let runner = Arc::clone(&server);
    tokio::spawn(async move { runner.run().await });
    server
}

fn agent_config(server: SocketAddr, handshake_timeout_ms: u64) -> NodeConfig {
    let mut config = NodeConfig {
        name: "test-agent".into(),
        ..NodeConfig::default()
    };
    config.agent.server_address = server.to_string();
    config.agent.bind_address = "127.0.0.1".into();
    config.protocol.handshake_timeout_ms = handshake_timeout_ms;
    config
        .modules
        .insert("fixed_bidder".into(), ModuleConfig::new().with("max_price", "100"));

    // Through the file format, as the CLI loads it.
    let file = write_temp(&config.to_toml().unwrap(), ".toml");
    NodeConfig::from_file(file.path()).unwrap()
}

async fn start_agent(config: NodeConfig) -> Arc<AuctionAgent> {
    let agent = Arc::new(AuctionAgent::from_config(config, ModuleLoader::with_builtin()).unwrap());
    let defs = Definitions::from_json_str(REQUESTS_JSON).unwrap();
    assert_eq!(agent.load_definitions(&defs).requests, 1);

    let runner = Arc::clone(&agent);
    tokio::spawn(async move { runner.run().await });
    agent
}

async fn wait_for(what: &str, timeout: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_round_delivers_allocations_to_the_agent() {
    let server = start_server().await;
    let server_addr = server.local_addr().unwrap();
    let agent = start_agent(agent_config(server_addr, 2_000)).await;
    let mut allocations = agent.subscribe_allocations();

    let allocation = tokio::time::timeout(Duration::from_secs(5), allocations.recv())
        .await
        .expect("allocation within the auction window")
        .unwrap();
    assert_eq!(allocation.auction, ObjectKey::new("auctions", "bw1"));
    assert_eq!(allocation.module, "first_price");
    assert_eq!(allocation.total_quantity(), 2.0);
    assert_eq!(allocation.elements[0].unit_price, 3.0);
    assert!(allocation.start < allocation.stop);

    // The request interval ends: four-way close, then every reference goes.
    wait_for("agent session teardown", Duration::from_secs(5), || {
        agent.active_intervals() == 0
    })
    .await;
    wait_for("server session teardown", Duration::from_secs(2), || {
        server.context().sessions().live_len() == 0
    })
    .await;

    let auction = ObjectKey::new("auctions", "bw1");
    assert!(agent
        .context()
        .registry()
        .lookup(ObjectKind::Auction, &auction)
        .is_archived());
    assert_eq!(server.context().registry().auction(&auction).unwrap().session_refs, 0);
    assert!(!agent.allocations().is_empty());
    assert!(agent.context().endpoint().connections().is_empty());

    agent.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn unreachable_server_times_out_the_handshake() {
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let agent = start_agent(agent_config(silent.local_addr().unwrap(), 200)).await;

    wait_for("the session to open", Duration::from_secs(2), || {
        agent.active_intervals() == 1
    })
    .await;
    wait_for("the handshake timeout", Duration::from_secs(3), || {
        agent.active_intervals() == 0
    })
    .await;
    assert_eq!(agent.context().sessions().live_len(), 0);
    assert_eq!(agent.context().sessions().archived_len(), 1);
    assert!(agent.allocations().is_empty());
    agent.shutdown();
}

#[test]
fn generated_style_config_round_trips_through_a_file() {
    let mut config = NodeConfig::default();
    config.server.port = 0;
    config
        .modules
        .insert("first_price".into(), ModuleConfig::new().with("capacity", "4"));
    let file = write_temp(&config.to_toml().unwrap(), ".toml");
    assert_eq!(NodeConfig::from_file(file.path()).unwrap(), config);

    let bad = write_temp("[protocol]\nqueue_depth = 0\n", ".toml");
    assert!(NodeConfig::from_file(bad.path()).is_err());
}
