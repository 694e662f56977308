use crate::*;

use std::sync::Arc;

use scopelink_core::config::DiscoveryConfig;
use scopelink_services::{DemoHardware, MicroscopeHardware};
use scopelinkd::{RemoteClient, RemoteServer, ServiceExplorer};

fn explorer() -> ServiceExplorer {
    ServiceExplorer::start(&DiscoveryConfig {
        group: "127.0.0.1:0".into(),
        interval_ms: 20,
        ttl_ms: 60_000,
    })
    .unwrap()
}

/// A consumer finds a server by name, connects through the announced
/// ports, and sees it leave when the server closes.
#[test]
fn test_client_connects_to_a_discovered_server() {
    let mut explorer = explorer();

    let mut config = fast_config();
    config.remote.announce = true;
    config.remote.server_name = "confocal-2".into();
    config.discovery.group = explorer.local_addr().to_string();
    config.discovery.interval_ms = 20;

    let hardware = Arc::new(DemoHardware::new(Duration::from_millis(50)));
    let mut server = RemoteServer::bind(hardware, &config, LOOPBACK, LOOPBACK).unwrap();

    wait_for("announcement", WAIT, || explorer.find("confocal-2").is_some()).unwrap();
    let found = explorer.find("confocal-2").unwrap();
    assert_eq!(found.signal_addr(), server.signal_addr());
    assert_eq!(found.chunk_addr(), server.chunk_addr());

    let mut client = RemoteClient::connect_to(
        &found.signal_addr().to_string(),
        &found.chunk_addr().to_string(),
        &config,
    )
    .unwrap();
    let output = client.output();
    client.snap_slice();
    let slice = next_full_slice(&output).unwrap();
    assert_eq!(slice.data.map(|d| d.len()), Some(slice.size as usize));

    client.close();
    server.close();
    wait_for("goodbye", WAIT, || explorer.servers().is_empty()).unwrap();
    explorer.stop().join().unwrap();
}

/// Two servers on one group are listed separately, and closing one leaves
/// the other announced.
#[test]
fn test_servers_are_listed_until_they_leave() {
    let mut explorer = explorer();

    let start = |name: &str| {
        let mut config = fast_config();
        config.remote.announce = true;
        config.remote.server_name = name.into();
        config.discovery.group = explorer.local_addr().to_string();
        config.discovery.interval_ms = 20;
        let hardware = Arc::new(DemoHardware::new(Duration::from_millis(50)));
        RemoteServer::bind(hardware, &config, LOOPBACK, LOOPBACK).unwrap()
    };
    let mut alpha = start("alpha");
    let mut beta = start("beta");

    wait_for("both servers", WAIT, || explorer.servers().len() == 2).unwrap();
    let names: Vec<String> = explorer.servers().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["alpha", "beta"]);

    alpha.close();
    wait_for("alpha leaves", WAIT, || explorer.find("alpha").is_none()).unwrap();
    assert!(explorer.find("beta").is_some());

    beta.close();
    explorer.stop().join().unwrap();
}
