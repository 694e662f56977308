use crate::*;

use std::sync::Arc;

use scopelink_core::signal::{ServerState, Stack};
use scopelink_services::{DemoHardware, MicroscopeHardware};
use scopelinkd::{RemoteClient, RemoteServer};

/// Demo slices are 50 x 50 single-byte pixels.
const DEMO_SLICE_BYTES: usize = 2500;

fn start_pair(config: &ScopeLinkConfig) -> (RemoteServer, RemoteClient) {
    let hardware = Arc::new(DemoHardware::new(Duration::from_millis(50)));
    let server = RemoteServer::bind(hardware, config, LOOPBACK, LOOPBACK).unwrap();
    let client = RemoteClient::connect_to(
        &server.signal_addr().to_string(),
        &server.chunk_addr().to_string(),
        config,
    )
    .unwrap();
    wait_for("sign-on", WAIT, || server.connected_clients() == 1).unwrap();
    (server, client)
}

/// A slice larger than the inline limit goes through the cache and the
/// chunk protocol, and reaches the client with its payload attached.
#[test]
fn test_large_slice_is_pulled_through_the_cache() {
    let config = fast_config();
    let (mut server, mut client) = start_pair(&config);
    let output = client.output();

    client.snap_slice();
    let slice = next_full_slice(&output).unwrap();

    assert_eq!(slice.size as usize, DEMO_SLICE_BYTES);
    let data = slice.data.clone().unwrap();
    assert_eq!(data.len(), DEMO_SLICE_BYTES);
    assert_eq!(server.cache().get(slice.id), Some(data));
    assert_eq!(client.pending_slices(), 0);

    client.close();
    server.close();
}

/// Under the inline limit the payload rides on the signal session and the
/// cache is never touched.
#[test]
fn test_small_slice_travels_inline() {
    let mut config = fast_config();
    config.remote.inline_payload_limit = 3000;
    let (mut server, mut client) = start_pair(&config);
    let output = client.output();

    client.snap_slice();
    let slice = next_full_slice(&output).unwrap();
    assert_eq!(slice.data.map(|d| d.len()), Some(DEMO_SLICE_BYTES));
    assert!(server.cache().is_empty());

    client.close();
    server.close();
}

/// The client mirrors the server's dimensions and status, and follows
/// stage moves.
#[test]
fn test_client_mirrors_hardware_state() {
    let config = fast_config();
    let (mut server, mut client) = start_pair(&config);

    wait_for("dimensions", WAIT, || client.dimensions().image_size.x == 50).unwrap();
    wait_for("server name", WAIT, || client.server_name().is_some()).unwrap();
    assert_eq!(client.server_name().as_deref(), Some(config.remote.server_name.as_str()));
    wait_for("remote status", WAIT, || {
        client
            .remote_status()
            .is_some_and(|s| s.connected_clients == 1)
    })
    .unwrap();

    let target = scopelink_core::signal::Vec3::new(10.0, 20.0, 30.0);
    client.move_stage(target);
    wait_for("stage move", WAIT, || client.status().stage_position == target).unwrap();
    assert_eq!(client.status().state, ServerState::Manual);

    client.close();
    server.close();
}

/// With acquire-on-connect, a new client gets a stack acquired for it, and
/// a later client gets the same stack resent.
#[test]
fn test_acquire_on_connect_sends_a_stack() {
    let mut config = fast_config();
    config.remote.acquire_on_connect = true;
    let (mut server, mut first) = start_pair(&config);

    let stack = next_matching(&first.output(), WAIT, |signal| match signal {
        MicroscopeSignal::Stack(stack) => Some(stack),
        _ => None,
    })
    .unwrap();
    let slice = next_full_slice(&first.output()).unwrap();
    assert_eq!(slice.stack.map(|m| m.stack_id), Some(stack.id));

    let mut second = RemoteClient::connect_to(
        &server.signal_addr().to_string(),
        &server.chunk_addr().to_string(),
        &config,
    )
    .unwrap();
    let resent: Stack = next_matching(&second.output(), WAIT, |signal| match signal {
        MicroscopeSignal::Stack(stack) => Some(stack),
        _ => None,
    })
    .unwrap();
    assert_eq!(resent, stack);
    let resent_slice = next_full_slice(&second.output()).unwrap();
    assert_eq!(resent_slice.data, slice.data);

    first.close();
    second.close();
    server.close();
}

/// A client asking for shutdown stops the server, and the server's
/// shutting-down status closes the client.
#[test]
fn test_client_shutdown_stops_both_sides() {
    let config = fast_config();
    let (mut server, mut client) = start_pair(&config);
    let output = client.output();

    client.shutdown();
    let state = next_matching(&output, WAIT, |signal| match signal {
        MicroscopeSignal::Status(status) if status.state == ServerState::ShuttingDown => {
            Some(status.state)
        }
        _ => None,
    })
    .unwrap();
    assert_eq!(state, ServerState::ShuttingDown);

    wait_for("server stop", WAIT, || !server.is_running()).unwrap();
    wait_for("client stop", WAIT, || !client.is_running()).unwrap();

    client.close();
    server.close();
}
