use crate::*;

use std::net::SocketAddr;
use std::sync::Arc;

use scopelinkd::session::{ClientListener, ServerListener};
use scopelinkd::{SessionState, SignalClient, SignalServer};

fn app(byte: u8) -> Envelope {
    Envelope::AppSpecific { data: vec![byte] }
}

fn recording_client(server: &SignalServer) -> (SignalClient, Seen<Envelope>) {
    let log = seen();
    let sink = log.clone();
    let listener: ClientListener = Arc::new(move |env: &Envelope| {
        sink.lock().unwrap().push(env.clone());
    });
    let client = SignalClient::connect(
        &server.local_addr().to_string(),
        &fast_session(),
        vec![listener],
    )
    .unwrap();
    (client, log)
}

/// A broadcast sent before the server has seen a client's sign-on never
/// reaches that client; one sent afterwards does.
#[test]
fn test_broadcast_before_sign_on_is_lost() {
    let mut server = SignalServer::start(LOOPBACK, &fast_session(), vec![]).unwrap();
    assert!(server.send(&app(1)));
    wait_for("first broadcast", WAIT, || server.sender().pending() == 0).unwrap();

    let (mut client, log) = recording_client(&server);
    wait_for("sign-on", WAIT, || server.connected_clients() == 1).unwrap();
    assert!(server.send(&app(2)));

    wait_for("second broadcast", WAIT, || !log.lock().unwrap().is_empty()).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(log.lock().unwrap().as_slice(), &[app(2)]);

    client.stop().join().unwrap();
    server.stop().join().unwrap();
}

/// Every known client gets each broadcast, and the server listener sees
/// who sent what.
#[test]
fn test_broadcast_reaches_every_client() {
    let inbound: Seen<(SocketAddr, Envelope)> = seen();
    let sink = inbound.clone();
    let listener: ServerListener = Arc::new(move |peer: SocketAddr, env: &Envelope| {
        sink.lock().unwrap().push((peer, env.clone()));
    });
    let mut server = SignalServer::start(LOOPBACK, &fast_session(), vec![listener]).unwrap();

    let (mut a, log_a) = recording_client(&server);
    let (mut b, log_b) = recording_client(&server);
    wait_for("both sign-ons", WAIT, || server.connected_clients() == 2).unwrap();

    assert!(a.send(&app(10)));
    wait_for("client message", WAIT, || inbound.lock().unwrap().len() == 3).unwrap();
    {
        let inbound = inbound.lock().unwrap();
        let sign_ons = inbound.iter().filter(|(_, e)| *e == Envelope::SignOn).count();
        assert_eq!(sign_ons, 2);
        assert!(inbound.contains(&(a.local_addr(), app(10))));
    }

    for i in 0..5 {
        assert!(server.send(&app(i)));
    }
    let expected: Vec<Envelope> = (0..5).map(app).collect();
    wait_for("broadcasts", WAIT, || {
        log_a.lock().unwrap().len() == 5 && log_b.lock().unwrap().len() == 5
    })
    .unwrap();
    assert_eq!(*log_a.lock().unwrap(), expected);
    assert_eq!(*log_b.lock().unwrap(), expected);

    a.stop().join().unwrap();
    b.stop().join().unwrap();
    server.stop().join().unwrap();
}

/// Server shutdown flushes what was queued, tells every client, and closes
/// both sides. Nothing can be queued afterwards.
#[test]
fn test_server_shutdown_drains_and_closes_clients() {
    let mut server = SignalServer::start(LOOPBACK, &fast_session(), vec![]).unwrap();
    let (mut a, log_a) = recording_client(&server);
    let (mut b, _log_b) = recording_client(&server);
    wait_for("both sign-ons", WAIT, || server.connected_clients() == 2).unwrap();

    assert!(server.send(&app(1)));
    assert!(server.shutdown());

    wait_for("server closed", WAIT, || server.state() == SessionState::Closed).unwrap();
    wait_for("clients closed", WAIT, || {
        a.state() == SessionState::Closed && b.state() == SessionState::Closed
    })
    .unwrap();
    assert_eq!(*log_a.lock().unwrap(), vec![app(1), Envelope::Shutdown]);
    assert!(!server.send(&app(2)));

    a.stop().join().unwrap();
    b.stop().join().unwrap();
    server.stop().join().unwrap();
}

/// A client that asks for shutdown sends it and closes itself; the server
/// drains on receipt.
#[test]
fn test_client_shutdown_closes_both_ends() {
    let mut server = SignalServer::start(LOOPBACK, &fast_session(), vec![]).unwrap();
    let (mut client, _log) = recording_client(&server);
    wait_for("sign-on", WAIT, || server.connected_clients() == 1).unwrap();

    assert!(client.shutdown());
    wait_for("client closed", WAIT, || client.state() == SessionState::Closed).unwrap();
    wait_for("server closed", WAIT, || server.state() == SessionState::Closed).unwrap();

    client.stop().join().unwrap();
    server.stop().join().unwrap();
}
