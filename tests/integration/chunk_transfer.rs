use crate::*;

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;

use bytes::Bytes;
use scopelink_core::wire::{encode_reply, ChunkRequest, REQUEST_SIZE};
use scopelink_services::SliceCache;
use scopelinkd::chunk::build_reply;
use scopelinkd::{ChunkClient, ChunkServer, SliceFetch};

fn transfer(chunk_cap: usize, pipeline_budget: usize) -> TransferConfig {
    TransferConfig {
        chunk_cap,
        pipeline_budget,
        receive_timeout_ms: 200,
        ..TransferConfig::default()
    }
}

fn patterned(len: usize, seed: u8) -> Bytes {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect::<Vec<_>>()
        .into()
}

/// Several slices pulled concurrently each come back whole and unmixed.
#[test]
fn test_concurrent_pulls_reassemble_each_slice() {
    let config = transfer(1000, 4);
    let cache = Arc::new(SliceCache::new(1 << 20));
    let payloads: Vec<(i32, Bytes)> = (0..4)
        .map(|i| (i, patterned(2500 + 700 * i as usize, i as u8)))
        .collect();
    for (id, data) in &payloads {
        assert!(cache.insert(*id, data.clone()).is_stored());
    }

    let mut server = ChunkServer::start(LOOPBACK, cache, &config).unwrap();
    let mut client = ChunkClient::connect(&server.local_addr().to_string(), &config).unwrap();

    for (id, data) in &payloads {
        assert!(client.request_slice(*id, data.len()));
    }

    let mut received = Vec::new();
    for _ in 0..payloads.len() {
        match client.recv_timeout(WAIT) {
            Some(SliceFetch::Complete { slice_id, data }) => received.push((slice_id, data)),
            other => panic!("unexpected fetch result: {other:?}"),
        }
    }
    received.sort_by_key(|(id, _)| *id);
    assert_eq!(received, payloads);

    client.stop().join().unwrap();
    server.stop().join().unwrap();
}

/// A slice evicted between announcement and pull resolves as unavailable,
/// while a slice still cached is delivered.
#[test]
fn test_evicted_slice_is_unavailable() {
    let config = transfer(512, 2);
    let cache = Arc::new(SliceCache::new(3000));
    cache.insert(1, patterned(1500, 1));
    cache.insert(2, patterned(1500, 2));
    // evicts slice 1
    cache.insert(3, patterned(1000, 3));
    assert!(!cache.contains(1));

    let mut server = ChunkServer::start(LOOPBACK, cache, &config).unwrap();
    let mut client = ChunkClient::connect(&server.local_addr().to_string(), &config).unwrap();

    assert!(client.request_slice(1, 1500));
    assert!(client.request_slice(3, 1000));

    let mut results = vec![client.recv_timeout(WAIT), client.recv_timeout(WAIT)];
    results.sort_by_key(|r| r.as_ref().map(SliceFetch::slice_id));
    assert_eq!(results[0], Some(SliceFetch::Unavailable { slice_id: 1 }));
    assert_eq!(
        results[1],
        Some(SliceFetch::Complete {
            slice_id: 3,
            data: patterned(1000, 3)
        })
    );

    client.stop().join().unwrap();
    server.stop().join().unwrap();
}

/// A 10 MiB slice pulled with 64 KiB chunks, each larger than a datagram.
#[test]
fn test_large_slice_with_64k_chunks() {
    let config = transfer(64 * 1024, 10);
    let size = 10 * 1024 * 1024;
    let cache = Arc::new(SliceCache::new(12 * 1024 * 1024));
    let payload = patterned(size, 9);
    assert!(cache.insert(1, payload.clone()).is_stored());

    let mut server = ChunkServer::start(LOOPBACK, cache, &config).unwrap();
    let mut client = ChunkClient::connect(&server.local_addr().to_string(), &config).unwrap();

    assert!(client.request_slice(1, size));
    match client.recv_timeout(WAIT) {
        Some(SliceFetch::Complete { slice_id: 1, data }) => {
            assert_eq!(data.len(), size);
            assert!(data == payload, "reassembled bytes differ");
        }
        other => panic!("10 MiB pull did not complete: {:?}", other.map(|f| f.slice_id())),
    }

    client.stop().join().unwrap();
    server.stop().join().unwrap();
}

/// Pulls requested before the server exists go out once it accepts.
#[test]
fn test_pulls_queue_until_server_is_up() {
    let config = transfer(400, 3);
    let cache = Arc::new(SliceCache::new(1 << 16));
    cache.insert(7, patterned(3000, 7));
    cache.insert(8, patterned(1000, 8));

    // Reserve a port, release it, and start the server there later.
    let reserved = std::net::TcpListener::bind(LOOPBACK).unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let mut client = ChunkClient::connect(&addr.to_string(), &config).unwrap();
    assert!(client.request_slice(7, 3000));
    std::thread::sleep(Duration::from_millis(300));
    assert!(client.request_slice(8, 1000));
    assert_eq!(client.recv_timeout(Duration::from_millis(200)), None);

    let mut server = ChunkServer::start(&addr.to_string(), cache, &config).unwrap();
    let mut received = vec![client.recv_timeout(WAIT), client.recv_timeout(WAIT)];
    received.sort_by_key(|r| r.as_ref().map(SliceFetch::slice_id));
    assert_eq!(
        received,
        vec![
            Some(SliceFetch::Complete {
                slice_id: 7,
                data: patterned(3000, 7)
            }),
            Some(SliceFetch::Complete {
                slice_id: 8,
                data: patterned(1000, 8)
            }),
        ]
    );

    client.stop().join().unwrap();
    server.stop().join().unwrap();
}

/// Requests in flight on a stream that breaks are not retried: that pull
/// never completes, but the client reconnects and later pulls go through.
#[test]
fn test_broken_stream_does_not_stall_later_pulls() {
    let config = transfer(400, 3);
    let cache = SliceCache::new(1 << 16);
    cache.insert(7, patterned(1200, 7));
    cache.insert(8, patterned(1000, 8));

    let listener = TcpListener::bind(LOOPBACK).unwrap();
    let addr = listener.local_addr().unwrap();
    let mut client = ChunkClient::connect(&addr.to_string(), &config).unwrap();
    assert!(client.request_slice(7, 1200));

    // First stream: take one request and hang up.
    let (mut first, _) = listener.accept().unwrap();
    let mut frame = [0u8; REQUEST_SIZE];
    first.read_exact(&mut frame).unwrap();
    assert_eq!(ChunkRequest::parse(&frame).unwrap().slice_id.get(), 7);
    drop(first);

    // Second stream: answer everything from the cache.
    let (mut second, _) = listener.accept().unwrap();
    let responder = std::thread::spawn(move || {
        let mut frame = [0u8; REQUEST_SIZE];
        while second.read_exact(&mut frame).is_ok() {
            let Ok(request) = ChunkRequest::parse(&frame) else {
                break;
            };
            let (header, data) = build_reply(&cache, &request, 400, 0);
            if second.write_all(&encode_reply(&header, data.as_deref())).is_err() {
                break;
            }
        }
    });

    assert!(client.request_slice(8, 1000));
    assert_eq!(
        client.recv_timeout(WAIT),
        Some(SliceFetch::Complete {
            slice_id: 8,
            data: patterned(1000, 8)
        })
    );
    assert_eq!(client.recv_timeout(Duration::from_millis(500)), None);

    client.stop().join().unwrap();
    responder.join().unwrap();
}
