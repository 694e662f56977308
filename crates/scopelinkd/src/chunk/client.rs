//! Chunk client — pulls whole slices from a chunk server.
//!
//! Callers queue pulls with `request_slice`. The worker splits each pull
//! into chunk requests, keeps at most `pipeline_budget` of them in flight on
//! its stream to the server, and reassembles replies as they arrive.
//! Finished pulls come out of `results()` as `SliceFetch`.
//!
//! The stream is opened lazily and reopened after a failure. Requests wait
//! in the backlog while there is no connection; requests that were in
//! flight when a connection broke are not resent.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{bounded, Receiver, Sender};
use scopelink_core::config::TransferConfig;
use scopelink_core::wire::{reply_frame_len, ChunkReply, ChunkRequest, REPLY_HEADER_SIZE};
use scopelink_services::{
    plan_requests, OutgoingQueue, ReassemblyBuffer, Worker, WorkerControl, WorkerJoin, WorkerLoop,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use zerocopy::AsBytes;

use crate::error::EndpointError;
use crate::net::resolve;

/// Pause while the completed queue is full or nothing is being pulled.
const IDLE_PAUSE: Duration = Duration::from_millis(20);

/// Pause after a failed connection attempt.
const RECONNECT_PAUSE: Duration = Duration::from_millis(100);

/// Outcome of one slice pull.
#[derive(Debug, Clone, PartialEq)]
pub enum SliceFetch {
    Complete { slice_id: i32, data: Bytes },
    /// The server does not hold this id. It will never resolve.
    Unavailable { slice_id: i32 },
}

impl SliceFetch {
    pub fn slice_id(&self) -> i32 {
        match self {
            SliceFetch::Complete { slice_id, .. } | SliceFetch::Unavailable { slice_id } => *slice_id,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingPull {
    slice_id: i32,
    size: usize,
}

pub struct ChunkClient {
    worker: Worker,
    server: SocketAddr,
    requests: Arc<OutgoingQueue<PendingPull>>,
    results: Receiver<SliceFetch>,
    offer_wait: Duration,
}

impl ChunkClient {
    /// Start pulling from `server_addr`. The server does not have to be up
    /// yet; pulls queue until it accepts the connection.
    pub fn connect(server_addr: &str, config: &TransferConfig) -> Result<Self, EndpointError> {
        config.validate()?;
        let server = resolve(server_addr)?;

        let requests = Arc::new(OutgoingQueue::new("chunk-requests", config.request_queue));
        let (results_tx, results) = bounded(config.completed_queue);

        let hooks = ChunkClientLoop {
            server,
            stream: None,
            read_buf: BytesMut::new(),
            requests: requests.clone(),
            results: results_tx,
            open: HashMap::new(),
            backlog: VecDeque::new(),
            budget: config.pipeline_budget,
            credit: config.pipeline_budget,
            chunk_cap: config.chunk_cap,
            receive_timeout: config.receive_timeout(),
        };
        let worker = Worker::start(format!("chunk-client-{}", server.port()), hooks)?;
        tracing::info!(%server, chunk_cap = config.chunk_cap, "chunk client started");

        Ok(Self {
            worker,
            server,
            requests,
            results,
            offer_wait: config.receive_timeout(),
        })
    }

    /// Queue a pull of `size` bytes of slice `slice_id`.
    /// Returns false if the request queue stayed full or the client has
    /// stopped; the pull is dropped.
    pub fn request_slice(&self, slice_id: i32, size: usize) -> bool {
        if !self.worker.is_running() {
            return false;
        }
        self.requests
            .offer(PendingPull { slice_id, size }, self.offer_wait)
    }

    /// Completed pulls, in completion order.
    pub fn results(&self) -> Receiver<SliceFetch> {
        self.results.clone()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<SliceFetch> {
        self.results.recv_timeout(timeout).ok()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Ask the worker to stop without joining it.
    pub fn request_stop(&self) {
        self.worker.control().request_stop();
    }

    pub fn stop(&mut self) -> WorkerJoin {
        self.worker.stop()
    }
}

struct ChunkClientLoop {
    server: SocketAddr,
    stream: Option<TcpStream>,
    /// Reply bytes received but not yet parsed into whole frames.
    read_buf: BytesMut,
    requests: Arc<OutgoingQueue<PendingPull>>,
    results: Sender<SliceFetch>,
    open: HashMap<i32, ReassemblyBuffer>,
    /// Planned requests not yet sent.
    backlog: VecDeque<ChunkRequest>,
    budget: usize,
    credit: usize,
    chunk_cap: usize,
    receive_timeout: Duration,
}

impl ChunkClientLoop {
    fn admit(&mut self, pull: PendingPull) {
        if pull.size == 0 {
            self.emit(SliceFetch::Complete {
                slice_id: pull.slice_id,
                data: Bytes::new(),
            });
            return;
        }
        if self.open.contains_key(&pull.slice_id) {
            tracing::debug!(slice_id = pull.slice_id, "slice already being pulled");
            return;
        }
        self.open
            .insert(pull.slice_id, ReassemblyBuffer::new(pull.slice_id, pull.size));
        self.backlog
            .extend(plan_requests(pull.slice_id, pull.size, self.chunk_cap));
    }

    fn emit(&self, fetch: SliceFetch) {
        let slice_id = fetch.slice_id();
        if self.results.send_timeout(fetch, self.receive_timeout).is_err() {
            tracing::warn!(slice_id, "completed slice queue full, result dropped");
        }
    }

    async fn connect(&mut self) {
        match tokio::time::timeout(self.receive_timeout, TcpStream::connect(self.server)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(error = %e, "could not disable nagle");
                }
                tracing::debug!(server = %self.server, "chunk stream open");
                self.stream = Some(stream);
                self.credit = self.budget;
            }
            Ok(Err(e)) => {
                tracing::debug!(server = %self.server, error = %e, "chunk server not reachable");
                tokio::time::sleep(RECONNECT_PAUSE).await;
            }
            Err(_) => tracing::debug!(server = %self.server, "chunk connect timed out"),
        }
    }

    /// Forget the connection. Replies still owed on it are lost.
    fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!(
                outstanding = self.budget - self.credit,
                "chunk stream closed"
            );
        }
        self.read_buf.clear();
        self.credit = self.budget;
    }

    /// Hand every complete frame in the read buffer to `handle_reply`.
    fn drain_frames(&mut self) {
        loop {
            let len = match reply_frame_len(&self.read_buf) {
                Ok(Some(len)) if self.read_buf.len() >= len => len,
                Ok(_) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "corrupt chunk stream, reconnecting");
                    self.disconnect();
                    return;
                }
            };
            let frame = self.read_buf.split_to(len).freeze();
            self.handle_reply(frame);
        }
    }

    fn handle_reply(&mut self, frame: Bytes) {
        self.credit = (self.credit + 1).min(self.budget);

        let header = match ChunkReply::parse(&frame) {
            Ok(reply) => reply.header,
            Err(e) => {
                tracing::warn!(error = %e, "malformed chunk reply, discarding");
                return;
            }
        };
        let slice_id = header.slice_id.get();

        if !header.is_available() {
            if self.open.remove(&slice_id).is_some() {
                self.backlog.retain(|r| r.slice_id.get() != slice_id);
                tracing::warn!(slice_id, "slice not available on server");
                self.emit(SliceFetch::Unavailable { slice_id });
            }
            return;
        }

        let Some(buffer) = self.open.get_mut(&slice_id) else {
            tracing::debug!(slice_id, "chunk for a slice that is not being pulled");
            return;
        };
        let offset = header.offset.get().max(0) as usize;
        match buffer.insert(offset, frame.slice(REPLY_HEADER_SIZE..)) {
            Ok(true) => {
                if let Some(done) = self.open.remove(&slice_id) {
                    tracing::debug!(slice_id, size = done.expected_total(), "slice complete");
                    self.emit(SliceFetch::Complete {
                        slice_id,
                        data: done.into_bytes(),
                    });
                }
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(slice_id, error = %e, "chunk rejected"),
        }
    }
}

impl WorkerLoop for ChunkClientLoop {
    async fn on_loop(&mut self, _ctl: &WorkerControl) -> anyhow::Result<()> {
        if self.results.is_full() {
            tokio::time::sleep(IDLE_PAUSE).await;
            return Ok(());
        }

        while let Some(pull) = self.requests.poll() {
            self.admit(pull);
        }

        if self.open.is_empty() {
            tokio::time::sleep(IDLE_PAUSE).await;
            return Ok(());
        }

        let Some(stream) = self.stream.as_mut() else {
            self.connect().await;
            return Ok(());
        };

        let mut write_failed = false;
        while self.credit > 0 {
            let Some(request) = self.backlog.pop_front() else {
                break;
            };
            if let Err(e) = stream.write_all(request.as_bytes()).await {
                tracing::warn!(slice_id = request.slice_id.get(), error = %e, "chunk request send failed");
                self.backlog.push_front(request);
                write_failed = true;
                break;
            }
            self.credit -= 1;
        }
        if write_failed {
            self.disconnect();
            return Ok(());
        }

        self.read_buf.reserve(REPLY_HEADER_SIZE + self.chunk_cap.min(1 << 20));
        match tokio::time::timeout(self.receive_timeout, stream.read_buf(&mut self.read_buf)).await {
            Ok(Ok(0)) => {
                tracing::warn!(server = %self.server, "chunk server closed the stream");
                self.disconnect();
            }
            Ok(Ok(_)) => self.drain_frames(),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "chunk client recv failed");
                self.disconnect();
            }
            Err(_) => {
                if self.credit < self.budget {
                    tracing::debug!(
                        outstanding = self.budget - self.credit,
                        "chunk replies timed out, restoring credit"
                    );
                    self.credit = self.budget;
                }
            }
        }
        Ok(())
    }

    async fn on_close(&mut self) {
        if !self.open.is_empty() {
            tracing::debug!(open = self.open.len(), "chunk client closed with unfinished pulls");
        }
        self.open.clear();
        self.backlog.clear();
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkServer;
    use scopelink_core::wire::MAX_CHUNK_CAP;
    use scopelink_services::SliceCache;

    fn small_config() -> TransferConfig {
        TransferConfig {
            chunk_cap: 100,
            pipeline_budget: 3,
            receive_timeout_ms: 100,
            ..TransferConfig::default()
        }
    }

    fn pattern(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    #[test]
    fn pulls_a_multi_chunk_slice() {
        let config = small_config();
        let cache = Arc::new(SliceCache::new(1 << 20));
        let payload = pattern(1234);
        cache.insert(5, payload.clone());

        let mut server = ChunkServer::start("127.0.0.1:0", cache, &config).unwrap();
        let mut client = ChunkClient::connect(&server.local_addr().to_string(), &config).unwrap();

        assert!(client.request_slice(5, payload.len()));
        let fetch = client.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            fetch,
            SliceFetch::Complete {
                slice_id: 5,
                data: payload
            }
        );

        client.stop().join().unwrap();
        server.stop().join().unwrap();
    }

    #[test]
    fn pulls_ten_mebibytes_in_64k_chunks() {
        let config = TransferConfig {
            chunk_cap: 64 * 1024,
            ..TransferConfig::default()
        };
        let size = 10 * 1024 * 1024;
        let cache = Arc::new(SliceCache::new(16 * 1024 * 1024));
        let payload = pattern(size);
        cache.insert(1, payload.clone());

        let mut server = ChunkServer::start("127.0.0.1:0", cache, &config).unwrap();
        let mut client = ChunkClient::connect(&server.local_addr().to_string(), &config).unwrap();

        assert!(client.request_slice(1, size));
        match client.recv_timeout(Duration::from_secs(20)) {
            Some(SliceFetch::Complete { slice_id, data }) => {
                assert_eq!(slice_id, 1);
                assert_eq!(data.len(), size);
                assert!(data == payload, "reassembled bytes differ");
            }
            other => panic!("pull did not complete: {other:?}"),
        }

        client.stop().join().unwrap();
        server.stop().join().unwrap();
    }

    #[test]
    fn unknown_id_resolves_as_unavailable_once() {
        let config = small_config();
        let cache = Arc::new(SliceCache::new(1024));
        let mut server = ChunkServer::start("127.0.0.1:0", cache, &config).unwrap();
        let mut client = ChunkClient::connect(&server.local_addr().to_string(), &config).unwrap();

        assert!(client.request_slice(42, 1000));
        assert_eq!(
            client.recv_timeout(Duration::from_secs(5)),
            Some(SliceFetch::Unavailable { slice_id: 42 })
        );
        assert_eq!(client.recv_timeout(Duration::from_millis(300)), None);

        client.stop().join().unwrap();
        server.stop().join().unwrap();
    }

    #[test]
    fn pulls_wait_for_a_late_server() {
        let config = small_config();
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = reserved.local_addr().unwrap().to_string();
        drop(reserved);

        let mut client = ChunkClient::connect(&addr, &config).unwrap();
        assert!(client.request_slice(3, 450));
        assert_eq!(client.recv_timeout(Duration::from_millis(300)), None);

        let cache = Arc::new(SliceCache::new(1 << 20));
        let payload = pattern(450);
        cache.insert(3, payload.clone());
        let mut server = ChunkServer::start(&addr, cache, &config).unwrap();

        assert_eq!(
            client.recv_timeout(Duration::from_secs(5)),
            Some(SliceFetch::Complete {
                slice_id: 3,
                data: payload
            })
        );

        client.stop().join().unwrap();
        server.stop().join().unwrap();
    }

    #[test]
    fn empty_slice_completes_without_traffic() {
        let config = small_config();
        // nothing listens here
        let mut client = ChunkClient::connect("127.0.0.1:9", &config).unwrap();
        assert!(client.request_slice(1, 0));
        assert_eq!(
            client.recv_timeout(Duration::from_secs(2)),
            Some(SliceFetch::Complete {
                slice_id: 1,
                data: Bytes::new()
            })
        );
        client.stop().join().unwrap();
    }

    #[test]
    fn stopped_client_refuses_pulls() {
        let mut client = ChunkClient::connect("127.0.0.1:9", &small_config()).unwrap();
        client.stop().join().unwrap();
        assert!(!client.request_slice(1, 10));
    }

    #[test]
    fn caps_the_client_cannot_accept_are_rejected() {
        for chunk_cap in [0, MAX_CHUNK_CAP + 1] {
            let config = TransferConfig {
                chunk_cap,
                ..small_config()
            };
            assert!(matches!(
                ChunkClient::connect("127.0.0.1:9", &config),
                Err(EndpointError::Config(_))
            ));
        }
    }
}
