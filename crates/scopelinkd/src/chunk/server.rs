//! Chunk server — answers `ChunkRequest`s from the slice cache.
//!
//! Every client holds one TCP connection to the chunk port. Requests on a
//! connection are answered in order, each with one reply frame. The accept
//! loop runs on the worker; connections are tasks on the worker's runtime
//! and end with it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use scopelink_core::config::TransferConfig;
use scopelink_core::wire::{ChunkReplyHeader, ChunkRequest, REPLY_HEADER_SIZE, REQUEST_SIZE};
use scopelink_services::{SliceCache, Worker, WorkerControl, WorkerJoin, WorkerLoop};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use zerocopy::AsBytes;

use crate::error::EndpointError;
use crate::net::{bind_tcp, LoopSocket};

/// Kernel buffer size for a chunk server: 2 × PIPELINE_BUDGET full replies.
pub fn high_water_mark(config: &TransferConfig) -> usize {
    2 * config.pipeline_budget * (config.chunk_cap + REPLY_HEADER_SIZE)
}

/// Serves byte ranges of cached slices on the chunk port.
pub struct ChunkServer {
    worker: Worker,
    local_addr: SocketAddr,
    high_water: usize,
}

impl ChunkServer {
    pub fn start(
        bind_addr: &str,
        cache: Arc<SliceCache>,
        config: &TransferConfig,
    ) -> Result<Self, EndpointError> {
        config.validate()?;

        let high_water = high_water_mark(config);
        let listener = bind_tcp(bind_addr, Some(high_water))?;
        let local_addr = listener.local_addr().map_err(|source| EndpointError::Bind {
            addr: bind_addr.to_string(),
            source,
        })?;

        let hooks = ChunkServerLoop {
            listener: LoopSocket::new(listener),
            connections: JoinSet::new(),
            cache,
            chunk_cap: config.chunk_cap,
            slice_offset: config.slice_offset,
            receive_timeout: config.receive_timeout(),
        };
        let worker = Worker::start(format!("chunk-server-{}", local_addr.port()), hooks)?;
        tracing::info!(addr = %local_addr, chunk_cap = config.chunk_cap, high_water, "chunk server bound");

        Ok(Self {
            worker,
            local_addr,
            high_water,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Kernel buffer size requested for the listening socket.
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub fn stop(&mut self) -> WorkerJoin {
        self.worker.stop()
    }
}

struct ChunkServerLoop {
    listener: LoopSocket<std::net::TcpListener>,
    connections: JoinSet<()>,
    cache: Arc<SliceCache>,
    chunk_cap: usize,
    slice_offset: i32,
    receive_timeout: Duration,
}

impl WorkerLoop for ChunkServerLoop {
    async fn on_start(&mut self) -> anyhow::Result<()> {
        self.listener.activate()
    }

    async fn on_loop(&mut self, _ctl: &WorkerControl) -> anyhow::Result<()> {
        while let Some(done) = self.connections.try_join_next() {
            if let Err(e) = done {
                if e.is_panic() {
                    tracing::error!(error = %e, "chunk connection task panicked");
                }
            }
        }

        let listener = self.listener.get()?;
        let (stream, peer) = match tokio::time::timeout(self.receive_timeout, listener.accept()).await {
            Err(_) => return Ok(()),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "chunk server accept failed");
                return Ok(());
            }
            Ok(Ok(accepted)) => accepted,
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "could not disable nagle");
        }
        tracing::debug!(%peer, open = self.connections.len() + 1, "chunk client connected");
        self.connections.spawn(serve_connection(
            stream,
            peer,
            self.cache.clone(),
            self.chunk_cap,
            self.slice_offset,
        ));
        Ok(())
    }

    async fn on_close(&mut self) {
        self.connections.shutdown().await;
        tracing::info!("chunk server closed");
    }
}

/// Answer requests on one connection until the client hangs up.
async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    cache: Arc<SliceCache>,
    chunk_cap: usize,
    slice_offset: i32,
) {
    let mut frame = [0u8; REQUEST_SIZE];
    loop {
        if let Err(e) = stream.read_exact(&mut frame).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                tracing::debug!(%peer, "chunk client disconnected");
            } else {
                tracing::warn!(%peer, error = %e, "chunk connection read failed");
            }
            return;
        }

        let request = match ChunkRequest::parse(&frame).and_then(|r| r.validate().map(|()| r)) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "malformed chunk request, discarding");
                continue;
            }
        };

        let (header, data) = build_reply(&cache, &request, chunk_cap, slice_offset);
        tracing::trace!(
            %peer,
            slice_id = request.slice_id.get(),
            offset = request.offset.get(),
            size = header.chunk_size.get(),
            available = header.is_available(),
            "chunk reply"
        );

        let mut reply = Bytes::copy_from_slice(header.as_bytes()).chain(data.unwrap_or_default());
        if let Err(e) = stream.write_all_buf(&mut reply).await {
            tracing::warn!(%peer, error = %e, "chunk reply send failed, closing connection");
            return;
        }
    }
}

/// Answer one request from the cache.
///
/// The reply echoes the requested offset; `slice_offset` only shifts where
/// the bytes are read from. The size is clamped to what is left of the
/// slice and to `chunk_cap`.
pub fn build_reply(
    cache: &SliceCache,
    request: &ChunkRequest,
    chunk_cap: usize,
    slice_offset: i32,
) -> (ChunkReplyHeader, Option<Bytes>) {
    let slice_id = request.slice_id.get();
    let Some(payload) = cache.get(slice_id) else {
        return (ChunkReplyHeader::unavailable(slice_id), None);
    };

    let offset = request.offset.get();
    let start = (i64::from(offset) + i64::from(slice_offset)).clamp(0, payload.len() as i64) as usize;
    let remaining = payload.len() - start;
    let size = (request.chunk_size.get().max(0) as usize)
        .min(remaining)
        .min(chunk_cap);

    let header = ChunkReplyHeader::available(slice_id, offset, size as i32);
    (header, Some(payload.slice(start..start + size)))
}
