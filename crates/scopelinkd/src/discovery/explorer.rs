//! Listens for server announcements and keeps a registry of live servers.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use scopelink_core::config::DiscoveryConfig;
use scopelink_core::signal::ServerKind;
use scopelink_core::wire::{ServiceAnnouncement, ANNOUNCE_SIZE};
use scopelink_services::{Worker, WorkerControl, WorkerJoin, WorkerLoop};

use crate::error::EndpointError;
use crate::net::{discovery_socket, resolve, LoopSocket};

/// A server heard on the discovery group.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredServer {
    pub name: String,
    pub kind: ServerKind,
    /// Source address of the announcement.
    pub host: IpAddr,
    pub signal_port: u16,
    pub chunk_port: u16,
}

impl DiscoveredServer {
    pub fn signal_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.signal_port)
    }

    pub fn chunk_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.chunk_port)
    }
}

struct Entry {
    server: DiscoveredServer,
    last_seen: Instant,
}

/// Registry keyed by the server's signal address.
type Registry = Arc<DashMap<SocketAddr, Entry>>;

pub struct ServiceExplorer {
    worker: Worker,
    local_addr: SocketAddr,
    registry: Registry,
    ttl: Duration,
}

impl ServiceExplorer {
    pub fn start(config: &DiscoveryConfig) -> Result<Self, EndpointError> {
        let group = resolve(&config.group)?;
        let socket = discovery_socket(group)?;
        let local_addr = socket.local_addr().map_err(|source| EndpointError::Bind {
            addr: config.group.clone(),
            source,
        })?;

        let registry: Registry = Arc::new(DashMap::new());
        let hooks = ExploreLoop {
            socket: LoopSocket::new(socket),
            registry: registry.clone(),
            ttl: config.ttl(),
            sweep_every: config.interval(),
            buf: [0u8; ANNOUNCE_SIZE + 1],
        };
        let worker = Worker::start(format!("explorer-{}", local_addr.port()), hooks)?;
        tracing::info!(%group, "exploring for servers");

        Ok(Self {
            worker,
            local_addr,
            registry,
            ttl: config.ttl(),
        })
    }

    /// Where the explorer listens. With a unicast group on port 0 this is
    /// the address announcers must target.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Servers heard within the ttl, ordered by name.
    pub fn servers(&self) -> Vec<DiscoveredServer> {
        let mut servers: Vec<DiscoveredServer> = self
            .registry
            .iter()
            .filter(|e| e.last_seen.elapsed() < self.ttl)
            .map(|e| e.server.clone())
            .collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name).then(a.signal_port.cmp(&b.signal_port)));
        servers
    }

    /// First live server announced under `name`.
    pub fn find(&self, name: &str) -> Option<DiscoveredServer> {
        self.servers().into_iter().find(|s| s.name == name)
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub fn stop(&mut self) -> WorkerJoin {
        self.worker.stop()
    }
}

struct ExploreLoop {
    socket: LoopSocket,
    registry: Registry,
    ttl: Duration,
    sweep_every: Duration,
    // One spare byte so oversized datagrams fail the length check.
    buf: [u8; ANNOUNCE_SIZE + 1],
}

impl ExploreLoop {
    fn on_announcement(&self, from: SocketAddr, announcement: ServiceAnnouncement) {
        let Ok(kind) = announcement.server_kind() else {
            return;
        };
        let server = DiscoveredServer {
            name: announcement.name().to_string(),
            kind,
            host: from.ip(),
            signal_port: announcement.signal_port.get(),
            chunk_port: announcement.chunk_port.get(),
        };
        let key = server.signal_addr();

        if announcement.is_leaving() {
            if self.registry.remove(&key).is_some() {
                tracing::info!(name = %server.name, addr = %key, "server left");
            }
            return;
        }

        let entry = Entry {
            server,
            last_seen: Instant::now(),
        };
        if let Some(previous) = self.registry.insert(key, entry) {
            tracing::trace!(name = %previous.server.name, addr = %key, "server still announced");
        } else {
            tracing::info!(addr = %key, "server discovered");
        }
    }

    fn expire(&self) {
        let ttl = self.ttl;
        self.registry.retain(|addr, entry| {
            let live = entry.last_seen.elapsed() < ttl;
            if !live {
                tracing::info!(name = %entry.server.name, %addr, "server expired");
            }
            live
        });
    }
}

impl WorkerLoop for ExploreLoop {
    async fn on_start(&mut self) -> anyhow::Result<()> {
        self.socket.activate()
    }

    async fn on_loop(&mut self, _ctl: &WorkerControl) -> anyhow::Result<()> {
        let socket = self.socket.get()?;
        match tokio::time::timeout(self.sweep_every, socket.recv_from(&mut self.buf)).await {
            Err(_) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "discovery recv failed"),
            Ok(Ok((len, from))) => match ServiceAnnouncement::parse(&self.buf[..len]) {
                Ok(announcement) => self.on_announcement(from, announcement),
                Err(e) => tracing::debug!(%from, error = %e, "ignoring datagram on discovery group"),
            },
        }
        self.expire();
        Ok(())
    }

    async fn on_close(&mut self) {
        tracing::info!(known = self.registry.len(), "explorer closed");
    }
}
