//! Signal server — one bound socket, many clients.
//!
//! A client becomes known the first time the server receives anything from
//! it, usually its `SignOn`. Every queued envelope goes to every known
//! client, so a client misses whatever was sent before its sign-on arrived.
//! Known clients are never pruned automatically; `forget_client` is the only
//! way out of the registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use scopelink_core::config::SessionConfig;
use scopelink_core::signal::Envelope;
use scopelink_core::wire::MAX_DATAGRAM;
use scopelink_services::{OutgoingQueue, Worker, WorkerControl, WorkerJoin, WorkerLoop};

use super::{begin_drain, Listeners, ServerListener, SessionState, SharedState, SignalSender};
use crate::error::EndpointError;
use crate::net::{bind_udp, LoopSocket};

/// Known client identities and when each was first seen.
pub type ClientRegistry = Arc<DashMap<SocketAddr, Instant>>;

pub struct SignalServer {
    worker: Worker,
    local_addr: SocketAddr,
    sender: SignalSender,
    clients: ClientRegistry,
    listeners: Listeners<dyn Fn(SocketAddr, &Envelope) + Send + Sync>,
    injected: Arc<OutgoingQueue<Envelope>>,
    state: SharedState,
    offer_timeout: Duration,
}

impl SignalServer {
    pub fn start(
        bind_addr: &str,
        config: &SessionConfig,
        listeners: Vec<ServerListener>,
    ) -> Result<Self, EndpointError> {
        let socket = bind_udp(bind_addr, None)?;
        let local_addr = socket.local_addr().map_err(|source| EndpointError::Bind {
            addr: bind_addr.to_string(),
            source,
        })?;

        let state = SharedState::new();
        let sender = SignalSender::new(
            "signal-server",
            config.queue_capacity,
            config.offer_timeout(),
            state.clone(),
        );
        let clients: ClientRegistry = Arc::new(DashMap::new());
        let listeners = Listeners::new(listeners);
        let injected = Arc::new(OutgoingQueue::new("signal-server-injected", config.queue_capacity));

        let hooks = SignalServerLoop {
            socket: LoopSocket::new(socket),
            local_addr,
            sender: sender.clone(),
            clients: clients.clone(),
            listeners: listeners.clone(),
            injected: injected.clone(),
            state: state.clone(),
            idle_sleep: config.idle_sleep(),
            buf: vec![0u8; MAX_DATAGRAM],
        };
        let worker = Worker::start(format!("signal-server-{}", local_addr.port()), hooks)?;
        tracing::info!(addr = %local_addr, "signal server bound");

        Ok(Self {
            worker,
            local_addr,
            sender,
            clients,
            listeners,
            injected,
            state,
            offer_timeout: config.offer_timeout(),
        })
    }

    /// Register a listener. It runs on the server worker thread and should
    /// return quickly.
    pub fn add_listener(&self, listener: impl Fn(SocketAddr, &Envelope) + Send + Sync + 'static) {
        self.listeners.add(Arc::new(listener));
    }

    pub fn sender(&self) -> SignalSender {
        self.sender.clone()
    }

    /// Queue `envelope` for every known client.
    pub fn send(&self, envelope: &Envelope) -> bool {
        self.sender.send(envelope)
    }

    /// Queue a `Shutdown` broadcast. The server closes after sending it.
    pub fn shutdown(&self) -> bool {
        self.sender.shutdown()
    }

    /// Hand `envelope` to the listeners as if it had arrived from the
    /// server's own address.
    pub fn inject(&self, envelope: Envelope) -> bool {
        self.injected.offer(envelope, self.offer_timeout)
    }

    /// Remove a client from the broadcast set. Returns whether it was known.
    pub fn forget_client(&self, client: SocketAddr) -> bool {
        let removed = self.clients.remove(&client).is_some();
        if removed {
            tracing::info!(%client, "client forgotten");
        }
        removed
    }

    pub fn connected_clients(&self) -> usize {
        self.clients.len()
    }

    pub fn clients(&self) -> Vec<SocketAddr> {
        self.clients.iter().map(|e| *e.key()).collect()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub fn stop(&mut self) -> WorkerJoin {
        self.worker.stop()
    }
}

struct SignalServerLoop {
    socket: LoopSocket,
    local_addr: SocketAddr,
    sender: SignalSender,
    clients: ClientRegistry,
    listeners: Listeners<dyn Fn(SocketAddr, &Envelope) + Send + Sync>,
    injected: Arc<OutgoingQueue<Envelope>>,
    state: SharedState,
    idle_sleep: Duration,
    buf: Vec<u8>,
}

impl SignalServerLoop {
    fn deliver(&self, peer: SocketAddr, envelope: &Envelope) {
        for listener in self.listeners.snapshot() {
            listener(peer, envelope);
        }
        if envelope.is_shutdown() {
            begin_drain(&self.state, "server");
        }
    }

    fn receive(&mut self) -> anyhow::Result<bool> {
        let (len, peer) = match self.socket.get()?.try_recv_from(&mut self.buf) {
            Ok(received) => received,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => {
                tracing::warn!(error = %e, "signal server recv failed");
                return Ok(true);
            }
        };

        if !self.clients.contains_key(&peer) {
            self.clients.insert(peer, Instant::now());
            tracing::info!(client = %peer, known = self.clients.len(), "new client");
        }

        match Envelope::decode(&self.buf[..len]) {
            Ok(envelope) => {
                tracing::debug!(client = %peer, kind = envelope.kind(), "signal received");
                self.deliver(peer, &envelope);
            }
            Err(e) => tracing::warn!(client = %peer, error = %e, "undecodable signal, discarding"),
        }
        Ok(true)
    }
}

impl WorkerLoop for SignalServerLoop {
    async fn on_start(&mut self) -> anyhow::Result<()> {
        self.socket.activate()
    }

    async fn on_loop(&mut self, ctl: &WorkerControl) -> anyhow::Result<()> {
        let mut worked = false;

        if self.state.get() == SessionState::Running {
            worked = self.receive()?;
            if !worked {
                if let Some(envelope) = self.injected.poll() {
                    self.deliver(self.local_addr, &envelope);
                    worked = true;
                }
            }
        }

        if let Some(queued) = self.sender.poll() {
            worked = true;
            let socket = self.socket.get()?;
            let targets: Vec<SocketAddr> = self.clients.iter().map(|e| *e.key()).collect();
            for client in &targets {
                if let Err(e) = socket.send_to(&queued.bytes, *client).await {
                    tracing::warn!(%client, kind = queued.kind, error = %e, "signal send failed");
                }
            }
            tracing::debug!(kind = queued.kind, clients = targets.len(), "signal broadcast");
            if queued.shutdown {
                begin_drain(&self.state, "server");
            }
        } else if self.state.get() == SessionState::Draining {
            ctl.request_stop();
            return Ok(());
        }

        if !worked {
            tokio::time::sleep(self.idle_sleep).await;
        }
        Ok(())
    }

    async fn on_close(&mut self) {
        self.state.advance(SessionState::Closed);
        tracing::info!(addr = %self.local_addr, clients = self.clients.len(), "signal server closed");
    }
}
