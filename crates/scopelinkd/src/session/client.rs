//! Signal client — one connected socket to a `SignalServer`.
//!
//! `SignOn` is queued before the worker starts, so it is always the first
//! envelope the server receives from this client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use scopelink_core::config::SessionConfig;
use scopelink_core::signal::{AppPayload, Envelope};
use scopelink_core::wire::MAX_DATAGRAM;
use scopelink_services::{Worker, WorkerControl, WorkerJoin, WorkerLoop};

use super::{begin_drain, ClientListener, Listeners, SessionState, SharedState, SignalSender};
use crate::error::EndpointError;
use crate::net::{connect_udp, LoopSocket};

pub struct SignalClient {
    worker: Worker,
    server: SocketAddr,
    local_addr: SocketAddr,
    sender: SignalSender,
    listeners: Listeners<dyn Fn(&Envelope) + Send + Sync>,
    state: SharedState,
}

impl SignalClient {
    pub fn connect(
        server_addr: &str,
        config: &SessionConfig,
        listeners: Vec<ClientListener>,
    ) -> Result<Self, EndpointError> {
        let socket = connect_udp(server_addr)?;
        let connect_err = |source| EndpointError::Connect {
            addr: server_addr.to_string(),
            source,
        };
        let server = socket.peer_addr().map_err(connect_err)?;
        let local_addr = socket.local_addr().map_err(connect_err)?;

        let state = SharedState::new();
        let sender = SignalSender::new(
            "signal-client",
            config.queue_capacity,
            config.offer_timeout(),
            state.clone(),
        );
        sender.send(&Envelope::SignOn);

        let listeners = Listeners::new(listeners);
        let hooks = SignalClientLoop {
            socket: LoopSocket::new(socket),
            sender: sender.clone(),
            listeners: listeners.clone(),
            state: state.clone(),
            idle_sleep: config.idle_sleep(),
            buf: vec![0u8; MAX_DATAGRAM],
        };
        let worker = Worker::start(format!("signal-client-{}", local_addr.port()), hooks)?;
        tracing::info!(%server, "signal client connected");

        Ok(Self {
            worker,
            server,
            local_addr,
            sender,
            listeners,
            state,
        })
    }

    /// Register a listener. It runs on the client worker thread.
    pub fn add_listener(&self, listener: impl Fn(&Envelope) + Send + Sync + 'static) {
        self.listeners.add(Arc::new(listener));
    }

    pub fn sender(&self) -> SignalSender {
        self.sender.clone()
    }

    pub fn send(&self, envelope: &Envelope) -> bool {
        self.sender.send(envelope)
    }

    pub fn send_app<P: AppPayload>(&self, payload: &P) -> bool {
        self.sender.send_app(payload)
    }

    /// Queue a `Shutdown` for the server. The client closes after sending it.
    pub fn shutdown(&self) -> bool {
        self.sender.shutdown()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
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

struct SignalClientLoop {
    socket: LoopSocket,
    sender: SignalSender,
    listeners: Listeners<dyn Fn(&Envelope) + Send + Sync>,
    state: SharedState,
    idle_sleep: Duration,
    buf: Vec<u8>,
}

impl SignalClientLoop {
    fn receive(&mut self) -> anyhow::Result<bool> {
        let len = match self.socket.get()?.try_recv(&mut self.buf) {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => {
                // e.g. ICMP port unreachable while the server is down
                tracing::debug!(error = %e, "signal client recv failed");
                return Ok(true);
            }
        };

        match Envelope::decode(&self.buf[..len]) {
            Ok(envelope) => {
                tracing::debug!(kind = envelope.kind(), "signal received");
                for listener in self.listeners.snapshot() {
                    listener(&envelope);
                }
                if envelope.is_shutdown() {
                    begin_drain(&self.state, "client");
                }
            }
            Err(e) => tracing::warn!(error = %e, "undecodable signal, discarding"),
        }
        Ok(true)
    }
}

impl WorkerLoop for SignalClientLoop {
    async fn on_start(&mut self) -> anyhow::Result<()> {
        self.socket.activate()
    }

    async fn on_loop(&mut self, ctl: &WorkerControl) -> anyhow::Result<()> {
        let mut worked = false;

        if self.state.get() == SessionState::Running {
            worked = self.receive()?;
        }

        if let Some(queued) = self.sender.poll() {
            worked = true;
            if let Err(e) = self.socket.get()?.send(&queued.bytes).await {
                tracing::warn!(kind = queued.kind, error = %e, "signal send failed");
            }
            if queued.shutdown {
                begin_drain(&self.state, "client");
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
        tracing::info!("signal client closed");
    }
}
