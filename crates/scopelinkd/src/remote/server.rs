//! Producer side: exposes a `MicroscopeHardware` over the network.
//!
//! A pump worker drains the hardware output queue. Slices whose payload is
//! larger than `inline_payload_limit` are moved into the slice cache under a
//! fresh id and announced metadata-only; everything else goes out on the
//! signal session unchanged. Client signals arrive through the signal
//! server's listener, which only forwards them to the pump; the pump answers
//! sign-ons and dispatches commands to the hardware, so a slow device or a
//! full outgoing queue never stalls the signal session itself.
//!
//! While it runs the server is announced on the discovery group unless
//! `remote.announce` is off.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use scopelink_core::config::ScopeLinkConfig;
use scopelink_core::signal::{
    AcquireStack, AppPayload, ControlSignal, Envelope, MicroscopeSignal, RemoteSignal, RemoteStatus,
    ServerKind, ServerState, Slice, Stack, Vec3,
};
use scopelink_core::wire::ServiceAnnouncement;
use scopelink_services::{
    dispatch_control, InsertOutcome, MicroscopeHardware, SliceCache, Worker, WorkerControl, WorkerLoop,
};

use super::OUTPUT_POLL_STEP;
use crate::chunk::ChunkServer;
use crate::discovery::Announcer;
use crate::error::EndpointError;
use crate::session::{SignalSender, SignalServer};

/// Last announced stack and the metadata of its slices, for late joiners.
#[derive(Default)]
struct LastStack {
    stack: Option<Stack>,
    slices: Vec<Slice>,
}

struct RemoteShared {
    hardware: Arc<dyn MicroscopeHardware>,
    sender: SignalSender,
    hello: Envelope,
    status: Mutex<RemoteStatus>,
    last_stack: Mutex<LastStack>,
    acquire_on_connect: bool,
}

impl RemoteShared {
    fn remote_status(&self) -> MutexGuard<'_, RemoteStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn last_stack(&self) -> MutexGuard<'_, LastStack> {
        self.last_stack.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_status(&self, change: impl FnOnce(&mut RemoteStatus)) {
        let snapshot = {
            let mut status = self.remote_status();
            change(&mut status);
            status.clone()
        };
        tracing::info!(
            clients = snapshot.connected_clients,
            data_ports = ?snapshot.data_ports,
            "remote status"
        );
        self.sender.send_app(&RemoteSignal::Status(snapshot));
    }

    /// Broadcast a hardware signal. Resends skip last-stack bookkeeping.
    fn publish(&self, signal: MicroscopeSignal, resend: bool) {
        if !resend {
            let mut last = self.last_stack();
            match &signal {
                MicroscopeSignal::Stack(stack) => {
                    last.stack = Some(stack.clone());
                    last.slices.clear();
                }
                MicroscopeSignal::Slice(slice) => {
                    let last_id = last.stack.as_ref().map(|s| s.id);
                    if slice.stack.is_some_and(|m| Some(m.stack_id) == last_id) {
                        last.slices.push(slice.clone());
                    }
                }
                // New dimensions invalidate whatever was acquired before.
                MicroscopeSignal::Dimensions(_) => *last = LastStack::default(),
                _ => {}
            }
        }
        self.sender.send_app(&RemoteSignal::Microscope(signal));
    }

    fn on_sign_on(&self, client: SocketAddr) {
        tracing::info!(%client, "client signed on");
        self.sender.send(&self.hello);
        self.update_status(|s| s.connected_clients += 1);
        self.publish(MicroscopeSignal::Dimensions(self.hardware.dimensions()), true);
        self.publish(MicroscopeSignal::Status(self.hardware.status()), true);

        if !self.acquire_on_connect {
            return;
        }
        let (stack, slices) = {
            let last = self.last_stack();
            (last.stack.clone(), last.slices.clone())
        };
        match stack {
            Some(stack) => {
                tracing::info!(stack_id = stack.id, slices = slices.len(), "resending last stack");
                self.publish(MicroscopeSignal::Stack(stack), true);
                for slice in slices {
                    self.publish(MicroscopeSignal::Slice(slice), true);
                }
            }
            None => {
                tracing::info!("no previous stack, acquiring one for the new client");
                self.hardware.acquire_stack(AcquireStack {
                    start: Vec3::default(),
                    end: Vec3::default(),
                    step_size: 1.0,
                    live: false,
                });
            }
        }
    }

    fn shut_down(&self, pump: &WorkerControl) {
        tracing::info!("shutting down remote server");
        self.hardware.shutdown();
        let mut status = self.hardware.status();
        status.state = ServerState::ShuttingDown;
        self.publish(MicroscopeSignal::Status(status), true);
        self.sender.shutdown();
        pump.request_stop();
    }

    /// Runs on the pump.
    fn on_client_signal(&self, pump: &WorkerControl, client: SocketAddr, envelope: &Envelope) {
        match envelope {
            Envelope::SignOn => self.on_sign_on(client),
            Envelope::AppSpecific { .. } => match ControlSignal::from_envelope(envelope) {
                Ok(ControlSignal::Shutdown) => self.shut_down(pump),
                Ok(command) => {
                    tracing::debug!(%client, ?command, "client command");
                    dispatch_control(self.hardware.as_ref(), command);
                }
                Err(e) => tracing::warn!(%client, error = %e, "undecodable client command"),
            },
            Envelope::Shutdown => self.shut_down(pump),
            Envelope::Hello { .. } => {
                tracing::debug!(%client, "ignoring hello from client");
            }
        }
    }
}

/// Serves one microscope to any number of remote clients.
pub struct RemoteServer {
    pump: Worker,
    signals: SignalServer,
    shared: Arc<RemoteShared>,
    cache: Arc<SliceCache>,
    chunk_addr: SocketAddr,
}

impl RemoteServer {
    /// Bind on `network.bind_host` at the base port and base port + 1.
    pub fn start(
        hardware: Arc<dyn MicroscopeHardware>,
        config: &ScopeLinkConfig,
    ) -> Result<Self, EndpointError> {
        Self::bind(
            hardware,
            config,
            &config.network.signal_bind_addr(),
            &config.network.chunk_bind_addr(),
        )
    }

    /// Bind the two endpoints on explicit addresses.
    pub fn bind(
        hardware: Arc<dyn MicroscopeHardware>,
        config: &ScopeLinkConfig,
        signal_bind: &str,
        chunk_bind: &str,
    ) -> Result<Self, EndpointError> {
        config.validate()?;

        let cache = Arc::new(SliceCache::new(config.cache.capacity_bytes));
        let chunk = ChunkServer::start(chunk_bind, cache.clone(), &config.transfer)?;
        let chunk_addr = chunk.local_addr();
        let signals = SignalServer::start(signal_bind, &config.session, vec![])?;

        let shared = Arc::new(RemoteShared {
            hardware: hardware.clone(),
            sender: signals.sender(),
            hello: Envelope::Hello {
                name: config.remote.server_name.clone(),
                kind: ServerKind::Microscope,
                detail: String::new(),
            },
            status: Mutex::new(RemoteStatus {
                data_ports: vec![chunk_addr.port()],
                connected_clients: 0,
            }),
            last_stack: Mutex::new(LastStack::default()),
            acquire_on_connect: config.remote.acquire_on_connect,
        });

        let announcer = if config.remote.announce {
            let announcement = ServiceAnnouncement::new(
                &config.remote.server_name,
                ServerKind::Microscope,
                signals.local_addr().port(),
                chunk_addr.port(),
            );
            match Announcer::start(announcement, &config.discovery) {
                Ok(announcer) => Some(announcer),
                Err(e) => {
                    tracing::warn!(error = %e, "server will not be announced");
                    None
                }
            }
        } else {
            None
        };

        let (inbound_tx, inbound) = bounded(config.session.queue_capacity);
        let hooks = RemoteServerLoop {
            shared: shared.clone(),
            output: hardware.output(),
            inbound,
            cache: cache.clone(),
            chunk,
            announcer,
            next_id: 0,
            inline_limit: config.remote.inline_payload_limit,
            poll_timeout: config.remote.poll_timeout(),
        };
        let pump = Worker::start("remote-server", hooks)?;

        signals.add_listener(move |client, envelope| forward(&inbound_tx, client, envelope));

        tracing::info!(
            signal = %signals.local_addr(),
            chunk = %chunk_addr,
            name = %config.remote.server_name,
            "remote server started"
        );
        Ok(Self {
            pump,
            signals,
            shared,
            cache,
            chunk_addr,
        })
    }

    pub fn signal_addr(&self) -> SocketAddr {
        self.signals.local_addr()
    }

    pub fn chunk_addr(&self) -> SocketAddr {
        self.chunk_addr
    }

    pub fn remote_status(&self) -> RemoteStatus {
        self.shared.remote_status().clone()
    }

    pub fn connected_clients(&self) -> usize {
        self.signals.connected_clients()
    }

    pub fn cache(&self) -> Arc<SliceCache> {
        self.cache.clone()
    }

    /// Stop the hardware, as if a client had sent `Stop`.
    pub fn stop_hardware(&self) -> bool {
        self.inject(ControlSignal::Stop)
    }

    /// Shut the hardware and the server down, as if a client had asked.
    pub fn shutdown(&self) -> bool {
        self.inject(ControlSignal::Shutdown)
    }

    fn inject(&self, command: ControlSignal) -> bool {
        match command.to_envelope() {
            Ok(envelope) => self.signals.inject(envelope),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode local command");
                false
            }
        }
    }

    /// False once the server has shut down.
    pub fn is_running(&self) -> bool {
        self.pump.is_running()
    }

    /// Stop both workers without notifying clients.
    pub fn close(&mut self) {
        if let Err(e) = self.pump.stop().join() {
            tracing::warn!(error = %e, "remote server pump ended with error");
        }
        if let Err(e) = self.signals.stop().join() {
            tracing::warn!(error = %e, "signal server ended with error");
        }
    }
}

/// Hand a client signal to the pump without blocking the session loop.
fn forward(inbound: &Sender<(SocketAddr, Envelope)>, client: SocketAddr, envelope: &Envelope) {
    if inbound.try_send((client, envelope.clone())).is_err() {
        tracing::warn!(%client, "remote server busy, client signal dropped");
    }
}

enum PumpEvent {
    Client(SocketAddr, Envelope),
    Hardware(MicroscopeSignal),
}

struct RemoteServerLoop {
    shared: Arc<RemoteShared>,
    output: Receiver<MicroscopeSignal>,
    /// Client signals forwarded by the signal server's listener.
    inbound: Receiver<(SocketAddr, Envelope)>,
    cache: Arc<SliceCache>,
    chunk: ChunkServer,
    announcer: Option<Announcer>,
    next_id: i32,
    inline_limit: usize,
    poll_timeout: Duration,
}

impl RemoteServerLoop {
    /// Wait up to `poll_timeout` for a client signal or hardware output,
    /// yielding to the runtime between attempts so a stop request is never
    /// held up. Client signals go first.
    async fn next_event(&self, ctl: &WorkerControl) -> Option<PumpEvent> {
        let deadline = Instant::now() + self.poll_timeout;
        loop {
            if let Ok((client, envelope)) = self.inbound.try_recv() {
                return Some(PumpEvent::Client(client, envelope));
            }
            match self.output.try_recv() {
                Ok(signal) => return Some(PumpEvent::Hardware(signal)),
                Err(TryRecvError::Disconnected) => {
                    tracing::warn!("hardware output closed, stopping remote server");
                    ctl.request_stop();
                    return None;
                }
                Err(TryRecvError::Empty) if Instant::now() >= deadline => return None,
                Err(TryRecvError::Empty) => tokio::time::sleep(OUTPUT_POLL_STEP).await,
            }
        }
    }

    fn route_slice(&mut self, slice: Slice) {
        let Some(data) = slice.data.clone().filter(|d| d.len() > self.inline_limit) else {
            self.shared.publish(MicroscopeSignal::Slice(slice), false);
            return;
        };

        let cache_id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(0);
        match self.cache.insert(cache_id, data) {
            InsertOutcome::Stored { evicted } => {
                if !evicted.is_empty() {
                    tracing::debug!(?evicted, "slices evicted from cache");
                }
                self.shared
                    .publish(MicroscopeSignal::Slice(slice.metadata_only(cache_id)), false);
            }
            InsertOutcome::Rejected { size, .. } => {
                tracing::warn!(slice_id = slice.id, size, "slice not announced, too large to cache");
            }
        }
    }
}

impl WorkerLoop for RemoteServerLoop {
    async fn on_loop(&mut self, ctl: &WorkerControl) -> anyhow::Result<()> {
        match self.next_event(ctl).await {
            Some(PumpEvent::Client(client, envelope)) => {
                self.shared.on_client_signal(ctl, client, &envelope)
            }
            Some(PumpEvent::Hardware(MicroscopeSignal::Slice(slice))) => self.route_slice(slice),
            Some(PumpEvent::Hardware(other)) => self.shared.publish(other, false),
            None => {}
        }
        Ok(())
    }

    async fn on_close(&mut self) {
        if let Some(mut announcer) = self.announcer.take() {
            if let Err(e) = announcer.stop().join_timeout(Duration::from_secs(5)) {
                tracing::warn!(error = %e, "announcer did not stop cleanly");
            }
        }
        if let Err(e) = self.chunk.stop().join_timeout(Duration::from_secs(5)) {
            tracing::warn!(error = %e, "chunk server did not stop cleanly");
        }
        tracing::info!("remote server closed");
    }
}
