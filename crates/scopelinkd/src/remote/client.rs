//! Consumer side: a remote microscope that looks like local hardware.
//!
//! Metadata-only slices trigger a chunk pull; the slice is held in
//! `pending` until its payload arrives and then surfaces on the local
//! output queue with the data attached. All other signals surface as they
//! arrive. Commands are sent to the server as `ControlSignal`s.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};
use dashmap::DashMap;
use scopelink_core::config::ScopeLinkConfig;
use scopelink_core::signal::{
    AblationPoint, AcquireStack, AppPayload, ControlSignal, Envelope, HardwareDimensions,
    MicroscopeSignal, MicroscopeStatus, RemoteSignal, RemoteStatus, ServerState, Slice, Vec3,
};
use scopelink_services::{output_channel, MicroscopeHardware, OutputSender, Worker, WorkerControl, WorkerLoop};

use super::{OUTPUT_CAPACITY, OUTPUT_POLL_STEP};
use crate::chunk::{ChunkClient, SliceFetch};
use crate::error::EndpointError;
use crate::session::{ClientListener, SessionState, SignalClient};

struct ClientShared {
    chunk: ChunkClient,
    /// Metadata of slices whose payload is being pulled, by cache id.
    pending: DashMap<i32, Slice>,
    dimensions: Mutex<HardwareDimensions>,
    status: Mutex<MicroscopeStatus>,
    remote_status: Mutex<Option<RemoteStatus>>,
    server_name: Mutex<Option<String>>,
    out: OutputSender,
}

impl ClientShared {
    fn new(chunk: ChunkClient, out: OutputSender) -> Self {
        Self {
            chunk,
            pending: DashMap::new(),
            dimensions: Mutex::new(HardwareDimensions::empty()),
            status: Mutex::new(MicroscopeStatus {
                state: ServerState::Startup,
                stage_position: Vec3::default(),
                live: false,
            }),
            remote_status: Mutex::new(None),
            server_name: Mutex::new(None),
            out,
        }
    }

    fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
        m.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs on the signal client thread.
    fn on_server_signal(&self, pump: &WorkerControl, envelope: &Envelope) {
        match envelope {
            Envelope::Hello { name, kind, .. } => {
                tracing::info!(server = %name, ?kind, "connected to server");
                *Self::lock(&self.server_name) = Some(name.clone());
            }
            Envelope::Shutdown => pump.request_stop(),
            Envelope::SignOn => tracing::debug!("ignoring sign-on from server"),
            Envelope::AppSpecific { .. } => match RemoteSignal::from_envelope(envelope) {
                Ok(RemoteSignal::Status(status)) => {
                    tracing::debug!(clients = status.connected_clients, "server status");
                    *Self::lock(&self.remote_status) = Some(status);
                }
                Ok(RemoteSignal::Microscope(signal)) => self.on_microscope_signal(pump, signal),
                Err(e) => tracing::warn!(error = %e, "undecodable server signal"),
            },
        }
    }

    fn on_microscope_signal(&self, pump: &WorkerControl, signal: MicroscopeSignal) {
        match signal {
            MicroscopeSignal::Slice(slice) if slice.is_metadata_only() => {
                // Held before the pull is queued: the fetch may finish first.
                let (id, size) = (slice.id, slice.size as usize);
                self.pending.insert(id, slice);
                if !self.chunk.request_slice(id, size) {
                    tracing::warn!(slice_id = id, "slice pull not queued, dropping announcement");
                    self.pending.remove(&id);
                }
            }
            MicroscopeSignal::Dimensions(dims) => {
                *Self::lock(&self.dimensions) = dims.clone();
                self.out.emit(MicroscopeSignal::Dimensions(dims));
            }
            MicroscopeSignal::Status(status) => {
                *Self::lock(&self.status) = status.clone();
                let shutting_down = status.state == ServerState::ShuttingDown;
                self.out.emit(MicroscopeSignal::Status(status));
                if shutting_down {
                    tracing::info!("server shutting down, closing remote client");
                    pump.request_stop();
                }
            }
            other => {
                self.out.emit(other);
            }
        }
    }

    /// Re-attach a pulled payload to its held metadata.
    fn on_fetch(&self, fetch: SliceFetch) {
        match fetch {
            SliceFetch::Complete { slice_id, data } => {
                let Some((_, meta)) = self.pending.remove(&slice_id) else {
                    tracing::warn!(slice_id, "got data for a slice that was not requested");
                    return;
                };
                if data.len() != meta.size as usize {
                    tracing::error!(
                        slice_id,
                        received = data.len(),
                        announced = meta.size,
                        "slice size mismatch"
                    );
                }
                self.out.emit(MicroscopeSignal::Slice(Slice {
                    data: Some(data),
                    ..meta
                }));
            }
            SliceFetch::Unavailable { slice_id } => {
                self.pending.remove(&slice_id);
                tracing::warn!(slice_id, "slice evicted on server before it could be pulled");
            }
        }
    }
}

/// Remote microscope behind a `RemoteServer`.
pub struct RemoteClient {
    pump: Worker,
    signals: SignalClient,
    shared: Arc<ClientShared>,
    output: Receiver<MicroscopeSignal>,
}

impl RemoteClient {
    /// Connect to `network.host` at the base port and base port + 1.
    pub fn connect(config: &ScopeLinkConfig) -> Result<Self, EndpointError> {
        Self::connect_to(
            &config.network.signal_addr(),
            &config.network.chunk_addr(),
            config,
        )
    }

    pub fn connect_to(
        signal_addr: &str,
        chunk_addr: &str,
        config: &ScopeLinkConfig,
    ) -> Result<Self, EndpointError> {
        config.validate()?;

        let chunk = ChunkClient::connect(chunk_addr, &config.transfer)?;
        let (out, output) = output_channel(OUTPUT_CAPACITY, config.remote.poll_timeout());
        let shared = Arc::new(ClientShared::new(chunk, out));

        let hooks = RemoteClientLoop {
            shared: shared.clone(),
            fetches: shared.chunk.results(),
            poll_timeout: config.remote.poll_timeout(),
        };
        let pump = Worker::start("remote-client", hooks)?;

        let listener_shared = shared.clone();
        let pump_ctl = pump.control();
        let listener: ClientListener = Arc::new(move |envelope: &Envelope| {
            listener_shared.on_server_signal(&pump_ctl, envelope);
        });
        let signals = SignalClient::connect(signal_addr, &config.session, vec![listener])?;

        Ok(Self {
            pump,
            signals,
            shared,
            output,
        })
    }

    fn command(&self, command: ControlSignal) {
        if !self.signals.send_app(&command) {
            tracing::warn!(?command, "command not sent");
        }
    }

    /// False once the server has shut down or `close` was called.
    pub fn is_running(&self) -> bool {
        self.pump.is_running() && self.signals.state() != SessionState::Closed
    }

    /// Slices announced but not yet pulled.
    pub fn pending_slices(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn server_name(&self) -> Option<String> {
        ClientShared::lock(&self.shared.server_name).clone()
    }

    pub fn remote_status(&self) -> Option<RemoteStatus> {
        ClientShared::lock(&self.shared.remote_status).clone()
    }

    /// Stop all local workers without telling the server.
    pub fn close(&mut self) {
        self.shared.chunk.request_stop();
        if let Err(e) = self.pump.stop().join() {
            tracing::warn!(error = %e, "remote client pump ended with error");
        }
        if let Err(e) = self.signals.stop().join() {
            tracing::warn!(error = %e, "signal client ended with error");
        }
    }
}

impl MicroscopeHardware for RemoteClient {
    fn dimensions(&self) -> HardwareDimensions {
        ClientShared::lock(&self.shared.dimensions).clone()
    }

    fn status(&self) -> MicroscopeStatus {
        ClientShared::lock(&self.shared.status).clone()
    }

    fn snap_slice(&self) {
        self.command(ControlSignal::SnapImage);
    }

    fn move_stage(&self, target: Vec3) {
        self.command(ControlSignal::MoveStage { target });
    }

    fn acquire_stack(&self, meta: AcquireStack) {
        self.command(ControlSignal::AcquireStack(meta));
    }

    fn ablate_points(&self, points: Vec<AblationPoint>) {
        self.command(ControlSignal::AblationPoints { points });
    }

    fn go_live(&self) {
        self.command(ControlSignal::Live);
    }

    fn stop(&self) {
        self.command(ControlSignal::Stop);
    }

    fn start_acquisition(&self) {
        self.command(ControlSignal::StartAcquisition);
    }

    /// Ask the server to shut down. The client closes when the server
    /// confirms with a `ShuttingDown` status.
    fn shutdown(&self) {
        tracing::info!("requesting server shutdown");
        self.command(ControlSignal::Shutdown);
    }

    fn device_specific(&self, data: &[u8]) {
        self.command(ControlSignal::DeviceSpecific {
            data: data.to_vec(),
        });
    }

    fn output(&self) -> Receiver<MicroscopeSignal> {
        self.output.clone()
    }
}

struct RemoteClientLoop {
    shared: Arc<ClientShared>,
    fetches: Receiver<SliceFetch>,
    poll_timeout: Duration,
}

impl WorkerLoop for RemoteClientLoop {
    async fn on_loop(&mut self, _ctl: &WorkerControl) -> anyhow::Result<()> {
        let deadline = Instant::now() + self.poll_timeout;
        loop {
            match self.fetches.try_recv() {
                Ok(fetch) => {
                    self.shared.on_fetch(fetch);
                    return Ok(());
                }
                Err(TryRecvError::Disconnected) => anyhow::bail!("chunk client result queue closed"),
                Err(TryRecvError::Empty) if Instant::now() >= deadline => return Ok(()),
                Err(TryRecvError::Empty) => tokio::time::sleep(OUTPUT_POLL_STEP).await,
            }
        }
    }

    async fn on_close(&mut self) {
        self.shared.chunk.request_stop();
        if !self.shared.pending.is_empty() {
            tracing::debug!(pending = self.shared.pending.len(), "remote client closed with pending slices");
        }
        self.shared.pending.clear();
        tracing::info!("remote client closed");
    }
}
