//! Hardware abstraction the orchestration layer wraps.
//!
//! A microscope (real, simulated or remote) takes commands through
//! `MicroscopeHardware` and produces `MicroscopeSignal`s asynchronously on a
//! bounded output queue. Drivers live outside this workspace.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use scopelink_core::signal::{
    AblationPoint, AcquireStack, ControlSignal, HardwareDimensions, MicroscopeSignal,
    MicroscopeStatus, Vec3,
};

pub trait MicroscopeHardware: Send + Sync {
    fn dimensions(&self) -> HardwareDimensions;
    fn status(&self) -> MicroscopeStatus;

    fn snap_slice(&self);
    fn move_stage(&self, target: Vec3);
    fn acquire_stack(&self, meta: AcquireStack);
    fn ablate_points(&self, points: Vec<AblationPoint>);
    fn go_live(&self);
    fn stop(&self);
    fn shutdown(&self);

    /// Start whatever acquisition the device is configured for.
    fn start_acquisition(&self) {
        self.snap_slice();
    }

    /// Opaque device command. Ignored unless the device defines one.
    fn device_specific(&self, data: &[u8]) {
        tracing::debug!(len = data.len(), "device specific command ignored");
    }

    /// Queue of produced signals. Every call returns a handle to the same queue.
    fn output(&self) -> Receiver<MicroscopeSignal>;
}

/// Route a decoded client command to the matching hardware operation.
pub fn dispatch_control(hardware: &dyn MicroscopeHardware, signal: ControlSignal) {
    match signal {
        ControlSignal::MoveStage { target } => hardware.move_stage(target),
        ControlSignal::SnapImage => hardware.snap_slice(),
        ControlSignal::AcquireStack(meta) => hardware.acquire_stack(meta),
        ControlSignal::AblationPoints { points } => hardware.ablate_points(points),
        ControlSignal::Live => hardware.go_live(),
        ControlSignal::Stop => hardware.stop(),
        ControlSignal::StartAcquisition => hardware.start_acquisition(),
        ControlSignal::Shutdown => hardware.shutdown(),
        ControlSignal::DeviceSpecific { data } => hardware.device_specific(&data),
    }
}

// ── Output queue ──────────────────────────────────────────────────────────────

/// Producer side of a hardware output queue.
#[derive(Clone)]
pub struct OutputSender {
    tx: Sender<MicroscopeSignal>,
    wait: Duration,
}

/// Bounded output queue. Emits wait up to `wait` before dropping.
pub fn output_channel(capacity: usize, wait: Duration) -> (OutputSender, Receiver<MicroscopeSignal>) {
    let (tx, rx) = bounded(capacity);
    (OutputSender { tx, wait }, rx)
}

impl OutputSender {
    /// Returns false if the signal was dropped.
    pub fn emit(&self, signal: MicroscopeSignal) -> bool {
        match self.tx.send_timeout(signal, self.wait) {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(signal)) => {
                tracing::warn!(
                    signal = signal_kind(&signal),
                    "hardware output full, signal dropped"
                );
                false
            }
            Err(SendTimeoutError::Disconnected(_)) => false,
        }
    }
}

pub fn signal_kind(signal: &MicroscopeSignal) -> &'static str {
    match signal {
        MicroscopeSignal::Status(_) => "status",
        MicroscopeSignal::Dimensions(_) => "dimensions",
        MicroscopeSignal::Slice(_) => "slice",
        MicroscopeSignal::Stack(_) => "stack",
        MicroscopeSignal::AblationResults(_) => "ablation_results",
    }
}
