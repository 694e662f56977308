//! Control-plane signal model.
//!
//! Two layers. The outer `Envelope` is what the session protocol moves; it
//! knows sign-on, hello and shutdown, and carries everything else as opaque
//! `AppSpecific` bytes. Domain signals (`RemoteSignal`, `ControlSignal`) are
//! serialized into those bytes and decoded only by the orchestration layer.
//!
//! Every decode is exhaustive: an unknown tag or a missing field is a typed
//! `SignalError`, never a silently defaulted value.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ── Envelope ──────────────────────────────────────────────────────────────────

/// Kind of server announcing itself in a `Hello`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerKind {
    Microscope,
    VolumeStream,
}

/// Outer message exchanged by `SignalServer` and `SignalClient`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Envelope {
    /// First message of every client. Registers its identity with the server.
    SignOn,

    /// Server self-identification, sent to newly signed-on clients.
    Hello {
        name: String,
        kind: ServerKind,
        detail: String,
    },

    /// Opaque, nested domain payload.
    AppSpecific { data: Vec<u8> },

    /// Endpoint flushes its outgoing queue and closes once this is seen.
    Shutdown,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, SignalError> {
        serde_json::to_vec(self).map_err(SignalError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SignalError> {
        if bytes.is_empty() {
            return Err(SignalError::Empty);
        }
        serde_json::from_slice(bytes).map_err(SignalError::Malformed)
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, Envelope::Shutdown)
    }

    /// Short variant name for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::SignOn => "sign_on",
            Envelope::Hello { .. } => "hello",
            Envelope::AppSpecific { .. } => "app_specific",
            Envelope::Shutdown => "shutdown",
        }
    }
}

/// A domain signal that travels inside `Envelope::AppSpecific`.
pub trait AppPayload: Serialize + DeserializeOwned {
    fn to_envelope(&self) -> Result<Envelope, SignalError> {
        let data = serde_json::to_vec(self).map_err(SignalError::Encode)?;
        Ok(Envelope::AppSpecific { data })
    }

    fn from_envelope(envelope: &Envelope) -> Result<Self, SignalError> {
        match envelope {
            Envelope::AppSpecific { data } => {
                serde_json::from_slice(data).map_err(SignalError::Malformed)
            }
            other => Err(SignalError::NotAppSpecific(other.kind())),
        }
    }
}

// ── Geometry ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn splat(v: f32) -> Self {
        Self::new(v, v, v)
    }

    pub fn sub(self, other: Vec3) -> Vec3 {
        Vec3::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    pub fn add(self, other: Vec3) -> Vec3 {
        Vec3::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }

    pub fn scale(self, factor: f32) -> Vec3 {
        Vec3::new(self.x * factor, self.y * factor, self.z * factor)
    }

    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    fn clamp(self, min: Vec3, max: Vec3) -> Vec3 {
        Vec3::new(
            self.x.clamp(min.x, max.x),
            self.y.clamp(min.y, max.y),
            self.z.clamp(min.z, max.z),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Size2 {
    pub x: u32,
    pub y: u32,
}

// ── Microscope signals ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerState {
    Live,
    Manual,
    ShuttingDown,
    Stack,
    Startup,
    Ablation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumericType {
    Int8,
    Int16,
}

impl NumericType {
    pub fn bytes(self) -> u32 {
        match self {
            NumericType::Int8 => 1,
            NumericType::Int16 => 2,
        }
    }
}

/// Which stack a slice belongs to and where in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackMembership {
    pub stack_id: i32,
    pub index: i32,
}

/// One image plane plus its positional and temporal metadata.
///
/// A slice with `data == None` and `size > 0` is metadata-only: its payload
/// sits in the server's slice cache under `id` and has to be pulled over the
/// chunk protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slice {
    pub id: i32,
    /// Unix time in milliseconds.
    pub created_ms: u64,
    pub stage_pos: Vec3,
    /// Payload size in bytes.
    pub size: u32,
    pub stack: Option<StackMembership>,
    pub data: Option<Bytes>,
}

impl Slice {
    pub fn is_metadata_only(&self) -> bool {
        self.data.is_none() && self.size > 0
    }

    /// Copy with the payload stripped, for the control channel.
    /// `size` is taken from the stripped payload, so it is exactly what a
    /// consumer must pull.
    pub fn metadata_only(&self, id: i32) -> Slice {
        Slice {
            id,
            size: self.data.as_ref().map_or(self.size, |d| d.len() as u32),
            data: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    pub id: i32,
    pub live: bool,
    pub from: Vec3,
    pub to: Vec3,
    pub slices_count: u32,
    pub created_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareDimensions {
    pub stage_min: Vec3,
    pub stage_max: Vec3,
    pub image_size: Size2,
    /// Pixel to stage coordinate ratio.
    pub vertex_diameter: f32,
    pub numeric_type: NumericType,
}

impl HardwareDimensions {
    pub fn empty() -> Self {
        Self {
            stage_min: Vec3::default(),
            stage_max: Vec3::default(),
            image_size: Size2::default(),
            vertex_diameter: 1.0,
            numeric_type: NumericType::Int16,
        }
    }

    /// Bytes of one slice with these dimensions.
    pub fn byte_size(&self) -> u32 {
        self.image_size.x * self.image_size.y * self.numeric_type.bytes()
    }

    /// Clamp a stage target into the stage bounds.
    pub fn coerce_position(&self, target: Vec3) -> Vec3 {
        let safe = target.clamp(self.stage_min, self.stage_max);
        if safe != target {
            tracing::warn!(?target, ?safe, "stage target coerced into stage bounds");
        }
        safe
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicroscopeStatus {
    pub state: ServerState,
    pub stage_position: Vec3,
    pub live: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AblationResults {
    pub total_time_ms: u32,
    pub per_point_ms: Vec<u32>,
}

impl AblationResults {
    pub fn mean(&self) -> Option<u32> {
        if self.per_point_ms.is_empty() {
            return None;
        }
        let sum: u64 = self.per_point_ms.iter().map(|&t| u64::from(t)).sum();
        Some((sum / self.per_point_ms.len() as u64) as u32)
    }
}

/// Everything a microscope (real, demo or remote) produces on its output queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MicroscopeSignal {
    Status(MicroscopeStatus),
    Dimensions(HardwareDimensions),
    Slice(Slice),
    Stack(Stack),
    AblationResults(AblationResults),
}

// ── Server → client domain payload ────────────────────────────────────────────

/// Server-level status, independent of the wrapped hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStatus {
    pub data_ports: Vec<u16>,
    pub connected_clients: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RemoteSignal {
    Status(RemoteStatus),
    Microscope(MicroscopeSignal),
}

impl AppPayload for RemoteSignal {}

// ── Client → server domain payload ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquireStack {
    pub start: Vec3,
    pub end: Vec3,
    pub step_size: f32,
    pub live: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AblationPoint {
    pub position: Vec3,
    pub dwell_time_us: u32,
    pub laser_on: bool,
}

/// Hardware commands a consumer sends to the producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ControlSignal {
    MoveStage { target: Vec3 },
    SnapImage,
    AcquireStack(AcquireStack),
    AblationPoints { points: Vec<AblationPoint> },
    Live,
    Stop,
    StartAcquisition,
    Shutdown,
    DeviceSpecific { data: Vec<u8> },
}

impl AppPayload for ControlSignal {}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("empty signal payload")]
    Empty,

    #[error("malformed signal: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("failed to encode signal: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("expected an app-specific envelope, got {0}")]
    NotAppSpecific(&'static str),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
