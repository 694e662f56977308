//! Simulated microscope.
//!
//! Renders 50×50 Int8 slices of a noisy sphere centred in a 300³ stage.
//! Live mode and stack acquisition run on their own threads and push into
//! the output queue like a real device would. Used by `scopelinkd serve`
//! and by tests that need a producer.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use crossbeam_channel::Receiver;
use rand::Rng;
use scopelink_core::signal::{
    AblationPoint, AblationResults, AcquireStack, HardwareDimensions, MicroscopeSignal,
    MicroscopeStatus, NumericType, ServerState, Size2, Slice, Stack, StackMembership, Vec3,
};

use crate::hardware::{output_channel, MicroscopeHardware, OutputSender};

const STAGE_EXTENT: f32 = 300.0;
const IMAGE_SIDE: u32 = 50;
const OUTPUT_CAPACITY: usize = 10;
const OUTPUT_WAIT: Duration = Duration::from_secs(1);

/// Unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct DemoInner {
    dims: HardwareDimensions,
    status: Mutex<MicroscopeStatus>,
    current_stack: Mutex<Option<StackMembership>>,
    out: OutputSender,
    next_id: AtomicI32,
    live: AtomicBool,
    frame_interval: Duration,
}

impl DemoInner {
    fn status(&self) -> MutexGuard<'_, MicroscopeStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stack(&self) -> MutexGuard<'_, Option<StackMembership>> {
        self.current_stack
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `change` and announce the new status.
    fn update_status(&self, change: impl FnOnce(&mut MicroscopeStatus)) {
        let snapshot = {
            let mut status = self.status();
            change(&mut status);
            status.clone()
        };
        self.out.emit(MicroscopeSignal::Status(snapshot));
    }

    fn set_stage(&self, target: Vec3) {
        let safe = self.dims.coerce_position(target);
        self.update_status(|s| s.stage_position = safe);
    }

    fn snap(&self) {
        let position = self.status().stage_position;
        let data = render_slice(position, self.dims.image_size);
        let slice = Slice {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            created_ms: now_millis(),
            stage_pos: position,
            size: data.len() as u32,
            stack: *self.stack(),
            data: Some(data),
        };
        self.out.emit(MicroscopeSignal::Slice(slice));
    }

    fn run_stack(&self, meta: AcquireStack) {
        let start = self.dims.coerce_position(meta.start);
        let end = self.dims.coerce_position(meta.end);
        let dist = end.sub(start);
        let steps = if meta.step_size > 0.0 {
            (dist.length() / meta.step_size).round().max(1.0) as u32
        } else {
            1
        };
        let step = dist.scale(1.0 / steps as f32);

        let stack_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.out.emit(MicroscopeSignal::Stack(Stack {
            id: stack_id,
            live: meta.live,
            from: start,
            to: end,
            slices_count: steps,
            created_ms: now_millis(),
        }));

        for i in 0..steps {
            self.set_stage(start.add(step.scale(i as f32)));
            *self.stack() = Some(StackMembership {
                stack_id,
                index: i as i32,
            });
            self.snap();
        }

        *self.stack() = None;
        self.update_status(|s| s.state = ServerState::Manual);
        tracing::info!(stack_id, slices = steps, "stack acquired");
    }
}

/// Noisy sphere, brightest at the stage centre.
fn render_slice(position: Vec3, size: Size2) -> Bytes {
    let mut rng = rand::thread_rng();
    let center = STAGE_EXTENT / 2.0;
    let mut data = Vec::with_capacity((size.x * size.y) as usize);
    for y in 0..size.y {
        for x in 0..size.x {
            let d = Vec3::new(
                center - (position.x + x as f32),
                center - (position.y + y as f32),
                center - position.z,
            )
            .length()
                / STAGE_EXTENT;
            let noise: f32 = rng.gen_range(0.0..0.08);
            let value = (1.0 - 2.0 * d - noise).clamp(0.0, 1.0);
            data.push((value * 255.0) as u8);
        }
    }
    Bytes::from(data)
}

/// Simulated microscope with procedural slices.
pub struct DemoHardware {
    inner: Arc<DemoInner>,
    output: Receiver<MicroscopeSignal>,
}

impl DemoHardware {
    /// `frame_interval` is the pause between live frames.
    pub fn new(frame_interval: Duration) -> Self {
        let (out, output) = output_channel(OUTPUT_CAPACITY, OUTPUT_WAIT);
        let dims = HardwareDimensions {
            stage_min: Vec3::splat(0.0),
            stage_max: Vec3::splat(STAGE_EXTENT),
            image_size: Size2 {
                x: IMAGE_SIDE,
                y: IMAGE_SIDE,
            },
            vertex_diameter: 1.0,
            numeric_type: NumericType::Int8,
        };
        let status = MicroscopeStatus {
            state: ServerState::Manual,
            stage_position: Vec3::default(),
            live: false,
        };

        out.emit(MicroscopeSignal::Dimensions(dims.clone()));
        out.emit(MicroscopeSignal::Status(status.clone()));

        Self {
            inner: Arc::new(DemoInner {
                dims,
                status: Mutex::new(status),
                current_stack: Mutex::new(None),
                out,
                next_id: AtomicI32::new(0),
                live: AtomicBool::new(false),
                frame_interval,
            }),
            output,
        }
    }

    fn spawn(&self, name: &str, job: impl FnOnce(Arc<DemoInner>) + Send + 'static) -> bool {
        let inner = self.inner.clone();
        match std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || job(inner))
        {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(thread = name, error = %e, "failed to spawn demo thread");
                false
            }
        }
    }
}

impl Drop for DemoHardware {
    fn drop(&mut self) {
        self.inner.live.store(false, Ordering::Release);
    }
}

impl MicroscopeHardware for DemoHardware {
    fn dimensions(&self) -> HardwareDimensions {
        self.inner.dims.clone()
    }

    fn status(&self) -> MicroscopeStatus {
        self.inner.status().clone()
    }

    fn snap_slice(&self) {
        self.inner.snap();
    }

    fn move_stage(&self, target: Vec3) {
        self.inner.set_stage(target);
    }

    fn acquire_stack(&self, meta: AcquireStack) {
        let state = self.inner.status().state;
        if state != ServerState::Manual {
            tracing::warn!(?state, "microscope busy, stack command ignored");
            return;
        }
        self.inner.update_status(|s| s.state = ServerState::Stack);
        if !self.spawn("demo-stack", move |inner| inner.run_stack(meta)) {
            self.inner.update_status(|s| s.state = ServerState::Manual);
        }
    }

    fn ablate_points(&self, points: Vec<AblationPoint>) {
        for p in &points {
            tracing::info!(position = ?p.position, dwell_us = p.dwell_time_us, "ablating point");
        }
        let mut rng = rand::thread_rng();
        let per_point_ms = points.iter().map(|_| rng.gen_range(40..60)).collect();
        self.inner
            .out
            .emit(MicroscopeSignal::AblationResults(AblationResults {
                total_time_ms: points.len() as u32 * 50,
                per_point_ms,
            }));
    }

    fn go_live(&self) {
        let state = self.inner.status().state;
        if state != ServerState::Manual || self.inner.live.swap(true, Ordering::AcqRel) {
            tracing::warn!(?state, "microscope not manual, not going live");
            return;
        }
        self.inner.update_status(|s| {
            s.state = ServerState::Live;
            s.live = true;
        });
        let spawned = self.spawn("demo-live", |inner| {
            while inner.live.load(Ordering::Acquire) {
                inner.snap();
                std::thread::sleep(inner.frame_interval);
            }
        });
        if !spawned {
            self.stop();
        }
    }

    fn stop(&self) {
        if self.inner.status().state == ServerState::Live {
            self.inner.live.store(false, Ordering::Release);
            self.inner.update_status(|s| {
                s.state = ServerState::Manual;
                s.live = false;
            });
        }
    }

    fn shutdown(&self) {
        self.stop();
    }

    fn output(&self) -> Receiver<MicroscopeSignal> {
        self.output.clone()
    }
}
