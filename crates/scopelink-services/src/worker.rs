//! Background worker lifecycle.
//!
//! Every network endpoint is a `Worker`: one OS thread driving a
//! current-thread tokio runtime through a poll loop.
//!
//!   start ─► on_start ─► while running { on_loop } ─► on_close
//!
//! `Worker::start` returns only after the thread has flagged itself running.
//! `stop` clears the flag and wakes a blocked `on_loop`; the interrupted
//! iteration is dropped and the loop exits normally. An error returned by
//! `on_loop` ends the thread immediately and `on_close` is skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// Hooks a worker thread runs. Every `on_loop` await must be bounded.
#[allow(async_fn_in_trait)]
pub trait WorkerLoop: Send + 'static {
    /// Runs once on the worker thread before the first iteration.
    async fn on_start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// One polling iteration.
    async fn on_loop(&mut self, ctl: &WorkerControl) -> anyhow::Result<()>;

    /// Runs once after the loop ends, unless `on_loop` failed.
    async fn on_close(&mut self) {}
}

// ── Control handle ────────────────────────────────────────────────────────────

struct ControlInner {
    running: AtomicBool,
    interrupt: Notify,
}

/// Cloneable stop handle. Hooks get one per iteration so they can stop
/// their own worker without holding the `Worker`.
#[derive(Clone)]
pub struct WorkerControl {
    inner: Arc<ControlInner>,
}

impl WorkerControl {
    fn new() -> Self {
        Self {
            inner: Arc::new(ControlInner {
                running: AtomicBool::new(false),
                interrupt: Notify::new(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Clear the running flag and interrupt a blocked `on_loop`.
    /// When called from inside `on_loop` the current iteration completes.
    pub fn request_stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.interrupt.notify_one();
    }

    fn mark_running(&self) {
        self.inner.running.store(true, Ordering::Release);
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to spawn worker thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {name} could not build its runtime: {source}")]
    Runtime {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {name} failed: {error:#}")]
    Loop { name: String, error: anyhow::Error },

    #[error("worker {name} panicked")]
    Panicked { name: String },

    #[error("worker {name} still running after {after:?}")]
    Timeout { name: String, after: Duration },
}

// ── Worker ────────────────────────────────────────────────────────────────────

type ThreadResult = Result<(), WorkerError>;

/// Owns one background thread running a `WorkerLoop`.
///
/// Dropping a worker stops it and joins the thread.
pub struct Worker {
    name: String,
    control: WorkerControl,
    handle: Option<JoinHandle<ThreadResult>>,
}

impl Worker {
    /// Spawn the thread and block until it is running.
    pub fn start<H: WorkerLoop>(name: impl Into<String>, hooks: H) -> Result<Self, WorkerError> {
        let name = name.into();
        let control = WorkerControl::new();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), std::io::Error>>(1);

        let thread_ctl = control.clone();
        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_thread(thread_name, thread_ctl, hooks, ready_tx))
            .map_err(|source| WorkerError::Spawn {
                name: name.clone(),
                source,
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                let _ = handle.join();
                return Err(WorkerError::Runtime { name, source });
            }
            Err(_) => {
                // Thread died before the rendezvous.
                let _ = handle.join();
                return Err(WorkerError::Panicked { name });
            }
        }

        tracing::debug!(worker = %name, "worker started");
        Ok(Self {
            name,
            control,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    pub fn control(&self) -> WorkerControl {
        self.control.clone()
    }

    /// Request a stop and hand back the join handle. Idempotent: later calls
    /// return a handle that joins immediately.
    pub fn stop(&mut self) -> WorkerJoin {
        self.control.request_stop();
        WorkerJoin {
            name: self.name.clone(),
            handle: self.handle.take(),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.control.request_stop();
        // A worker dropped by its own hooks cannot join itself.
        if handle.thread().id() == std::thread::current().id() {
            return;
        }
        if let Err(e) = join_handle(&self.name, handle) {
            tracing::warn!(worker = %self.name, error = %e, "worker ended with error");
        }
    }
}

/// Join handle returned by `Worker::stop`.
pub struct WorkerJoin {
    name: String,
    handle: Option<JoinHandle<ThreadResult>>,
}

impl WorkerJoin {
    /// Block until the worker thread exits.
    pub fn join(self) -> Result<(), WorkerError> {
        match self.handle {
            Some(handle) => join_handle(&self.name, handle),
            None => Ok(()),
        }
    }

    /// Join with an upper bound. On timeout the thread is left detached.
    pub fn join_timeout(self, timeout: Duration) -> Result<(), WorkerError> {
        let Some(handle) = self.handle else {
            return Ok(());
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                return Err(WorkerError::Timeout {
                    name: self.name,
                    after: timeout,
                });
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        join_handle(&self.name, handle)
    }
}

fn join_handle(name: &str, handle: JoinHandle<ThreadResult>) -> Result<(), WorkerError> {
    handle.join().unwrap_or_else(|_| {
        Err(WorkerError::Panicked {
            name: name.to_string(),
        })
    })
}

// ── Thread body ───────────────────────────────────────────────────────────────

fn run_thread<H: WorkerLoop>(
    name: String,
    ctl: WorkerControl,
    mut hooks: H,
    ready: mpsc::SyncSender<Result<(), std::io::Error>>,
) -> ThreadResult {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(e));
            return Ok(());
        }
    };

    ctl.mark_running();
    let _ = ready.send(Ok(()));

    let result = runtime.block_on(async {
        hooks.on_start().await?;
        while ctl.is_running() {
            tokio::select! {
                biased;
                _ = ctl.inner.interrupt.notified() => break,
                r = hooks.on_loop(&ctl) => r?,
            }
        }
        hooks.on_close().await;
        anyhow::Ok(())
    });

    match result {
        Ok(()) => {
            tracing::debug!(worker = %name, "worker closed");
            Ok(())
        }
        Err(error) => {
            ctl.inner.running.store(false, Ordering::Release);
            tracing::error!(worker = %name, error = %format!("{error:#}"), "worker loop failed");
            Err(WorkerError::Loop { name, error })
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
