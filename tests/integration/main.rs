//! ScopeLink integration test harness.
//!
//! Every test runs real endpoints over UDP and TCP on 127.0.0.1 with
//! OS-assigned ports, so tests can run in parallel:
//!
//!   cargo test --test integration
//!
//! Each test owns the endpoints it starts and stops them before returning.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use crossbeam_channel::Receiver;

pub use scopelink_core::config::{ScopeLinkConfig, SessionConfig, TransferConfig};
pub use scopelink_core::signal::{Envelope, MicroscopeSignal, Slice};

// ── Harness ───────────────────────────────────────────────────────────────────

pub const LOOPBACK: &str = "127.0.0.1:0";

/// Default deadline for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(10);

/// Poll `check` until it holds or `timeout` passes.
pub fn wait_for(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !check() {
        if Instant::now() >= deadline {
            bail!("timed out after {timeout:?} waiting for {what}");
        }
        thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}

/// Session settings that keep idle loops short.
pub fn fast_session() -> SessionConfig {
    SessionConfig {
        queue_capacity: 64,
        offer_timeout_ms: 100,
        idle_sleep_ms: 5,
    }
}

/// Full endpoint config for loopback tests.
pub fn fast_config() -> ScopeLinkConfig {
    let mut config = ScopeLinkConfig::default();
    config.session = fast_session();
    config.transfer.receive_timeout_ms = 200;
    config.remote.poll_timeout_ms = 20;
    config.remote.announce = false;
    config
}

/// Shared log of whatever a listener sees.
pub type Seen<T> = Arc<Mutex<Vec<T>>>;

pub fn seen<T>() -> Seen<T> {
    Arc::new(Mutex::new(Vec::new()))
}

/// Next signal matching `pick`, skipping everything else.
pub fn next_matching<T>(
    output: &Receiver<MicroscopeSignal>,
    timeout: Duration,
    mut pick: impl FnMut(MicroscopeSignal) -> Option<T>,
) -> Result<T> {
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match output.recv_timeout(left) {
            Ok(signal) => {
                if let Some(found) = pick(signal) {
                    return Ok(found);
                }
            }
            Err(_) => bail!("no matching signal within {timeout:?}"),
        }
    }
}

/// A complete slice (payload attached) from a hardware output queue.
pub fn next_full_slice(output: &Receiver<MicroscopeSignal>) -> Result<Slice> {
    next_matching(output, WAIT, |signal| match signal {
        MicroscopeSignal::Slice(slice) if !slice.is_metadata_only() => Some(slice),
        _ => None,
    })
}

mod chunk_transfer;
mod discovery;
mod remote;
mod signaling;
