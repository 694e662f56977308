//! Orchestration — binds a hardware output queue to the two protocols.
//!
//! Large payloads never travel on the signal session: the server parks them
//! in its slice cache and announces metadata only, the client pulls them
//! over the chunk port and re-attaches them before surfacing the slice.

pub mod client;
pub mod server;

pub use client::RemoteClient;
pub use server::RemoteServer;

use std::time::Duration;

/// Step between non-blocking polls of a crossbeam queue inside a worker.
const OUTPUT_POLL_STEP: Duration = Duration::from_millis(5);

/// Capacity of a remote client's local output queue.
const OUTPUT_CAPACITY: usize = 64;
