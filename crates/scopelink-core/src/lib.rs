//! scopelink-core — shared wire format, signal model and configuration.
//! All other ScopeLink crates depend on this one.

pub mod config;
pub mod signal;
pub mod wire;

pub use config::ScopeLinkConfig;
pub use signal::{AppPayload, ControlSignal, Envelope, MicroscopeSignal, RemoteSignal, Slice};
