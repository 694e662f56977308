//! scopelinkd — network endpoints for remote microscope control.
//!
//! Two protocols run side by side:
//!
//!   signal session   small JSON envelopes, one server socket, many clients
//!   chunked transfer large slice payloads pulled from the server's cache
//!
//! `remote` ties both to a `MicroscopeHardware` on each side, and
//! `discovery` lets consumers find running servers on the local network.

pub mod chunk;
pub mod discovery;
pub mod error;
pub mod net;
pub mod remote;
pub mod session;

pub use chunk::{ChunkClient, ChunkServer, SliceFetch};
pub use discovery::{Announcer, DiscoveredServer, ServiceExplorer};
pub use error::EndpointError;
pub use remote::{RemoteClient, RemoteServer};
pub use session::{SessionState, SignalClient, SignalSender, SignalServer};
