//! scopelink-services — building blocks shared by every ScopeLink endpoint.
//!
//! The worker lifecycle, the slice cache, bounded outgoing queues, chunk
//! planning and reassembly, and the hardware abstraction the orchestration
//! layer wraps. Nothing in here touches a socket.

pub mod cache;
pub mod demo;
pub mod hardware;
pub mod outgoing;
pub mod transfer;
pub mod worker;

pub use cache::{InsertOutcome, SliceCache};
pub use demo::DemoHardware;
pub use hardware::{dispatch_control, output_channel, MicroscopeHardware, OutputSender};
pub use outgoing::OutgoingQueue;
pub use transfer::{plan_requests, ReassemblyBuffer, ReassemblyError};
pub use worker::{Worker, WorkerControl, WorkerError, WorkerJoin, WorkerLoop};
