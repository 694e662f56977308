//! Chunked transfer — the data plane.
//!
//! A consumer pulls a cached slice from the producer's chunk port in
//! pieces of at most `chunk_cap` bytes. Requests and replies are frames in
//! the `scopelink_core::wire` format on one TCP stream per client. There are
//! no retries: replies lost with a broken stream leave their pull
//! unfinished.

pub mod client;
pub mod server;

pub use client::{ChunkClient, SliceFetch};
pub use server::{build_reply, high_water_mark, ChunkServer};
