//! Service discovery on the local network.
//!
//! A running `RemoteServer` multicasts a `ServiceAnnouncement` every
//! announce interval and a goodbye when it closes. A `ServiceExplorer`
//! listens on the same group and keeps the set of servers it has heard
//! from recently, so a consumer can pick one without knowing its address.

pub mod announce;
pub mod explorer;

pub use announce::Announcer;
pub use explorer::{DiscoveredServer, ServiceExplorer};
