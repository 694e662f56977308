//! Periodic announcement of one server.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use scopelink_core::config::DiscoveryConfig;
use scopelink_core::wire::ServiceAnnouncement;
use scopelink_services::{Worker, WorkerControl, WorkerJoin, WorkerLoop};
use tokio::time::{interval, Interval, MissedTickBehavior};
use zerocopy::AsBytes;

use crate::error::EndpointError;
use crate::net::{announce_socket, resolve, LoopSocket};

/// Advertises a server until stopped; stopping sends the goodbye.
pub struct Announcer {
    worker: Worker,
    group: SocketAddr,
}

impl Announcer {
    pub fn start(announcement: ServiceAnnouncement, config: &DiscoveryConfig) -> Result<Self, EndpointError> {
        let group = resolve(&config.group)?;
        let socket = announce_socket(group)?;

        let hooks = AnnounceLoop {
            socket: LoopSocket::new(socket),
            group,
            announcement,
            period: config.interval(),
            ticker: None,
        };
        let worker = Worker::start(format!("announce-{}", announcement.signal_port.get()), hooks)?;
        tracing::info!(
            %group,
            name = announcement.name(),
            signal_port = announcement.signal_port.get(),
            "announcing server"
        );
        Ok(Self { worker, group })
    }

    pub fn group(&self) -> SocketAddr {
        self.group
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub fn stop(&mut self) -> WorkerJoin {
        self.worker.stop()
    }
}

struct AnnounceLoop {
    socket: LoopSocket,
    group: SocketAddr,
    announcement: ServiceAnnouncement,
    period: Duration,
    ticker: Option<Interval>,
}

impl WorkerLoop for AnnounceLoop {
    async fn on_start(&mut self) -> anyhow::Result<()> {
        self.socket.activate()?;
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
        Ok(())
    }

    async fn on_loop(&mut self, _ctl: &WorkerControl) -> anyhow::Result<()> {
        self.ticker
            .as_mut()
            .context("announcer ticked before start")?
            .tick()
            .await;

        let socket = self.socket.get()?;
        if let Err(e) = socket.send_to(self.announcement.as_bytes(), self.group).await {
            tracing::warn!(group = %self.group, error = %e, "announcement failed");
        }
        Ok(())
    }

    async fn on_close(&mut self) {
        let goodbye = self.announcement.leaving();
        if let Ok(socket) = self.socket.get() {
            if let Err(e) = socket.send_to(goodbye.as_bytes(), self.group).await {
                tracing::debug!(group = %self.group, error = %e, "goodbye not sent");
            }
        }
        tracing::info!(name = self.announcement.name(), "announcement withdrawn");
    }
}
