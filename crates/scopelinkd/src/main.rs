//! scopelinkd — serve a demo microscope, or watch a remote one.
//!
//!   scopelinkd [serve]        expose the demo hardware on the configured ports
//!   scopelinkd watch [HOST]   connect to a server, log its signals, snap once
//!   scopelinkd discover       list servers announced on the discovery group

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;

use scopelink_core::config::ScopeLinkConfig;
use scopelink_core::signal::MicroscopeSignal;
use scopelink_services::{DemoHardware, MicroscopeHardware};
use scopelinkd::{RemoteClient, RemoteServer, ServiceExplorer};

const FRAME_INTERVAL: Duration = Duration::from_millis(200);
const TICK: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = ScopeLinkConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = ScopeLinkConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ScopeLinkConfig::default()
    });

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None | Some("serve") => serve(&config).await,
        Some("watch") => {
            if let Some(host) = args.next() {
                config.network.host = host;
            }
            watch(&config).await
        }
        Some("discover") => discover(&config).await,
        Some(other) => anyhow::bail!("unknown command {other:?}, expected serve, watch or discover"),
    }
}

async fn serve(config: &ScopeLinkConfig) -> Result<()> {
    let hardware = Arc::new(DemoHardware::new(FRAME_INTERVAL));
    let mut server =
        RemoteServer::start(hardware, config).context("failed to start remote server")?;
    tracing::info!(
        signal = %server.signal_addr(),
        chunk = %server.chunk_addr(),
        "scopelinkd serving demo microscope"
    );

    let mut tick = tokio::time::interval(TICK);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                server.shutdown();
                break;
            }
            _ = tick.tick() => {
                if !server.is_running() {
                    tracing::info!("server shut down by client");
                    break;
                }
            }
        }
    }

    // let the signal session flush the final broadcasts
    tokio::time::sleep(TICK).await;
    tokio::task::block_in_place(|| server.close());
    Ok(())
}

async fn watch(config: &ScopeLinkConfig) -> Result<()> {
    let mut client = RemoteClient::connect(config).context("failed to connect to remote server")?;
    let output = client.output();
    client.snap_slice();

    let mut tick = tokio::time::interval(TICK);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
            _ = tick.tick() => {
                log_signals(&output);
                if !client.is_running() {
                    tracing::info!("remote server went away");
                    break;
                }
            }
        }
    }

    tokio::task::block_in_place(|| client.close());
    Ok(())
}

async fn discover(config: &ScopeLinkConfig) -> Result<()> {
    let mut explorer =
        ServiceExplorer::start(&config.discovery).context("failed to join discovery group")?;
    let mut known = Vec::new();

    let mut tick = tokio::time::interval(TICK);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tick.tick() => {
                let servers = explorer.servers();
                if servers != known {
                    for server in &servers {
                        tracing::info!(
                            name = %server.name,
                            signal = %server.signal_addr(),
                            chunk = %server.chunk_addr(),
                            kind = ?server.kind,
                            "server"
                        );
                    }
                    tracing::info!(count = servers.len(), "known servers");
                    known = servers;
                }
            }
        }
    }

    tokio::task::block_in_place(|| explorer.stop().join())?;
    Ok(())
}

fn log_signals(output: &Receiver<MicroscopeSignal>) {
    for signal in output.try_iter() {
        match signal {
            MicroscopeSignal::Slice(slice) => tracing::info!(
                id = slice.id,
                size = slice.size,
                bytes = slice.data.as_ref().map_or(0, |d| d.len()),
                "slice"
            ),
            MicroscopeSignal::Status(status) => {
                tracing::info!(state = ?status.state, live = status.live, "status")
            }
            MicroscopeSignal::Dimensions(dims) => tracing::info!(?dims, "dimensions"),
            MicroscopeSignal::Stack(stack) => {
                tracing::info!(id = stack.id, slices = stack.slices_count, "stack")
            }
            MicroscopeSignal::AblationResults(results) => {
                tracing::info!(mean_ms = ?results.mean(), "ablation results")
            }
        }
    }
}
