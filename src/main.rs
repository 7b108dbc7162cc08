//! Halo - XR compositor session broker
//!
//! Arbitrates swapchains, tracked devices and frame timing between a single
//! compositor and its client processes. Clients talk to it over a per-client
//! `SOCK_SEQPACKET` control socket and share one memory region.

mod backend;
mod config;
mod error;
mod server;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line options
#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    exit_on_disconnect: bool,
}

impl Args {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut parsed = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" | "-c" => {
                    let path = args.next().context("--config needs a path")?;
                    parsed.config = Some(PathBuf::from(path));
                }
                "--exit-on-disconnect" => parsed.exit_on_disconnect = true,
                other => anyhow::bail!("Unknown argument: {}", other),
            }
        }
        Ok(parsed)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "halo=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Halo compositor server");

    // Parse command line arguments
    let args = Args::parse(std::env::args().skip(1))?;

    let mut config = match &args.config {
        Some(path) => config::Config::load_from(path)?,
        None => config::Config::load()?,
    };
    if args.exit_on_disconnect {
        info!("--exit-on-disconnect: server stops when a client leaves");
        config.server.exit_on_disconnect = true;
    }

    let running = Arc::new(AtomicBool::new(true));

    // Sessions block on sockets and the backend, keep them off the runtime
    let mut server_task = tokio::task::spawn_blocking({
        let running = running.clone();
        move || server::run(config, running)
    });

    // Handle SIGTERM and SIGINT
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully");
        }
        result = &mut server_task => {
            // Stopped on its own (exit_on_disconnect or a startup error)
            return match result.context("Server thread panicked")? {
                Ok(()) => Ok(()),
                Err(e) => {
                    error!("Server error: {:#}", e);
                    Err(e)
                }
            };
        }
    }

    // Acceptor and sessions notice within one poll timeout
    running.store(false, Ordering::SeqCst);
    server_task.await.context("Server thread panicked")??;

    Ok(())
}
