//! Compositor session broker
//!
//! Wires the collaborators together and runs the acceptor until the running
//! flag clears.

pub mod acceptor;
pub mod broker;
pub mod dispatch;
pub mod pacing;
pub mod session;
pub mod stats;
pub mod swapchain;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use halo_ipc::shm::DeviceLayout;
use halo_ipc::ShmRegion;
use tracing::{error, info, warn};

use crate::backend::{Device, FixedRatePredictor, MemfdCompositor, StaticDevice};
use crate::config::{Config, DeviceConfig};
use acceptor::Acceptor;
use pacing::FramePacer;
use session::SessionContext;

/// Identifies a session for the lifetime of the server
pub type ClientId = u32;

fn device_layouts(devices: &[DeviceConfig]) -> Vec<DeviceLayout> {
    devices
        .iter()
        .map(|d| DeviceLayout {
            name: d.name.clone(),
            kind: d.kind as u32,
            num_inputs: d.inputs,
        })
        .collect()
}

/// Create the shared region, the broker and the presentation backend.
fn start_services(config: &Config, running: Arc<AtomicBool>) -> Result<(SessionContext, JoinHandle<()>)> {
    let mut shm = ShmRegion::create("halo-shm").context("Failed to create shared control region")?;
    shm.publish_devices(&device_layouts(&config.devices))
        .context("Failed to publish device table")?;
    let shm = Arc::new(shm);

    let devices: Vec<Box<dyn Device>> = config
        .devices
        .iter()
        .map(|d| Box::new(StaticDevice::new(d)) as Box<dyn Device>)
        .collect();

    let predictor = FixedRatePredictor::from_refresh_rate(
        config.pacing.refresh_rate_hz,
        config.pacing.min_app_time_ns(),
    );
    info!(
        "Pacing at {} Hz ({} ns period)",
        config.pacing.refresh_rate_hz,
        predictor.period_ns()
    );

    let (broker, broker_thread) = broker::spawn(shm.clone(), FramePacer::new(Box::new(predictor)), devices)
        .context("Failed to start broker thread")?;

    let ctx = SessionContext {
        broker,
        compositor: Arc::new(MemfdCompositor::new(&config.compositor)),
        shm,
        running,
        exit_on_disconnect: config.server.exit_on_disconnect,
        poll_timeout: config.server.poll_timeout(),
    };
    Ok((ctx, broker_thread))
}

/// Run the server until `running` clears. Blocks the calling thread.
pub fn run(config: Config, running: Arc<AtomicBool>) -> Result<()> {
    let (ctx, broker_thread) = start_services(&config, running)?;

    let broker = ctx.broker.clone();
    let socket_path = config.server.socket_path();
    let mut acceptor = Acceptor::bind(&socket_path, config.server.max_clients, ctx)?;
    let result = acceptor.run();
    drop(acceptor);

    match broker.latest_frame() {
        Ok(Some(frame)) => info!(
            "Last delivered frame {} from client {} ({} layers)",
            frame.frame_id, frame.client, frame.slot.num_layers
        ),
        Ok(None) => info!("No frames were delivered"),
        Err(e) => warn!("{}", e),
    }

    // The broker exits once its last handle is gone
    drop(broker);
    if broker_thread.join().is_err() {
        error!("Broker thread panicked");
    }

    info!("Server stopped");
    result
}
