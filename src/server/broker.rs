//! Broker thread
//!
//! Owns everything sessions share: the writable side of the Shared Control
//! Region, the Frame-Pacing Arbiter and the tracked devices. Sessions reach
//! it through a [`BrokerHandle`]; requests are handled one at a time, so
//! concurrent `layer_sync` calls never interleave.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use halo_ipc::types::{LayerSlot, OutputValue, Pose, SpaceRelation, Vec3};
use halo_ipc::{ShmRegion, N_SLOTS};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::pacing::{next_slot, FrameMismatch, FramePacer};
use super::stats::FrameStats;
use super::ClientId;
use crate::backend::{now_ns, Device, FrameEvent, FramePrediction};
use crate::error::{HandlerError, ProtocolError};

const QUEUE_DEPTH: usize = 64;

/// The most recent frame handed over by any client
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeliveredFrame {
    pub client: ClientId,
    pub frame_id: i64,
    pub slot: LayerSlot,
}

type Reply<T> = oneshot::Sender<T>;

enum BrokerRequest {
    WaitFrame {
        client: ClientId,
        reply: Reply<FramePrediction>,
    },
    MarkFrame {
        client: ClientId,
        frame_id: i64,
        event: FrameEvent,
        reply: Reply<Result<(), FrameMismatch>>,
    },
    LayerSync {
        client: ClientId,
        frame_id: i64,
        slot_id: u32,
        reply: Reply<Result<(LayerSlot, u32), HandlerError>>,
    },
    UpdateInput {
        device: u32,
        reply: Reply<Result<(), HandlerError>>,
    },
    TrackedPose {
        device: u32,
        name: u32,
        at_timestamp_ns: u64,
        reply: Reply<Result<(u64, SpaceRelation), HandlerError>>,
    },
    ViewPose {
        device: u32,
        eye_relation: Vec3,
        view_index: u32,
        reply: Reply<Result<Pose, HandlerError>>,
    },
    SetOutput {
        device: u32,
        name: u32,
        value: OutputValue,
        reply: Reply<Result<(), HandlerError>>,
    },
    LatestFrame {
        reply: Reply<Option<DeliveredFrame>>,
    },
    Disconnect {
        client: ClientId,
        reply: Reply<()>,
    },
}

/// Cloneable handle sessions use to talk to the broker.
///
/// Every call blocks the calling thread until the broker answers, so it
/// must not be used from inside the async runtime.
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<BrokerRequest>,
}

impl BrokerHandle {
    fn request<T>(&self, make: impl FnOnce(Reply<T>) -> BrokerRequest) -> Result<T, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .blocking_send(make(tx))
            .map_err(|_| ProtocolError::BrokerUnavailable)?;
        rx.blocking_recv().map_err(|_| ProtocolError::BrokerUnavailable)
    }

    pub fn wait_frame(&self, client: ClientId) -> Result<FramePrediction, ProtocolError> {
        self.request(|reply| BrokerRequest::WaitFrame { client, reply })
    }

    pub fn mark_frame(&self, client: ClientId, frame_id: i64, event: FrameEvent) -> Result<(), HandlerError> {
        Ok(self.request(|reply| BrokerRequest::MarkFrame {
            client,
            frame_id,
            event,
            reply,
        })??)
    }

    /// Consume a ring slot. Returns its contents and the next free slot.
    pub fn layer_sync(&self, client: ClientId, frame_id: i64, slot_id: u32) -> Result<(LayerSlot, u32), HandlerError> {
        self.request(|reply| BrokerRequest::LayerSync {
            client,
            frame_id,
            slot_id,
            reply,
        })?
    }

    pub fn update_input(&self, device: u32) -> Result<(), HandlerError> {
        self.request(|reply| BrokerRequest::UpdateInput { device, reply })?
    }

    pub fn tracked_pose(&self, device: u32, name: u32, at_timestamp_ns: u64) -> Result<(u64, SpaceRelation), HandlerError> {
        self.request(|reply| BrokerRequest::TrackedPose {
            device,
            name,
            at_timestamp_ns,
            reply,
        })?
    }

    pub fn view_pose(&self, device: u32, eye_relation: Vec3, view_index: u32) -> Result<Pose, HandlerError> {
        self.request(|reply| BrokerRequest::ViewPose {
            device,
            eye_relation,
            view_index,
            reply,
        })?
    }

    pub fn set_output(&self, device: u32, name: u32, value: OutputValue) -> Result<(), HandlerError> {
        self.request(|reply| BrokerRequest::SetOutput {
            device,
            name,
            value,
            reply,
        })?
    }

    pub fn latest_frame(&self) -> Result<Option<DeliveredFrame>, ProtocolError> {
        self.request(|reply| BrokerRequest::LatestFrame { reply })
    }

    /// Drop a session's frame-pacing state
    pub fn disconnect(&self, client: ClientId) -> Result<(), ProtocolError> {
        self.request(|reply| BrokerRequest::Disconnect { client, reply })
    }
}

struct Broker {
    shm: Arc<ShmRegion>,
    pacer: FramePacer,
    devices: Vec<Box<dyn Device>>,
    latest: Option<DeliveredFrame>,
    stats: FrameStats,
}

/// Start the broker thread.
///
/// It runs until every [`BrokerHandle`] is dropped.
pub fn spawn(
    shm: Arc<ShmRegion>,
    pacer: FramePacer,
    devices: Vec<Box<dyn Device>>,
) -> io::Result<(BrokerHandle, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    let broker = Broker {
        shm,
        pacer,
        devices,
        latest: None,
        stats: FrameStats::default(),
    };
    let thread = thread::Builder::new()
        .name("halo-broker".into())
        .spawn(move || broker.run(rx))?;
    Ok((BrokerHandle { tx }, thread))
}

impl Broker {
    fn run(mut self, mut rx: mpsc::Receiver<BrokerRequest>) {
        info!("Broker started with {} devices", self.devices.len());
        for (id, device) in self.devices.iter().enumerate() {
            debug!("Device {}: {} ({:?})", id, device.name(), device.kind());
        }
        while let Some(request) = rx.blocking_recv() {
            self.handle(request);
        }
        info!("Broker stopped ({:.1} frames/s over the last window)", self.stats.rate());
    }

    fn handle(&mut self, request: BrokerRequest) {
        // A session that went away no longer waits for its answer
        match request {
            BrokerRequest::WaitFrame { client, reply } => {
                let _ = reply.send(self.pacer.wait_frame(client, now_ns()));
            }
            BrokerRequest::MarkFrame {
                client,
                frame_id,
                event,
                reply,
            } => {
                let _ = reply.send(self.pacer.mark(client, frame_id, event, now_ns()));
            }
            BrokerRequest::LayerSync {
                client,
                frame_id,
                slot_id,
                reply,
            } => {
                let _ = reply.send(self.layer_sync(client, frame_id, slot_id));
            }
            BrokerRequest::UpdateInput { device, reply } => {
                let _ = reply.send(self.update_input(device));
            }
            BrokerRequest::TrackedPose {
                device,
                name,
                at_timestamp_ns,
                reply,
            } => {
                let result = self.device(device).and_then(|dev| {
                    dev.get_tracked_pose(name, at_timestamp_ns)
                        .map_err(|source| HandlerError::Device { id: device, source })
                });
                let _ = reply.send(result);
            }
            BrokerRequest::ViewPose {
                device,
                eye_relation,
                view_index,
                reply,
            } => {
                let result = self.device(device).and_then(|dev| {
                    dev.get_view_pose(eye_relation, view_index)
                        .map_err(|source| HandlerError::Device { id: device, source })
                });
                let _ = reply.send(result);
            }
            BrokerRequest::SetOutput {
                device,
                name,
                value,
                reply,
            } => {
                let result = self.device(device).and_then(|dev| {
                    dev.set_output(name, value)
                        .map_err(|source| HandlerError::Device { id: device, source })
                });
                let _ = reply.send(result);
            }
            BrokerRequest::LatestFrame { reply } => {
                let _ = reply.send(self.latest);
            }
            BrokerRequest::Disconnect { client, reply } => {
                self.pacer.clear_client(client);
                if self.latest.is_some_and(|f| f.client == client) {
                    self.latest = None;
                }
                debug!("Client {} left frame pacing", client);
                let _ = reply.send(());
            }
        }
    }

    fn device(&mut self, id: u32) -> Result<&mut Box<dyn Device>, HandlerError> {
        self.devices
            .get_mut(id as usize)
            .ok_or(HandlerError::Protocol(ProtocolError::InvalidDevice(id)))
    }

    fn layer_sync(&mut self, client: ClientId, frame_id: i64, slot_id: u32) -> Result<(LayerSlot, u32), HandlerError> {
        if slot_id as usize >= N_SLOTS {
            return Err(ProtocolError::InvalidSlot(slot_id).into());
        }
        let slot = self.shm.read_slot(slot_id).inspect_err(|e| {
            warn!("Client {}: {}", client, e);
        })?;

        self.pacer.deliver(client, frame_id, now_ns());
        self.latest = Some(DeliveredFrame {
            client,
            frame_id,
            slot,
        });
        if let Some(rate) = self.stats.tick() {
            debug!("Delivering {:.1} frames/s", rate);
        }
        trace!(
            "Client {} delivered frame {} with {} layers from slot {}",
            client,
            frame_id,
            slot.active_layers().len(),
            slot_id
        );

        Ok((slot, next_slot(slot_id)))
    }

    fn update_input(&mut self, id: u32) -> Result<(), HandlerError> {
        let now = now_ns();
        let device = self.device(id)?;
        device
            .update_inputs(now)
            .map_err(|source| HandlerError::Device { id, source })?;
        // Copy out so the shared region borrow does not overlap the device
        let inputs = device.inputs().to_vec();
        self.shm.write_inputs(id, &inputs)?;
        Ok(())
    }
}
