//! Command Dispatcher
//!
//! Maps each decoded [`Command`] to its handler. Handlers see the session's
//! own state mutably and reach shared state only through the broker.

use std::io;
use std::os::fd::OwnedFd;

use halo_ipc::proto::IPC_MAX_SWAPCHAIN_FDS;
use halo_ipc::shm::ShmError;
use halo_ipc::types::SwapchainCreateInfo;
use halo_ipc::{Command, FrameTiming, Reply};
use tracing::{debug, trace};

use super::session::{ClientState, SessionContext};
use crate::backend::{BackendError, FrameEvent};
use crate::error::{HandlerError, ProtocolError};

/// A successful reply plus any descriptors that travel with it
#[derive(Debug)]
pub struct Response {
    pub reply: Reply,
    pub fds: Vec<OwnedFd>,
}

impl From<Reply> for Response {
    fn from(reply: Reply) -> Self {
        Self {
            reply,
            fds: Vec::new(),
        }
    }
}

pub fn dispatch(state: &mut ClientState, ctx: &SessionContext, command: Command) -> Result<Response, HandlerError> {
    trace!("Client {}: {:?}", state.id, command);

    match command {
        Command::InstanceGetShmFd => instance_get_shm_fd(ctx),
        Command::SessionBegin => {
            state.active = true;
            debug!("Client {} began its session", state.id);
            Ok(Reply::Status.into())
        }
        Command::SessionEnd => {
            state.active = false;
            debug!("Client {} ended its session", state.id);
            Ok(Reply::Status.into())
        }
        Command::CompositorGetFormats => Ok(Reply::Formats(ctx.compositor.formats()).into()),
        Command::CompositorWaitFrame => {
            let p = ctx.broker.wait_frame(state.id)?;
            Ok(Reply::WaitFrame(FrameTiming {
                frame_id: p.frame_id,
                predicted_display_time_ns: p.predicted_display_time_ns,
                wake_up_time_ns: p.wake_up_time_ns,
                predicted_display_period_ns: p.predicted_display_period_ns,
                min_display_period_ns: p.min_display_period_ns,
            })
            .into())
        }
        Command::CompositorWaitWoke { frame_id } => mark(state, ctx, frame_id, FrameEvent::WaitWoke),
        Command::CompositorBeginFrame { frame_id } => mark(state, ctx, frame_id, FrameEvent::Begin),
        Command::CompositorDiscardFrame { frame_id } => mark(state, ctx, frame_id, FrameEvent::Discarded),
        Command::CompositorLayerSync { frame_id, slot_id } => {
            let (slot, free_slot_id) = ctx.broker.layer_sync(state.id, frame_id, slot_id)?;
            state.render_state = slot;
            state.rendering_state = true;
            Ok(Reply::LayerSync { free_slot_id }.into())
        }
        Command::SwapchainCreate(info) => swapchain_create(state, ctx, &info),
        Command::SwapchainWaitImage {
            id,
            timeout_ns,
            index,
        } => {
            let handle = state.swapchains.resolve(id)?;
            let swapchain = state.swapchains.get_mut(handle)?;
            swapchain.wait_image(timeout_ns, index)?;
            Ok(Reply::Status.into())
        }
        Command::SwapchainAcquireImage { id } => {
            let handle = state.swapchains.resolve(id)?;
            let swapchain = state.swapchains.get_mut(handle)?;
            let index = swapchain.acquire_image()?;
            Ok(Reply::ImageAcquired { index }.into())
        }
        Command::SwapchainReleaseImage { id, index } => {
            let handle = state.swapchains.resolve(id)?;
            let swapchain = state.swapchains.get_mut(handle)?;
            swapchain.release_image(index)?;
            Ok(Reply::Status.into())
        }
        Command::SwapchainDestroy { id } => {
            let handle = state.swapchains.resolve(id)?;
            if state.swapchains.remove(handle)?.is_some() {
                debug!("Client {} destroyed {:?}", state.id, handle);
            }
            state.swapchains.check_count()?;
            Ok(Reply::Status.into())
        }
        Command::DeviceUpdateInput { id } => {
            ctx.broker.update_input(id)?;
            Ok(Reply::Status.into())
        }
        Command::DeviceGetTrackedPose {
            id,
            name,
            at_timestamp_ns,
        } => {
            let (timestamp_ns, relation) = ctx.broker.tracked_pose(id, name, at_timestamp_ns)?;
            Ok(Reply::TrackedPose {
                timestamp_ns,
                relation,
            }
            .into())
        }
        Command::DeviceGetViewPose {
            id,
            eye_relation,
            view_index,
        } => Ok(Reply::ViewPose(ctx.broker.view_pose(id, eye_relation, view_index)?).into()),
        Command::DeviceSetOutput { id, name, value } => {
            ctx.broker.set_output(id, name, value)?;
            Ok(Reply::Status.into())
        }
    }
}

fn instance_get_shm_fd(ctx: &SessionContext) -> Result<Response, HandlerError> {
    let fd = ctx.shm.try_clone_fd().map_err(ShmError::from)?;
    Ok(Response {
        reply: Reply::Status,
        fds: vec![fd],
    })
}

fn mark(state: &ClientState, ctx: &SessionContext, frame_id: i64, event: FrameEvent) -> Result<Response, HandlerError> {
    ctx.broker.mark_frame(state.id, frame_id, event)?;
    Ok(Reply::Status.into())
}

fn swapchain_create(state: &mut ClientState, ctx: &SessionContext, info: &SwapchainCreateInfo) -> Result<Response, HandlerError> {
    if state.swapchains.is_full() {
        return Err(HandlerError::ResourceExhausted("swapchain table"));
    }

    let swapchain = ctx.compositor.create_swapchain(info)?;
    let num_images = swapchain.image_count();
    if num_images as usize > IPC_MAX_SWAPCHAIN_FDS {
        return Err(ProtocolError::TooManyImages(num_images).into());
    }

    let fds = swapchain
        .images()
        .iter()
        .map(|image| image.fd.try_clone())
        .collect::<io::Result<Vec<_>>>()
        .map_err(BackendError::from)?;
    let size = swapchain.images().first().map_or(0, |image| image.size);

    let handle = state
        .swapchains
        .insert(swapchain)
        .map_err(|_| HandlerError::ResourceExhausted("swapchain table"))?;
    state.swapchains.check_count()?;

    debug!(
        "Client {} created {:?} ({}x{}, {} images)",
        state.id, handle, info.width, info.height, num_images
    );

    Ok(Response {
        reply: Reply::SwapchainCreated {
            id: handle.raw(),
            num_images,
            size,
        },
        fds,
    })
}
