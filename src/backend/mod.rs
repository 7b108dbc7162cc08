//! Collaborators the broker talks to.
//!
//! The broker never creates GPU resources, predicts frame timing or reads
//! hardware itself. It goes through these traits, and the reference
//! implementations in the submodules keep the server runnable without a
//! GPU or real devices.

pub mod device;
pub mod memfd;
pub mod predictor;

use std::io;
use std::os::fd::OwnedFd;

use halo_ipc::shm::InputRecord;
use halo_ipc::types::{OutputValue, Pose, SpaceRelation, SwapchainCreateInfo, Vec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use device::StaticDevice;
pub use memfd::MemfdCompositor;
pub use predictor::FixedRatePredictor;

// ============================================================================
// Presentation backend
// ============================================================================

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unsupported format {0}")]
    UnsupportedFormat(i64),

    #[error("invalid swapchain parameters: {0}")]
    InvalidParameters(&'static str),

    #[error("image {0} out of range")]
    InvalidImage(u32),

    #[error("no image available to acquire")]
    NoImageAvailable,

    #[error("image {0} is not acquired")]
    NotAcquired(u32),

    #[error("allocation failed: {0}")]
    Io(#[from] io::Error),
}

/// One backing image of a swapchain.
#[derive(Debug)]
pub struct SwapchainImage {
    pub fd: OwnedFd,
    pub size: u64,
}

/// A server-owned swapchain. Dropping it destroys it.
pub trait Swapchain: Send {
    fn images(&self) -> &[SwapchainImage];

    fn image_count(&self) -> u32 {
        self.images().len() as u32
    }

    /// Block until the acquired image `index` may be written.
    ///
    /// May block on GPU or driver completion.
    fn wait_image(&mut self, timeout_ns: u64, index: u32) -> Result<(), BackendError>;

    fn acquire_image(&mut self) -> Result<u32, BackendError>;

    fn release_image(&mut self, index: u32) -> Result<(), BackendError>;
}

pub trait CompositorBackend: Send + Sync {
    /// Pixel formats swapchains may be created with
    fn formats(&self) -> Vec<i64>;

    fn create_swapchain(&self, info: &SwapchainCreateInfo) -> Result<Box<dyn Swapchain>, BackendError>;
}

// ============================================================================
// Frame timing
// ============================================================================

/// Lifecycle events of one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEvent {
    WaitWoke,
    Begin,
    Discarded,
    Delivered,
}

/// Timing for the next frame a client should render.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramePrediction {
    pub frame_id: i64,
    pub wake_up_time_ns: u64,
    pub desired_present_time_ns: u64,
    pub present_slop_ns: u64,
    pub predicted_display_time_ns: u64,
    pub predicted_display_period_ns: u64,
    pub min_display_period_ns: u64,
}

pub trait FramePredictor: Send {
    /// Allocate the next frame id and predict its timing
    fn predict(&mut self, now_ns: u64) -> FramePrediction;

    fn mark(&mut self, frame_id: i64, event: FrameEvent, now_ns: u64);

    /// Forget per-frame history; frame ids keep increasing
    fn clear(&mut self);
}

// ============================================================================
// Tracked devices
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Hmd = 1,
    Controller = 2,
    Tracker = 3,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("input {0:#x} not supported")]
    UnknownInput(u32),

    #[error("output {0:#x} not supported")]
    UnknownOutput(u32),

    #[error("view {0} out of range")]
    InvalidView(u32),
}

pub trait Device: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> DeviceKind;

    /// Current input values, in the order of the device's shared sub-range
    fn inputs(&self) -> &[InputRecord];

    fn update_inputs(&mut self, now_ns: u64) -> Result<(), DeviceError>;

    fn get_tracked_pose(&mut self, name: u32, at_timestamp_ns: u64) -> Result<(u64, SpaceRelation), DeviceError>;

    fn get_view_pose(&mut self, eye_relation: Vec3, view_index: u32) -> Result<Pose, DeviceError>;

    fn set_output(&mut self, name: u32, value: OutputValue) -> Result<(), DeviceError>;
}

/// Nanoseconds on the monotonic clock
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}
