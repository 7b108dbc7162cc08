//! Plain-old-data types shared by the wire protocol and the shared region.
//!
//! Everything here is `#[repr(C)]` and `Pod`, so it can be copied in and out
//! of socket buffers and shared memory byte for byte.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

/// Maximum number of layers in one frame's composition request.
pub const MAX_LAYERS: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0, z: 0.0 };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub const IDENTITY: Self = Self { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };
}

/// Orientation plus position.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Pose {
    pub orientation: Quat,
    pub position: Vec3,
}

impl Pose {
    pub const IDENTITY: Self = Self {
        orientation: Quat::IDENTITY,
        position: Vec3::ZERO,
    };
}

bitflags! {
    /// Which parts of a [`SpaceRelation`] carry meaningful data
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SpaceRelationFlags: u32 {
        const ORIENTATION_VALID      = 1 << 0;
        const POSITION_VALID         = 1 << 1;
        const LINEAR_VELOCITY_VALID  = 1 << 2;
        const ANGULAR_VELOCITY_VALID = 1 << 3;
        const ORIENTATION_TRACKED    = 1 << 4;
        const POSITION_TRACKED       = 1 << 5;
    }
}

/// A tracked pose together with its velocities.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct SpaceRelation {
    /// Raw [`SpaceRelationFlags`] bits
    pub relation_flags: u32,
    pub pose: Pose,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
}

impl SpaceRelation {
    pub fn flags(&self) -> SpaceRelationFlags {
        SpaceRelationFlags::from_bits_retain(self.relation_flags)
    }
}

/// Value written to a device output (haptics).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct OutputValue {
    pub duration_ns: i64,
    pub frequency: f32,
    pub amplitude: f32,
}

bitflags! {
    /// Swapchain creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SwapchainCreateFlags: u32 {
        const PROTECTED_CONTENT = 1 << 0;
        const STATIC_IMAGE      = 1 << 1;
    }
}

bitflags! {
    /// How the client intends to use swapchain images
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SwapchainUsage: u32 {
        const COLOR            = 1 << 0;
        const DEPTH_STENCIL    = 1 << 1;
        const UNORDERED_ACCESS = 1 << 2;
        const TRANSFER_SRC     = 1 << 3;
        const TRANSFER_DST     = 1 << 4;
        const SAMPLED          = 1 << 5;
        const MUTABLE_FORMAT   = 1 << 6;
    }
}

/// Parameters of `swapchain_create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainCreateInfo {
    pub create: SwapchainCreateFlags,
    pub usage: SwapchainUsage,
    pub format: i64,
    pub sample_count: u32,
    pub width: u32,
    pub height: u32,
    pub face_count: u32,
    pub array_size: u32,
    pub mip_count: u32,
}

// ============================================================================
// Layer composition data
// ============================================================================

/// Kind of a [`LayerEntry`]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerType {
    StereoProjection = 0,
    Quad = 1,
}

impl LayerType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::StereoProjection),
            1 => Some(Self::Quad),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Region of one swapchain image used by a layer.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SubImage {
    pub image_index: u32,
    pub array_index: u32,
    pub rect: Rect,
}

/// One layer of a frame.
///
/// Stereo projection layers use both `swapchain_ids` and both `sub` entries
/// (left, right); quad layers only use index 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct LayerEntry {
    pub layer_type: u32,
    pub flip_y: u32,
    pub swapchain_ids: [u32; 2],
    pub sub: [SubImage; 2],
    pub pose: Pose,
    pub quad_size: [f32; 2],
}

/// A complete frame composition request.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LayerSlot {
    pub num_layers: u32,
    pub layers: [LayerEntry; MAX_LAYERS],
}

impl Default for LayerSlot {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl LayerSlot {
    /// Layers actually in use, clamped to [`MAX_LAYERS`]
    pub fn active_layers(&self) -> &[LayerEntry] {
        let n = (self.num_layers as usize).min(MAX_LAYERS);
        &self.layers[..n]
    }

    /// Whether any layer still names a swapchain or carries a flip flag
    pub fn references_swapchains(&self) -> bool {
        self.layers
            .iter()
            .any(|l| l.swapchain_ids != [0, 0] || l.flip_y != 0)
    }
}
