//! Low-level binary protocol for the per-client control socket.
//!
//! # Protocol Overview
//!
//! Messages travel over a `SOCK_SEQPACKET` Unix domain socket, so one
//! `recv` always yields exactly one message.
//!
//! - **Request**: `u32` opcode (little endian) followed by the opcode's
//!   fixed-layout payload.
//! - **Reply**: `i32` result code; on success the opcode's fixed-layout reply
//!   payload follows.
//! - **Ancillary data** (`SCM_RIGHTS`): the shared region descriptor for
//!   `InstanceGetShmFd`, one image descriptor per swapchain image for
//!   `SwapchainCreate`.
//!
//! The protocol is strictly synchronous: one reply per request, no
//! unsolicited messages.

use std::mem;

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::types::{
    OutputValue, Pose, SpaceRelation, SwapchainCreateFlags, SwapchainCreateInfo, SwapchainUsage,
    Vec3,
};

/// Maximum size of any request or reply
pub const IPC_BUF_SIZE: usize = 512;

/// Size of the opcode field at the start of every request
pub const OPCODE_SIZE: usize = mem::size_of::<u32>();

/// Size of the result code at the start of every reply
pub const RESULT_SIZE: usize = mem::size_of::<i32>();

/// Maximum number of descriptors attached to a single message
pub const IPC_MAX_SWAPCHAIN_FDS: usize = 8;

/// Maximum number of formats reported by `CompositorGetFormats`
pub const MAX_FORMATS: usize = 16;

// ============================================================================
// Opcodes and result codes
// ============================================================================

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    InstanceGetShmFd = 1,
    SessionBegin = 2,
    SessionEnd = 3,
    CompositorGetFormats = 4,
    CompositorWaitFrame = 5,
    CompositorWaitWoke = 6,
    CompositorBeginFrame = 7,
    CompositorDiscardFrame = 8,
    CompositorLayerSync = 9,
    SwapchainCreate = 10,
    SwapchainWaitImage = 11,
    SwapchainAcquireImage = 12,
    SwapchainReleaseImage = 13,
    SwapchainDestroy = 14,
    DeviceUpdateInput = 15,
    DeviceGetTrackedPose = 16,
    DeviceGetViewPose = 17,
    DeviceSetOutput = 18,
}

impl TryFrom<u32> for Opcode {
    type Error = DecodeError;

    fn try_from(raw: u32) -> Result<Self, DecodeError> {
        use Opcode::*;
        Ok(match raw {
            1 => InstanceGetShmFd,
            2 => SessionBegin,
            3 => SessionEnd,
            4 => CompositorGetFormats,
            5 => CompositorWaitFrame,
            6 => CompositorWaitWoke,
            7 => CompositorBeginFrame,
            8 => CompositorDiscardFrame,
            9 => CompositorLayerSync,
            10 => SwapchainCreate,
            11 => SwapchainWaitImage,
            12 => SwapchainAcquireImage,
            13 => SwapchainReleaseImage,
            14 => SwapchainDestroy,
            15 => DeviceUpdateInput,
            16 => DeviceGetTrackedPose,
            17 => DeviceGetViewPose,
            18 => DeviceSetOutput,
            other => return Err(DecodeError::UnknownOpcode(other)),
        })
    }
}

/// Status carried at the start of every reply.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success = 0,
    IpcFailure = -1,
    ResourceExhausted = -2,
    BackendFailure = -3,
    DeviceFailure = -4,
}

impl ResultCode {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Success),
            -1 => Some(Self::IpcFailure),
            -2 => Some(Self::ResourceExhausted),
            -3 => Some(Self::BackendFailure),
            -4 => Some(Self::DeviceFailure),
            _ => None,
        }
    }

    /// Encode a failure reply (result code only)
    pub fn encode(self) -> Vec<u8> {
        (self as i32).to_le_bytes().to_vec()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("message is {0} bytes, shorter than the opcode field")]
    Truncated(usize),

    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),

    #[error("payload for {opcode:?} is {got} bytes, expected {expected}")]
    ShortPayload {
        opcode: Opcode,
        expected: usize,
        got: usize,
    },

    #[error("unknown result code {0}")]
    UnknownResult(i32),
}

// ============================================================================
// Wire payloads
// ============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FrameArgs {
    frame_id: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct LayerSyncArgs {
    frame_id: i64,
    slot_id: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SwapchainCreateArgs {
    format: i64,
    create: u32,
    usage: u32,
    sample_count: u32,
    width: u32,
    height: u32,
    face_count: u32,
    array_size: u32,
    mip_count: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SwapchainWaitArgs {
    timeout_ns: u64,
    id: u32,
    index: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct IdArgs {
    id: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SwapchainReleaseArgs {
    id: u32,
    index: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct TrackedPoseArgs {
    at_timestamp_ns: u64,
    id: u32,
    name: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ViewPoseArgs {
    eye_relation: Vec3,
    id: u32,
    view_index: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SetOutputArgs {
    value: OutputValue,
    id: u32,
    name: u32,
}

/// Timing returned by `CompositorWaitFrame`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct FrameTiming {
    pub frame_id: i64,
    pub predicted_display_time_ns: u64,
    pub wake_up_time_ns: u64,
    pub predicted_display_period_ns: u64,
    pub min_display_period_ns: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FormatsReply {
    formats: [i64; MAX_FORMATS],
    num_formats: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SwapchainCreateReply {
    size: u64,
    id: u32,
    num_images: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct U32Reply {
    value: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct TrackedPoseReply {
    timestamp_ns: u64,
    relation: SpaceRelation,
}

const _: () = assert!(OPCODE_SIZE + mem::size_of::<SwapchainCreateArgs>() <= IPC_BUF_SIZE);
const _: () = assert!(RESULT_SIZE + mem::size_of::<FormatsReply>() <= IPC_BUF_SIZE);
const _: () = assert!(RESULT_SIZE + mem::size_of::<TrackedPoseReply>() <= IPC_BUF_SIZE);

fn read_payload<T: Pod>(opcode: Opcode, payload: &[u8]) -> Result<T, DecodeError> {
    let expected = mem::size_of::<T>();
    if payload.len() < expected {
        return Err(DecodeError::ShortPayload {
            opcode,
            expected,
            got: payload.len(),
        });
    }
    Ok(bytemuck::pod_read_unaligned(&payload[..expected]))
}

// ============================================================================
// Requests
// ============================================================================

/// A decoded request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    InstanceGetShmFd,
    SessionBegin,
    SessionEnd,
    CompositorGetFormats,
    CompositorWaitFrame,
    CompositorWaitWoke { frame_id: i64 },
    CompositorBeginFrame { frame_id: i64 },
    CompositorDiscardFrame { frame_id: i64 },
    CompositorLayerSync { frame_id: i64, slot_id: u32 },
    SwapchainCreate(SwapchainCreateInfo),
    SwapchainWaitImage { id: u32, timeout_ns: u64, index: u32 },
    SwapchainAcquireImage { id: u32 },
    SwapchainReleaseImage { id: u32, index: u32 },
    SwapchainDestroy { id: u32 },
    DeviceUpdateInput { id: u32 },
    DeviceGetTrackedPose { id: u32, name: u32, at_timestamp_ns: u64 },
    DeviceGetViewPose { id: u32, eye_relation: Vec3, view_index: u32 },
    DeviceSetOutput { id: u32, name: u32, value: OutputValue },
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::InstanceGetShmFd => Opcode::InstanceGetShmFd,
            Command::SessionBegin => Opcode::SessionBegin,
            Command::SessionEnd => Opcode::SessionEnd,
            Command::CompositorGetFormats => Opcode::CompositorGetFormats,
            Command::CompositorWaitFrame => Opcode::CompositorWaitFrame,
            Command::CompositorWaitWoke { .. } => Opcode::CompositorWaitWoke,
            Command::CompositorBeginFrame { .. } => Opcode::CompositorBeginFrame,
            Command::CompositorDiscardFrame { .. } => Opcode::CompositorDiscardFrame,
            Command::CompositorLayerSync { .. } => Opcode::CompositorLayerSync,
            Command::SwapchainCreate(_) => Opcode::SwapchainCreate,
            Command::SwapchainWaitImage { .. } => Opcode::SwapchainWaitImage,
            Command::SwapchainAcquireImage { .. } => Opcode::SwapchainAcquireImage,
            Command::SwapchainReleaseImage { .. } => Opcode::SwapchainReleaseImage,
            Command::SwapchainDestroy { .. } => Opcode::SwapchainDestroy,
            Command::DeviceUpdateInput { .. } => Opcode::DeviceUpdateInput,
            Command::DeviceGetTrackedPose { .. } => Opcode::DeviceGetTrackedPose,
            Command::DeviceGetViewPose { .. } => Opcode::DeviceGetViewPose,
            Command::DeviceSetOutput { .. } => Opcode::DeviceSetOutput,
        }
    }

    /// Decode one received message.
    ///
    /// Trailing bytes past the opcode's payload are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < OPCODE_SIZE {
            return Err(DecodeError::Truncated(buf.len()));
        }
        let raw = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let opcode = Opcode::try_from(raw)?;
        let payload = &buf[OPCODE_SIZE..];

        Ok(match opcode {
            Opcode::InstanceGetShmFd => Command::InstanceGetShmFd,
            Opcode::SessionBegin => Command::SessionBegin,
            Opcode::SessionEnd => Command::SessionEnd,
            Opcode::CompositorGetFormats => Command::CompositorGetFormats,
            Opcode::CompositorWaitFrame => Command::CompositorWaitFrame,
            Opcode::CompositorWaitWoke => {
                let a: FrameArgs = read_payload(opcode, payload)?;
                Command::CompositorWaitWoke { frame_id: a.frame_id }
            }
            Opcode::CompositorBeginFrame => {
                let a: FrameArgs = read_payload(opcode, payload)?;
                Command::CompositorBeginFrame { frame_id: a.frame_id }
            }
            Opcode::CompositorDiscardFrame => {
                let a: FrameArgs = read_payload(opcode, payload)?;
                Command::CompositorDiscardFrame { frame_id: a.frame_id }
            }
            Opcode::CompositorLayerSync => {
                let a: LayerSyncArgs = read_payload(opcode, payload)?;
                Command::CompositorLayerSync {
                    frame_id: a.frame_id,
                    slot_id: a.slot_id,
                }
            }
            Opcode::SwapchainCreate => {
                let a: SwapchainCreateArgs = read_payload(opcode, payload)?;
                Command::SwapchainCreate(SwapchainCreateInfo {
                    create: SwapchainCreateFlags::from_bits_retain(a.create),
                    usage: SwapchainUsage::from_bits_retain(a.usage),
                    format: a.format,
                    sample_count: a.sample_count,
                    width: a.width,
                    height: a.height,
                    face_count: a.face_count,
                    array_size: a.array_size,
                    mip_count: a.mip_count,
                })
            }
            Opcode::SwapchainWaitImage => {
                let a: SwapchainWaitArgs = read_payload(opcode, payload)?;
                Command::SwapchainWaitImage {
                    id: a.id,
                    timeout_ns: a.timeout_ns,
                    index: a.index,
                }
            }
            Opcode::SwapchainAcquireImage => {
                let a: IdArgs = read_payload(opcode, payload)?;
                Command::SwapchainAcquireImage { id: a.id }
            }
            Opcode::SwapchainReleaseImage => {
                let a: SwapchainReleaseArgs = read_payload(opcode, payload)?;
                Command::SwapchainReleaseImage {
                    id: a.id,
                    index: a.index,
                }
            }
            Opcode::SwapchainDestroy => {
                let a: IdArgs = read_payload(opcode, payload)?;
                Command::SwapchainDestroy { id: a.id }
            }
            Opcode::DeviceUpdateInput => {
                let a: IdArgs = read_payload(opcode, payload)?;
                Command::DeviceUpdateInput { id: a.id }
            }
            Opcode::DeviceGetTrackedPose => {
                let a: TrackedPoseArgs = read_payload(opcode, payload)?;
                Command::DeviceGetTrackedPose {
                    id: a.id,
                    name: a.name,
                    at_timestamp_ns: a.at_timestamp_ns,
                }
            }
            Opcode::DeviceGetViewPose => {
                let a: ViewPoseArgs = read_payload(opcode, payload)?;
                Command::DeviceGetViewPose {
                    id: a.id,
                    eye_relation: a.eye_relation,
                    view_index: a.view_index,
                }
            }
            Opcode::DeviceSetOutput => {
                let a: SetOutputArgs = read_payload(opcode, payload)?;
                Command::DeviceSetOutput {
                    id: a.id,
                    name: a.name,
                    value: a.value,
                }
            }
        })
    }

    /// Encode this request for sending
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&(self.opcode() as u32).to_le_bytes());

        match *self {
            Command::InstanceGetShmFd
            | Command::SessionBegin
            | Command::SessionEnd
            | Command::CompositorGetFormats
            | Command::CompositorWaitFrame => {}
            Command::CompositorWaitWoke { frame_id }
            | Command::CompositorBeginFrame { frame_id }
            | Command::CompositorDiscardFrame { frame_id } => {
                buf.extend_from_slice(bytemuck::bytes_of(&FrameArgs { frame_id }));
            }
            Command::CompositorLayerSync { frame_id, slot_id } => {
                buf.extend_from_slice(bytemuck::bytes_of(&LayerSyncArgs {
                    frame_id,
                    slot_id,
                    _pad: 0,
                }));
            }
            Command::SwapchainCreate(info) => {
                buf.extend_from_slice(bytemuck::bytes_of(&SwapchainCreateArgs {
                    format: info.format,
                    create: info.create.bits(),
                    usage: info.usage.bits(),
                    sample_count: info.sample_count,
                    width: info.width,
                    height: info.height,
                    face_count: info.face_count,
                    array_size: info.array_size,
                    mip_count: info.mip_count,
                }));
            }
            Command::SwapchainWaitImage {
                id,
                timeout_ns,
                index,
            } => {
                buf.extend_from_slice(bytemuck::bytes_of(&SwapchainWaitArgs {
                    timeout_ns,
                    id,
                    index,
                }));
            }
            Command::SwapchainAcquireImage { id }
            | Command::SwapchainDestroy { id }
            | Command::DeviceUpdateInput { id } => {
                buf.extend_from_slice(bytemuck::bytes_of(&IdArgs { id }));
            }
            Command::SwapchainReleaseImage { id, index } => {
                buf.extend_from_slice(bytemuck::bytes_of(&SwapchainReleaseArgs { id, index }));
            }
            Command::DeviceGetTrackedPose {
                id,
                name,
                at_timestamp_ns,
            } => {
                buf.extend_from_slice(bytemuck::bytes_of(&TrackedPoseArgs {
                    at_timestamp_ns,
                    id,
                    name,
                }));
            }
            Command::DeviceGetViewPose {
                id,
                eye_relation,
                view_index,
            } => {
                buf.extend_from_slice(bytemuck::bytes_of(&ViewPoseArgs {
                    eye_relation,
                    id,
                    view_index,
                }));
            }
            Command::DeviceSetOutput { id, name, value } => {
                buf.extend_from_slice(bytemuck::bytes_of(&SetOutputArgs { value, id, name }));
            }
        }

        buf
    }
}

// ============================================================================
// Replies
// ============================================================================

/// A successful reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Result code only
    Status,
    Formats(Vec<i64>),
    WaitFrame(FrameTiming),
    LayerSync { free_slot_id: u32 },
    SwapchainCreated { id: u32, num_images: u32, size: u64 },
    ImageAcquired { index: u32 },
    TrackedPose { timestamp_ns: u64, relation: SpaceRelation },
    ViewPose(Pose),
}

impl Reply {
    /// Encode a success reply
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&(ResultCode::Success as i32).to_le_bytes());

        match self {
            Reply::Status => {}
            Reply::Formats(formats) => {
                let mut reply = FormatsReply::zeroed();
                let n = formats.len().min(MAX_FORMATS);
                reply.formats[..n].copy_from_slice(&formats[..n]);
                reply.num_formats = n as u32;
                buf.extend_from_slice(bytemuck::bytes_of(&reply));
            }
            Reply::WaitFrame(timing) => buf.extend_from_slice(bytemuck::bytes_of(timing)),
            Reply::LayerSync { free_slot_id } => {
                buf.extend_from_slice(bytemuck::bytes_of(&U32Reply {
                    value: *free_slot_id,
                }));
            }
            Reply::SwapchainCreated {
                id,
                num_images,
                size,
            } => {
                buf.extend_from_slice(bytemuck::bytes_of(&SwapchainCreateReply {
                    size: *size,
                    id: *id,
                    num_images: *num_images,
                }));
            }
            Reply::ImageAcquired { index } => {
                buf.extend_from_slice(bytemuck::bytes_of(&U32Reply { value: *index }));
            }
            Reply::TrackedPose {
                timestamp_ns,
                relation,
            } => {
                buf.extend_from_slice(bytemuck::bytes_of(&TrackedPoseReply {
                    timestamp_ns: *timestamp_ns,
                    relation: *relation,
                }));
            }
            Reply::ViewPose(pose) => buf.extend_from_slice(bytemuck::bytes_of(pose)),
        }

        buf
    }

    /// Decode the reply to a request with the given opcode.
    ///
    /// The outer error is a malformed message; the inner one is a failure
    /// result reported by the server.
    pub fn decode(opcode: Opcode, buf: &[u8]) -> Result<Result<Reply, ResultCode>, DecodeError> {
        if buf.len() < RESULT_SIZE {
            return Err(DecodeError::Truncated(buf.len()));
        }
        let raw = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let code = ResultCode::from_raw(raw).ok_or(DecodeError::UnknownResult(raw))?;
        if code != ResultCode::Success {
            return Ok(Err(code));
        }
        let payload = &buf[RESULT_SIZE..];

        let reply = match opcode {
            Opcode::InstanceGetShmFd
            | Opcode::SessionBegin
            | Opcode::SessionEnd
            | Opcode::CompositorWaitWoke
            | Opcode::CompositorBeginFrame
            | Opcode::CompositorDiscardFrame
            | Opcode::SwapchainWaitImage
            | Opcode::SwapchainReleaseImage
            | Opcode::SwapchainDestroy
            | Opcode::DeviceUpdateInput
            | Opcode::DeviceSetOutput => Reply::Status,
            Opcode::CompositorGetFormats => {
                let r: FormatsReply = read_payload(opcode, payload)?;
                let n = (r.num_formats as usize).min(MAX_FORMATS);
                Reply::Formats(r.formats[..n].to_vec())
            }
            Opcode::CompositorWaitFrame => Reply::WaitFrame(read_payload(opcode, payload)?),
            Opcode::CompositorLayerSync => {
                let r: U32Reply = read_payload(opcode, payload)?;
                Reply::LayerSync {
                    free_slot_id: r.value,
                }
            }
            Opcode::SwapchainCreate => {
                let r: SwapchainCreateReply = read_payload(opcode, payload)?;
                Reply::SwapchainCreated {
                    id: r.id,
                    num_images: r.num_images,
                    size: r.size,
                }
            }
            Opcode::SwapchainAcquireImage => {
                let r: U32Reply = read_payload(opcode, payload)?;
                Reply::ImageAcquired { index: r.value }
            }
            Opcode::DeviceGetTrackedPose => {
                let r: TrackedPoseReply = read_payload(opcode, payload)?;
                Reply::TrackedPose {
                    timestamp_ns: r.timestamp_ns,
                    relation: r.relation,
                }
            }
            Opcode::DeviceGetViewPose => Reply::ViewPose(read_payload(opcode, payload)?),
        };

        Ok(Ok(reply))
    }
}
