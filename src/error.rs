//! Error taxonomy of the broker.
//!
//! A [`ProtocolError`] ends the session without a reply. Every other
//! [`HandlerError`] is answered with a result code and the session stays up.

use halo_ipc::proto::DecodeError;
use halo_ipc::shm::ShmError;
use halo_ipc::ResultCode;
use thiserror::Error;

use crate::backend::{BackendError, DeviceError};
use crate::server::pacing::FrameMismatch;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("invalid swapchain handle {0:#x}")]
    InvalidSwapchain(u32),

    #[error("invalid device id {0}")]
    InvalidDevice(u32),

    #[error("invalid layer slot {0}")]
    InvalidSlot(u32),

    #[error(transparent)]
    FrameMismatch(#[from] FrameMismatch),

    #[error("swapchain count {counted} does not match {active} active entries")]
    SwapchainCountMismatch { counted: usize, active: usize },

    #[error("swapchain has {0} images, more than fit in one message")]
    TooManyImages(u32),

    #[error("message larger than {0} bytes")]
    Oversized(usize),

    #[error("broker is gone")]
    BrokerUnavailable,

    #[error("socket error: {0}")]
    Socket(#[from] nix::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0} exhausted")]
    ResourceExhausted(&'static str),

    #[error("backend: {0}")]
    Backend(#[from] BackendError),

    #[error("device {id}: {source}")]
    Device {
        id: u32,
        #[source]
        source: DeviceError,
    },

    #[error("shared region: {0}")]
    Shm(#[from] ShmError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl HandlerError {
    /// Result code to reply with, or `None` when the session must end
    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            HandlerError::ResourceExhausted(_) => Some(ResultCode::ResourceExhausted),
            HandlerError::Backend(_) => Some(ResultCode::BackendFailure),
            HandlerError::Device { .. } => Some(ResultCode::DeviceFailure),
            HandlerError::Shm(_) => Some(ResultCode::IpcFailure),
            HandlerError::Protocol(_) => None,
        }
    }
}

impl From<FrameMismatch> for HandlerError {
    fn from(err: FrameMismatch) -> Self {
        HandlerError::Protocol(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_codes() {
        assert_eq!(
            HandlerError::ResourceExhausted("swapchain table").result_code(),
            Some(ResultCode::ResourceExhausted)
        );
        assert_eq!(
            HandlerError::Backend(BackendError::NoImageAvailable).result_code(),
            Some(ResultCode::BackendFailure)
        );
        assert_eq!(
            HandlerError::Device {
                id: 1,
                source: DeviceError::InvalidView(3)
            }
            .result_code(),
            Some(ResultCode::DeviceFailure)
        );
        assert_eq!(
            HandlerError::from(ShmError::SlotBusy(0)).result_code(),
            Some(ResultCode::IpcFailure)
        );
        assert_eq!(
            HandlerError::from(ProtocolError::InvalidSlot(3)).result_code(),
            None
        );
    }

    #[test]
    fn test_frame_mismatch_is_fatal() {
        let err = HandlerError::from(FrameMismatch { expected: 5, got: 6 });
        assert!(err.result_code().is_none());
        assert!(err.to_string().contains('6'));
    }
}
