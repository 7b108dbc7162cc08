//! Halo IPC Protocol
//!
//! Everything a compositor client and the halo server must agree on: the
//! wire format of the control socket, the layout of the Shared Control
//! Region, and descriptor passing.

pub mod client;
pub mod fdpass;
pub mod proto;
pub mod shm;
pub mod types;

pub use client::{ClientError, IpcClient};
pub use proto::{Command, DecodeError, FrameTiming, Opcode, Reply, ResultCode};
pub use shm::{ShmRegion, N_SLOTS};

/// Default rendezvous socket path
pub fn socket_path() -> std::path::PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .unwrap_or_else(|_| format!("/run/user/{}", unsafe { libc::getuid() }));
    std::path::PathBuf::from(runtime_dir).join("halo_comp_ipc")
}
