//! Blocking client side of the control socket.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::Path;

use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, UnixAddr};
use thiserror::Error;
use tracing::debug;

use crate::fdpass::{recv_with_fds, send_with_fds};
use crate::proto::{Command, DecodeError, Reply, ResultCode, IPC_BUF_SIZE};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("socket error: {0}")]
    Io(#[from] nix::Error),

    #[error("malformed reply: {0}")]
    Decode(#[from] DecodeError),

    #[error("server replied {0:?}")]
    Failed(ResultCode),

    #[error("server closed the connection")]
    Disconnected,
}

/// One client connection to the compositor server.
pub struct IpcClient {
    socket: OwnedFd,
}

impl IpcClient {
    /// Connect to the server's rendezvous socket
    pub fn connect(path: &Path) -> Result<Self, ClientError> {
        let socket = socket::socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        let addr = UnixAddr::new(path)?;
        socket::connect(socket.as_raw_fd(), &addr)?;
        debug!("Connected to {:?}", path);
        Ok(Self { socket })
    }

    /// Wrap an already connected socket
    pub fn from_fd(socket: OwnedFd) -> Self {
        Self { socket }
    }

    /// Send a raw message, bypassing encoding
    pub fn send_raw(&self, data: &[u8]) -> Result<(), ClientError> {
        send_with_fds(self.socket.as_fd(), data, &[])?;
        Ok(())
    }

    /// Issue one request and wait for its reply.
    ///
    /// Descriptors attached to the reply are returned alongside it.
    pub fn call(&self, command: &Command) -> Result<(Reply, Vec<OwnedFd>), ClientError> {
        self.send_raw(&command.encode())?;

        let mut buf = [0u8; IPC_BUF_SIZE];
        let (len, fds) = loop {
            match recv_with_fds(self.socket.as_fd(), &mut buf) {
                Err(nix::Error::EINTR) => continue,
                other => break other?,
            }
        };
        if len == 0 {
            return Err(ClientError::Disconnected);
        }

        match Reply::decode(command.opcode(), &buf[..len])? {
            Ok(reply) => Ok((reply, fds)),
            Err(code) => Err(ClientError::Failed(code)),
        }
    }
}
