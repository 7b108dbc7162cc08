//! Message send/receive with `SCM_RIGHTS` descriptor passing.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags};
use tracing::warn;

use crate::proto::IPC_MAX_SWAPCHAIN_FDS;

/// Send one message, attaching `fds` as ancillary data.
///
/// The kernel duplicates the descriptors into the peer; the caller keeps
/// ownership of its copies.
pub fn send_with_fds(socket: BorrowedFd<'_>, data: &[u8], fds: &[BorrowedFd<'_>]) -> nix::Result<usize> {
    let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
    let iov = [IoSlice::new(data)];
    let cmsgs = [ControlMessage::ScmRights(&raw)];

    loop {
        match socket::sendmsg::<()>(
            socket.as_raw_fd(),
            &iov,
            if raw.is_empty() { &[] } else { &cmsgs },
            MsgFlags::MSG_NOSIGNAL,
            None,
        ) {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// Receive one message into `buf`, collecting any attached descriptors.
///
/// Returns the number of bytes received (0 on orderly shutdown). `EINTR` is
/// passed through so the caller's loop can re-check its shutdown flag. A
/// message that did not fit in `buf` fails with `EMSGSIZE`; its descriptors
/// are closed.
pub fn recv_with_fds(socket: BorrowedFd<'_>, buf: &mut [u8]) -> nix::Result<(usize, Vec<OwnedFd>)> {
    let mut cmsg_buf = nix::cmsg_space!([RawFd; IPC_MAX_SWAPCHAIN_FDS]);
    let mut iov = [IoSliceMut::new(buf)];

    let msg = socket::recvmsg::<()>(
        socket.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs()? {
        match cmsg {
            ControlMessageOwned::ScmRights(received) => {
                fds.extend(received.into_iter().filter(|&fd| fd >= 0).map(|fd| {
                    // SAFETY: freshly received from the kernel, owned by nobody else
                    unsafe { OwnedFd::from_raw_fd(fd) }
                }));
            }
            other => warn!("Ignoring unexpected control message: {:?}", other),
        }
    }

    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        warn!("Ancillary data truncated, some descriptors were dropped");
    }
    if msg.flags.contains(MsgFlags::MSG_TRUNC) {
        return Err(Errno::EMSGSIZE);
    }

    Ok((msg.bytes, fds))
}
