//! Session Acceptor
//!
//! Listens on the rendezvous socket and gives every accepted connection a
//! session slot and a thread of its own.

use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::errno::Errno;
use nix::sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use tracing::{debug, error, info, warn};

use super::session::{ClientSession, SessionContext};
use super::ClientId;
use crate::error::HandlerError;

const LISTENER: Token = Token(0);

pub struct Acceptor {
    listener: OwnedFd,
    path: PathBuf,
    poll: Poll,
    ctx: SessionContext,
    sessions: Vec<Option<JoinHandle<()>>>,
    next_id: ClientId,
}

impl Acceptor {
    /// Bind the listening socket, replacing a stale socket file.
    pub fn bind(path: &Path, max_clients: usize, ctx: SessionContext) -> Result<Self> {
        match fs::remove_file(path) {
            Ok(()) => debug!("Removed stale socket {:?}", path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("Failed to remove stale socket {:?}", path)),
        }

        let listener = socket::socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            None,
        )
        .context("Failed to create listening socket")?;
        let addr = UnixAddr::new(path).context("Invalid socket path")?;
        socket::bind(listener.as_raw_fd(), &addr)
            .with_context(|| format!("Failed to bind {:?}", path))?;
        socket::listen(&listener, Backlog::MAXCONN).context("Failed to listen")?;

        let poll = Poll::new().context("Failed to create poll instance")?;
        poll.registry()
            .register(&mut SourceFd(&listener.as_raw_fd()), LISTENER, Interest::READABLE)
            .context("Failed to register listening socket")?;

        info!("Listening on {:?} (max {} clients)", path, max_clients);

        Ok(Self {
            listener,
            path: path.to_path_buf(),
            poll,
            ctx,
            sessions: (0..max_clients).map(|_| None).collect(),
            next_id: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of sessions whose threads are still running
    pub fn active_sessions(&self) -> usize {
        self.sessions
            .iter()
            .flatten()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Accept clients until the running flag clears, then wait for every
    /// session to finish.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(8);

        while self.ctx.running.load(Ordering::SeqCst) {
            match self.poll.poll(&mut events, Some(self.ctx.poll_timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("Failed to poll listening socket"),
            }

            self.reap();
            if !events.is_empty() {
                self.accept_pending();
            }
        }

        info!(
            "Stopped accepting on {:?}, waiting for {} sessions",
            self.path(),
            self.active_sessions()
        );
        self.join_all();
        Ok(())
    }

    fn accept_pending(&mut self) {
        loop {
            match socket::accept4(
                self.listener.as_raw_fd(),
                SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            ) {
                Ok(raw) => {
                    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
                    self.start_session(fd);
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) | Err(Errno::ECONNABORTED) => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn start_session(&mut self, fd: OwnedFd) {
        self.reap();
        let Some(slot) = self.sessions.iter().position(Option::is_none) else {
            // Closing the descriptor is the only answer the client gets
            warn!(
                "Refusing client: {} ({} sessions)",
                HandlerError::ResourceExhausted("session table"),
                self.sessions.len()
            );
            return;
        };

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let session = match ClientSession::new(id, fd, self.ctx.clone()) {
            Ok(session) => session,
            Err(e) => {
                warn!("Failed to set up client {}: {}", id, e);
                return;
            }
        };

        match thread::Builder::new()
            .name(format!("halo-client-{}", id))
            .spawn(move || session.run())
        {
            Ok(handle) => self.sessions[slot] = Some(handle),
            Err(e) => error!("Failed to spawn thread for client {}: {}", id, e),
        }
    }

    /// Free the slots of sessions that have ended
    fn reap(&mut self) {
        for slot in &mut self.sessions {
            if slot.as_ref().is_some_and(|handle| handle.is_finished()) {
                if let Some(handle) = slot.take() {
                    join_session(handle);
                }
            }
        }
    }

    fn join_all(&mut self) {
        for handle in self.sessions.iter_mut().filter_map(Option::take) {
            join_session(handle);
        }
    }
}

fn join_session(handle: JoinHandle<()>) {
    let name = handle.thread().name().unwrap_or("client").to_string();
    if handle.join().is_err() {
        error!("Session thread {} panicked", name);
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.join_all();
        if let Err(e) = fs::remove_file(&self.path) {
            debug!("Failed to remove socket {:?}: {}", self.path, e);
        }
    }
}
