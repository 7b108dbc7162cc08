//! Client Session
//!
//! One session per accepted connection, each on its own thread. The loop
//! waits for the socket with a bounded timeout so shutdown is noticed, reads
//! one message at a time and answers it before reading the next.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use halo_ipc::fdpass::{recv_with_fds, send_with_fds};
use halo_ipc::proto::IPC_BUF_SIZE;
use halo_ipc::types::LayerSlot;
use halo_ipc::{Command, ResultCode, ShmRegion};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use tracing::{debug, info, trace, warn};

use super::broker::BrokerHandle;
use super::dispatch::dispatch;
use super::swapchain::SwapchainTable;
use super::ClientId;
use crate::backend::CompositorBackend;
use crate::error::{HandlerError, ProtocolError};

const SOCKET: Token = Token(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Active,
    Rendering,
    Disconnected,
}

/// Everything one session owns exclusively.
pub struct ClientState {
    pub id: ClientId,
    pub active: bool,
    pub swapchains: SwapchainTable,
    /// Last frame the client delivered
    pub render_state: LayerSlot,
    pub rendering_state: bool,
    released: bool,
}

impl ClientState {
    pub fn new(id: ClientId) -> Self {
        Self {
            id,
            active: false,
            swapchains: SwapchainTable::new(),
            render_state: LayerSlot::default(),
            rendering_state: false,
            released: false,
        }
    }

    pub fn phase(&self) -> SessionState {
        if self.released {
            SessionState::Disconnected
        } else if !self.active {
            SessionState::Connected
        } else if self.rendering_state {
            SessionState::Rendering
        } else {
            SessionState::Active
        }
    }

    /// Release everything the session holds. Only the first call does
    /// anything; it returns whether this was it.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.active = false;
        self.render_state = LayerSlot::default();
        self.rendering_state = false;
        let destroyed = self.swapchains.clear();
        if destroyed > 0 {
            debug!("Client {}: destroyed {} swapchains", self.id, destroyed);
        }
        true
    }
}

/// Shared services handed to every session
#[derive(Clone)]
pub struct SessionContext {
    pub broker: BrokerHandle,
    pub compositor: Arc<dyn CompositorBackend>,
    pub shm: Arc<ShmRegion>,
    pub running: Arc<AtomicBool>,
    pub exit_on_disconnect: bool,
    pub poll_timeout: Duration,
}

pub struct ClientSession {
    socket: Option<OwnedFd>,
    poll: Option<Poll>,
    state: ClientState,
    ctx: SessionContext,
}

impl ClientSession {
    pub fn new(id: ClientId, socket: OwnedFd, ctx: SessionContext) -> io::Result<Self> {
        // mio readiness is edge-triggered; the socket is drained until EAGAIN
        let flags = OFlag::from_bits_truncate(fcntl(socket.as_raw_fd(), FcntlArg::F_GETFL)?);
        fcntl(socket.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut SourceFd(&socket.as_raw_fd()), SOCKET, Interest::READABLE)?;

        Ok(Self {
            socket: Some(socket),
            poll: Some(poll),
            state: ClientState::new(id),
            ctx,
        })
    }

    /// Serve the client until it leaves, misbehaves or the server stops.
    pub fn run(mut self) {
        info!("Client {} connected", self.state.id);
        match self.serve() {
            Ok(()) => info!("Client {} disconnected", self.state.id),
            Err(e) => warn!("Client {}: {}, disconnecting", self.state.id, e),
        }
        self.teardown();
    }

    fn serve(&mut self) -> Result<(), ProtocolError> {
        let mut events = Events::with_capacity(4);
        let mut buf = [0u8; IPC_BUF_SIZE];

        loop {
            if !self.ctx.running.load(Ordering::SeqCst) {
                debug!("Client {}: server shutting down", self.state.id);
                return Ok(());
            }

            let Some(poll) = self.poll.as_mut() else {
                return Ok(());
            };
            match poll.poll(&mut events, Some(self.ctx.poll_timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            if events.is_empty() {
                continue;
            }

            loop {
                let Some(socket) = self.socket.as_ref() else {
                    return Ok(());
                };
                let (len, fds) = match recv_with_fds(socket.as_fd(), &mut buf) {
                    Ok(received) => received,
                    Err(Errno::EAGAIN) => break,
                    Err(Errno::EINTR) => continue,
                    Err(Errno::EMSGSIZE) => return Err(ProtocolError::Oversized(IPC_BUF_SIZE)),
                    Err(e) => return Err(e.into()),
                };
                if len == 0 {
                    // Peer hung up
                    return Ok(());
                }
                if !fds.is_empty() {
                    warn!("Client {}: dropping {} unexpected descriptors", self.state.id, fds.len());
                }
                self.handle_message(&buf[..len])?;
            }
        }
    }

    fn handle_message(&mut self, message: &[u8]) -> Result<(), ProtocolError> {
        let command = Command::decode(message)?;

        match dispatch(&mut self.state, &self.ctx, command) {
            Ok(response) => {
                let fds: Vec<_> = response.fds.iter().map(|fd| fd.as_fd()).collect();
                self.send(&response.reply.encode(), &fds)
            }
            Err(HandlerError::Protocol(e)) => Err(e),
            Err(e) => {
                let code = e.result_code().unwrap_or(ResultCode::IpcFailure);
                warn!("Client {}: {:?} failed: {}", self.state.id, command.opcode(), e);
                self.send(&code.encode(), &[])
            }
        }
    }

    fn send(&self, data: &[u8], fds: &[std::os::fd::BorrowedFd<'_>]) -> Result<(), ProtocolError> {
        let socket = self.socket.as_ref().ok_or(ProtocolError::Socket(Errno::EBADF))?;
        send_with_fds(socket.as_fd(), data, fds)?;
        trace!("Client {}: sent {} bytes, {} descriptors", self.state.id, data.len(), fds.len());
        Ok(())
    }

    /// Close the connection and release the session's resources. Idempotent.
    fn teardown(&mut self) {
        if self.state.phase() == SessionState::Disconnected {
            return;
        }

        self.poll = None;
        self.socket = None;
        if let Err(e) = self.ctx.broker.disconnect(self.state.id) {
            warn!("Client {}: {}", self.state.id, e);
        }
        self.state.release();

        if self.ctx.exit_on_disconnect {
            info!("Client {} left and exit_on_disconnect is set, stopping", self.state.id);
            self.ctx.running.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::swapchain::MAX_CLIENT_SWAPCHAINS;
    use crate::server::test_support::{create_info, TestServer};
    use halo_ipc::shm::DeviceLayout;
    use halo_ipc::types::{LayerEntry, Vec3};
    use halo_ipc::{ClientError, IpcClient, Reply};
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::thread::{self, JoinHandle};

    fn connect(server: &TestServer, id: ClientId) -> (IpcClient, JoinHandle<()>) {
        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        let session = ClientSession::new(id, theirs, server.ctx.clone()).unwrap();
        let thread = thread::spawn(move || session.run());
        (IpcClient::from_fd(ours), thread)
    }

    #[test]
    fn test_full_frame_cycle() {
        let server = TestServer::start();
        let (client, thread) = connect(&server, 1);

        let (reply, mut fds) = client.call(&Command::InstanceGetShmFd).unwrap();
        assert_eq!(reply, Reply::Status);
        assert_eq!(fds.len(), 1);
        let shm = ShmRegion::open(fds.remove(0)).unwrap();
        assert_eq!(shm.num_devices(), 3);

        client.call(&Command::SessionBegin).unwrap();
        let (reply, _) = client.call(&Command::CompositorGetFormats).unwrap();
        assert!(matches!(reply, Reply::Formats(f) if !f.is_empty()));

        let (reply, _) = client.call(&Command::CompositorWaitFrame).unwrap();
        let Reply::WaitFrame(timing) = reply else {
            panic!("unexpected reply {:?}", reply);
        };
        let frame_id = timing.frame_id;
        client.call(&Command::CompositorWaitWoke { frame_id }).unwrap();
        client.call(&Command::CompositorBeginFrame { frame_id }).unwrap();

        let mut slot = LayerSlot::default();
        slot.num_layers = 1;
        slot.layers[0] = LayerEntry {
            swapchain_ids: [0, 0],
            flip_y: 1,
            ..LayerEntry::default()
        };
        shm.write_slot(0, &slot).unwrap();

        let (reply, _) = client
            .call(&Command::CompositorLayerSync { frame_id, slot_id: 0 })
            .unwrap();
        assert_eq!(reply, Reply::LayerSync { free_slot_id: 1 });

        let delivered = server.ctx.broker.latest_frame().unwrap().unwrap();
        assert_eq!(delivered.client, 1);
        assert_eq!(delivered.slot, slot);

        drop(client);
        thread.join().unwrap();
        assert!(server.ctx.broker.latest_frame().unwrap().is_none());
    }

    #[test]
    fn test_swapchain_lifecycle() {
        let server = TestServer::start();
        let (client, thread) = connect(&server, 1);

        let (reply, fds) = client.call(&Command::SwapchainCreate(create_info(16, 16))).unwrap();
        assert_eq!(
            reply,
            Reply::SwapchainCreated {
                id: 0,
                num_images: 3,
                size: 16 * 16 * 4
            }
        );
        assert_eq!(fds.len(), 3);

        let (reply, _) = client.call(&Command::SwapchainCreate(create_info(8, 8))).unwrap();
        assert!(matches!(reply, Reply::SwapchainCreated { id: 1, .. }));

        let (reply, _) = client.call(&Command::SwapchainAcquireImage { id: 0 }).unwrap();
        assert_eq!(reply, Reply::ImageAcquired { index: 0 });
        client
            .call(&Command::SwapchainWaitImage {
                id: 0,
                timeout_ns: 1_000_000,
                index: 0,
            })
            .unwrap();
        client.call(&Command::SwapchainReleaseImage { id: 0, index: 0 }).unwrap();

        client.call(&Command::SwapchainDestroy { id: 0 }).unwrap();
        // Second destroy of the same handle is accepted
        client.call(&Command::SwapchainDestroy { id: 0 }).unwrap();

        let (reply, _) = client.call(&Command::SwapchainCreate(create_info(8, 8))).unwrap();
        let Reply::SwapchainCreated { id, .. } = reply else {
            panic!("unexpected reply {:?}", reply);
        };
        assert_eq!(id, 0);
        // The id now names the new swapchain
        let (reply, _) = client.call(&Command::SwapchainAcquireImage { id: 0 }).unwrap();
        assert_eq!(reply, Reply::ImageAcquired { index: 0 });

        drop(client);
        thread.join().unwrap();
    }

    #[test]
    fn test_oversized_swapchain_keeps_session() {
        let server = TestServer::start();
        let (client, thread) = connect(&server, 1);

        let mut info = create_info(u32::MAX, u32::MAX);
        info.array_size = u32::MAX;
        info.face_count = u32::MAX;
        assert!(matches!(
            client.call(&Command::SwapchainCreate(info)),
            Err(ClientError::Failed(ResultCode::BackendFailure))
        ));

        let (reply, _) = client.call(&Command::SwapchainCreate(create_info(8, 8))).unwrap();
        assert!(matches!(reply, Reply::SwapchainCreated { id: 0, .. }));

        drop(client);
        thread.join().unwrap();
    }

    #[test]
    fn test_handler_failure_keeps_session() {
        let server = TestServer::start();
        let (client, thread) = connect(&server, 1);

        let mut info = create_info(8, 8);
        info.format = 1;
        assert!(matches!(
            client.call(&Command::SwapchainCreate(info)),
            Err(ClientError::Failed(ResultCode::BackendFailure))
        ));
        assert!(matches!(
            client.call(&Command::DeviceSetOutput {
                id: 0,
                name: 0,
                value: Default::default()
            }),
            Err(ClientError::Failed(ResultCode::DeviceFailure))
        ));

        client.call(&Command::SessionBegin).unwrap();
        drop(client);
        thread.join().unwrap();
    }

    #[test]
    fn test_full_table_reports_exhaustion() {
        let server = TestServer::start();
        let (client, thread) = connect(&server, 1);

        for expected in 0..MAX_CLIENT_SWAPCHAINS as u32 {
            let (reply, _) = client.call(&Command::SwapchainCreate(create_info(4, 4))).unwrap();
            assert!(matches!(reply, Reply::SwapchainCreated { id, .. } if id == expected));
        }
        assert!(matches!(
            client.call(&Command::SwapchainCreate(create_info(4, 4))),
            Err(ClientError::Failed(ResultCode::ResourceExhausted))
        ));
        // Existing swapchains are untouched
        client.call(&Command::SwapchainAcquireImage { id: 7 }).unwrap();

        drop(client);
        thread.join().unwrap();
    }

    #[test]
    fn test_short_message_disconnects_without_reply() {
        let server = TestServer::start();
        let (client, thread) = connect(&server, 1);

        client.send_raw(&[1, 0]).unwrap();
        thread.join().unwrap();
        assert!(matches!(
            client.call(&Command::SessionBegin),
            Err(ClientError::Disconnected) | Err(ClientError::Io(_))
        ));
    }

    #[test]
    fn test_oversized_message_disconnects() {
        let server = TestServer::start();
        let (client, thread) = connect(&server, 1);

        // A valid command followed by padding past the receive buffer
        let mut message = Command::SessionBegin.encode();
        message.resize(IPC_BUF_SIZE + 16, 0);
        client.send_raw(&message).unwrap();

        thread.join().unwrap();
        assert!(client.call(&Command::SessionBegin).is_err());
    }

    #[test]
    fn test_unknown_opcode_disconnects() {
        let server = TestServer::start();
        let (client, thread) = connect(&server, 1);

        client.send_raw(&99u32.to_le_bytes()).unwrap();
        thread.join().unwrap();
        assert!(client.call(&Command::SessionBegin).is_err());
    }

    #[test]
    fn test_frame_mismatch_disconnects() {
        let server = TestServer::start();
        let (client, thread) = connect(&server, 1);

        let (reply, _) = client.call(&Command::CompositorWaitFrame).unwrap();
        let Reply::WaitFrame(timing) = reply else {
            panic!("unexpected reply {:?}", reply);
        };
        assert!(matches!(
            client.call(&Command::CompositorWaitWoke {
                frame_id: timing.frame_id + 1
            }),
            Err(ClientError::Disconnected)
        ));
        thread.join().unwrap();
    }

    #[test]
    fn test_bad_handle_and_device_disconnect() {
        let server = TestServer::start();
        let (client, thread) = connect(&server, 1);
        assert!(matches!(
            client.call(&Command::SwapchainAcquireImage { id: 3 }),
            Err(ClientError::Disconnected)
        ));
        thread.join().unwrap();

        let (client, thread) = connect(&server, 2);
        assert!(matches!(
            client.call(&Command::DeviceGetViewPose {
                id: 9,
                eye_relation: Vec3::ZERO,
                view_index: 0
            }),
            Err(ClientError::Disconnected)
        ));
        thread.join().unwrap();

        let (client, thread) = connect(&server, 3);
        assert!(matches!(
            client.call(&Command::CompositorLayerSync { frame_id: 0, slot_id: 3 }),
            Err(ClientError::Disconnected)
        ));
        thread.join().unwrap();
    }

    #[test]
    fn test_exit_on_disconnect_stops_server() {
        let mut server = TestServer::start();
        server.ctx.exit_on_disconnect = true;
        let (client, thread) = connect(&server, 1);
        client.call(&Command::SessionBegin).unwrap();
        assert!(server.ctx.running.load(Ordering::SeqCst));

        drop(client);
        thread.join().unwrap();
        assert!(!server.ctx.running.load(Ordering::SeqCst));
    }

    #[test]
    fn test_session_notices_shutdown() {
        let server = TestServer::start();
        let (client, thread) = connect(&server, 1);
        client.call(&Command::SessionBegin).unwrap();

        server.ctx.running.store(false, Ordering::SeqCst);
        thread.join().unwrap();
        assert!(matches!(
            client.call(&Command::SessionBegin),
            Err(ClientError::Disconnected) | Err(ClientError::Io(_))
        ));
    }

    #[test]
    fn test_release_is_total_and_once() {
        let server = TestServer::start();
        let mut state = ClientState::new(4);
        let swapchain = server.ctx.compositor.create_swapchain(&create_info(4, 4)).unwrap();
        let handle = state.swapchains.insert(swapchain).ok().unwrap();
        state.active = true;
        state.rendering_state = true;
        state.render_state.num_layers = 1;
        state.render_state.layers[0].swapchain_ids = [handle.raw(), handle.raw()];
        state.render_state.layers[0].flip_y = 1;
        assert_eq!(state.phase(), SessionState::Rendering);

        assert!(state.release());
        assert_eq!(state.phase(), SessionState::Disconnected);
        assert!(!state.render_state.references_swapchains());
        assert_eq!(state.render_state.num_layers, 0);
        assert!(!state.rendering_state);
        assert_eq!(state.swapchains.count(), 0);
        assert!(!state.swapchains.is_active(handle));

        assert!(!state.release());
    }

    #[test]
    fn test_session_states() {
        let mut state = ClientState::new(1);
        assert_eq!(state.phase(), SessionState::Connected);
        state.active = true;
        assert_eq!(state.phase(), SessionState::Active);
        state.rendering_state = true;
        assert_eq!(state.phase(), SessionState::Rendering);
        state.active = false;
        assert_eq!(state.phase(), SessionState::Connected);
    }

    #[test]
    fn test_device_table_matches_config() {
        let server = TestServer::start();
        let layouts: Vec<DeviceLayout> = server.layouts.clone();
        for (i, layout) in layouts.iter().enumerate() {
            let dev = server.ctx.shm.device(i as u32).unwrap();
            assert_eq!(dev.name(), layout.name);
            assert_eq!(dev.num_inputs, layout.num_inputs);
        }
    }
}
