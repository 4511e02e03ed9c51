//! Contract between the socket reactor and the request-serving core
//!
//! The reactor owns sockets and dispatches readiness events to an
//! [`EventHandler`]. Events for one descriptor never overlap, events for
//! different descriptors may run concurrently. The core calls back into the
//! reactor to write, to close, and to park per-descriptor state between events.

use crate::{
    errors::StartupError,
    server::{pool::Lease, service::PendingUpload},
};
use std::{future::Future, io, net::SocketAddr, path::Path, sync::Arc};

/// Descriptor id assigned by the reactor, never reused within a process.
pub type Fd = u64;

/// Outcome of a TLS write as reported by the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsStatus {
    /// Progress was made, or nothing was left to write.
    None,
    /// The peer sent `close_notify`.
    ZeroReturn,
    /// The socket cannot take more bytes yet.
    WantWrite,
    /// A handshake read must complete first.
    WantRead,
    /// The underlying socket failed.
    Syscall,
    /// A TLS protocol error.
    Ssl,
}

/// State parked on a descriptor between receive events.
#[derive(Debug, Default)]
pub enum DescriptorState {
    /// The next receive event starts a new request.
    #[default]
    Empty,
    /// The next receive event continues a request body.
    AwaitingUpload(Lease<PendingUpload>),
}

impl DescriptorState {
    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Socket reactor used by the core.
pub trait Reactor
where
    Self: Send + Sync + 'static,
{
    /// Non-blocking plaintext write, `WouldBlock` when the socket is full.
    fn write(&self, fd: Fd, bytes: &[u8]) -> io::Result<usize>;

    /// Non-blocking TLS write of application data.
    fn write_tls(&self, fd: Fd, bytes: &[u8]) -> (usize, TlsStatus);

    /// Closes the descriptor. `on_close` follows once the socket is gone.
    fn destroy_connection(&self, fd: Fd);

    /// Parks `state` on the descriptor. Gives it back when the descriptor is
    /// unknown or already holds state.
    fn set_connection_data(&self, fd: Fd, state: DescriptorState) -> Result<(), DescriptorState>;

    /// Removes and returns the parked state, [`DescriptorState::Empty`] when none.
    fn take_connection_data(&self, fd: Fd) -> DescriptorState;

    fn peer_addr(&self, fd: Fd) -> Option<SocketAddr>;

    /// Accepts plaintext connections until stopped.
    fn start<H: EventHandler>(
        self: Arc<Self>,
        bind: &str,
        port: u16,
        handler: Arc<H>,
    ) -> impl Future<Output = Result<(), StartupError>> + Send;

    /// Accepts TLS connections until stopped.
    fn start_tls<H: EventHandler>(
        self: Arc<Self>,
        bind: &str,
        port: u16,
        cert: &Path,
        key: &Path,
        handler: Arc<H>,
    ) -> impl Future<Output = Result<(), StartupError>> + Send;
}

/// Receiver of reactor events.
pub trait EventHandler
where
    Self: Send + Sync + 'static,
{
    fn on_accept(&self, fd: Fd);

    /// Handles bytes read from the descriptor.
    fn on_receive(&self, fd: Fd, bytes: &[u8]) -> impl Future<Output = ()> + Send;

    /// The socket is closed. Parked state is still reachable through
    /// [`Reactor::take_connection_data`] until this returns.
    fn on_close(&self, fd: Fd);

    fn on_error(&self, fd: Fd, err: &io::Error);
}
