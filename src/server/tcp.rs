//! Tokio-backed [`Reactor`]
//!
//! One task per accepted socket waits for readiness and hands each read to
//! the [`EventHandler`], so events of one descriptor are strictly serial.
//! Writes never wait: they go straight to the socket and report `WouldBlock`
//! for the caller to retry.

use crate::{
    errors::StartupError,
    limits::ServiceLimits,
    server::reactor::{DescriptorState, EventHandler, Fd, Reactor, TlsStatus},
};
use rustls::{ServerConfig, ServerConnection};
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufReader, Read, Write},
    net::{IpAddr, SocketAddr},
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    time::Duration,
};
use tokio::{
    io::{Interest, Ready},
    net::{TcpListener, TcpStream},
    sync::{watch, Notify},
};

const BACKLOG: i32 = 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

#[inline]
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<Mutex<ServerConnection>>,

    state: Mutex<DescriptorState>,
    destroyed: AtomicBool,
    closing: Notify,
}

impl Connection {
    fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            self.closing.notify_one();
        }
    }

    #[inline]
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn wants_tls_write(&self) -> bool {
        self.tls
            .as_ref()
            .is_some_and(|session| lock(session).wants_write())
    }
}

/// Non-blocking socket adapter for rustls record I/O.
struct SocketIo<'a>(&'a TcpStream);

impl Read for SocketIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for SocketIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn flush_tls(session: &mut ServerConnection, stream: &TcpStream) -> io::Result<()> {
    while session.wants_write() {
        session.write_tls(&mut SocketIo(stream))?;
    }
    Ok(())
}

enum Received {
    Data(usize),
    Pending,
    Eof,
}

/// Listens on one address and tracks its accepted sockets.
#[derive(Debug)]
pub struct TcpReactor {
    buffer_len: usize,
    next_fd: AtomicU64,
    connections: Mutex<HashMap<Fd, Arc<Connection>>>,

    local_addr: OnceLock<SocketAddr>,
    shutdown: watch::Sender<bool>,
}

impl TcpReactor {
    pub fn new(limits: &ServiceLimits) -> Self {
        Self {
            buffer_len: limits.buffer_len,
            next_fd: AtomicU64::new(1),
            connections: Mutex::default(),

            local_addr: OnceLock::new(),
            shutdown: watch::Sender::new(false),
        }
    }

    /// Address the listener is bound to, once started.
    #[inline]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Number of open descriptors.
    pub fn connections(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Stops accepting and closes every open descriptor.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);

        for conn in lock(&self.connections).values() {
            conn.destroy();
        }
    }

    #[inline]
    fn get(&self, fd: Fd) -> Option<Arc<Connection>> {
        lock(&self.connections).get(&fd).cloned()
    }

    async fn accept_loop<H: EventHandler>(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Option<Arc<ServerConfig>>,
        handler: Arc<H>,
    ) -> Result<(), StartupError> {
        let mut shutdown = self.shutdown.subscribe();

        if let Ok(addr) = listener.local_addr() {
            let _ = self.local_addr.set(addr);
            tracing::info!(%addr, tls = tls.is_some(), "listening");
        }

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = async { let _ = shutdown.wait_for(|stopped| *stopped).await; } => break,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let session = match &tls {
                Some(config) => match ServerConnection::new(config.clone()) {
                    Ok(session) => Some(Mutex::new(session)),
                    Err(err) => {
                        tracing::warn!(%peer, error = %err, "TLS session setup failed");
                        continue;
                    }
                },
                None => None,
            };

            let _ = stream.set_nodelay(true);

            let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
            let conn = Arc::new(Connection {
                stream,
                peer,
                tls: session,

                state: Mutex::default(),
                destroyed: AtomicBool::new(false),
                closing: Notify::new(),
            });

            lock(&self.connections).insert(fd, conn.clone());
            handler.on_accept(fd);

            tokio::spawn(self.clone().serve(fd, conn, handler.clone()));
        }

        tracing::info!("listener stopped");
        Ok(())
    }

    async fn serve<H: EventHandler>(self: Arc<Self>, fd: Fd, conn: Arc<Connection>, handler: Arc<H>) {
        let mut buf = vec![0; self.buffer_len];

        while !conn.is_destroyed() {
            // Plaintext already decrypted by an earlier read
            if let Some(session) = &conn.tls {
                match receive_buffered(session, &mut buf) {
                    Ok(Received::Data(n)) => {
                        handler.on_receive(fd, &buf[..n]).await;
                        continue;
                    }
                    Ok(Received::Eof) => break,
                    Ok(Received::Pending) => {}
                    Err(err) => {
                        handler.on_error(fd, &err);
                        break;
                    }
                }
            }

            let interest = match conn.wants_tls_write() {
                true => Interest::READABLE | Interest::WRITABLE,
                false => Interest::READABLE,
            };

            let ready = tokio::select! {
                ready = conn.stream.ready(interest) => ready,
                _ = conn.closing.notified() => break,
            };

            let received = ready.and_then(|ready| self.receive(&conn, ready, &mut buf));

            match received {
                Ok(Received::Data(n)) => handler.on_receive(fd, &buf[..n]).await,
                Ok(Received::Pending) => {}
                Ok(Received::Eof) => break,
                Err(err) => {
                    handler.on_error(fd, &err);
                    break;
                }
            }
        }

        handler.on_close(fd);
        lock(&self.connections).remove(&fd);
        tracing::trace!(fd, "closed");
    }

    fn receive(&self, conn: &Connection, ready: Ready, buf: &mut [u8]) -> io::Result<Received> {
        let Some(session) = &conn.tls else {
            if !ready.is_readable() && !ready.is_read_closed() {
                return Ok(Received::Pending);
            }

            return match conn.stream.try_read(buf) {
                Ok(0) => Ok(Received::Eof),
                Ok(n) => Ok(Received::Data(n)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Received::Pending),
                Err(err) => Err(err),
            };
        };

        let mut session = lock(session);

        if ready.is_writable() {
            match flush_tls(&mut session, &conn.stream) {
                Err(err) if err.kind() != io::ErrorKind::WouldBlock => return Err(err),
                _ => {}
            }
        }

        if !ready.is_readable() && !ready.is_read_closed() {
            return Ok(Received::Pending);
        }

        let eof = match session.read_tls(&mut SocketIo(&conn.stream)) {
            Ok(0) => true,
            Ok(_) => false,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(Received::Pending),
            Err(err) => return Err(err),
        };

        let processed = session.process_new_packets();

        // Handshake records, or the alert describing a failure
        match flush_tls(&mut session, &conn.stream) {
            Err(err) if err.kind() != io::ErrorKind::WouldBlock => return Err(err),
            _ => {}
        }

        let state = processed.map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        if state.plaintext_bytes_to_read() > 0 {
            return match session.reader().read(buf) {
                Ok(n) => Ok(Received::Data(n)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Received::Pending),
                Err(err) => Err(err),
            };
        }

        match eof || state.peer_has_closed() {
            true => Ok(Received::Eof),
            false => Ok(Received::Pending),
        }
    }
}

fn receive_buffered(session: &Mutex<ServerConnection>, buf: &mut [u8]) -> io::Result<Received> {
    match lock(session).reader().read(buf) {
        Ok(0) => Ok(Received::Eof),
        Ok(n) => Ok(Received::Data(n)),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Received::Pending),
        Err(err) => Err(err),
    }
}

fn bind_listener(bind: &str, port: u16) -> Result<TcpListener, StartupError> {
    let bind_err = |source: io::Error| StartupError::Bind {
        addr: format!("{bind}:{port}"),
        source,
    };

    let ip: IpAddr = bind
        .parse()
        .map_err(|err| bind_err(io::Error::new(io::ErrorKind::InvalidInput, err)))?;
    let addr = SocketAddr::new(ip, port);

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;

    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(BACKLOG).map_err(bind_err)?;

    TcpListener::from_std(socket.into()).map_err(bind_err)
}

fn tls_file(path: &Path) -> impl Fn(io::Error) -> StartupError + '_ {
    move |source| StartupError::TlsFile {
        path: path.to_owned(),
        source,
    }
}

fn load_tls_config(cert: &Path, key: &Path) -> Result<Arc<ServerConfig>, StartupError> {
    let mut reader = BufReader::new(File::open(cert).map_err(tls_file(cert))?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(tls_file(cert))?;

    let mut reader = BufReader::new(File::open(key).map_err(tls_file(key))?);
    let private_key = rustls_pemfile::private_key(&mut reader)
        .map_err(tls_file(key))?
        .ok_or_else(|| StartupError::NoPrivateKey(key.to_owned()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, private_key)?;

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

impl Reactor for TcpReactor {
    fn write(&self, fd: Fd, bytes: &[u8]) -> io::Result<usize> {
        match self.get(fd) {
            Some(conn) if !conn.is_destroyed() => conn.stream.try_write(bytes),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn write_tls(&self, fd: Fd, bytes: &[u8]) -> (usize, TlsStatus) {
        let Some(conn) = self.get(fd).filter(|conn| !conn.is_destroyed()) else {
            return (0, TlsStatus::Syscall);
        };
        let Some(session) = &conn.tls else {
            return (0, TlsStatus::Ssl);
        };

        let mut session = lock(session);

        let n = match bytes.is_empty() {
            true => 0,
            false => match session.writer().write(bytes) {
                Ok(n) => n,
                Err(_) => return (0, TlsStatus::Ssl),
            },
        };

        match flush_tls(&mut session, &conn.stream) {
            Ok(()) => (n, TlsStatus::None),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => (n, TlsStatus::WantWrite),
            Err(_) => (n, TlsStatus::Syscall),
        }
    }

    fn destroy_connection(&self, fd: Fd) {
        if let Some(conn) = self.get(fd) {
            conn.destroy();
        }
    }

    fn set_connection_data(&self, fd: Fd, state: DescriptorState) -> Result<(), DescriptorState> {
        let Some(conn) = self.get(fd) else {
            return Err(state);
        };

        let mut slot = lock(&conn.state);
        if !slot.is_empty() {
            return Err(state);
        }

        *slot = state;
        Ok(())
    }

    fn take_connection_data(&self, fd: Fd) -> DescriptorState {
        self.get(fd)
            .map(|conn| std::mem::take(&mut *lock(&conn.state)))
            .unwrap_or_default()
    }

    fn peer_addr(&self, fd: Fd) -> Option<SocketAddr> {
        self.get(fd).map(|conn| conn.peer)
    }

    async fn start<H: EventHandler>(
        self: Arc<Self>,
        bind: &str,
        port: u16,
        handler: Arc<H>,
    ) -> Result<(), StartupError> {
        let listener = bind_listener(bind, port)?;
        self.accept_loop(listener, None, handler).await
    }

    async fn start_tls<H: EventHandler>(
        self: Arc<Self>,
        bind: &str,
        port: u16,
        cert: &Path,
        key: &Path,
        handler: Arc<H>,
    ) -> Result<(), StartupError> {
        let config = load_tls_config(cert, key)?;
        let listener = bind_listener(bind, port)?;
        self.accept_loop(listener, Some(config), handler).await
    }
}
