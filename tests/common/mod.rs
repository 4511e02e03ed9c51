#![allow(dead_code)]

use cosmos_web::{DescriptorState, EventHandler, Fd, Reactor, StartupError, TlsStatus};
use std::{
    collections::{HashMap, HashSet},
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

// REACTOR

/// Records writes per descriptor and holds parked state in memory.
#[derive(Debug, Default)]
pub struct MockReactor {
    written: Mutex<HashMap<Fd, Vec<u8>>>,
    states: Mutex<HashMap<Fd, DescriptorState>>,
    destroyed: Mutex<HashSet<Fd>>,
}

impl MockReactor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn output(&self, fd: Fd) -> Vec<u8> {
        self.written.lock().unwrap().get(&fd).cloned().unwrap_or_default()
    }

    pub fn output_str(&self, fd: Fd) -> String {
        String::from_utf8_lossy(&self.output(fd)).into_owned()
    }

    pub fn is_destroyed(&self, fd: Fd) -> bool {
        self.destroyed.lock().unwrap().contains(&fd)
    }

    pub fn is_parked(&self, fd: Fd) -> bool {
        self.states
            .lock()
            .unwrap()
            .get(&fd)
            .is_some_and(|state| !state.is_empty())
    }
}

impl Reactor for MockReactor {
    fn write(&self, fd: Fd, bytes: &[u8]) -> io::Result<usize> {
        if self.is_destroyed(fd) {
            return Err(io::ErrorKind::NotConnected.into());
        }

        self.written
            .lock()
            .unwrap()
            .entry(fd)
            .or_default()
            .extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn write_tls(&self, fd: Fd, bytes: &[u8]) -> (usize, TlsStatus) {
        match self.write(fd, bytes) {
            Ok(n) => (n, TlsStatus::None),
            Err(_) => (0, TlsStatus::Syscall),
        }
    }

    fn destroy_connection(&self, fd: Fd) {
        self.destroyed.lock().unwrap().insert(fd);
    }

    fn set_connection_data(&self, fd: Fd, state: DescriptorState) -> Result<(), DescriptorState> {
        if self.is_destroyed(fd) {
            return Err(state);
        }

        let mut states = self.states.lock().unwrap();
        match states.get(&fd) {
            Some(current) if !current.is_empty() => Err(state),
            _ => {
                states.insert(fd, state);
                Ok(())
            }
        }
    }

    fn take_connection_data(&self, fd: Fd) -> DescriptorState {
        self.states.lock().unwrap().remove(&fd).unwrap_or_default()
    }

    fn peer_addr(&self, fd: Fd) -> Option<SocketAddr> {
        Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 40000 + fd as u16))
    }

    async fn start<H: EventHandler>(
        self: Arc<Self>,
        _: &str,
        _: u16,
        _: Arc<H>,
    ) -> Result<(), StartupError> {
        Ok(())
    }

    async fn start_tls<H: EventHandler>(
        self: Arc<Self>,
        _: &str,
        _: u16,
        _: &Path,
        _: &Path,
        _: Arc<H>,
    ) -> Result<(), StartupError> {
        Ok(())
    }
}

// DOCUMENT ROOT

/// Temporary document root removed on drop.
pub struct DocRoot(PathBuf);

impl DocRoot {
    pub fn new(name: &str) -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(0);

        let dir = std::env::temp_dir().join(format!(
            "cosmos-{name}-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        Self(dir)
    }

    pub fn file(self, name: &str, content: &[u8]) -> Self {
        let path = self.0.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
        self
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn root(&self) -> String {
        self.0.to_string_lossy().into_owned()
    }
}

impl Drop for DocRoot {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

// FASTCGI BACKEND

const FCGI_BEGIN_REQUEST: u8 = 1;
const FCGI_END_REQUEST: u8 = 3;
const FCGI_PARAMS: u8 = 4;
const FCGI_STDIN: u8 = 5;
const FCGI_STDOUT: u8 = 6;

/// One request as decoded by the backend.
#[derive(Debug, Default)]
pub struct Captured {
    pub params: HashMap<String, String>,
    pub stdin: Vec<u8>,
}

/// Responder answering every request with a fixed CGI response.
pub struct Backend {
    pub addr: SocketAddr,
    pub requests: mpsc::UnboundedReceiver<Captured>,
    pub connections: Arc<AtomicUsize>,
}

impl Backend {
    pub async fn spawn(reply: &[u8]) -> Self {
        Self::spawn_records(reply.chunks(1000).map(<[u8]>::to_vec).collect()).await
    }

    /// Answers with one `STDOUT` record per entry of `stdout`.
    pub async fn spawn_records(stdout: Vec<Vec<u8>>) -> Self {
        let stdout = Arc::new(stdout);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, requests) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));

        let counter = connections.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(serve(stream, tx.clone(), stdout.clone()));
            }
        });

        Self {
            addr,
            requests,
            connections,
        }
    }

    pub fn pass(&self) -> String {
        self.addr.to_string()
    }
}

/// A backend that reads the start of each request and hangs up, resetting the socket.
pub async fn hangup_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0; 64];
            let _ = stream.read(&mut buf).await;
        }
    });

    addr
}

/// An address nothing listens on.
pub async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn read_record(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let mut header = [0; 8];
    stream.read_exact(&mut header).await.ok()?;

    let len = u16::from_be_bytes([header[4], header[5]]) as usize;
    let mut content = vec![0; len + header[6] as usize];
    stream.read_exact(&mut content).await.ok()?;

    content.truncate(len);
    Some((header[1], content))
}

fn decode_params(mut src: &[u8], out: &mut HashMap<String, String>) {
    fn length(src: &mut &[u8]) -> usize {
        if src[0] & 0x80 == 0 {
            let len = src[0] as usize;
            *src = &src[1..];
            len
        } else {
            let len = u32::from_be_bytes([src[0] & 0x7f, src[1], src[2], src[3]]) as usize;
            *src = &src[4..];
            len
        }
    }

    while !src.is_empty() {
        let name_len = length(&mut src);
        let value_len = length(&mut src);

        let name = String::from_utf8_lossy(&src[..name_len]).into_owned();
        let value = String::from_utf8_lossy(&src[name_len..name_len + value_len]).into_owned();
        out.insert(name, value);

        src = &src[name_len + value_len..];
    }
}

pub fn record(kind: u8, content: &[u8]) -> Vec<u8> {
    let padding = (8 - content.len() % 8) % 8;
    let len = (content.len() as u16).to_be_bytes();

    let mut out = vec![1, kind, 0, 1, len[0], len[1], padding as u8, 0];
    out.extend_from_slice(content);
    out.extend(std::iter::repeat(0).take(padding));
    out
}

async fn serve(mut stream: TcpStream, tx: mpsc::UnboundedSender<Captured>, stdout: Arc<Vec<Vec<u8>>>) {
    loop {
        let mut captured = Captured::default();
        let mut params = Vec::new();

        loop {
            let Some((kind, content)) = read_record(&mut stream).await else {
                return;
            };

            match kind {
                FCGI_BEGIN_REQUEST => {}
                FCGI_PARAMS => params.extend_from_slice(&content),
                FCGI_STDIN if content.is_empty() => break,
                FCGI_STDIN => captured.stdin.extend_from_slice(&content),
                _ => return,
            }
        }

        decode_params(&params, &mut captured.params);
        let _ = tx.send(captured);

        let mut out = Vec::new();
        for chunk in stdout.iter() {
            out.extend(record(FCGI_STDOUT, chunk));
        }
        out.extend(record(FCGI_STDOUT, &[]));
        out.extend(record(FCGI_END_REQUEST, &[0; 8]));

        if stream.write_all(&out).await.is_err() {
            return;
        }
    }
}

// HTTP

/// Strips chunked framing, `None` when the body is not well-formed.
pub fn dechunk(mut body: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();

    loop {
        let line_end = body.windows(2).position(|w| w == b"\r\n")?;
        let len = usize::from_str_radix(std::str::from_utf8(&body[..line_end]).ok()?, 16).ok()?;
        body = &body[line_end + 2..];

        if len == 0 {
            return (body == b"\r\n").then_some(out);
        }

        out.extend_from_slice(body.get(..len)?);
        if body.get(len..len + 2)? != b"\r\n" {
            return None;
        }
        body = &body[len + 2..];
    }
}

/// Splits a response into its head and body.
pub fn split_response(raw: &[u8]) -> (String, Vec<u8>) {
    let at = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response has a head");

    (
        String::from_utf8_lossy(&raw[..at + 4]).into_owned(),
        raw[at + 4..].to_vec(),
    )
}
