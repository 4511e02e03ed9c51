//! FastCGI responder client
//!
//! Each configured filter owns one [`Gateway`]: a bounded set of backend
//! connections reused after a complete exchange. A request is written as
//! `BEGIN_REQUEST`, `PARAMS`, and `STDIN` records; the body may follow in later
//! [`write_form_data`](Gateway::write_form_data) calls. The response is pushed
//! record by record into a [`ChunkSink`].

use crate::{
    http::{request::ParsedRequest, types::MethodKind},
    limits::GatewayLimits,
};
use crossbeam::queue::ArrayQueue;
use std::{future::Future, io, net::IpAddr, path::Path, sync::Arc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{OwnedSemaphorePermit, Semaphore},
    time::timeout,
};

const FCGI_VERSION: u8 = 1;
const FCGI_BEGIN_REQUEST: u8 = 1;
const FCGI_END_REQUEST: u8 = 3;
const FCGI_PARAMS: u8 = 4;
const FCGI_STDIN: u8 = 5;
const FCGI_STDOUT: u8 = 6;
const FCGI_STDERR: u8 = 7;
const FCGI_RESPONDER: u16 = 1;
const FCGI_KEEP_CONN: u8 = 1;

const REQUEST_ID: u16 = 1;
const MAX_RECORD_LEN: usize = 65535;
const HEADER_LEN: usize = 8;

const SERVER_SOFTWARE: &[u8] = b"Cosmos";
const LOCAL_ADDR: &[u8] = b"127.0.0.1";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("backend connection pool exhausted")]
    PoolExhausted,

    #[error("failed to connect to backend: {0}")]
    Connect(#[source] io::Error),

    #[error("failed to write to backend: {0}")]
    Write(#[source] io::Error),

    #[error("failed to read from backend: {0}")]
    Read(#[source] io::Error),

    #[error("backend timed out")]
    Timeout,

    #[error("request body exceeds its declared length")]
    BodyOverflow,

    #[error("request body already complete")]
    StdinClosed,

    #[error("malformed backend record")]
    Protocol,
}

/// What a [`ChunkSink`] wants after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading records.
    Continue,
    /// Stop reading, the response is abandoned.
    Break,
    /// The response was finished after end of stream.
    Done,
}

/// One step of a backend response.
#[derive(Debug)]
pub enum StreamEvent<'a> {
    /// Content of a non-empty `STDOUT` record.
    Data(&'a [u8]),
    /// `END_REQUEST` was received.
    End,
    /// The exchange failed, no further events follow.
    Failed(&'a GatewayError),
}

/// Receiver of a streamed backend response.
pub trait ChunkSink: Send {
    fn on_chunk(&mut self, event: StreamEvent<'_>) -> impl Future<Output = Flow> + Send;
}

/// Parameters sent with every request.
#[derive(Debug, Clone)]
pub(crate) struct Params<'a> {
    method: MethodKind,
    content_type: &'a str,
    content_length: u64,
    script_filename: &'a Path,
    remote_addr: Option<IpAddr>,
    query_string: &'a str,
}

impl<'a> Params<'a> {
    pub(crate) fn new(
        request: &ParsedRequest<'a>,
        script_filename: &'a Path,
        remote_addr: Option<IpAddr>,
    ) -> Self {
        Self {
            method: request.method(),
            content_type: request.content_type(),
            content_length: request.content_length(),
            script_filename,
            remote_addr,
            query_string: request.query(),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        put_nv_pair(out, b"REQUEST_METHOD", self.method.as_str().as_bytes());

        if self.method.is_post() {
            put_nv_pair(out, b"CONTENT_TYPE", self.content_type.as_bytes());
            put_nv_pair(out, b"CONTENT_LENGTH", self.content_length.to_string().as_bytes());
        } else {
            put_nv_pair(out, b"CONTENT_LENGTH", b"0");
        }

        put_nv_pair(
            out,
            b"SCRIPT_FILENAME",
            self.script_filename.as_os_str().as_encoded_bytes(),
        );
        put_nv_pair(out, b"SERVER_SOFTWARE", SERVER_SOFTWARE);

        match self.remote_addr {
            Some(ip) => put_nv_pair(out, b"REMOTE_ADDR", ip.to_string().as_bytes()),
            None => put_nv_pair(out, b"REMOTE_ADDR", LOCAL_ADDR),
        }

        put_nv_pair(out, b"QUERY_STRING", self.query_string.as_bytes());
    }

    /// Body bytes the backend expects on `STDIN`.
    #[inline]
    fn body_len(&self) -> u64 {
        if self.method.is_post() {
            self.content_length
        } else {
            0
        }
    }
}

fn put_nv_len(out: &mut Vec<u8>, len: usize) {
    if len < 128 {
        out.push(len as u8);
    } else {
        out.extend_from_slice(&((len as u32) | 0x8000_0000).to_be_bytes());
    }
}

fn put_nv_pair(out: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    put_nv_len(out, name.len());
    put_nv_len(out, value.len());
    out.extend_from_slice(name);
    out.extend_from_slice(value);
}

fn put_record(out: &mut Vec<u8>, kind: u8, content: &[u8]) {
    let len = content.len().min(MAX_RECORD_LEN);
    let padding = (8 - len % 8) % 8;

    out.extend_from_slice(&[FCGI_VERSION, kind]);
    out.extend_from_slice(&REQUEST_ID.to_be_bytes());
    out.extend_from_slice(&(len as u16).to_be_bytes());
    out.extend_from_slice(&[padding as u8, 0]);
    out.extend_from_slice(&content[..len]);
    out.extend_from_slice(&[0u8; 8][..padding]);
}

/// Writes `data` as a stream of records, the empty terminator is not included.
fn put_stream(out: &mut Vec<u8>, kind: u8, data: &[u8]) {
    for chunk in data.chunks(MAX_RECORD_LEN) {
        put_record(out, kind, chunk);
    }
}

/// Connection to a backend, holding one slot of its gateway's pool.
#[derive(Debug)]
pub struct BackendConn {
    stream: TcpStream,
    _permit: OwnedSemaphorePermit,

    out: Vec<u8>,
    record: Vec<u8>,

    stdin_remaining: u64,
    stdin_open: bool,
    completed: bool,
    /// `out` holds the whole request, sent over a reused connection.
    replay: bool,
}

impl BackendConn {
    fn new(stream: TcpStream, permit: OwnedSemaphorePermit) -> Self {
        Self {
            stream,
            _permit: permit,

            out: Vec::with_capacity(1024),
            record: Vec::with_capacity(1024),

            stdin_remaining: 0,
            stdin_open: false,
            completed: false,
            replay: false,
        }
    }

    /// Body bytes still owed to the backend.
    #[inline]
    pub fn stdin_remaining(&self) -> u64 {
        self.stdin_remaining
    }

    fn prepare(&mut self, params: &Params<'_>) {
        self.completed = false;
        self.replay = false;
        self.stdin_remaining = params.body_len();
        self.stdin_open = true;

        self.out.clear();
        self.record.clear();

        let role = FCGI_RESPONDER.to_be_bytes();
        put_record(
            &mut self.out,
            FCGI_BEGIN_REQUEST,
            &[role[0], role[1], FCGI_KEEP_CONN, 0, 0, 0, 0, 0],
        );

        params.encode(&mut self.record);
        put_stream(&mut self.out, FCGI_PARAMS, &self.record);
        put_record(&mut self.out, FCGI_PARAMS, &[]);

        if self.stdin_remaining == 0 {
            put_record(&mut self.out, FCGI_STDIN, &[]);
            self.stdin_open = false;
        }
    }

    fn push_stdin(&mut self, bytes: &[u8]) -> Result<(), GatewayError> {
        if bytes.is_empty() {
            return Ok(());
        }

        if !self.stdin_open {
            return Err(GatewayError::StdinClosed);
        }

        if bytes.len() as u64 > self.stdin_remaining {
            return Err(GatewayError::BodyOverflow);
        }

        put_stream(&mut self.out, FCGI_STDIN, bytes);
        self.stdin_remaining -= bytes.len() as u64;

        if self.stdin_remaining == 0 {
            put_record(&mut self.out, FCGI_STDIN, &[]);
            self.stdin_open = false;
        }

        Ok(())
    }
}

/// Backend pool of one filter.
#[derive(Debug)]
pub struct Gateway {
    address: String,
    idle: ArrayQueue<BackendConn>,
    permits: Arc<Semaphore>,
    limits: GatewayLimits,
}

impl Gateway {
    pub(crate) fn new(address: String, limits: GatewayLimits) -> Self {
        let size = limits.pool_size.max(1);

        Self {
            address,
            idle: ArrayQueue::new(size),
            permits: Arc::new(Semaphore::new(size)),
            limits,
        }
    }

    #[inline]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Idle connections kept for reuse.
    #[inline]
    pub fn idle(&self) -> usize {
        self.idle.len()
    }

    async fn open(&self) -> Result<TcpStream, GatewayError> {
        let stream = timeout(self.limits.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| GatewayError::Timeout)?
            .map_err(GatewayError::Connect)?;
        let _ = stream.set_nodelay(true);

        Ok(stream)
    }

    async fn connect(&self) -> Result<BackendConn, GatewayError> {
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| GatewayError::PoolExhausted)?;

        Ok(BackendConn::new(self.open().await?, permit))
    }

    /// Sends the buffered request again over a new socket, keeping the pool slot.
    async fn reconnect(&self, conn: &mut BackendConn) -> Result<(), GatewayError> {
        conn.replay = false;
        conn.stream = self.open().await?;
        conn.record.clear();
        self.flush(conn).await
    }

    async fn flush(&self, conn: &mut BackendConn) -> Result<(), GatewayError> {
        let BackendConn { stream, out, .. } = conn;

        timeout(self.limits.io_timeout, stream.write_all(out))
            .await
            .map_err(|_| GatewayError::Timeout)?
            .map_err(GatewayError::Write)?;

        Ok(())
    }

    async fn begin(
        &self,
        params: &Params<'_>,
        body: Option<&[u8]>,
    ) -> Result<BackendConn, GatewayError> {
        if let Some(mut conn) = self.idle.pop() {
            conn.prepare(params);
            if let Some(body) = body {
                conn.push_stdin(body)?;
            }

            match self.flush(&mut conn).await {
                Ok(()) => {
                    conn.replay = !conn.stdin_open;
                    return Ok(conn);
                }
                Err(err) => tracing::debug!(backend = %self.address, error = %err, "stale backend connection"),
            }
        }

        let mut conn = self.connect().await?;
        conn.prepare(params);
        if let Some(body) = body {
            conn.push_stdin(body)?;
        }

        self.flush(&mut conn).await?;
        Ok(conn)
    }

    /// Sends a bodiless request.
    pub(crate) async fn get(&self, params: &Params<'_>) -> Result<BackendConn, GatewayError> {
        self.begin(params, None).await
    }

    /// Sends a request with the part of its body received so far.
    pub(crate) async fn post(
        &self,
        params: &Params<'_>,
        body: Option<&[u8]>,
    ) -> Result<BackendConn, GatewayError> {
        self.begin(params, body).await
    }

    /// Forwards more body bytes, closing `STDIN` once the declared length is reached.
    pub(crate) async fn write_form_data(
        &self,
        conn: &mut BackendConn,
        bytes: &[u8],
    ) -> Result<(), GatewayError> {
        conn.replay = false;
        conn.out.clear();
        conn.push_stdin(bytes)?;
        self.flush(conn).await
    }

    /// Returns a connection for reuse when its exchange finished cleanly.
    pub(crate) fn put_conn(&self, conn: BackendConn) {
        if conn.completed && !conn.stdin_open {
            let _ = self.idle.push(conn);
        }
    }

    async fn read_exact(&self, conn: &mut BackendConn, len: usize) -> Result<(), GatewayError> {
        conn.record.resize(len, 0);

        timeout(self.limits.io_timeout, conn.stream.read_exact(&mut conn.record))
            .await
            .map_err(|_| GatewayError::Timeout)?
            .map_err(GatewayError::Read)?;

        Ok(())
    }

    async fn next_record(&self, conn: &mut BackendConn) -> Result<(u8, usize), GatewayError> {
        self.read_exact(conn, HEADER_LEN).await?;

        let header = &conn.record[..HEADER_LEN];
        if header[0] != FCGI_VERSION {
            return Err(GatewayError::Protocol);
        }

        let kind = header[1];
        let len = u16::from_be_bytes([header[4], header[5]]) as usize;
        let padding = header[6] as usize;

        self.read_exact(conn, len + padding).await?;
        Ok((kind, len))
    }

    /// Streams the response into `sink` until it stops or the backend ends it.
    pub(crate) async fn read<S: ChunkSink>(&self, conn: &mut BackendConn, sink: &mut S) -> Flow {
        loop {
            let (kind, len) = match self.next_record(conn).await {
                Ok(record) => record,
                Err(err) if conn.replay => {
                    tracing::debug!(backend = %self.address, error = %err, "reused backend connection failed");

                    match self.reconnect(conn).await {
                        Ok(()) => continue,
                        Err(err) => return sink.on_chunk(StreamEvent::Failed(&err)).await,
                    }
                }
                Err(err) => return sink.on_chunk(StreamEvent::Failed(&err)).await,
            };
            conn.replay = false;

            match kind {
                FCGI_STDOUT if len > 0 => {
                    match sink.on_chunk(StreamEvent::Data(&conn.record[..len])).await {
                        Flow::Continue => {}
                        flow => return flow,
                    }
                }
                FCGI_STDERR if len > 0 => {
                    let message = String::from_utf8_lossy(&conn.record[..len]);
                    tracing::warn!(backend = %self.address, stderr = %message.trim_end(), "backend stderr");
                }
                FCGI_END_REQUEST => {
                    conn.completed = true;
                    return sink.on_chunk(StreamEvent::End).await;
                }
                _ => {}
            }
        }
    }
}
