//! Request orchestration
//!
//! [`Service`] receives reactor events and drives each descriptor through its
//! states:
//!
//! ```text
//!                 [ receive ]
//!                      |
//!          parked upload on descriptor?
//!            | no                  | yes
//!            v                     v
//!      [ parse + route ]     [ forward body ] --complete--> [ stream response ]
//!            |
//!     static | dynamic
//!        |       |
//!        v       v
//!   [ file ]  [ FastCGI ] --partial body--> park upload, wait for next receive
//!                 |
//!                 v
//!        [ stream response ]
//! ```
//!
//! Every exit path hands back the buffers, uploads, and backend connections
//! it acquired.

use crate::{
    config::{Config, LocationConfig},
    errors::StartupError,
    http::{
        content_type::ContentTypes,
        request::ParsedRequest,
        response,
        types::{MethodKind, StatusCode, Version},
    },
    limits::{ServiceLimits, UploadLimits},
    logging::ACCESS_TARGET,
    server::{
        content_cache::ContentCache,
        fastcgi::{BackendConn, ChunkSink, Flow, Gateway, Params, StreamEvent},
        file_cache::{FileCache, FileEntry},
        pool::{BufferPool, IdPool, Lease, PooledBuffer, Recycle},
        reactor::{DescriptorState, EventHandler, Fd, Reactor},
        writer::{WriteError, Writer},
    },
};
use memchr::{memchr, memmem};
use regex::Regex;
use std::{
    collections::HashMap,
    fmt, io,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{io::AsyncReadExt, task::JoinHandle};

const CRLF2: &[u8] = b"\r\n\r\n";

/// A request body still arriving across receive events.
#[derive(Debug)]
pub struct PendingUpload {
    fd: Fd,
    conn: Option<BackendConn>,
    gateway: Option<Arc<Gateway>>,
    location: usize,
    version: Version,
    url: String,
    received: u64,
    expected: u64,
    method: MethodKind,
}

impl Recycle for PendingUpload {
    fn new() -> Self {
        Self {
            fd: 0,
            conn: None,
            gateway: None,
            location: 0,
            version: Version::default(),
            url: String::new(),
            received: 0,
            expected: 0,
            method: MethodKind::Unknown,
        }
    }

    fn recycle(&mut self) {
        self.fd = 0;
        self.conn = None;
        self.gateway = None;
        self.location = 0;
        self.version = Version::default();
        self.url.clear();
        self.received = 0;
        self.expected = 0;
        self.method = MethodKind::Unknown;
    }
}

#[derive(Debug)]
struct Filter {
    pattern: Regex,
    gateway: Arc<Gateway>,
}

#[derive(Debug)]
struct Location {
    server_name: String,
    files: FileCache,
    filters: Vec<Filter>,
    error_pages: HashMap<u16, Box<[u8]>>,
}

impl Location {
    fn from_config(config: &Config, location: &LocationConfig) -> Result<Self, StartupError> {
        let mut filters = Vec::with_capacity(location.filters.len());
        for filter in &location.filters {
            let pattern = filter.pattern()?;

            match filter.fastcgi_address() {
                Some(address) => filters.push(Filter {
                    pattern,
                    gateway: Arc::new(Gateway::new(address, config.gateway_limits(filter))),
                }),
                None => tracing::debug!(filter = %filter.filter, "filter without a FastCGI backend"),
            }
        }

        let mut error_pages = HashMap::new();
        for page in &location.error_pages {
            let path = Path::new(&location.root).join(page.page.trim_start_matches('/'));

            match std::fs::read(&path) {
                Ok(body) => {
                    error_pages.insert(page.code, body.into_boxed_slice());
                }
                Err(err) => tracing::warn!(
                    code = page.code,
                    path = %path.display(),
                    error = %err,
                    "error page unavailable, using the built-in one"
                ),
            }
        }

        Ok(Self {
            server_name: location.server_name.clone(),
            files: FileCache::new(&location.root, &location.indexes),
            filters,
            error_pages,
        })
    }

    /// Backend of the first filter matching the resolved file path.
    fn gateway_for(&self, path: &Path) -> Option<&Arc<Gateway>> {
        let path = path.to_string_lossy();

        self.filters
            .iter()
            .find(|filter| filter.pattern.is_match(&path))
            .map(|filter| &filter.gateway)
    }
}

/// Peer address as logged, `-` when unknown.
struct Remote(Option<IpAddr>);

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(ip) => ip.fmt(f),
            None => f.write_str("-"),
        }
    }
}

/// One listening server: routes requests of its virtual hosts to files or
/// FastCGI backends.
///
/// # Examples
///
/// ```no_run
/// use cosmos_web::{Config, Service, TcpReactor};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), cosmos_web::StartupError> {
///     let config: Config = r#"{
///         "listen": 8080,
///         "locations": [{ "server_name": "localhost:8080", "root": "/var/www", "indexes": ["index.html"] }]
///     }"#
///     .parse()?;
///
///     let reactor = Arc::new(TcpReactor::new(&config.service_limits()));
///     let service = Arc::new(Service::new(&config, reactor)?);
///
///     service.launch().await
/// }
/// ```
#[derive(Debug)]
pub struct Service<R: Reactor> {
    reactor: Arc<R>,
    writer: Writer<R>,

    locations: Vec<Location>,
    content_types: ContentTypes,

    buffers: BufferPool,
    uploads: Arc<IdPool<PendingUpload>>,
    upload_sweeper: JoinHandle<()>,
    content_cache: ContentCache,

    limits: ServiceLimits,
    bind: String,
    port: u16,
    tls: Option<(PathBuf, PathBuf)>,
}

impl<R: Reactor> Service<R> {
    /// Builds the service of one configuration.
    ///
    /// Must be called inside a tokio runtime: the upload sweeper and the
    /// content cache tasks are spawned here.
    pub fn new(config: &Config, reactor: Arc<R>) -> Result<Self, StartupError> {
        let limits = config.service_limits();

        let locations = config
            .locations
            .iter()
            .map(|location| Location::from_config(config, location))
            .collect::<Result<Vec<_>, _>>()?;

        let uploads = Arc::new(IdPool::new(limits.pool_capacity(), UploadLimits::default()));
        let upload_sweeper = uploads.spawn_sweeper();

        Ok(Self {
            writer: Writer::new(reactor.clone(), config.is_tls(), &limits),
            reactor,

            locations,
            content_types: ContentTypes::new(&config.charset, &config.default_type),

            buffers: BufferPool::new(limits.pool_capacity(), limits.buffer_len),
            uploads,
            upload_sweeper,
            content_cache: ContentCache::new(config.cache_limits()),

            bind: config.bind_addr().to_owned(),
            port: config.listen,
            tls: config
                .tls_files()
                .map(|(cert, key)| (cert.to_owned(), key.to_owned())),
            limits,
        })
    }

    /// Starts the reactor with this service as its handler and runs until
    /// the reactor stops.
    pub async fn launch(self: Arc<Self>) -> Result<(), StartupError> {
        let reactor = self.reactor.clone();
        let handler = self.clone();

        match &self.tls {
            Some((cert, key)) => {
                reactor
                    .start_tls(&self.bind, self.port, cert, key, handler)
                    .await
            }
            None => reactor.start(&self.bind, self.port, handler).await,
        }
    }

    #[inline]
    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    #[inline]
    pub fn uploads(&self) -> &IdPool<PendingUpload> {
        &self.uploads
    }

    /// Generic TTL cache, not consulted when serving files.
    #[inline]
    pub fn content_cache(&self) -> &ContentCache {
        &self.content_cache
    }

    #[inline]
    pub fn limits(&self) -> &ServiceLimits {
        &self.limits
    }

    #[inline]
    fn remote(&self, fd: Fd) -> Remote {
        Remote(self.reactor.peer_addr(fd).map(|addr| addr.ip()))
    }
}

impl<R: Reactor> Drop for Service<R> {
    fn drop(&mut self) {
        self.upload_sweeper.abort();
    }
}

// RESPONSES

impl<R: Reactor> Service<R> {
    fn write_failed(&self, fd: Fd, url: &str, err: &WriteError) {
        if err.is_peer_closed() {
            tracing::debug!(ip = %self.remote(fd), url, error = %err, "client went away");
        } else {
            tracing::error!(ip = %self.remote(fd), url, error = %err, "write failed");
        }

        self.reactor.destroy_connection(fd);
    }

    /// Sends an error status, with the location's page when it has one.
    async fn respond(&self, fd: Fd, version: Version, status: StatusCode, location: Option<&Location>) {
        let page = location.and_then(|location| location.error_pages.get(&status.as_u16()));

        let result = match page {
            Some(page) => self.write_page(fd, version, status, page).await,
            None => self.writer.write(fd, status.page_response(version)).await,
        };

        if let Err(err) = result {
            self.write_failed(fd, "", &err);
        }
    }

    async fn write_page(
        &self,
        fd: Fd,
        version: Version,
        status: StatusCode,
        page: &[u8],
    ) -> Result<(), WriteError> {
        let Ok(mut buf) = self.buffers.acquire() else {
            return self.writer.write(fd, status.page_response(version)).await;
        };

        let Ok(n) = response::page_header(&mut buf, version, status, page.len()) else {
            return self.writer.write(fd, status.page_response(version)).await;
        };

        self.writer.write(fd, &buf[..n]).await?;
        self.writer.write(fd, page).await
    }

    fn discard(&self, fd: Fd, state: DescriptorState) {
        if let DescriptorState::AwaitingUpload(upload) = state {
            tracing::debug!(
                ip = %self.remote(fd),
                url = %upload.url,
                received = upload.received,
                expected = upload.expected,
                "upload abandoned"
            );
            self.uploads.release(upload);
        }
    }
}

// ROUTING

impl<R: Reactor> Service<R> {
    async fn request(&self, fd: Fd, bytes: &[u8]) {
        let request = match ParsedRequest::parse(bytes, self.limits.header_length) {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!(ip = %self.remote(fd), error = %err, "malformed request");
                return self.respond(fd, Version::Http11, err.status(), None).await;
            }
        };

        let version = request.version();

        let Some((index, location)) = self
            .locations
            .iter()
            .enumerate()
            .find(|(_, location)| location.server_name == request.server())
        else {
            tracing::debug!(
                ip = %self.remote(fd),
                host = request.server(),
                url = request.url(),
                "unknown virtual host"
            );
            return self.respond(fd, version, StatusCode::NotAcceptable, None).await;
        };

        let Some(file) = location.files.lookup(request.url()).await else {
            tracing::debug!(ip = %self.remote(fd), url = request.url(), "not found");
            return self
                .respond(fd, version, StatusCode::NotFound, Some(location))
                .await;
        };

        match location.gateway_for(file.path()) {
            Some(gateway) => {
                self.serve_dynamic(fd, &request, &file, gateway, index)
                    .await
            }
            None => self.serve_static(fd, &request, &file, location).await,
        }
    }

    async fn serve_static(
        &self,
        fd: Fd,
        request: &ParsedRequest<'_>,
        file: &FileEntry,
        location: &Location,
    ) {
        let version = request.version();
        let url = request.url();

        let Some(content_type) = self.content_types.get(file.suffix()) else {
            tracing::debug!(ip = %self.remote(fd), url, suffix = file.suffix(), "unsupported media type");
            return self
                .respond(fd, version, StatusCode::UnsupportedMediaType, Some(location))
                .await;
        };

        let mut handle = match tokio::fs::File::open(file.path()).await {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!(ip = %self.remote(fd), url, error = %err, "failed to open file");
                return self
                    .respond(fd, version, StatusCode::NotAcceptable, Some(location))
                    .await;
            }
        };

        let mut buf = match self.buffers.acquire() {
            Ok(buf) => buf,
            Err(err) => {
                tracing::error!(ip = %self.remote(fd), url, error = %err, "no buffer for response");
                return self
                    .respond(fd, version, StatusCode::InternalServerError, None)
                    .await;
            }
        };

        let Ok(head) = response::static_header(&mut buf, version, content_type, file.len()) else {
            drop(buf);
            tracing::error!(ip = %self.remote(fd), url, "response head exceeds the buffer");
            return self
                .respond(fd, version, StatusCode::InternalServerError, None)
                .await;
        };

        tracing::info!(target: ACCESS_TARGET, ip = %self.remote(fd), url, "GET");

        let mut filled = head;
        let mut remaining = file.len();

        loop {
            let room = buf.len() - filled;
            let want = usize::try_from(remaining).map_or(room, |left| left.min(room));

            if want > 0 {
                let n = match handle.read(&mut buf[filled..filled + want]).await {
                    Ok(0) => {
                        tracing::warn!(ip = %self.remote(fd), url, "file shrank while sending");
                        return self.reactor.destroy_connection(fd);
                    }
                    Ok(n) => n,
                    Err(err) => {
                        tracing::error!(ip = %self.remote(fd), url, error = %err, "failed to read file");
                        return self.reactor.destroy_connection(fd);
                    }
                };

                filled += n;
                remaining -= n as u64;
            }

            if let Err(err) = self.writer.write(fd, &buf[..filled]).await {
                return self.write_failed(fd, url, &err);
            }

            if remaining == 0 {
                return;
            }

            filled = 0;
        }
    }

    async fn serve_dynamic(
        &self,
        fd: Fd,
        request: &ParsedRequest<'_>,
        file: &FileEntry,
        gateway: &Arc<Gateway>,
        index: usize,
    ) {
        let version = request.version();
        let url = request.url();
        let remote = self.remote(fd);
        let params = Params::new(request, file.path(), remote.0);

        if request.method() == MethodKind::Get {
            let conn = match gateway.get(&params).await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::error!(ip = %remote, url, backend = gateway.address(), error = %err, "GET");
                    return self
                        .respond(fd, version, StatusCode::InternalServerError, None)
                        .await;
                }
            };

            tracing::info!(target: ACCESS_TARGET, ip = %remote, url, "GET");
            return self.stream_response(fd, version, url, gateway, conn, index).await;
        }

        let received = request.body().len() as u64;
        let expected = request.content_length();

        if received == expected {
            let conn = match gateway.post(&params, Some(request.body())).await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::error!(ip = %remote, url, backend = gateway.address(), error = %err, "POST");
                    return self
                        .respond(fd, version, StatusCode::InternalServerError, None)
                        .await;
                }
            };

            tracing::info!(target: ACCESS_TARGET, ip = %remote, url, "POST");
            self.stream_response(fd, version, url, gateway, conn, index).await
        } else if received > 0 && received < expected {
            let mut upload = match self.uploads.acquire() {
                Ok(upload) => upload,
                Err(err) => {
                    tracing::error!(ip = %remote, url, error = %err, "no upload slot");
                    return self
                        .respond(fd, version, StatusCode::InternalServerError, None)
                        .await;
                }
            };

            let conn = match gateway.post(&params, Some(request.body())).await {
                Ok(conn) => conn,
                Err(err) => {
                    self.uploads.release(upload);
                    tracing::error!(ip = %remote, url, backend = gateway.address(), error = %err, "POST");
                    return self
                        .respond(fd, version, StatusCode::InternalServerError, None)
                        .await;
                }
            };

            upload.fd = fd;
            upload.conn = Some(conn);
            upload.gateway = Some(gateway.clone());
            upload.location = index;
            upload.version = version;
            upload.url.push_str(url);
            upload.received = received;
            upload.expected = expected;
            upload.method = request.method();

            if let Err(state) = self
                .reactor
                .set_connection_data(fd, DescriptorState::AwaitingUpload(upload))
            {
                self.discard(fd, state);
                tracing::error!(ip = %remote, url, "failed to park upload on descriptor");
                return self
                    .respond(fd, version, StatusCode::InternalServerError, None)
                    .await;
            }

            tracing::info!(target: ACCESS_TARGET, ip = %remote, url, "POST");
        } else {
            tracing::debug!(ip = %remote, url, received, expected, "content length mismatch");
            self.respond(fd, version, StatusCode::NotAcceptable, None)
                .await
        }
    }

    async fn continue_upload(&self, fd: Fd, mut upload: Lease<PendingUpload>, bytes: &[u8]) {
        let version = upload.version;

        let (Some(gateway), Some(mut conn)) = (upload.gateway.clone(), upload.conn.take())
        else {
            return self.abort_upload(fd, upload, "upload without a backend").await;
        };

        if upload.fd != fd {
            drop(conn);
            return self.abort_upload(fd, upload, "upload bound to another descriptor").await;
        }

        let remaining = upload.expected - upload.received;
        let take = usize::try_from(remaining).map_or(bytes.len(), |left| left.min(bytes.len()));

        if let Err(err) = gateway.write_form_data(&mut conn, &bytes[..take]).await {
            tracing::error!(
                ip = %self.remote(fd),
                url = %upload.url,
                backend = gateway.address(),
                remaining = conn.stdin_remaining(),
                error = %err,
                "failed to forward request body"
            );
            drop(conn);
            return self.abort_upload(fd, upload, "backend write failed").await;
        }

        upload.received += take as u64;

        if upload.received == upload.expected {
            let url = std::mem::take(&mut upload.url);
            let index = upload.location;
            self.uploads.release(upload);

            return self
                .stream_response(fd, version, &url, &gateway, conn, index)
                .await;
        }

        upload.conn = Some(conn);

        if let Err(err) = self.uploads.touch(&upload) {
            tracing::error!(ip = %self.remote(fd), url = %upload.url, error = %err, "upload reclaimed");
            return self.abort_upload(fd, upload, "upload expired").await;
        }

        if let Err(state) = self
            .reactor
            .set_connection_data(fd, DescriptorState::AwaitingUpload(upload))
        {
            self.discard(fd, state);
            self.respond(fd, version, StatusCode::InternalServerError, None)
                .await;
            self.reactor.destroy_connection(fd);
        }
    }

    /// Releases the upload, answers `500`, and closes the descriptor.
    async fn abort_upload(&self, fd: Fd, upload: Lease<PendingUpload>, reason: &'static str) {
        let version = upload.version;
        tracing::error!(
            ip = %self.remote(fd),
            url = %upload.url,
            method = upload.method.as_str(),
            reason,
            "upload aborted"
        );

        self.uploads.release(upload);
        self.respond(fd, version, StatusCode::InternalServerError, None)
            .await;
        self.reactor.destroy_connection(fd);
    }

    async fn stream_response(
        &self,
        fd: Fd,
        version: Version,
        url: &str,
        gateway: &Gateway,
        mut conn: BackendConn,
        index: usize,
    ) {
        let buf = match self.buffers.acquire() {
            Ok(buf) => buf,
            Err(err) => {
                drop(conn);
                tracing::error!(ip = %self.remote(fd), url, error = %err, "no buffer for response");
                return self
                    .respond(fd, version, StatusCode::InternalServerError, None)
                    .await;
            }
        };

        let mut sink = ResponseStream {
            service: self,
            location: self.locations.get(index),
            fd,
            version,
            url,
            buf,
            max_chunk: self.limits.max_chunk_len(),
            pending: Vec::new(),
            streaming: false,
        };

        gateway.read(&mut conn, &mut sink).await;
        drop(sink);

        gateway.put_conn(conn);
        tracing::trace!(backend = gateway.address(), idle = gateway.idle(), "backend released");
    }
}

// STREAMING

/// Why the CGI head of a backend response was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeadError {
    MissingContentType,
    EmptyContentType,
}

#[inline]
fn trim(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if !first.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    while let [rest @ .., last] = bytes {
        if !last.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    bytes
}

/// Finds the `Content-Type` value in a CGI head (without the blank line).
fn cgi_content_type(head: &[u8]) -> Result<&[u8], HeadError> {
    for line in head.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        let Some(colon) = memchr(b':', line) else {
            continue;
        };

        if trim(&line[..colon]).eq_ignore_ascii_case(b"content-type") {
            let value = trim(&line[colon + 1..]);
            return if value.is_empty() {
                Err(HeadError::EmptyContentType)
            } else {
                Ok(value)
            };
        }
    }

    Err(HeadError::MissingContentType)
}

/// Re-encodes a backend response as a chunked HTTP response.
struct ResponseStream<'s, R: Reactor> {
    service: &'s Service<R>,
    location: Option<&'s Location>,
    fd: Fd,
    version: Version,
    url: &'s str,

    buf: PooledBuffer<'s>,
    max_chunk: usize,

    /// CGI head bytes received so far, used only when the head spans records.
    pending: Vec<u8>,
    streaming: bool,
}

impl<R: Reactor> ResponseStream<'_, R> {
    async fn fail(&mut self, status: StatusCode, reason: &str) -> Flow {
        tracing::error!(
            ip = %self.service.remote(self.fd),
            url = self.url,
            reason,
            "invalid backend response"
        );

        self.service
            .respond(self.fd, self.version, status, self.location)
            .await;
        Flow::Break
    }

    async fn head_data(&mut self, bytes: &[u8]) -> Flow {
        if self.pending.is_empty() && memmem::find(bytes, CRLF2).is_some() {
            return self.start(bytes).await;
        }

        // The blank line may straddle the previous record
        let from = self.pending.len().saturating_sub(CRLF2.len() - 1);
        self.pending.extend_from_slice(bytes);

        let head_len = match memmem::find(&self.pending[from..], CRLF2) {
            Some(i) => from + i,
            None => self.pending.len(),
        };
        if head_len > self.buf.len() {
            return self
                .fail(StatusCode::InternalServerError, "header exceeds the buffer")
                .await;
        }
        if head_len == self.pending.len() {
            return Flow::Continue;
        }

        let pending = std::mem::take(&mut self.pending);
        self.start(&pending).await
    }

    async fn start(&mut self, data: &[u8]) -> Flow {
        let boundary = match memmem::find(data, CRLF2) {
            Some(0) | None => return self.fail(StatusCode::BadRequest, "malformed header").await,
            Some(boundary) => boundary,
        };

        let content_type = match cgi_content_type(&data[..boundary]) {
            Ok(content_type) => content_type,
            Err(HeadError::MissingContentType) => {
                return self.fail(StatusCode::BadRequest, "missing content type").await
            }
            Err(HeadError::EmptyContentType) => {
                return self
                    .fail(StatusCode::InternalServerError, "empty content type")
                    .await
            }
        };

        let Ok(n) = response::chunked_header(&mut self.buf, self.version, content_type) else {
            return self
                .fail(StatusCode::InternalServerError, "content type exceeds the buffer")
                .await;
        };

        if let Err(err) = self.service.writer.write(self.fd, &self.buf[..n]).await {
            self.service.write_failed(self.fd, self.url, &err);
            return Flow::Break;
        }

        self.streaming = true;
        self.send_chunks(&data[boundary + CRLF2.len()..]).await
    }

    async fn send_chunks(&mut self, data: &[u8]) -> Flow {
        for piece in data.chunks(self.max_chunk) {
            let Ok(n) = response::frame_chunk(piece, &mut self.buf) else {
                tracing::error!(url = self.url, "chunk exceeds the buffer");
                self.service.reactor.destroy_connection(self.fd);
                return Flow::Break;
            };

            if let Err(err) = self.service.writer.write(self.fd, &self.buf[..n]).await {
                self.service.write_failed(self.fd, self.url, &err);
                return Flow::Break;
            }
        }

        Flow::Continue
    }
}

impl<R: Reactor> ChunkSink for ResponseStream<'_, R> {
    async fn on_chunk(&mut self, event: StreamEvent<'_>) -> Flow {
        match event {
            StreamEvent::Data(bytes) if self.streaming => self.send_chunks(bytes).await,
            StreamEvent::Data(bytes) => self.head_data(bytes).await,
            StreamEvent::End if self.streaming => {
                match self.service.writer.write(self.fd, response::CHUNKED_END).await {
                    Ok(()) => Flow::Done,
                    Err(err) => {
                        self.service.write_failed(self.fd, self.url, &err);
                        Flow::Break
                    }
                }
            }
            StreamEvent::End => {
                self.fail(StatusCode::InternalServerError, "response ended before its header")
                    .await
            }
            StreamEvent::Failed(err) if self.streaming => {
                tracing::error!(
                    ip = %self.service.remote(self.fd),
                    url = self.url,
                    error = %err,
                    "backend failed mid-response"
                );
                self.service.reactor.destroy_connection(self.fd);
                Flow::Break
            }
            StreamEvent::Failed(err) => {
                tracing::error!(
                    ip = %self.service.remote(self.fd),
                    url = self.url,
                    error = %err,
                    "backend failed"
                );
                self.service
                    .respond(self.fd, self.version, StatusCode::InternalServerError, self.location)
                    .await;
                Flow::Break
            }
        }
    }
}

// REACTOR EVENTS

impl<R: Reactor> EventHandler for Service<R> {
    fn on_accept(&self, fd: Fd) {
        tracing::trace!(fd, ip = %self.remote(fd), "accepted");
    }

    async fn on_receive(&self, fd: Fd, bytes: &[u8]) {
        match self.reactor.take_connection_data(fd) {
            DescriptorState::Empty => self.request(fd, bytes).await,
            DescriptorState::AwaitingUpload(upload) => {
                self.continue_upload(fd, upload, bytes).await
            }
        }
    }

    fn on_close(&self, fd: Fd) {
        self.discard(fd, self.reactor.take_connection_data(fd));
    }

    fn on_error(&self, fd: Fd, err: &io::Error) {
        tracing::debug!(fd, ip = %self.remote(fd), error = %err, "socket error");
    }
}
