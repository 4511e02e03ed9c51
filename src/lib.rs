//! cosmos_web - Static file server and FastCGI gateway
//!
//! Serves files from per-host document roots and forwards dynamic requests
//! to FastCGI responders, streaming their output back as chunked HTTP/1.x
//! responses. Socket handling lives behind the [`Reactor`] trait, the request
//! core is the [`Service`] that reacts to its events.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1** and **HTTP/1.0**: `GET` and form `POST`
//!   (`application/x-www-form-urlencoded`, `multipart/form-data`)
//! - **FastCGI**: responder role, one request per backend connection at a
//!   time, connections kept alive and pooled per filter
//! - **TLS**: via [`rustls`] when a certificate and key are configured
//!
//! # Resource Model
//!
//! - **Pooled buffers** - response buffers come from a fixed pool sized
//!   `threads * pool_multiple`, an exhausted pool answers `500`
//! - **Parked uploads** - a request body split across reads holds one upload
//!   slot, reclaimed by a sweeper when the client stalls
//! - **Bounded backends** - each filter keeps at most `fastcgi_pool_size`
//!   backend connections
//! - **Metadata cache** - resolved file paths are cached per location and
//!   re-validated on every hit
//!
//! # Examples
//!
//! One server from an inline configuration:
//! ```no_run
//! use cosmos_web::{Config, Service, TcpReactor};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cosmos_web::StartupError> {
//!     let config: Config = r#"{
//!         "listen": 8080,
//!         "locations": [{
//!             "server_name": "localhost:8080",
//!             "root": "/var/www/html",
//!             "indexes": ["index.php", "index.html"],
//!             "filters": [{ "filter": "\\.php$", "fastcgi_pass": "127.0.0.1:9000" }]
//!         }]
//!     }"#
//!     .parse()?;
//!
//!     let reactor = Arc::new(TcpReactor::new(&config.service_limits()));
//!     let service = Arc::new(Service::new(&config, reactor)?);
//!
//!     service.launch().await
//! }
//! ```
//! Every server of a configuration directory:
//! ```no_run
//! use cosmos_web::{Config, Service, TcpReactor};
//! use std::{path::Path, sync::Arc};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cosmos_web::StartupError> {
//!     let mut servers = tokio::task::JoinSet::new();
//!
//!     for config in Config::load_dir(Path::new("conf/"))? {
//!         let reactor = Arc::new(TcpReactor::new(&config.service_limits()));
//!         servers.spawn(Arc::new(Service::new(&config, reactor)?).launch());
//!     }
//!
//!     while let Some(result) = servers.join_next().await {
//!         if let Ok(Err(err)) = result {
//!             return Err(err);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Use Cases
//!
//! - **PHP hosting** - static assets and `php-fpm` behind one listener
//! - **Virtual hosts** - several sites selected by the `Host` header
//! - **Custom reactors** - embed the core behind your own socket layer

pub(crate) mod http {
    pub(crate) mod content_type;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod content_cache;
    pub(crate) mod fastcgi;
    pub(crate) mod file_cache;
    pub(crate) mod pool;
    pub(crate) mod reactor;
    pub(crate) mod service;
    pub(crate) mod tcp;
    pub(crate) mod writer;
}
pub mod config;
pub(crate) mod errors;
pub mod limits;
pub mod logging;

pub use crate::{
    config::{Config, ConfigError},
    errors::StartupError,
    http::{
        request::ParsedRequest,
        types::{MethodKind, StatusCode, Version},
    },
    server::{
        content_cache::{CacheError, ContentCache},
        fastcgi::GatewayError,
        pool::{BufferPool, IdPool, Lease, PoolError, PooledBuffer, Recycle},
        reactor::{DescriptorState, EventHandler, Fd, Reactor, TlsStatus},
        service::{PendingUpload, Service},
        tcp::TcpReactor,
        writer::WriteError,
    },
};
