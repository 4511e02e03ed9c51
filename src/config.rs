//! Server configuration documents
//!
//! Every file in the configuration directory holds one JSON document
//! describing one listening server:
//!
//! ```json
//! {
//!     "bind": "0.0.0.0",
//!     "listen": 8080,
//!     "threads": 4,
//!     "timeout": 6,
//!     "locations": [{
//!         "server_name": "localhost:8080",
//!         "root": "/var/www",
//!         "indexes": ["index.html", "index.php"],
//!         "filters": [{ "filter": "\\.php$", "fastcgi_pass": "127.0.0.1:9000" }],
//!         "error_pages": [{ "code": 404, "page": "404.html" }]
//!     }]
//! }
//! ```

use crate::limits::{self, CacheLimits, GatewayLimits, ServiceLimits, MIN_BUFFER_LEN};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::{
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Directory searched when none is given on the command line.
pub const DEFAULT_CONF_DIR: &str = "conf/";

/// Port used when `fastcgi_pass` names a non-numeric one.
pub const DEFAULT_FASTCGI_PORT: u16 = 9000;

const DEFAULT_GATEWAY_POOL: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no config files found in {}", .0.display())]
    Empty(PathBuf),

    #[error("invalid filter {filter:?}: {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: regex::Error,
    },
}

/// One listening server.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: String,
    pub listen: u16,
    pub locations: Vec<LocationConfig>,
    pub default_type: String,
    pub ssl_certificate: String,
    pub ssl_certificate_key: String,
    pub header_length: usize,
    pub read_buffer: usize,
    pub threads: usize,
    /// Write timeout in seconds.
    pub timeout: u64,
    pub cache_file_size: usize,
    pub cache_file_count: usize,
    pub cache_file_types: Vec<String>,
    pub charset: String,
    /// Accepted for compatibility, responses are never compressed.
    #[serde(deserialize_with = "lenient_bool")]
    pub gzip: bool,
    pub access_log: String,
    pub error_log: String,
}

/// A virtual host matched by exact `Host` header value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    pub server_name: String,
    pub root: String,
    pub indexes: Vec<String>,
    pub filters: Vec<FilterConfig>,
    /// Accepted, not used.
    pub proxy_pass: String,
    /// Accepted, not used.
    pub deny: String,
    pub error_pages: Vec<ErrorPageConfig>,
}

/// Routes resolved paths matching `filter` to a FastCGI backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub filter: String,
    pub fastcgi_pass: String,
    pub fastcgi_index: String,
    pub fastcgi_pool_size: usize,
}

/// Custom body for an error status, relative to the location root.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ErrorPageConfig {
    pub code: u16,
    pub page: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BoolOrString {
    Bool(bool),
    String(String),
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match BoolOrString::deserialize(deserializer)? {
        BoolOrString::Bool(value) => Ok(value),
        BoolOrString::String(value) => value.parse().map_err(serde::de::Error::custom),
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(src: &str) -> Result<Self, Self::Err> {
        Ok(serde_json::from_str(src)?)
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let src = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;

        serde_json::from_str(&src).map_err(|source| ConfigError::Json {
            path: path.to_owned(),
            source,
        })
    }

    /// Loads every regular file of `dir` in file name order.
    pub fn load_dir(dir: &Path) -> Result<Vec<Self>, ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: dir.to_owned(),
            source,
        };

        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if entry.file_type().map_err(io_err)?.is_file() {
                paths.push(entry.path());
            }
        }

        if paths.is_empty() {
            return Err(ConfigError::Empty(dir.to_owned()));
        }

        paths.sort();
        paths.iter().map(|path| Self::from_file(path)).collect()
    }

    #[inline]
    pub fn is_tls(&self) -> bool {
        !self.ssl_certificate.is_empty() && !self.ssl_certificate_key.is_empty()
    }

    /// Certificate chain and private key paths when TLS is configured.
    pub fn tls_files(&self) -> Option<(&Path, &Path)> {
        self.is_tls().then(|| {
            (
                Path::new(&self.ssl_certificate),
                Path::new(&self.ssl_certificate_key),
            )
        })
    }

    /// Address the listener binds to, all interfaces when `bind` is empty.
    pub fn bind_addr(&self) -> &str {
        if self.bind.is_empty() {
            "0.0.0.0"
        } else {
            &self.bind
        }
    }

    pub fn write_timeout(&self) -> Duration {
        if self.timeout > 0 {
            Duration::from_secs(self.timeout)
        } else {
            ServiceLimits::default().write_timeout
        }
    }

    pub fn service_limits(&self) -> ServiceLimits {
        ServiceLimits {
            buffer_len: self.read_buffer.max(MIN_BUFFER_LEN),
            threads: self.threads(),
            write_timeout: self.write_timeout(),
            header_length: self.header_length,
            ..ServiceLimits::default()
        }
    }

    pub fn cache_limits(&self) -> CacheLimits {
        CacheLimits {
            max_entry_size: self.cache_file_size,
            max_entries: self.cache_file_count,
            types: self.cache_file_types.clone(),
            ..CacheLimits::default()
        }
    }

    pub fn gateway_limits(&self, filter: &FilterConfig) -> GatewayLimits {
        let timeout = self.write_timeout();

        GatewayLimits {
            connect_timeout: timeout,
            io_timeout: timeout,
            pool_size: match filter.fastcgi_pool_size {
                0 => DEFAULT_GATEWAY_POOL,
                size => size,
            },
            ..GatewayLimits::default()
        }
    }

    /// Worker threads, available parallelism when unset.
    pub fn threads(&self) -> usize {
        match self.threads {
            0 => limits::default_threads(),
            threads => threads,
        }
    }
}

impl FilterConfig {
    pub fn pattern(&self) -> Result<Regex, ConfigError> {
        Regex::new(&self.filter).map_err(|source| ConfigError::InvalidFilter {
            filter: self.filter.clone(),
            source,
        })
    }

    /// Backend `host:port`, `None` when the filter is not a FastCGI one.
    pub fn fastcgi_address(&self) -> Option<String> {
        let (host, port) = self.fastcgi_pass.split_once(':')?;
        if port.contains(':') {
            return None;
        }

        let port = port.parse::<u16>().unwrap_or(DEFAULT_FASTCGI_PORT);
        Some(format!("{host}:{port}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "bind": "127.0.0.1",
        "listen": 8080,
        "default_type": "",
        "read_buffer": 16384,
        "threads": 2,
        "timeout": 3,
        "cache_file_size": 1024,
        "cache_file_count": 10,
        "cache_file_types": [".html"],
        "charset": "utf-8",
        "gzip": "true",
        "access_log": "",
        "error_log": "",
        "locations": [{
            "server_name": "localhost:8080",
            "root": "/var/www",
            "indexes": ["index.html", "index.php"],
            "filters": [
                { "filter": "\\.php$", "fastcgi_pass": "127.0.0.1:9000", "fastcgi_pool_size": 4 },
                { "filter": "\\.cgi$" }
            ],
            "proxy_pass": "",
            "deny": "",
            "error_pages": [{ "code": 404, "page": "404.html" }]
        }]
    }"#;

    #[test]
    fn parse_sample() {
        let conf: Config = SAMPLE.parse().unwrap();

        assert_eq!(conf.bind_addr(), "127.0.0.1");
        assert_eq!(conf.listen, 8080);
        assert!(conf.gzip);
        assert!(!conf.is_tls());
        assert!(conf.tls_files().is_none());

        let location = &conf.locations[0];
        assert_eq!(location.server_name, "localhost:8080");
        assert_eq!(location.indexes, ["index.html", "index.php"]);
        assert_eq!(location.error_pages[0].code, 404);

        let limits = conf.service_limits();
        assert_eq!(limits.buffer_len, 16384);
        assert_eq!(limits.threads, 2);
        assert_eq!(limits.write_timeout, Duration::from_secs(3));
        assert_eq!(limits.max_write_retry(), 300);

        let cache = conf.cache_limits();
        assert_eq!(cache.max_entry_size, 1024);
        assert_eq!(cache.max_entries, 10);
        assert_eq!(cache.types, [".html"]);

        assert_eq!(conf.gateway_limits(&location.filters[0]).pool_size, 4);
        assert_eq!(conf.gateway_limits(&location.filters[1]).pool_size, 8);
        assert!(location.filters[0].pattern().unwrap().is_match("/var/www/a.php"));
    }

    #[test]
    fn defaults() {
        let conf: Config = "{}".parse().unwrap();
        let limits = conf.service_limits();

        assert_eq!(conf.bind_addr(), "0.0.0.0");
        assert_eq!(limits.buffer_len, MIN_BUFFER_LEN);
        assert_eq!(limits.write_timeout, Duration::from_secs(6));
        assert!(limits.threads >= 1);
        assert!(!conf.gzip);

        let conf: Config = r#"{ "gzip": false, "read_buffer": 10 }"#.parse().unwrap();
        assert!(!conf.gzip);
        assert_eq!(conf.service_limits().buffer_len, MIN_BUFFER_LEN);

        assert!(r#"{ "gzip": "yes" }"#.parse::<Config>().is_err());
        assert!(r#"{ "listen": "http" }"#.parse::<Config>().is_err());
    }

    #[test]
    fn tls_requires_both_files() {
        #[rustfmt::skip]
        let cases = [
            (r#"{ "ssl_certificate": "a.pem", "ssl_certificate_key": "a.key" }"#, true),
            (r#"{ "ssl_certificate": "a.pem" }"#,                                 false),
            (r#"{ "ssl_certificate_key": "a.key" }"#,                             false),
        ];

        for (src, expected) in cases {
            let conf: Config = src.parse().unwrap();
            assert_eq!(conf.is_tls(), expected, "{src}");
        }
    }

    #[test]
    fn fastcgi_address() {
        #[rustfmt::skip]
        let cases = [
            ("127.0.0.1:9000",  Some("127.0.0.1:9000")),
            ("localhost:9001",  Some("localhost:9001")),
            ("127.0.0.1:php",   Some("127.0.0.1:9000")),
            ("127.0.0.1:",      Some("127.0.0.1:9000")),
            ("127.0.0.1",       None),
            ("",                None),
            ("::1:9000",        None),
        ];

        for (pass, expected) in cases {
            let filter = FilterConfig {
                fastcgi_pass: pass.to_owned(),
                ..FilterConfig::default()
            };

            assert_eq!(filter.fastcgi_address().as_deref(), expected, "{pass:?}");
        }
    }

    #[test]
    fn invalid_filter() {
        let filter = FilterConfig {
            filter: "(".to_owned(),
            ..FilterConfig::default()
        };

        assert!(matches!(
            filter.pattern(),
            Err(ConfigError::InvalidFilter { .. })
        ));
    }

    #[test]
    fn load_dir() {
        let dir = std::env::temp_dir().join(format!("cosmos-conf-{}", std::process::id()));
        fs::create_dir_all(dir.join("nested")).unwrap();

        assert!(matches!(Config::load_dir(&dir), Err(ConfigError::Empty(_))));

        fs::write(dir.join("b.json"), r#"{ "listen": 81 }"#).unwrap();
        fs::write(dir.join("a.json"), r#"{ "listen": 80 }"#).unwrap();

        let configs = Config::load_dir(&dir).unwrap();
        assert_eq!(configs.iter().map(|c| c.listen).collect::<Vec<_>>(), [80, 81]);

        fs::write(dir.join("c.json"), "{").unwrap();
        assert!(matches!(
            Config::load_dir(&dir),
            Err(ConfigError::Json { .. })
        ));

        fs::remove_dir_all(&dir).unwrap();
    }
}
