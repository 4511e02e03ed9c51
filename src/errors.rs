use crate::{config::ConfigError, http::types::StatusCode};
use std::{error, fmt, io, path::PathBuf};

/// Reasons a request header block is rejected before routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorKind {
    InvalidHeader,
    HeaderTooLarge,
    InvalidEncoding,

    InvalidMethod,
    InvalidUrl,
    InvalidVersion,

    InvalidContentLength,
    UnsupportedContentType,

    MissingHost,
    InvalidHost,
}

macro_rules! http_errors {
    ($($name:ident => $status:ident;)*) => {
        #[inline]
        pub(crate) const fn status(&self) -> StatusCode {
            match self { $(
                Self::$name => StatusCode::$status,
            )* }
        }
    };
}

impl ErrorKind {
    http_errors! {
        InvalidHeader => BadRequest;
        HeaderTooLarge => BadRequest;
        InvalidEncoding => BadRequest;

        InvalidMethod => BadRequest;
        InvalidUrl => BadRequest;
        InvalidVersion => BadRequest;

        InvalidContentLength => BadRequest;
        UnsupportedContentType => NotAcceptable;

        MissingHost => BadRequest;
        InvalidHost => BadRequest;
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Failures that stop the process before it serves anything.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read TLS material {}: {source}", .path.display())]
    TlsFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),

    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] rustls::Error),

    #[error("failed to open log file {}: {source}", .path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to install log subscriber: {0}")]
    Logging(String),

    #[error("runtime failure: {0}")]
    Runtime(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        #[rustfmt::skip]
        let cases = [
            (ErrorKind::InvalidHeader,          400),
            (ErrorKind::HeaderTooLarge,         400),
            (ErrorKind::InvalidMethod,          400),
            (ErrorKind::InvalidContentLength,   400),
            (ErrorKind::UnsupportedContentType, 406),
            (ErrorKind::MissingHost,            400),
            (ErrorKind::InvalidHost,            400),
        ];

        for (kind, expected) in cases {
            assert_eq!(kind.status().as_u16(), expected, "{kind}");
        }
    }
}
