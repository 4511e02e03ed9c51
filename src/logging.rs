//! Log subscriber setup
//!
//! System events go through an [`EnvFilter`] (from `RUST_LOG`, else the given
//! level) to stderr or the error log file. Access records, emitted on the
//! [`ACCESS_TARGET`] target, only reach the access log file.

use crate::errors::StartupError;
use std::{
    fs::{File, OpenOptions},
    path::Path,
    sync::Mutex,
};
use tracing_subscriber::{
    filter::{Directive, LevelFilter, Targets},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Target of access log records.
pub const ACCESS_TARGET: &str = "access_log";

fn open(path: &Path) -> Result<Mutex<File>, StartupError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(Mutex::new)
        .map_err(|source| StartupError::LogFile {
            path: path.to_owned(),
            source,
        })
}

/// Installs the global subscriber. Empty paths mean stderr for the error log
/// and no access log.
pub fn init(level: &str, error_log: &str, access_log: &str) -> Result<(), StartupError> {
    let directive = format!("{ACCESS_TARGET}=off");
    let system_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level))
        .add_directive(
            directive
                .parse::<Directive>()
                .map_err(|err| StartupError::Logging(err.to_string()))?,
        );

    let system = match error_log.is_empty() {
        true => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(system_filter)
            .boxed(),
        false => tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(open(Path::new(error_log))?)
            .with_filter(system_filter)
            .boxed(),
    };

    let access = match access_log.is_empty() {
        true => tracing_subscriber::layer::Identity::new().boxed(),
        false => tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(open(Path::new(access_log))?)
            .compact()
            .with_filter(Targets::new().with_target(ACCESS_TARGET, LevelFilter::INFO))
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(system.and_then(access))
        .try_init()
        .map_err(|err| StartupError::Logging(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritable_log_file() {
        let result = init("info", "/nonexistent/dir/error.log", "");
        assert!(matches!(result, Err(StartupError::LogFile { .. })));
    }
}
