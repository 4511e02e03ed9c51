use crate::{
    limits::ServiceLimits,
    server::reactor::{Fd, Reactor, TlsStatus},
};
use std::{io, sync::Arc, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("write timed out after {0} retries")]
    Timeout(u32),

    #[error("write failed: {0}")]
    Io(#[source] io::Error),

    #[error("TLS write failed: {0:?}")]
    Tls(TlsStatus),
}

impl WriteError {
    /// Clean close or reset by the peer, not worth an error log.
    #[inline]
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, Self::PeerClosed)
    }
}

impl From<io::Error> for WriteError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::WriteZero => Self::PeerClosed,
            _ => Self::Io(err),
        }
    }
}

/// Writes whole buffers through a non-blocking reactor.
///
/// A full socket is retried every `write_interval`, at most
/// [`max_write_retry`](ServiceLimits::max_write_retry) times per buffer.
#[derive(Debug)]
pub(crate) struct Writer<R> {
    reactor: Arc<R>,
    tls: bool,
    interval: Duration,
    max_retry: u32,
}

impl<R: Reactor> Writer<R> {
    pub(crate) fn new(reactor: Arc<R>, tls: bool, limits: &ServiceLimits) -> Self {
        Self {
            reactor,
            tls,
            interval: limits.write_interval,
            max_retry: limits.max_write_retry(),
        }
    }

    #[inline]
    pub(crate) async fn write(&self, fd: Fd, bytes: &[u8]) -> Result<(), WriteError> {
        if bytes.is_empty() {
            return Ok(());
        }

        if self.tls {
            self.write_tls(fd, bytes).await
        } else {
            self.write_plain(fd, bytes).await
        }
    }

    #[inline]
    async fn backoff(&self, retry: &mut u32) -> Result<(), WriteError> {
        if *retry >= self.max_retry {
            return Err(WriteError::Timeout(*retry));
        }

        *retry += 1;
        tokio::time::sleep(self.interval).await;
        Ok(())
    }

    async fn write_plain(&self, fd: Fd, mut bytes: &[u8]) -> Result<(), WriteError> {
        let mut retry = 0;

        while !bytes.is_empty() {
            match self.reactor.write(fd, bytes) {
                Ok(0) => return Err(WriteError::PeerClosed),
                Ok(n) => bytes = &bytes[n.min(bytes.len())..],
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.backoff(&mut retry).await?
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }

    async fn write_tls(&self, fd: Fd, mut bytes: &[u8]) -> Result<(), WriteError> {
        let mut retry = 0;

        loop {
            let (n, status) = self.reactor.write_tls(fd, bytes);
            bytes = &bytes[n.min(bytes.len())..];

            match status {
                TlsStatus::None | TlsStatus::ZeroReturn if bytes.is_empty() => return Ok(()),
                TlsStatus::None if n > 0 => {}
                TlsStatus::None | TlsStatus::WantWrite | TlsStatus::WantRead => {
                    self.backoff(&mut retry).await?
                }
                TlsStatus::ZeroReturn | TlsStatus::Syscall => return Err(WriteError::PeerClosed),
                TlsStatus::Ssl => return Err(WriteError::Tls(status)),
            }
        }
    }
}
