//! Service limits and timeouts
//!
//! # Memory Consumption
//!
//! Request handling never allocates per request on the hot path. Memory is
//! reserved up front:
//!
//! `Total` = [`pool_capacity`](ServiceLimits::pool_capacity) x
//!           [`buffer_len`](ServiceLimits::buffer_len) +
//!           [`pool_capacity`](ServiceLimits::pool_capacity) x `PendingUpload` +
//!           cached file metadata and content
//!
//! # Examples
//!
//! ```
//! use cosmos_web::limits::{ServiceLimits, UploadLimits};
//! use std::time::Duration;
//!
//! let limits = ServiceLimits {
//!     buffer_len: 8192,
//!     threads: 4,
//!     write_timeout: Duration::from_secs(3),
//!     ..ServiceLimits::default()
//! };
//!
//! assert_eq!(limits.pool_capacity(), 20);
//! assert_eq!(limits.max_write_retry(), 300);
//! assert_eq!(limits.max_chunk_len(), 8128);
//!
//! let uploads = UploadLimits {
//!     timeout: Duration::from_secs(30),
//!     ..UploadLimits::default()
//! };
//! # let _ = uploads;
//! ```

use std::{num::NonZeroUsize, thread, time::Duration};

/// Smallest accepted receive buffer.
pub const MIN_BUFFER_LEN: usize = 4096;

/// Space reserved in a buffer for the chunk size line and trailing CRLF.
const CHUNK_OVERHEAD: usize = 64;

/// Controls buffer sizing, pool capacity and the write retry policy.
///
/// # Pools
///
/// Buffers and pending uploads are pooled with a fixed capacity of
/// `threads * pool_multiple`. Acquisition never blocks and never grows the
/// pool: a request that finds the pool empty is answered with `500`.
///
/// # Write retry
///
/// A write that would block sleeps for `write_interval` and retries, at most
/// `write_timeout / write_interval` times. Running out of retries is treated
/// like a lost peer and the connection is destroyed.
#[derive(Debug, Clone)]
pub struct ServiceLimits {
    /// Size of each pooled buffer in bytes (default: `4096`).
    ///
    /// Also the largest read delivered per receive event and the upper
    /// bound of a single physical write.
    pub buffer_len: usize,

    /// Pooled objects per worker thread (default: `5`).
    pub pool_multiple: usize,

    /// Worker threads (default: available parallelism).
    pub threads: usize,

    /// Total time a single write may spend waiting on a full socket (default: `6 seconds`).
    pub write_timeout: Duration,

    /// Sleep between write retries (default: `10 milliseconds`).
    pub write_interval: Duration,

    /// Largest accepted header block in bytes, `0` for unlimited (default: `0`).
    pub header_length: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl ServiceLimits {
    /// Capacity of the buffer and upload pools.
    #[inline]
    pub fn pool_capacity(&self) -> usize {
        (self.threads * self.pool_multiple).max(1)
    }

    /// Number of retries a blocked write gets before timing out.
    #[inline]
    pub fn max_write_retry(&self) -> u32 {
        let interval = self.write_interval.as_micros().max(1);
        u32::try_from(self.write_timeout.as_micros() / interval).unwrap_or(u32::MAX)
    }

    /// Largest payload framed into one HTTP chunk.
    #[inline]
    pub fn max_chunk_len(&self) -> usize {
        self.buffer_len.saturating_sub(CHUNK_OVERHEAD).max(1)
    }
}

impl Default for ServiceLimits {
    fn default() -> Self {
        Self {
            buffer_len: MIN_BUFFER_LEN,
            pool_multiple: 5,
            threads: default_threads(),
            write_timeout: Duration::from_secs(6),
            write_interval: Duration::from_millis(10),
            header_length: 0,

            _priv: (),
        }
    }
}

/// Reclamation policy for uploads whose connection vanished mid-body.
///
/// An upload untouched for `timeout` counts one expiration per sweep. After
/// `max_expirations` sweeps it is forcibly recycled and any lease still held
/// on it becomes stale.
#[derive(Debug, Clone)]
pub struct UploadLimits {
    /// Idle time after which an upload starts counting expirations (default: `15 seconds`).
    pub timeout: Duration,

    /// Period of the background sweep (default: `5 seconds`).
    pub sweep_interval: Duration,

    /// Expired sweeps before reclamation (default: `1200`).
    pub max_expirations: u32,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(5),
            max_expirations: 1200,

            _priv: (),
        }
    }
}

/// Content cache bounds.
#[derive(Debug, Clone)]
pub struct CacheLimits {
    /// Lifetime of an entry since its last access, also the sweep period (default: `2 hours`).
    pub timeout: Duration,

    /// Initial map capacity (default: `256`).
    pub capacity: usize,

    /// Largest cacheable payload in bytes, `0` for unlimited (default: `0`).
    pub max_entry_size: usize,

    /// Largest number of live entries, `0` for unlimited (default: `0`).
    pub max_entries: usize,

    /// Allowed key suffixes (dot included), empty allows all (default: empty).
    pub types: Vec<String>,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(7200),
            capacity: 256,
            max_entry_size: 0,
            max_entries: 0,
            types: Vec::new(),

            _priv: (),
        }
    }
}

/// FastCGI backend connection policy, one pool per filter.
#[derive(Debug, Clone)]
pub struct GatewayLimits {
    /// Time allowed to establish a backend connection (default: `6 seconds`).
    pub connect_timeout: Duration,

    /// Time allowed for one backend read or write (default: `6 seconds`).
    pub io_timeout: Duration,

    /// Open backend connections allowed at once (default: `8`).
    pub pool_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for GatewayLimits {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(6),
            io_timeout: Duration::from_secs(6),
            pool_size: 8,

            _priv: (),
        }
    }
}

#[inline]
pub(crate) fn default_threads() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}
