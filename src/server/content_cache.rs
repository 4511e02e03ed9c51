//! TTL content cache owned by a single actor task
//!
//! Callers talk to the actor over a channel and await the reply, so every
//! structural change to the map happens on one task, one command at a time.
//! A second task asks for a sweep once per timeout period.

use crate::limits::CacheLimits;
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};

const QUEUE_DEPTH: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("file does not exist: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("file is empty: {}", .0.display())]
    EmptyFile(PathBuf),

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("entry rejected: {0}")]
    Rejected(&'static str),

    #[error("cache is shut down")]
    Closed,
}

type Payload = Arc<[u8]>;

enum Command {
    Get {
        key: String,
        reply: oneshot::Sender<Option<Payload>>,
    },
    Put {
        key: String,
        payload: Payload,
        reply: oneshot::Sender<Result<(), CacheError>>,
    },
    Sweep,
    #[cfg(test)]
    Len(oneshot::Sender<usize>),
}

#[derive(Debug)]
struct Entry {
    payload: Payload,
    touched: Instant,
}

/// Handle to the cache actor. Dropping it stops both background tasks.
#[derive(Debug)]
pub struct ContentCache {
    tx: mpsc::Sender<Command>,
    limits: CacheLimits,
    sweeper: JoinHandle<()>,
}

impl ContentCache {
    /// Spawns the actor and its sweeper on the current runtime.
    pub(crate) fn new(limits: CacheLimits) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);

        tokio::spawn(run_actor(rx, limits.clone()));

        let period = limits.timeout;
        let sweep_tx = tx.clone();
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

            loop {
                ticker.tick().await;

                if sweep_tx.send(Command::Sweep).await.is_err() {
                    break;
                }
            }
        });

        Self {
            tx,
            limits,
            sweeper,
        }
    }

    /// Returns the payload stored under `key` and refreshes its lifetime.
    pub async fn get(&self, key: &str) -> Option<Payload> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Get {
            key: key.to_owned(),
            reply,
        };

        self.tx.send(command).await.ok()?;
        rx.await.ok().flatten()
    }

    pub async fn put(&self, key: &str, payload: impl Into<Payload>) -> Result<(), CacheError> {
        let payload = payload.into();
        self.check(key, payload.len())?;

        let (reply, rx) = oneshot::channel();
        let command = Command::Put {
            key: key.to_owned(),
            payload,
            reply,
        };

        self.tx.send(command).await.map_err(|_| CacheError::Closed)?;
        rx.await.map_err(|_| CacheError::Closed)?
    }

    /// Reads a whole file and stores it under `key`.
    pub async fn put_file(&self, key: &str, path: &Path) -> Result<(), CacheError> {
        let payload = match tokio::fs::read(path).await {
            Ok(payload) => payload,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::FileNotFound(path.to_owned()));
            }
            Err(source) => {
                return Err(CacheError::Io {
                    path: path.to_owned(),
                    source,
                });
            }
        };

        if payload.is_empty() {
            return Err(CacheError::EmptyFile(path.to_owned()));
        }

        self.put(key, payload).await
    }

    fn check(&self, key: &str, len: usize) -> Result<(), CacheError> {
        if len == 0 {
            return Err(CacheError::Rejected("empty payload"));
        }

        if self.limits.max_entry_size > 0 && len > self.limits.max_entry_size {
            return Err(CacheError::Rejected("payload too large"));
        }

        if !self.limits.types.is_empty() && !self.limits.types.iter().any(|t| key.ends_with(t.as_str())) {
            return Err(CacheError::Rejected("type not cached"));
        }

        Ok(())
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Len(reply)).await;
        rx.await.unwrap_or(0)
    }
}

impl Drop for ContentCache {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

async fn run_actor(mut rx: mpsc::Receiver<Command>, limits: CacheLimits) {
    let mut entries: HashMap<String, Entry> = HashMap::with_capacity(limits.capacity);
    let expired = |entry: &Entry, now: Instant| {
        now.saturating_duration_since(entry.touched) > limits.timeout
    };

    while let Some(command) = rx.recv().await {
        let now = Instant::now();

        match command {
            Command::Get { key, reply } => {
                let payload = match entries.get_mut(&key) {
                    Some(entry) if !expired(entry, now) => {
                        entry.touched = now;
                        Some(entry.payload.clone())
                    }
                    Some(_) => {
                        entries.remove(&key);
                        None
                    }
                    None => None,
                };

                let _ = reply.send(payload);
            }
            Command::Put {
                key,
                payload,
                reply,
            } => {
                let full = limits.max_entries > 0
                    && entries.len() >= limits.max_entries
                    && !entries.contains_key(&key);

                let result = if full {
                    Err(CacheError::Rejected("cache is full"))
                } else {
                    entries.insert(
                        key,
                        Entry {
                            payload,
                            touched: now,
                        },
                    );
                    Ok(())
                };

                let _ = reply.send(result);
            }
            Command::Sweep => {
                let before = entries.len();
                entries.retain(|_, entry| !expired(entry, now));

                let evicted = before - entries.len();
                if evicted > 0 {
                    tracing::debug!(evicted, "content cache sweep");
                }
            }
            #[cfg(test)]
            Command::Len(reply) => {
                let _ = reply.send(entries.len());
            }
        }
    }
}
