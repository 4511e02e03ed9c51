//! Fixed-capacity object pools
//!
//! Two flavours are provided:
//! - [`BufferPool`]: anonymous byte buffers returned on drop
//! - [`IdPool`]: identity-addressed objects with generation-tagged leases and a
//!   background sweep that reclaims objects whose holder went away
//!
//! Neither pool grows nor blocks: acquiring from an empty pool fails at once.

use crate::limits::UploadLimits;
use crossbeam::queue::ArrayQueue;
use std::{
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::{task::JoinHandle, time::Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("pool exhausted")]
    Exhausted,

    #[error("lease expired")]
    Expired,
}

/// Fixed set of equally sized byte buffers.
#[derive(Debug)]
pub struct BufferPool {
    queue: ArrayQueue<Box<[u8]>>,
    buffer_len: usize,
}

impl BufferPool {
    pub(crate) fn new(capacity: usize, buffer_len: usize) -> Self {
        let queue = ArrayQueue::new(capacity.max(1));

        while queue.push(vec![0; buffer_len].into_boxed_slice()).is_ok() {}

        Self { queue, buffer_len }
    }

    /// Takes a free buffer, failing instead of waiting when none is left.
    #[inline]
    pub fn acquire(&self) -> Result<PooledBuffer<'_>, PoolError> {
        let buf = self.queue.pop().ok_or(PoolError::Exhausted)?;
        Ok(PooledBuffer { pool: self, buf })
    }

    /// Buffers currently free.
    #[inline]
    pub fn available(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    #[inline]
    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }
}

/// Buffer borrowed from a [`BufferPool`], handed back when dropped.
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: Box<[u8]>,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    #[inline(always)]
    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        let _ = self.pool.queue.push(std::mem::take(&mut self.buf));
    }
}

/// State kept in an [`IdPool`].
///
/// `new` builds a zeroed instance, `recycle` resets one in place before it
/// returns to the pool.
pub trait Recycle: Send + 'static {
    fn new() -> Self;

    fn recycle(&mut self);
}

#[derive(Debug)]
struct Slot<T> {
    generation: u64,
    item: Option<T>,
    last_touch: Instant,
    expirations: u32,
}

/// Identity-addressed pool.
///
/// An acquired object travels inside a [`Lease`] stamped with its slot id and
/// the slot generation. Reclaiming a slot bumps the generation, so a lease
/// outliving its slot is detected by [`touch`](Self::touch) and silently
/// dropped by [`release`](Self::release).
#[derive(Debug)]
pub struct IdPool<T: Recycle> {
    slots: Mutex<Vec<Slot<T>>>,
    free: ArrayQueue<usize>,
    limits: UploadLimits,
}

/// Object checked out of an [`IdPool`].
#[derive(Debug)]
pub struct Lease<T> {
    id: usize,
    generation: u64,
    item: T,
}

impl<T> Lease<T> {
    #[inline(always)]
    pub fn id(&self) -> usize {
        self.id
    }
}

impl<T> Deref for Lease<T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T> DerefMut for Lease<T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.item
    }
}

impl<T: Recycle> IdPool<T> {
    pub(crate) fn new(capacity: usize, limits: UploadLimits) -> Self {
        let capacity = capacity.max(1);
        let now = Instant::now();

        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                item: Some(T::new()),
                last_touch: now,
                expirations: 0,
            })
            .collect();

        let free = ArrayQueue::new(capacity);
        for id in 0..capacity {
            let _ = free.push(id);
        }

        Self {
            slots: Mutex::new(slots),
            free,
            limits,
        }
    }

    #[inline]
    fn slots(&self) -> MutexGuard<'_, Vec<Slot<T>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn acquire(&self) -> Result<Lease<T>, PoolError> {
        let id = self.free.pop().ok_or(PoolError::Exhausted)?;
        let mut slots = self.slots();
        let slot = &mut slots[id];

        slot.last_touch = Instant::now();
        slot.expirations = 0;

        Ok(Lease {
            id,
            generation: slot.generation,
            item: slot.item.take().unwrap_or_else(T::new),
        })
    }

    /// Refreshes the idle timer of a live lease.
    pub(crate) fn touch(&self, lease: &Lease<T>) -> Result<(), PoolError> {
        let mut slots = self.slots();
        let slot = &mut slots[lease.id];

        if slot.generation != lease.generation {
            return Err(PoolError::Expired);
        }

        slot.last_touch = Instant::now();
        slot.expirations = 0;
        Ok(())
    }

    /// Returns a lease to the pool, `false` when its slot was already reclaimed.
    pub(crate) fn release(&self, lease: Lease<T>) -> bool {
        let Lease {
            id,
            generation,
            mut item,
        } = lease;

        {
            let mut slots = self.slots();
            let slot = &mut slots[id];

            if slot.generation != generation {
                return false;
            }

            item.recycle();
            slot.item = Some(item);
        }

        let _ = self.free.push(id);
        true
    }

    /// Counts one expiration for every lease idle longer than the timeout and
    /// reclaims the ones that hit the limit. Returns the reclaimed count.
    pub(crate) fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut reclaimed = Vec::new();

        {
            let mut slots = self.slots();

            for (id, slot) in slots.iter_mut().enumerate() {
                if slot.item.is_some()
                    || now.saturating_duration_since(slot.last_touch) <= self.limits.timeout
                {
                    continue;
                }

                slot.expirations += 1;
                if slot.expirations >= self.limits.max_expirations {
                    slot.generation += 1;
                    slot.item = Some(T::new());
                    slot.expirations = 0;
                    reclaimed.push(id);
                }
            }
        }

        for &id in &reclaimed {
            let _ = self.free.push(id);
        }

        reclaimed.len()
    }

    /// Starts the periodic sweep. The task ends once the pool is dropped.
    pub(crate) fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let period = self.limits.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

            loop {
                ticker.tick().await;

                let Some(pool) = pool.upgrade() else {
                    break;
                };

                let reclaimed = pool.sweep();
                if reclaimed > 0 {
                    tracing::warn!(reclaimed, "reclaimed abandoned uploads");
                }
            }
        })
    }

    /// Objects currently free.
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Default, PartialEq)]
    struct Counter {
        value: usize,
    }

    impl Recycle for Counter {
        fn new() -> Self {
            Self::default()
        }

        fn recycle(&mut self) {
            self.value = 0;
        }
    }

    fn limits(max_expirations: u32) -> UploadLimits {
        UploadLimits {
            timeout: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(5),
            max_expirations,
            ..UploadLimits::default()
        }
    }

    #[test]
    fn buffers_return_on_drop() {
        let pool = BufferPool::new(2, 64);

        let mut first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();

        assert_eq!(first.len(), 64);
        assert_eq!(pool.acquire().err(), Some(PoolError::Exhausted));

        first[0] = 1;
        drop(first);
        drop(second);

        assert_eq!(pool.available(), 2);
        assert_eq!(pool.buffer_len(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_release() {
        let pool = IdPool::<Counter>::new(2, limits(3));

        let mut a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.acquire().err(), Some(PoolError::Exhausted));

        a.value = 42;
        assert!(pool.release(a));
        assert!(pool.release(b));
        assert_eq!(pool.available(), 2);

        // Released objects come back reset
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(a.value, 0);
        assert_eq!(b.value, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_reclaims_abandoned() {
        #[rustfmt::skip]
        let cases = [
            // (max_expirations, sweeps) => reclaimed
            ((1, 1), true),
            ((3, 2), false),
            ((3, 3), true),
        ];

        for ((max, sweeps), reclaimed) in cases {
            let pool = IdPool::<Counter>::new(1, limits(max));
            let mut lease = pool.acquire().unwrap();
            lease.value = 7;

            for _ in 0..sweeps {
                tokio::time::advance(Duration::from_secs(16)).await;
                pool.sweep();
            }

            assert_eq!(pool.available() == 1, reclaimed, "{max} {sweeps}");
            assert_eq!(pool.touch(&lease).is_err(), reclaimed);
            assert_eq!(pool.release(lease), !reclaimed);
            assert_eq!(pool.available(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_expirations() {
        let pool = IdPool::<Counter>::new(1, limits(2));
        let lease = pool.acquire().unwrap();

        tokio::time::advance(Duration::from_secs(16)).await;
        assert_eq!(pool.sweep(), 0);

        pool.touch(&lease).unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(pool.sweep(), 0);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(pool.sweep(), 0);

        assert!(pool.release(lease));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task() {
        let pool = Arc::new(IdPool::<Counter>::new(1, limits(1)));
        let lease = pool.acquire().unwrap();
        let sweeper = pool.spawn_sweeper();

        tokio::time::sleep(Duration::from_secs(21)).await;

        assert_eq!(pool.available(), 1);
        assert!(!pool.release(lease));

        drop(pool);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(sweeper.is_finished());
    }
}
