//! Buffer pool tiers
//!
//! Reusable byte buffers in four fixed size classes. Pools are caches, not
//! owners: dropping pooled buffers only costs a re-allocation later.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::Mutex;
use tracing::trace;

/// Tiny buffers (128B), for control frames
pub const TINY_BUFFER_SIZE: usize = 128;
/// Small buffers (1KB), for handshakes
pub const SMALL_BUFFER_SIZE: usize = 1024;
/// Medium buffers (8KB)
pub const MEDIUM_BUFFER_SIZE: usize = 8 * 1024;
/// Large buffers (32KB), for bulk relay
pub const LARGE_BUFFER_SIZE: usize = 32 * 1024;

/// Default number of idle buffers kept per tier
const DEFAULT_MAX_IDLE: usize = 256;

lazy_static! {
    static ref GLOBAL_POOL: Arc<BufferPool> = Arc::new(BufferPool::new());
}

/// Buffer size class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Tiny,
    Small,
    Medium,
    Large,
}

impl SizeClass {
    pub const ALL: [SizeClass; 4] = [
        SizeClass::Tiny,
        SizeClass::Small,
        SizeClass::Medium,
        SizeClass::Large,
    ];

    /// Length of every buffer in this class
    pub fn size(self) -> usize {
        match self {
            SizeClass::Tiny => TINY_BUFFER_SIZE,
            SizeClass::Small => SMALL_BUFFER_SIZE,
            SizeClass::Medium => MEDIUM_BUFFER_SIZE,
            SizeClass::Large => LARGE_BUFFER_SIZE,
        }
    }

    /// Smallest class that holds at least `len` bytes
    pub fn for_len(len: usize) -> Option<SizeClass> {
        Self::ALL.into_iter().find(|c| c.size() >= len)
    }

    fn index(self) -> usize {
        match self {
            SizeClass::Tiny => 0,
            SizeClass::Small => 1,
            SizeClass::Medium => 2,
            SizeClass::Large => 3,
        }
    }
}

/// Tiered buffer pool, safe for concurrent acquire/release
#[derive(Debug)]
pub struct BufferPool {
    tiers: [Mutex<Vec<Vec<u8>>>; 4],
    max_idle: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_IDLE)
    }

    /// Create a pool keeping at most `max_idle` released buffers per tier
    pub fn with_capacity(max_idle: usize) -> Self {
        Self {
            tiers: Default::default(),
            max_idle,
        }
    }

    /// The process-wide pool
    pub fn global() -> Arc<BufferPool> {
        GLOBAL_POOL.clone()
    }

    /// Take a buffer of exactly `class.size()` bytes
    pub fn acquire(self: &Arc<Self>, class: SizeClass) -> PooledBuf {
        let buf = self.tiers[class.index()]
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; class.size()]);
        PooledBuf {
            buf,
            class,
            pool: Arc::clone(self),
        }
    }

    /// Return a buffer early; equivalent to dropping it
    pub fn release(buf: PooledBuf) {
        drop(buf);
    }

    fn put(&self, class: SizeClass, mut buf: Vec<u8>) {
        // callers may have truncated or grown the buffer
        buf.resize(class.size(), 0);
        buf.truncate(class.size());

        let mut tier = self.tiers[class.index()].lock();
        if tier.len() < self.max_idle {
            tier.push(buf);
        } else {
            trace!("Pool: discarding {:?} buffer (tier full)", class);
        }
    }

    /// Idle buffers per tier, in `SizeClass::ALL` order
    pub fn stats(&self) -> PoolStats {
        let idle = [
            self.tiers[0].lock().len(),
            self.tiers[1].lock().len(),
            self.tiers[2].lock().len(),
            self.tiers[3].lock().len(),
        ];
        PoolStats { idle }
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: [usize; 4],
}

impl PoolStats {
    pub fn idle_for(&self, class: SizeClass) -> usize {
        self.idle[class.index()]
    }
}

/// A buffer on loan from a [`BufferPool`]; returned to it on drop
pub struct PooledBuf {
    buf: Vec<u8>,
    class: SizeClass,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    pub fn class(&self) -> SizeClass {
        self.class
    }

    /// Mutable access to the backing vector (e.g. to truncate it)
    pub fn as_vec_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.put(self.class, buf);
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("class", &self.class)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        let pool = Arc::new(BufferPool::new());
        for class in SizeClass::ALL {
            let buf = pool.acquire(class);
            assert_eq!(buf.len(), class.size());
            assert_eq!(buf.class(), class);
        }
    }

    #[test]
    fn test_for_len() {
        assert_eq!(SizeClass::for_len(1), Some(SizeClass::Tiny));
        assert_eq!(SizeClass::for_len(129), Some(SizeClass::Small));
        assert_eq!(SizeClass::for_len(8 * 1024), Some(SizeClass::Medium));
        assert_eq!(SizeClass::for_len(32 * 1024), Some(SizeClass::Large));
        assert_eq!(SizeClass::for_len(32 * 1024 + 1), None);
    }

    #[test]
    fn test_release_resets_length() {
        let pool = Arc::new(BufferPool::new());
        let mut buf = pool.acquire(SizeClass::Small);
        buf.as_vec_mut().truncate(10);
        drop(buf);
        assert_eq!(pool.stats().idle_for(SizeClass::Small), 1);

        let buf = pool.acquire(SizeClass::Small);
        assert_eq!(buf.len(), SMALL_BUFFER_SIZE);
        assert_eq!(pool.stats().idle_for(SizeClass::Small), 0);

        let mut buf = pool.acquire(SizeClass::Tiny);
        buf.as_vec_mut().extend_from_slice(&[1u8; 64]);
        BufferPool::release(buf);
        assert_eq!(pool.acquire(SizeClass::Tiny).len(), TINY_BUFFER_SIZE);
    }

    #[test]
    fn test_tier_capacity_bound() {
        let pool = Arc::new(BufferPool::with_capacity(2));
        let bufs: Vec<_> = (0..5).map(|_| pool.acquire(SizeClass::Large)).collect();
        drop(bufs);
        assert_eq!(pool.stats().idle_for(SizeClass::Large), 2);
        assert_eq!(pool.stats().idle_for(SizeClass::Tiny), 0);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = Arc::new(BufferPool::with_capacity(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        let class = SizeClass::ALL[i % 4];
                        let mut buf = pool.acquire(class);
                        assert_eq!(buf.len(), class.size());
                        buf[0] = i as u8;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for class in SizeClass::ALL {
            assert!(pool.stats().idle_for(class) <= 8);
        }
    }
}
