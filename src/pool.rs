//! Buffer Pool — reusable response buffers shared across request tasks.
//!
//! `acquire` never waits: it pops an idle buffer or allocates a new one.
//! A `PooledBuffer` is owned by exactly one request and goes back to the
//! idle list, emptied, when it is dropped. The idle list is bounded, and
//! buffers that grew far past the base capacity are discarded instead of
//! being kept around.

use bytes::BytesMut;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Buffers whose capacity exceeds this multiple of the base capacity are
/// not returned to the idle list.
const MAX_RETAINED_FACTOR: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub allocated: u64,
    pub reused: u64,
    pub returned: u64,
    pub discarded: u64,
    pub idle: usize,
}

pub struct BufferPool {
    idle: Mutex<Vec<BytesMut>>,
    capacity: usize,
    max_idle: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
    discarded: AtomicU64,
}

impl BufferPool {
    pub fn new(capacity: usize, max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            capacity,
            max_idle,
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Borrow a buffer. Always succeeds immediately.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let reused = self.lock().pop();
        let buf = match reused {
            Some(buf) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.capacity)
            }
        };
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    fn release(&self, mut buf: BytesMut) {
        if buf.capacity() > self.capacity.saturating_mul(MAX_RETAINED_FACTOR) {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        buf.clear();

        let mut idle = self.lock();
        if idle.len() >= self.max_idle {
            drop(idle);
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        idle.push(buf);
        drop(idle);
        self.returned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            idle: self.lock().len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<BytesMut>> {
        // The list holds plain byte buffers, so a poisoned lock is still usable.
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A buffer on loan from a `BufferPool`.
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.release(buf);
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_empty_pool_allocates() {
        let pool = Arc::new(BufferPool::new(64, 8));
        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 64);
        assert_eq!(pool.stats().allocated, 1);
    }

    #[test]
    fn test_reused_buffer_starts_empty() {
        let pool = Arc::new(BufferPool::new(64, 8));
        {
            let mut buf = pool.acquire();
            buf.extend_from_slice(b"secret from a previous request");
        }
        assert_eq!(pool.stats().idle, 1);

        let buf = pool.acquire();
        assert_eq!(buf.len(), 0);
        assert!(buf.capacity() >= 64);

        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.idle, 0);
    }

    #[test]
    fn test_idle_list_is_bounded() {
        let pool = Arc::new(BufferPool::new(16, 2));
        let held: Vec<PooledBuffer> = (0..4).map(|_| pool.acquire()).collect();
        drop(held);

        let stats = pool.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.returned, 2);
        assert_eq!(stats.discarded, 2);
    }

    #[test]
    fn test_oversized_buffer_discarded() {
        let pool = Arc::new(BufferPool::new(16, 8));
        {
            let mut buf = pool.acquire();
            buf.extend_from_slice(&[0u8; 16 * 32]);
        }
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.discarded, 1);
    }

    #[test]
    fn test_concurrent_borrowers_get_distinct_buffers() {
        let pool = Arc::new(BufferPool::new(32, 64));
        // Warm the pool so borrowers contend for reused buffers.
        drop((0..16).map(|_| pool.acquire()).collect::<Vec<_>>());

        std::thread::scope(|s| {
            for t in 0..8u8 {
                let pool = Arc::clone(&pool);
                s.spawn(move || {
                    for _ in 0..500 {
                        let mut buf = pool.acquire();
                        assert!(buf.is_empty());
                        buf.extend_from_slice(&[t; 8]);
                        assert!(buf.iter().all(|b| *b == t));
                    }
                });
            }
        });

        let held: Vec<PooledBuffer> = (0..16).map(|_| pool.acquire()).collect();
        let ptrs: HashSet<*const u8> = held.iter().map(|b| b.as_ptr()).collect();
        assert_eq!(ptrs.len(), held.len());
    }
}
