//! Fixed-capacity byte buffers and the pool that recycles them.
//!
//! A [`Buffer`] is owned by exactly one component at a time and moves by value
//! at every handoff. [`BufferPool::release`] consumes the buffer, so a released
//! buffer cannot be touched again by the releasing party. The pool never blocks:
//! when the free list is empty `acquire` allocates a new buffer, and when the
//! free list is full `release` lets the buffer drop.

use crossbeam_queue::ArrayQueue;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default buffer size, large enough for one TCP read or most UDP datagrams.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Largest payload a single UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Default number of idle buffers kept by the pool.
pub const DEFAULT_POOLED_BUFFERS: usize = 1024;

/// A byte container with a fixed maximum capacity and a current length.
pub struct Buffer {
    data: Box<[u8]>,
    len: usize,
}

impl Buffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Space left before the buffer is full.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Appends as much of `bytes` as fits and returns the number copied.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.remaining());
        self.data[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        n
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Unfilled tail of the buffer, for APIs that write into a slice.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Marks `n` bytes of the spare tail as filled.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.remaining(), "advance past buffer capacity");
        self.len += n;
    }

    /// Single read from `reader` into the spare tail. Returns 0 on end of
    /// stream or when the buffer is already full.
    pub async fn read_from<R>(&mut self, reader: &mut R) -> std::io::Result<usize>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if self.is_full() {
            return Ok(0);
        }
        let n = reader.read(self.spare_mut()).await?;
        self.len += n;
        Ok(n)
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    allocations: AtomicU64,
    reuses: AtomicU64,
    releases: AtomicU64,
    discards: AtomicU64,
}

/// Point-in-time view of pool activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers created because the free list was empty
    pub allocations: u64,
    /// Buffers handed out from the free list
    pub reuses: u64,
    /// Buffers handed back through `release`
    pub releases: u64,
    /// Released buffers dropped because the free list was full
    pub discards: u64,
    /// Buffers currently idle in the free list
    pub idle: usize,
}

impl PoolStats {
    /// Buffers acquired but not yet released.
    pub fn outstanding(&self) -> u64 {
        (self.allocations + self.reuses).saturating_sub(self.releases)
    }
}

/// Lock-free pool of equally sized buffers.
pub struct BufferPool {
    free: ArrayQueue<Buffer>,
    buffer_size: usize,
    counters: PoolCounters,
}

impl BufferPool {
    /// Pool of `buffer_size`-byte buffers keeping at most `pooled` idle ones.
    pub fn new(buffer_size: usize, pooled: usize) -> Self {
        Self {
            free: ArrayQueue::new(pooled.max(1)),
            buffer_size,
            counters: PoolCounters::default(),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Returns an empty buffer, reusing an idle one when available.
    pub fn acquire(&self) -> Buffer {
        match self.free.pop() {
            Some(mut buffer) => {
                buffer.clear();
                self.counters.reuses.fetch_add(1, Ordering::Relaxed);
                buffer
            }
            None => {
                self.counters.allocations.fetch_add(1, Ordering::Relaxed);
                Buffer::with_capacity(self.buffer_size)
            }
        }
    }

    /// Returns an empty buffer holding at least `len` bytes. Lengths above
    /// `buffer_size` get a one-off allocation that `release` will not pool.
    pub fn acquire_at_least(&self, len: usize) -> Buffer {
        if len <= self.buffer_size {
            return self.acquire();
        }
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        Buffer::with_capacity(len)
    }

    /// Gives `buffer` back to the pool.
    pub fn release(&self, buffer: Buffer) {
        self.counters.releases.fetch_add(1, Ordering::Relaxed);
        if buffer.capacity() != self.buffer_size || self.free.push(buffer).is_err() {
            self.counters.discards.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocations: self.counters.allocations.load(Ordering::Relaxed),
            reuses: self.counters.reuses.load(Ordering::Relaxed),
            releases: self.counters.releases.load(Ordering::Relaxed),
            discards: self.counters.discards.load(Ordering::Relaxed),
            idle: self.free.len(),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_POOLED_BUFFERS)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("stats", &self.stats())
            .finish()
    }
}
