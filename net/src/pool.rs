//! Pre-allocated packet buffer pool.
//!
//! Generalizes the lock-free Treiber-stack slab in
//! `drivers/src/net/pool.rs` to a hosted `std` program: there is no
//! interrupt context here to avoid deadlocking against, so a plain
//! `Mutex<Vec<_>>` free-list of owned buffers replaces the tagged-CAS
//! freelist over a static BSS array. A [`PacketBuf`](crate::packetbuf::PacketBuf)
//! holds one buffer outright while it's alive and returns it to the pool on
//! drop, same ownership discipline as a slot index, without the `unsafe`
//! pointer arithmetic a shared array would need.

use std::sync::Mutex;

/// Size of each packet buffer in bytes. Covers the maximum Ethernet frame
/// (1518) plus [`crate::packetbuf::HEADROOM`] with room to spare.
pub const BUF_SIZE: usize = 2048;

/// Soft capacity of the pool: once this many buffers are outstanding,
/// further allocation attempts are refused rather than growing unbounded.
pub const POOL_SIZE: usize = 256;

/// A single pool-owned packet buffer.
pub type PoolBuf = Box<[u8; BUF_SIZE]>;

fn new_buf() -> PoolBuf {
    Box::new([0u8; BUF_SIZE])
}

/// Bounded free-list of reusable packet buffers.
pub struct PacketPool {
    free: Mutex<Vec<PoolBuf>>,
    outstanding: std::sync::atomic::AtomicUsize,
}

impl PacketPool {
    /// Build a pool pre-warmed with [`POOL_SIZE`] buffers.
    pub fn new() -> Self {
        let free = (0..POOL_SIZE).map(|_| new_buf()).collect();
        PacketPool {
            free: Mutex::new(free),
            outstanding: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Take ownership of a buffer. Returns `None` once [`POOL_SIZE`] buffers
    /// are outstanding at once, capping worst-case memory per the resource
    /// policy.
    pub fn alloc(&self) -> Option<PoolBuf> {
        use std::sync::atomic::Ordering;
        if self.outstanding.load(Ordering::Relaxed) >= POOL_SIZE {
            return None;
        }
        let mut free = self.free.lock().expect("pool free-list poisoned");
        let buf = free.pop().unwrap_or_else(new_buf);
        drop(free);
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Some(buf)
    }

    /// Return a buffer to the pool for reuse.
    pub fn release(&self, mut buf: PoolBuf) {
        use std::sync::atomic::Ordering;
        buf.fill(0);
        let mut free = self.free.lock().expect("pool free-list poisoned");
        if free.len() < POOL_SIZE {
            free.push(buf);
        }
        drop(free);
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    /// Number of buffers currently checked out (diagnostic).
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new()
    }
}
