//! Byte buffer pool.
//!
//! Packet buffers are backed by pooled `BytesMut` storage. [`PacketBuffer`]
//! returns its storage here on drop, so release happens on every exit path
//! of request handling, including after transmission completes.
//!
//! [`PacketBuffer`]: super::buffer::PacketBuffer

use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of buffers retained by the pool.
const POOL_MAX: usize = 256;

/// Initial capacity of a freshly allocated buffer.
const INITIAL_CAPACITY: usize = 4096;

/// Buffers larger than this are not returned to the pool.
const RETAIN_LIMIT: usize = 256 * 1024;

static POOL: Mutex<Vec<BytesMut>> = Mutex::new(Vec::new());

static ACQUIRED: AtomicU64 = AtomicU64::new(0);
static REUSED: AtomicU64 = AtomicU64::new(0);

/// Take a cleared buffer from the pool, allocating if the pool is empty.
pub fn acquire() -> BytesMut {
    ACQUIRED.fetch_add(1, Ordering::Relaxed);
    if let Some(buf) = POOL.lock().pop() {
        REUSED.fetch_add(1, Ordering::Relaxed);
        return buf;
    }
    BytesMut::with_capacity(INITIAL_CAPACITY)
}

/// Return a buffer to the pool.
///
/// Oversized buffers are dropped instead of retained so a single large
/// payload does not pin its allocation forever.
pub fn release(mut buf: BytesMut) {
    if buf.capacity() == 0 || buf.capacity() > RETAIN_LIMIT {
        return;
    }
    buf.clear();
    let mut pool = POOL.lock();
    if pool.len() < POOL_MAX {
        pool.push(buf);
    }
}

/// Number of buffers currently idle in the pool.
pub fn idle() -> usize {
    POOL.lock().len()
}

/// Total acquisitions and pool hits since process start.
pub fn counters() -> (u64, u64) {
    (
        ACQUIRED.load(Ordering::Relaxed),
        REUSED.load(Ordering::Relaxed),
    )
}
