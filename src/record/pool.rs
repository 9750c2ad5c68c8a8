//! Process-wide byte buffer pools
//!
//! The encode, id-scratch, and read paths all lease buffers from pools so
//! steady-state recording and replay do not allocate per request. Leases are
//! returned on drop; failing to return one is a throughput problem, not a
//! correctness bug.

use parking_lot::Mutex;

/// A concurrency-safe pool of reusable byte buffers.
///
/// `get` hands out a cleared buffer (freshly allocated with
/// `initial_capacity` when the pool is empty); `put` returns it. Capacity
/// grown by the borrower is retained across leases.
pub struct BytePool {
    bufs: Mutex<Vec<Vec<u8>>>,
    initial_capacity: usize,
}

impl BytePool {
    /// Create an empty pool whose fresh buffers start at `initial_capacity`.
    pub const fn new(initial_capacity: usize) -> Self {
        Self {
            bufs: Mutex::new(Vec::new()),
            initial_capacity,
        }
    }

    /// Lease a cleared buffer from the pool.
    pub fn get(&self) -> Vec<u8> {
        let mut buf = self
            .bufs
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.initial_capacity));
        buf.clear();
        buf
    }

    /// Return a buffer to the pool.
    pub fn put(&self, buf: Vec<u8>) {
        self.bufs.lock().push(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_returns_cleared_buffer() {
        let pool = BytePool::new(16);
        let mut buf = pool.get();
        buf.extend_from_slice(b"some leftover data");
        pool.put(buf);

        let buf = pool.get();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 16);
    }

    #[test]
    fn test_capacity_retained_across_leases() {
        let pool = BytePool::new(8);
        let mut buf = pool.get();
        buf.resize(4096, 0);
        let grown = buf.capacity();
        pool.put(buf);

        let buf = pool.get();
        assert!(buf.capacity() >= grown);
    }
}
