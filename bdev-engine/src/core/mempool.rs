//! Bounded object pools for per-I/O context structures. Pools put a hard cap
//! on the number of in-flight contexts; exhaustion surfaces as `None` and the
//! caller queues the request for retry instead of failing it.

use std::sync::atomic::{AtomicU64, Ordering};

/// Fixed-capacity pool of objects of type T.
#[derive(Debug)]
pub struct MemoryPool<T> {
    name: String,
    capacity: u64,
    used: AtomicU64,
    _marker: std::marker::PhantomData<T>,
}

impl<T> MemoryPool<T> {
    /// Creates a pool that admits at most `size` objects.
    pub fn create(name: &str, size: u64) -> Option<Self> {
        info!(
            "Memory pool '{}' with {} elements ({} bytes size each) created",
            name,
            size,
            std::mem::size_of::<T>(),
        );
        Some(Self {
            name: String::from(name),
            capacity: size,
            used: AtomicU64::new(0),
            _marker: std::marker::PhantomData,
        })
    }

    /// Allocates an element, consuming one pool slot. Returns `None` when the
    /// pool is exhausted.
    pub fn get(&self, val: T) -> Option<Box<T>> {
        let mut cur = self.used.load(Ordering::Relaxed);
        loop {
            if cur >= self.capacity {
                return None;
            }
            match self.used.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(Box::new(val)),
                Err(c) => cur = c,
            }
        }
    }

    /// Releases an element back to the pool.
    pub fn put(&self, item: Box<T>) -> T {
        self.used.fetch_sub(1, Ordering::AcqRel);
        *item
    }

    /// Number of elements currently allocated from the pool.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pool_exhaustion() {
        let pool = MemoryPool::<u32>::create("test_pool", 2).unwrap();

        let a = pool.get(1).unwrap();
        let b = pool.get(2).unwrap();
        assert!(pool.get(3).is_none());
        assert_eq!(pool.used(), 2);

        pool.put(a);
        assert_eq!(pool.used(), 1);
        let _c = pool.get(4).unwrap();
        assert!(pool.get(5).is_none());
        drop(b);
    }
}
