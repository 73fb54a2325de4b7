//! Monotonic pool of reusable small integer ids.
//!
//! The pool is a stack, not a freelist: ids in positions `[0, next)` are
//! issued, ids in `[next, max)` are free. Returning the most recently issued
//! id makes it available again; returning any other id leaks it back into
//! the issued prefix. Callers may rely on ids being unique while issued, but
//! not on any particular reuse order.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use crate::{Error, Result};

/// Type of vAccel object ids. Valid ids are strictly positive.
pub type Id = i64;

/// Atomic allocator of reusable small integer ids.
#[derive(Debug)]
pub struct IdPool {
    /// Id slots; a zero slot has never been issued.
    ids: Box<[AtomicI64]>,
    /// Index of the next free slot.
    next: AtomicUsize,
}

impl IdPool {
    /// Creates a pool with capacity for `max` ids.
    pub fn new(max: usize) -> Result<Self> {
        if max == 0 {
            return Err(Error::InvalidArgument);
        }

        let ids = (0..max).map(|_| AtomicI64::new(0)).collect();
        Ok(Self {
            ids,
            next: AtomicUsize::new(0),
        })
    }

    /// Issues the next free id, or `0` if the pool is exhausted.
    ///
    /// Issued ids are in `[1, max]` and unique among concurrently issued
    /// ids.
    pub fn get(&self) -> Id {
        let mut cur = self.next.load(Ordering::Acquire);
        loop {
            if cur >= self.ids.len() {
                return 0;
            }
            match self.next.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }

        let slot = &self.ids[cur];
        // First issue of this position; seed it with position + 1.
        let seeded = cur as Id + 1;
        let _ = slot.compare_exchange(0, seeded, Ordering::AcqRel, Ordering::Acquire);
        slot.load(Ordering::Acquire)
    }

    /// Returns `id` to the pool.
    ///
    /// Only the most recently issued id can actually be reclaimed; any other
    /// id is leaked (it stays in the issued prefix) and `Err(InvalidArgument)`
    /// is reported so callers can log it.
    pub fn put(&self, id: Id) -> Result<()> {
        if id <= 0 || id as usize > self.ids.len() {
            return Err(Error::InvalidArgument);
        }

        let top = id as usize;
        self.next
            .compare_exchange(top, top - 1, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::InvalidArgument)?;

        self.ids[top - 1].store(id, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issues_sequential_ids() {
        let pool = IdPool::new(4).unwrap();
        assert_eq!(pool.get(), 1);
        assert_eq!(pool.get(), 2);
        assert_eq!(pool.get(), 3);
        assert_eq!(pool.get(), 4);
    }

    #[test]
    fn exhaustion_returns_zero() {
        let pool = IdPool::new(2).unwrap();
        assert_eq!(pool.get(), 1);
        assert_eq!(pool.get(), 2);
        assert_eq!(pool.get(), 0);
    }

    #[test]
    fn put_top_makes_id_reusable() {
        let pool = IdPool::new(2).unwrap();
        assert_eq!(pool.get(), 1);
        assert_eq!(pool.get(), 2);
        assert_eq!(pool.get(), 0);
        pool.put(2).unwrap();
        assert_eq!(pool.get(), 2);
    }

    #[test]
    fn put_out_of_order_leaks() {
        let pool = IdPool::new(3).unwrap();
        assert_eq!(pool.get(), 1);
        assert_eq!(pool.get(), 2);
        assert!(pool.put(1).is_err());
        // 1 stays issued; the next free id is 3.
        assert_eq!(pool.get(), 3);
    }

    #[test]
    fn zero_capacity_rejected() {
        assert!(IdPool::new(0).is_err());
    }

    #[test]
    fn concurrent_gets_are_unique() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let pool = Arc::new(IdPool::new(64).unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                (0..8).map(|_| pool.get()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(id >= 1 && id <= 64);
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
    }
}
