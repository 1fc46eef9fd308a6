use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Items that can be returned to a pool must scrub themselves back into a
/// reusable state.
pub trait Recycle {
    fn recycle(&mut self);
}

/// The number of items a `PoolCache` moves between itself and the root in
/// one batch.
pub const CACHE_CHUNK: usize = 16;

struct Shared<T> {
    free: Mutex<Vec<T>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    capacity: Option<usize>,
    created: AtomicUsize,
}

/// A shared object pool. The root free list is synchronized with a mutex,
/// so acquisition and release are safe from any thread; hot paths should go
/// through a [`PoolCache`] instead of hitting the root per item.
///
/// An optional capacity bounds the total number of items the pool will ever
/// create. When the bound is reached and the free list is empty, `acquire`
/// returns `None` and the caller is expected to drop the operation.
pub struct Pool<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Pool<T> {
    #[inline]
    fn clone(&self) -> Pool<T> {
        Pool {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Recycle> Pool<T> {
    pub fn new<F: Fn() -> T + Send + Sync + 'static>(factory: F) -> Pool<T> {
        Pool {
            shared: Arc::new(Shared {
                free: Mutex::new(Vec::new()),
                factory: Box::new(factory),
                capacity: None,
                created: AtomicUsize::new(0),
            }),
        }
    }

    pub fn bounded<F: Fn() -> T + Send + Sync + 'static>(capacity: usize, factory: F) -> Pool<T> {
        Pool {
            shared: Arc::new(Shared {
                free: Mutex::new(Vec::new()),
                factory: Box::new(factory),
                capacity: Some(capacity),
                created: AtomicUsize::new(0),
            }),
        }
    }

    /// Takes an item from the free list, or creates one if the capacity
    /// allows. Returns `None` when the pool is exhausted.
    pub fn acquire(&self) -> Option<T> {
        let shared = &self.shared;

        if let Some(item) = shared.free.lock().expect("Pool lock poisoned").pop() {
            return Some(item);
        }

        if let Some(capacity) = shared.capacity {
            if shared.created.load(Ordering::Relaxed) >= capacity {
                return None;
            }
        }

        shared.created.fetch_add(1, Ordering::Relaxed);
        Some((shared.factory)())
    }

    /// Scrubs the item and returns it to the free list.
    pub fn release(&self, mut item: T) {
        item.recycle();
        self.shared.free.lock().expect("Pool lock poisoned").push(item);
    }
}

impl<T> Pool<T> {
    /// Moves already-scrubbed items back to the root free list.
    fn release_raw(&self, items: &mut Vec<T>, count: usize) {
        let mut free = self.shared.free.lock().expect("Pool lock poisoned");
        for _ in 0..count {
            match items.pop() {
                Some(item) => free.push(item),
                None => break,
            }
        }
    }

    #[cfg(test)]
    fn free_len(&self) -> usize {
        self.shared.free.lock().unwrap().len()
    }
}

/// A per-thread front for a [`Pool`] that batch-acquires and batch-releases
/// in chunks, so the worker threads touch the root mutex once per
/// `CACHE_CHUNK` items rather than once per item.
pub struct PoolCache<T> {
    pool: Pool<T>,
    local: Vec<T>,
}

impl<T: Recycle> PoolCache<T> {
    pub fn new(pool: Pool<T>) -> PoolCache<T> {
        PoolCache {
            pool,
            local: Vec::with_capacity(CACHE_CHUNK * 2),
        }
    }

    pub fn acquire(&mut self) -> Option<T> {
        if let Some(item) = self.local.pop() {
            return Some(item);
        }

        // Refill one chunk from the root, keeping one out for the caller.
        for _ in 0..CACHE_CHUNK {
            match self.pool.acquire() {
                Some(item) => self.local.push(item),
                None => break,
            }
        }

        self.local.pop()
    }

    pub fn release(&mut self, mut item: T) {
        item.recycle();
        self.local.push(item);

        if self.local.len() > CACHE_CHUNK * 2 {
            self.pool.release_raw(&mut self.local, CACHE_CHUNK);
        }
    }

    /// Returns every cached item to the root. Called when the owning thread
    /// winds down.
    pub fn flush(&mut self) {
        let count = self.local.len();
        self.pool.release_raw(&mut self.local, count);
    }
}

impl<T> Drop for PoolCache<T> {
    fn drop(&mut self) {
        let count = self.local.len();
        self.pool.release_raw(&mut self.local, count);
    }
}

impl Recycle for Vec<u8> {
    #[inline]
    fn recycle(&mut self) {
        self.clear();
    }
}
