/// Recyclable object pool. Objects are taken out for the lifetime of a
/// connection or request and returned for reuse; `gc` trims the free
/// list back down between loop iterations so bursts do not pin memory
/// forever.
pub struct Pool<T> {
    make: fn() -> T,
    free: Vec<T>,
    keep: usize,
}

impl<T> Pool<T> {
    #[inline]
    pub fn new(make: fn() -> T, keep: usize) -> Pool<T> {
        Pool {
            make,
            free: Vec::new(),
            keep,
        }
    }

    /// Take an object from the pool, creating one if none are free.
    #[inline]
    pub fn take(&mut self) -> T {
        match self.free.pop() {
            Some(obj) => obj,
            None => (self.make)(),
        }
    }

    /// Return an object for reuse. The caller resets it first.
    #[inline]
    pub fn put(&mut self, obj: T) {
        self.free.push(obj);
    }

    /// Number of objects currently idle in the pool.
    #[inline]
    pub fn idle(&self) -> usize {
        self.free.len()
    }

    /// Drop idle objects beyond the configured keep level.
    #[inline]
    pub fn gc(&mut self) {
        if self.free.len() > self.keep {
            self.free.truncate(self.keep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_put_reuse() {
        let mut pool: Pool<Vec<u8>> = Pool::new(Vec::new, 2);
        let mut a = pool.take();
        a.push(1);
        a.clear();
        pool.put(a);
        assert_eq!(pool.idle(), 1);
        let b = pool.take();
        assert!(b.is_empty());
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_gc_trims_to_keep_level() {
        let mut pool: Pool<Vec<u8>> = Pool::new(Vec::new, 2);
        for _ in 0..8 {
            let v = pool.take();
            pool.put(v);
        }
        for _ in 0..8 {
            pool.put(Vec::new());
        }
        assert!(pool.idle() > 2);
        pool.gc();
        assert_eq!(pool.idle(), 2);
    }
}
