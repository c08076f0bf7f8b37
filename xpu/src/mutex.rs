//! Simple mutex based on spinlock.
//!
//! Critical sections in this crate are short (bookkeeping maps, lazy slots), so spinning is
//! cheaper than parking. After `N` spins the waiting thread starts yielding to the scheduler.

use std::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, Ordering},
};

pub(crate) struct Mutex<T, const N: usize = 1024> {
    data: UnsafeCell<T>,
    lock: AtomicBool,
}

pub(crate) struct MutexGuard<'a, T: 'a> {
    lock: &'a AtomicBool,
    data: &'a UnsafeCell<T>,
}

unsafe impl<T: Send, const N: usize> Sync for Mutex<T, N> {}
unsafe impl<T: Send, const N: usize> Send for Mutex<T, N> {}

unsafe impl<T: Sync> Sync for MutexGuard<'_, T> {}

impl<T, const N: usize> Mutex<T, N> {
    pub(crate) const fn new(data: T) -> Self {
        Self { data: UnsafeCell::new(data), lock: AtomicBool::new(false) }
    }

    #[inline(always)]
    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        let mut i = 0;
        loop {
            if self
                .lock
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return MutexGuard { lock: &self.lock, data: &self.data };
            }
            while self.lock.load(Ordering::Relaxed) {
                if i < N {
                    core::hint::spin_loop();
                    i += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }
}

impl<T: std::fmt::Debug, const N: usize> std::fmt::Debug for Mutex<T, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex").field("data", &*self.lock()).finish()
    }
}

impl<T> core::ops::Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.data.get() }
    }
}

impl<T> core::ops::DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.store(false, Ordering::Release)
    }
}

#[cfg(test)]
mod tests {
    use super::Mutex;
    use std::sync::Arc;

    #[test]
    fn contended_counter() {
        let counter = Arc::new(Mutex::<usize, 16>::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock(), 4000);
    }
}
