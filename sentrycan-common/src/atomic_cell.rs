//! An AtomicCell type which uses a critical_section Mutex to enforce atomic
//! store/load
//!
//! Crossbeam's AtomicCell is not usable on thumbv6m targets (no CAS), so all
//! shared cells in this stack go through critical sections instead.

use core::{cell::Cell, ops::Add};
use critical_section::Mutex;

/// A `Cell` wrapper providing atomic access from any context
#[derive(Debug)]
pub struct AtomicCell<T: Copy> {
    inner: Mutex<Cell<T>>,
}

impl<T: Send + Copy> AtomicCell<T> {
    /// Create a new cell holding `value`
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(Cell::new(value)),
        }
    }

    /// Atomically read the stored value
    pub fn load(&self) -> T {
        critical_section::with(|cs| self.inner.borrow(cs).get())
    }

    /// Atomically replace the stored value
    pub fn store(&self, value: T) {
        critical_section::with(|cs| self.inner.borrow(cs).set(value));
    }

    /// Atomically update the value with `f`
    ///
    /// If `f` returns `Some(new)`, the new value is stored and the previous
    /// value is returned as `Ok`. If it returns `None`, nothing is stored and
    /// the current value is returned as `Err`.
    pub fn fetch_update(&self, mut f: impl FnMut(T) -> Option<T>) -> Result<T, T> {
        critical_section::with(|cs| {
            let old_value = self.inner.borrow(cs).get();
            if let Some(new_value) = f(old_value) {
                self.inner.borrow(cs).set(new_value);
                Ok(old_value)
            } else {
                Err(old_value)
            }
        })
    }
}

impl<T: Send + Copy + Default> AtomicCell<T> {
    /// Atomically take the value, leaving `T::default()` behind
    pub fn take(&self) -> T {
        critical_section::with(|cs| self.inner.borrow(cs).take())
    }
}

impl<T: Send + Copy + Add<Output = T>> AtomicCell<T> {
    /// Atomically add `value`, returning the previous value
    pub fn fetch_add(&self, value: T) -> T {
        critical_section::with(|cs| {
            let old_value = self.inner.borrow(cs).get();
            self.inner.borrow(cs).set(old_value + value);
            old_value
        })
    }
}

impl<T: Default + Copy + Send> Default for AtomicCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_store_take() {
        let cell = AtomicCell::new(7u32);
        assert_eq!(7, cell.load());
        cell.store(12);
        assert_eq!(12, cell.load());
        assert_eq!(12, cell.take());
        assert_eq!(0, cell.load());
    }

    #[test]
    fn test_fetch_update() {
        let cell = AtomicCell::new(1u8);
        assert_eq!(Ok(1), cell.fetch_update(|v| Some(v + 1)));
        assert_eq!(Err(2), cell.fetch_update(|_| None));
        assert_eq!(2, cell.load());
    }

    #[test]
    fn test_fetch_add() {
        let cell = AtomicCell::new(40u16);
        assert_eq!(40, cell.fetch_add(2));
        assert_eq!(42, cell.load());
    }
}
