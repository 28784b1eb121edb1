use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// Selects how shared protocol state (the pool core, channel records) is
/// guarded. `SingleThread` elides the guard entirely and the owning structures
/// must then stay on one thread. `Atomic` is a fail-fast exclusive lock:
/// contention indicates a scheduling bug and panics rather than blocking.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LockStrategy {
    SingleThread,
    Atomic,
}

/// A fail-fast exclusive cell. All access goes through `lock`, which returns
/// a guard dereferencing to the payload. With the `Atomic` strategy a second
/// concurrent lock panics; with `SingleThread` no checking is performed at
/// all and the cell must not be shared across threads.
#[derive(Debug)]
pub struct LockCell<T> {
    item: UnsafeCell<T>,
    guard: Option<AtomicBool>,
}

impl<T> LockCell<T> {
    #[inline]
    pub fn new(item: T, strategy: LockStrategy) -> LockCell<T> {
        let guard = match strategy {
            LockStrategy::SingleThread => None,
            LockStrategy::Atomic => Some(AtomicBool::new(false)),
        };

        LockCell {
            item: UnsafeCell::new(item),
            guard,
        }
    }

    /// Acquire exclusive access to the payload.
    #[inline]
    pub fn lock(&self) -> CellGuard<T> {
        if let Some(flag) = &self.guard {
            if flag
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                panic!("Attempted to lock a cell that is already locked")
            }
        }

        CellGuard { cell: self }
    }
}

// The cell hands out access strictly through the guard. Sharing a
// `SingleThread` cell across threads violates the documented contract and is
// the embedder's responsibility, mirroring the no-op lock of the protocol
// specification.
unsafe impl<T: Send> Send for LockCell<T> {}
unsafe impl<T: Send> Sync for LockCell<T> {}

pub struct CellGuard<'a, T> {
    cell: &'a LockCell<T>,
}

impl<'a, T> Drop for CellGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        if let Some(flag) = &self.cell.guard {
            flag.store(false, Ordering::Release);
        }
    }
}

impl<'a, T> Deref for CellGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.cell.item.get() }
    }
}

impl<'a, T> DerefMut for CellGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.cell.item.get() }
    }
}
