use core::cell::UnsafeCell;
use core::hint;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

/// A write-once cell for bootstrap-then-steady-state singletons.
///
/// The value is set exactly once during system initialization and read for
/// the rest of the kernel's lifetime.
pub struct Once<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: The state machine guarantees the value is written exactly once
//         before any shared read.
unsafe impl<T> Sync for Once<T> where T: Send + Sync {}
unsafe impl<T> Send for Once<T> where T: Send {}

impl<T> Once<T> {
    const UNINITIALIZED: u8 = 0;
    const INITIALIZING: u8 = 1;
    const INITIALIZED: u8 = 2;

    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(Self::UNINITIALIZED),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Store `value`, returning it back if the cell was already set.
    pub fn set(&self, value: T) -> Result<(), T> {
        match self.state.compare_exchange(
            Self::UNINITIALIZED,
            Self::INITIALIZING,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                // SAFETY: We won the transition; nobody else writes or reads
                //         until we publish INITIALIZED.
                unsafe { (*self.value.get()).write(value) };
                self.state.store(Self::INITIALIZED, Ordering::Release);
                Ok(())
            }
            Err(_) => Err(value),
        }
    }

    pub fn get(&self) -> Option<&T> {
        match self.state.load(Ordering::Acquire) {
            Self::INITIALIZED => {
                // SAFETY: Synchronized with the writer through Acquire.
                Some(unsafe { (*self.value.get()).assume_init_ref() })
            }
            Self::INITIALIZING => {
                // A writer is mid-publish; spin out the tiny window.
                while self.state.load(Ordering::Acquire) != Self::INITIALIZED {
                    hint::spin_loop();
                }
                // SAFETY: As above.
                Some(unsafe { (*self.value.get()).assume_init_ref() })
            }
            _ => None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Acquire) == Self::INITIALIZED
    }
}

impl<T> Drop for Once<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == Self::INITIALIZED {
            // SAFETY: The value was initialized and nobody can access it
            //         anymore.
            unsafe { (*self.value.get()).assume_init_drop() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_once_then_read() {
        let once: Once<u32> = Once::new();

        assert!(once.get().is_none());
        assert!(!once.is_initialized());

        assert!(once.set(42).is_ok());
        assert_eq!(once.set(7), Err(7));

        assert_eq!(once.get(), Some(&42));
        assert!(once.is_initialized());
    }
}
