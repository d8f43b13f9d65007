use crate::irq::{self, IrqState};
use core::cell::UnsafeCell;
use core::hint;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A spinlock for short bounded critical sections.
///
/// Two acquisition modes exist. [`Spin::lock`] is for paths that already run
/// with interrupts off (or in contexts where interrupts cannot reenter the
/// protected state). [`Spin::lock_irq`] additionally saves and disables
/// interrupts for the lifetime of the guard; every public allocator mutator
/// goes through it.
#[derive(Debug, Default)]
pub struct Spin<T>
where
    T: ?Sized,
{
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: As long as the value protected by the lock can be sent between
//         threads, the lock provides the required exclusive access.
unsafe impl<T> Send for Spin<T> where T: ?Sized + Send {}
unsafe impl<T> Sync for Spin<T> where T: ?Sized + Send {}

impl<T> Spin<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }
}

impl<T> Spin<T>
where
    T: ?Sized,
{
    fn do_lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
    }

    /// # Safety
    /// The caller MUST ensure that the protected value is no longer accessed
    /// after calling this function.
    unsafe fn do_unlock(&self) {
        let locked = self.locked.swap(false, Ordering::Release);
        debug_assert!(locked, "Spin::unlock(): unlocking an unlocked lock");
    }

    pub fn lock(&self) -> SpinGuard<'_, T> {
        self.do_lock();

        SpinGuard {
            lock: self,
            // SAFETY: We are holding the lock.
            value: unsafe { &mut *self.value.get() },
            _not_send: PhantomData,
        }
    }

    /// Acquire the lock with interrupts disabled. The saved interrupt state
    /// is restored when the guard drops.
    pub fn lock_irq(&self) -> SpinIrqGuard<'_, T> {
        let irq_state = irq::save_disable();
        self.do_lock();

        SpinIrqGuard {
            lock: self,
            // SAFETY: We are holding the lock.
            value: unsafe { &mut *self.value.get() },
            irq_state: Some(irq_state),
            _not_send: PhantomData,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: Exclusive access is guaranteed by the borrow checker.
        unsafe { &mut *self.value.get() }
    }
}

/// We don't want the guards to be `Send`: they pin the critical section to
/// the CPU that disabled interrupts.
type NotSend = PhantomData<*mut ()>;

pub struct SpinGuard<'a, T>
where
    T: ?Sized,
{
    lock: &'a Spin<T>,
    value: &'a mut T,
    _not_send: NotSend,
}

pub struct SpinIrqGuard<'a, T>
where
    T: ?Sized,
{
    lock: &'a Spin<T>,
    value: &'a mut T,
    irq_state: Option<IrqState>,
    _not_send: NotSend,
}

// SAFETY: The guard only hands out references with the value's own rules.
unsafe impl<T> Sync for SpinGuard<'_, T> where T: ?Sized + Sync {}
unsafe impl<T> Sync for SpinIrqGuard<'_, T> where T: ?Sized + Sync {}

impl<T> Drop for SpinGuard<'_, T>
where
    T: ?Sized,
{
    fn drop(&mut self) {
        // SAFETY: The guard is going away; the value is not accessed again.
        unsafe { self.lock.do_unlock() };
    }
}

impl<T> Drop for SpinIrqGuard<'_, T>
where
    T: ?Sized,
{
    fn drop(&mut self) {
        // SAFETY: The guard is going away; the value is not accessed again.
        unsafe { self.lock.do_unlock() };

        if let Some(state) = self.irq_state.take() {
            state.restore();
        }
    }
}

impl<T> Deref for SpinGuard<'_, T>
where
    T: ?Sized,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.value
    }
}

impl<T> DerefMut for SpinGuard<'_, T>
where
    T: ?Sized,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.value
    }
}

impl<T> Deref for SpinIrqGuard<'_, T>
where
    T: ?Sized,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.value
    }
}

impl<T> DerefMut for SpinIrqGuard<'_, T>
where
    T: ?Sized,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.value
    }
}
