//! Interrupt save/restore for the single-CPU kernel.
//!
//! Critical sections disable interrupts before taking the lock and restore
//! the previous state afterwards, so allocator paths stay safe against
//! handlers that allocate or free.

/// Saved interrupt state. Obtained from [`save_disable`], consumed by
/// [`IrqState::restore`].
#[must_use]
pub struct IrqState {
    was_enabled: bool,
}

impl IrqState {
    pub fn restore(self) {
        arch::restore(self.was_enabled);
    }
}

/// Disable interrupts on the local CPU, returning the previous state.
pub fn save_disable() -> IrqState {
    IrqState {
        was_enabled: arch::save_disable(),
    }
}

/// Whether interrupts are currently enabled. Hosted builds report whether
/// any saved-disable section is still active, which lets tests assert that
/// lock paths are balanced.
pub fn enabled() -> bool {
    arch::enabled()
}

#[cfg(all(target_os = "none", target_arch = "x86"))]
mod arch {
    use core::arch::asm;

    const EFLAGS_IF: u32 = 1 << 9;

    pub(super) fn save_disable() -> bool {
        let flags: u32;
        unsafe {
            asm!("pushfd", "pop {}", "cli", out(reg) flags);
        }
        flags & EFLAGS_IF != 0
    }

    pub(super) fn restore(was_enabled: bool) {
        if was_enabled {
            unsafe {
                asm!("sti", options(nomem));
            }
        }
    }

    pub(super) fn enabled() -> bool {
        let flags: u32;
        unsafe {
            asm!("pushfd", "pop {}", out(reg) flags);
        }
        flags & EFLAGS_IF != 0
    }
}

/// Hosted fallback: a disable-depth counter with the same nesting contract
/// as the hardware flag.
#[cfg(not(all(target_os = "none", target_arch = "x86")))]
mod arch {
    use core::sync::atomic::{AtomicUsize, Ordering};

    static DISABLE_DEPTH: AtomicUsize = AtomicUsize::new(0);

    pub(super) fn save_disable() -> bool {
        DISABLE_DEPTH.fetch_add(1, Ordering::Relaxed) == 0
    }

    pub(super) fn restore(_was_enabled: bool) {
        DISABLE_DEPTH.fetch_sub(1, Ordering::Relaxed);
    }

    pub(super) fn enabled() -> bool {
        DISABLE_DEPTH.load(Ordering::Relaxed) == 0
    }
}

