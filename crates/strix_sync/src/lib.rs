#![cfg_attr(not(test), no_std)]

pub mod irq;
mod once;
mod spin;

pub use once::Once;
pub use spin::{Spin, SpinGuard, SpinIrqGuard};
