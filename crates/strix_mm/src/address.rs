mod addr;
mod addr_range;
mod paddr;
mod vaddr;

pub use addr::{Addr, AddrOps};
pub use addr_range::AddrRange;
pub use paddr::PAddr;
pub use vaddr::VAddr;

pub type PRange = AddrRange<PAddr>;
pub type VRange = AddrRange<VAddr>;
