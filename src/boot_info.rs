use strix_mm::address::{PRange, VAddr};

/// The memory handoff record the boot loader passes to the kernel.
///
/// The core treats it as immutable. The loader guarantees that low memory is
/// linearly mapped at `lowmem_virt_base` before handing control over; the
/// memory map keeps using that single linear mapping until the kernel
/// switches to per-zone translation.
#[derive(Clone, Copy, Debug)]
pub struct BootInfo {
    /// Physical extent of low (directly mappable) memory.
    pub lowmem: PRange,
    /// Physical extent of high memory. May be empty on small machines.
    pub highmem: PRange,
    /// Physical extent of the loaded kernel image. Usable low memory starts
    /// after it.
    pub kernel_image: PRange,
    /// Kernel virtual address of `lowmem.start()`.
    pub lowmem_virt_base: VAddr,
}
