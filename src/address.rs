//! The translation surface between page descriptors, physical addresses and
//! kernel virtual addresses.
//!
//! Every conversion is total and checked: bad input logs an error and comes
//! back as a typed [`MemError`] instead of panicking. This is the defensive
//! boundary between the allocator and code that may have computed a wrong
//! address.

use crate::error::MemError;
use crate::mem_map::MemoryMap;
use crate::page_alloc::PageDescPtr;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;
use strix_log::{pr_err, pr_info, pr_warn};
use strix_mm::address::{AddrOps as _, PAddr, VAddr};
use strix_mm::paging::PFN;

impl MemoryMap {
    /// Whether translation still runs over the boot loader's single linear
    /// low-memory mapping.
    pub fn is_boot_mapping(&self) -> bool {
        self.boot_mapping.load(Ordering::Relaxed)
    }

    /// Switch from the bootstrap linear mapping to per-zone translation.
    ///
    /// One-way. The page-table module must have the per-zone kernel
    /// mappings installed before the switch, and the virtual-mapping arena
    /// must not be used until after it.
    pub fn switch_to_zone_mapping(&self) {
        if self.boot_mapping.swap(false, Ordering::Relaxed) {
            pr_info!("address translation switched to per-zone mapping");
        } else {
            pr_warn!("switch_to_zone_mapping: already switched");
        }
    }

    /// Physical address of the frame `page` describes.
    pub fn page_to_phys(&self, page: PageDescPtr) -> Result<PAddr, MemError> {
        match self.table.checked_pfn_of(page) {
            Some(pfn) => Ok(PAddr::from(pfn)),
            None => {
                pr_err!("page_to_phys: descriptor outside the page table");
                Err(MemError::OutOfRange)
            }
        }
    }

    /// Descriptor for the frame at physical address `paddr`.
    pub fn phys_to_page(&self, paddr: PAddr) -> Result<PageDescPtr, MemError> {
        if !paddr.is_page_aligned() {
            pr_err!("phys_to_page: {:?} is not page aligned", paddr);
            return Err(MemError::Unaligned);
        }

        let pfn = PFN::from(paddr);
        match self.table.desc(pfn) {
            Some(desc) => Ok(desc),
            None => {
                pr_err!("phys_to_page: {:?} outside every known range", paddr);
                Err(MemError::OutOfRange)
            }
        }
    }

    /// Kernel virtual address of a directly mapped page.
    ///
    /// High-memory pages have no permanent kernel mapping; asking for one
    /// reports [`MemError::NoDirectMapping`], directing the caller to a
    /// temporary mapping.
    pub fn page_to_virt(&self, page: PageDescPtr) -> Result<VAddr, MemError> {
        let Some(pfn) = self.table.checked_pfn_of(page) else {
            pr_err!("page_to_virt: descriptor outside the page table");
            return Err(MemError::OutOfRange);
        };
        let paddr = PAddr::from(pfn);

        if self.is_boot_mapping() {
            // One linear window from the kernel image through low-mem end.
            if self.lowmem.phys.contains(paddr) {
                return Ok(self.table.virt_of(pfn));
            }
            if self.highmem.phys.contains(paddr) {
                pr_err!("page_to_virt: {:?} outside the bootstrap mapping", paddr);
                return Err(MemError::NoDirectMapping);
            }
            pr_err!("page_to_virt: {:?} outside every known range", paddr);
            return Err(MemError::OutOfRange);
        }

        if self.lowmem.phys.contains(paddr) {
            let virt = self.lowmem.virt.expect("low memory is directly mapped");
            return Ok(virt.start() + (paddr - self.lowmem.phys.start()));
        }
        if self.highmem.phys.contains(paddr) {
            pr_err!(
                "page_to_virt: {:?} is high memory, no permanent mapping, use a temporary mapping",
                paddr,
            );
            return Err(MemError::NoDirectMapping);
        }

        pr_err!("page_to_virt: {:?} outside every known range", paddr);
        Err(MemError::OutOfRange)
    }

    /// Descriptor for the page backing a kernel virtual address.
    pub fn virt_to_page(&self, vaddr: VAddr) -> Result<PageDescPtr, MemError> {
        let paddr = self.virt_to_phys(vaddr.floor())?;
        self.table.desc(PFN::from(paddr)).ok_or_else(|| {
            pr_err!("virt_to_page: {:?} has no descriptor", vaddr);
            MemError::OutOfRange
        })
    }

    /// Physical address behind a directly mapped kernel virtual address.
    pub fn virt_to_phys(&self, vaddr: VAddr) -> Result<PAddr, MemError> {
        let virt = self
            .lowmem
            .virt
            .expect("low memory is directly mapped");

        if virt.contains(vaddr) {
            return Ok(self.lowmem.phys.start() + (vaddr - virt.start()));
        }
        if let Some(high_virt) = self.highmem.virt {
            if high_virt.contains(vaddr) {
                return Ok(self.highmem.phys.start() + (vaddr - high_virt.start()));
            }
        }

        pr_err!("virt_to_phys: {:?} outside every known range", vaddr);
        Err(MemError::OutOfRange)
    }

    /// Whether `vaddr` falls inside a known kernel mapping window.
    pub fn is_valid_virtual_address(&self, vaddr: VAddr) -> bool {
        self.lowmem.virt.is_some_and(|range| range.contains(vaddr))
            || self.highmem.virt.is_some_and(|range| range.contains(vaddr))
    }

    /// Kernel pointer to a directly mapped physical address.
    pub fn phys_ptr(&self, paddr: PAddr) -> Result<NonNull<u8>, MemError> {
        if self.lowmem.phys.contains(paddr) {
            let virt = self.lowmem.virt.expect("low memory is directly mapped");
            let vaddr = virt.start() + (paddr - self.lowmem.phys.start());
            return Ok(vaddr.as_ptr());
        }

        if self.highmem.phys.contains(paddr) {
            pr_err!("phys_ptr: {:?} is high memory, not directly mapped", paddr);
            return Err(MemError::NoDirectMapping);
        }
        pr_err!("phys_ptr: {:?} outside every known range", paddr);
        Err(MemError::OutOfRange)
    }
}
