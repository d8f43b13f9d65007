//! The zone façade: allocation-flag resolution, multi-page allocate and
//! free with reference-count bookkeeping, and per-zone introspection.

mod raw_page;
mod zones;

pub use raw_page::{FrameTable, PageDesc, PageDescPtr, PageFlags, SlabOwner};
pub use zones::{zone_for, GfpFlags, MemZone, ZoneId};

use crate::error::MemError;
use crate::mem_map::MemoryMap;
use buddy_allocator::{BuddyRawPage as _, MAX_ORDER};
use core::fmt;
use core::panic::Location;
use strix_log::{pr_err, pr_trace};
use strix_mm::address::VAddr;
use strix_mm::paging::{PAGE_SIZE, PFN};

impl MemoryMap {
    pub fn zone(&self, id: ZoneId) -> &MemZone {
        match id {
            ZoneId::Normal => &self.zones[0],
            ZoneId::HighMem => &self.zones[1],
        }
    }

    fn zone_of(&self, pfn: PFN) -> Option<&MemZone> {
        self.zones.iter().find(|zone| zone.contains(pfn))
    }

    /// Allocate a block of `2^order` pages from the zone `flags` selects.
    ///
    /// Every descriptor in the block gets a reference count of 1. Returns
    /// `None` on capacity failure, on an unrecognized flag set, or on an
    /// order the buddy cannot serve.
    #[track_caller]
    pub fn alloc_pages(&self, flags: GfpFlags, order: u32) -> Option<PageDescPtr> {
        let zone_id = match zone_for(flags) {
            Ok(zone_id) => zone_id,
            Err(err) => {
                pr_err!("alloc_pages: {} ({:?})", err, flags);
                return None;
            }
        };
        if order as usize >= MAX_ORDER {
            pr_err!("alloc_pages: order {} above the buddy maximum", order);
            return None;
        }

        let zone = self.zone(zone_id);
        let head = zone.alloc(order)?;

        for index in 0..1usize << order {
            // SAFETY: The block spans 2^order descriptors from its head.
            unsafe { head.offset(index) }.set_ref(1);
        }

        let caller = Location::caller();
        pr_trace!(
            "alloc_pages order {} -> pfn {:?} [{}] ({}:{})",
            order,
            self.table.pfn_of(head),
            zone.name(),
            caller.file(),
            caller.line(),
        );
        Some(head)
    }

    /// Free a block previously returned by [`alloc_pages`].
    ///
    /// The zone is recovered by scanning for descriptor containment; the
    /// descriptor must head an allocated block. A double free is detected
    /// and reported without touching the free lists.
    ///
    /// [`alloc_pages`]: Self::alloc_pages
    #[track_caller]
    pub fn free_pages(&self, page: Option<PageDescPtr>) -> Result<(), MemError> {
        let Some(page) = page else {
            pr_err!("free_pages: null page");
            return Err(MemError::NullPointer);
        };

        let Some(pfn) = self.table.checked_pfn_of(page) else {
            pr_err!("free_pages: descriptor outside the page table");
            return Err(MemError::OutOfRange);
        };
        let Some(zone) = self.zone_of(pfn) else {
            pr_err!("free_pages: pfn {:?} belongs to no zone", pfn);
            return Err(MemError::OutOfRange);
        };

        if page.is_free() || page.ref_count() == 0 {
            pr_err!("free_pages: double free of pfn {:?}", pfn);
            return Err(MemError::DoubleFree);
        }
        if !page.is_head() {
            pr_err!("free_pages: pfn {:?} is not a block head", pfn);
            return Err(MemError::NotBlockHead);
        }

        let order = page.order();
        for index in 0..1usize << order {
            // SAFETY: The block spans 2^order descriptors from its head.
            unsafe { page.offset(index) }.set_ref(0);
        }
        zone.free(page, order);

        let caller = Location::caller();
        pr_trace!(
            "free_pages order {} pfn {:?} [{}] ({}:{})",
            order,
            pfn,
            zone.name(),
            caller.file(),
            caller.line(),
        );
        Ok(())
    }

    /// Allocate low-memory pages and hand back their kernel virtual
    /// address. Only flags resolving to the `Normal` zone are valid.
    #[track_caller]
    pub fn alloc_pages_lowmem(&self, flags: GfpFlags, order: u32) -> Option<VAddr> {
        match zone_for(flags) {
            Ok(ZoneId::Normal) => {}
            Ok(ZoneId::HighMem) => {
                pr_err!("alloc_pages_lowmem: high-memory flags have no direct mapping");
                return None;
            }
            Err(err) => {
                pr_err!("alloc_pages_lowmem: {} ({:?})", err, flags);
                return None;
            }
        }

        let head = self.alloc_pages(flags, order)?;
        match self.page_to_virt(head) {
            Ok(vaddr) => Some(vaddr),
            Err(_) => {
                // Cannot happen for Normal-zone pages; don't leak if it does.
                let _ = self.free_pages(Some(head));
                None
            }
        }
    }

    /// Allocate zeroed low-memory pages.
    #[track_caller]
    pub fn alloc_zeroed_pages(&self, flags: GfpFlags, order: u32) -> Option<VAddr> {
        let vaddr = self.alloc_pages_lowmem(flags, order)?;
        // SAFETY: The block is ours and spans 2^order pages.
        unsafe {
            core::ptr::write_bytes(vaddr.as_ptr::<u8>().as_ptr(), 0, PAGE_SIZE << order);
        }
        Some(vaddr)
    }

    /// Free a low-memory block by its kernel virtual address.
    #[track_caller]
    pub fn free_pages_lowmem(&self, vaddr: VAddr) -> Result<(), MemError> {
        let page = self.virt_to_page(vaddr)?;
        self.free_pages(Some(page))
    }

    pub fn zone_total_space(&self, flags: GfpFlags) -> Result<usize, MemError> {
        Ok(self.zone(zone_for(flags)?).bytes())
    }

    pub fn zone_free_space(&self, flags: GfpFlags) -> Result<usize, MemError> {
        Ok(self.zone(zone_for(flags)?).free_pages_count() * PAGE_SIZE)
    }

    pub fn zone_cached_space(&self, flags: GfpFlags) -> Result<usize, MemError> {
        Ok(self.zone(zone_for(flags)?).cached_pages() * PAGE_SIZE)
    }

    /// Write the selected zone's per-order free-area counts into `w`.
    pub fn zone_buddy_status(
        &self,
        flags: GfpFlags,
        w: &mut dyn fmt::Write,
    ) -> Result<(), MemError> {
        let zone = self.zone(zone_for(flags)?);
        // Sinks that can fail mid-dump still got a valid prefix.
        let _ = zone.write_status(w);
        Ok(())
    }
}
