//! The virtual-mapping arena: a buddy instance over a reserved kernel
//! virtual window, handing out virtual page runs independent of physical
//! allocation.
//!
//! The arena never owns the physical frames it maps; callers supply them.
//! Page-table mutation is delegated to the external [`PageTableOps`]
//! module, and a run moves `unreserved -> reserved -> mapped` and back as
//! mappings are installed and cleared.

use crate::error::MemError;
use crate::mem_map::MemoryMap;
use crate::page_alloc::{PageDescPtr, PageFlags};
use crate::page_table::{PageTableOps, PteFlags};
use align_ext::AlignExt;
use buddy_allocator::{BuddyRawPage, BuddyZone, MAX_ORDER};
use core::marker::PhantomData;
use core::panic::Location;
use core::ptr::NonNull;
use intrusive_list::{container_of, Link};
use strix_log::{pr_err, pr_trace};
use strix_mm::address::{AddrOps as _, VAddr, VRange};
use strix_mm::paging::{PAGE_SIZE, PFN};
use strix_sync::Spin;

/// Bound on the scratch windows the cross-address-space copy maps at once.
pub const VMEMCPY_WINDOW_PAGES: usize = 16;

const VMAP_PTE_FLAGS: PteFlags = PteFlags::PRESENT
    .union(PteFlags::WRITE)
    .union(PteFlags::GLOBAL)
    .union(PteFlags::UPDATE_ADDR);

/// A pure address-space reservation record: one page of the arena window.
/// Carries no reference count; its index yields its virtual address.
pub struct VirtPage {
    link: Link,
    order: u32,
    flags: PageFlags,
}

impl VirtPage {
    pub const fn new() -> Self {
        Self {
            link: Link::new(),
            order: 0,
            flags: PageFlags::new(),
        }
    }
}

impl Default for VirtPage {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct VirtPagePtr(NonNull<VirtPage>);

impl VirtPagePtr {
    fn as_ref<'a>(self) -> &'a VirtPage {
        unsafe { &*self.0.as_ptr() }
    }

    #[allow(clippy::mut_from_ref)]
    fn as_mut<'a>(self) -> &'a mut VirtPage {
        unsafe { &mut *self.0.as_ptr() }
    }
}

impl BuddyRawPage for VirtPagePtr {
    unsafe fn from_link(link: &mut Link) -> Self {
        Self(unsafe { container_of!(link, VirtPage, link) })
    }

    unsafe fn get_link(&self) -> &mut Link {
        &mut self.as_mut().link
    }

    fn order(&self) -> u32 {
        self.as_ref().order
    }

    fn set_order(&self, order: u32) {
        self.as_mut().order = order;
    }

    fn is_free(&self) -> bool {
        self.as_ref().flags.has(PageFlags::FREE)
    }

    fn set_free(&self) {
        self.as_ref().flags.set(PageFlags::FREE);
    }

    fn clear_free(&self) {
        self.as_ref().flags.clear(PageFlags::FREE);
    }

    fn is_head(&self) -> bool {
        self.as_ref().flags.has(PageFlags::HEAD)
    }

    fn set_head(&self) {
        self.as_ref().flags.set(PageFlags::HEAD);
    }

    fn clear_head(&self) {
        self.as_ref().flags.clear(PageFlags::HEAD);
    }

    // The arena never layers a page cache over its window, but the
    // reservation records keep the full descriptor contract.
    fn is_cached(&self) -> bool {
        self.as_ref().flags.has(PageFlags::CACHED)
    }

    fn set_cached(&self) {
        self.as_ref().flags.set(PageFlags::CACHED);
    }

    fn clear_cached(&self) {
        self.as_ref().flags.clear(PageFlags::CACHED);
    }

    unsafe fn offset(&self, count: usize) -> Self {
        Self(unsafe { self.0.add(count) })
    }

    unsafe fn index_from(&self, base: Self) -> usize {
        unsafe { self.0.as_ptr().offset_from(base.0.as_ptr()) as usize }
    }
}

/// The arena itself. Reentrant: it keeps no per-operation state, only the
/// locked buddy over the window.
pub struct VmapArena<'a, P: PageTableOps> {
    base: VAddr,
    pages: NonNull<VirtPage>,
    page_count: usize,
    buddy: Spin<BuddyZone<VirtPagePtr>>,
    map: &'a MemoryMap,
    pt: P,
    _storage: PhantomData<&'a mut [VirtPage]>,
}

// SAFETY: The reservation records are exclusively owned by the arena and
//         only mutated under its buddy lock.
unsafe impl<P: PageTableOps + Send> Send for VmapArena<'_, P> {}
unsafe impl<P: PageTableOps + Sync> Sync for VmapArena<'_, P> {}

impl<'a, P: PageTableOps> VmapArena<'a, P> {
    /// Build the arena over the window starting at `base`, with one record
    /// per window page. The window must be page aligned and, like any buddy
    /// run, a whole number of top-order blocks.
    pub fn new(base: VAddr, storage: &'a mut [VirtPage], map: &'a MemoryMap, pt: P) -> Self {
        assert!(base.is_page_aligned(), "vmap window base not page aligned");
        assert!(!storage.is_empty(), "vmap window is empty");

        let page_count = storage.len();
        let pages = NonNull::new(storage.as_mut_ptr()).expect("storage is non-empty");

        let mut buddy = BuddyZone::new("vmap");
        // SAFETY: `storage` hands the arena exclusive ownership of the
        //         records for 'a.
        unsafe { buddy.init(VirtPagePtr(pages), page_count) };

        Self {
            base,
            pages,
            page_count,
            buddy: Spin::new(buddy),
            map,
            pt,
            _storage: PhantomData,
        }
    }

    pub fn window(&self) -> VRange {
        VRange::from(self.base).grow(self.page_count * PAGE_SIZE)
    }

    pub fn page_table(&self) -> &P {
        &self.pt
    }

    /// Virtual address of a reservation record: base + index * PAGE_SIZE.
    pub fn addr_of(&self, vdesc: VirtPagePtr) -> VAddr {
        // SAFETY: The record comes from this arena's storage.
        let index = unsafe { vdesc.index_from(VirtPagePtr(self.pages)) };
        debug_assert!(index < self.page_count);
        self.base + index * PAGE_SIZE
    }

    fn desc_at(&self, vaddr: VAddr) -> Option<VirtPagePtr> {
        if !self.window().contains(vaddr) {
            return None;
        }
        let index = (vaddr.floor() - self.base) / PAGE_SIZE;
        // SAFETY: In-window by the check above.
        Some(unsafe { VirtPagePtr(self.pages).offset(index) })
    }

    /// Reserve a run of virtual pages covering `size` bytes. No page-table
    /// state is touched; the caller owns the mapping decision.
    #[track_caller]
    pub fn vmap_alloc(&self, size: usize) -> Option<VirtPagePtr> {
        if size == 0 {
            pr_err!("vmap_alloc: zero size");
            return None;
        }

        let pages = size.div_ceil(PAGE_SIZE);
        let order = pages.next_power_of_two().trailing_zeros();
        if order as usize >= MAX_ORDER {
            pr_err!("vmap_alloc: {} pages above the arena maximum", pages);
            return None;
        }

        let vdesc = self.buddy.lock_irq().alloc_pages(order)?;
        let caller = Location::caller();
        pr_trace!(
            "vmap_alloc {} pages -> {:?} ({}:{})",
            pages,
            self.addr_of(vdesc),
            caller.file(),
            caller.line(),
        );
        Some(vdesc)
    }

    /// Reserve `count` virtual pages and map them onto the contiguous
    /// physical block headed by `page`. The combined fast path of the run
    /// state machine: unreserved straight to mapped.
    #[track_caller]
    pub fn vmap_physical(&self, page: PageDescPtr, count: usize) -> Option<VAddr> {
        if count == 0 {
            pr_err!("vmap_physical: zero page count");
            return None;
        }

        let paddr = self.map.page_to_phys(page).ok()?;
        let last_pfn = PFN::from(paddr) + (count - 1);
        if !self.map.frame_table().contains(last_pfn) {
            pr_err!("vmap_physical: {} pages from {:?} leave the frame table", count, paddr);
            return None;
        }

        let vdesc = self.vmap_alloc(count * PAGE_SIZE)?;
        let vaddr = self.addr_of(vdesc);
        let range = VRange::from(vaddr).grow(count * PAGE_SIZE);

        match self
            .pt
            .update_area(self.pt.kernel_dir(), range, Some(paddr), VMAP_PTE_FLAGS)
        {
            Ok(()) => Some(vaddr),
            Err(err) => {
                pr_err!("vmap_physical: page table refused {:?}: {}", range, err);
                self.buddy.lock_irq().free_pages(vdesc);
                None
            }
        }
    }

    /// Clone the page-table entries backing `src..src + size` in `src_dir`
    /// onto the reserved run `vdesc`, establishing a temporary window onto
    /// another address space. Returns the window address of `src`.
    pub fn vmap_into(
        &self,
        src_dir: P::Dir,
        vdesc: VirtPagePtr,
        src: VAddr,
        size: usize,
    ) -> Option<VAddr> {
        if size == 0 {
            pr_err!("vmap_into: zero size");
            return None;
        }

        let offset = src.page_offset();
        let span = (offset + size).align_up(PAGE_SIZE);
        let run_bytes = PAGE_SIZE << vdesc.order();
        if span > run_bytes {
            pr_err!("vmap_into: {} bytes exceed the reserved run", size);
            return None;
        }

        let vaddr = self.addr_of(vdesc);
        match self.pt.clone_area(
            self.pt.kernel_dir(),
            vaddr,
            src_dir,
            src.floor(),
            span,
            VMAP_PTE_FLAGS,
        ) {
            Ok(()) => Some(vaddr + offset),
            Err(err) => {
                pr_err!("vmap_into: page table refused the clone: {}", err);
                None
            }
        }
    }

    /// Clear the run's page-table entries (keeping `GLOBAL`) and return its
    /// virtual pages to the arena.
    #[track_caller]
    pub fn vunmap(&self, vaddr: VAddr) -> Result<(), MemError> {
        let Some(vdesc) = self.desc_at(vaddr) else {
            pr_err!("vunmap: {:?} outside the arena window", vaddr);
            return Err(MemError::OutOfRange);
        };

        if vdesc.is_free() {
            pr_err!("vunmap: {:?} is already unreserved", vaddr);
            return Err(MemError::DoubleFree);
        }
        if !vdesc.is_head() {
            pr_err!("vunmap: {:?} is not the start of a mapping", vaddr);
            return Err(MemError::NotBlockHead);
        }

        let run_start = self.addr_of(vdesc);
        let run = VRange::from(run_start).grow(PAGE_SIZE << vdesc.order());
        self.pt
            .update_area(self.pt.kernel_dir(), run, None, PteFlags::GLOBAL)
            .map_err(|err| {
                pr_err!("vunmap: page table refused to clear {:?}: {}", run, err);
                MemError::from(err)
            })?;

        self.buddy.lock_irq().free_pages(vdesc);
        pr_trace!("vunmap {:?}", run_start);
        Ok(())
    }

    /// Copy `len` bytes from `src` in `src_dir` to `dst` in `dst_dir`,
    /// chunked through two bounded scratch windows. The canonical
    /// cross-address-space copy primitive.
    pub fn vmemcpy(
        &self,
        dst_dir: P::Dir,
        dst: VAddr,
        src_dir: P::Dir,
        src: VAddr,
        len: usize,
    ) -> Result<(), MemError> {
        if len == 0 {
            return Ok(());
        }

        let window_bytes = VMEMCPY_WINDOW_PAGES * PAGE_SIZE;
        let src_win = self.vmap_alloc(window_bytes).ok_or(MemError::OutOfMemory)?;
        let src_win_addr = self.addr_of(src_win);
        let dst_win = match self.vmap_alloc(window_bytes) {
            Some(win) => win,
            None => {
                self.buddy.lock_irq().free_pages(src_win);
                return Err(MemError::OutOfMemory);
            }
        };
        let dst_win_addr = self.addr_of(dst_win);

        let result = self.vmemcpy_chunks(
            dst_dir,
            dst,
            src_dir,
            src,
            len,
            src_win_addr,
            dst_win_addr,
            window_bytes,
        );

        let src_teardown = self.vunmap(src_win_addr);
        let dst_teardown = self.vunmap(dst_win_addr);

        result.and(src_teardown).and(dst_teardown)
    }

    #[allow(clippy::too_many_arguments)]
    fn vmemcpy_chunks(
        &self,
        dst_dir: P::Dir,
        dst: VAddr,
        src_dir: P::Dir,
        src: VAddr,
        len: usize,
        src_win: VAddr,
        dst_win: VAddr,
        window_bytes: usize,
    ) -> Result<(), MemError> {
        let kernel_dir = self.pt.kernel_dir();
        let mut copied = 0;

        while copied < len {
            let src_addr = src + copied;
            let dst_addr = dst + copied;
            let src_off = src_addr.page_offset();
            let dst_off = dst_addr.page_offset();

            let chunk = (len - copied)
                .min(window_bytes - src_off)
                .min(window_bytes - dst_off);

            self.pt
                .clone_area(
                    kernel_dir,
                    src_win,
                    src_dir,
                    src_addr.floor(),
                    (src_off + chunk).align_up(PAGE_SIZE),
                    VMAP_PTE_FLAGS,
                )
                .map_err(MemError::from)?;
            self.pt
                .clone_area(
                    kernel_dir,
                    dst_win,
                    dst_dir,
                    dst_addr.floor(),
                    (dst_off + chunk).align_up(PAGE_SIZE),
                    VMAP_PTE_FLAGS,
                )
                .map_err(MemError::from)?;

            self.copy_through_windows(src_win + src_off, dst_win + dst_off, chunk)?;
            copied += chunk;
        }

        Ok(())
    }

    /// Byte copy between two mapped kernel windows, page by page through
    /// the page-table module's accessor.
    fn copy_through_windows(&self, src: VAddr, dst: VAddr, len: usize) -> Result<(), MemError> {
        let kernel_dir = self.pt.kernel_dir();
        let mut done = 0;

        while done < len {
            let s = src + done;
            let d = dst + done;
            let run = (len - done)
                .min(PAGE_SIZE - s.page_offset())
                .min(PAGE_SIZE - d.page_offset());

            let s_ptr = self
                .pt
                .window_ptr(kernel_dir, s)
                .ok_or(MemError::NotMapped)?;
            let d_ptr = self
                .pt
                .window_ptr(kernel_dir, d)
                .ok_or(MemError::NotMapped)?;

            // SAFETY: Both windows are mapped for at least `run` bytes; the
            //         ranges may alias the same frame, so use a memmove.
            unsafe { core::ptr::copy(s_ptr.as_ptr(), d_ptr.as_ptr(), run) };
            done += run;
        }

        Ok(())
    }

    /// Free window pages, for the arena round-trip checks.
    pub fn free_pages_count(&self) -> usize {
        self.buddy.lock_irq().free_pages_count()
    }

    pub fn buddy_snapshot(&self) -> [usize; MAX_ORDER] {
        self.buddy.lock_irq().snapshot()
    }
}
