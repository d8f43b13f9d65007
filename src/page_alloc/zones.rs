use super::raw_page::{FrameTable, PageDescPtr, PageFlags};
use crate::error::MemError;
use bitflags::bitflags;
use buddy_allocator::{BuddyRawPage as _, BuddyZone, PageCache, MAX_ORDER};
use core::fmt;
use strix_mm::paging::{PAGE_SIZE, PFN};
use strix_sync::Spin;

bitflags! {
    /// Allocation-intent tokens. The core only uses them to pick a zone;
    /// `ATOMIC`, `NOFS`, `NOIO` and `NOWAIT` communicate constraints to
    /// collaborators elsewhere in the kernel and behave like `KERNEL` here.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct GfpFlags: u32 {
        const KERNEL = 1 << 0;
        const ATOMIC = 1 << 1;
        const NOFS = 1 << 2;
        const NOIO = 1 << 3;
        const NOWAIT = 1 << 4;
        const HIGHUSER = 1 << 5;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZoneId {
    Normal,
    HighMem,
}

/// The enumerated flag-to-zone mapping. Anything outside the recognized
/// token set is an error, as is mixing `HIGHUSER` with low-memory tokens.
pub fn zone_for(flags: GfpFlags) -> Result<ZoneId, MemError> {
    if flags.is_empty() || flags.bits() & !GfpFlags::all().bits() != 0 {
        return Err(MemError::InvalidFlags);
    }

    if flags.contains(GfpFlags::HIGHUSER) {
        if flags == GfpFlags::HIGHUSER {
            Ok(ZoneId::HighMem)
        } else {
            Err(MemError::InvalidFlags)
        }
    } else {
        Ok(ZoneId::Normal)
    }
}

struct ZoneInner {
    buddy: BuddyZone<PageDescPtr>,
    cache: Option<PageCache<PageDescPtr>>,
    free_pages: usize,
}

/// One zone: a named slice of the descriptor table with a dedicated buddy
/// instance and, for `Normal`, the order-0 page cache.
pub struct MemZone {
    name: &'static str,
    start_pfn: usize,
    page_count: usize,
    inner: Spin<ZoneInner>,
}

impl MemZone {
    pub(crate) fn new(name: &'static str, with_cache: bool) -> Self {
        Self {
            name,
            start_pfn: 0,
            page_count: 0,
            inner: Spin::new(ZoneInner {
                buddy: BuddyZone::new(name),
                cache: with_cache.then(PageCache::new),
                free_pages: 0,
            }),
        }
    }

    /// Attach the zone to its descriptor slice and seed the buddy.
    ///
    /// `page_count` must already be rounded to a top-order multiple; the
    /// buddy refuses anything else.
    pub(crate) fn init(&mut self, table: &FrameTable, start_pfn: PFN, page_count: usize) {
        let base = table
            .desc(start_pfn)
            .expect("zone start outside the descriptor table");

        self.start_pfn = usize::from(start_pfn);
        self.page_count = page_count;

        let inner = self.inner.get_mut();
        // SAFETY: The descriptor slice [start_pfn, start_pfn + page_count)
        //         was just validated against the table.
        unsafe { inner.buddy.init(base, page_count) };
        inner.free_pages = page_count;
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn start_pfn(&self) -> PFN {
        PFN::from(self.start_pfn)
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn bytes(&self) -> usize {
        self.page_count * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.page_count == 0
    }

    pub fn contains(&self, pfn: PFN) -> bool {
        let pfn = usize::from(pfn);
        pfn >= self.start_pfn && pfn < self.start_pfn + self.page_count
    }

    /// Allocate a `2^order` block. Order-0 requests go through the page
    /// cache when the zone carries one.
    pub(crate) fn alloc(&self, order: u32) -> Option<PageDescPtr> {
        let mut inner = self.inner.lock_irq();
        let inner = &mut *inner;

        let page = if order == 0 {
            match inner.cache.as_mut() {
                Some(cache) => cache.alloc(&mut inner.buddy),
                None => inner.buddy.alloc_pages(0),
            }
        } else {
            inner.buddy.alloc_pages(order)
        }?;

        inner.free_pages -= 1usize << order;
        Some(page)
    }

    /// Give a block back. The caller has already validated the descriptor
    /// and reset the reference counts.
    pub(crate) fn free(&self, page: PageDescPtr, order: u32) {
        let mut inner = self.inner.lock_irq();
        let inner = &mut *inner;

        if order == 0 {
            match inner.cache.as_mut() {
                Some(cache) => cache.free(&mut inner.buddy, page),
                None => inner.buddy.free_pages(page),
            }
        } else {
            inner.buddy.free_pages(page);
        }

        inner.free_pages += 1usize << order;
    }

    /// Free pages as the zone façade counts them: buddy free lists plus the
    /// order-0 cache.
    pub fn free_pages_count(&self) -> usize {
        self.inner.lock_irq().free_pages
    }

    /// Pages parked in the order-0 cache, reported separately so the
    /// memory-clean predicate stays checkable with the cache enabled.
    pub fn cached_pages(&self) -> usize {
        self.inner
            .lock_irq()
            .cache
            .as_ref()
            .map_or(0, |cache| cache.cached_pages())
    }

    /// Per-order free-block counts of the underlying buddy.
    pub fn buddy_snapshot(&self) -> [usize; MAX_ORDER] {
        self.inner.lock_irq().buddy.snapshot()
    }

    /// Flush the order-0 cache back into the buddy, so buddy-level
    /// snapshots compare exactly.
    pub fn drain_cache(&self) {
        let mut inner = self.inner.lock_irq();
        let inner = &mut *inner;
        if let Some(cache) = inner.cache.as_mut() {
            cache.drain(&mut inner.buddy);
        }
    }

    pub fn write_status(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        let inner = self.inner.lock_irq();
        inner.buddy.write_status(w)?;
        writeln!(w, "  cached pages: {}", inner.cache.as_ref().map_or(0, |c| c.cached_pages()))?;
        writeln!(w, "  zone free pages: {}", inner.free_pages)
    }

    /// Debug aid: every descriptor of the zone that is currently a free
    /// block head keeps the flag pair the free lists maintain.
    #[cfg(debug_assertions)]
    pub(crate) fn assert_flag_discipline(&self, table: &FrameTable) {
        let _guard = self.inner.lock_irq();

        for index in 0..self.page_count {
            let pfn = PFN::from(self.start_pfn + index);
            let desc = table.desc(pfn).expect("zone inside table");
            if desc.is_free() {
                assert!(desc.is_head(), "free page without HEAD at {:?}", pfn);
            }
        }
    }
}
