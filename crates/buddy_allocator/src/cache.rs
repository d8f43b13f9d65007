use crate::{BuddyRawPage, BuddyZone};
use core::marker::PhantomData;
use intrusive_list::List;

/// Refill the cache up to this size when it runs below the low watermark.
pub const CACHE_WATERMARK_MID: usize = 32;
/// Bulk-refill from the buddy when fewer pages than this are cached.
pub const CACHE_WATERMARK_LOW: usize = 8;
/// Bulk-free down to the mid watermark when more pages than this are cached.
pub const CACHE_WATERMARK_HIGH: usize = 64;

/// A free list of order-0 blocks layered above a buddy instance, amortizing
/// free-list traversal for the dominant single-page case.
///
/// Cached pages are allocated as far as the buddy is concerned: their `FREE`
/// bit is clear and they sit on no buddy free list. While parked they carry
/// the `CACHED` flag and a zero reference count, and the introspection
/// surface reports them separately.
pub struct PageCache<R: BuddyRawPage> {
    list: List,
    _marker: PhantomData<R>,
}

// SAFETY: Same reasoning as for the zone: the list links into descriptors
//         owned by the zone's creator, serialized by the owner's lock.
unsafe impl<R: BuddyRawPage> Send for PageCache<R> {}

impl<R: BuddyRawPage> PageCache<R> {
    pub const fn new() -> Self {
        Self {
            list: List::new(),
            _marker: PhantomData,
        }
    }

    /// Pages currently held by the cache.
    pub const fn cached_pages(&self) -> usize {
        self.list.count()
    }

    /// Take one order-0 block, bulk-refilling from the buddy first when the
    /// cache has run below the low watermark.
    pub fn alloc(&mut self, buddy: &mut BuddyZone<R>) -> Option<R> {
        if self.list.count() < CACHE_WATERMARK_LOW {
            while self.list.count() < CACHE_WATERMARK_MID {
                let Some(page) = buddy.alloc_pages(0) else {
                    break;
                };
                page.set_cached();
                // SAFETY: We hold the zone lock; the link is unaliased.
                self.list.insert(unsafe { page.get_link() });
            }
        }

        self.list.pop().map(|link| {
            // SAFETY: Only order-0 block heads are ever inserted here.
            let page = unsafe { R::from_link(link) };
            page.clear_cached();
            page
        })
    }

    /// Return one order-0 block, bulk-freeing down to the mid watermark when
    /// the cache has grown past the high watermark.
    pub fn free(&mut self, buddy: &mut BuddyZone<R>, page: R) {
        debug_assert!(page.is_head() && !page.is_free() && page.order() == 0);

        page.set_cached();
        // SAFETY: We hold the zone lock; the link is unaliased.
        self.list.insert(unsafe { page.get_link() });

        if self.list.count() > CACHE_WATERMARK_HIGH {
            while self.list.count() > CACHE_WATERMARK_MID {
                let Some(link) = self.list.pop() else { break };
                // SAFETY: As above.
                let page = unsafe { R::from_link(link) };
                page.clear_cached();
                buddy.free_pages(page);
            }
        }
    }

    /// Flush every cached page back to the buddy.
    pub fn drain(&mut self, buddy: &mut BuddyZone<R>) {
        while let Some(link) = self.list.pop() {
            // SAFETY: As above.
            let page = unsafe { R::from_link(link) };
            page.clear_cached();
            buddy.free_pages(page);
        }
    }
}
