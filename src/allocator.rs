//! The general-purpose kernel allocator: named slab caches bootstrapped
//! from a cache-of-caches, a power-of-two `kmalloc` family, and a raw-page
//! fallthrough for oversize requests.

use crate::error::MemError;
use crate::mem_map::MemoryMap;
use crate::page_alloc::{zone_for, GfpFlags, PageDescPtr, PageFlags, SlabOwner, ZoneId};
use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::fmt;
use core::hint;
use core::mem::{align_of, size_of};
use core::panic::Location;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, Ordering};
use buddy_allocator::BuddyRawPage as _;
use intrusive_list::{container_of, Link, List};
use slab_allocator::{ObjectCtor, ObjectDtor, SlabCache, SlabFrames, SlabInfo};
use strix_log::{pr_err, pr_trace};
use strix_mm::paging::PAGE_SIZE_BITS;
use strix_sync::Spin;

const KMALLOC_MIN_SHIFT: usize = 3;
const KMALLOC_MAX_SHIFT: usize = 12;

/// Smallest sized-cache object: also the minimum alignment `kmalloc`
/// guarantees for every request.
pub const KMALLOC_MIN_SIZE: usize = 1 << KMALLOC_MIN_SHIFT;
/// Largest request the sized caches serve; bigger ones fall through to
/// whole low-memory pages.
pub const KMALLOC_MAX_SIZE: usize = 1 << KMALLOC_MAX_SHIFT;

const NUM_SIZED_CACHES: usize = KMALLOC_MAX_SHIFT - KMALLOC_MIN_SHIFT + 1;

const SIZED_CACHE_NAMES: [&str; NUM_SIZED_CACHES] = [
    "kmalloc-8",
    "kmalloc-16",
    "kmalloc-32",
    "kmalloc-64",
    "kmalloc-128",
    "kmalloc-256",
    "kmalloc-512",
    "kmalloc-1024",
    "kmalloc-2048",
    "kmalloc-4096",
];

/// The slab backing over the zone façade: slab pages come from the
/// `Normal` zone and are tagged through the descriptor table so frees can
/// find their way back by pointer alone.
#[derive(Clone, Copy)]
pub(crate) struct KernelFrames<'a> {
    map: &'a MemoryMap,
}

impl SlabFrames for KernelFrames<'_> {
    type Raw = PageDescPtr;

    fn alloc_slab(&self, order: u32) -> Option<PageDescPtr> {
        let head = self.map.alloc_pages(GfpFlags::KERNEL, order)?;

        head.flags().set(PageFlags::SLAB);
        for index in 1..1usize << order {
            // SAFETY: The block spans 2^order descriptors from its head.
            let body = unsafe { head.offset(index) };
            body.flags().set(PageFlags::SLAB);
            body.as_mut().owner = SlabOwner::Body {
                head: NonNull::new(head.as_ptr()).expect("table descriptors are non-null"),
            };
        }
        Some(head)
    }

    unsafe fn release_slab(&self, slab: PageDescPtr) {
        let order = slab.order();
        for index in 0..1usize << order {
            // SAFETY: The block spans 2^order descriptors from its head.
            let desc = unsafe { slab.offset(index) };
            desc.flags().clear(PageFlags::SLAB);
            desc.as_mut().owner = SlabOwner::None;
        }

        self.map
            .free_pages(Some(slab))
            .expect("slab block was allocated from the zone façade");
    }

    fn slab_of(&self, ptr: NonNull<u8>) -> Option<(PageDescPtr, Option<NonNull<()>>)> {
        let desc = self.map.frame_table().desc_of_data(ptr)?;

        match desc.as_ref().owner {
            SlabOwner::Head { cache } => Some((desc, Some(cache))),
            SlabOwner::Body { head } => {
                let head = PageDescPtr::new(head);
                match head.as_ref().owner {
                    SlabOwner::Head { cache } => Some((head, Some(cache))),
                    _ => None,
                }
            }
            SlabOwner::None => None,
        }
    }

    fn set_owner(&self, slab: PageDescPtr, owner: Option<NonNull<()>>) {
        slab.as_mut().owner = match owner {
            Some(cache) => SlabOwner::Head { cache },
            None => SlabOwner::None,
        };
    }

    unsafe fn data_of(&self, slab: PageDescPtr) -> NonNull<u8> {
        let pfn = self.map.frame_table().pfn_of(slab);
        self.map
            .frame_table()
            .data_ptr(pfn)
            .expect("slab pages are low memory")
    }

    unsafe fn info_of(&self, slab: PageDescPtr) -> &mut SlabInfo {
        &mut slab.as_mut().slab
    }

    unsafe fn link_of(&self, slab: PageDescPtr) -> &mut Link {
        &mut slab.as_mut().link
    }

    unsafe fn from_link(&self, link: &mut Link) -> PageDescPtr {
        unsafe { <PageDescPtr as buddy_allocator::BuddyRawPage>::from_link(link) }
    }
}

/// A named object cache: the lockable wrapper the rest of the kernel sees,
/// and the unit the global cache registry links together.
pub struct KmemCache<'a> {
    inner: Spin<SlabCache<KernelFrames<'a>>>,
    /// Registry linkage. Guarded by the heap's registry lock.
    link: UnsafeCell<Link>,
    dynamic: bool,
}

// SAFETY: `link` is only touched under the registry lock; everything else
//         is behind the per-cache spinlock.
unsafe impl Send for KmemCache<'_> {}
unsafe impl Sync for KmemCache<'_> {}

impl<'a> KmemCache<'a> {
    fn new(
        name: &'static str,
        size: usize,
        align: usize,
        map: &'a MemoryMap,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectDtor>,
        dynamic: bool,
    ) -> Self {
        Self {
            inner: Spin::new(SlabCache::new_in(
                name,
                size,
                align,
                KernelFrames { map },
                ctor,
                dtor,
            )),
            link: UnsafeCell::new(Link::new()),
            dynamic,
        }
    }

    /// Allocate one object. Flags must resolve to the `Normal` zone; slab
    /// objects live behind the direct mapping.
    #[track_caller]
    pub fn alloc(&self, flags: GfpFlags) -> Option<NonNull<u8>> {
        match zone_for(flags) {
            Ok(ZoneId::Normal) => {}
            Ok(ZoneId::HighMem) => {
                pr_err!("cache_alloc: slab objects cannot live in high memory");
                return None;
            }
            Err(err) => {
                pr_err!("cache_alloc: {} ({:?})", err, flags);
                return None;
            }
        }

        let mut inner = self.inner.lock_irq();
        let object = inner.alloc()?;

        let caller = Location::caller();
        pr_trace!(
            "cache_alloc {} -> {:p} ({}:{})",
            inner.name(),
            object.as_ptr(),
            caller.file(),
            caller.line(),
        );
        Some(object)
    }

    /// Return one object to the cache.
    #[track_caller]
    pub fn free(&self, object: NonNull<u8>) {
        let mut inner = self.inner.lock_irq();
        inner.dealloc(object);

        let caller = Location::caller();
        pr_trace!(
            "cache_free {} {:p} ({}:{})",
            inner.name(),
            object.as_ptr(),
            caller.file(),
            caller.line(),
        );
    }

    pub fn name(&self) -> &'static str {
        self.inner.lock_irq().name()
    }

    pub fn object_size(&self) -> usize {
        self.inner.lock_irq().object_size()
    }

    pub fn total_objects(&self) -> usize {
        self.inner.lock_irq().total_objects()
    }

    pub fn free_objects(&self) -> usize {
        self.inner.lock_irq().free_objects()
    }

    /// Release retained free slabs back to the zone.
    pub fn shrink(&self) -> usize {
        self.inner.lock_irq().shrink()
    }

    /// # Safety
    /// Caller must hold the registry lock.
    #[allow(clippy::mut_from_ref)]
    unsafe fn registry_link(&self) -> &mut Link {
        unsafe { &mut *self.link.get() }
    }
}

const HEAP_UNINIT: u8 = 0;
const HEAP_BUSY: u8 = 1;
const HEAP_READY: u8 = 2;

/// The kernel heap: the meta-cache, the sized `kmalloc` caches, and the
/// registry of every live cache.
///
/// The heap hands out pointers into itself as owner tokens, so it must not
/// move after first use; keep it in a static or behind a stable allocation.
pub struct KernelHeap<'a> {
    map: &'a MemoryMap,
    /// Cache-of-caches: descriptors for dynamically created caches.
    meta: KmemCache<'a>,
    sized: [KmemCache<'a>; NUM_SIZED_CACHES],
    registry: Spin<List>,
    init_state: AtomicU8,
}

impl<'a> KernelHeap<'a> {
    pub fn new(map: &'a MemoryMap) -> Self {
        Self {
            map,
            meta: KmemCache::new(
                "kmem_cache",
                size_of::<KmemCache<'a>>(),
                align_of::<KmemCache<'a>>(),
                map,
                None,
                None,
                false,
            ),
            sized: core::array::from_fn(|index| {
                KmemCache::new(
                    SIZED_CACHE_NAMES[index],
                    1 << (KMALLOC_MIN_SHIFT + index),
                    8,
                    map,
                    None,
                    None,
                    false,
                )
            }),
            registry: Spin::new(List::new()),
            init_state: AtomicU8::new(HEAP_UNINIT),
        }
    }

    /// Lazy owner-token wiring: tokens are addresses of the built-in cache
    /// wrappers, so they can only be taken once the heap sits at its final
    /// address.
    fn ensure_init(&self) {
        match self.init_state.compare_exchange(
            HEAP_UNINIT,
            HEAP_BUSY,
            Ordering::Acquire,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                let mut registry = self.registry.lock_irq();
                for cache in core::iter::once(&self.meta).chain(self.sized.iter()) {
                    let token = NonNull::from(cache).cast::<()>();
                    cache.inner.lock_irq().set_owner(token);
                    // SAFETY: We hold the registry lock.
                    registry.insert(unsafe { cache.registry_link() });
                }
                drop(registry);
                self.init_state.store(HEAP_READY, Ordering::Release);
            }
            Err(HEAP_BUSY) => {
                while self.init_state.load(Ordering::Acquire) != HEAP_READY {
                    hint::spin_loop();
                }
            }
            Err(_) => {}
        }
    }

    /// Create a named cache. The descriptor comes from the meta-cache and
    /// an initial slab is grown so the first allocation is O(1).
    pub fn cache_create(
        &self,
        name: &'static str,
        size: usize,
        align: usize,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectDtor>,
    ) -> Option<NonNull<KmemCache<'a>>> {
        self.ensure_init();

        let raw = self.meta.alloc(GfpFlags::KERNEL)?;
        let cache = raw.cast::<KmemCache<'a>>();

        // SAFETY: Fresh meta-cache object of the right size and alignment.
        unsafe {
            cache.write(KmemCache::new(name, size, align, self.map, ctor, dtor, true));
        }
        let cache_ref = unsafe { cache.as_ref() };

        cache_ref.inner.lock_irq().set_owner(cache.cast());
        cache_ref.inner.lock_irq().grow(1);

        let mut registry = self.registry.lock_irq();
        // SAFETY: We hold the registry lock.
        registry.insert(unsafe { cache_ref.registry_link() });
        Some(cache)
    }

    /// Tear a named cache down and return its descriptor to the meta-cache.
    /// Every object must already be freed.
    pub fn cache_destroy(&self, cache: NonNull<KmemCache<'a>>) {
        let cache_ref = unsafe { cache.as_ref() };
        assert!(cache_ref.dynamic, "cache_destroy on a built-in cache");

        {
            let mut registry = self.registry.lock_irq();
            // SAFETY: We hold the registry lock.
            registry.remove(unsafe { cache_ref.registry_link() });
        }

        cache_ref.inner.lock_irq().destroy();
        self.meta.free(cache.cast());
    }

    /// Allocate `size` bytes. Requests up to [`KMALLOC_MAX_SIZE`] round up
    /// to the next power of two and come from the sized caches (naturally
    /// aligned for power-of-two sizes); larger ones fall through to whole
    /// low-memory pages.
    #[track_caller]
    pub fn kmalloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            pr_err!("kmalloc: zero size");
            return None;
        }
        self.ensure_init();

        let rounded = size.max(KMALLOC_MIN_SIZE).next_power_of_two();
        if rounded <= KMALLOC_MAX_SIZE {
            let index = rounded.trailing_zeros() as usize - KMALLOC_MIN_SHIFT;
            return self.sized[index].alloc(GfpFlags::KERNEL);
        }

        let order = (rounded >> PAGE_SIZE_BITS).trailing_zeros();
        let vaddr = self.map.alloc_pages_lowmem(GfpFlags::KERNEL, order)?;

        let caller = Location::caller();
        pr_trace!(
            "kmalloc {} -> {:?} (raw pages, order {}) ({}:{})",
            size,
            vaddr,
            order,
            caller.file(),
            caller.line(),
        );
        Some(vaddr.as_ptr())
    }

    /// [`kmalloc`] plus zeroing.
    ///
    /// [`kmalloc`]: Self::kmalloc
    #[track_caller]
    pub fn kzalloc(&self, size: usize) -> Option<NonNull<u8>> {
        let object = self.kmalloc(size)?;
        // SAFETY: The allocation covers at least `size` bytes.
        unsafe { core::ptr::write_bytes(object.as_ptr(), 0, size) };
        Some(object)
    }

    /// Free a pointer from [`kmalloc`] or any cache of this heap. The
    /// containing page's descriptor decides the path: slab pages dispatch
    /// to their owning cache, raw page blocks go back to the zone façade.
    ///
    /// [`kmalloc`]: Self::kmalloc
    #[track_caller]
    pub fn kfree(&self, ptr: Option<NonNull<u8>>) -> Result<(), MemError> {
        let Some(ptr) = ptr else {
            pr_err!("kfree: null pointer");
            return Err(MemError::NullPointer);
        };
        self.ensure_init();

        let frames = KernelFrames { map: self.map };
        if let Some((_, Some(token))) = frames.slab_of(ptr) {
            let cache = token.cast::<KmemCache<'a>>();
            // SAFETY: Owner tokens only ever point at live `KmemCache`s;
            //         a cache with live objects is never destroyed.
            unsafe { cache.as_ref() }.free(ptr);
            return Ok(());
        }

        let Some(desc) = self.map.frame_table().desc_of_data(ptr) else {
            pr_err!("kfree: {:p} outside low memory", ptr.as_ptr());
            return Err(MemError::OutOfRange);
        };
        self.map.free_pages(Some(desc))
    }

    /// One line per registered cache, `slabinfo` style.
    pub fn write_slabinfo(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        let registry = self.registry.lock_irq();

        writeln!(w, "cache                 objsize  total   free  order")?;
        for link in registry.iter() {
            // SAFETY: Only `KmemCache` registry links live on this list.
            let cache = unsafe { container_of!(link, KmemCache<'a>, link) };
            let inner = unsafe { cache.as_ref() }.inner.lock_irq();
            writeln!(
                w,
                "{:<20} {:>8} {:>6} {:>6} {:>6}",
                inner.name(),
                inner.object_size(),
                inner.total_objects(),
                inner.free_objects(),
                inner.slab_order(),
            )?;
        }
        Ok(())
    }
}

/// Adapter wiring the heap into Rust's allocator interface. The embedding
/// kernel registers it with `#[global_allocator]`.
pub struct GlobalHeap(pub &'static KernelHeap<'static>);

unsafe impl GlobalAlloc for GlobalHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Power-of-two rounding gives natural alignment, so satisfying
        // `align` only needs the size bumped up to it.
        let size = layout.size().max(layout.align());
        self.0
            .kmalloc(size)
            .map_or(core::ptr::null_mut(), |object| object.as_ptr())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let _ = self.0.kfree(NonNull::new(ptr));
    }
}
