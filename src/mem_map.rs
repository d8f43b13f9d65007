//! Bootstrap of the global memory map: descriptor-table placement, zone
//! rounding and initialization, and the post-init self-check.

use crate::boot_info::BootInfo;
use crate::page_alloc::{FrameTable, GfpFlags, MemZone, PageDesc, PageFlags};
use align_ext::AlignExt;
use buddy_allocator::{MAX_ORDER, MAX_ORDER_PAGES};
use core::fmt;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use strix_log::pr_info;
use strix_mm::address::{Addr as _, AddrOps as _, PAddr, PRange, VAddr, VRange};
use strix_mm::paging::{PAGE_SIZE, PFN};
use strix_sync::Once;

/// Physical and (when directly mapped) virtual extent of one memory region.
#[derive(Clone, Copy, Debug)]
pub struct RegionDesc {
    pub phys: PRange,
    pub virt: Option<VRange>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapError {
    /// Inverted or empty physical extents in the boot info.
    BadBounds,
    /// Low memory cannot hold the descriptor table plus one top-order block.
    ZoneTooSmall,
    /// The allocate/free probe left the free areas changed.
    SelfCheckFailed(&'static str),
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapError::BadBounds => write!(f, "bad physical bounds in boot info"),
            BootstrapError::ZoneTooSmall => write!(f, "low memory too small for a zone"),
            BootstrapError::SelfCheckFailed(zone) => {
                write!(f, "memory self-check failed in zone {}", zone)
            }
        }
    }
}

/// The global memory map: the descriptor table, both zones, and the
/// translation state connecting frames, descriptors and kernel addresses.
pub struct MemoryMap {
    pub(crate) table: FrameTable,
    pub(crate) zones: [MemZone; 2],
    pub(crate) lowmem: RegionDesc,
    pub(crate) highmem: RegionDesc,
    total_bytes: usize,
    /// Bootstrap-linear versus per-zone translation selector.
    pub(crate) boot_mapping: AtomicBool,
}

// SAFETY: All interior state is behind per-zone locks or atomics; the
//         descriptor table is only reached through the synchronized zones.
unsafe impl Send for MemoryMap {}
unsafe impl Sync for MemoryMap {}

impl MemoryMap {
    /// Build the memory map over the extents the boot loader reported.
    ///
    /// The descriptor table lands at the start of usable low memory (right
    /// after the kernel image); the `Normal` zone bounds are aligned inward
    /// and rounded down to a multiple of the top buddy block, as is
    /// `HighMem`. Frames preceding the `Normal` zone (kernel image and the
    /// table itself) stay reserved with a reference count of 1. Ends with
    /// the allocate/free self-check; any mismatch aborts bootstrap.
    pub fn bootstrap(boot: &BootInfo) -> Result<Self, BootstrapError> {
        let low = boot.lowmem;
        if low.is_empty()
            || boot.kernel_image.end() < boot.kernel_image.start()
            || (!boot.highmem.is_empty() && boot.highmem.start() < low.end())
        {
            return Err(BootstrapError::BadBounds);
        }

        let min_pfn = PFN::from(low.start().ceil());
        let end_paddr = if boot.highmem.is_empty() {
            low.end()
        } else {
            boot.highmem.end()
        };
        let page_count = PFN::from(end_paddr.floor()) - min_pfn;
        if page_count == 0 {
            return Err(BootstrapError::BadBounds);
        }

        let virt_offset =
            boot.lowmem_virt_base.addr() as isize - low.start().addr() as isize;
        let virt_of = |paddr: PAddr| (paddr.addr() as isize + virt_offset) as usize;

        // The descriptor array goes at the start of usable low memory.
        let mut cursor = if boot.kernel_image.end() > low.start() {
            boot.kernel_image.end()
        } else {
            low.start()
        };
        cursor = PAddr::from(cursor.addr().align_up(align_of::<PageDesc>()));

        let table_base = NonNull::new(virt_of(cursor) as *mut PageDesc)
            .expect("descriptor table at null");
        cursor = cursor + page_count * size_of::<PageDesc>();

        for index in 0..page_count {
            // SAFETY: The table span was just carved out of low memory.
            unsafe { table_base.add(index).write(PageDesc::new()) };
        }

        // Normal zone: round the bounds inward to whole top-order blocks.
        // Keeping zone starts block-aligned in absolute frame numbers is
        // what makes every order-k head physically aligned to 2^k pages.
        let normal_start = PFN::from(usize::from(PFN::from(cursor.ceil())).align_up(MAX_ORDER_PAGES));
        let normal_end = PFN::from(low.end().floor());
        if normal_end <= normal_start {
            return Err(BootstrapError::ZoneTooSmall);
        }
        let normal_count = (normal_end - normal_start).align_down(MAX_ORDER_PAGES);
        if normal_count == 0 {
            return Err(BootstrapError::ZoneTooSmall);
        }

        // HighMem: same rounding; the zone may come out empty.
        let (high_start, high_count) = if boot.highmem.is_empty() {
            (PFN::from(0usize), 0)
        } else {
            let start = PFN::from(
                usize::from(PFN::from(boot.highmem.start().ceil())).align_up(MAX_ORDER_PAGES),
            );
            let end = PFN::from(boot.highmem.end().floor());
            let count = if end > start {
                (end - start).align_down(MAX_ORDER_PAGES)
            } else {
                0
            };
            (start, count)
        };

        let lowmem_end_pfn = PFN::from(low.end().floor());
        let table = FrameTable::new(table_base, min_pfn, page_count, virt_offset, lowmem_end_pfn);

        let mut zones = [
            MemZone::new("Normal", true),
            MemZone::new("HighMem", false),
        ];

        // Zone frames become PRESENT; everything else (kernel image, the
        // table, rounded-off tails) stays reserved.
        for index in 0..page_count {
            let pfn = min_pfn + index;
            let in_normal =
                pfn >= normal_start && usize::from(pfn) < usize::from(normal_start) + normal_count;
            let in_high = high_count > 0
                && pfn >= high_start
                && usize::from(pfn) < usize::from(high_start) + high_count;

            let desc = table.desc(pfn).expect("pfn inside the fresh table");
            if in_normal || in_high {
                desc.flags().set(PageFlags::PRESENT);
            } else {
                desc.set_ref(1);
            }
        }

        zones[0].init(&table, normal_start, normal_count);
        if high_count > 0 {
            zones[1].init(&table, high_start, high_count);
        }

        let lowmem_virt = VRange::new(
            VAddr::from(virt_of(low.start())),
            VAddr::from(virt_of(low.end())),
        );

        let map = Self {
            table,
            zones,
            lowmem: RegionDesc {
                phys: low,
                virt: Some(lowmem_virt),
            },
            highmem: RegionDesc {
                phys: boot.highmem,
                virt: None,
            },
            total_bytes: page_count * PAGE_SIZE,
            boot_mapping: AtomicBool::new(true),
        };

        map.self_check()?;

        pr_info!(
            "memory map: {} frames, Normal {} pages at {:?}, HighMem {} pages",
            page_count,
            normal_count,
            normal_start,
            high_count,
        );
        Ok(map)
    }

    pub fn frame_table(&self) -> FrameTable {
        self.table
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn page_index_min(&self) -> PFN {
        self.table.min_pfn()
    }

    pub fn page_index_max(&self) -> PFN {
        self.table.max_pfn() - 1usize
    }

    pub fn lowmem_region(&self) -> RegionDesc {
        self.lowmem
    }

    pub fn highmem_region(&self) -> RegionDesc {
        self.highmem
    }

    /// The allocate/free probe run at the end of bootstrap: an order-0
    /// block per zone, a sweep of orders 0..=4, and a mixed-order batch.
    /// After each phase the per-order free counts and the zone free-page
    /// count must be exactly what they were before it.
    pub fn self_check(&self) -> Result<(), BootstrapError> {
        for (zone_flags, zone) in [
            (GfpFlags::KERNEL, self.zone(crate::page_alloc::ZoneId::Normal)),
            (GfpFlags::HIGHUSER, self.zone(crate::page_alloc::ZoneId::HighMem)),
        ] {
            if zone.is_empty() {
                continue;
            }
            let name = zone.name();

            // Phase 1: a single order-0 round trip.
            let before = self.clean_snapshot(zone);
            let page = self
                .alloc_pages(zone_flags, 0)
                .ok_or(BootstrapError::SelfCheckFailed(name))?;
            self.free_pages(Some(page))
                .map_err(|_| BootstrapError::SelfCheckFailed(name))?;
            self.check_clean(zone, &before)?;

            // Phase 2: one block of each small order, freed immediately.
            let before = self.clean_snapshot(zone);
            for order in 0..=4 {
                let page = self
                    .alloc_pages(zone_flags, order)
                    .ok_or(BootstrapError::SelfCheckFailed(name))?;
                self.free_pages(Some(page))
                    .map_err(|_| BootstrapError::SelfCheckFailed(name))?;
            }
            self.check_clean(zone, &before)?;

            // Phase 3: a mixed-order batch held live together.
            let before = self.clean_snapshot(zone);
            let mut batch = [None; 6];
            for (slot, order) in batch.iter_mut().zip([0u32, 3, 1, 4, 2, 0]) {
                *slot = self.alloc_pages(zone_flags, order);
                if slot.is_none() {
                    return Err(BootstrapError::SelfCheckFailed(name));
                }
            }
            for page in batch {
                self.free_pages(page)
                    .map_err(|_| BootstrapError::SelfCheckFailed(name))?;
            }
            self.check_clean(zone, &before)?;

            #[cfg(debug_assertions)]
            zone.assert_flag_discipline(&self.table);
        }

        Ok(())
    }

    fn clean_snapshot(&self, zone: &MemZone) -> ([usize; MAX_ORDER], usize) {
        zone.drain_cache();
        (zone.buddy_snapshot(), zone.free_pages_count())
    }

    fn check_clean(
        &self,
        zone: &MemZone,
        before: &([usize; MAX_ORDER], usize),
    ) -> Result<(), BootstrapError> {
        if &self.clean_snapshot(zone) == before {
            Ok(())
        } else {
            Err(BootstrapError::SelfCheckFailed(zone.name()))
        }
    }
}

static MEM_MAP: Once<MemoryMap> = Once::new();

/// Publish the bootstrapped map as the kernel-wide singleton.
pub fn init_memory_map(map: MemoryMap) -> Result<(), MemoryMap> {
    MEM_MAP.set(map)
}

/// The kernel-wide memory map. Panics before [`init_memory_map`].
pub fn memory_map() -> &'static MemoryMap {
    MEM_MAP.get().expect("memory map not initialized")
}
