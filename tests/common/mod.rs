#![allow(dead_code)]

//! A simulated machine for the end-to-end suite: a page-aligned buffer
//! standing in for physical memory, a fabricated boot-info record, and a
//! page-table double that keeps mappings in a table and translates window
//! addresses into the buffer.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use strix_mem::page_table::{PageTableError, PageTableOps, PteFlags};
use strix_mem::{BootInfo, MemoryMap};
use strix_mm::address::{Addr as _, AddrOps as _, PAddr, PRange, VAddr, VRange};
use strix_mm::paging::PAGE_SIZE;

pub const PHYS_BASE: usize = 0x0010_0000;
pub const LOW_END: usize = 0x00D0_0000;
pub const HIGH_START: usize = 0x0100_0000;
pub const HIGH_END: usize = 0x0140_0000;
pub const KERNEL_IMAGE_END: usize = PHYS_BASE + 0x1_0000;

const BUFFER_BYTES: usize = HIGH_END - PHYS_BASE;

#[repr(align(4096))]
struct PageAligned([u8; PAGE_SIZE]);

/// The machine: owns the "physical memory" buffer and the bootstrapped map.
pub struct SimMachine {
    buffer: Vec<PageAligned>,
    map: MemoryMap,
}

impl SimMachine {
    /// Bootstrapped machine still running on the boot linear mapping.
    pub fn new_boot_mode() -> Self {
        let mut buffer: Vec<PageAligned> = Vec::with_capacity(BUFFER_BYTES / PAGE_SIZE);
        buffer.resize_with(BUFFER_BYTES / PAGE_SIZE, || PageAligned([0; PAGE_SIZE]));

        let base = buffer.as_ptr() as usize;
        let boot = BootInfo {
            lowmem: PRange::new(PAddr::from(PHYS_BASE), PAddr::from(LOW_END)),
            highmem: PRange::new(PAddr::from(HIGH_START), PAddr::from(HIGH_END)),
            kernel_image: PRange::new(PAddr::from(PHYS_BASE), PAddr::from(KERNEL_IMAGE_END)),
            lowmem_virt_base: VAddr::from(base),
        };

        let map = MemoryMap::bootstrap(&boot).expect("bootstrap failed");
        Self { buffer, map }
    }

    /// Bootstrapped machine in steady state (per-zone translation).
    pub fn new() -> Self {
        let machine = Self::new_boot_mode();
        machine.map.switch_to_zone_mapping();
        machine
    }

    pub fn map(&self) -> &MemoryMap {
        &self.map
    }

    pub fn host_base(&self) -> usize {
        self.buffer.as_ptr() as usize
    }

    /// Host pointer for any simulated physical address, high memory
    /// included (unlike the kernel's own direct map).
    pub fn host_ptr(&self, paddr: PAddr) -> *mut u8 {
        let addr = paddr.addr();
        assert!((PHYS_BASE..HIGH_END).contains(&addr), "paddr outside the machine");
        (self.host_base() + (addr - PHYS_BASE)) as *mut u8
    }

    pub fn page_table(&self) -> MockPageTable {
        MockPageTable::new(PHYS_BASE, self.host_base())
    }
}

/// A page-aligned scratch buffer for tests that fabricate their own boot
/// layouts.
pub struct RawBuffer {
    pages: Vec<PageAligned>,
}

impl RawBuffer {
    pub fn new(bytes: usize) -> Self {
        let mut pages = Vec::with_capacity(bytes.div_ceil(PAGE_SIZE));
        pages.resize_with(bytes.div_ceil(PAGE_SIZE), || PageAligned([0; PAGE_SIZE]));
        Self { pages }
    }

    pub fn base(&self) -> usize {
        self.pages.as_ptr() as usize
    }
}

/// Bootstrap over a buffer that is intentionally never reclaimed, for the
/// process-wide singleton test.
pub fn bootstrap_leaked() -> MemoryMap {
    let mut buffer: Vec<PageAligned> = Vec::with_capacity(BUFFER_BYTES / PAGE_SIZE);
    buffer.resize_with(BUFFER_BYTES / PAGE_SIZE, || PageAligned([0; PAGE_SIZE]));
    let base = buffer.as_ptr() as usize;
    std::mem::forget(buffer);

    let boot = BootInfo {
        lowmem: PRange::new(PAddr::from(PHYS_BASE), PAddr::from(LOW_END)),
        highmem: PRange::new(PAddr::from(HIGH_START), PAddr::from(HIGH_END)),
        kernel_image: PRange::new(PAddr::from(PHYS_BASE), PAddr::from(KERNEL_IMAGE_END)),
        lowmem_virt_base: VAddr::from(base),
    };

    let map = MemoryMap::bootstrap(&boot).expect("bootstrap failed");
    map.switch_to_zone_mapping();
    map
}

/// One page directory in the double.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DirId(pub usize);

pub const KERNEL_DIR: DirId = DirId(0);

struct PteEntry {
    paddr: usize,
    flags: u32,
}

/// Page-table double: (directory, vpn) -> entry. Implements the same
/// contract the kernel's walker exposes to the arena.
pub struct MockPageTable {
    phys_base: usize,
    host_base: usize,
    entries: Mutex<HashMap<(usize, usize), PteEntry>>,
    fail_next_update: AtomicBool,
}

impl MockPageTable {
    pub fn new(phys_base: usize, host_base: usize) -> Self {
        Self {
            phys_base,
            host_base,
            entries: Mutex::new(HashMap::new()),
            fail_next_update: AtomicBool::new(false),
        }
    }

    /// Make the next `update_area` fail, for rollback tests.
    pub fn fail_next_update(&self) {
        self.fail_next_update.store(true, Ordering::Relaxed);
    }

    /// Present mappings currently installed in `dir`.
    pub fn present_mappings(&self, dir: DirId) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|((d, _), entry)| *d == dir.0 && entry.flags & PteFlags::PRESENT.bits() != 0)
            .count()
    }

    /// Install a single user mapping, as the process side of the kernel
    /// would have.
    pub fn map_user_page(&self, dir: DirId, vaddr: VAddr, paddr: PAddr) {
        assert_eq!(vaddr.page_offset(), 0);
        self.update_area(
            dir,
            VRange::from(vaddr).grow(PAGE_SIZE),
            Some(paddr),
            PteFlags::PRESENT | PteFlags::WRITE,
        )
        .expect("mock mapping");
    }

    fn host_of(&self, paddr: usize) -> *mut u8 {
        (self.host_base + (paddr - self.phys_base)) as *mut u8
    }

    /// Copy bytes out of `dir`'s address space, walking the mappings.
    pub fn copy_out(&self, dir: DirId, vaddr: VAddr, out: &mut [u8]) {
        let mut done = 0;
        while done < out.len() {
            let addr = vaddr + done;
            let run = (out.len() - done).min(PAGE_SIZE - addr.page_offset());
            let paddr = self
                .resolve(dir, addr)
                .unwrap_or_else(|| panic!("nothing mapped at {:?}", addr));
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.host_of(paddr.addr()),
                    out[done..].as_mut_ptr(),
                    run,
                );
            }
            done += run;
        }
    }

    /// Copy bytes into `dir`'s address space, walking the mappings.
    pub fn copy_in(&self, dir: DirId, vaddr: VAddr, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let addr = vaddr + done;
            let run = (data.len() - done).min(PAGE_SIZE - addr.page_offset());
            let paddr = self
                .resolve(dir, addr)
                .unwrap_or_else(|| panic!("nothing mapped at {:?}", addr));
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data[done..].as_ptr(),
                    self.host_of(paddr.addr()),
                    run,
                );
            }
            done += run;
        }
    }
}

impl PageTableOps for MockPageTable {
    type Dir = DirId;

    fn kernel_dir(&self) -> DirId {
        KERNEL_DIR
    }

    fn update_area(
        &self,
        dir: DirId,
        range: VRange,
        phys: Option<PAddr>,
        flags: PteFlags,
    ) -> Result<(), PageTableError> {
        if self.fail_next_update.swap(false, Ordering::Relaxed) {
            return Err(PageTableError::NoTableFrame);
        }

        let mut entries = self.entries.lock().unwrap();
        let pages = range.len() / PAGE_SIZE;
        let start_vpn = range.start().addr() / PAGE_SIZE;

        for index in 0..pages {
            let key = (dir.0, start_vpn + index);
            match phys {
                Some(paddr) => {
                    entries.insert(
                        key,
                        PteEntry {
                            paddr: paddr.addr() + index * PAGE_SIZE,
                            flags: flags.bits(),
                        },
                    );
                }
                None => {
                    // Clear: not present, attribute bits in `flags` kept.
                    if let Some(entry) = entries.get_mut(&key) {
                        entry.flags = flags.bits() & !PteFlags::PRESENT.bits();
                    }
                }
            }
        }
        Ok(())
    }

    fn clone_area(
        &self,
        dst_dir: DirId,
        dst: VAddr,
        src_dir: DirId,
        src: VAddr,
        len: usize,
        flags: PteFlags,
    ) -> Result<(), PageTableError> {
        assert_eq!(src.page_offset(), 0, "clone_area: unaligned source");
        assert_eq!(dst.page_offset(), 0, "clone_area: unaligned destination");

        let mut entries = self.entries.lock().unwrap();
        let pages = len.div_ceil(PAGE_SIZE);
        let src_vpn = src.addr() / PAGE_SIZE;
        let dst_vpn = dst.addr() / PAGE_SIZE;

        for index in 0..pages {
            let Some(entry) = entries.get(&(src_dir.0, src_vpn + index)) else {
                return Err(PageTableError::BadRange);
            };
            if entry.flags & PteFlags::PRESENT.bits() == 0 {
                return Err(PageTableError::BadRange);
            }
            let paddr = entry.paddr;
            entries.insert(
                (dst_dir.0, dst_vpn + index),
                PteEntry {
                    paddr,
                    flags: flags.bits(),
                },
            );
        }
        Ok(())
    }

    fn resolve(&self, dir: DirId, vaddr: VAddr) -> Option<PAddr> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(&(dir.0, vaddr.addr() / PAGE_SIZE))?;
        if entry.flags & PteFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some(PAddr::from(entry.paddr + vaddr.page_offset()))
    }

    fn window_ptr(&self, dir: DirId, vaddr: VAddr) -> Option<NonNull<u8>> {
        let paddr = self.resolve(dir, vaddr)?;
        NonNull::new(self.host_of(paddr.addr()))
    }
}
