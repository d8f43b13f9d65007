//! The page-table contract the virtual-mapping arena consumes.
//!
//! The walker, directory layout and TLB mechanics live outside this core;
//! the arena only installs, clones, clears and resolves mappings through
//! this trait. Implementations allocate any page-table frames they need
//! themselves and may fail; the arena rolls back and reports failure.

use bitflags::bitflags;
use core::fmt;
use core::ptr::NonNull;
use strix_mm::address::{PAddr, VAddr, VRange};

bitflags! {
    /// Attribute bits for installed page-table entries.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        /// Survives address-space switches; kernel windows keep it even
        /// while not present.
        const GLOBAL = 1 << 2;
        /// Rewrite the frame address of entries that already exist.
        const UPDATE_ADDR = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageTableError {
    /// No frame could be allocated for an intermediate table.
    NoTableFrame,
    /// The virtual range is not covered by the directory.
    BadRange,
}

impl fmt::Display for PageTableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageTableError::NoTableFrame => write!(f, "no frame for a page table"),
            PageTableError::BadRange => write!(f, "virtual range not covered"),
        }
    }
}

pub trait PageTableOps {
    /// Handle to one page directory (one address space).
    type Dir: Copy;

    /// The kernel's own directory, covering the reserved mapping window.
    fn kernel_dir(&self) -> Self::Dir;

    /// Install or clear entries for `range` in `dir`.
    ///
    /// With `phys` set, the range is mapped to the contiguous physical run
    /// starting there. With `phys` absent, the entries are cleared: marked
    /// not present while keeping the attribute bits in `flags` (the arena
    /// passes `GLOBAL` so kernel windows stay global).
    fn update_area(
        &self,
        dir: Self::Dir,
        range: VRange,
        phys: Option<PAddr>,
        flags: PteFlags,
    ) -> Result<(), PageTableError>;

    /// Copy the entries backing `src..src + len` in `src_dir` so that
    /// `dst..dst + len` in `dst_dir` maps the same frames, applying `flags`.
    fn clone_area(
        &self,
        dst_dir: Self::Dir,
        dst: VAddr,
        src_dir: Self::Dir,
        src: VAddr,
        len: usize,
        flags: PteFlags,
    ) -> Result<(), PageTableError>;

    /// Walk `dir` and return the physical address `vaddr` maps to, if any.
    fn resolve(&self, dir: Self::Dir, vaddr: VAddr) -> Option<PAddr>;

    /// A kernel pointer for data behind an installed mapping.
    ///
    /// On the machine this is the identity on mapped kernel addresses;
    /// hosted page-table doubles translate into their backing store
    /// instead. `None` when nothing is mapped at `vaddr`.
    fn window_ptr(&self, dir: Self::Dir, vaddr: VAddr) -> Option<NonNull<u8>> {
        self.resolve(dir, vaddr)?;
        Some(vaddr.as_ptr())
    }
}
