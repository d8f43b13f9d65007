//! A buddy allocator over caller-owned page descriptors.
//!
//! The allocator is generic over the descriptor type so that the same split
//! and coalesce code manages both physical page descriptors and the
//! virtual-mapping arena's reservation records. A descriptor only needs to
//! expose its intrusive link, its block order and its `FREE`/`HEAD` state;
//! all index arithmetic is relative to the first descriptor the instance
//! manages.

#![cfg_attr(not(test), no_std)]

mod cache;
mod free_area;
mod zone;

use intrusive_list::Link;

pub use cache::{PageCache, CACHE_WATERMARK_HIGH, CACHE_WATERMARK_LOW, CACHE_WATERMARK_MID};
pub use zone::BuddyZone;

/// Number of free-list orders. The largest block is `2^(MAX_ORDER - 1)`
/// pages; zones must be sized in multiples of it.
pub const MAX_ORDER: usize = 11;

/// Pages in the largest block.
pub const MAX_ORDER_PAGES: usize = 1 << (MAX_ORDER - 1);

/// A handle to one page descriptor inside a dense descriptor table.
///
/// Handles are plain copies of a pointer; the table entry itself carries the
/// state. All methods that mutate descriptor state must be called under the
/// lock of the buddy instance that owns the table slice.
pub trait BuddyRawPage: Copy + Eq {
    /// Recover the descriptor handle from its intrusive link.
    ///
    /// # Safety
    /// `link` must be the link embedded in a descriptor of this type.
    unsafe fn from_link(link: &mut Link) -> Self;

    /// The descriptor's intrusive link.
    ///
    /// # Safety
    /// The caller must hold the owning buddy instance's lock; at most one
    /// mutable reference to the link may exist at a time.
    unsafe fn get_link(&self) -> &mut Link;

    fn order(&self) -> u32;
    fn set_order(&self, order: u32);

    fn is_free(&self) -> bool;
    fn set_free(&self);
    fn clear_free(&self);

    /// Whether this descriptor heads a block (allocated or on a free list).
    fn is_head(&self) -> bool;
    fn set_head(&self);
    fn clear_head(&self);

    /// Whether the block is parked in an order-0 page cache. Cached blocks
    /// are allocated as far as the buddy is concerned: `FREE` stays clear
    /// and the reference count stays zero.
    fn is_cached(&self) -> bool;
    fn set_cached(&self);
    fn clear_cached(&self);

    /// The descriptor `count` slots after this one in the same table.
    ///
    /// # Safety
    /// The resulting descriptor must lie within the managed table.
    unsafe fn offset(&self, count: usize) -> Self;

    /// This descriptor's index relative to `base`.
    ///
    /// # Safety
    /// `base` must be the first descriptor of the table containing `self`.
    unsafe fn index_from(&self, base: Self) -> usize;
}
