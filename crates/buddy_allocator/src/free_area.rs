use crate::BuddyRawPage;
use core::marker::PhantomData;
use intrusive_list::List;

/// The free list of one order within one buddy instance.
pub(crate) struct FreeArea<R: BuddyRawPage> {
    free_list: List,
    _marker: PhantomData<R>,
}

impl<R: BuddyRawPage> FreeArea<R> {
    pub(crate) const fn new() -> Self {
        Self {
            free_list: List::new(),
            _marker: PhantomData,
        }
    }

    pub(crate) const fn count(&self) -> usize {
        self.free_list.count()
    }

    /// Take the block at the head of the list, clearing its `FREE` bit. The
    /// block keeps its `HEAD` bit: it is now an allocated block head.
    pub(crate) fn pop(&mut self) -> Option<R> {
        self.free_list.pop().map(|link| {
            // SAFETY: Only descriptor links are ever inserted here.
            let page = unsafe { R::from_link(link) };
            page.clear_free();
            page
        })
    }

    /// Insert a block at the head of the list, marking it `FREE` and `HEAD`.
    pub(crate) fn push(&mut self, page: R) {
        page.set_free();
        page.set_head();
        // SAFETY: We hold the buddy lock; the link is not otherwise aliased.
        self.free_list.insert(unsafe { page.get_link() });
    }

    /// Unlink a specific block, clearing its `FREE` bit.
    pub(crate) fn remove(&mut self, page: R) {
        debug_assert!(page.is_free() && page.is_head());
        page.clear_free();
        // SAFETY: We hold the buddy lock; the link is not otherwise aliased.
        self.free_list.remove(unsafe { page.get_link() });
    }
}
