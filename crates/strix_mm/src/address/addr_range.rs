use super::addr::Addr;
use core::fmt;

/// A half-open range of addresses, inclusive on the start and exclusive on
/// the end.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct AddrRange<A: Addr> {
    start: A,
    end: A,
}

impl<A: Addr> AddrRange<A> {
    /// Creates a new `AddrRange` with the given start and end addresses.
    ///
    /// # Panics
    /// Panics if the start address is greater than the end address.
    ///
    /// # Hint
    /// Use `AddrRange::from(addr).grow(size)` to create a range of size
    /// `size` starting from `addr`.
    pub fn new(start: A, end: A) -> Self {
        assert!(start <= end);
        Self { start, end }
    }

    pub const fn start(&self) -> A {
        self.start
    }

    pub const fn end(&self) -> A {
        self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn grow(&self, count: usize) -> Self {
        Self::new(self.start, self.end + count)
    }

    pub fn shrink(&self, size: usize) -> Self {
        assert!(size <= self.len());
        Self::new(self.start, self.end - size)
    }

    pub fn contains(&self, addr: A) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn overlap_with(&self, other: &Self) -> bool {
        self.start < other.end && self.end > other.start
    }
}

impl<A: Addr> From<A> for AddrRange<A> {
    fn from(addr: A) -> Self {
        Self {
            start: addr,
            end: addr,
        }
    }
}

impl<A: Addr + fmt::Debug> fmt::Debug for AddrRange<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?})", self.start, self.end)
    }
}
