use crate::{Gcphys, PAGE_SIZE, page_count};

/// A contiguous range of guest physical memory known to the page store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RamRange {
    /// First byte of the range.
    pub start: Gcphys,

    /// Last byte of the range (inclusive).
    pub last: Gcphys,
}

impl RamRange {
    /// Creates a range covering `size` bytes starting at `start`.
    pub fn new(start: Gcphys, size: u64) -> Self {
        Self {
            start,
            last: start + (size - 1),
        }
    }

    /// Checks if the address lies within the range.
    pub fn contains(&self, gcphys: Gcphys) -> bool {
        self.start <= gcphys && gcphys <= self.last
    }

    /// Checks if the inclusive range `[start, last]` lies entirely within
    /// this range.
    pub fn contains_range(&self, start: Gcphys, last: Gcphys) -> bool {
        self.contains(start) && self.contains(last)
    }

    /// Returns the number of pages in the range.
    pub fn page_count(&self) -> u64 {
        page_count(self.start, self.last)
    }

    /// Returns an iterator over the first byte of every page of the range.
    pub fn pages(&self) -> impl Iterator<Item = Gcphys> + use<> {
        let base = self.start.page_align_down();
        (0..self.page_count()).map(move |index| base + index * PAGE_SIZE)
    }
}

/// Cached position of the RAM range last used for a page lookup.
///
/// Page stores use it to avoid searching their range list when walking
/// consecutive pages. The content is private to the store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RamRangeHint(pub Option<usize>);
