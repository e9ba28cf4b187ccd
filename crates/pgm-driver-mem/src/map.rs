use pgm_core::{
    Gcphys, Hcphys, Mmio2Handle, PAGE_SHIFT, PAGE_SIZE, PageDescriptor, PageId, RamRange,
    RamRangeHint,
};

use crate::Error;

/// Host physical address of the shared zero page.
pub(crate) const ZERO_PAGE: Hcphys = Hcphys(0x0000_0000_0010_0000);

/// First host physical address handed out to backing pages.
const FIRST_BACKING: u64 = 0x0000_0001_0000_0000;

struct RamRangeEntry {
    range: RamRange,
    pages: Vec<PageDescriptor>,
}

impl RamRangeEntry {
    fn index_of(&self, gcphys: Gcphys) -> usize {
        ((gcphys - self.range.start.page_align_down()) >> PAGE_SHIFT) as usize
    }
}

/// Guest physical page database.
///
/// RAM ranges are kept sorted by address and never overlap. MMIO2
/// regions are device memory not mapped into the guest physical address
/// space, usable as alias sources.
pub(crate) struct MemoryMap {
    ranges: Vec<RamRangeEntry>,
    mmio2: Vec<Vec<PageDescriptor>>,
    next_hc_phys: u64,
    next_page_id: u32,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self {
            ranges: Vec::new(),
            mmio2: Vec::new(),
            next_hc_phys: FIRST_BACKING,
            next_page_id: 1,
        }
    }

    fn allocate_backing(&mut self) -> (Hcphys, PageId) {
        let hc_phys = Hcphys(self.next_hc_phys);
        let page_id = PageId(self.next_page_id);
        self.next_hc_phys += PAGE_SIZE;
        self.next_page_id += 1;
        (hc_phys, page_id)
    }

    fn validate(start: Gcphys, size: u64) -> Result<RamRange, Error> {
        if size == 0 || !start.is_page_aligned() || !size.is_multiple_of(PAGE_SIZE) {
            return Err(Error::Unaligned { start, size });
        }

        Ok(RamRange::new(start, size))
    }

    fn insert(&mut self, range: RamRange, pages: Vec<PageDescriptor>) -> Result<RamRange, Error> {
        let index = self
            .ranges
            .partition_point(|entry| entry.range.last < range.start);

        if let Some(next) = self.ranges.get(index)
            && next.range.start <= range.last
        {
            return Err(Error::Overlap {
                start: range.start,
                last: range.last,
            });
        }

        self.ranges.insert(index, RamRangeEntry { range, pages });
        Ok(range)
    }

    /// Adds a range of allocated RAM pages.
    pub fn add_ram(&mut self, start: Gcphys, size: u64) -> Result<RamRange, Error> {
        let range = Self::validate(start, size)?;
        let pages = (0..range.page_count())
            .map(|_| {
                let (hc_phys, page_id) = self.allocate_backing();
                PageDescriptor::ram(hc_phys, page_id)
            })
            .collect();

        self.insert(range, pages)
    }

    /// Adds a range of unbacked MMIO pages.
    pub fn add_mmio(&mut self, start: Gcphys, size: u64) -> Result<RamRange, Error> {
        let range = Self::validate(start, size)?;
        let pages = vec![PageDescriptor::mmio(ZERO_PAGE); range.page_count() as usize];
        self.insert(range, pages)
    }

    /// Adds an MMIO2 region of `size` bytes.
    pub fn add_mmio2_region(&mut self, size: u64) -> Result<Mmio2Handle, Error> {
        Self::validate(Gcphys(0), size)?;

        let pages = (0..size / PAGE_SIZE)
            .map(|_| {
                let (hc_phys, page_id) = self.allocate_backing();
                PageDescriptor::mmio2(hc_phys, page_id)
            })
            .collect();

        self.mmio2.push(pages);
        Ok(Mmio2Handle(self.mmio2.len() as u32 - 1))
    }

    fn find(&self, gcphys: Gcphys) -> Option<usize> {
        let index = self
            .ranges
            .partition_point(|entry| entry.range.last < gcphys);

        match self.ranges.get(index) {
            Some(entry) if entry.range.contains(gcphys) => Some(index),
            _ => None,
        }
    }

    pub fn page(&self, gcphys: Gcphys) -> Result<&PageDescriptor, Error> {
        let entry = &self.ranges[self.find(gcphys).ok_or(Error::PageNotFound(gcphys))?];
        Ok(&entry.pages[entry.index_of(gcphys)])
    }

    pub fn page_mut(&mut self, gcphys: Gcphys) -> Result<&mut PageDescriptor, Error> {
        let index = self.find(gcphys).ok_or(Error::PageNotFound(gcphys))?;
        let entry = &mut self.ranges[index];
        let page = entry.index_of(gcphys);
        Ok(&mut entry.pages[page])
    }

    pub fn page_mut_with_hint(
        &mut self,
        gcphys: Gcphys,
        hint: &mut RamRangeHint,
    ) -> Result<&mut PageDescriptor, Error> {
        let index = match hint.0 {
            Some(index)
                if self
                    .ranges
                    .get(index)
                    .is_some_and(|entry| entry.range.contains(gcphys)) =>
            {
                index
            }
            _ => self.find(gcphys).ok_or(Error::PageNotFound(gcphys))?,
        };

        hint.0 = Some(index);

        let entry = &mut self.ranges[index];
        let page = entry.index_of(gcphys);
        Ok(&mut entry.pages[page])
    }

    pub fn range_containing(&self, gcphys: Gcphys) -> Option<RamRange> {
        self.find(gcphys).map(|index| self.ranges[index].range)
    }

    pub fn ram_ranges(&self) -> Vec<RamRange> {
        self.ranges.iter().map(|entry| entry.range).collect()
    }

    pub fn mmio2_page(&self, region: Mmio2Handle, offset: u64) -> Result<&PageDescriptor, Error> {
        self.mmio2
            .get(region.0 as usize)
            .and_then(|pages| pages.get((offset >> PAGE_SHIFT) as usize))
            .ok_or(Error::Mmio2NotFound { region, offset })
    }
}
