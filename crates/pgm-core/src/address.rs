use super::macros::impl_ops;

impl_ops!(Gcphys, u64, "Guest Physical Address");
impl_ops!(Hcphys, u64, "Host Physical Address");
impl_ops!(Gfn, u64, "Guest Frame Number");

/// Size of a guest page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// Number of bits to shift an address by to get its frame number.
pub const PAGE_SHIFT: u32 = 12;

/// Mask selecting the offset of an address within its page.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

impl Gcphys {
    /// The "no address" sentinel used by detached handler records.
    pub const NIL: Gcphys = Gcphys(u64::MAX);

    /// Checks if this is the [`NIL`] sentinel.
    ///
    /// [`NIL`]: Self::NIL
    pub const fn is_nil(self) -> bool {
        self.0 == u64::MAX
    }

    /// Returns the guest frame number of the page containing this address.
    pub const fn gfn(self) -> Gfn {
        Gfn(self.0 >> PAGE_SHIFT)
    }

    /// Returns the offset of this address within its page.
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }

    /// Returns the address of the first byte of the containing page.
    pub const fn page_align_down(self) -> Gcphys {
        Gcphys(self.0 & !PAGE_OFFSET_MASK)
    }

    /// Checks if the address is the first byte of a page.
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Checks if the address is the last byte of a page.
    pub const fn is_page_last_byte(self) -> bool {
        self.page_offset() == PAGE_OFFSET_MASK
    }
}

impl Gfn {
    /// Returns the guest physical address of the first byte of the frame.
    pub const fn to_gcphys(self) -> Gcphys {
        Gcphys(self.0 << PAGE_SHIFT)
    }
}

impl Hcphys {
    /// The "no backing" sentinel.
    pub const NIL: Hcphys = Hcphys(u64::MAX);
}

/// Returns the number of pages touched by the inclusive range
/// `[start, last]`.
///
/// A range that starts or ends mid-page still counts the partial pages.
pub const fn page_count(start: Gcphys, last: Gcphys) -> u64 {
    (last.0 - start.page_align_down().0 + PAGE_SIZE) >> PAGE_SHIFT
}
