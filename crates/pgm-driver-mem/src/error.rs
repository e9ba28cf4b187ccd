use pgm_core::{Gcphys, Mmio2Handle, PgmError};

/// Error type for the in-memory driver.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No page at the address.
    #[error("no page at {0}")]
    PageNotFound(Gcphys),

    /// The MMIO2 region or offset does not exist.
    #[error("MMIO2 region {region:?} has no page at offset {offset:#x}")]
    Mmio2NotFound {
        /// The region handle.
        region: Mmio2Handle,
        /// The offset into the region.
        offset: u64,
    },

    /// The new range overlaps an existing one.
    #[error("range {start}-{last} overlaps an existing range")]
    Overlap {
        /// First byte of the range.
        start: Gcphys,
        /// Last byte of the range.
        last: Gcphys,
    },

    /// The range is not page aligned or empty.
    #[error("range at {start} with size {size:#x} is not page aligned")]
    Unaligned {
        /// First byte of the range.
        start: Gcphys,
        /// Size of the range in bytes.
        size: u64,
    },
}

impl From<Error> for PgmError {
    fn from(value: Error) -> Self {
        match value {
            Error::PageNotFound(gcphys) => Self::PageNotFound(gcphys),
            Error::Mmio2NotFound { region, offset } => Self::Mmio2NotFound { region, offset },
            value => Self::Driver(Box::new(value)),
        }
    }
}
