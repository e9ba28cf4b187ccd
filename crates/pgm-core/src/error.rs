use crate::{Gcphys, Mmio2Handle};

/// An error that can occur when working with physical access handlers.
#[derive(thiserror::Error, Debug)]
pub enum PgmError {
    /// An error occurred in the driver.
    #[error(transparent)]
    Driver(Box<dyn std::error::Error + Send + Sync>),

    /// The range overlaps an existing handler.
    #[error("range {start}-{last} conflicts with handler {existing_start}-{existing_last}")]
    Conflict {
        /// First byte of the rejected range.
        start: Gcphys,
        /// Last byte of the rejected range.
        last: Gcphys,
        /// First byte of the handler in the way.
        existing_start: Gcphys,
        /// Last byte of the handler in the way.
        existing_last: Gcphys,
    },

    /// The range does not lie within a single RAM range.
    #[error("range {start}-{last} is not within a single RAM range")]
    NoRamRange {
        /// First byte of the range.
        start: Gcphys,
        /// Last byte of the range.
        last: Gcphys,
    },

    /// The range is empty, inverted or violates the page granularity of
    /// the handler kind.
    #[error("invalid range {start}-{last}")]
    InvalidRange {
        /// First byte of the range.
        start: Gcphys,
        /// Last byte of the range.
        last: Gcphys,
    },

    /// No live handler starts at the given address.
    #[error("no handler registered at {0}")]
    NotFound(Gcphys),

    /// The operation is not allowed for the kind of the handler.
    #[error("operation not allowed for this handler kind")]
    AccessDenied,

    /// The page does not belong to the handler.
    #[error("page {page} is outside handler {start}-{last}")]
    PageOutOfRange {
        /// The page address.
        page: Gcphys,
        /// First byte of the handler.
        start: Gcphys,
        /// Last byte of the handler.
        last: Gcphys,
    },

    /// The handlers to join are not adjacent.
    #[error("handlers at {first} and {second} are not adjacent")]
    NotAdjacent {
        /// Key of the first handler.
        first: Gcphys,
        /// Key of the second handler.
        second: Gcphys,
    },

    /// The handlers to join have different types.
    #[error("handlers at {first} and {second} have different types")]
    TypeMismatch {
        /// Key of the first handler.
        first: Gcphys,
        /// Key of the second handler.
        second: Gcphys,
    },

    /// The page is not an MMIO page.
    #[error("page {0} is not an MMIO page")]
    NotMmio(Gcphys),

    /// The alias source is not an MMIO2 page.
    #[error("alias source is not an MMIO2 page")]
    NotMmio2,

    /// The handler type is unknown or already destroyed.
    #[error("invalid handler type {0}")]
    InvalidHandlerType(u32),

    /// The page store has no page at the address.
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

    /// The handler allocation limit was reached.
    #[error("out of handler records (limit {0})")]
    OutOfHandlers(usize),

    /// An internal invariant was violated.
    #[error("internal processing error: {0}")]
    Internal(&'static str),
}
