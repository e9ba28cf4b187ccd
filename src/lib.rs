//! Guest physical memory access handler tracking.
//!
//! Re-exports the crates of the workspace:
//!
//! - the core types and driver traits, at the crate root,
//! - [`handler`]: the handler engine (feature `handler`),
//! - [`driver::mem`]: the in-memory driver (feature `driver-mem`).

pub use pgm_core::*;

/// Physical access handler engine.
#[cfg(feature = "handler")]
pub mod handler {
    pub use pgm_handler::*;
}

/// Drivers.
pub mod driver {
    /// In-memory driver.
    #[cfg(feature = "driver-mem")]
    pub mod mem {
        pub use pgm_driver_mem::*;
    }
}
