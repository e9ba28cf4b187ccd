//! Core types for guest physical memory access handlers.
//!
//! This crate holds the vocabulary shared by the handler engine and the
//! drivers backing it: guest and host physical addresses, page
//! descriptors, the per-page handler state, and the traits through which
//! the engine reaches the page database, the shadow page table pool and
//! the hardware-assisted virtualization backend.

mod address;
mod config;
mod driver;
mod error;
pub(crate) mod macros;
mod memory_access;
mod page;
mod ram;

pub use self::{
    address::{Gcphys, Gfn, Hcphys, PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE, page_count},
    config::PhysHandlerConfig,
    driver::{NotifySink, PageStore, PgmDriver, ShadowUpdate, TranslationPool, TranslationUpdate},
    error::PgmError,
    memory_access::MemoryAccess,
    page::{
        BackingState, HandlerKind, HandlerState, Mmio2Handle, PageDescriptor, PageId, PageType,
    },
    ram::{RamRange, RamRangeHint},
};
