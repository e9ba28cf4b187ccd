//! Guest physical memory access handlers.
//!
//! A device model registers a handler over a range of guest physical
//! memory to trap reads and writes to it. This crate keeps track of the
//! registrations and keeps the handler state of every page in line with
//! them, so that the paging code knows which pages to protect.
//!
//! The entry point is [`PhysHandlers`], which owns the registrations and a
//! [`PgmDriver`] giving access to the page database, the shadow page table
//! pool and the notification sink.
//!
//! [`PgmDriver`]: pgm_core::PgmDriver

mod alias;
mod audit;
mod handler;
mod handler_type;
mod handlers;
mod status;
mod sync;
mod tree;

#[cfg(test)]
mod tests;

pub use self::{
    alias::AliasSource,
    audit::Inconsistency,
    handler::{PhysHandler, PhysHandlerInfo, PhysHandlerLookup},
    handler_type::{AccessDisposition, AccessKind, HandlerTypeId, PhysAccessHandler, UserData},
    handlers::PhysHandlers,
    status::{AliasStatus, RegisterError, ResyncPages, RestoreAsRam, SyncStatus},
    tree::LookupStats,
};
