use pgm_core::{Gcphys, PgmError};
use smallvec::SmallVec;

use crate::PhysHandler;

/// Pages whose cached translations could not be updated in place.
pub type ResyncPages = SmallVec<[Gcphys; 1]>;

/// Outcome of an operation that changed page protection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[must_use = "a resync request must be forwarded to the paging code"]
pub enum SyncStatus {
    /// Every translation was brought up to date.
    #[default]
    Done,

    /// The guest page tables of the listed pages must be resynchronized
    /// before the new protection is fully in effect.
    NeedsResync(ResyncPages),
}

impl SyncStatus {
    /// Checks if a resync is required.
    pub fn needs_resync(&self) -> bool {
        matches!(self, Self::NeedsResync(_))
    }

    pub(crate) fn add_resync(&mut self, gcphys: Gcphys) {
        match self {
            Self::Done => *self = Self::NeedsResync(SmallVec::from_elem(gcphys, 1)),
            Self::NeedsResync(pages) => pages.push(gcphys),
        }
    }

    pub(crate) fn merge(&mut self, other: SyncStatus) {
        if let Self::NeedsResync(pages) = other {
            for gcphys in pages {
                self.add_resync(gcphys);
            }
        }
    }
}

/// Outcome of an alias request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasStatus {
    /// The page now maps the requested backing.
    Aliased,

    /// The page already mapped the requested backing. Nothing changed.
    AlreadyAliased,
}

/// Whether a deregistered range should become ordinary RAM again in the
/// hardware-assisted virtualization backend.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RestoreAsRam {
    /// Restore unless the handler is of the MMIO kind.
    #[default]
    Auto,

    /// Always restore.
    Yes,

    /// Never restore.
    No,
}

/// A failed registration.
///
/// Carries the handler back to the caller, still detached.
#[derive(thiserror::Error, Debug)]
#[error("{error}")]
pub struct RegisterError {
    /// Why the registration failed.
    pub error: PgmError,

    /// The handler that could not be registered.
    pub handler: PhysHandler,
}

impl From<RegisterError> for PgmError {
    fn from(value: RegisterError) -> Self {
        value.error
    }
}
