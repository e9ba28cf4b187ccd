use std::sync::Arc;

use indexmap::IndexMap;
use pgm_core::{Gcphys, HandlerKind, HandlerState, PgmError};

/// Opaque per-registration value handed back to the access handler.
pub type UserData = u64;

/// Identifier of a registered handler type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerTypeId(pub(crate) u32);

impl std::fmt::Display for HandlerTypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of a trapped access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// The guest reads from the page.
    Read,

    /// The guest writes to the page.
    Write,
}

/// What the faulting path should do after the handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDisposition {
    /// The handler emulated the access.
    Handled,

    /// The access should be carried out on the backing memory.
    Default,
}

/// Callback invoked for a trapped access.
///
/// Implemented by the device emulation layer. A handler type carries a
/// full-context handler and optionally a restricted-context one.
pub trait PhysAccessHandler: Send + Sync {
    /// Handles an access of `buffer.len()` bytes at `gcphys`.
    ///
    /// For reads, the handler fills `buffer`. For writes, `buffer` holds
    /// the data written by the guest.
    fn handle(
        &self,
        gcphys: Gcphys,
        buffer: &mut [u8],
        access: AccessKind,
        user: UserData,
    ) -> AccessDisposition;
}

/// A registered handler type.
pub(crate) struct HandlerType {
    pub kind: HandlerKind,
    pub state: HandlerState,
    pub description: Arc<str>,
    pub handler: Arc<dyn PhysAccessHandler>,
    pub restricted: Option<Arc<dyn PhysAccessHandler>>,
    ref_count: u32,
}

/// Reference counted table of handler types.
///
/// Counts are only touched with the engine lock held, which is what
/// serializes the removal on the final release.
#[derive(Default)]
pub(crate) struct HandlerTypeRegistry {
    types: IndexMap<HandlerTypeId, HandlerType>,
    next_id: u32,
}

impl HandlerTypeRegistry {
    pub fn create(
        &mut self,
        kind: HandlerKind,
        handler: Arc<dyn PhysAccessHandler>,
        restricted: Option<Arc<dyn PhysAccessHandler>>,
        description: Arc<str>,
    ) -> HandlerTypeId {
        let id = HandlerTypeId(self.next_id);
        self.next_id += 1;

        tracing::debug!(%id, ?kind, %description, "created handler type");

        self.types.insert(
            id,
            HandlerType {
                kind,
                state: kind.page_state(),
                description,
                handler,
                restricted,
                ref_count: 1,
            },
        );

        id
    }

    pub fn get(&self, id: HandlerTypeId) -> Option<&HandlerType> {
        self.types.get(&id)
    }

    pub fn ref_count(&self, id: HandlerTypeId) -> Option<u32> {
        self.types.get(&id).map(|ty| ty.ref_count)
    }

    pub fn retain(&mut self, id: HandlerTypeId) -> Result<u32, PgmError> {
        let ty = self
            .types
            .get_mut(&id)
            .ok_or(PgmError::InvalidHandlerType(id.0))?;

        ty.ref_count += 1;
        Ok(ty.ref_count)
    }

    pub fn release(&mut self, id: HandlerTypeId) -> Result<u32, PgmError> {
        let ty = self
            .types
            .get_mut(&id)
            .ok_or(PgmError::InvalidHandlerType(id.0))?;

        debug_assert!(ty.ref_count > 0);
        ty.ref_count -= 1;

        let ref_count = ty.ref_count;
        if ref_count == 0
            && let Some(ty) = self.types.shift_remove(&id)
        {
            tracing::debug!(%id, description = %ty.description, "destroyed handler type");
        }

        Ok(ref_count)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (HandlerTypeId, &HandlerType)> {
        self.types.iter().map(|(&id, ty)| (id, ty))
    }
}
