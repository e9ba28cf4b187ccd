use std::sync::Arc;

use pgm_core::{Gcphys, HandlerKind, HandlerState, PAGE_SIZE, page_count};

use crate::{HandlerTypeId, PhysAccessHandler, UserData};

/// A physical access handler registration.
///
/// Values of this type are *detached*: they are not in the handler tree
/// and their range is unset. Registering one moves it into the tree, where
/// it is addressed by its first byte. Deregistering hands it back.
/// A detached handler holds a reference to its type and must be passed to
/// [`PhysHandlers::destroy`] or registered again.
///
/// [`PhysHandlers::destroy`]: crate::PhysHandlers::destroy
#[derive(Debug)]
#[must_use = "detached handlers must be registered or destroyed"]
pub struct PhysHandler {
    pub(crate) start: Gcphys,
    pub(crate) last: Gcphys,
    pub(crate) type_id: HandlerTypeId,
    pub(crate) kind: HandlerKind,
    pub(crate) state: HandlerState,
    pub(crate) page_count: u64,
    pub(crate) aliased_pages: u64,
    pub(crate) temp_off_pages: u64,
    pub(crate) user: UserData,
    pub(crate) user_restricted: UserData,
    pub(crate) description: Arc<str>,
}

impl PhysHandler {
    pub(crate) fn new(
        type_id: HandlerTypeId,
        kind: HandlerKind,
        state: HandlerState,
        user: UserData,
        user_restricted: UserData,
        description: Arc<str>,
    ) -> Self {
        Self {
            start: Gcphys::NIL,
            last: Gcphys::NIL,
            type_id,
            kind,
            state,
            page_count: 0,
            aliased_pages: 0,
            temp_off_pages: 0,
            user,
            user_restricted,
            description,
        }
    }

    /// Returns the handler type.
    pub fn type_id(&self) -> HandlerTypeId {
        self.type_id
    }

    /// Returns the kind of the handler type.
    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    /// Returns the description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the full-context and restricted-context user data.
    pub fn user_data(&self) -> (UserData, UserData) {
        (self.user, self.user_restricted)
    }

    pub(crate) fn set_range(&mut self, start: Gcphys, last: Gcphys) {
        self.start = start;
        self.last = last;
        self.page_count = page_count(start, last);
    }

    pub(crate) fn detach(&mut self) {
        self.start = Gcphys::NIL;
        self.last = Gcphys::NIL;
        self.page_count = 0;
    }

    pub(crate) fn contains(&self, gcphys: Gcphys) -> bool {
        self.start <= gcphys && gcphys <= self.last
    }

    /// Checks if the page containing `gcphys` is touched by the handler.
    pub(crate) fn covers_page(&self, gcphys: Gcphys) -> bool {
        let gfn = gcphys.gfn();
        self.start.gfn() <= gfn && gfn <= self.last.gfn()
    }

    /// First byte of every page touched by the handler.
    pub(crate) fn pages(&self) -> impl Iterator<Item = Gcphys> + use<> {
        let base = self.start.page_align_down();
        (0..self.page_count).map(move |index| base + index * PAGE_SIZE)
    }

    pub(crate) fn info(&self) -> PhysHandlerInfo {
        PhysHandlerInfo {
            start: self.start,
            last: self.last,
            type_id: self.type_id,
            kind: self.kind,
            page_count: self.page_count,
            aliased_pages: self.aliased_pages,
            temp_off_pages: self.temp_off_pages,
            user: self.user,
            user_restricted: self.user_restricted,
            description: self.description.clone(),
        }
    }
}

/// Snapshot of a live handler registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysHandlerInfo {
    /// First byte of the range. This is the handler key.
    pub start: Gcphys,

    /// Last byte of the range (inclusive).
    pub last: Gcphys,

    /// The handler type.
    pub type_id: HandlerTypeId,

    /// Kind of the handler type.
    pub kind: HandlerKind,

    /// Number of pages touched by the range.
    pub page_count: u64,

    /// Number of pages currently aliased to other backing.
    pub aliased_pages: u64,

    /// Number of pages with monitoring temporarily switched off.
    pub temp_off_pages: u64,

    /// Full-context user data.
    pub user: UserData,

    /// Restricted-context user data.
    pub user_restricted: UserData,

    /// Description.
    pub description: Arc<str>,
}

impl std::fmt::Display for PhysHandlerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}-{} {:?} pages={} aliased={} off={} {}",
            self.start,
            self.last,
            self.kind,
            self.page_count,
            self.aliased_pages,
            self.temp_off_pages,
            self.description
        )
    }
}

/// Result of a handler lookup by address.
///
/// Carries everything the fault path needs to invoke the handler.
#[derive(Clone)]
pub struct PhysHandlerLookup {
    /// First byte of the handler range.
    pub start: Gcphys,

    /// Last byte of the handler range.
    pub last: Gcphys,

    /// Kind of the handler type.
    pub kind: HandlerKind,

    /// Full-context handler.
    pub handler: Arc<dyn PhysAccessHandler>,

    /// Restricted-context handler, if the type has one.
    pub restricted: Option<Arc<dyn PhysAccessHandler>>,

    /// Full-context user data.
    pub user: UserData,

    /// Restricted-context user data.
    pub user_restricted: UserData,
}

impl std::fmt::Debug for PhysHandlerLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PhysHandlerLookup")
            .field("start", &self.start)
            .field("last", &self.last)
            .field("kind", &self.kind)
            .field("restricted", &self.restricted.is_some())
            .field("user", &self.user)
            .field("user_restricted", &self.user_restricted)
            .finish()
    }
}
