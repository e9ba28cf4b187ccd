use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use pgm_core::{
    Gcphys, HandlerKind, Hcphys, Mmio2Handle, PgmDriver, PgmError, PhysHandlerConfig,
};

use crate::{
    AliasSource, AliasStatus, HandlerTypeId, Inconsistency, LookupStats, PhysAccessHandler,
    PhysHandler, PhysHandlerInfo, PhysHandlerLookup, RegisterError, RestoreAsRam, SyncStatus,
    UserData, alias, audit,
    handler_type::HandlerTypeRegistry,
    sync,
    tree::HandlerTree,
};

/// Everything guarded by the handler lock.
struct State<Driver>
where
    Driver: PgmDriver,
{
    driver: Driver,
    types: HandlerTypeRegistry,
    tree: HandlerTree,
    config: PhysHandlerConfig,

    /// Handler records in existence, live or detached.
    allocated: usize,
}

/// Physical access handler engine.
///
/// Owns the handler types, the tree of live registrations and the driver
/// providing the page database. Every operation runs under one lock, held
/// for the whole operation including the calls into the driver.
///
/// Live registrations are addressed by their first byte (the *key*).
///
/// # Examples
///
/// ```
/// # use std::sync::Arc;
/// # use pgm_core::{Gcphys, HandlerKind, HandlerState, PageStore};
/// # use pgm_driver_mem::MemDriver;
/// # use pgm_handler::{AccessDisposition, AccessKind, PhysAccessHandler, PhysHandlers, UserData};
/// struct Framebuffer;
///
/// impl PhysAccessHandler for Framebuffer {
///     fn handle(&self, _: Gcphys, _: &mut [u8], _: AccessKind, _: UserData) -> AccessDisposition {
///         AccessDisposition::Default
///     }
/// }
///
/// # fn main() -> Result<(), pgm_core::PgmError> {
/// let mut driver = MemDriver::new();
/// driver.add_ram(Gcphys(0), 0x10_0000)?;
///
/// let handlers = PhysHandlers::new(driver);
/// let vga = handlers.create_type(HandlerKind::Write, Arc::new(Framebuffer), None, "vga");
///
/// let _ = handlers.register(vga, Gcphys(0xa_0000), Gcphys(0xb_ffff), 0, 0, None)?;
/// let page = handlers.driver().page(Gcphys(0xa_8000))?;
/// assert_eq!(page.handler_state, HandlerState::Write);
///
/// handlers.deregister(Gcphys(0xa_0000))?;
/// # Ok(())
/// # }
/// ```
pub struct PhysHandlers<Driver>
where
    Driver: PgmDriver,
{
    state: Mutex<State<Driver>>,
}

impl<Driver> PhysHandlers<Driver>
where
    Driver: PgmDriver,
{
    /// Creates a new engine with the default configuration.
    pub fn new(driver: Driver) -> Self {
        Self::with_config(driver, PhysHandlerConfig::default())
    }

    /// Creates a new engine.
    pub fn with_config(driver: Driver, config: PhysHandlerConfig) -> Self {
        Self {
            state: Mutex::new(State {
                driver,
                types: HandlerTypeRegistry::default(),
                tree: HandlerTree::default(),
                config,
                allocated: 0,
            }),
        }
    }

    /// Returns the driver.
    ///
    /// The handler lock is held while the guard lives.
    pub fn driver(&self) -> MappedMutexGuard<'_, Driver> {
        MutexGuard::map(self.state.lock(), |state| &mut state.driver)
    }

    /// Deregisters and destroys every live handler and returns the driver.
    pub fn teardown(self) -> Driver {
        let mut state = self.state.into_inner();

        tracing::debug!(
            handlers = state.tree.len(),
            types = state.types.len(),
            "tearing down handlers"
        );

        let keys = state.tree.iter().map(|handler| handler.start).collect::<Vec<_>>();
        for key in keys {
            if let Err(err) = state
                .deregister_ex(key, RestoreAsRam::Auto)
                .and_then(|handler| state.destroy(handler))
            {
                tracing::error!(%key, %err, "failed to tear down handler");
            }
        }

        for (id, ty) in state.types.iter() {
            tracing::warn!(
                %id,
                description = %ty.description,
                ref_count = ?state.types.ref_count(id),
                "handler type still referenced at teardown"
            );
        }

        if state.allocated != 0 {
            tracing::warn!(allocated = state.allocated, "detached handlers leaked");
        }

        state.driver
    }

    /// Creates a handler type with a reference count of one.
    pub fn create_type(
        &self,
        kind: HandlerKind,
        handler: Arc<dyn PhysAccessHandler>,
        restricted: Option<Arc<dyn PhysAccessHandler>>,
        description: impl Into<Arc<str>>,
    ) -> HandlerTypeId {
        self.state
            .lock()
            .types
            .create(kind, handler, restricted, description.into())
    }

    /// Adds a reference to a handler type and returns the new count.
    pub fn retain_type(&self, id: HandlerTypeId) -> Result<u32, PgmError> {
        self.state.lock().types.retain(id)
    }

    /// Drops a reference to a handler type and returns the new count.
    ///
    /// The type is destroyed when the count reaches zero.
    pub fn release_type(&self, id: HandlerTypeId) -> Result<u32, PgmError> {
        self.state.lock().types.release(id)
    }

    /// Returns the reference count of a handler type, or `None` if the
    /// type does not exist.
    pub fn type_ref_count(&self, id: HandlerTypeId) -> Option<u32> {
        self.state.lock().types.ref_count(id)
    }

    /// Creates a detached handler of the given type.
    ///
    /// Without a description, the handler uses the description of its type.
    pub fn create(
        &self,
        type_id: HandlerTypeId,
        user: UserData,
        user_restricted: UserData,
        description: Option<&str>,
    ) -> Result<PhysHandler, PgmError> {
        self.state
            .lock()
            .create(type_id, user, user_restricted, description)
    }

    /// Destroys a detached handler, dropping its reference to the type.
    pub fn destroy(&self, handler: PhysHandler) -> Result<(), PgmError> {
        self.state.lock().destroy(handler)
    }

    /// Registers a detached handler over `[start, last]`.
    ///
    /// On failure, the handler is handed back still detached.
    pub fn register_ex(
        &self,
        handler: PhysHandler,
        start: Gcphys,
        last: Gcphys,
    ) -> Result<SyncStatus, RegisterError> {
        self.state.lock().register_ex(handler, start, last)
    }

    /// Creates and registers a handler over `[start, last]`.
    ///
    /// On failure, the handler is destroyed. The live handler is addressed
    /// by `start` afterwards.
    pub fn register(
        &self,
        type_id: HandlerTypeId,
        start: Gcphys,
        last: Gcphys,
        user: UserData,
        user_restricted: UserData,
        description: Option<&str>,
    ) -> Result<SyncStatus, PgmError> {
        let mut state = self.state.lock();

        let handler = state.create(type_id, user, user_restricted, description)?;
        match state.register_ex(handler, start, last) {
            Ok(status) => Ok(status),
            Err(RegisterError { error, handler }) => {
                state.destroy(handler)?;
                Err(error)
            }
        }
    }

    /// Deregisters the handler at `key` and hands it back detached.
    pub fn deregister_ex(
        &self,
        key: Gcphys,
        restore: RestoreAsRam,
    ) -> Result<PhysHandler, PgmError> {
        self.state.lock().deregister_ex(key, restore)
    }

    /// Deregisters and destroys the handler at `key`.
    pub fn deregister(&self, key: Gcphys) -> Result<(), PgmError> {
        let mut state = self.state.lock();
        let handler = state.deregister_ex(key, RestoreAsRam::Auto)?;
        state.destroy(handler)
    }

    /// Moves the handler at `key` to `[start, last]`.
    ///
    /// If the new range is rejected, the handler is destroyed. Any error
    /// means the handler at `key` is gone.
    pub fn modify(&self, key: Gcphys, start: Gcphys, last: Gcphys) -> Result<SyncStatus, PgmError> {
        self.state.lock().modify(key, start, last)
    }

    /// Splits the handler at `key` in two, the second half starting at `at`.
    pub fn split(&self, key: Gcphys, at: Gcphys) -> Result<(), PgmError> {
        self.state.lock().split(key, at)
    }

    /// Joins two adjacent handlers of the same type into the first.
    pub fn join(&self, first: Gcphys, second: Gcphys) -> Result<(), PgmError> {
        self.state.lock().join(first, second)
    }

    /// Undoes every alias and temporary switch-off of the handler at `key`.
    pub fn reset(&self, key: Gcphys) -> Result<SyncStatus, PgmError> {
        self.state.lock().reset(key)
    }

    /// Replaces the user data of the handler at `key`.
    pub fn change_user_data(
        &self,
        key: Gcphys,
        user: UserData,
        user_restricted: UserData,
    ) -> Result<(), PgmError> {
        let mut state = self.state.lock();
        let handler = state.tree.get_mut(key).ok_or(PgmError::NotFound(key))?;
        handler.user = user;
        handler.user_restricted = user_restricted;
        Ok(())
    }

    /// Temporarily switches off monitoring of one page of the handler at
    /// `key`, until the handler is reset.
    pub fn temp_off(&self, key: Gcphys, page: Gcphys) -> Result<(), PgmError> {
        let mut state = self.state.lock();
        let State { driver, tree, .. } = &mut *state;

        alias::temp_off_page(driver, tree, key, page)
    }

    /// Aliases an MMIO page of the handler at `key` to a page of an MMIO2
    /// region.
    pub fn alias_mmio2_page(
        &self,
        key: Gcphys,
        page: Gcphys,
        region: Mmio2Handle,
        offset: u64,
    ) -> Result<AliasStatus, PgmError> {
        self.state
            .lock()
            .alias(key, page, AliasSource::Mmio2 { region, offset })
    }

    /// Aliases an MMIO page of the handler at `key` to a host page.
    pub fn alias_host_page(
        &self,
        key: Gcphys,
        page: Gcphys,
        hc_phys: Hcphys,
    ) -> Result<AliasStatus, PgmError> {
        self.state.lock().alias(key, page, AliasSource::Host(hc_phys))
    }

    /// Unaliases every aliased page of guest memory.
    ///
    /// Used when the guest memory is reset. Returns the number of pages
    /// unaliased.
    pub fn reset_all_aliases(&self) -> Result<usize, PgmError> {
        let mut state = self.state.lock();
        let State { driver, tree, .. } = &mut *state;

        let mut count = 0;
        for range in driver.ram_ranges() {
            for gcphys in range.pages() {
                if driver.page(gcphys)?.page_type.is_mmio_alias() {
                    alias::reset_aliased_page(driver, gcphys, Some(&mut *tree))?;
                    count += 1;
                }
            }
        }

        tracing::debug!(count, "reset all aliases");
        Ok(count)
    }

    /// Checks if a handler covers `gcphys`.
    pub fn is_registered(&self, gcphys: Gcphys) -> bool {
        self.state.lock().tree.find(gcphys).is_some()
    }

    /// Checks if the handler covering `gcphys` traps every access, as
    /// opposed to writes only.
    ///
    /// Must only be called for monitored addresses.
    pub fn is_all_access_kind(&self, gcphys: Gcphys) -> bool {
        let state = self.state.lock();

        let handler = state.tree.find(gcphys);
        debug_assert!(handler.is_some(), "no handler covers {gcphys}");
        handler.is_none_or(|handler| handler.kind != HandlerKind::Write)
    }

    /// Looks up the handler covering `gcphys`.
    pub fn lookup(&self, gcphys: Gcphys) -> Option<PhysHandlerLookup> {
        let state = self.state.lock();

        let handler = state.tree.find(gcphys)?;
        let ty = state.types.get(handler.type_id)?;

        Some(PhysHandlerLookup {
            start: handler.start,
            last: handler.last,
            kind: handler.kind,
            handler: ty.handler.clone(),
            restricted: ty.restricted.clone(),
            user: handler.user,
            user_restricted: handler.user_restricted,
        })
    }

    /// Returns the live handler at `key`.
    pub fn handler(&self, key: Gcphys) -> Option<PhysHandlerInfo> {
        self.state.lock().tree.get(key).map(PhysHandler::info)
    }

    /// Returns every live handler in address order.
    pub fn handlers(&self) -> Vec<PhysHandlerInfo> {
        self.state.lock().tree.iter().map(PhysHandler::info).collect()
    }

    /// Returns the statistics of the lookup cache.
    pub fn lookup_stats(&self) -> LookupStats {
        self.state.lock().tree.stats()
    }

    /// Checks the registrations against the page states.
    pub fn audit(&self) -> Result<Vec<Inconsistency>, PgmError> {
        let state = self.state.lock();
        audit::audit(&state.driver, &state.tree)
    }
}

impl<Driver> State<Driver>
where
    Driver: PgmDriver,
{
    fn create(
        &mut self,
        type_id: HandlerTypeId,
        user: UserData,
        user_restricted: UserData,
        description: Option<&str>,
    ) -> Result<PhysHandler, PgmError> {
        if self.allocated >= self.config.max_handlers {
            return Err(PgmError::OutOfHandlers(self.config.max_handlers));
        }

        let ty = self
            .types
            .get(type_id)
            .ok_or(PgmError::InvalidHandlerType(type_id.0))?;

        let kind = ty.kind;
        let state = ty.state;
        let description = match description {
            Some(description) => Arc::from(description),
            None => ty.description.clone(),
        };

        self.types.retain(type_id)?;
        self.allocated += 1;

        Ok(PhysHandler::new(
            type_id,
            kind,
            state,
            user,
            user_restricted,
            description,
        ))
    }

    fn destroy(&mut self, handler: PhysHandler) -> Result<(), PgmError> {
        debug_assert!(handler.start.is_nil());

        self.allocated = self.allocated.saturating_sub(1);
        self.types.release(handler.type_id)?;
        Ok(())
    }

    fn validate_range(
        &self,
        kind: HandlerKind,
        start: Gcphys,
        last: Gcphys,
    ) -> Result<(), PgmError> {
        if start > last
            || (kind.is_page_granular() && !(start.is_page_aligned() && last.is_page_last_byte()))
        {
            return Err(PgmError::InvalidRange { start, last });
        }

        match self.driver.range_containing(start) {
            Some(range) if range.contains_range(start, last) => Ok(()),
            _ => Err(PgmError::NoRamRange { start, last }),
        }
    }

    fn register_ex(
        &mut self,
        mut handler: PhysHandler,
        start: Gcphys,
        last: Gcphys,
    ) -> Result<SyncStatus, RegisterError> {
        debug_assert!(handler.start.is_nil());

        let kind = handler.kind;
        if let Err(error) = self.validate_range(kind, start, last) {
            return Err(RegisterError { error, handler });
        }

        if let Some(error) = self.tree.conflict(start, last) {
            tracing::debug!(%start, %last, %error, "handler registration rejected");
            return Err(RegisterError { error, handler });
        }

        handler.set_range(start, last);
        let status = self.bring_up(handler)?;

        self.driver.handler_registered(kind, start, last - start + 1);

        tracing::debug!(%start, %last, ?kind, resync = status.needs_resync(), "registered handler");
        Ok(status)
    }

    /// Flags the pages of a handler whose range is set and inserts it.
    ///
    /// On failure, the pages are reset and the handler comes back detached.
    fn bring_up(&mut self, mut handler: PhysHandler) -> Result<SyncStatus, RegisterError> {
        let status = match sync::raise_page_states(
            &mut self.driver,
            &mut self.tree,
            handler.start,
            handler.last,
            handler.state,
        ) {
            Ok(status) => status,
            Err(error) => {
                self.take_down(&mut handler);
                return Err(RegisterError { error, handler });
            }
        };

        if let Err(mut err) = self.tree.insert(handler) {
            self.take_down(&mut err.handler);
            return Err(err);
        }

        Ok(status)
    }

    /// Resets the pages of a handler that is not in the tree and detaches it.
    fn take_down(&mut self, handler: &mut PhysHandler) {
        if let Err(err) = sync::reset_page_states(&mut self.driver, &mut self.tree, handler) {
            tracing::error!(start = %handler.start, %err, "failed to reset handler pages");
        }

        handler.detach();
    }

    fn deregister_ex(
        &mut self,
        key: Gcphys,
        restore: RestoreAsRam,
    ) -> Result<PhysHandler, PgmError> {
        let State { driver, tree, .. } = self;

        let mut handler = tree.remove(key).ok_or(PgmError::NotFound(key))?;
        let kind = handler.kind;
        let last = handler.last;

        let restore_as_ram = match restore {
            RestoreAsRam::Auto => kind != HandlerKind::Mmio,
            RestoreAsRam::Yes => true,
            RestoreAsRam::No => false,
        };

        let result = sync::reset_page_states(driver, tree, &mut handler).and_then(|()| {
            sync::notify_deregistration(driver, kind, key, last, restore_as_ram)
        });

        handler.detach();

        if let Err(err) = result {
            tracing::error!(%key, %err, "failed to deregister handler");
            self.destroy(handler)?;
            return Err(err);
        }

        tracing::debug!(start = %key, %last, ?kind, "deregistered handler");
        Ok(handler)
    }

    fn modify(&mut self, key: Gcphys, start: Gcphys, last: Gcphys) -> Result<SyncStatus, PgmError> {
        let mut handler = self.tree.remove(key).ok_or(PgmError::NotFound(key))?;
        let kind = handler.kind;
        let old_last = handler.last;

        if let Err(err) = sync::reset_page_states(&mut self.driver, &mut self.tree, &mut handler) {
            return Err(self.fail_modify(handler, key, old_last, err));
        }

        if let Err(err) = self.validate_range(kind, start, last) {
            return Err(self.fail_modify(handler, key, old_last, err));
        }

        if let Some(err) = self.tree.conflict(start, last) {
            return Err(self.fail_modify(handler, key, old_last, err));
        }

        handler.set_range(start, last);
        let status = match self.bring_up(handler) {
            Ok(status) => status,
            Err(RegisterError { error, handler }) => {
                return Err(self.fail_modify(handler, key, old_last, error));
            }
        };

        let size = last - start + 1;
        self.driver
            .handler_modified(kind, key, start, size, kind != HandlerKind::Mmio);
        self.driver.flush_all_tlbs();

        tracing::debug!(old = %key, %start, %last, "modified handler");
        Ok(status)
    }

    /// Disposes of a handler whose move failed after it left the tree.
    fn fail_modify(
        &mut self,
        mut handler: PhysHandler,
        old_start: Gcphys,
        old_last: Gcphys,
        err: PgmError,
    ) -> PgmError {
        let kind = handler.kind;

        tracing::debug!(%old_start, %old_last, %err, "handler destroyed by failed modification");

        if let Err(err) = sync::notify_deregistration(
            &mut self.driver,
            kind,
            old_start,
            old_last,
            kind != HandlerKind::Mmio,
        ) {
            tracing::warn!(%old_start, %err, "failed to announce release of modified handler");
        }

        handler.detach();
        if let Err(err) = self.destroy(handler) {
            tracing::error!(%old_start, %err, "failed to destroy modified handler");
        }

        self.tree.invalidate_last_hit();
        err
    }

    fn split(&mut self, key: Gcphys, at: Gcphys) -> Result<(), PgmError> {
        let handler = self.tree.get(key).ok_or(PgmError::NotFound(key))?;
        let start = handler.start;
        let last = handler.last;
        let kind = handler.kind;

        if at <= start || at > last || (kind.is_page_granular() && !at.is_page_aligned()) {
            return Err(PgmError::InvalidRange { start: at, last });
        }

        if self.allocated >= self.config.max_handlers {
            return Err(PgmError::OutOfHandlers(self.config.max_handlers));
        }

        let lower_counts = sync::count_pages(&self.driver, kind, start, at - 1)?;
        let upper_counts = sync::count_pages(&self.driver, kind, at, last)?;

        self.types.retain(handler.type_id)?;

        let mut upper = PhysHandler::new(
            handler.type_id,
            kind,
            handler.state,
            handler.user,
            handler.user_restricted,
            handler.description.clone(),
        );
        upper.set_range(at, last);
        (upper.aliased_pages, upper.temp_off_pages) = upper_counts;

        let lower = self
            .tree
            .get_mut(key)
            .ok_or(PgmError::Internal("split handler vanished"))?;
        let original_counts = (lower.aliased_pages, lower.temp_off_pages);
        lower.set_range(start, at - 1);
        (lower.aliased_pages, lower.temp_off_pages) = lower_counts;

        let inserted = self.tree.insert(upper);
        debug_assert!(inserted.is_ok(), "split halves overlap");

        if let Err(RegisterError { error, handler }) = inserted {
            tracing::error!(%key, %at, %error, "failed to insert upper half of split");

            if let Some(lower) = self.tree.get_mut(key) {
                lower.set_range(start, last);
                (lower.aliased_pages, lower.temp_off_pages) = original_counts;
            }

            self.types.release(handler.type_id)?;
            return Err(PgmError::Internal("split halves overlap"));
        }

        self.allocated += 1;

        tracing::debug!(%start, %at, %last, "split handler");
        Ok(())
    }

    fn join(&mut self, first: Gcphys, second: Gcphys) -> Result<(), PgmError> {
        let lower = self.tree.get(first).ok_or(PgmError::NotFound(first))?;
        let upper = self.tree.get(second).ok_or(PgmError::NotFound(second))?;

        if lower.last.checked_add(1) != Some(upper.start) {
            return Err(PgmError::NotAdjacent { first, second });
        }

        if lower.type_id != upper.type_id {
            return Err(PgmError::TypeMismatch { first, second });
        }

        let last = upper.last;
        let counts = sync::count_pages(&self.driver, lower.kind, first, last)?;

        let upper = self
            .tree
            .remove(second)
            .ok_or(PgmError::Internal("joined handler vanished"))?;

        let lower = self
            .tree
            .get_mut(first)
            .ok_or(PgmError::Internal("joined handler vanished"))?;
        lower.set_range(first, last);
        (lower.aliased_pages, lower.temp_off_pages) = counts;

        self.tree.invalidate_last_hit();
        self.allocated = self.allocated.saturating_sub(1);
        self.types.release(upper.type_id)?;

        tracing::debug!(%first, %last, "joined handlers");
        Ok(())
    }

    fn reset(&mut self, key: Gcphys) -> Result<SyncStatus, PgmError> {
        let State { driver, tree, .. } = self;

        let handler = tree.get(key).ok_or(PgmError::NotFound(key))?;
        let (start, last) = (handler.start, handler.last);
        let (kind, state) = (handler.kind, handler.state);
        let mut status = SyncStatus::Done;

        match kind {
            HandlerKind::Mmio => {
                debug_assert_eq!(handler.temp_off_pages, 0);

                if handler.aliased_pages > 0 {
                    for gcphys in handler.pages() {
                        if driver.page(gcphys)?.page_type.is_mmio_alias() {
                            alias::reset_aliased_page(driver, gcphys, None)?;
                        }
                    }
                }
            }
            HandlerKind::Write | HandlerKind::All => {
                status.merge(sync::raise_page_states(driver, tree, start, last, state)?);
            }
        }

        if let Some(handler) = tree.get_mut(key) {
            handler.aliased_pages = 0;
            handler.temp_off_pages = 0;
        }

        tracing::debug!(%key, resync = status.needs_resync(), "reset handler");
        Ok(status)
    }

    fn alias(
        &mut self,
        key: Gcphys,
        page: Gcphys,
        source: AliasSource,
    ) -> Result<AliasStatus, PgmError> {
        let State { driver, tree, .. } = self;

        let handler = tree.get_mut(key).ok_or(PgmError::NotFound(key))?;
        alias::alias_page(driver, handler, page, source)
    }
}
