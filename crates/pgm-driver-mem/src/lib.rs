//! In-memory driver for the physical handler engine.
//!
//! [`MemDriver`] implements every collaborator the engine consumes:
//!
//! - a page database of RAM, MMIO and MMIO2 pages ([`PageStore`]),
//! - a model of the shadow page table pool that records updates and TLB
//!   flushes ([`TranslationPool`]),
//! - a notification sink that records every event ([`NotifySink`]),
//! - a page-map TLB caching guest page to host backing translations.
//!
//! It is used by the test suites and is handy for experimenting with
//! handler layouts without a hypervisor.

mod config;
mod error;
mod event;
mod map;
mod pool;

use std::num::NonZeroUsize;

use lru::LruCache;
use pgm_core::{
    Gcphys, Gfn, HandlerKind, Hcphys, MemoryAccess, Mmio2Handle, NotifySink, PageDescriptor,
    PageStore, PageType, PgmError, RamRange, RamRangeHint, ShadowUpdate, TranslationPool,
    TranslationUpdate,
};

pub use self::{config::MemDriverConfig, error::Error, event::NotifyEvent, pool::PoolUpdate};
use self::{map::MemoryMap, pool::ShadowPool};

/// In-memory driver.
pub struct MemDriver {
    map: MemoryMap,
    pool: ShadowPool,
    events: Vec<NotifyEvent>,
    page_map_tlb: LruCache<Gfn, Hcphys>,
}

impl Default for MemDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemDriver {
    /// Creates an empty driver with the default configuration.
    pub fn new() -> Self {
        Self::with_config(MemDriverConfig::default())
    }

    /// Creates an empty driver.
    pub fn with_config(config: MemDriverConfig) -> Self {
        let capacity = NonZeroUsize::new(config.page_map_tlb_entries).unwrap_or(NonZeroUsize::MIN);

        Self {
            map: MemoryMap::new(),
            pool: ShadowPool::default(),
            events: Vec::new(),
            page_map_tlb: LruCache::new(capacity),
        }
    }

    /// Adds `size` bytes of allocated RAM at `start`.
    pub fn add_ram(&mut self, start: Gcphys, size: u64) -> Result<RamRange, PgmError> {
        let range = self.map.add_ram(start, size)?;
        tracing::debug!(start = %range.start, last = %range.last, "added RAM range");
        Ok(range)
    }

    /// Adds `size` bytes of unbacked MMIO at `start`.
    pub fn add_mmio(&mut self, start: Gcphys, size: u64) -> Result<RamRange, PgmError> {
        let range = self.map.add_mmio(start, size)?;
        tracing::debug!(start = %range.start, last = %range.last, "added MMIO range");
        Ok(range)
    }

    /// Adds an MMIO2 region of `size` bytes.
    pub fn add_mmio2_region(&mut self, size: u64) -> Result<Mmio2Handle, PgmError> {
        let region = self.map.add_mmio2_region(size)?;
        tracing::debug!(?region, size, "added MMIO2 region");
        Ok(region)
    }

    /// Makes in-place translation updates of the page report a resync.
    pub fn mark_stale(&mut self, gcphys: Gcphys) {
        self.pool.stale_pages.insert(gcphys.gfn());
    }

    /// Makes every translation update ask for a TLB flush.
    pub fn set_flush_on_update(&mut self, flush: bool) {
        self.pool.flush_on_update = flush;
    }

    /// Returns the translation pool updates seen so far.
    pub fn pool_updates(&self) -> &[PoolUpdate] {
        &self.pool.updates
    }

    /// Returns the number of TLB flushes seen so far.
    pub fn tlb_flushes(&self) -> usize {
        self.pool.tlb_flushes
    }

    /// Returns the notifications seen so far.
    pub fn events(&self) -> &[NotifyEvent] {
        &self.events
    }

    /// Takes the notifications seen so far.
    pub fn take_events(&mut self) -> Vec<NotifyEvent> {
        std::mem::take(&mut self.events)
    }

    /// Translates a guest page to its host backing, caching the result in
    /// the page-map TLB.
    pub fn map_page(&mut self, gcphys: Gcphys) -> Result<Hcphys, PgmError> {
        if let Some(&hc_phys) = self.page_map_tlb.get(&gcphys.gfn()) {
            return Ok(hc_phys);
        }

        let hc_phys = self.map.page(gcphys)?.hc_phys;
        self.page_map_tlb.put(gcphys.gfn(), hc_phys);
        Ok(hc_phys)
    }

    /// Returns the cached translation of a guest page, if any.
    pub fn cached_mapping(&self, gcphys: Gcphys) -> Option<Hcphys> {
        self.page_map_tlb.peek(&gcphys.gfn()).copied()
    }
}

impl PageStore for MemDriver {
    fn page(&self, gcphys: Gcphys) -> Result<PageDescriptor, PgmError> {
        Ok(*self.map.page(gcphys)?)
    }

    fn page_mut(&mut self, gcphys: Gcphys) -> Result<&mut PageDescriptor, PgmError> {
        Ok(self.map.page_mut(gcphys)?)
    }

    fn page_mut_with_hint(
        &mut self,
        gcphys: Gcphys,
        hint: &mut RamRangeHint,
    ) -> Result<&mut PageDescriptor, PgmError> {
        Ok(self.map.page_mut_with_hint(gcphys, hint)?)
    }

    fn range_containing(&self, gcphys: Gcphys) -> Option<RamRange> {
        self.map.range_containing(gcphys)
    }

    fn ram_ranges(&self) -> Vec<RamRange> {
        self.map.ram_ranges()
    }

    fn mmio2_page(&self, region: Mmio2Handle, offset: u64) -> Result<PageDescriptor, PgmError> {
        Ok(*self.map.mmio2_page(region, offset)?)
    }

    fn zero_page(&self) -> Hcphys {
        map::ZERO_PAGE
    }

    fn invalidate_page_map_tlb_entry(&mut self, gcphys: Gcphys) {
        self.page_map_tlb.pop(&gcphys.gfn());
    }
}

impl TranslationPool for MemDriver {
    fn update_translations_for_page(
        &mut self,
        gcphys: Gcphys,
        page: &PageDescriptor,
        mode: ShadowUpdate,
    ) -> Result<TranslationUpdate, PgmError> {
        Ok(self.pool.update(gcphys, page.handler_state, mode))
    }

    fn flush_all_tlbs(&mut self) {
        tracing::trace!("flushing all TLBs");
        self.pool.tlb_flushes += 1;
    }
}

impl NotifySink for MemDriver {
    fn page_protection_changed(
        &mut self,
        gcphys: Gcphys,
        hc_phys: Hcphys,
        access: MemoryAccess,
        page_type: PageType,
        nem_state: &mut u8,
    ) {
        *nem_state = access.bits();
        self.events.push(NotifyEvent::ProtectionChanged {
            gcphys,
            hc_phys,
            access,
            page_type,
        });
    }

    fn page_backing_changed(
        &mut self,
        gcphys: Gcphys,
        old_hc_phys: Hcphys,
        new_hc_phys: Hcphys,
        access: MemoryAccess,
        page_type: PageType,
        nem_state: &mut u8,
    ) {
        *nem_state = access.bits();
        self.events.push(NotifyEvent::BackingChanged {
            gcphys,
            old_hc_phys,
            new_hc_phys,
            access,
            page_type,
        });
    }

    fn handler_registered(&mut self, kind: HandlerKind, gcphys: Gcphys, size: u64) {
        self.events
            .push(NotifyEvent::Registered { kind, gcphys, size });
    }

    fn handler_deregistered(
        &mut self,
        kind: HandlerKind,
        gcphys: Gcphys,
        size: u64,
        restore_as_ram: bool,
    ) {
        self.events.push(NotifyEvent::Deregistered {
            kind,
            gcphys,
            size,
            restore_as_ram,
        });
    }

    fn handler_modified(
        &mut self,
        kind: HandlerKind,
        old_gcphys: Gcphys,
        new_gcphys: Gcphys,
        size: u64,
        restore_as_ram: bool,
    ) {
        self.events.push(NotifyEvent::Modified {
            kind,
            old_gcphys,
            new_gcphys,
            size,
            restore_as_ram,
        });
    }
}
