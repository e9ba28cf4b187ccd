use crate::{
    Gcphys, HandlerKind, Hcphys, MemoryAccess, Mmio2Handle, PageDescriptor, PageType, PgmError,
    RamRange, RamRangeHint,
};

/// Access to the guest physical page database.
pub trait PageStore {
    /// Returns a copy of the descriptor of the page containing `gcphys`.
    fn page(&self, gcphys: Gcphys) -> Result<PageDescriptor, PgmError>;

    /// Returns the descriptor of the page containing `gcphys` for update.
    fn page_mut(&mut self, gcphys: Gcphys) -> Result<&mut PageDescriptor, PgmError>;

    /// Returns the descriptor of the page containing `gcphys` for update,
    /// starting the search at the range recorded in `hint` and updating
    /// the hint afterwards.
    fn page_mut_with_hint(
        &mut self,
        gcphys: Gcphys,
        hint: &mut RamRangeHint,
    ) -> Result<&mut PageDescriptor, PgmError> {
        let _ = hint;
        self.page_mut(gcphys)
    }

    /// Returns the RAM range containing `gcphys`.
    fn range_containing(&self, gcphys: Gcphys) -> Option<RamRange>;

    /// Returns all RAM ranges in ascending address order.
    fn ram_ranges(&self) -> Vec<RamRange>;

    /// Returns a copy of the descriptor of a page of an MMIO2 region.
    fn mmio2_page(&self, region: Mmio2Handle, offset: u64) -> Result<PageDescriptor, PgmError>;

    /// Returns the host physical address of the shared zero page.
    fn zero_page(&self) -> Hcphys;

    /// Drops the cached address-to-pointer translation of a page.
    fn invalidate_page_map_tlb_entry(&mut self, gcphys: Gcphys);
}

/// How the translation pool deals with existing shadow entries of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowUpdate {
    /// Entries may be updated in place to reflect the new page state.
    InPlace,

    /// Entries must be flushed.
    Flush,
}

/// Result of a translation pool update.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TranslationUpdate {
    /// Some translations could not be updated; the guest page tables must
    /// be resynchronized.
    pub resync: bool,

    /// A TLB flush on all virtual CPUs is required.
    pub flush_tlbs: bool,
}

/// The shadow/nested page table pool.
pub trait TranslationPool {
    /// Brings every cached translation of a page in line with `page`.
    fn update_translations_for_page(
        &mut self,
        gcphys: Gcphys,
        page: &PageDescriptor,
        mode: ShadowUpdate,
    ) -> Result<TranslationUpdate, PgmError>;

    /// Flushes the TLBs of all virtual CPUs.
    fn flush_all_tlbs(&mut self);
}

/// Sink for notifications to a hardware-assisted virtualization backend.
///
/// All methods default to doing nothing, which models a configuration
/// without such a backend.
pub trait NotifySink {
    /// The protection of a page changed.
    fn page_protection_changed(
        &mut self,
        gcphys: Gcphys,
        hc_phys: Hcphys,
        access: MemoryAccess,
        page_type: PageType,
        nem_state: &mut u8,
    ) {
        let _ = (gcphys, hc_phys, access, page_type, nem_state);
    }

    /// The backing of a page changed.
    fn page_backing_changed(
        &mut self,
        gcphys: Gcphys,
        old_hc_phys: Hcphys,
        new_hc_phys: Hcphys,
        access: MemoryAccess,
        page_type: PageType,
        nem_state: &mut u8,
    ) {
        let _ = (gcphys, old_hc_phys, new_hc_phys, access, page_type, nem_state);
    }

    /// A handler was registered over `size` bytes at `gcphys`.
    fn handler_registered(&mut self, kind: HandlerKind, gcphys: Gcphys, size: u64) {
        let _ = (kind, gcphys, size);
    }

    /// A handler was deregistered. The range is page aligned and excludes
    /// edge pages still covered by other handlers.
    fn handler_deregistered(
        &mut self,
        kind: HandlerKind,
        gcphys: Gcphys,
        size: u64,
        restore_as_ram: bool,
    ) {
        let _ = (kind, gcphys, size, restore_as_ram);
    }

    /// A handler moved from `old_gcphys` to `new_gcphys`.
    fn handler_modified(
        &mut self,
        kind: HandlerKind,
        old_gcphys: Gcphys,
        new_gcphys: Gcphys,
        size: u64,
        restore_as_ram: bool,
    ) {
        let _ = (kind, old_gcphys, new_gcphys, size, restore_as_ram);
    }
}

/// A driver providing every collaborator the handler engine needs.
pub trait PgmDriver: PageStore + TranslationPool + NotifySink + Send {}

impl<T> PgmDriver for T where T: PageStore + TranslationPool + NotifySink + Send {}
