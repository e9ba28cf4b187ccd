use std::collections::HashSet;

use pgm_core::{Gcphys, Gfn, HandlerState, ShadowUpdate, TranslationUpdate};

/// A translation pool update as seen by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolUpdate {
    /// The page that was updated.
    pub gcphys: Gcphys,

    /// Handler state of the page at the time of the update.
    pub handler_state: HandlerState,

    /// Whether entries were updated in place or flushed.
    pub mode: ShadowUpdate,
}

/// Model of the shadow page table pool.
///
/// Records every update and TLB flush so callers can check how the
/// handler engine drives the pool.
#[derive(Debug, Default)]
pub(crate) struct ShadowPool {
    pub updates: Vec<PoolUpdate>,
    pub tlb_flushes: usize,
    pub stale_pages: HashSet<Gfn>,
    pub flush_on_update: bool,
}

impl ShadowPool {
    pub fn update(
        &mut self,
        gcphys: Gcphys,
        handler_state: HandlerState,
        mode: ShadowUpdate,
    ) -> TranslationUpdate {
        self.updates.push(PoolUpdate {
            gcphys,
            handler_state,
            mode,
        });

        match mode {
            ShadowUpdate::InPlace => TranslationUpdate {
                resync: self.stale_pages.contains(&gcphys.gfn()),
                flush_tlbs: self.flush_on_update,
            },
            ShadowUpdate::Flush => TranslationUpdate {
                resync: false,
                flush_tlbs: true,
            },
        }
    }
}
