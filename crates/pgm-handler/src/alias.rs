//! Page aliasing and temporary monitoring switch-off.

use pgm_core::{
    BackingState, Gcphys, HandlerKind, HandlerState, Hcphys, Mmio2Handle, PageId, PageType,
    PgmDriver, PgmError, ShadowUpdate,
};

use crate::{AliasStatus, PhysHandler, sync, tree::HandlerTree};

/// Backing an MMIO page can be aliased to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasSource {
    /// A page of an MMIO2 region.
    Mmio2 {
        /// The region.
        region: Mmio2Handle,

        /// Byte offset of the page within the region.
        offset: u64,
    },

    /// An arbitrary host physical page.
    Host(Hcphys),
}

/// Switches off monitoring of a single page of the `Write` or `All`
/// handler at `key`.
///
/// The page stays off until a handler touching it is reset. Switching off
/// a page that is already off does nothing. The switched-off page counts
/// for every handler touching it.
pub(crate) fn temp_off_page<Driver>(
    driver: &mut Driver,
    tree: &mut HandlerTree,
    key: Gcphys,
    gcphys: Gcphys,
) -> Result<(), PgmError>
where
    Driver: PgmDriver,
{
    let handler = tree.get(key).ok_or(PgmError::NotFound(key))?;

    if handler.kind == HandlerKind::Mmio {
        tracing::warn!(start = %handler.start, "temporary switch-off of an MMIO handler");
        return Err(PgmError::AccessDenied);
    }

    if !handler.covers_page(gcphys) {
        return Err(PgmError::PageOutOfRange {
            page: gcphys,
            start: handler.start,
            last: handler.last,
        });
    }

    let page = driver.page_mut(gcphys)?;
    let old_state = page.handler_state;
    if old_state == HandlerState::Disabled {
        return Ok(());
    }

    page.handler_state = HandlerState::Disabled;
    sync::account_temp_off(tree, gcphys, old_state, HandlerState::Disabled);

    tracing::trace!(%key, %gcphys, "switched off page");
    sync::notify_protection(driver, gcphys)
}

/// Points an MMIO page of `handler` at other backing.
pub(crate) fn alias_page<Driver>(
    driver: &mut Driver,
    handler: &mut PhysHandler,
    gcphys: Gcphys,
    source: AliasSource,
) -> Result<AliasStatus, PgmError>
where
    Driver: PgmDriver,
{
    if handler.kind != HandlerKind::Mmio {
        tracing::warn!(start = %handler.start, "aliasing a page of a non-MMIO handler");
        return Err(PgmError::AccessDenied);
    }

    if !handler.covers_page(gcphys) {
        return Err(PgmError::PageOutOfRange {
            page: gcphys,
            start: handler.start,
            last: handler.last,
        });
    }

    let gcphys = gcphys.page_align_down();

    let (hc_phys, page_id, page_type) = match source {
        AliasSource::Mmio2 { region, offset } => {
            let source = driver.mmio2_page(region, offset)?;
            if source.page_type != PageType::Mmio2 {
                return Err(PgmError::NotMmio2);
            }

            (source.hc_phys, source.page_id, PageType::Mmio2AliasMmio)
        }
        AliasSource::Host(hc_phys) => (hc_phys, PageId::NIL, PageType::SpecialAliasMmio),
    };

    let page = driver.page(gcphys)?;
    match page.page_type {
        PageType::Mmio => {}
        current if current.is_mmio_alias() => {
            if current == page_type && page.hc_phys == hc_phys {
                return Ok(AliasStatus::AlreadyAliased);
            }

            tracing::debug!(%gcphys, old = %page.hc_phys, new = %hc_phys, "re-aliasing page");
            reset_aliased_page(driver, gcphys, None)?;

            debug_assert!(handler.aliased_pages > 0);
            handler.aliased_pages = handler.aliased_pages.saturating_sub(1);
        }
        _ => return Err(PgmError::NotMmio(gcphys)),
    }

    let page = driver.page(gcphys)?;
    debug_assert!(page.is_zero());
    let old_hc_phys = page.hc_phys;

    driver.update_translations_for_page(gcphys, &page, ShadowUpdate::Flush)?;
    driver.flush_all_tlbs();

    let page = driver.page_mut(gcphys)?;
    page.hc_phys = hc_phys;
    page.page_id = page_id;
    page.page_type = page_type;
    page.backing = BackingState::Allocated;
    page.handler_state = HandlerState::Disabled;

    handler.aliased_pages += 1;
    debug_assert!(handler.aliased_pages <= handler.page_count);

    driver.invalidate_page_map_tlb_entry(gcphys);
    notify_backing(driver, gcphys, old_hc_phys)?;

    tracing::debug!(%gcphys, %hc_phys, ?page_type, "aliased page");
    Ok(AliasStatus::Aliased)
}

/// Turns an aliased page back into an unbacked MMIO page.
///
/// With `tree`, the aliased page counter of the owning handler is
/// decremented. A page without owner is tolerated.
pub(crate) fn reset_aliased_page<Driver>(
    driver: &mut Driver,
    gcphys: Gcphys,
    tree: Option<&mut HandlerTree>,
) -> Result<(), PgmError>
where
    Driver: PgmDriver,
{
    let page = driver.page(gcphys)?;
    debug_assert!(page.page_type.is_mmio_alias());
    let old_hc_phys = page.hc_phys;

    driver.update_translations_for_page(gcphys, &page, ShadowUpdate::Flush)?;
    driver.flush_all_tlbs();

    let zero_page = driver.zero_page();
    let page = driver.page_mut(gcphys)?;
    page.hc_phys = zero_page;
    page.page_id = PageId::NIL;
    page.page_type = PageType::Mmio;
    page.backing = BackingState::Zero;
    page.handler_state = HandlerState::All;

    driver.invalidate_page_map_tlb_entry(gcphys);

    if let Some(tree) = tree {
        match tree.find_mut(gcphys) {
            Some(handler) => {
                debug_assert!(handler.aliased_pages > 0);
                handler.aliased_pages = handler.aliased_pages.saturating_sub(1);
            }
            None => tracing::warn!(%gcphys, "aliased page has no handler"),
        }
    }

    tracing::trace!(%gcphys, old = %old_hc_phys, "reset aliased page");
    notify_backing(driver, gcphys, old_hc_phys)
}

fn notify_backing<Driver>(
    driver: &mut Driver,
    gcphys: Gcphys,
    old_hc_phys: Hcphys,
) -> Result<(), PgmError>
where
    Driver: PgmDriver,
{
    let page = driver.page(gcphys)?;

    let mut nem_state = page.nem_state;
    driver.page_backing_changed(
        gcphys,
        old_hc_phys,
        page.hc_phys,
        page.allowed_access(),
        page.page_type,
        &mut nem_state,
    );

    driver.page_mut(gcphys)?.nem_state = nem_state;
    Ok(())
}
