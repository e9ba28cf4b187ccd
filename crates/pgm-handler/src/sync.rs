//! Keeps the per-page handler state in line with the registrations.

use pgm_core::{
    Gcphys, HandlerKind, HandlerState, PAGE_OFFSET_MASK, PAGE_SIZE, PgmDriver, PgmError,
    RamRangeHint, ShadowUpdate, page_count,
};

use crate::{PhysHandler, SyncStatus, alias, tree::HandlerTree};

/// Raises the state of every page of `[start, last]` to `state`.
///
/// Pages already at a stricter state are left alone. Every changed page is
/// pushed through the translation pool and announced to the notification
/// sink. TLBs are flushed once at the end if any page asked for it.
pub(crate) fn raise_page_states<Driver>(
    driver: &mut Driver,
    tree: &mut HandlerTree,
    start: Gcphys,
    last: Gcphys,
    state: HandlerState,
) -> Result<SyncStatus, PgmError>
where
    Driver: PgmDriver,
{
    let mut status = SyncStatus::Done;
    let mut flush_tlbs = false;
    let mut hint = RamRangeHint::default();

    let base = start.page_align_down();
    for index in 0..page_count(start, last) {
        let gcphys = base + index * PAGE_SIZE;

        let page = driver.page_mut_with_hint(gcphys, &mut hint)?;
        if page.handler_state >= state {
            continue;
        }

        let old_state = page.handler_state;
        page.handler_state = state;
        let page = *page;

        account_temp_off(tree, gcphys, old_state, state);

        let update = driver.update_translations_for_page(gcphys, &page, ShadowUpdate::InPlace)?;
        if update.resync {
            tracing::trace!(%gcphys, "translations need resync");
            status.add_resync(gcphys);
        }

        flush_tlbs |= update.flush_tlbs;
        notify_protection(driver, gcphys)?;
    }

    if flush_tlbs {
        driver.flush_all_tlbs();
    }

    Ok(status)
}

/// Clears the state of every page of `handler`.
///
/// Aliased pages of MMIO handlers are unaliased first. The pages at the
/// edges of the range are recalculated afterwards so that registrations
/// sharing them keep their monitoring.
///
/// The handler must not be in `tree`.
pub(crate) fn reset_page_states<Driver>(
    driver: &mut Driver,
    tree: &mut HandlerTree,
    handler: &mut PhysHandler,
) -> Result<(), PgmError>
where
    Driver: PgmDriver,
{
    let mut hint = RamRangeHint::default();

    for gcphys in handler.pages() {
        let page = driver.page_mut_with_hint(gcphys, &mut hint)?;

        if handler.kind == HandlerKind::Mmio && page.page_type.is_mmio_alias() {
            alias::reset_aliased_page(driver, gcphys, None)?;
            driver.page_mut(gcphys)?.handler_state = HandlerState::None;
            continue;
        }

        let old_state = page.handler_state;
        if old_state != HandlerState::None {
            page.handler_state = HandlerState::None;
            account_temp_off(tree, gcphys, old_state, HandlerState::None);
            notify_protection(driver, gcphys)?;
        }
    }

    handler.aliased_pages = 0;
    handler.temp_off_pages = 0;

    if handler.start.page_offset() != 0 {
        recalc_page_state(driver, tree, handler.start - 1, false)?;
    }

    if !handler.last.is_page_last_byte() {
        recalc_page_state(driver, tree, handler.last + 1, true)?;
    }

    Ok(())
}

/// Applies the strictest state of the registrations sharing the page of
/// `gcphys`, walking away from `gcphys` in one direction.
pub(crate) fn recalc_page_state<Driver>(
    driver: &mut Driver,
    tree: &mut HandlerTree,
    gcphys: Gcphys,
    above: bool,
) -> Result<(), PgmError>
where
    Driver: PgmDriver,
{
    let gfn = gcphys.gfn();
    let mut state = HandlerState::None;
    let mut cursor = gcphys;

    while let Some(handler) = tree.best_fit(cursor, above) {
        let edge = if above { handler.start } else { handler.last };
        if edge.gfn() != gfn {
            break;
        }

        state = state.max(handler.state);

        let next = if above {
            handler.last.checked_add(1)
        }
        else {
            handler.start.checked_sub(1)
        };

        match next {
            Some(next) if next.gfn() == gfn => cursor = next,
            _ => break,
        }
    }

    if state == HandlerState::None {
        return Ok(());
    }

    let page = driver.page_mut(gcphys)?;
    let old_state = page.handler_state;
    if old_state != state {
        tracing::trace!(%gcphys, ?state, "recalculated shared page");
        page.handler_state = state;
        account_temp_off(tree, gcphys, old_state, state);
        notify_protection(driver, gcphys)?;
    }

    Ok(())
}

/// Keeps the switched-off page counters of the live `Write` and `All`
/// handlers touching the page of `gcphys` in line with a state change.
///
/// A switched-off page counts for every such handler touching it.
pub(crate) fn account_temp_off(
    tree: &mut HandlerTree,
    gcphys: Gcphys,
    old_state: HandlerState,
    new_state: HandlerState,
) {
    let was_off = old_state == HandlerState::Disabled;
    let is_off = new_state == HandlerState::Disabled;
    if was_off == is_off {
        return;
    }

    let first = gcphys.page_align_down();
    for handler in tree.covering_mut(first, first | PAGE_OFFSET_MASK) {
        if handler.kind == HandlerKind::Mmio {
            continue;
        }

        if is_off {
            handler.temp_off_pages += 1;
        }
        else {
            debug_assert!(handler.temp_off_pages > 0);
            handler.temp_off_pages = handler.temp_off_pages.saturating_sub(1);
        }
    }
}

/// Tells the notification sink about the current protection of a page.
pub(crate) fn notify_protection<Driver>(driver: &mut Driver, gcphys: Gcphys) -> Result<(), PgmError>
where
    Driver: PgmDriver,
{
    let gcphys = gcphys.page_align_down();
    let page = driver.page(gcphys)?;

    let mut nem_state = page.nem_state;
    driver.page_protection_changed(
        gcphys,
        page.hc_phys,
        page.allowed_access(),
        page.page_type,
        &mut nem_state,
    );

    driver.page_mut(gcphys)?.nem_state = nem_state;
    Ok(())
}

/// Announces the release of `[start, last]`.
///
/// The range is widened to whole pages. A partially covered edge page that
/// is still monitored by another registration is excluded instead, and
/// nothing is announced if no page is left.
pub(crate) fn notify_deregistration<Driver>(
    driver: &mut Driver,
    kind: HandlerKind,
    start: Gcphys,
    last: Gcphys,
    restore_as_ram: bool,
) -> Result<(), PgmError>
where
    Driver: PgmDriver,
{
    let mut start = start;
    let mut last = last;

    if !start.is_page_aligned() {
        if still_monitored(driver, start) {
            match start.page_align_down().checked_add(PAGE_SIZE) {
                Some(next) if next <= last => start = next,
                _ => return Ok(()),
            }
        }
        else {
            start = start.page_align_down();
        }
    }

    if !last.is_page_last_byte() {
        if still_monitored(driver, last) {
            match last.page_align_down().checked_sub(1) {
                Some(prev) if prev >= start => last = prev,
                _ => return Ok(()),
            }
        }
        else {
            last = last | PAGE_OFFSET_MASK;
        }
    }

    tracing::trace!(%start, %last, ?kind, restore_as_ram, "notifying deregistration");
    driver.handler_deregistered(kind, start, last - start + 1, restore_as_ram);
    Ok(())
}

fn still_monitored<Driver>(driver: &Driver, gcphys: Gcphys) -> bool
where
    Driver: PgmDriver,
{
    driver
        .page(gcphys)
        .map(|page| page.handler_state != HandlerState::None)
        .unwrap_or(false)
}

/// Counts the aliased and temporarily disabled pages a handler of `kind`
/// would see over `[start, last]`.
pub(crate) fn count_pages<Driver>(
    driver: &Driver,
    kind: HandlerKind,
    start: Gcphys,
    last: Gcphys,
) -> Result<(u64, u64), PgmError>
where
    Driver: PgmDriver,
{
    let mut aliased = 0;
    let mut temp_off = 0;

    let base = start.page_align_down();
    for index in 0..page_count(start, last) {
        let page = driver.page(base + index * PAGE_SIZE)?;

        match kind {
            HandlerKind::Mmio => {
                if page.page_type.is_mmio_alias() {
                    aliased += 1;
                }
            }
            HandlerKind::Write | HandlerKind::All => {
                if page.handler_state == HandlerState::Disabled {
                    temp_off += 1;
                }
            }
        }
    }

    Ok((aliased, temp_off))
}
