use pgm_core::{Gcphys, HandlerKind, HandlerState, PAGE_OFFSET_MASK, PgmDriver, PgmError};

use crate::{sync, tree::HandlerTree};

/// A disagreement between the handler registrations and the page states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inconsistency {
    /// Two handlers overlap.
    Overlap {
        /// Key of the lower handler.
        first: Gcphys,
        /// Key of the higher handler.
        second: Gcphys,
    },

    /// A page state is not the strictest state of the handlers covering
    /// the page.
    PageState {
        /// The page.
        gcphys: Gcphys,
        /// The state the covering handlers ask for.
        expected: HandlerState,
        /// The state of the page.
        actual: HandlerState,
    },

    /// The aliased page counter of a handler is off.
    AliasedCount {
        /// Key of the handler.
        start: Gcphys,
        /// Aliased pages found in the range.
        counted: u64,
        /// The counter.
        recorded: u64,
    },

    /// The switched-off page counter of a handler is off.
    TempOffCount {
        /// Key of the handler.
        start: Gcphys,
        /// Switched-off pages found in the range.
        counted: u64,
        /// The counter.
        recorded: u64,
    },
}

pub(crate) fn audit<Driver>(
    driver: &Driver,
    tree: &HandlerTree,
) -> Result<Vec<Inconsistency>, PgmError>
where
    Driver: PgmDriver,
{
    let mut result = Vec::new();

    let mut previous = None;
    for handler in tree.iter() {
        if let Some((first, last)) = previous
            && last >= handler.start
        {
            result.push(Inconsistency::Overlap {
                first,
                second: handler.start,
            });
        }

        previous = Some((handler.start, handler.last));

        let (aliased, temp_off) =
            sync::count_pages(driver, handler.kind, handler.start, handler.last)?;
        if aliased != handler.aliased_pages {
            result.push(Inconsistency::AliasedCount {
                start: handler.start,
                counted: aliased,
                recorded: handler.aliased_pages,
            });
        }

        if temp_off != handler.temp_off_pages {
            result.push(Inconsistency::TempOffCount {
                start: handler.start,
                counted: temp_off,
                recorded: handler.temp_off_pages,
            });
        }
    }

    for range in driver.ram_ranges() {
        for gcphys in range.pages() {
            let page = driver.page(gcphys)?;

            let mut expected = HandlerState::None;
            let mut may_be_off = page.page_type.is_mmio_alias();
            for handler in tree.covering(gcphys, gcphys | PAGE_OFFSET_MASK) {
                expected = expected.max(handler.state);
                may_be_off |= handler.kind != HandlerKind::Mmio;
            }

            let actual = page.handler_state;
            if actual != expected && !(may_be_off && actual == HandlerState::Disabled) {
                result.push(Inconsistency::PageState {
                    gcphys,
                    expected,
                    actual,
                });
            }
        }
    }

    if !result.is_empty() {
        tracing::warn!(count = result.len(), "handler audit found inconsistencies");
    }

    Ok(result)
}
