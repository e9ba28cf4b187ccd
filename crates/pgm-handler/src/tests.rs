use std::sync::Arc;

use pgm_core::{
    Gcphys, HandlerKind, HandlerState, Hcphys, PageId, PageStore, PageType, PgmError,
    PhysHandlerConfig, ShadowUpdate,
};
use pgm_driver_mem::{MemDriver, NotifyEvent};

use super::*;

///////////////////////////////////////////////////////////////////////////////
// Fixtures
///////////////////////////////////////////////////////////////////////////////

const RAM_SIZE: u64 = 0x10_0000;
const MMIO_BASE: Gcphys = Gcphys(0xe000_0000);
const MMIO_SIZE: u64 = 0x1_0000;

struct Nop;

impl PhysAccessHandler for Nop {
    fn handle(
        &self,
        _: Gcphys,
        buffer: &mut [u8],
        access: AccessKind,
        _: UserData,
    ) -> AccessDisposition {
        if access == AccessKind::Read {
            buffer.fill(0xff);
        }

        AccessDisposition::Handled
    }
}

fn setup() -> Result<PhysHandlers<MemDriver>, PgmError> {
    setup_with_config(PhysHandlerConfig::default())
}

fn setup_with_config(config: PhysHandlerConfig) -> Result<PhysHandlers<MemDriver>, PgmError> {
    let mut driver = MemDriver::new();
    driver.add_ram(Gcphys(0), RAM_SIZE)?;
    driver.add_mmio(MMIO_BASE, MMIO_SIZE)?;
    Ok(PhysHandlers::with_config(driver, config))
}

fn create_type(handlers: &PhysHandlers<MemDriver>, kind: HandlerKind) -> HandlerTypeId {
    handlers.create_type(kind, Arc::new(Nop), None, format!("{kind:?}"))
}

fn register(
    handlers: &PhysHandlers<MemDriver>,
    type_id: HandlerTypeId,
    start: u64,
    last: u64,
) -> Result<SyncStatus, PgmError> {
    handlers.register(type_id, Gcphys(start), Gcphys(last), 0, 0, None)
}

fn page_state(handlers: &PhysHandlers<MemDriver>, gcphys: u64) -> Result<HandlerState, PgmError> {
    Ok(handlers.driver().page(Gcphys(gcphys))?.handler_state)
}

fn assert_consistent(handlers: &PhysHandlers<MemDriver>) -> Result<(), PgmError> {
    assert_eq!(handlers.audit()?, Vec::new());
    Ok(())
}

fn counters(handlers: &PhysHandlers<MemDriver>, key: u64) -> (u64, u64) {
    handlers
        .handler(Gcphys(key))
        .map(|info| (info.aliased_pages, info.temp_off_pages))
        .unwrap_or_default()
}

///////////////////////////////////////////////////////////////////////////////
// Register / Deregister
///////////////////////////////////////////////////////////////////////////////

#[test]
fn register_all_kind_flags_every_page() -> Result<(), PgmError> {
    let handlers = setup()?;
    let all = create_type(&handlers, HandlerKind::All);

    let status = register(&handlers, all, 0x1000, 0x3fff)?;
    assert_eq!(status, SyncStatus::Done);

    for gcphys in [0x1000, 0x2000, 0x3000] {
        assert_eq!(page_state(&handlers, gcphys)?, HandlerState::All);
    }
    assert_eq!(page_state(&handlers, 0x4000)?, HandlerState::None);
    assert_eq!(page_state(&handlers, 0x0000)?, HandlerState::None);
    assert_consistent(&handlers)?;

    handlers.deregister(Gcphys(0x1000))?;

    for gcphys in [0x1000, 0x2000, 0x3000] {
        assert_eq!(page_state(&handlers, gcphys)?, HandlerState::None);
    }

    let driver = handlers.driver();
    assert!(driver.events().contains(&NotifyEvent::Registered {
        kind: HandlerKind::All,
        gcphys: Gcphys(0x1000),
        size: 0x3000,
    }));
    assert!(driver.events().contains(&NotifyEvent::Deregistered {
        kind: HandlerKind::All,
        gcphys: Gcphys(0x1000),
        size: 0x3000,
        restore_as_ram: true,
    }));

    Ok(())
}

#[test]
fn register_rejects_overlap() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);
    let all = create_type(&handlers, HandlerKind::All);

    let _ = register(&handlers, write, 0x1000, 0x1fff)?;

    let result = register(&handlers, all, 0x1000, 0x2fff);
    assert!(matches!(
        result,
        Err(PgmError::Conflict { existing_start, .. }) if existing_start == Gcphys(0x1000)
    ));

    // The failed registration dropped its type reference.
    assert_eq!(handlers.type_ref_count(all), Some(1));
    assert_eq!(handlers.handlers().len(), 1);
    assert_eq!(page_state(&handlers, 0x1000)?, HandlerState::Write);
    assert_eq!(page_state(&handlers, 0x2000)?, HandlerState::None);

    Ok(())
}

#[test]
fn register_enforces_page_granularity() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);
    let all = create_type(&handlers, HandlerKind::All);
    let mmio = create_type(&handlers, HandlerKind::Mmio);

    assert!(matches!(
        register(&handlers, all, 0x1800, 0x2fff),
        Err(PgmError::InvalidRange { .. })
    ));
    assert!(matches!(
        register(&handlers, mmio, 0x1000, 0x1ffe),
        Err(PgmError::InvalidRange { .. })
    ));
    assert!(matches!(
        register(&handlers, write, 0x2000, 0x1000),
        Err(PgmError::InvalidRange { .. })
    ));

    let _ = register(&handlers, write, 0x1800, 0x2bff)?;
    assert_eq!(page_state(&handlers, 0x1000)?, HandlerState::Write);
    assert_eq!(page_state(&handlers, 0x2000)?, HandlerState::Write);
    assert_eq!(
        handlers.handler(Gcphys(0x1800)).map(|info| info.page_count),
        Some(2)
    );

    Ok(())
}

#[test]
fn register_requires_single_ram_range() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);

    assert!(matches!(
        register(&handlers, write, RAM_SIZE - 0x1000, RAM_SIZE + 0xfff),
        Err(PgmError::NoRamRange { .. })
    ));
    assert!(matches!(
        register(&handlers, write, 0x8000_0000, 0x8000_0fff),
        Err(PgmError::NoRamRange { .. })
    ));
    assert!(handlers.handlers().is_empty());
    assert_eq!(handlers.type_ref_count(write), Some(1));

    Ok(())
}

#[test]
fn register_ex_hands_back_rejected_handler() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);

    let _ = register(&handlers, write, 0x1000, 0x1fff)?;

    let handler = handlers.create(write, 1, 2, Some("second"))?;
    let err = match handlers.register_ex(handler, Gcphys(0x1800), Gcphys(0x27ff)) {
        Ok(_) => panic!("overlapping registration succeeded"),
        Err(err) => err,
    };
    assert!(matches!(err.error, PgmError::Conflict { .. }));
    assert_eq!(err.handler.description(), "second");

    let _ = handlers.register_ex(err.handler, Gcphys(0x5000), Gcphys(0x5fff))?;
    assert_eq!(
        handlers.handler(Gcphys(0x5000)).map(|info| (info.user, info.user_restricted)),
        Some((1, 2))
    );

    Ok(())
}

#[test]
fn deregister_ex_returns_detached_handler() -> Result<(), PgmError> {
    let handlers = setup()?;
    let mmio = create_type(&handlers, HandlerKind::Mmio);

    let _ = handlers.register(mmio, MMIO_BASE, MMIO_BASE + 0x1fff, 7, 8, None)?;

    let handler = handlers.deregister_ex(MMIO_BASE, RestoreAsRam::Auto)?;
    assert_eq!(handler.user_data(), (7, 8));
    assert!(!handlers.is_registered(MMIO_BASE));

    // Mmio handlers are not turned back into RAM unless asked to.
    assert!(handlers.driver().events().contains(&NotifyEvent::Deregistered {
        kind: HandlerKind::Mmio,
        gcphys: MMIO_BASE,
        size: 0x2000,
        restore_as_ram: false,
    }));

    // The detached handler can be registered again.
    let _ = handlers.register_ex(handler, MMIO_BASE + 0x4000, MMIO_BASE + 0x4fff)?;
    let handler = handlers.deregister_ex(MMIO_BASE + 0x4000, RestoreAsRam::Yes)?;
    handlers.destroy(handler)?;

    assert!(matches!(
        handlers.deregister(MMIO_BASE),
        Err(PgmError::NotFound(_))
    ));
    assert_eq!(handlers.type_ref_count(mmio), Some(1));

    Ok(())
}

#[test]
fn deregister_requires_exact_key() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);

    let _ = register(&handlers, write, 0x1000, 0x2fff)?;

    assert!(matches!(
        handlers.deregister(Gcphys(0x2000)),
        Err(PgmError::NotFound(_))
    ));
    assert!(handlers.is_registered(Gcphys(0x2000)));

    Ok(())
}

#[test]
fn raise_reports_resync_and_flushes_once() -> Result<(), PgmError> {
    let handlers = setup()?;
    let all = create_type(&handlers, HandlerKind::All);

    {
        let mut driver = handlers.driver();
        driver.mark_stale(Gcphys(0x2000));
        driver.set_flush_on_update(true);
    }

    let status = register(&handlers, all, 0x1000, 0x3fff)?;
    assert!(status.needs_resync());
    assert_eq!(
        status,
        SyncStatus::NeedsResync(ResyncPages::from_elem(Gcphys(0x2000), 1))
    );

    let driver = handlers.driver();
    assert_eq!(driver.pool_updates().len(), 3);
    assert!(
        driver
            .pool_updates()
            .iter()
            .all(|update| update.mode == ShadowUpdate::InPlace)
    );
    assert_eq!(driver.tlb_flushes(), 1);

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Pages shared by Write handlers
///////////////////////////////////////////////////////////////////////////////

#[test]
fn shared_page_keeps_upper_neighbour() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);

    let _ = register(&handlers, write, 0x0800, 0x17ff)?;
    let _ = register(&handlers, write, 0x1800, 0x27ff)?;

    for gcphys in [0x0000, 0x1000, 0x2000] {
        assert_eq!(page_state(&handlers, gcphys)?, HandlerState::Write);
    }

    handlers.driver().take_events();
    handlers.deregister(Gcphys(0x0800))?;

    assert_eq!(page_state(&handlers, 0x0000)?, HandlerState::None);
    assert_eq!(page_state(&handlers, 0x1000)?, HandlerState::Write);
    assert_eq!(page_state(&handlers, 0x2000)?, HandlerState::Write);
    assert_consistent(&handlers)?;

    // The shared page stays with the remaining handler.
    assert!(handlers.driver().events().contains(&NotifyEvent::Deregistered {
        kind: HandlerKind::Write,
        gcphys: Gcphys(0x0000),
        size: 0x1000,
        restore_as_ram: true,
    }));

    Ok(())
}

#[test]
fn shared_page_keeps_lower_neighbour() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);

    let _ = register(&handlers, write, 0x0800, 0x17ff)?;
    let _ = register(&handlers, write, 0x1800, 0x27ff)?;

    handlers.deregister(Gcphys(0x1800))?;

    assert_eq!(page_state(&handlers, 0x0000)?, HandlerState::Write);
    assert_eq!(page_state(&handlers, 0x1000)?, HandlerState::Write);
    assert_eq!(page_state(&handlers, 0x2000)?, HandlerState::None);
    assert_consistent(&handlers)?;

    Ok(())
}

#[test]
fn shared_page_released_with_last_handler() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);

    let _ = register(&handlers, write, 0x1000, 0x13ff)?;
    let _ = register(&handlers, write, 0x1400, 0x17ff)?;
    let _ = register(&handlers, write, 0x1c00, 0x1fff)?;

    handlers.deregister(Gcphys(0x1400))?;
    assert_eq!(page_state(&handlers, 0x1000)?, HandlerState::Write);

    handlers.deregister(Gcphys(0x1000))?;
    assert_eq!(page_state(&handlers, 0x1000)?, HandlerState::Write);

    handlers.driver().take_events();
    handlers.deregister(Gcphys(0x1c00))?;
    assert_eq!(page_state(&handlers, 0x1000)?, HandlerState::None);

    assert!(handlers.driver().events().contains(&NotifyEvent::Deregistered {
        kind: HandlerKind::Write,
        gcphys: Gcphys(0x1000),
        size: 0x1000,
        restore_as_ram: true,
    }));

    Ok(())
}

#[test]
fn reregistration_restores_page_states() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);
    let all = create_type(&handlers, HandlerKind::All);

    let _ = register(&handlers, write, 0x0800, 0x17ff)?;
    let _ = register(&handlers, write, 0x1800, 0x27ff)?;
    let _ = register(&handlers, all, 0x3000, 0x3fff)?;

    let snapshot = |handlers: &PhysHandlers<MemDriver>| -> Result<Vec<HandlerState>, PgmError> {
        (0..5).map(|page| page_state(handlers, page * 0x1000)).collect()
    };

    let before = snapshot(&handlers)?;

    handlers.deregister(Gcphys(0x1800))?;
    let _ = register(&handlers, write, 0x1800, 0x27ff)?;
    assert_eq!(snapshot(&handlers)?, before);

    handlers.deregister(Gcphys(0x3000))?;
    let _ = register(&handlers, all, 0x3000, 0x3fff)?;
    assert_eq!(snapshot(&handlers)?, before);

    assert_consistent(&handlers)
}

#[test]
fn shared_page_switch_off_counts_for_both_neighbours() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);

    let _ = register(&handlers, write, 0x0800, 0x17ff)?;
    let _ = register(&handlers, write, 0x1800, 0x27ff)?;

    handlers.temp_off(Gcphys(0x0800), Gcphys(0x1000))?;
    assert_eq!(page_state(&handlers, 0x1000)?, HandlerState::Disabled);
    assert_eq!(counters(&handlers, 0x0800), (0, 1));
    assert_eq!(counters(&handlers, 0x1800), (0, 1));

    // Already off through the lower neighbour.
    handlers.temp_off(Gcphys(0x1800), Gcphys(0x1800))?;
    assert_eq!(counters(&handlers, 0x1800), (0, 1));
    assert_consistent(&handlers)?;

    let _ = handlers.reset(Gcphys(0x1800))?;
    assert_eq!(page_state(&handlers, 0x1000)?, HandlerState::Write);
    assert_eq!(counters(&handlers, 0x0800), (0, 0));
    assert_eq!(counters(&handlers, 0x1800), (0, 0));
    assert_consistent(&handlers)
}

#[test]
fn neighbour_registration_rearms_shared_page() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);

    let _ = register(&handlers, write, 0x0800, 0x17ff)?;
    handlers.temp_off(Gcphys(0x0800), Gcphys(0x1000))?;
    assert_eq!(counters(&handlers, 0x0800), (0, 1));

    let _ = register(&handlers, write, 0x1800, 0x27ff)?;
    assert_eq!(page_state(&handlers, 0x1000)?, HandlerState::Write);
    assert_eq!(counters(&handlers, 0x0800), (0, 0));
    assert_eq!(counters(&handlers, 0x1800), (0, 0));
    assert_consistent(&handlers)
}

#[test]
fn neighbour_deregistration_rearms_shared_page() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);

    let _ = register(&handlers, write, 0x0800, 0x17ff)?;
    let _ = register(&handlers, write, 0x1800, 0x27ff)?;

    handlers.temp_off(Gcphys(0x1800), Gcphys(0x1800))?;
    assert_eq!(counters(&handlers, 0x0800), (0, 1));
    assert_eq!(counters(&handlers, 0x1800), (0, 1));

    handlers.deregister(Gcphys(0x0800))?;
    assert_eq!(page_state(&handlers, 0x1000)?, HandlerState::Write);
    assert_eq!(counters(&handlers, 0x1800), (0, 0));
    assert_consistent(&handlers)
}

#[test]
fn neighbour_modify_rearms_shared_page() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);

    let _ = register(&handlers, write, 0x0800, 0x17ff)?;
    let _ = register(&handlers, write, 0x1800, 0x27ff)?;
    handlers.temp_off(Gcphys(0x0800), Gcphys(0x1000))?;

    let _ = handlers.modify(Gcphys(0x1800), Gcphys(0x3000), Gcphys(0x3fff))?;
    assert_eq!(page_state(&handlers, 0x1000)?, HandlerState::Write);
    assert_eq!(page_state(&handlers, 0x2000)?, HandlerState::None);
    assert_eq!(counters(&handlers, 0x0800), (0, 0));
    assert_eq!(counters(&handlers, 0x3000), (0, 0));
    assert_consistent(&handlers)
}

#[test]
fn split_and_join_through_switched_off_shared_page() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);

    let _ = register(&handlers, write, 0x0800, 0x27ff)?;
    handlers.temp_off(Gcphys(0x0800), Gcphys(0x1000))?;

    handlers.split(Gcphys(0x0800), Gcphys(0x1800))?;
    assert_eq!(counters(&handlers, 0x0800), (0, 1));
    assert_eq!(counters(&handlers, 0x1800), (0, 1));
    assert_consistent(&handlers)?;

    handlers.join(Gcphys(0x0800), Gcphys(0x1800))?;
    assert_eq!(counters(&handlers, 0x0800), (0, 1));
    assert_consistent(&handlers)?;

    handlers.deregister(Gcphys(0x0800))?;
    assert_eq!(page_state(&handlers, 0x1000)?, HandlerState::None);
    assert_consistent(&handlers)
}

///////////////////////////////////////////////////////////////////////////////
// Lookup
///////////////////////////////////////////////////////////////////////////////

#[test]
fn lookup_returns_handler_and_user_data() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);

    let _ = handlers.register(write, Gcphys(0x1000), Gcphys(0x2fff), 0x11, 0x22, None)?;

    let lookup = match handlers.lookup(Gcphys(0x2345)) {
        Some(lookup) => lookup,
        None => panic!("no handler found"),
    };
    assert_eq!(lookup.start, Gcphys(0x1000));
    assert_eq!(lookup.last, Gcphys(0x2fff));
    assert_eq!((lookup.user, lookup.user_restricted), (0x11, 0x22));
    assert!(lookup.restricted.is_none());

    let mut buffer = [0u8; 4];
    let disposition =
        lookup
            .handler
            .handle(Gcphys(0x2345), &mut buffer, AccessKind::Read, lookup.user);
    assert_eq!(disposition, AccessDisposition::Handled);
    assert_eq!(buffer, [0xff; 4]);

    assert!(handlers.lookup(Gcphys(0x3000)).is_none());
    assert!(handlers.is_registered(Gcphys(0x1000)));
    assert!(!handlers.is_registered(Gcphys(0x0fff)));

    Ok(())
}

#[test]
fn lookup_cache_is_invalidated_by_deregistration() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);

    let _ = register(&handlers, write, 0x1000, 0x1fff)?;

    assert!(handlers.is_registered(Gcphys(0x1000)));
    assert!(handlers.is_registered(Gcphys(0x1800)));
    assert_eq!(handlers.lookup_stats(), LookupStats { hits: 1, misses: 1 });

    handlers.deregister(Gcphys(0x1000))?;
    assert!(!handlers.is_registered(Gcphys(0x1800)));
    assert_eq!(handlers.lookup_stats(), LookupStats { hits: 1, misses: 2 });

    Ok(())
}

#[test]
fn all_access_kinds() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);
    let all = create_type(&handlers, HandlerKind::All);
    let mmio = create_type(&handlers, HandlerKind::Mmio);

    let _ = register(&handlers, write, 0x1000, 0x1fff)?;
    let _ = register(&handlers, all, 0x2000, 0x2fff)?;
    let _ = handlers.register(mmio, MMIO_BASE, MMIO_BASE + 0xfff, 0, 0, None)?;

    assert!(!handlers.is_all_access_kind(Gcphys(0x1000)));
    assert!(handlers.is_all_access_kind(Gcphys(0x2000)));
    assert!(handlers.is_all_access_kind(MMIO_BASE + 0x10));

    Ok(())
}

#[test]
fn change_user_data() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);

    let _ = register(&handlers, write, 0x1000, 0x1fff)?;
    handlers.change_user_data(Gcphys(0x1000), 5, 6)?;

    let lookup = handlers.lookup(Gcphys(0x1000));
    assert_eq!(
        lookup.map(|lookup| (lookup.user, lookup.user_restricted)),
        Some((5, 6))
    );

    assert!(matches!(
        handlers.change_user_data(Gcphys(0x2000), 0, 0),
        Err(PgmError::NotFound(_))
    ));

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Temporary switch-off
///////////////////////////////////////////////////////////////////////////////

#[test]
fn temp_off_disables_one_page_until_reset() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);

    let _ = register(&handlers, write, 0x1000, 0x2fff)?;

    handlers.temp_off(Gcphys(0x1000), Gcphys(0x2000))?;
    assert_eq!(page_state(&handlers, 0x1000)?, HandlerState::Write);
    assert_eq!(page_state(&handlers, 0x2000)?, HandlerState::Disabled);
    assert_eq!(counters(&handlers, 0x1000), (0, 1));

    // Switching off an already disabled page changes nothing.
    handlers.temp_off(Gcphys(0x1000), Gcphys(0x2abc))?;
    assert_eq!(counters(&handlers, 0x1000), (0, 1));
    assert_consistent(&handlers)?;

    let status = handlers.reset(Gcphys(0x1000))?;
    assert_eq!(status, SyncStatus::Done);
    assert_eq!(page_state(&handlers, 0x2000)?, HandlerState::Write);
    assert_eq!(counters(&handlers, 0x1000), (0, 0));
    assert_consistent(&handlers)
}

#[test]
fn temp_off_denied_for_mmio() -> Result<(), PgmError> {
    let handlers = setup()?;
    let mmio = create_type(&handlers, HandlerKind::Mmio);

    let _ = handlers.register(mmio, MMIO_BASE, MMIO_BASE + 0xfff, 0, 0, None)?;
    let events = handlers.driver().events().len();

    assert!(matches!(
        handlers.temp_off(MMIO_BASE, MMIO_BASE),
        Err(PgmError::AccessDenied)
    ));
    assert_eq!(page_state(&handlers, MMIO_BASE.0)?, HandlerState::All);
    assert_eq!(counters(&handlers, MMIO_BASE.0), (0, 0));
    assert_eq!(handlers.driver().events().len(), events);

    Ok(())
}

#[test]
fn temp_off_outside_handler() -> Result<(), PgmError> {
    let handlers = setup()?;
    let all = create_type(&handlers, HandlerKind::All);

    let _ = register(&handlers, all, 0x1000, 0x1fff)?;

    assert!(matches!(
        handlers.temp_off(Gcphys(0x1000), Gcphys(0x2000)),
        Err(PgmError::PageOutOfRange { .. })
    ));
    assert!(matches!(
        handlers.temp_off(Gcphys(0x5000), Gcphys(0x5000)),
        Err(PgmError::NotFound(_))
    ));

    Ok(())
}

#[test]
fn temp_off_partially_covered_page() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);

    let _ = register(&handlers, write, 0x0800, 0x17ff)?;

    handlers.temp_off(Gcphys(0x0800), Gcphys(0x0000))?;
    assert_eq!(page_state(&handlers, 0x0000)?, HandlerState::Disabled);

    handlers.temp_off(Gcphys(0x0800), Gcphys(0x1a00))?;
    assert_eq!(page_state(&handlers, 0x1000)?, HandlerState::Disabled);
    assert_eq!(counters(&handlers, 0x0800), (0, 2));

    assert!(matches!(
        handlers.temp_off(Gcphys(0x0800), Gcphys(0x2000)),
        Err(PgmError::PageOutOfRange { .. })
    ));

    assert_consistent(&handlers)
}

#[test]
fn reset_propagates_resync() -> Result<(), PgmError> {
    let handlers = setup()?;
    let all = create_type(&handlers, HandlerKind::All);

    let _ = register(&handlers, all, 0x1000, 0x2fff)?;
    handlers.temp_off(Gcphys(0x1000), Gcphys(0x2000))?;
    handlers.driver().mark_stale(Gcphys(0x2000));

    let status = handlers.reset(Gcphys(0x1000))?;
    assert_eq!(
        status,
        SyncStatus::NeedsResync(ResyncPages::from_elem(Gcphys(0x2000), 1))
    );
    assert_eq!(page_state(&handlers, 0x2000)?, HandlerState::All);

    assert!(matches!(
        handlers.reset(Gcphys(0x3000)),
        Err(PgmError::NotFound(_))
    ));

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Aliasing
///////////////////////////////////////////////////////////////////////////////

#[test]
fn alias_mmio2_page_then_reset() -> Result<(), PgmError> {
    let handlers = setup()?;
    let mmio = create_type(&handlers, HandlerKind::Mmio);
    let region = handlers.driver().add_mmio2_region(0x2000)?;
    let source = handlers.driver().mmio2_page(region, 0x1000)?;

    let _ = handlers.register(mmio, MMIO_BASE, MMIO_BASE + 0xfff, 0, 0, None)?;

    let status = handlers.alias_mmio2_page(MMIO_BASE, MMIO_BASE, region, 0x1000)?;
    assert_eq!(status, AliasStatus::Aliased);

    let page = handlers.driver().page(MMIO_BASE)?;
    assert_eq!(page.hc_phys, source.hc_phys);
    assert_eq!(page.page_id, source.page_id);
    assert_eq!(page.page_type, PageType::Mmio2AliasMmio);
    assert_eq!(page.handler_state, HandlerState::Disabled);
    assert_eq!(counters(&handlers, MMIO_BASE.0), (1, 0));
    assert_consistent(&handlers)?;

    let status = handlers.reset(MMIO_BASE)?;
    assert_eq!(status, SyncStatus::Done);

    let zero_page = handlers.driver().zero_page();
    let page = handlers.driver().page(MMIO_BASE)?;
    assert_eq!(page.hc_phys, zero_page);
    assert_eq!(page.page_id, PageId::NIL);
    assert_eq!(page.page_type, PageType::Mmio);
    assert_eq!(page.handler_state, HandlerState::All);
    assert_eq!(counters(&handlers, MMIO_BASE.0), (0, 0));
    assert_consistent(&handlers)
}

#[test]
fn alias_same_source_twice() -> Result<(), PgmError> {
    let handlers = setup()?;
    let mmio = create_type(&handlers, HandlerKind::Mmio);
    let region = handlers.driver().add_mmio2_region(0x1000)?;

    let _ = handlers.register(mmio, MMIO_BASE, MMIO_BASE + 0x1fff, 0, 0, None)?;

    let page = MMIO_BASE + 0x1000;
    assert_eq!(
        handlers.alias_mmio2_page(MMIO_BASE, page, region, 0)?,
        AliasStatus::Aliased
    );

    let (flushes, updates, events) = {
        let driver = handlers.driver();
        (
            driver.tlb_flushes(),
            driver.pool_updates().len(),
            driver.events().len(),
        )
    };

    assert_eq!(
        handlers.alias_mmio2_page(MMIO_BASE, page, region, 0)?,
        AliasStatus::AlreadyAliased
    );

    let driver = handlers.driver();
    assert_eq!(driver.tlb_flushes(), flushes);
    assert_eq!(driver.pool_updates().len(), updates);
    assert_eq!(driver.events().len(), events);
    drop(driver);

    assert_eq!(counters(&handlers, MMIO_BASE.0), (1, 0));
    Ok(())
}

#[test]
fn alias_flushes_before_repointing() -> Result<(), PgmError> {
    let handlers = setup()?;
    let mmio = create_type(&handlers, HandlerKind::Mmio);
    let region = handlers.driver().add_mmio2_region(0x1000)?;

    let _ = handlers.register(mmio, MMIO_BASE, MMIO_BASE + 0xfff, 0, 0, None)?;

    let zero_page = {
        let mut driver = handlers.driver();
        driver.map_page(MMIO_BASE)?
    };
    let flushes = handlers.driver().tlb_flushes();

    let _ = handlers.alias_mmio2_page(MMIO_BASE, MMIO_BASE, region, 0)?;

    let driver = handlers.driver();
    assert!(driver.tlb_flushes() > flushes);
    assert_eq!(driver.cached_mapping(MMIO_BASE), None);

    let update = driver.pool_updates().last().copied();
    assert_eq!(update.map(|update| update.mode), Some(ShadowUpdate::Flush));

    assert_eq!(
        driver.events().last(),
        Some(&NotifyEvent::BackingChanged {
            gcphys: MMIO_BASE,
            old_hc_phys: zero_page,
            new_hc_phys: driver.mmio2_page(region, 0)?.hc_phys,
            access: pgm_core::MemoryAccess::RWX,
            page_type: PageType::Mmio2AliasMmio,
        })
    );

    Ok(())
}

#[test]
fn realias_to_other_source() -> Result<(), PgmError> {
    let handlers = setup()?;
    let mmio = create_type(&handlers, HandlerKind::Mmio);
    let region = handlers.driver().add_mmio2_region(0x2000)?;
    let second = handlers.driver().mmio2_page(region, 0x1000)?;

    let _ = handlers.register(mmio, MMIO_BASE, MMIO_BASE + 0xfff, 0, 0, None)?;

    let _ = handlers.alias_mmio2_page(MMIO_BASE, MMIO_BASE, region, 0)?;
    let status = handlers.alias_mmio2_page(MMIO_BASE, MMIO_BASE, region, 0x1000)?;
    assert_eq!(status, AliasStatus::Aliased);
    assert_eq!(handlers.driver().page(MMIO_BASE)?.hc_phys, second.hc_phys);
    assert_eq!(counters(&handlers, MMIO_BASE.0), (1, 0));

    let host = Hcphys(0x7700_0000);
    let status = handlers.alias_host_page(MMIO_BASE, MMIO_BASE, host)?;
    assert_eq!(status, AliasStatus::Aliased);

    let page = handlers.driver().page(MMIO_BASE)?;
    assert_eq!(page.hc_phys, host);
    assert_eq!(page.page_id, PageId::NIL);
    assert_eq!(page.page_type, PageType::SpecialAliasMmio);
    assert_eq!(counters(&handlers, MMIO_BASE.0), (1, 0));

    assert_eq!(
        handlers.alias_host_page(MMIO_BASE, MMIO_BASE, host)?,
        AliasStatus::AlreadyAliased
    );
    assert_consistent(&handlers)
}

#[test]
fn alias_preconditions() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);
    let mmio = create_type(&handlers, HandlerKind::Mmio);
    let region = handlers.driver().add_mmio2_region(0x1000)?;

    let _ = register(&handlers, write, 0x1000, 0x1fff)?;
    let _ = register(&handlers, mmio, 0x4000, 0x4fff)?;
    let _ = handlers.register(mmio, MMIO_BASE, MMIO_BASE + 0xfff, 0, 0, None)?;

    assert!(matches!(
        handlers.alias_mmio2_page(Gcphys(0x1000), Gcphys(0x1000), region, 0),
        Err(PgmError::AccessDenied)
    ));

    // An MMIO handler over RAM has no MMIO page to alias.
    assert!(matches!(
        handlers.alias_mmio2_page(Gcphys(0x4000), Gcphys(0x4000), region, 0),
        Err(PgmError::NotMmio(_))
    ));

    assert!(matches!(
        handlers.alias_mmio2_page(MMIO_BASE, MMIO_BASE + 0x1000, region, 0),
        Err(PgmError::PageOutOfRange { .. })
    ));
    assert!(matches!(
        handlers.alias_mmio2_page(MMIO_BASE, MMIO_BASE, region, 0x1000),
        Err(PgmError::Mmio2NotFound { .. })
    ));

    assert_eq!(counters(&handlers, MMIO_BASE.0), (0, 0));
    assert_consistent(&handlers)
}

#[test]
fn deregister_unaliases_pages() -> Result<(), PgmError> {
    let handlers = setup()?;
    let mmio = create_type(&handlers, HandlerKind::Mmio);
    let region = handlers.driver().add_mmio2_region(0x1000)?;

    let _ = handlers.register(mmio, MMIO_BASE, MMIO_BASE + 0x1fff, 0, 0, None)?;
    let _ = handlers.alias_mmio2_page(MMIO_BASE, MMIO_BASE + 0x1000, region, 0)?;

    handlers.deregister(MMIO_BASE)?;

    let zero_page = handlers.driver().zero_page();
    let page = handlers.driver().page(MMIO_BASE + 0x1000)?;
    assert_eq!(page.hc_phys, zero_page);
    assert_eq!(page.page_type, PageType::Mmio);
    assert_eq!(page.handler_state, HandlerState::None);
    assert_consistent(&handlers)
}

#[test]
fn reset_all_aliases_does_accounting() -> Result<(), PgmError> {
    let handlers = setup()?;
    let mmio = create_type(&handlers, HandlerKind::Mmio);
    let region = handlers.driver().add_mmio2_region(0x2000)?;

    let _ = handlers.register(mmio, MMIO_BASE, MMIO_BASE + 0x2fff, 0, 0, None)?;
    let _ = handlers.alias_mmio2_page(MMIO_BASE, MMIO_BASE, region, 0)?;
    let _ = handlers.alias_mmio2_page(MMIO_BASE, MMIO_BASE + 0x2000, region, 0x1000)?;
    assert_eq!(counters(&handlers, MMIO_BASE.0), (2, 0));

    assert_eq!(handlers.reset_all_aliases()?, 2);
    assert_eq!(counters(&handlers, MMIO_BASE.0), (0, 0));
    assert_eq!(page_state(&handlers, MMIO_BASE.0 + 0x2000)?, HandlerState::All);
    assert_consistent(&handlers)
}

///////////////////////////////////////////////////////////////////////////////
// Modify
///////////////////////////////////////////////////////////////////////////////

#[test]
fn modify_moves_handler() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);

    let _ = register(&handlers, write, 0x1000, 0x1fff)?;

    let status = handlers.modify(Gcphys(0x1000), Gcphys(0x3000), Gcphys(0x4fff))?;
    assert_eq!(status, SyncStatus::Done);

    assert_eq!(page_state(&handlers, 0x1000)?, HandlerState::None);
    assert_eq!(page_state(&handlers, 0x3000)?, HandlerState::Write);
    assert_eq!(page_state(&handlers, 0x4000)?, HandlerState::Write);
    assert!(handlers.handler(Gcphys(0x1000)).is_none());
    assert_eq!(
        handlers.handler(Gcphys(0x3000)).map(|info| info.page_count),
        Some(2)
    );

    assert!(handlers.driver().events().contains(&NotifyEvent::Modified {
        kind: HandlerKind::Write,
        old_gcphys: Gcphys(0x1000),
        new_gcphys: Gcphys(0x3000),
        size: 0x2000,
        restore_as_ram: true,
    }));
    assert_eq!(handlers.type_ref_count(write), Some(2));
    assert_consistent(&handlers)
}

#[test]
fn failed_modify_destroys_handler() -> Result<(), PgmError> {
    let handlers = setup()?;
    let all = create_type(&handlers, HandlerKind::All);

    let _ = register(&handlers, all, 0x1000, 0x1fff)?;
    assert_eq!(handlers.type_ref_count(all), Some(2));

    let result = handlers.modify(
        Gcphys(0x1000),
        Gcphys(RAM_SIZE - 0x1000),
        Gcphys(RAM_SIZE + 0xfff),
    );
    assert!(matches!(result, Err(PgmError::NoRamRange { .. })));

    assert!(matches!(
        handlers.deregister(Gcphys(0x1000)),
        Err(PgmError::NotFound(_))
    ));
    assert_eq!(page_state(&handlers, 0x1000)?, HandlerState::None);
    assert_eq!(handlers.type_ref_count(all), Some(1));

    assert!(handlers.driver().events().contains(&NotifyEvent::Deregistered {
        kind: HandlerKind::All,
        gcphys: Gcphys(0x1000),
        size: 0x1000,
        restore_as_ram: true,
    }));

    Ok(())
}

#[test]
fn modify_onto_other_handler() -> Result<(), PgmError> {
    let handlers = setup()?;
    let all = create_type(&handlers, HandlerKind::All);

    let _ = register(&handlers, all, 0x1000, 0x1fff)?;
    let _ = register(&handlers, all, 0x3000, 0x3fff)?;

    assert!(matches!(
        handlers.modify(Gcphys(0x1000), Gcphys(0x2000), Gcphys(0x3fff)),
        Err(PgmError::Conflict { .. })
    ));

    assert_eq!(handlers.handlers().len(), 1);
    assert_eq!(page_state(&handlers, 0x1000)?, HandlerState::None);
    assert_eq!(page_state(&handlers, 0x2000)?, HandlerState::None);
    assert_eq!(page_state(&handlers, 0x3000)?, HandlerState::All);
    assert_consistent(&handlers)
}

#[test]
fn modify_enforces_page_granularity() -> Result<(), PgmError> {
    let handlers = setup()?;
    let all = create_type(&handlers, HandlerKind::All);

    let _ = register(&handlers, all, 0x1000, 0x1fff)?;

    assert!(matches!(
        handlers.modify(Gcphys(0x1000), Gcphys(0x1800), Gcphys(0x27ff)),
        Err(PgmError::InvalidRange { .. })
    ));
    assert!(!handlers.is_registered(Gcphys(0x1000)));

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Split / Join
///////////////////////////////////////////////////////////////////////////////

#[test]
fn split_then_join_restores_original() -> Result<(), PgmError> {
    let handlers = setup()?;
    let all = create_type(&handlers, HandlerKind::All);

    let _ = register(&handlers, all, 0x1000, 0x4fff)?;
    assert_eq!(handlers.type_ref_count(all), Some(2));

    handlers.split(Gcphys(0x1000), Gcphys(0x3000))?;
    assert_eq!(handlers.type_ref_count(all), Some(3));

    let infos = handlers.handlers();
    assert_eq!(infos.len(), 2);
    assert_eq!((infos[0].start, infos[0].last), (Gcphys(0x1000), Gcphys(0x2fff)));
    assert_eq!((infos[1].start, infos[1].last), (Gcphys(0x3000), Gcphys(0x4fff)));
    assert!(infos.iter().all(|info| info.page_count == 2));
    assert_consistent(&handlers)?;

    handlers.join(Gcphys(0x1000), Gcphys(0x3000))?;
    assert_eq!(handlers.type_ref_count(all), Some(2));

    let infos = handlers.handlers();
    assert_eq!(infos.len(), 1);
    assert_eq!((infos[0].start, infos[0].last), (Gcphys(0x1000), Gcphys(0x4fff)));
    assert_eq!(infos[0].page_count, 4);
    assert_consistent(&handlers)?;

    handlers.deregister(Gcphys(0x1000))?;
    assert_eq!(handlers.type_ref_count(all), Some(1));

    Ok(())
}

#[test]
fn split_rejects_bad_split_points() -> Result<(), PgmError> {
    let handlers = setup()?;
    let all = create_type(&handlers, HandlerKind::All);

    let _ = register(&handlers, all, 0x1000, 0x2fff)?;

    for at in [0x1000, 0x3000, 0x1800] {
        assert!(matches!(
            handlers.split(Gcphys(0x1000), Gcphys(at)),
            Err(PgmError::InvalidRange { .. })
        ));
    }
    assert!(matches!(
        handlers.split(Gcphys(0x2000), Gcphys(0x2800)),
        Err(PgmError::NotFound(_))
    ));

    assert_eq!(handlers.handlers().len(), 1);
    assert_eq!(handlers.type_ref_count(all), Some(2));

    Ok(())
}

#[test]
fn split_mid_page_write_handler() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);

    let _ = register(&handlers, write, 0x1000, 0x2fff)?;
    handlers.split(Gcphys(0x1000), Gcphys(0x1800))?;

    assert_eq!(
        handlers.handler(Gcphys(0x1800)).map(|info| (info.last, info.page_count)),
        Some((Gcphys(0x2fff), 2))
    );

    handlers.deregister(Gcphys(0x1800))?;
    assert_eq!(page_state(&handlers, 0x1000)?, HandlerState::Write);
    assert_eq!(page_state(&handlers, 0x2000)?, HandlerState::None);
    assert_consistent(&handlers)
}

#[test]
fn split_recounts_switched_off_pages() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);

    let _ = register(&handlers, write, 0x1000, 0x4fff)?;
    handlers.temp_off(Gcphys(0x1000), Gcphys(0x1000))?;
    handlers.temp_off(Gcphys(0x1000), Gcphys(0x4000))?;
    assert_eq!(counters(&handlers, 0x1000), (0, 2));

    handlers.split(Gcphys(0x1000), Gcphys(0x3000))?;
    assert_eq!(counters(&handlers, 0x1000), (0, 1));
    assert_eq!(counters(&handlers, 0x3000), (0, 1));
    assert_consistent(&handlers)?;

    handlers.join(Gcphys(0x1000), Gcphys(0x3000))?;
    assert_eq!(counters(&handlers, 0x1000), (0, 2));
    assert_consistent(&handlers)
}

#[test]
fn join_rejects_mismatches() -> Result<(), PgmError> {
    let handlers = setup()?;
    let first = create_type(&handlers, HandlerKind::Write);
    let second = create_type(&handlers, HandlerKind::Write);

    let _ = register(&handlers, first, 0x1000, 0x17ff)?;
    let _ = register(&handlers, first, 0x2000, 0x27ff)?;
    let _ = register(&handlers, second, 0x1800, 0x1fff)?;

    assert!(matches!(
        handlers.join(Gcphys(0x1000), Gcphys(0x2000)),
        Err(PgmError::NotAdjacent { .. })
    ));
    assert!(matches!(
        handlers.join(Gcphys(0x1000), Gcphys(0x1800)),
        Err(PgmError::TypeMismatch { .. })
    ));
    assert!(matches!(
        handlers.join(Gcphys(0x1000), Gcphys(0x3000)),
        Err(PgmError::NotFound(_))
    ));

    assert_eq!(handlers.handlers().len(), 3);
    assert_eq!(handlers.type_ref_count(first), Some(3));
    assert_eq!(handlers.type_ref_count(second), Some(2));

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Types, limits and teardown
///////////////////////////////////////////////////////////////////////////////

#[test]
fn type_lives_while_referenced() -> Result<(), PgmError> {
    let handlers = setup()?;
    let all = create_type(&handlers, HandlerKind::All);

    let _ = register(&handlers, all, 0x1000, 0x1fff)?;
    assert_eq!(handlers.release_type(all)?, 1);
    assert_eq!(page_state(&handlers, 0x1000)?, HandlerState::All);

    handlers.deregister(Gcphys(0x1000))?;
    assert_eq!(handlers.type_ref_count(all), None);

    assert!(matches!(
        handlers.release_type(all),
        Err(PgmError::InvalidHandlerType(_))
    ));
    assert!(matches!(
        register(&handlers, all, 0x1000, 0x1fff),
        Err(PgmError::InvalidHandlerType(_))
    ));

    Ok(())
}

#[test]
fn description_falls_back_to_type() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = handlers.create_type(HandlerKind::Write, Arc::new(Nop), Some(Arc::new(Nop)), "vga");

    let _ = register(&handlers, write, 0x1000, 0x1fff)?;
    let _ = handlers.register(write, Gcphys(0x2000), Gcphys(0x2fff), 0, 0, Some("vga bank 1"))?;

    let infos = handlers.handlers();
    assert_eq!(&*infos[0].description, "vga");
    assert_eq!(&*infos[1].description, "vga bank 1");
    assert!(infos[0].to_string().contains("vga"));

    assert!(
        handlers
            .lookup(Gcphys(0x1000))
            .is_some_and(|lookup| lookup.restricted.is_some())
    );

    Ok(())
}

#[test]
fn handler_limit() -> Result<(), PgmError> {
    let handlers = setup_with_config(PhysHandlerConfig { max_handlers: 2 })?;
    let write = create_type(&handlers, HandlerKind::Write);

    let _ = register(&handlers, write, 0x1000, 0x2fff)?;
    let detached = handlers.create(write, 0, 0, None)?;

    assert!(matches!(
        register(&handlers, write, 0x4000, 0x4fff),
        Err(PgmError::OutOfHandlers(2))
    ));
    assert!(matches!(
        handlers.split(Gcphys(0x1000), Gcphys(0x2000)),
        Err(PgmError::OutOfHandlers(2))
    ));

    handlers.destroy(detached)?;
    handlers.split(Gcphys(0x1000), Gcphys(0x2000))?;
    handlers.join(Gcphys(0x1000), Gcphys(0x2000))?;

    let _ = register(&handlers, write, 0x4000, 0x4fff)?;
    assert_eq!(handlers.handlers().len(), 2);

    Ok(())
}

#[test]
fn audit_detects_drift() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);

    let _ = register(&handlers, write, 0x1000, 0x1fff)?;
    handlers.driver().page_mut(Gcphys(0x1000))?.handler_state = HandlerState::None;
    handlers.driver().page_mut(Gcphys(0x5000))?.handler_state = HandlerState::All;

    let inconsistencies = handlers.audit()?;
    assert_eq!(
        inconsistencies,
        vec![
            Inconsistency::PageState {
                gcphys: Gcphys(0x1000),
                expected: HandlerState::Write,
                actual: HandlerState::None,
            },
            Inconsistency::PageState {
                gcphys: Gcphys(0x5000),
                expected: HandlerState::None,
                actual: HandlerState::All,
            },
        ]
    );

    Ok(())
}

#[test]
fn teardown_releases_everything() -> Result<(), PgmError> {
    let handlers = setup()?;
    let write = create_type(&handlers, HandlerKind::Write);
    let mmio = create_type(&handlers, HandlerKind::Mmio);

    let _ = register(&handlers, write, 0x1000, 0x1fff)?;
    let _ = handlers.register(mmio, MMIO_BASE, MMIO_BASE + 0xfff, 0, 0, None)?;

    let driver = handlers.teardown();
    assert_eq!(driver.page(Gcphys(0x1000))?.handler_state, HandlerState::None);
    assert_eq!(driver.page(MMIO_BASE)?.handler_state, HandlerState::None);

    let deregistrations = driver
        .events()
        .iter()
        .filter(|event| matches!(event, NotifyEvent::Deregistered { .. }))
        .count();
    assert_eq!(deregistrations, 2);

    Ok(())
}
