//! Tracks a framebuffer with a write handler, switches off monitoring of
//! a dirty page and maps an MMIO2 bank into an MMIO window.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use pgm::{
    Gcphys, HandlerKind, PageStore as _,
    driver::mem::MemDriver,
    handler::{AccessDisposition, AccessKind, PhysAccessHandler, PhysHandlers, UserData},
};

const VRAM: Gcphys = Gcphys(0xa_0000);
const VRAM_LAST: Gcphys = Gcphys(0xb_ffff);
const MMIO: Gcphys = Gcphys(0xf000_0000);

#[derive(Default)]
struct Framebuffer {
    writes: AtomicU64,
}

impl PhysAccessHandler for Framebuffer {
    fn handle(
        &self,
        gcphys: Gcphys,
        buffer: &mut [u8],
        access: AccessKind,
        _user: UserData,
    ) -> AccessDisposition {
        if access == AccessKind::Write {
            self.writes.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%gcphys, len = buffer.len(), "framebuffer write");
        }

        AccessDisposition::Default
    }
}

struct Bank;

impl PhysAccessHandler for Bank {
    fn handle(&self, _: Gcphys, buffer: &mut [u8], _: AccessKind, _: UserData) -> AccessDisposition {
        buffer.fill(0);
        AccessDisposition::Handled
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    let mut driver = MemDriver::new();
    driver.add_ram(Gcphys(0), 0x10_0000)?;
    driver.add_mmio(MMIO, 0x1_0000)?;
    let bank = driver.add_mmio2_region(0x4000)?;

    let handlers = PhysHandlers::new(driver);

    // Framebuffer: trap writes to VRAM.
    let framebuffer = Arc::new(Framebuffer::default());
    let vga = handlers.create_type(HandlerKind::Write, framebuffer.clone(), None, "vga");
    let _ = handlers.register(vga, VRAM, VRAM_LAST, 0, 0, None)?;

    // Simulate a trapped write.
    if let Some(lookup) = handlers.lookup(VRAM + 0x100) {
        let mut data = [0x41u8; 4];
        lookup
            .handler
            .handle(VRAM + 0x100, &mut data, AccessKind::Write, lookup.user);
    }

    // The page is dirty now, stop trapping until the next refresh.
    handlers.temp_off(VRAM, VRAM)?;

    // MMIO window backed by an MMIO2 bank.
    let window = handlers.create_type(HandlerKind::Mmio, Arc::new(Bank), None, "bank");
    let _ = handlers.register(window, MMIO, MMIO + 0x3fff, 0, 0, None)?;
    for index in 0..4 {
        let offset = index * 0x1000;
        handlers.alias_mmio2_page(MMIO, MMIO + offset, bank, offset)?;
    }

    for info in handlers.handlers() {
        println!("{info}");
    }

    let page = handlers.driver().page(MMIO + 0x2000)?;
    println!("{MMIO:?}+0x2000 -> {:?} ({:?})", page.hc_phys, page.page_type);
    println!("framebuffer writes: {}", framebuffer.writes.load(Ordering::Relaxed));

    let inconsistencies = handlers.audit()?;
    println!("audit: {} inconsistencies", inconsistencies.len());

    // Refresh: monitor the whole framebuffer again.
    let _ = handlers.reset(VRAM)?;
    handlers.deregister(MMIO)?;
    handlers.deregister(VRAM)?;

    let _ = handlers.release_type(vga)?;
    let _ = handlers.release_type(window)?;

    let driver = handlers.teardown();
    println!("notifications: {}", driver.events().len());

    Ok(())
}
