use serde::{Deserialize, Serialize};

use crate::{Hcphys, MemoryAccess};

/// Per-page handler state.
///
/// Values are ordered by strictness. A page always carries the strictest
/// state required by the handlers covering it.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum HandlerState {
    /// No handler covers the page.
    #[default]
    None,

    /// A handler covers the page but monitoring is switched off for it,
    /// either temporarily or because the page is aliased.
    Disabled,

    /// Writes to the page trap.
    Write,

    /// All accesses to the page trap.
    All,
}

/// Kind of a physical access handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandlerKind {
    /// Trap writes only. The range may start and end mid-page.
    Write,

    /// Trap reads and writes. Page granular.
    All,

    /// Trap all accesses to a page without real backing. Page granular.
    Mmio,
}

impl HandlerKind {
    /// Returns the page state a handler of this kind puts on its pages.
    pub const fn page_state(self) -> HandlerState {
        match self {
            Self::Write => HandlerState::Write,
            Self::All | Self::Mmio => HandlerState::All,
        }
    }

    /// Checks if handlers of this kind must cover whole pages.
    pub const fn is_page_granular(self) -> bool {
        !matches!(self, Self::Write)
    }
}

/// Type of a guest physical page.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageType {
    /// Ordinary RAM.
    #[default]
    Ram,

    /// Device memory with real backing (frame buffers and the like).
    Mmio2,

    /// An MMIO page currently backed by an [`Mmio2`] page.
    ///
    /// [`Mmio2`]: Self::Mmio2
    Mmio2AliasMmio,

    /// An MMIO page currently backed by arbitrary host memory.
    SpecialAliasMmio,

    /// Shadowed ROM.
    RomShadow,

    /// ROM.
    Rom,

    /// MMIO page without backing. Reads come from the shared zero page.
    Mmio,
}

impl PageType {
    /// Checks if the page is an MMIO page aliased to some other backing.
    pub const fn is_mmio_alias(self) -> bool {
        matches!(self, Self::Mmio2AliasMmio | Self::SpecialAliasMmio)
    }
}

/// State of the host backing of a page.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackingState {
    /// Backed by the shared zero page.
    #[default]
    Zero,

    /// Backed by a private, writable host page.
    Allocated,

    /// Allocated but write monitored for dirty tracking.
    WriteMonitored,

    /// Backed by a page shared between VMs.
    Shared,

    /// Handed back to the host by the balloon driver.
    Ballooned,
}

/// Identifier of a host storage page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    /// No storage page.
    pub const NIL: PageId = PageId(u32::MAX);
}

/// Handle of an MMIO2 region owned by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Mmio2Handle(pub u32);

/// Descriptor of a single guest physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDescriptor {
    /// Host physical address of the backing page.
    pub hc_phys: Hcphys,

    /// Storage page identifier of the backing page.
    pub page_id: PageId,

    /// Type of the page.
    pub page_type: PageType,

    /// State of the backing page.
    pub backing: BackingState,

    /// Strictest monitoring requirement of the handlers covering the page.
    pub handler_state: HandlerState,

    /// Opaque state owned by the hardware notification sink.
    pub nem_state: u8,
}

impl PageDescriptor {
    /// Creates a descriptor for an allocated RAM page.
    pub const fn ram(hc_phys: Hcphys, page_id: PageId) -> Self {
        Self {
            hc_phys,
            page_id,
            page_type: PageType::Ram,
            backing: BackingState::Allocated,
            handler_state: HandlerState::None,
            nem_state: 0,
        }
    }

    /// Creates a descriptor for an MMIO2 page.
    pub const fn mmio2(hc_phys: Hcphys, page_id: PageId) -> Self {
        Self {
            page_type: PageType::Mmio2,
            ..Self::ram(hc_phys, page_id)
        }
    }

    /// Creates a descriptor for an unbacked MMIO page sitting on the zero
    /// page.
    pub const fn mmio(zero_page: Hcphys) -> Self {
        Self {
            hc_phys: zero_page,
            page_id: PageId::NIL,
            page_type: PageType::Mmio,
            backing: BackingState::Zero,
            handler_state: HandlerState::None,
            nem_state: 0,
        }
    }

    /// Checks if the page is backed by the zero page.
    pub const fn is_zero(&self) -> bool {
        matches!(self.backing, BackingState::Zero)
    }

    /// Computes the access the guest may perform without trapping.
    pub fn allowed_access(&self) -> MemoryAccess {
        if matches!(self.backing, BackingState::Ballooned) || self.page_type == PageType::Mmio {
            return MemoryAccess::empty();
        }

        match self.handler_state {
            HandlerState::None | HandlerState::Disabled => match self.backing {
                BackingState::Allocated => MemoryAccess::RWX,
                _ => MemoryAccess::RX,
            },
            HandlerState::Write => MemoryAccess::RX,
            HandlerState::All => MemoryAccess::empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_ordered_by_strictness() {
        assert!(HandlerState::None < HandlerState::Disabled);
        assert!(HandlerState::Disabled < HandlerState::Write);
        assert!(HandlerState::Write < HandlerState::All);
        assert_eq!(HandlerKind::Write.page_state(), HandlerState::Write);
        assert_eq!(HandlerKind::Mmio.page_state(), HandlerState::All);
    }

    #[test]
    fn allowed_access_follows_handler_state() {
        let mut page = PageDescriptor::ram(Hcphys(0x10000), PageId(1));
        assert_eq!(page.allowed_access(), MemoryAccess::RWX);

        page.handler_state = HandlerState::Write;
        assert_eq!(page.allowed_access(), MemoryAccess::RX);

        page.handler_state = HandlerState::All;
        assert_eq!(page.allowed_access(), MemoryAccess::empty());

        page.handler_state = HandlerState::Disabled;
        assert_eq!(page.allowed_access(), MemoryAccess::RWX);

        let mmio = PageDescriptor::mmio(Hcphys(0));
        assert_eq!(mmio.allowed_access(), MemoryAccess::empty());
        assert_eq!(format!("{}", MemoryAccess::RX), "r-x");
    }
}
