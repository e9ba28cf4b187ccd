use pgm_core::{Gcphys, HandlerKind, Hcphys, MemoryAccess, PageType};

/// A notification received by the in-memory sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyEvent {
    /// The protection of a page changed.
    ProtectionChanged {
        /// The page.
        gcphys: Gcphys,
        /// Host backing of the page.
        hc_phys: Hcphys,
        /// Access allowed without trapping.
        access: MemoryAccess,
        /// Type of the page.
        page_type: PageType,
    },

    /// The backing of a page changed.
    BackingChanged {
        /// The page.
        gcphys: Gcphys,
        /// Previous host backing.
        old_hc_phys: Hcphys,
        /// New host backing.
        new_hc_phys: Hcphys,
        /// Access allowed without trapping.
        access: MemoryAccess,
        /// Type of the page.
        page_type: PageType,
    },

    /// A handler was registered.
    Registered {
        /// Kind of the handler.
        kind: HandlerKind,
        /// First byte of the handler.
        gcphys: Gcphys,
        /// Size of the handler in bytes.
        size: u64,
    },

    /// A handler was deregistered.
    Deregistered {
        /// Kind of the handler.
        kind: HandlerKind,
        /// First byte of the released range.
        gcphys: Gcphys,
        /// Size of the released range.
        size: u64,
        /// Whether the range should go back to plain RAM.
        restore_as_ram: bool,
    },

    /// A handler was moved.
    Modified {
        /// Kind of the handler.
        kind: HandlerKind,
        /// Previous first byte.
        old_gcphys: Gcphys,
        /// New first byte.
        new_gcphys: Gcphys,
        /// New size in bytes.
        size: u64,
        /// Whether the old range should go back to plain RAM.
        restore_as_ram: bool,
    },
}

impl NotifyEvent {
    /// Returns the page a per-page notification is about.
    pub fn page(&self) -> Option<Gcphys> {
        match *self {
            Self::ProtectionChanged { gcphys, .. } | Self::BackingChanged { gcphys, .. } => {
                Some(gcphys)
            }
            _ => None,
        }
    }
}
