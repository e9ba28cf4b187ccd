use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Access a guest may perform on a page without trapping.
    ///
    /// Handed to the hardware notification sink whenever the handler
    /// state or the backing of a page changes. See
    /// [`PageDescriptor::allowed_access`].
    ///
    /// [`PageDescriptor::allowed_access`]: crate::PageDescriptor::allowed_access
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MemoryAccess: u8 {
        /// Read permission.
        const R = 0b00000001;

        /// Write permission.
        const W = 0b00000010;

        /// Execute permission.
        const X = 0b00000100;

        /// Read and execute. Writes trap.
        const RX = Self::R.bits() | Self::X.bits();

        /// Nothing traps.
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

impl std::fmt::Display for MemoryAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for (flag, c) in [(Self::R, 'r'), (Self::W, 'w'), (Self::X, 'x')] {
            let c = if self.contains(flag) { c } else { '-' };
            std::fmt::Write::write_char(f, c)?;
        }

        Ok(())
    }
}
