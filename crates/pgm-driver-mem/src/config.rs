use serde::{Deserialize, Serialize};

/// Configuration of the in-memory driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemDriverConfig {
    /// Capacity of the page-map TLB. Zero is treated as one.
    pub page_map_tlb_entries: usize,
}

impl MemDriverConfig {
    /// Default for [`page_map_tlb_entries`].
    ///
    /// [`page_map_tlb_entries`]: Self::page_map_tlb_entries
    pub const DEFAULT_PAGE_MAP_TLB_ENTRIES: usize = 8192;
}

impl Default for MemDriverConfig {
    fn default() -> Self {
        Self {
            page_map_tlb_entries: Self::DEFAULT_PAGE_MAP_TLB_ENTRIES,
        }
    }
}
