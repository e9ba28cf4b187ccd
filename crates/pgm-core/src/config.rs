use serde::{Deserialize, Serialize};

/// Configuration of the physical handler engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysHandlerConfig {
    /// Maximum number of handler records (live and detached) that may
    /// exist at the same time.
    pub max_handlers: usize,
}

impl PhysHandlerConfig {
    /// Default for [`max_handlers`].
    ///
    /// [`max_handlers`]: Self::max_handlers
    pub const DEFAULT_MAX_HANDLERS: usize = 6144;
}

impl Default for PhysHandlerConfig {
    fn default() -> Self {
        Self {
            max_handlers: Self::DEFAULT_MAX_HANDLERS,
        }
    }
}
