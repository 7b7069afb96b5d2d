//! Allocator configuration.
//!
//! Usually built in code, but it can also be loaded once at startup from a
//! TOML table:
//!
//! ```toml
//! max_pages = 256
//! initial_pages = 4
//! defrag_pages_per_step = 8
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{AllocError, AllocResult};

/// Default number of pages visited by [`crate::BlockAllocator::defragment_step`].
pub const DEFAULT_DEFRAG_PAGES_PER_STEP: usize = 4;

/// Tunables of a [`crate::BlockAllocator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocatorConfig {
    /// Upper bound on mapped pages. `None` means grow until the OS says no.
    pub max_pages: Option<usize>,
    /// Pages mapped eagerly when the allocator is built.
    pub initial_pages: usize,
    /// Pages visited by each incremental defragmentation step.
    pub defrag_pages_per_step: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_pages: None,
            initial_pages: 0,
            defrag_pages_per_step: DEFAULT_DEFRAG_PAGES_PER_STEP,
        }
    }
}

impl AllocatorConfig {
    /// Parses and validates a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> AllocResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| AllocError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the page cap.
    #[must_use]
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    /// Sets the number of eagerly mapped pages.
    #[must_use]
    pub fn with_initial_pages(mut self, initial_pages: usize) -> Self {
        self.initial_pages = initial_pages;
        self
    }

    /// Sets the per-step defragmentation budget.
    #[must_use]
    pub fn with_defrag_pages_per_step(mut self, pages: usize) -> Self {
        self.defrag_pages_per_step = pages;
        self
    }

    /// Checks that the values are consistent with each other.
    pub fn validate(&self) -> AllocResult<()> {
        if self.max_pages == Some(0) {
            return Err(AllocError::InvalidConfig(
                "max_pages must be at least 1".to_string(),
            ));
        }

        if let Some(max) = self.max_pages
            && self.initial_pages > max
        {
            return Err(AllocError::InvalidConfig(format!(
                "initial_pages ({}) exceeds max_pages ({max})",
                self.initial_pages
            )));
        }

        if self.defrag_pages_per_step == 0 {
            return Err(AllocError::InvalidConfig(
                "defrag_pages_per_step must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
