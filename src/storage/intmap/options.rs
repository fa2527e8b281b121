use serde::{Deserialize, Serialize};

use crate::primitives::pager::PagerOptions;
use crate::types::{page, IntMapError, Result};

/// Environment variable overriding [`IntMapOptions::node_size`].
pub const NODE_SIZE_ENV: &str = "SOMBRA_INTMAP_NODE_SIZE";
/// Environment variable overriding [`IntMapOptions::cache_root_buffer`].
pub const CACHE_ROOT_ENV: &str = "SOMBRA_INTMAP_CACHE_ROOT";

/// Configuration supplied when opening an [`super::IntToIntBTree`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntMapOptions {
    /// Size in bytes of one index node.
    pub node_size: u32,
    /// Size in bytes of a page-cache page; a multiple of `node_size`.
    pub storage_page_size: usize,
    /// Number of page-cache pages kept resident.
    pub cache_pages: usize,
    /// Whether empty leaves turn into hash tables on their first insert.
    pub hashed_leaves: bool,
    /// Whether the root page buffer is kept between operations and lent to traversals.
    pub cache_root_buffer: bool,
}

impl Default for IntMapOptions {
    fn default() -> Self {
        Self {
            node_size: page::DEFAULT_NODE_SIZE,
            storage_page_size: page::DEFAULT_STORAGE_PAGE_SIZE,
            cache_pages: 64,
            hashed_leaves: true,
            cache_root_buffer: true,
        }
    }
}

impl IntMapOptions {
    /// Parses options from TOML; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: Self = toml::from_str(text).map_err(|e| IntMapError::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Applies `SOMBRA_INTMAP_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(raw) = std::env::var(NODE_SIZE_ENV) {
            self.node_size = raw
                .trim()
                .parse()
                .map_err(|_| IntMapError::Config(format!("{NODE_SIZE_ENV}={raw} is not a size")))?;
        }
        if let Ok(raw) = std::env::var(CACHE_ROOT_ENV) {
            self.cache_root_buffer = parse_flag(&raw)
                .ok_or_else(|| IntMapError::Config(format!("{CACHE_ROOT_ENV}={raw} is not a flag")))?;
        }
        Ok(self)
    }

    /// Sets the node size.
    pub fn node_size(mut self, bytes: u32) -> Self {
        self.node_size = bytes;
        self
    }

    /// Sets the page-cache page size.
    pub fn storage_page_size(mut self, bytes: usize) -> Self {
        self.storage_page_size = bytes;
        self
    }

    /// Sets the number of resident cache pages.
    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    /// Enables or disables hashed leaves.
    pub fn hashed_leaves(mut self, enabled: bool) -> Self {
        self.hashed_leaves = enabled;
        self
    }

    /// Enables or disables lending the cached root buffer to traversals.
    pub fn cache_root_buffer(mut self, enabled: bool) -> Self {
        self.cache_root_buffer = enabled;
        self
    }

    /// Checks the sizes against each other; node capacities are checked by the layout.
    pub fn validate(&self) -> Result<()> {
        if self.node_size == 0 || self.storage_page_size == 0 {
            return Err(IntMapError::Invalid("sizes must be non-zero"));
        }
        if self.storage_page_size % self.node_size as usize != 0 {
            return Err(IntMapError::Invalid(
                "storage page size must be a multiple of the node size",
            ));
        }
        if self.cache_pages < page::MIN_CACHE_PAGES {
            return Err(IntMapError::Invalid("page cache needs at least 8 frames"));
        }
        Ok(())
    }

    pub(crate) fn pager_options(&self) -> PagerOptions {
        PagerOptions {
            page_size: self.storage_page_size,
            cache_pages: self.cache_pages,
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
