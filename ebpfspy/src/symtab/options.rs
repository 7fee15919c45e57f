//! Cache tier configuration

use serde::{Deserialize, Serialize};

use crate::domain::ConfigError;

/// Bounds of one generational cache tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GCacheOptions {
    /// Maximum number of resident entries
    pub size: usize,
    /// Rounds an entry may stay unaccessed before `next_round` evicts it
    pub keep_rounds: u64,
}

impl GCacheOptions {
    /// # Errors
    /// Returns [`ConfigError::ZeroCacheSize`] if `size` is zero
    pub fn validate(&self, tier: &'static str) -> Result<(), ConfigError> {
        if self.size == 0 {
            return Err(ConfigError::ZeroCacheSize { tier });
        }
        Ok(())
    }
}

/// Options for the three symbolization tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Symbol tables keyed by binary identifier
    pub build_id: GCacheOptions,
    /// File identities keyed by (device, inode)
    pub same_file: GCacheOptions,
    /// Process memory maps keyed by pid
    pub pid: GCacheOptions,
}

impl CacheOptions {
    /// # Errors
    /// Returns the first invalid tier's error
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.build_id.validate("build-id")?;
        self.same_file.validate("same-file")?;
        self.pid.validate("pid")?;
        Ok(())
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            build_id: GCacheOptions { size: 128, keep_rounds: 128 },
            same_file: GCacheOptions { size: 1024, keep_rounds: 16 },
            pid: GCacheOptions { size: 1024, keep_rounds: 8 },
        }
    }
}

/// How addresses that cannot be symbolized are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderOptions {
    /// Render unmatched frames as `<path>+0x<offset>` instead of `<path>`
    pub unknown_symbol_module_offset: bool,
    /// Render unmapped frames as `0x<addr>` instead of `[unknown]`
    pub unknown_symbol_address: bool,
}

impl Default for PlaceholderOptions {
    fn default() -> Self {
        Self { unknown_symbol_module_offset: true, unknown_symbol_address: false }
    }
}
