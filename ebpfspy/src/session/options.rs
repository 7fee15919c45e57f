//! Session configuration

use serde::{Deserialize, Serialize};

use crate::domain::ConfigError;
use crate::metrics::SharedMetrics;
use crate::symtab::{CacheOptions, PlaceholderOptions};

pub const MIN_SAMPLE_RATE: u32 = 1;
pub const MAX_SAMPLE_RATE: u32 = 1000;
pub const DEFAULT_SAMPLE_RATE: u32 = 97;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Sampling frequency per CPU in Hz
    pub sample_rate: u32,
    pub collect_user: bool,
    pub collect_kernel: bool,
    /// Merge stacks from a registered Python unwinder
    pub python_enabled: bool,
    /// Render unmatched frames as `<path>+0x<offset>` instead of `<path>`
    pub unknown_symbol_module_offset: bool,
    /// Render unmapped frames as `0x<addr>` instead of `[unknown]`
    pub unknown_symbol_address: bool,
    pub cache_options: CacheOptions,
    #[serde(skip)]
    pub metrics: SharedMetrics,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            collect_user: true,
            collect_kernel: false,
            python_enabled: false,
            unknown_symbol_module_offset: true,
            unknown_symbol_address: false,
            cache_options: CacheOptions::default(),
            metrics: SharedMetrics::default(),
        }
    }
}

impl SessionOptions {
    /// # Errors
    /// Returns the first invalid setting
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            return Err(ConfigError::InvalidSampleRate {
                rate: self.sample_rate,
                min: MIN_SAMPLE_RATE,
                max: MAX_SAMPLE_RATE,
            });
        }
        if !self.collect_user && !self.collect_kernel {
            return Err(ConfigError::NothingToCollect);
        }
        self.cache_options.validate()
    }

    #[must_use]
    pub fn placeholders(&self) -> PlaceholderOptions {
        PlaceholderOptions {
            unknown_symbol_module_offset: self.unknown_symbol_module_offset,
            unknown_symbol_address: self.unknown_symbol_address,
        }
    }
}
