//! HECI driver configuration
//!
//! Tunables that the firmware build or provisioning can override.
//! Stored as a postcard blob in non-volatile storage; loaded and validated
//! once at bring-up.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Largest page size the DMA allocator accepts.
const MAX_DMA_PAGE_SIZE: u32 = 64 * 1024;

/// Core driver configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeciConfig {
    // --- Flow control ---
    /// How long a sender waits for a host credit (milliseconds)
    pub flow_control_timeout_ms: u32,

    // --- DMA ---
    /// Allow the DMA offload path at all
    pub dma_enabled: bool,
    /// Messages strictly longer than this (bytes) go through DMA
    pub dma_threshold: u32,
    /// Page granularity of the host DMA window (bytes, power of two)
    pub dma_page_size: u32,
    /// Copy-engine completion wait (milliseconds)
    pub dma_timeout_ms: u32,
}

impl Default for HeciConfig {
    fn default() -> Self {
        Self {
            // Flow control
            flow_control_timeout_ms: 10_000,

            // DMA
            dma_enabled: true,
            dma_threshold: 1024,
            dma_page_size: 4096,
            dma_timeout_ms: 500,
        }
    }
}

impl HeciConfig {
    /// Reject values the driver cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flow_control_timeout_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "flow_control_timeout_ms must be > 0",
            ));
        }
        if self.dma_timeout_ms == 0 {
            return Err(ConfigError::ValidationFailed("dma_timeout_ms must be > 0"));
        }
        if !self.dma_page_size.is_power_of_two() || self.dma_page_size > MAX_DMA_PAGE_SIZE {
            return Err(ConfigError::ValidationFailed(
                "dma_page_size must be a power of two <= 64 KiB",
            ));
        }
        Ok(())
    }

    /// Decode and validate a stored configuration blob.
    pub fn from_bytes(blob: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = postcard::from_bytes(blob).map_err(|_| ConfigError::Corrupted)?;
        config.validate()?;
        Ok(config)
    }

    /// Encode for storage.
    pub fn to_bytes(&self) -> Result<alloc::vec::Vec<u8>, ConfigError> {
        postcard::to_allocvec(self).map_err(|_| ConfigError::Corrupted)
    }
}
