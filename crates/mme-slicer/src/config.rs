//! Pass configuration.
//!
//! [`SlicerConfig`] is an immutable value handed to the pass at construction. Nothing in the
//! crate reads configuration from global state, so two passes with different settings can run
//! side by side (the equivalence tests compile the same graph with slicing on and off).

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::env::{read_bool, read_u64};
use crate::error::Result;
use crate::hal::HardwareCaps;

/// Budgets derived from the device are rounded down to this granularity.
pub const SRAM_BUDGET_GRANULARITY: u64 = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlicerConfig {
    /// Master switch. When off every operator is emitted unsliced.
    pub enabled: bool,
    /// Replaces the device-derived budget. `Some(0)` disables slicing.
    pub sram_capacity_override: Option<u64>,
    /// SRAM bytes kept out of the budget for non-bundle users.
    pub reserved_sram_bytes: u64,
    pub conv_spatial_slicing: bool,
    pub dedw_spatial_slicing: bool,
    pub dedx_spatial_slicing: bool,
    pub gemm_common_dim_slicing: bool,
    pub spill_fusion: bool,
    pub eviction_fusion: bool,
    pub bundle_expansion: bool,
    pub double_buffer: bool,
    pub align_to_cache_line: bool,
    /// Minimum number of reduced elements in one common-dim slice.
    pub min_common_dim_for_partials: u64,
    /// Reductions longer than this accumulate in f32 partials when the output is low precision.
    pub f32_accumulation_threshold: u64,
    /// Physical (non-reshape) nodes stitched per producer/consumer role.
    pub max_chain_length: usize,
}

impl Default for SlicerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sram_capacity_override: None,
            reserved_sram_bytes: 0,
            conv_spatial_slicing: true,
            dedw_spatial_slicing: true,
            dedx_spatial_slicing: true,
            gemm_common_dim_slicing: true,
            spill_fusion: true,
            eviction_fusion: true,
            bundle_expansion: true,
            double_buffer: true,
            align_to_cache_line: true,
            min_common_dim_for_partials: 512,
            f32_accumulation_threshold: 4096,
            max_chain_length: 3,
        }
    }
}

impl SlicerConfig {
    /// Configuration with slicing disabled through a zero capacity override.
    pub fn ground_truth() -> Self {
        Self {
            sram_capacity_override: Some(0),
            ..Self::default()
        }
    }

    pub fn with_capacity(bytes: u64) -> Self {
        Self {
            sram_capacity_override: Some(bytes),
            ..Self::default()
        }
    }

    /// Defaults overlaid with `SRAM_SLICER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read slicer config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse slicer config {}", path.display()))
    }

    pub fn apply_env(&mut self) -> Result<()> {
        let flags: [(&str, &mut bool); 10] = [
            ("SRAM_SLICER_ENABLED", &mut self.enabled),
            ("SRAM_SLICER_4D_CONV_SPATIAL_SLICE_ENABLED", &mut self.conv_spatial_slicing),
            ("SRAM_SLICER_4D_DEDW_SPATIAL_SLICE_ENABLED", &mut self.dedw_spatial_slicing),
            ("SRAM_SLICER_4D_DEDX_SPATIAL_SLICE_ENABLED", &mut self.dedx_spatial_slicing),
            ("SRAM_SLICER_GEMM_COMMON_DIM_SLICE_ENABLED", &mut self.gemm_common_dim_slicing),
            ("SRAM_SLICER_SPILL_FUSION_ENABLED", &mut self.spill_fusion),
            ("SRAM_SLICER_EVICTION_FUSION_ENABLED", &mut self.eviction_fusion),
            ("SRAM_SLICER_BUNDLE_EXPANSION_ENABLED", &mut self.bundle_expansion),
            ("SRAM_SLICER_DOUBLE_BUFFER_ENABLED", &mut self.double_buffer),
            ("SRAM_SLICER_ALIGN_TO_CACHE_LINE", &mut self.align_to_cache_line),
        ];
        for (name, slot) in flags {
            if let Some(value) = read_bool(name) {
                *slot = value;
            }
        }
        if let Some(bytes) = read_u64("SRAM_SLICER_MAX_CAPACITY_BYTES")? {
            self.sram_capacity_override = Some(bytes);
        }
        if let Some(bytes) = read_u64("SRAM_SLICER_RESERVED_BYTES")? {
            self.reserved_sram_bytes = bytes;
        }
        if let Some(value) = read_u64("SRAM_SLICER_MIN_COMMON_DIM_FOR_PARTIALS")? {
            self.min_common_dim_for_partials = value;
        }
        if let Some(value) = read_u64("SRAM_SLICER_F32_ACCUMULATION_THRESHOLD")? {
            self.f32_accumulation_threshold = value;
        }
        if let Some(value) = read_u64("SRAM_SLICER_MAX_CHAIN_LENGTH")? {
            self.max_chain_length = value as usize;
        }
        Ok(())
    }

    /// SRAM bytes the pass may plan against on `caps`. Zero means slicing is off.
    pub fn sram_budget(&self, caps: &dyn HardwareCaps) -> u64 {
        if !self.enabled {
            return 0;
        }
        let device = caps
            .sram_size_bytes()
            .saturating_sub(self.reserved_sram_bytes);
        match self.sram_capacity_override {
            Some(bytes) => bytes.min(device),
            None if device > SRAM_BUDGET_GRANULARITY => {
                device - device % SRAM_BUDGET_GRANULARITY
            }
            None => device,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::DeviceCaps;

    #[test]
    fn zero_override_disables_slicing() {
        let caps = DeviceCaps::gaudi2();
        assert_eq!(SlicerConfig::ground_truth().sram_budget(&caps), 0);
    }

    #[test]
    fn device_budget_rounds_down_to_granularity() {
        let caps = DeviceCaps::gaudi2();
        let config = SlicerConfig {
            reserved_sram_bytes: 1000,
            ..SlicerConfig::default()
        };
        let budget = config.sram_budget(&caps);
        assert_eq!(budget % SRAM_BUDGET_GRANULARITY, 0);
        assert!(budget <= caps.sram_size_bytes() - 1000);
        assert!(budget + SRAM_BUDGET_GRANULARITY > caps.sram_size_bytes() - 1000);
    }

    #[test]
    fn override_is_capped_by_device_capacity() {
        let caps = DeviceCaps::gaudi();
        let config = SlicerConfig::with_capacity(5_000_000);
        assert_eq!(config.sram_budget(&caps), 5_000_000);
        let config = SlicerConfig::with_capacity(u64::MAX);
        assert_eq!(config.sram_budget(&caps), caps.sram_size_bytes());
    }

    #[test]
    fn config_parses_partial_json() {
        let config: SlicerConfig =
            serde_json::from_str(r#"{"spill_fusion": false, "max_chain_length": 1}"#)
                .expect("config json");
        assert!(!config.spill_fusion);
        assert_eq!(config.max_chain_length, 1);
        assert!(config.eviction_fusion);
    }
}
