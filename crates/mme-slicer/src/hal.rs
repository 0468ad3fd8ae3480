//! Device capability lookup.
//!
//! The pass treats every device fact as a planning constant. [`HardwareCaps`] is the seam a
//! driver-backed provider would implement; [`DeviceCaps`] is a plain serializable table with
//! presets for the supported device generations.

use serde::{Deserialize, Serialize};

use crate::graph::DType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineClass {
    Mme,
    Tpc,
    Dma,
}

/// Data-movement operators whose dtype support varies per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataMovement {
    Memcpy,
    Memset,
    Transpose,
}

/// Minimum MME output tile, in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileGeometry {
    pub width: u64,
    pub height: u64,
}

pub trait HardwareCaps: Send + Sync {
    fn name(&self) -> &str;
    fn sram_size_bytes(&self) -> u64;
    fn sram_base_address(&self) -> u64;
    fn cache_line_bytes(&self) -> u64;
    fn engine_count(&self, class: EngineClass) -> u32;
    fn mme_min_tile(&self, dtype: DType) -> TileGeometry;
    fn max_register_value(&self, class: EngineClass) -> u64;
    fn supports(&self, op: DataMovement, dtype: DType) -> bool;

    /// Elements of `dtype` in one cache line (at least one).
    fn cache_line_elements(&self, dtype: DType) -> u64 {
        (self.cache_line_bytes() / dtype.size_in_bytes()).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCaps {
    pub name: String,
    pub sram_size_bytes: u64,
    pub sram_base_address: u64,
    pub cache_line_bytes: u64,
    pub mme_engines: u32,
    pub tpc_engines: u32,
    pub dma_engines: u32,
    /// Width of the minimum MME tile in bytes; the element count depends on the dtype.
    pub mme_tile_width_bytes: u64,
    /// Height of the minimum MME tile in rows.
    pub mme_tile_height: u64,
    pub mme_max_register: u64,
    pub tpc_max_register: u64,
    pub dma_max_register: u64,
    pub memcpy_dtypes: Vec<DType>,
    pub memset_dtypes: Vec<DType>,
    pub transpose_dtypes: Vec<DType>,
}

const COMMON_DTYPES: [DType; 9] = [
    DType::I8,
    DType::U8,
    DType::I16,
    DType::U16,
    DType::I32,
    DType::U32,
    DType::Bf16,
    DType::F16,
    DType::F32,
];

impl DeviceCaps {
    pub fn gaudi() -> Self {
        Self {
            name: "gaudi".to_string(),
            sram_size_bytes: 24 * 1024 * 1024,
            sram_base_address: 0x7f_f000_0000,
            cache_line_bytes: 128,
            mme_engines: 2,
            tpc_engines: 8,
            dma_engines: 5,
            mme_tile_width_bytes: 256,
            mme_tile_height: 128,
            mme_max_register: u64::from(u32::MAX),
            tpc_max_register: u64::from(u32::MAX),
            dma_max_register: u64::from(u32::MAX),
            memcpy_dtypes: COMMON_DTYPES.to_vec(),
            memset_dtypes: COMMON_DTYPES.to_vec(),
            transpose_dtypes: vec![DType::Bf16, DType::F16, DType::F32],
        }
    }

    pub fn gaudi2() -> Self {
        let mut dtypes = COMMON_DTYPES.to_vec();
        dtypes.extend([DType::Fp8E4M3, DType::Fp8E5M2]);
        Self {
            name: "gaudi2".to_string(),
            sram_size_bytes: 48 * 1024 * 1024,
            sram_base_address: 0x10_0000_0000,
            cache_line_bytes: 128,
            mme_engines: 2,
            tpc_engines: 24,
            dma_engines: 10,
            mme_tile_width_bytes: 256,
            mme_tile_height: 128,
            mme_max_register: u64::from(u32::MAX),
            tpc_max_register: u64::from(u32::MAX),
            dma_max_register: u64::from(u32::MAX),
            memcpy_dtypes: dtypes.clone(),
            memset_dtypes: dtypes.clone(),
            transpose_dtypes: dtypes,
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "gaudi" | "gaudi1" => Some(Self::gaudi()),
            "gaudi2" => Some(Self::gaudi2()),
            _ => None,
        }
    }
}

impl HardwareCaps for DeviceCaps {
    fn name(&self) -> &str {
        &self.name
    }

    fn sram_size_bytes(&self) -> u64 {
        self.sram_size_bytes
    }

    fn sram_base_address(&self) -> u64 {
        self.sram_base_address
    }

    fn cache_line_bytes(&self) -> u64 {
        self.cache_line_bytes
    }

    fn engine_count(&self, class: EngineClass) -> u32 {
        match class {
            EngineClass::Mme => self.mme_engines,
            EngineClass::Tpc => self.tpc_engines,
            EngineClass::Dma => self.dma_engines,
        }
    }

    fn mme_min_tile(&self, dtype: DType) -> TileGeometry {
        TileGeometry {
            width: (self.mme_tile_width_bytes / dtype.size_in_bytes()).max(1),
            height: self.mme_tile_height.max(1),
        }
    }

    fn max_register_value(&self, class: EngineClass) -> u64 {
        match class {
            EngineClass::Mme => self.mme_max_register,
            EngineClass::Tpc => self.tpc_max_register,
            EngineClass::Dma => self.dma_max_register,
        }
    }

    fn supports(&self, op: DataMovement, dtype: DType) -> bool {
        let table = match op {
            DataMovement::Memcpy => &self.memcpy_dtypes,
            DataMovement::Memset => &self.memset_dtypes,
            DataMovement::Transpose => &self.transpose_dtypes,
        };
        table.contains(&dtype)
    }
}
