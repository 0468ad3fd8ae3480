use std::fmt;

use serde::{Deserialize, Serialize};

/// Element types understood by the MME/TPC engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    Fp8E4M3,
    Fp8E5M2,
    Bf16,
    F16,
    F32,
}

impl DType {
    pub fn size_in_bytes(self) -> u64 {
        match self {
            DType::I8 | DType::U8 | DType::Fp8E4M3 | DType::Fp8E5M2 => 1,
            DType::I16 | DType::U16 | DType::Bf16 | DType::F16 => 2,
            DType::I32 | DType::U32 | DType::F32 => 4,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            DType::Fp8E4M3 | DType::Fp8E5M2 | DType::Bf16 | DType::F16 | DType::F32
        )
    }

    /// Floating types narrower than f32 lose accuracy when accumulating long reductions.
    pub fn is_low_precision_float(self) -> bool {
        self.is_float() && self != DType::F32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::I8 => "i8",
            DType::U8 => "u8",
            DType::I16 => "i16",
            DType::U16 => "u16",
            DType::I32 => "i32",
            DType::U32 => "u32",
            DType::Fp8E4M3 => "fp8_e4m3",
            DType::Fp8E5M2 => "fp8_e5m2",
            DType::Bf16 => "bf16",
            DType::F16 => "f16",
            DType::F32 => "f32",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
