//! Accumulation policy for common-dimension slicing.

use serde::{Deserialize, Serialize};

use crate::config::SlicerConfig;
use crate::graph::DType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ReductionPolicy {
    /// Every common slice after the first accumulates into the destination buffer.
    InPlace { dtype: DType },
    /// Each common slice writes an f32 partial; a binary tree sums them and a cast produces
    /// the declared type.
    Staged { partial: DType, output: DType },
}

impl ReductionPolicy {
    pub fn choose(reduced_elements: u64, output: DType, config: &SlicerConfig) -> Self {
        if !output.is_low_precision_float() || reduced_elements <= config.f32_accumulation_threshold
        {
            ReductionPolicy::InPlace { dtype: output }
        } else {
            ReductionPolicy::Staged {
                partial: DType::F32,
                output,
            }
        }
    }

    /// Element type of the output buffer held in SRAM while reducing.
    pub fn accumulator(&self) -> DType {
        match self {
            ReductionPolicy::InPlace { dtype } => *dtype,
            ReductionPolicy::Staged { partial, .. } => *partial,
        }
    }

    pub fn is_staged(&self) -> bool {
        matches!(self, ReductionPolicy::Staged { .. })
    }
}

/// One pairwise sum `dst = lhs + rhs` over partial indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceStep {
    pub lhs: u32,
    pub rhs: u32,
    pub dst: u32,
}

/// Balanced pairwise reduction of partials `0..count`. New partials are numbered from `count`;
/// the last step's `dst` holds the total. Odd partials are carried to the next level.
pub fn reduction_tree(count: u32) -> Vec<ReduceStep> {
    let mut level: Vec<u32> = (0..count).collect();
    let mut next = count;
    let mut steps = Vec::with_capacity(count.saturating_sub(1) as usize);
    while level.len() > 1 {
        let mut upper = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            match *pair {
                [lhs, rhs] => {
                    steps.push(ReduceStep { lhs, rhs, dst: next });
                    upper.push(next);
                    next += 1;
                }
                [carry] => upper.push(carry),
                _ => {}
            }
        }
        level = upper;
    }
    steps
}

/// Index of the partial holding the full sum of `count` partials.
pub fn reduction_root(count: u32) -> u32 {
    reduction_tree(count).last().map(|step| step.dst).unwrap_or(0)
}
