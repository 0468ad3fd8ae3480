//! A chosen partition of one MME operator.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::operand::TensorSlicing;
use super::reduction::ReductionPolicy;
use crate::config::SlicerConfig;
use crate::geometry::{AxisRole, MmeGeometry, OperandRole};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlicingStrategy {
    pub geometry: MmeGeometry,
    /// Chunk size per axis; equal to the extent when the axis is not sliced.
    pub chunks: Vec<u64>,
    /// Applies only while a common axis is sliced.
    pub reduction: ReductionPolicy,
}

/// Planned range of one axis, as reported in the program summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisSlicing {
    pub label: String,
    pub role: AxisRole,
    pub extent: u64,
    pub chunk: u64,
    pub slices: u64,
}

impl SlicingStrategy {
    pub fn unsliced(geometry: MmeGeometry, config: &SlicerConfig) -> Self {
        let chunks = geometry.axes.iter().map(|axis| axis.extent).collect();
        let reduction =
            ReductionPolicy::choose(geometry.reduced_elements(), geometry.output_dtype(), config);
        Self {
            geometry,
            chunks,
            reduction,
        }
    }

    pub fn num_slices(&self, axis: usize) -> u64 {
        let extent = self.geometry.axes[axis].extent;
        let chunk = self.chunks[axis].max(1);
        extent.div_ceil(chunk).max(1)
    }

    pub fn total_slices(&self) -> u64 {
        (0..self.chunks.len()).map(|axis| self.num_slices(axis)).product()
    }

    pub fn is_sliced(&self) -> bool {
        (0..self.chunks.len()).any(|axis| self.num_slices(axis) > 1)
    }

    pub fn common_sliced(&self) -> bool {
        self.geometry
            .axes
            .iter()
            .enumerate()
            .any(|(axis, entry)| entry.is_common() && self.num_slices(axis) > 1)
    }

    /// Reduction in effect, if any.
    pub fn active_reduction(&self) -> Option<ReductionPolicy> {
        self.common_sliced().then_some(self.reduction)
    }

    /// `(start, len)` of slice `index` along `axis`.
    pub fn axis_range(&self, axis: usize, index: u64) -> (u64, u64) {
        let extent = self.geometry.axes[axis].extent;
        let chunk = self.chunks[axis].max(1);
        let start = (index * chunk).min(extent);
        (start, chunk.min(extent - start))
    }

    pub fn ranges(&self, coord: &[u64]) -> SmallVec<[(u64, u64); 8]> {
        coord
            .iter()
            .enumerate()
            .map(|(axis, &index)| self.axis_range(axis, index))
            .collect()
    }

    /// Slice coordinates in row-major order: the first axis is outermost.
    pub fn walk(&self) -> SliceWalk {
        SliceWalk::new((0..self.chunks.len()).map(|axis| self.num_slices(axis)).collect())
    }

    /// Number of common slices that contribute to one output window.
    pub fn common_slices(&self) -> u64 {
        self.geometry
            .axes
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_common())
            .map(|(axis, _)| self.num_slices(axis))
            .product()
    }

    /// Position of `coord` among the common slices of its output window.
    pub fn common_index(&self, coord: &[u64]) -> u64 {
        self.geometry
            .axes
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_common())
            .fold(0, |acc, (axis, _)| acc * self.num_slices(axis) + coord[axis])
    }

    /// Slicing of an anchor operand. The output is held in the accumulator type while a
    /// reduction is active.
    pub fn operand_slicing(&self, role: OperandRole) -> Option<TensorSlicing> {
        let operand = self.geometry.operand(role)?;
        let dtype = match (role, self.active_reduction()) {
            (OperandRole::Output, Some(policy)) => policy.accumulator(),
            _ => operand.dtype,
        };
        TensorSlicing::for_operand(&self.geometry, role, dtype)
    }

    pub fn operand_slicings(&self) -> Vec<(OperandRole, TensorSlicing)> {
        self.geometry
            .operands
            .iter()
            .filter_map(|op| self.operand_slicing(op.role).map(|slicing| (op.role, slicing)))
            .collect()
    }

    pub fn summary(&self) -> Vec<AxisSlicing> {
        self.geometry
            .axes
            .iter()
            .enumerate()
            .map(|(axis, entry)| AxisSlicing {
                label: entry.label.clone(),
                role: entry.role,
                extent: entry.extent,
                chunk: self.chunks[axis],
                slices: self.num_slices(axis),
            })
            .collect()
    }
}

/// Row-major iterator over slice coordinates.
#[derive(Debug, Clone)]
pub struct SliceWalk {
    counts: Vec<u64>,
    next: Option<Vec<u64>>,
}

impl SliceWalk {
    pub fn new(counts: Vec<u64>) -> Self {
        let next = if counts.iter().all(|&count| count > 0) {
            Some(vec![0; counts.len()])
        } else {
            None
        };
        Self { counts, next }
    }
}

impl Iterator for SliceWalk {
    type Item = Vec<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        let mut following = current.clone();
        let mut done = true;
        for axis in (0..following.len()).rev() {
            following[axis] += 1;
            if following[axis] < self.counts[axis] {
                done = false;
                break;
            }
            following[axis] = 0;
        }
        if !done {
            self.next = Some(following);
        }
        Some(current)
    }
}
