use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{Result, SlicerError};

/// Dimension sizes, fastest-changing dimension first.
pub type Dims = SmallVec<[u64; 5]>;

/// Declared tensor shape: a `(min, max)` pair per dimension. Static shapes have `min == max`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorShape {
    min: Dims,
    max: Dims,
}

impl TensorShape {
    pub fn fixed(dims: &[u64]) -> Self {
        Self {
            min: Dims::from_slice(dims),
            max: Dims::from_slice(dims),
        }
    }

    pub fn ranged(min: &[u64], max: &[u64]) -> Self {
        Self {
            min: Dims::from_slice(min),
            max: Dims::from_slice(max),
        }
    }

    pub fn validate(&self, tensor: &str) -> Result<()> {
        if self.min.len() != self.max.len() {
            return Err(SlicerError::ShapeRankMismatch {
                tensor: tensor.to_string(),
                min_rank: self.min.len(),
                max_rank: self.max.len(),
            });
        }
        for (dim, (&min, &max)) in self.min.iter().zip(self.max.iter()).enumerate() {
            if min > max {
                return Err(SlicerError::InvalidShapeRange {
                    tensor: tensor.to_string(),
                    dim,
                    min,
                    max,
                });
            }
        }
        Ok(())
    }

    pub fn rank(&self) -> usize {
        self.max.len()
    }

    pub fn min(&self) -> &[u64] {
        &self.min
    }

    pub fn max(&self) -> &[u64] {
        &self.max
    }

    pub fn is_dynamic(&self) -> bool {
        self.min != self.max
    }

    pub fn max_elements(&self) -> u64 {
        self.max.iter().product()
    }

    /// Checks `actual` against the declared range.
    pub fn check_actual(&self, tensor: &str, actual: &[u64]) -> Result<()> {
        if actual.len() != self.rank() {
            return Err(SlicerError::ActualRank {
                tensor: tensor.to_string(),
                expected: self.rank(),
                actual: actual.len(),
            });
        }
        for (dim, &value) in actual.iter().enumerate() {
            let (min, max) = (self.min[dim], self.max[dim]);
            if value < min || value > max {
                return Err(SlicerError::ActualShapeOutOfRange {
                    tensor: tensor.to_string(),
                    dim,
                    actual: value,
                    min,
                    max,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_above_max_is_rejected() {
        let shape = TensorShape::ranged(&[4, 9], &[4, 8]);
        let err = shape.validate("x").expect_err("invalid range");
        assert!(matches!(
            err,
            SlicerError::InvalidShapeRange { dim: 1, min: 9, max: 8, .. }
        ));
    }

    #[test]
    fn actual_shape_must_lie_in_range() {
        let shape = TensorShape::ranged(&[4, 2], &[4, 8]);
        shape.check_actual("x", &[4, 5]).expect("in range");
        assert!(shape.check_actual("x", &[4, 9]).is_err());
        assert!(shape.check_actual("x", &[4]).is_err());
    }
}
