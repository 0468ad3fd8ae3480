//! How one tensor follows the slicing axes of its bundle.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::strategy::SlicingStrategy;
use crate::geometry::{AxisWindow, DimMapping, MmeGeometry, OperandRole};
use crate::graph::{DType, Dims, Graph, TensorId};

/// Dimension `d` of a tensor partitioned by slicing axis `axis`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimBinding {
    pub axis: usize,
    pub mapping: DimMapping,
}

pub type DimBindings = SmallVec<[Option<DimBinding>; 5]>;

/// Slicing of a single tensor: unbound dims are always read whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSlicing {
    pub tensor: TensorId,
    /// Element type of the SRAM copy.
    pub dtype: DType,
    pub dims: Dims,
    pub bindings: DimBindings,
}

impl TensorSlicing {
    pub fn whole(graph: &Graph, tensor: TensorId) -> Self {
        let entry = graph.tensor(tensor);
        let dims = Dims::from_slice(entry.shape.max());
        Self {
            tensor,
            dtype: entry.dtype,
            bindings: dims.iter().map(|_| None).collect(),
            dims,
        }
    }

    pub fn with_bindings(graph: &Graph, tensor: TensorId, bindings: DimBindings) -> Self {
        Self {
            bindings,
            ..Self::whole(graph, tensor)
        }
    }

    /// Slicing of operand `role` of the anchor described by `geometry`.
    pub fn for_operand(geometry: &MmeGeometry, role: OperandRole, dtype: DType) -> Option<Self> {
        let operand = geometry.operand(role)?;
        let mut bindings: DimBindings = operand.dims.iter().map(|_| None).collect();
        for (axis, entry) in geometry.axes.iter().enumerate() {
            if let Some(binding) = entry.binding(role) {
                bindings[binding.dim] = Some(DimBinding {
                    axis,
                    mapping: binding.mapping,
                });
            }
        }
        Some(Self {
            tensor: operand.tensor,
            dtype,
            dims: operand.dims.clone(),
            bindings,
        })
    }

    pub fn binding(&self, dim: usize) -> Option<&DimBinding> {
        self.bindings.get(dim).and_then(Option::as_ref)
    }

    /// Axes this tensor follows, ascending.
    pub fn bound_axes(&self) -> SmallVec<[usize; 5]> {
        let mut axes: SmallVec<[usize; 5]> = self.bindings.iter().flatten().map(|b| b.axis).collect();
        axes.sort_unstable();
        axes.dedup();
        axes
    }

    pub fn windows(&self, strategy: &SlicingStrategy, coord: &[u64]) -> SmallVec<[AxisWindow; 5]> {
        self.dims
            .iter()
            .zip(&self.bindings)
            .map(|(&extent, binding)| match binding {
                Some(binding) => {
                    let (start, len) = strategy.axis_range(binding.axis, coord[binding.axis]);
                    binding.mapping.window(start, len, extent)
                }
                None => AxisWindow::plain(0, extent),
            })
            .collect()
    }

    /// Number of different windows over a full walk.
    pub fn distinct_slices(&self, strategy: &SlicingStrategy) -> u64 {
        self.bound_axes()
            .iter()
            .map(|&axis| strategy.num_slices(axis))
            .product()
    }

    /// Number of times the tensor is brought in during a walk whose innermost axis is last.
    pub fn fetch_count(&self, strategy: &SlicingStrategy) -> u64 {
        match self.bound_axes().last() {
            Some(&innermost) => (0..=innermost).map(|axis| strategy.num_slices(axis)).product(),
            None => 1,
        }
    }

    /// Largest window per dim over all slices.
    pub fn max_slice_dims(&self, strategy: &SlicingStrategy) -> Dims {
        self.dims
            .iter()
            .zip(&self.bindings)
            .map(|(&extent, binding)| match binding {
                Some(binding) => (0..strategy.num_slices(binding.axis))
                    .map(|index| {
                        let (start, len) = strategy.axis_range(binding.axis, index);
                        binding.mapping.window(start, len, extent).len
                    })
                    .max()
                    .unwrap_or(extent),
                None => extent,
            })
            .collect()
    }

    pub fn slice_bytes(&self, strategy: &SlicingStrategy) -> u64 {
        self.max_slice_dims(strategy).iter().product::<u64>() * self.dtype.size_in_bytes()
    }

    /// Aligned bytes of all SRAM copies of this tensor.
    pub fn footprint(&self, strategy: &SlicingStrategy, align: u64, double_buffer: bool) -> u64 {
        let buffers = buffer_count(self.distinct_slices(strategy), double_buffer);
        align_up(self.slice_bytes(strategy), align) * buffers
    }
}

/// Copies kept resident: double buffering only pays off when the window changes.
pub fn buffer_count(distinct_slices: u64, double_buffer: bool) -> u64 {
    if double_buffer && distinct_slices > 1 {
        2
    } else {
        1
    }
}

pub fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 128), 0);
        assert_eq!(align_up(1, 128), 128);
        assert_eq!(align_up(256, 128), 256);
        assert_eq!(align_up(257, 1), 257);
    }

    #[test]
    fn single_window_is_single_buffered() {
        assert_eq!(buffer_count(1, true), 1);
        assert_eq!(buffer_count(4, true), 2);
        assert_eq!(buffer_count(4, false), 1);
    }
}
