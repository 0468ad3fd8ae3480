//! Chunk-size search for a single MME operator.
//!
//! The solver is a small state machine over the axis list:
//!
//! ```text
//!   SingleAxis(0) -> SingleAxis(1) -> ... -> Compose(0) -> Compose(1) -> ... -> Unsliceable
//!        |                |                     |              |
//!        +----------------+---- fits ------------+--------------+---> Sliced
//! ```
//!
//! `SingleAxis(i)` slices axis `i` alone. `Compose(i)` keeps every earlier axis pinned at its
//! minimum chunk, pins axis `i` too, and if that fits grows axis `i` back to the largest fitting
//! chunk. Each fitting query is a binary search over granule multiples, so a phase costs at most
//! `axes * log2(extent)` capacity evaluations.

use log::trace;

use super::operand::align_up;
use super::strategy::SlicingStrategy;
use crate::config::SlicerConfig;
use crate::geometry::{AxisRole, MmeGeometry};
use crate::hal::{EngineClass, HardwareCaps};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolverOutcome {
    /// The operator fits without slicing.
    Fits(SlicingStrategy),
    Sliced(SlicingStrategy),
    /// No partition fits; the operator runs directly.
    Unsliceable { reason: String },
}

#[derive(Debug, Clone)]
enum SolveState {
    SingleAxis { axis: usize },
    Compose { axis: usize, pinned: SlicingStrategy },
    Done(SolverOutcome),
}

pub struct SlicingSolver<'a> {
    caps: &'a dyn HardwareCaps,
    config: &'a SlicerConfig,
    budget: u64,
}

impl<'a> SlicingSolver<'a> {
    pub fn new(caps: &'a dyn HardwareCaps, config: &'a SlicerConfig, budget: u64) -> Self {
        Self {
            caps,
            config,
            budget,
        }
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn alignment(&self) -> u64 {
        if self.config.align_to_cache_line {
            self.caps.cache_line_bytes().max(1)
        } else {
            1
        }
    }

    /// SRAM bytes taken by the anchor's own operands under `strategy`.
    pub fn capacity(&self, strategy: &SlicingStrategy) -> u64 {
        let align = self.alignment();
        strategy
            .operand_slicings()
            .iter()
            .map(|(_, slicing)| slicing.footprint(strategy, align, self.config.double_buffer))
            .sum()
    }

    /// Whether every per-slice dimension can be programmed into an MME descriptor.
    pub fn within_registers(&self, strategy: &SlicingStrategy) -> bool {
        let limit = self.caps.max_register_value(EngineClass::Mme);
        strategy.operand_slicings().iter().all(|(_, slicing)| {
            slicing
                .max_slice_dims(strategy)
                .iter()
                .all(|&dim| dim <= limit)
        })
    }

    pub fn fits(&self, strategy: &SlicingStrategy) -> bool {
        self.within_registers(strategy) && self.capacity(strategy) <= self.budget
    }

    /// Slicing step of `axis`: chunks are multiples of this value.
    pub fn granule(&self, geometry: &MmeGeometry, axis: usize) -> u64 {
        let entry = &geometry.axes[axis];
        let tile = self.caps.mme_min_tile(geometry.input_dtype());
        let granule = match entry.role {
            AxisRole::Batch | AxisRole::Spatial => 1,
            AxisRole::Wide => tile.height,
            AxisRole::Narrow => tile.width,
            AxisRole::Common if entry.driver_dim == 0 => {
                self.caps.cache_line_elements(geometry.input_dtype())
            }
            AxisRole::Common => 1,
        };
        granule.max(1)
    }

    /// Smallest chunk the axis may take given the other chunks of `strategy`.
    pub fn min_chunk(&self, strategy: &SlicingStrategy, axis: usize) -> u64 {
        let geometry = &strategy.geometry;
        let granule = self.granule(geometry, axis);
        if !geometry.axes[axis].is_common() {
            return granule;
        }
        let taps = geometry.reduced_elements()
            / geometry
                .axes
                .iter()
                .filter(|entry| entry.is_common())
                .map(|entry| entry.extent.max(1))
                .product::<u64>()
                .max(1);
        let others: u64 = geometry
            .axes
            .iter()
            .enumerate()
            .filter(|(other, entry)| *other != axis && entry.is_common())
            .map(|(other, _)| strategy.chunks[other].max(1))
            .product();
        let per_slice = (others * taps.max(1)).max(1);
        let needed = self.config.min_common_dim_for_partials.div_ceil(per_slice);
        align_up(needed.max(1), granule)
    }

    fn sliceable(&self, strategy: &SlicingStrategy, axis: usize) -> bool {
        let entry = &strategy.geometry.axes[axis];
        entry.enabled && self.min_chunk(strategy, axis) < entry.extent
    }

    /// Largest granule multiple below the extent that fits with the other chunks of `base`,
    /// starting from the axis minimum.
    fn largest_fitting(&self, base: &SlicingStrategy, axis: usize) -> Option<u64> {
        let extent = base.geometry.axes[axis].extent;
        let granule = self.granule(&base.geometry, axis);
        let low = self.min_chunk(base, axis) / granule;
        let high = (extent - 1) / granule;
        if low == 0 || low > high {
            return None;
        }
        let mut probe = base.clone();
        let mut fits_at = |steps: u64| {
            probe.chunks[axis] = steps * granule;
            self.fits(&probe)
        };
        if !fits_at(low) {
            return None;
        }
        let (mut good, mut bad) = (low, high + 1);
        while bad - good > 1 {
            let mid = good + (bad - good) / 2;
            if fits_at(mid) {
                good = mid;
            } else {
                bad = mid;
            }
        }
        Some(good * granule)
    }

    pub fn solve(&self, geometry: MmeGeometry) -> SolverOutcome {
        let base = SlicingStrategy::unsliced(geometry, self.config);
        if self.fits(&base) {
            return SolverOutcome::Fits(base);
        }
        let axes = base.geometry.axes.len();
        let mut state = SolveState::SingleAxis { axis: 0 };
        loop {
            state = match state {
                SolveState::SingleAxis { axis } if axis >= axes => SolveState::Compose {
                    axis: 0,
                    pinned: base.clone(),
                },
                SolveState::SingleAxis { axis } => {
                    let next = SolveState::SingleAxis { axis: axis + 1 };
                    if !self.sliceable(&base, axis) {
                        next
                    } else {
                        match self.largest_fitting(&base, axis) {
                            Some(chunk) => {
                                trace!(
                                    "node {}: axis {} alone fits at chunk {chunk}",
                                    base.geometry.node.0,
                                    base.geometry.axes[axis].label
                                );
                                let mut sliced = base.clone();
                                sliced.chunks[axis] = chunk;
                                SolveState::Done(SolverOutcome::Sliced(sliced))
                            }
                            None => next,
                        }
                    }
                }
                SolveState::Compose { axis, .. } if axis >= axes => {
                    SolveState::Done(SolverOutcome::Unsliceable {
                        reason: format!(
                            "no partition fits {} bytes (unsliced needs {})",
                            self.budget,
                            self.capacity(&base)
                        ),
                    })
                }
                SolveState::Compose { axis, mut pinned } => {
                    if !self.sliceable(&pinned, axis) {
                        SolveState::Compose {
                            axis: axis + 1,
                            pinned,
                        }
                    } else {
                        let minimum = self.min_chunk(&pinned, axis);
                        pinned.chunks[axis] = minimum;
                        trace!(
                            "node {}: pinning axis {} at {minimum}",
                            pinned.geometry.node.0,
                            pinned.geometry.axes[axis].label
                        );
                        if self.fits(&pinned) {
                            let chunk = self.largest_fitting(&pinned, axis).unwrap_or(minimum);
                            pinned.chunks[axis] = chunk;
                            SolveState::Done(SolverOutcome::Sliced(pinned))
                        } else {
                            SolveState::Compose {
                                axis: axis + 1,
                                pinned,
                            }
                        }
                    }
                }
                SolveState::Done(outcome) => return outcome,
            };
        }
    }
}
