//! Dependency edges between emitted ops.
//!
//! SRAM is tracked by byte range so buffers reused across bundles still order correctly:
//! a read waits for the last overlapping write; a write waits for every overlapping read and
//! write. HBM tensors are written once, either whole (`node`, `concat`) or window by window
//! (spills, fused TPC writes, casts); readers wait for all of them.

use std::collections::{BTreeMap, BTreeSet};

use super::{Location, OpKind, Region, SliceRef};
use crate::graph::{Graph, TensorId};

#[derive(Debug, Clone)]
struct SramSegment {
    start: u64,
    end: u64,
    writer: Option<usize>,
    readers: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
struct HbmState {
    whole: Option<usize>,
    windows: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ScratchKey {
    tensor: TensorId,
    region: Vec<(u64, u64)>,
    partial: u32,
}

#[derive(Debug, Default)]
pub struct DepTracker {
    sram: Vec<SramSegment>,
    hbm: BTreeMap<TensorId, HbmState>,
    scratch: BTreeMap<ScratchKey, usize>,
}

fn scratch_key(slice: &SliceRef, partial: u32) -> ScratchKey {
    ScratchKey {
        tensor: slice.tensor,
        region: slice.region.iter().map(|r: &Region| (r.start, r.len)).collect(),
        partial,
    }
}

impl DepTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records op `index` and returns the earlier ops it depends on, ascending.
    pub fn record(&mut self, index: usize, op: &OpKind, graph: &Graph) -> Vec<usize> {
        let mut deps = BTreeSet::new();
        match op {
            OpKind::Node { node } => {
                let entry = graph.node(*node);
                for &input in &entry.inputs {
                    self.read_hbm(input, &mut deps);
                }
                for &output in &entry.outputs {
                    let state = self.hbm.entry(output).or_default();
                    state.whole = Some(index);
                    state.windows.clear();
                }
            }
            OpKind::Concat { tensor, .. } => {
                self.read_hbm(*tensor, &mut deps);
                let state = self.hbm.entry(*tensor).or_default();
                state.whole = Some(index);
                state.windows.clear();
            }
            _ => {
                let (reads, writes) = op.accesses();
                for slice in &reads {
                    self.read(slice, &mut deps);
                }
                for slice in &writes {
                    self.write(index, slice, &mut deps);
                }
                for slice in reads {
                    if let Location::Sram { address, .. } = slice.location {
                        self.note_sram_reader(index, address, address + slice.bytes());
                    }
                }
            }
        }
        deps.remove(&index);
        deps.into_iter().collect()
    }

    fn read_hbm(&self, tensor: TensorId, deps: &mut BTreeSet<usize>) {
        if let Some(state) = self.hbm.get(&tensor) {
            deps.extend(state.whole);
            deps.extend(state.windows.iter().copied());
        }
    }

    fn read(&self, slice: &SliceRef, deps: &mut BTreeSet<usize>) {
        match slice.location {
            Location::Hbm => self.read_hbm(slice.tensor, deps),
            Location::Sram { address, .. } => {
                let end = address + slice.bytes();
                for segment in self.overlapping(address, end) {
                    deps.extend(segment.writer);
                }
            }
            Location::Scratch { partial } => {
                deps.extend(self.scratch.get(&scratch_key(slice, partial)).copied());
            }
        }
    }

    fn write(&mut self, index: usize, slice: &SliceRef, deps: &mut BTreeSet<usize>) {
        match slice.location {
            Location::Hbm => {
                let state = self.hbm.entry(slice.tensor).or_default();
                deps.extend(state.whole);
                state.windows.push(index);
            }
            Location::Sram { address, .. } => {
                let end = address + slice.bytes();
                for segment in self.overlapping(address, end) {
                    deps.extend(segment.writer);
                    deps.extend(segment.readers.iter().copied());
                }
                // Segments fully rewritten carry no further hazards of their own.
                self.sram
                    .retain(|s| !(s.start >= address && s.end <= end && s.end > s.start));
                self.sram.push(SramSegment {
                    start: address,
                    end,
                    writer: Some(index),
                    readers: Vec::new(),
                });
            }
            Location::Scratch { partial } => {
                self.scratch.insert(scratch_key(slice, partial), index);
            }
        }
    }

    fn note_sram_reader(&mut self, index: usize, start: u64, end: u64) {
        if let Some(segment) = self
            .sram
            .iter_mut()
            .rev()
            .find(|s| s.start == start && s.end == end)
        {
            segment.readers.push(index);
            return;
        }
        self.sram.push(SramSegment {
            start,
            end,
            writer: None,
            readers: vec![index],
        });
    }

    fn overlapping(&self, start: u64, end: u64) -> impl Iterator<Item = &SramSegment> {
        self.sram
            .iter()
            .filter(move |s| s.start < end && start < s.end)
    }
}
