//! First-fit interval packing of SRAM buffers.
//!
//! Every request is a `(tensor, copy)` buffer with a byte size and a live range over the
//! bundle's op indices. Requests are placed in order of live-range start at the lowest
//! aligned offset that does not overlap any already placed buffer whose live range
//! intersects.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::TensorId;
use crate::slicing::align_up;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveRange {
    pub start: usize,
    /// Inclusive.
    pub end: usize,
}

impl LiveRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn overlaps(&self, other: &LiveRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn extend(&mut self, index: usize) {
        self.start = self.start.min(index);
        self.end = self.end.max(index);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferKey {
    pub tensor: TensorId,
    pub copy: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRequest {
    pub key: BufferKey,
    pub bytes: u64,
    pub live: LiveRange,
}

/// Offset of a request relative to the start of SRAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub key: BufferKey,
    pub offset: u64,
    pub bytes: u64,
    pub live: LiveRange,
}

impl Placement {
    pub fn end(&self) -> u64 {
        self.offset + self.bytes
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("packing needs {required} bytes of SRAM but the budget is {budget}")]
pub struct PackingError {
    pub required: u64,
    pub budget: u64,
}

/// Packs `requests` into `budget` bytes. Placements are returned in request order.
pub fn pack(
    requests: &[AllocationRequest],
    align: u64,
    budget: u64,
) -> Result<Vec<Placement>, PackingError> {
    let mut order: Vec<usize> = (0..requests.len()).collect();
    order.sort_by_key(|&idx| (requests[idx].live.start, requests[idx].key));

    let mut placed: Vec<Placement> = Vec::with_capacity(requests.len());
    let mut result: Vec<Option<Placement>> = vec![None; requests.len()];
    for idx in order {
        let request = requests[idx];
        let mut conflicts: Vec<(u64, u64)> = placed
            .iter()
            .filter(|p| p.live.overlaps(&request.live))
            .map(|p| (p.offset, p.end()))
            .collect();
        conflicts.sort_unstable();
        let mut offset = 0;
        for (start, end) in conflicts {
            if offset + request.bytes <= start {
                break;
            }
            offset = offset.max(align_up(end, align));
        }
        let placement = Placement {
            key: request.key,
            offset,
            bytes: request.bytes,
            live: request.live,
        };
        placed.push(placement);
        result[idx] = Some(placement);
    }

    let required = peak_bytes(&placed);
    if required > budget {
        return Err(PackingError { required, budget });
    }
    Ok(result.into_iter().flatten().collect())
}

/// Highest byte touched by any placement.
pub fn peak_bytes(placements: &[Placement]) -> u64 {
    placements.iter().map(Placement::end).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(tensor: u32, bytes: u64, start: usize, end: usize) -> AllocationRequest {
        AllocationRequest {
            key: BufferKey {
                tensor: TensorId(tensor),
                copy: 0,
            },
            bytes,
            live: LiveRange::new(start, end),
        }
    }

    #[test]
    fn disjoint_lifetimes_share_offsets() {
        let placements = pack(&[request(0, 256, 0, 3), request(1, 256, 4, 7)], 128, 256)
            .expect("fits");
        assert_eq!(placements[0].offset, 0);
        assert_eq!(placements[1].offset, 0);
    }

    #[test]
    fn overlapping_lifetimes_are_stacked_and_aligned() {
        let placements = pack(&[request(0, 100, 0, 5), request(1, 64, 2, 3)], 128, 1024)
            .expect("fits");
        assert_eq!(placements[0].offset, 0);
        assert_eq!(placements[1].offset, 128);
    }

    #[test]
    fn first_fit_uses_gaps() {
        let placements = pack(
            &[
                request(0, 128, 0, 9),
                request(1, 128, 0, 2),
                request(2, 128, 0, 9),
                request(3, 128, 4, 6),
            ],
            128,
            1024,
        )
        .expect("fits");
        assert_eq!(placements[3].offset, 128);
    }

    #[test]
    fn over_budget_reports_required_bytes() {
        let error = pack(&[request(0, 512, 0, 1), request(1, 512, 1, 2)], 128, 768)
            .expect_err("does not fit");
        assert_eq!(error.required, 1024);
    }
}
