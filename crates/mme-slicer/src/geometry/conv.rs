//! Per-axis convolution size arithmetic.
//!
//! All relations are the standard ones:
//!
//! ```text
//! out = floor((in + pad_before + pad_after - dilation * (kernel - 1) - 1) / stride) + 1
//! ```
//!
//! Slices are described in their own coordinates: an output slice `[o, o + n)` maps to an
//! [`AxisWindow`] of the opposite tensor together with the padding that slice sees. Edge slices
//! inherit part of the declared padding; interior slices see none.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvAxis {
    pub kernel: u64,
    pub stride: u64,
    pub dilation: u64,
    pub pad_before: u64,
    pub pad_after: u64,
}

/// Window of one tensor axis needed by a slice, with the padding the slice sees.
///
/// `pad_after` can be negative for transposed windows: trailing outputs of the slice then
/// receive no contribution at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AxisWindow {
    pub start: u64,
    pub len: u64,
    pub pad_before: i64,
    pub pad_after: i64,
}

impl AxisWindow {
    pub fn plain(start: u64, len: u64) -> Self {
        Self {
            start,
            len,
            pad_before: 0,
            pad_after: 0,
        }
    }

    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

impl ConvAxis {
    /// Extent of the dilated kernel.
    pub fn effective_kernel(&self) -> u64 {
        (self.kernel - 1) * self.dilation + 1
    }

    pub fn output_size(&self, input: u64) -> u64 {
        let padded = input + self.pad_before + self.pad_after;
        let effective = self.effective_kernel();
        if padded < effective {
            return 0;
        }
        (padded - effective) / self.stride + 1
    }

    /// Same padding: output is `ceil(input / stride)`, the larger half of the padding goes after.
    pub fn with_same_padding(self, input: u64) -> Self {
        let output = input.div_ceil(self.stride);
        let needed = output.saturating_sub(1) * self.stride + self.effective_kernel();
        let total = needed.saturating_sub(input);
        let before = total / 2;
        Self {
            pad_before: before,
            pad_after: total - before,
            ..self
        }
    }

    /// Spatial slicing keeps every slice's padding within the dilated kernel.
    pub fn spatially_sliceable(&self) -> bool {
        let span = self.effective_kernel() - 1;
        self.pad_before <= span && self.pad_after <= span
    }

    /// Input window read by output positions `[out_start, out_start + out_len)`.
    pub fn forward_window(&self, out_start: u64, out_len: u64, input: u64) -> AxisWindow {
        if out_len == 0 {
            return AxisWindow::plain(out_start.saturating_mul(self.stride).min(input), 0);
        }
        let stride = self.stride as i64;
        let first = out_start as i64 * stride - self.pad_before as i64;
        let last_end = (out_start + out_len - 1) as i64 * stride - self.pad_before as i64
            + self.effective_kernel() as i64;
        let start = first.clamp(0, input as i64);
        let end = last_end.clamp(start, input as i64);
        AxisWindow {
            start: start as u64,
            len: (end - start) as u64,
            pad_before: start - first,
            pad_after: last_end - end,
        }
    }

    /// Window of the gradient `dy` read when producing input-gradient positions
    /// `[x_start, x_start + x_len)` of a transposed convolution over `dy_extent` rows.
    pub fn transposed_window(&self, x_start: u64, x_len: u64, dy_extent: u64) -> AxisWindow {
        let stride = self.stride as i64;
        let span = self.effective_kernel() as i64 - 1;
        let pad = self.pad_before as i64;
        let x_start = x_start as i64;
        let first = div_ceil_i64(x_start + pad - span, stride).max(0);
        let last = if x_len == 0 {
            first - 1
        } else {
            div_floor_i64(x_start + x_len as i64 - 1 + pad, stride).min(dy_extent as i64 - 1)
        };
        let first = first.min(dy_extent as i64);
        let pad_before = pad + x_start - first * stride;
        if last < first {
            return AxisWindow {
                start: first as u64,
                len: 0,
                pad_before,
                pad_after: 0,
            };
        }
        let len = last - first + 1;
        AxisWindow {
            start: first as u64,
            len: len as u64,
            pad_before,
            pad_after: (len - 1) * stride + span + 1 - pad_before - x_len as i64,
        }
    }
}

fn div_floor_i64(value: i64, divisor: i64) -> i64 {
    value.div_euclid(divisor)
}

fn div_ceil_i64(value: i64, divisor: i64) -> i64 {
    -((-value).div_euclid(divisor))
}
