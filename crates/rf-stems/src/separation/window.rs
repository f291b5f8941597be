//! Fade windows for overlap-add
//!
//! Each segment gets a trapezoid: unity in the middle, complementary ramps over
//! the overlap region. The first segment never fades in and the last never
//! fades out, so both ends of the waveform keep full weight. Every window is
//! divided by the sum of all raw windows covering the same positions, which
//! keeps the windows a partition of unity even when more than two segments
//! overlap.

use std::borrow::Cow;
use std::f32::consts::FRAC_PI_2;

use serde::{Deserialize, Serialize};

use super::segment::SegmentLayout;

/// Ramp curve used in the overlap region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FadeShape {
    /// Straight line
    #[default]
    Linear,
    /// Squared sine (constant-sum raised cosine)
    RaisedCosine,
}

impl FadeShape {
    /// Rising ramp value at step `j` of `len`
    ///
    /// Satisfies `ramp(j) + ramp(len - 1 - j) == 1`.
    pub fn ramp(&self, j: usize, len: usize) -> f32 {
        let x = (j as f32 + 0.5) / len as f32;
        match self {
            FadeShape::Linear => x,
            FadeShape::RaisedCosine => (FRAC_PI_2 * x).sin().powi(2),
        }
    }
}

/// Normalized fade windows for one segment layout
#[derive(Debug, Clone)]
pub struct FadeWindows {
    layout: SegmentLayout,
    shape: FadeShape,
    /// Window shared by every segment away from both ends
    interior: Option<(usize, Vec<f32>)>,
}

impl FadeWindows {
    pub fn new(layout: SegmentLayout, shape: FadeShape) -> Self {
        let mut windows = Self {
            layout,
            shape,
            interior: None,
        };
        if let Some(index) = windows.first_interior() {
            let window = windows.compute(index);
            windows.interior = Some((index, window));
        }
        windows
    }

    /// Layout the windows were computed for
    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    /// Window for segment `index`, zero past the end of the waveform
    pub fn window(&self, index: usize) -> Cow<'_, [f32]> {
        match &self.interior {
            Some((_, window)) if self.is_interior(index) => Cow::Borrowed(window),
            _ => Cow::Owned(self.compute(index)),
        }
    }

    /// Neighbours on each side that can reach into a segment
    fn reach(&self) -> usize {
        (self.layout.length() - 1) / self.layout.stride()
    }

    fn is_interior(&self, index: usize) -> bool {
        let reach = self.reach();
        index > reach && index + reach + 1 < self.layout.count()
    }

    fn first_interior(&self) -> Option<usize> {
        let index = self.reach() + 1;
        self.is_interior(index).then_some(index)
    }

    /// Unnormalized trapezoid of segment `index` at local position `i`
    fn raw(&self, index: usize, i: usize) -> f32 {
        let length = self.layout.length();
        let ramp = self.layout.overlap_len();
        let mut weight = 1.0f32;

        if ramp > 0 {
            if index > 0 && i < ramp {
                weight = weight.min(self.shape.ramp(i, ramp));
            }
            if index + 1 < self.layout.count() && i >= length - ramp {
                weight = weight.min(self.shape.ramp(length - 1 - i, ramp));
            }
        }

        weight
    }

    fn compute(&self, index: usize) -> Vec<f32> {
        let length = self.layout.length();
        let start = self.layout.start(index);
        let total = self.layout.total();

        (0..length)
            .map(|i| {
                let pos = start + i;
                if pos >= total {
                    return 0.0;
                }
                let own = self.raw(index, i);
                let sum: f32 = self
                    .layout
                    .covering(pos)
                    .map(|k| self.raw(k, pos - self.layout.start(k)))
                    .sum();
                if sum > 0.0 { own / sum } else { 0.0 }
            })
            .collect()
    }
}
