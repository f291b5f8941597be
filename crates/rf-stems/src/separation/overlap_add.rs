//! Windowed overlap-add reconstruction

use ndarray::{Array1, Array3, ArrayView1, ArrayView3, Axis, Zip, s};

use crate::error::{SeparationError, SeparationResult};

/// Accumulates windowed segment predictions into full-length sources
///
/// Owns `sum[sources, channels, total]` and `weight[total]`. Predictions must
/// be merged in segment order for bit-identical results across runs.
#[derive(Debug)]
pub struct OverlapAdd {
    sum: Array3<f32>,
    weight: Array1<f32>,
    merged: usize,
}

impl OverlapAdd {
    pub fn new(sources: usize, channels: usize, total: usize) -> Self {
        Self {
            sum: Array3::zeros((sources, channels, total)),
            weight: Array1::zeros(total),
            merged: 0,
        }
    }

    /// Output length
    pub fn total(&self) -> usize {
        self.weight.len()
    }

    /// Segments merged so far
    pub fn merged(&self) -> usize {
        self.merged
    }

    /// Add `prediction` (`[sources, channels, segment]`) weighted by `window`
    /// at absolute offset `start`; samples past the end are dropped
    pub fn add(
        &mut self,
        start: usize,
        prediction: ArrayView3<'_, f32>,
        window: &[f32],
    ) -> SeparationResult<()> {
        let (sources, channels, segment) = prediction.dim();
        if (sources, channels) != (self.sum.dim().0, self.sum.dim().1) || window.len() != segment {
            return Err(SeparationError::InvalidOutputShape {
                expected: format!(
                    "({}, {}, {})",
                    self.sum.dim().0,
                    self.sum.dim().1,
                    window.len()
                ),
                got: format!("{:?}", prediction.dim()),
            });
        }

        let total = self.total();
        if start >= total {
            return Ok(());
        }
        let valid = segment.min(total - start);
        let window = ArrayView1::from(&window[..valid]);

        let mut target = self.sum.slice_mut(s![.., .., start..start + valid]);
        let source = prediction.slice(s![.., .., ..valid]);
        for (mut out_src, in_src) in target.outer_iter_mut().zip(source.outer_iter()) {
            for (mut out_ch, in_ch) in out_src.outer_iter_mut().zip(in_src.outer_iter()) {
                Zip::from(&mut out_ch)
                    .and(&in_ch)
                    .and(&window)
                    .for_each(|acc, &x, &w| *acc += x * w);
            }
        }

        self.weight
            .slice_mut(s![start..start + valid])
            .zip_mut_with(&window, |acc, &w| *acc += w);
        self.merged += 1;
        Ok(())
    }

    /// Divide the running sum by the accumulated weight
    pub fn finish(self) -> SeparationResult<Array3<f32>> {
        let Self {
            mut sum, weight, ..
        } = self;

        if let Some(pos) = weight.iter().position(|&w| w <= 0.0) {
            return Err(SeparationError::InferenceFailed {
                reason: format!("sample {} received no segment weight", pos),
            });
        }

        for mut source in sum.axis_iter_mut(Axis(0)) {
            for mut channel in source.axis_iter_mut(Axis(0)) {
                channel.zip_mut_with(&weight, |s, &w| *s /= w);
            }
        }

        Ok(sum)
    }
}
