//! Shift augmentation (test-time time-shift averaging)

use ndarray::{Array3, ArrayView2, ArrayView4, Axis, s};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Draws circular shift offsets and undoes them after inference
#[derive(Debug, Clone)]
pub struct ShiftAugmenter {
    shifts: usize,
    max_shift: usize,
    rng: ChaCha8Rng,
}

impl ShiftAugmenter {
    /// `shifts` extra rolled copies per segment, offsets in `[1, max_shift]`
    pub fn new(shifts: usize, max_shift: usize, seed: u64) -> Self {
        Self {
            shifts,
            max_shift,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Pass-through when no shifts are requested
    pub fn is_passthrough(&self) -> bool {
        self.shifts == 0
    }

    /// Copies fed to the model per segment
    pub fn variants(&self) -> usize {
        self.shifts + 1
    }

    /// Offsets for one segment, the unshifted original first
    pub fn draw_offsets(&mut self, segment_len: usize) -> Vec<usize> {
        let bound = self.max_shift.min(segment_len.saturating_sub(1));
        let mut offsets = Vec::with_capacity(self.variants());
        offsets.push(0);
        for _ in 0..self.shifts {
            let offset = if bound == 0 {
                0
            } else {
                self.rng.random_range(1..=bound)
            };
            offsets.push(offset);
        }
        offsets
    }

    /// Stack rolled copies of `segment` (`[channels, samples]`) per offset
    pub fn expand(segment: ArrayView2<'_, f32>, offsets: &[usize]) -> Array3<f32> {
        let (channels, samples) = segment.dim();
        let mut out = Array3::<f32>::zeros((offsets.len(), channels, samples));
        for (mut variant, &offset) in out.axis_iter_mut(Axis(0)).zip(offsets) {
            let d = offset % samples.max(1);
            // rolled[i] = x[(i - d) mod S]
            variant
                .slice_mut(s![.., d..])
                .assign(&segment.slice(s![.., ..samples - d]));
            variant
                .slice_mut(s![.., ..d])
                .assign(&segment.slice(s![.., samples - d..]));
        }
        out
    }

    /// Undo the rolls on `[variants, sources, channels, samples]` and average
    pub fn collapse(predictions: ArrayView4<'_, f32>, offsets: &[usize]) -> Array3<f32> {
        let (variants, sources, channels, samples) = predictions.dim();
        debug_assert_eq!(variants, offsets.len());

        if variants == 1 && offsets[0] == 0 {
            return predictions.index_axis(Axis(0), 0).to_owned();
        }

        let mut sum = Array3::<f32>::zeros((sources, channels, samples));
        for (prediction, &offset) in predictions.axis_iter(Axis(0)).zip(offsets) {
            let d = offset % samples.max(1);
            // out[i] = y[(i + d) mod S]
            sum.slice_mut(s![.., .., ..samples - d])
                .zip_mut_with(&prediction.slice(s![.., .., d..]), |acc, &y| *acc += y);
            sum.slice_mut(s![.., .., samples - d..])
                .zip_mut_with(&prediction.slice(s![.., .., ..d]), |acc, &y| *acc += y);
        }
        sum /= variants as f32;
        sum
    }
}
