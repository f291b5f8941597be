//! Segmentation of long waveforms into model-sized chunks

use std::ops::Range;

use ndarray::{Array2, ArrayView2, s};

use crate::error::{SeparationError, SeparationResult};

/// Placement of overlapping segments over a waveform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    total: usize,
    length: usize,
    stride: usize,
    count: usize,
}

impl SegmentLayout {
    /// Lay out segments of `length` samples over `total` samples
    ///
    /// The stride is `length - round(length * overlap)`, never below one
    /// sample. Inputs no longer than one segment get exactly one segment.
    pub fn new(total: usize, length: usize, overlap: f32) -> SeparationResult<Self> {
        if length == 0 {
            return Err(SeparationError::config("segment length must be positive"));
        }
        if !overlap.is_finite() || !(0.0..1.0).contains(&overlap) {
            return Err(SeparationError::config(format!(
                "overlap {} outside [0, 1)",
                overlap
            )));
        }

        let overlap_len = (length as f64 * overlap as f64).round() as usize;
        let stride = length.saturating_sub(overlap_len).max(1);
        let count = if total <= length {
            1
        } else {
            1 + (total - length).div_ceil(stride)
        };

        Ok(Self {
            total,
            length,
            stride,
            count,
        })
    }

    /// Waveform length covered
    pub fn total(&self) -> usize {
        self.total
    }

    /// Samples per segment
    pub fn length(&self) -> usize {
        self.length
    }

    /// Distance between segment starts
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Samples shared by consecutive segments
    pub fn overlap_len(&self) -> usize {
        self.length - self.stride
    }

    /// Number of segments
    pub fn count(&self) -> usize {
        self.count
    }

    /// Absolute start of segment `index`
    pub fn start(&self, index: usize) -> usize {
        index * self.stride
    }

    /// Unpadded samples in segment `index`
    pub fn valid_len(&self, index: usize) -> usize {
        self.length.min(self.total.saturating_sub(self.start(index)))
    }

    /// Indices of segments containing absolute position `pos`
    pub fn covering(&self, pos: usize) -> Range<usize> {
        let first = if pos + 1 > self.length {
            (pos + 1 - self.length).div_ceil(self.stride)
        } else {
            0
        };
        let last = (pos / self.stride).min(self.count - 1);
        first..last + 1
    }
}

/// One model-sized slice of the input
#[derive(Debug, Clone)]
pub struct Segment {
    /// Position in the segment sequence
    pub index: usize,
    /// Absolute start offset in the waveform
    pub start: usize,
    /// Samples taken from the waveform, the rest is zero padding
    pub valid: usize,
    /// Padded samples, `[channels, length]`
    pub data: Array2<f32>,
}

/// Lazily slices a waveform according to a [`SegmentLayout`]
#[derive(Debug, Clone, Copy)]
pub struct Segmenter<'a> {
    waveform: ArrayView2<'a, f32>,
    layout: SegmentLayout,
}

impl<'a> Segmenter<'a> {
    /// Segment a `[channels, samples]` waveform
    pub fn new(waveform: ArrayView2<'a, f32>, length: usize, overlap: f32) -> SeparationResult<Self> {
        let layout = SegmentLayout::new(waveform.ncols(), length, overlap)?;
        Ok(Self { waveform, layout })
    }

    /// Layout in use
    pub fn layout(&self) -> SegmentLayout {
        self.layout
    }

    /// Fresh pass over the segments
    pub fn iter(&self) -> Segments<'a> {
        Segments {
            waveform: self.waveform,
            layout: self.layout,
            next: 0,
        }
    }

    /// Copy out segment `index`
    pub fn segment(&self, index: usize) -> Segment {
        extract(self.waveform, &self.layout, index)
    }
}

impl<'a> IntoIterator for &Segmenter<'a> {
    type Item = Segment;
    type IntoIter = Segments<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over segments, one allocation per yielded segment
#[derive(Debug, Clone)]
pub struct Segments<'a> {
    waveform: ArrayView2<'a, f32>,
    layout: SegmentLayout,
    next: usize,
}

impl Iterator for Segments<'_> {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if self.next >= self.layout.count {
            return None;
        }
        let segment = extract(self.waveform, &self.layout, self.next);
        self.next += 1;
        Some(segment)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.layout.count - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Segments<'_> {}

fn extract(waveform: ArrayView2<'_, f32>, layout: &SegmentLayout, index: usize) -> Segment {
    let start = layout.start(index);
    let valid = layout.valid_len(index);
    let mut data = Array2::<f32>::zeros((waveform.nrows(), layout.length));
    if valid > 0 {
        data.slice_mut(s![.., ..valid])
            .assign(&waveform.slice(s![.., start..start + valid]));
    }
    Segment {
        index,
        start,
        valid,
        data,
    }
}
