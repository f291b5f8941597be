//! Waveform container for separation
//!
//! Audio is stored channels-first (`[channels, samples]`), which is the layout
//! the models consume and the layout overlap-add accumulates into.

use ndarray::{Array2, ArrayView2, Axis};

use crate::error::{SeparationError, SeparationResult};

/// Multi-channel audio with a fixed sample rate
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    /// Samples, `[channels, samples]`
    data: Array2<f32>,
    /// Sample rate in Hz
    sample_rate: u32,
}

impl Waveform {
    /// Wrap channels-first samples
    pub fn new(data: Array2<f32>, sample_rate: u32) -> Self {
        Self { data, sample_rate }
    }

    /// Digital silence
    pub fn silence(channels: usize, samples: usize, sample_rate: u32) -> Self {
        Self::new(Array2::zeros((channels, samples)), sample_rate)
    }

    /// Build from interleaved samples (`L R L R ...`)
    pub fn from_interleaved(
        samples: &[f32],
        channels: usize,
        sample_rate: u32,
    ) -> SeparationResult<Self> {
        if channels == 0 {
            return Err(SeparationError::config("waveform needs at least one channel"));
        }
        if samples.len() % channels != 0 {
            return Err(SeparationError::config(format!(
                "{} interleaved samples do not divide into {} channels",
                samples.len(),
                channels
            )));
        }

        let frames = samples.len() / channels;
        let mut data = Array2::<f32>::zeros((channels, frames));
        for (i, frame) in samples.chunks_exact(channels).enumerate() {
            for (ch, &sample) in frame.iter().enumerate() {
                data[[ch, i]] = sample;
            }
        }

        Ok(Self::new(data, sample_rate))
    }

    /// Interleave channels (`L R L R ...`)
    pub fn to_interleaved(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.data.len());
        for frame in self.data.axis_iter(Axis(1)) {
            out.extend(frame.iter().copied());
        }
        out
    }

    /// Number of channels
    pub fn channels(&self) -> usize {
        self.data.nrows()
    }

    /// Number of samples per channel
    pub fn len(&self) -> usize {
        self.data.ncols()
    }

    /// True when there are no samples
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample rate in Hz
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Duration in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.len() as f64 / self.sample_rate as f64
    }

    /// Borrow samples
    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.data.view()
    }

    /// Borrow the owned array
    pub fn data(&self) -> &Array2<f32> {
        &self.data
    }

    /// Take the samples
    pub fn into_data(self) -> Array2<f32> {
        self.data
    }

    /// Single channel
    pub fn channel(&self, index: usize) -> Option<Vec<f32>> {
        (index < self.channels()).then(|| self.data.row(index).to_vec())
    }

    /// Mono mixdown (average of channels)
    pub fn to_mono(&self) -> Waveform {
        let mono = self
            .data
            .mean_axis(Axis(0))
            .unwrap_or_else(|| ndarray::Array1::zeros(self.len()));
        Waveform::new(mono.insert_axis(Axis(0)), self.sample_rate)
    }

    /// Adapt channel count
    ///
    /// Mono is duplicated to every channel, downmixing to mono averages, and
    /// any other reduction keeps the leading channels. Expanding a multi-channel
    /// signal is not defined.
    pub fn with_channels(&self, channels: usize) -> SeparationResult<Waveform> {
        let current = self.channels();
        if channels == current {
            return Ok(self.clone());
        }
        if channels == 0 {
            return Err(SeparationError::config("cannot convert to zero channels"));
        }

        if current == 1 {
            let row = self.data.row(0);
            let mut data = Array2::<f32>::zeros((channels, self.len()));
            for mut out in data.axis_iter_mut(Axis(0)) {
                out.assign(&row);
            }
            return Ok(Waveform::new(data, self.sample_rate));
        }

        if channels == 1 {
            return Ok(self.to_mono());
        }

        if channels < current {
            let data = self.data.slice(ndarray::s![..channels, ..]).to_owned();
            return Ok(Waveform::new(data, self.sample_rate));
        }

        Err(SeparationError::incompatible(format!(
            "cannot expand {} channels to {}",
            current, channels
        )))
    }

    /// Peak absolute sample value
    pub fn peak(&self) -> f32 {
        self.data.iter().map(|s| s.abs()).fold(0.0f32, f32::max)
    }

    /// Keep exactly `samples` per channel, zero-padding or truncating
    pub fn fit_length(&self, samples: usize) -> Waveform {
        if samples == self.len() {
            return self.clone();
        }
        let keep = samples.min(self.len());
        let mut data = Array2::<f32>::zeros((self.channels(), samples));
        data.slice_mut(ndarray::s![.., ..keep])
            .assign(&self.data.slice(ndarray::s![.., ..keep]));
        Waveform::new(data, self.sample_rate)
    }
}
