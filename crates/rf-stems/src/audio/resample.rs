//! Sample-rate conversion

use rubato::{FftFixedIn, Resampler as _};

use crate::error::{SeparationError, SeparationResult};
use crate::waveform::Waveform;

/// Converts waveforms between sample rates
pub trait Resampler: Send + Sync {
    /// Resample to `target_rate`; output length is `ceil(len * target / source)`
    fn resample(&self, waveform: &Waveform, target_rate: u32) -> SeparationResult<Waveform>;
}

/// FFT-based synchronous resampler (rubato)
#[derive(Debug, Clone, Copy)]
pub struct RubatoResampler {
    chunk_size: usize,
    sub_chunks: usize,
}

impl Default for RubatoResampler {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            sub_chunks: 2,
        }
    }
}

impl RubatoResampler {
    pub fn new(chunk_size: usize, sub_chunks: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            sub_chunks: sub_chunks.max(1),
        }
    }
}

impl Resampler for RubatoResampler {
    fn resample(&self, waveform: &Waveform, target_rate: u32) -> SeparationResult<Waveform> {
        let source_rate = waveform.sample_rate();
        if source_rate == target_rate {
            return Ok(waveform.clone());
        }
        if source_rate == 0 || target_rate == 0 {
            return Err(SeparationError::Resample(format!(
                "cannot convert {} Hz to {} Hz",
                source_rate, target_rate
            )));
        }

        let channels = waveform.channels();
        let len = waveform.len();
        let expected = (len as u64 * target_rate as u64).div_ceil(source_rate as u64) as usize;

        let mut resampler = FftFixedIn::<f32>::new(
            source_rate as usize,
            target_rate as usize,
            self.chunk_size,
            self.sub_chunks,
            channels,
        )
        .map_err(|e| SeparationError::Resample(e.to_string()))?;

        let input: Vec<Vec<f32>> = (0..channels)
            .map(|ch| waveform.data().row(ch).to_vec())
            .collect();
        let delay = resampler.output_delay();
        let wanted = expected + delay;
        let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(wanted); channels];

        let append = |output: &mut Vec<Vec<f32>>, frames: Vec<Vec<f32>>| {
            for (out, chunk) in output.iter_mut().zip(frames) {
                out.extend_from_slice(&chunk);
            }
        };

        let mut pos = 0;
        while pos + resampler.input_frames_next() <= len {
            let next = resampler.input_frames_next();
            let chunk: Vec<&[f32]> = input.iter().map(|c| &c[pos..pos + next]).collect();
            let frames = resampler
                .process(&chunk, None)
                .map_err(|e| SeparationError::Resample(e.to_string()))?;
            append(&mut output, frames);
            pos += next;
        }

        if pos < len {
            let chunk: Vec<&[f32]> = input.iter().map(|c| &c[pos..]).collect();
            let frames = resampler
                .process_partial(Some(chunk.as_slice()), None)
                .map_err(|e| SeparationError::Resample(e.to_string()))?;
            append(&mut output, frames);
        }

        // Flush the filter delay
        while output.first().map_or(0, Vec::len) < wanted {
            let frames = resampler
                .process_partial::<&[f32]>(None, None)
                .map_err(|e| SeparationError::Resample(e.to_string()))?;
            if frames.first().is_none_or(Vec::is_empty) {
                break;
            }
            append(&mut output, frames);
        }

        let mut data = ndarray::Array2::<f32>::zeros((channels, expected));
        for (ch, out) in output.iter().enumerate() {
            let available = out.len().saturating_sub(delay).min(expected);
            for i in 0..available {
                data[[ch, i]] = out[delay + i];
            }
        }

        log::debug!(
            "Resampled {} samples at {} Hz to {} at {} Hz",
            len,
            source_rate,
            expected,
            target_rate
        );

        Ok(Waveform::new(data, target_rate))
    }
}
