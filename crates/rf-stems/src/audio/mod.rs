//! Audio file I/O and sample-rate conversion
//!
//! Decoding goes through symphonia (WAV, AIFF, FLAC, MP3, OGG, AAC), stems are
//! written as WAV with hound, and rate conversion uses rubato.

mod decoder;
mod encoder;
mod resample;

pub use decoder::AudioDecoder;
pub use encoder::WavEncoder;
pub use resample::{Resampler, RubatoResampler};

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SeparationResult;
use crate::waveform::Waveform;

/// Reads and writes waveforms
pub trait AudioIo: Send + Sync {
    /// Decode a file
    fn read(&self, path: &Path) -> SeparationResult<Waveform>;

    /// Encode a waveform to a file
    fn write(&self, path: &Path, waveform: &Waveform, options: &WriteOptions) -> SeparationResult<()>;
}

/// Overload handling before quantization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipMode {
    /// Scale the whole stem down when it peaks above full scale
    #[default]
    Rescale,
    /// Hard clamp to just below full scale
    Clamp,
    /// Write samples as they are
    None,
}

impl ClipMode {
    /// Apply to a waveform, returning a new one
    pub fn apply(&self, waveform: &Waveform) -> Waveform {
        match self {
            ClipMode::None => waveform.clone(),
            ClipMode::Clamp => Waveform::new(
                waveform.data().mapv(|s| s.clamp(-0.99, 0.99)),
                waveform.sample_rate(),
            ),
            ClipMode::Rescale => {
                let scale = (1.01 * waveform.peak()).max(1.0);
                if scale == 1.0 {
                    return waveform.clone();
                }
                Waveform::new(waveform.data().mapv(|s| s / scale), waveform.sample_rate())
            }
        }
    }
}

/// Output sample format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitDepth {
    #[default]
    Int16,
    Int24,
    Float32,
}

/// How stems are written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    /// Sample format
    pub bit_depth: BitDepth,

    /// Overload handling
    pub clip: ClipMode,

    /// File name template relative to the output directory
    pub filename: String,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            bit_depth: BitDepth::Int16,
            clip: ClipMode::Rescale,
            filename: "{track}/{stem}.{ext}".into(),
        }
    }
}

/// Symphonia decoding, hound WAV encoding
#[derive(Debug, Clone, Copy, Default)]
pub struct FileAudioIo;

impl AudioIo for FileAudioIo {
    fn read(&self, path: &Path) -> SeparationResult<Waveform> {
        AudioDecoder::decode(path)
    }

    fn write(&self, path: &Path, waveform: &Waveform, options: &WriteOptions) -> SeparationResult<()> {
        let clipped = options.clip.apply(waveform);
        WavEncoder::new(options.bit_depth).write(path, &clipped)
    }
}
