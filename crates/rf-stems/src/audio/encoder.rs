//! WAV encoding via hound

use std::path::Path;

use super::BitDepth;
use crate::error::{SeparationError, SeparationResult};
use crate::waveform::Waveform;

// ═══════════════════════════════════════════════════════════════════════════════
// WAV ENCODER
// ═══════════════════════════════════════════════════════════════════════════════

/// WAV encoder using hound
pub struct WavEncoder {
    bit_depth: BitDepth,
}

impl WavEncoder {
    pub fn new(bit_depth: BitDepth) -> Self {
        Self { bit_depth }
    }

    fn spec(&self, waveform: &Waveform) -> hound::WavSpec {
        let (bits_per_sample, sample_format) = match self.bit_depth {
            BitDepth::Int16 => (16, hound::SampleFormat::Int),
            BitDepth::Int24 => (24, hound::SampleFormat::Int),
            BitDepth::Float32 => (32, hound::SampleFormat::Float),
        };
        hound::WavSpec {
            channels: waveform.channels() as u16,
            sample_rate: waveform.sample_rate(),
            bits_per_sample,
            sample_format,
        }
    }

    /// Write `waveform` to `path`, quantizing to the configured depth
    pub fn write(&self, path: &Path, waveform: &Waveform) -> SeparationResult<()> {
        let mut writer = hound::WavWriter::create(path, self.spec(waveform)).map_err(wav_error)?;
        let samples = waveform.to_interleaved();

        match self.bit_depth {
            BitDepth::Int16 => {
                for &sample in &samples {
                    let s = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
                    writer.write_sample(s).map_err(wav_error)?;
                }
            }
            BitDepth::Int24 => {
                for &sample in &samples {
                    let s = (sample.clamp(-1.0, 1.0) * 8388607.0) as i32;
                    writer.write_sample(s).map_err(wav_error)?;
                }
            }
            BitDepth::Float32 => {
                for &sample in &samples {
                    writer.write_sample(sample).map_err(wav_error)?;
                }
            }
        }

        writer.finalize().map_err(wav_error)
    }
}

fn wav_error(e: hound::Error) -> SeparationError {
    match e {
        hound::Error::IoError(e) => SeparationError::Io(e),
        other => SeparationError::UnsupportedFormat(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioDecoder;

    #[test]
    fn test_wav_roundtrip_through_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stem.wav");

        let samples: Vec<f32> = (0..2000).map(|i| ((i as f32) * 0.01).sin() * 0.5).collect();
        let waveform = Waveform::from_interleaved(&samples, 2, 44100).unwrap();

        WavEncoder::new(BitDepth::Float32).write(&path, &waveform).unwrap();
        let decoded = AudioDecoder::decode(&path).unwrap();

        assert_eq!(decoded.channels(), 2);
        assert_eq!(decoded.sample_rate(), 44100);
        assert_eq!(decoded.len(), 1000);
        for (a, b) in decoded.to_interleaved().iter().zip(&samples) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_int16_quantization() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stem16.wav");
        let waveform = Waveform::from_interleaved(&[0.5, -0.5, 0.25], 1, 8000).unwrap();

        WavEncoder::new(BitDepth::Int16).write(&path, &waveform).unwrap();
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().bits_per_sample, 16);
        assert_eq!(reader.len(), 3);
    }
}
