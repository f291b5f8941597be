//! Audio decoding via symphonia

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::{SeparationError, SeparationResult};
use crate::waveform::Waveform;

// ═══════════════════════════════════════════════════════════════════════════════
// DECODER
// ═══════════════════════════════════════════════════════════════════════════════

/// Universal audio decoder using symphonia
pub struct AudioDecoder;

impl AudioDecoder {
    /// Decode the first audio track of a file
    pub fn decode(path: &Path) -> SeparationResult<Waveform> {
        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| unsupported(path, e))?;

        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| {
                SeparationError::UnsupportedFormat(format!("{}: no audio track", path.display()))
            })?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();
        let sample_rate = codec_params.sample_rate.ok_or_else(|| {
            SeparationError::UnsupportedFormat(format!("{}: unknown sample rate", path.display()))
        })?;
        let mut channels = codec_params.channels.map(|c| c.count()).unwrap_or(0);

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| unsupported(path, e))?;

        let mut interleaved: Vec<f32> = Vec::new();
        let mut buffer: Option<SampleBuffer<f32>> = None;

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(SymphoniaError::IoError(e)) => return Err(SeparationError::Io(e)),
                Err(e) => return Err(unsupported(path, e)),
            };

            if packet.track_id() != track_id {
                continue;
            }

            match decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    channels = spec.channels.count();

                    let needed = decoded.capacity();
                    if buffer
                        .as_ref()
                        .is_none_or(|buf| buf.capacity() < needed * channels)
                    {
                        buffer = Some(SampleBuffer::new(needed as u64, spec));
                    }
                    if let Some(buf) = buffer.as_mut() {
                        buf.copy_interleaved_ref(decoded);
                        interleaved.extend_from_slice(buf.samples());
                    }
                }
                // Corrupt packets are skipped
                Err(SymphoniaError::DecodeError(e)) => {
                    log::debug!("{}: skipping packet: {}", path.display(), e);
                    continue;
                }
                Err(e) => return Err(unsupported(path, e)),
            }
        }

        if channels == 0 {
            return Err(SeparationError::UnsupportedFormat(format!(
                "{}: unknown channel layout",
                path.display()
            )));
        }

        let waveform = Waveform::from_interleaved(&interleaved, channels, sample_rate)?;
        log::info!(
            "Decoded {}: {} ch, {} Hz, {:.1}s",
            path.display(),
            waveform.channels(),
            sample_rate,
            waveform.duration_secs()
        );
        Ok(waveform)
    }
}

fn unsupported(path: &Path, e: SymphoniaError) -> SeparationError {
    SeparationError::UnsupportedFormat(format!("{}: {}", path.display(), e))
}
