//! Separated source collections

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::audio::{AudioIo, WriteOptions};
use crate::error::{SeparationError, SeparationResult};
use crate::waveform::Waveform;

/// Ordered set of separated sources from one separation call
#[derive(Debug, Clone)]
pub struct SeparatedSources {
    /// Source labels, model output order
    labels: Vec<String>,

    /// One waveform per label
    stems: Vec<Waveform>,

    /// Sample rate shared by every stem
    pub sample_rate: u32,

    /// Models that produced these stems
    pub models: Vec<String>,

    /// Processing stats
    pub stats: SeparationStats,
}

impl SeparatedSources {
    /// Empty collection
    pub fn new(sample_rate: u32, models: Vec<String>) -> Self {
        Self {
            labels: Vec::new(),
            stems: Vec::new(),
            sample_rate,
            models,
            stats: SeparationStats::default(),
        }
    }

    /// Append a stem; rate, channels and length must match existing stems
    pub fn add(&mut self, label: impl Into<String>, stem: Waveform) -> SeparationResult<()> {
        let label = label.into();
        if self.labels.contains(&label) {
            return Err(SeparationError::incompatible(format!("duplicate source '{}'", label)));
        }
        if stem.sample_rate() != self.sample_rate {
            return Err(SeparationError::incompatible(format!(
                "source '{}' at {} Hz in a {} Hz collection",
                label,
                stem.sample_rate(),
                self.sample_rate
            )));
        }
        if let Some(first) = self.stems.first() {
            if (first.channels(), first.len()) != (stem.channels(), stem.len()) {
                return Err(SeparationError::incompatible(format!(
                    "source '{}' is {}x{}, expected {}x{}",
                    label,
                    stem.channels(),
                    stem.len(),
                    first.channels(),
                    first.len()
                )));
            }
        }
        self.labels.push(label);
        self.stems.push(stem);
        Ok(())
    }

    /// Stem by label
    pub fn get(&self, label: &str) -> Option<&Waveform> {
        self.labels
            .iter()
            .position(|l| l == label)
            .map(|i| &self.stems[i])
    }

    /// Labels in order
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// `(label, stem)` pairs in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Waveform)> {
        self.labels.iter().map(String::as_str).zip(self.stems.iter())
    }

    /// Number of stems
    pub fn len(&self) -> usize {
        self.stems.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.stems.is_empty()
    }

    /// Samples per stem
    pub fn samples(&self) -> usize {
        self.stems.first().map_or(0, Waveform::len)
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.stems.first().map_or(0.0, Waveform::duration_secs)
    }

    /// Take the stems
    pub fn into_stems(self) -> Vec<(String, Waveform)> {
        self.labels.into_iter().zip(self.stems).collect()
    }

    /// Sum stems with per-label gains (missing labels default to 1.0)
    pub fn remix(&self, gains: &HashMap<String, f32>) -> Option<Waveform> {
        let first = self.stems.first()?;
        let mut mix = ndarray::Array2::<f32>::zeros(first.data().raw_dim());

        for (label, stem) in self.iter() {
            let gain = gains.get(label).copied().unwrap_or(1.0);
            mix.scaled_add(gain, stem.data());
        }

        Some(Waveform::new(mix, self.sample_rate))
    }

    /// Keep `label` and replace everything else with its `no_<label>` sum
    pub fn two_stems(&self, label: &str) -> SeparationResult<SeparatedSources> {
        let kept = self.get(label).ok_or_else(|| {
            SeparationError::config(format!(
                "source '{}' not among {:?}",
                label, self.labels
            ))
        })?;

        let gains: HashMap<String, f32> = [(label.to_string(), 0.0)].into_iter().collect();
        let rest = self
            .remix(&gains)
            .unwrap_or_else(|| Waveform::silence(kept.channels(), kept.len(), self.sample_rate));

        let mut out = SeparatedSources::new(self.sample_rate, self.models.clone());
        out.stats = self.stats.clone();
        out.add(label, kept.clone())?;
        out.add(format!("no_{}", label), rest)?;
        Ok(out)
    }

    /// Write every stem through `io`, returning the written paths
    ///
    /// File names come from `options.filename`, where `{track}`, `{stem}`
    /// and `{ext}` are substituted.
    pub fn write_all(
        &self,
        io: &dyn AudioIo,
        dir: &Path,
        track: &str,
        options: &WriteOptions,
    ) -> SeparationResult<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(self.len());
        for (label, stem) in self.iter() {
            let name = options
                .filename
                .replace("{track}", track)
                .replace("{stem}", label)
                .replace("{ext}", "wav");
            let path = dir.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            io.write(&path, stem, options)?;
            log::info!("Wrote {} ({:.1}s)", path.display(), stem.duration_secs());
            written.push(path);
        }
        Ok(written)
    }
}

/// Separation statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeparationStats {
    /// Total processing time (ms)
    pub total_time_ms: u64,

    /// Segments merged, summed over models
    pub segments_processed: usize,

    /// Forward passes issued, summed over models
    pub inference_calls: usize,

    /// Real-time factor (10.0 = 10x faster than real time)
    pub rtf: f32,
}
