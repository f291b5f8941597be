//! Separation configuration

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::cancel::CancellationToken;
use super::ensemble::EnsembleWeights;
use super::window::FadeShape;
use crate::error::{SeparationError, SeparationResult};
use crate::inference::DevicePreference;

/// What to do when the input does not match a model's rate or channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchPolicy {
    /// Reject with an incompatible-model error
    Fail,
    /// Resample and adapt channels per model, convert outputs back
    #[default]
    Convert,
}

/// Progress of one separation call
#[derive(Debug, Clone, PartialEq)]
pub struct SeparationProgress {
    /// Index of the model in the expanded model list
    pub model_index: usize,
    /// Model name
    pub model: String,
    /// Segments merged for this model
    pub segments_done: usize,
    /// Segments this model will process
    pub segments_total: usize,
}

impl SeparationProgress {
    /// Completed fraction for this model (0.0 - 1.0)
    pub fn fraction(&self) -> f32 {
        if self.segments_total == 0 {
            return 1.0;
        }
        self.segments_done as f32 / self.segments_total as f32
    }
}

/// Progress observer
#[derive(Clone)]
pub struct ProgressCallback(Arc<dyn Fn(SeparationProgress) + Send + Sync>);

impl ProgressCallback {
    pub fn new(f: impl Fn(SeparationProgress) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub(crate) fn report(&self, progress: SeparationProgress) {
        (self.0)(progress)
    }
}

impl fmt::Debug for ProgressCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressCallback")
    }
}

/// Options for one separation call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeparationOptions {
    /// Overlap fraction between segments; `None` uses each model's default
    pub overlap: Option<f32>,

    /// Extra randomly shifted copies per segment (0 = no augmentation)
    pub shifts: usize,

    /// Seed for shift offsets
    pub seed: u64,

    /// Largest shift in seconds
    pub max_shift_secs: f32,

    /// Segment length override in seconds
    pub segment_secs: Option<f32>,

    /// Ramp shape in the overlap region
    pub fade: FadeShape,

    /// Per-model ensemble weights
    pub weights: EnsembleWeights,

    /// Where to run inference
    pub device: DevicePreference,

    /// Items per forward pass (upper bound when a memory budget is set)
    pub batch_size: usize,

    /// Working memory budget in bytes; enables streaming segmentation
    pub memory_budget: Option<u64>,

    /// Sample rate / channel mismatch handling
    pub mismatch: MismatchPolicy,

    /// Run models of an ensemble concurrently
    pub parallel_models: bool,

    /// Worker threads for parallel models (0 = one per core)
    pub workers: usize,

    /// Progress observer
    #[serde(skip)]
    pub progress: Option<ProgressCallback>,

    /// Abort flag
    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl Default for SeparationOptions {
    fn default() -> Self {
        Self {
            overlap: None,
            shifts: 1,
            seed: 0,
            max_shift_secs: 0.5,
            segment_secs: None,
            fade: FadeShape::Linear,
            weights: EnsembleWeights::default(),
            device: DevicePreference::Auto,
            batch_size: 1,
            memory_budget: None,
            mismatch: MismatchPolicy::Convert,
            parallel_models: false,
            workers: 0,
            progress: None,
            cancel: CancellationToken::default(),
        }
    }
}

impl SeparationOptions {
    /// No augmentation, no overlap beyond the model default, larger batches
    pub fn fast() -> Self {
        Self {
            shifts: 0,
            batch_size: 4,
            parallel_models: true,
            ..Self::default()
        }
    }

    /// More shifts, wider overlap and smoother fades
    pub fn high_quality() -> Self {
        Self {
            overlap: Some(0.5),
            shifts: 5,
            fade: FadeShape::RaisedCosine,
            ..Self::default()
        }
    }

    /// Load options from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> SeparationResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let options: Self = serde_json::from_str(&text).map_err(|e| {
            SeparationError::config(format!("{}: {}", path.as_ref().display(), e))
        })?;
        options.validate()?;
        Ok(options)
    }

    pub fn with_overlap(mut self, overlap: f32) -> Self {
        self.overlap = Some(overlap);
        self
    }

    pub fn with_shifts(mut self, shifts: usize) -> Self {
        self.shifts = shifts;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_segment_secs(mut self, secs: f32) -> Self {
        self.segment_secs = Some(secs);
        self
    }

    pub fn with_fade(mut self, fade: FadeShape) -> Self {
        self.fade = fade;
        self
    }

    pub fn with_weights(mut self, weights: EnsembleWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_device(mut self, device: DevicePreference) -> Self {
        self.device = device;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    pub fn with_mismatch(mut self, policy: MismatchPolicy) -> Self {
        self.mismatch = policy;
        self
    }

    pub fn with_parallel_models(mut self, parallel: bool) -> Self {
        self.parallel_models = parallel;
        self
    }

    pub fn with_progress(mut self, f: impl Fn(SeparationProgress) + Send + Sync + 'static) -> Self {
        self.progress = Some(ProgressCallback::new(f));
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Reject invalid parameters before any work starts
    pub fn validate(&self) -> SeparationResult<()> {
        if let Some(overlap) = self.overlap {
            if !overlap.is_finite() || !(0.0..1.0).contains(&overlap) {
                return Err(SeparationError::config(format!(
                    "overlap {} outside [0, 1)",
                    overlap
                )));
            }
        }
        if !self.max_shift_secs.is_finite() || self.max_shift_secs < 0.0 {
            return Err(SeparationError::config(format!(
                "max shift {}s must be non-negative",
                self.max_shift_secs
            )));
        }
        if let Some(secs) = self.segment_secs {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(SeparationError::config(format!(
                    "segment length {}s must be positive",
                    secs
                )));
            }
        }
        if self.batch_size == 0 {
            return Err(SeparationError::config("batch size must be at least 1"));
        }
        if self.memory_budget == Some(0) {
            return Err(SeparationError::config("memory budget must be positive"));
        }
        self.weights.validate()
    }

    /// Worker threads after resolving `0` to the core count
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    /// Segments per batch for a model with the given geometry
    ///
    /// Without a budget this is the batch size divided by the copies each
    /// segment expands into. With a budget it is whatever fits, bounded by
    /// the same value and never below one. When the shift copies of one
    /// segment outnumber the batch size, segments go one at a time and the
    /// runner splits their copies across forward passes.
    pub fn segments_per_batch(&self, segment: usize, channels: usize, sources: usize) -> usize {
        let variants = self.shifts + 1;
        let hint = (self.batch_size / variants).max(1);

        let Some(budget) = self.memory_budget else {
            return hint;
        };

        // input copies plus predictions, f32
        let per_segment = (segment * channels * 4 * variants * (1 + sources)) as u64;
        let fit = (budget / per_segment.max(1)) as usize;
        if fit == 0 {
            log::warn!(
                "memory budget of {} bytes is below one segment ({} bytes), processing one at a time",
                budget,
                per_segment
            );
        }
        fit.clamp(1, hint)
    }

    /// Rough working memory of a separation in MB
    pub fn estimated_memory_mb(
        &self,
        duration_secs: f32,
        sample_rate: u32,
        channels: usize,
        sources: usize,
        segment: usize,
    ) -> f32 {
        let samples = duration_secs * sample_rate as f32;

        // Input + accumulation buffers
        let base_mb = samples * channels as f32 * (1.0 + sources as f32) * 4.0 / 1_000_000.0;

        let batch = self.segments_per_batch(segment, channels, sources) as f32;
        let variants = (self.shifts + 1) as f32;
        let batch_mb =
            batch * variants * segment as f32 * channels as f32 * (1.0 + sources as f32) * 4.0 / 1_000_000.0;

        base_mb + batch_mb
    }
}
