//! Model descriptors
//!
//! A [`ModelDescriptor`] is one loaded separation model plus the metadata the
//! orchestrator needs: sample rate, channel count, segment length, source
//! labels, input normalization and the default overlap. The network itself is
//! opaque: it maps `[batch, channels, samples]` to
//! `[batch, sources, channels, samples]`.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use ndarray::{Array3, Array4};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{SeparationError, SeparationResult};
use crate::inference::{Device, DevicePreference, OnnxModel};
use crate::waveform::Waveform;

/// Guard added to the standard deviation before scaling
const NORM_EPS: f32 = 1e-8;

fn default_overlap() -> f32 {
    0.25
}

/// Input normalization applied around inference
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Normalization {
    /// Feed the waveform unchanged
    #[default]
    None,
    /// Standardize with the mean/std of the track's mono mix
    PerTrack,
    /// Standardize with statistics recorded at training time
    Fixed { mean: f32, std: f32 },
}

impl Normalization {
    /// Statistics to use for this input
    pub fn stats(&self, input: &Waveform) -> NormStats {
        match *self {
            Normalization::None => NormStats::IDENTITY,
            Normalization::Fixed { mean, std } => NormStats { mean, std },
            Normalization::PerTrack => NormStats::of_mix(input),
        }
    }
}

/// Mean and standard deviation used to standardize a waveform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormStats {
    pub mean: f32,
    pub std: f32,
}

impl NormStats {
    /// No-op statistics
    pub const IDENTITY: NormStats = NormStats { mean: 0.0, std: 1.0 };

    /// Statistics of the mono mixdown
    pub fn of_mix(input: &Waveform) -> NormStats {
        let mono = input.to_mono();
        let samples = mono.view();
        let n = samples.len();
        if n == 0 {
            return Self::IDENTITY;
        }

        let mean = samples.iter().map(|&s| s as f64).sum::<f64>() / n as f64;
        let var = if n > 1 {
            samples
                .iter()
                .map(|&s| (s as f64 - mean).powi(2))
                .sum::<f64>()
                / (n - 1) as f64
        } else {
            0.0
        };

        NormStats {
            mean: mean as f32,
            std: var.sqrt() as f32,
        }
    }

    fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    fn scale(&self) -> f32 {
        if self.is_identity() {
            1.0
        } else {
            self.std + NORM_EPS
        }
    }

    /// Standardize a waveform
    pub fn apply(&self, input: &Waveform) -> Waveform {
        if self.is_identity() {
            return input.clone();
        }
        let scale = self.scale();
        let data = input.data().mapv(|s| (s - self.mean) / scale);
        Waveform::new(data, input.sample_rate())
    }

    /// Undo standardization on model output `[sources, channels, samples]`
    pub fn restore(&self, output: &mut Array3<f32>) {
        if self.is_identity() {
            return;
        }
        let scale = self.scale();
        output.mapv_inplace(|s| s * scale + self.mean);
    }
}

/// Static model metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Repository name
    pub name: String,

    /// Sample rate the model was trained at
    pub sample_rate: u32,

    /// Audio channels the model expects
    pub channels: usize,

    /// Receptive field in samples (one segment)
    pub segment_samples: usize,

    /// Output source labels, in tensor order
    pub sources: Vec<String>,

    /// Input normalization
    #[serde(default)]
    pub normalization: Normalization,

    /// Default overlap fraction between segments
    #[serde(default = "default_overlap")]
    pub overlap: f32,

    /// Segment length is baked into the graph and cannot be overridden
    #[serde(default)]
    pub fixed_segment: bool,
}

impl ModelInfo {
    /// Metadata with the common defaults (no normalization, 25% overlap)
    pub fn new(
        name: impl Into<String>,
        sample_rate: u32,
        channels: usize,
        segment_samples: usize,
        sources: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            sample_rate,
            channels,
            segment_samples,
            sources: sources.iter().map(|s| s.to_string()).collect(),
            normalization: Normalization::None,
            overlap: default_overlap(),
            fixed_segment: false,
        }
    }

    /// Set normalization
    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    /// Set default overlap
    pub fn with_overlap(mut self, overlap: f32) -> Self {
        self.overlap = overlap;
        self
    }

    /// Mark the segment length as fixed
    pub fn with_fixed_segment(mut self, fixed: bool) -> Self {
        self.fixed_segment = fixed;
        self
    }

    /// Segment length in seconds
    pub fn segment_secs(&self) -> f32 {
        self.segment_samples as f32 / self.sample_rate as f32
    }

    fn validate(&self) -> SeparationResult<()> {
        let fail = |reason: String| SeparationError::ModelLoad {
            name: self.name.clone(),
            reason,
        };

        if self.sample_rate == 0 {
            return Err(fail("sample rate must be positive".into()));
        }
        if self.channels == 0 {
            return Err(fail("channel count must be positive".into()));
        }
        if self.segment_samples == 0 {
            return Err(fail("segment length must be positive".into()));
        }
        if self.sources.is_empty() {
            return Err(fail("model declares no sources".into()));
        }
        let unique: HashSet<&str> = self.sources.iter().map(String::as_str).collect();
        if unique.len() != self.sources.len() {
            return Err(fail(format!("duplicate source labels in {:?}", self.sources)));
        }
        if !(0.0..1.0).contains(&self.overlap) {
            return Err(fail(format!("overlap {} outside [0, 1)", self.overlap)));
        }
        if let Normalization::Fixed { std, .. } = self.normalization {
            if !(std.is_finite() && std > 0.0) {
                return Err(fail(format!("normalization std {} must be positive", std)));
            }
        }
        Ok(())
    }
}

/// Opaque separation network
///
/// Implementations must be deterministic for a given input so overlap-add
/// output is reproducible.
pub trait InferenceUnit: Send + Sync {
    /// Run `[batch, channels, samples]` to `[batch, sources, channels, samples]`
    fn forward(&self, batch: &Array3<f32>) -> SeparationResult<Array4<f32>>;

    /// Place the unit for the requested device, returning where it actually runs
    fn prepare(&self, preference: DevicePreference) -> SeparationResult<Device> {
        let _ = preference;
        Ok(Device::Cpu)
    }

    /// Free device-resident resources after a separation call
    fn release(&self) {}

    /// Whether batches larger than one item are accepted
    fn supports_batching(&self) -> bool {
        true
    }
}

/// Closed set of model implementations
pub enum ModelBackend {
    /// ONNX graph executed with tract
    Onnx(OnnxModel),
    /// Caller-provided network
    External(Arc<dyn InferenceUnit>),
}

impl ModelBackend {
    fn unit(&self) -> &dyn InferenceUnit {
        match self {
            ModelBackend::Onnx(model) => model,
            ModelBackend::External(unit) => unit.as_ref(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ModelBackend::Onnx(_) => "onnx",
            ModelBackend::External(_) => "external",
        }
    }
}

/// Device placement shared by every clone of a descriptor
#[derive(Debug, Default)]
struct Lease {
    holders: usize,
    device: Option<Device>,
}

/// Loaded model plus metadata, cheap to clone and shareable across threads
#[derive(Clone)]
pub struct ModelDescriptor {
    info: Arc<ModelInfo>,
    backend: Arc<ModelBackend>,
    lease: Arc<Mutex<Lease>>,
}

impl ModelDescriptor {
    /// Combine metadata and backend, validating the metadata
    pub fn new(info: ModelInfo, backend: ModelBackend) -> SeparationResult<Self> {
        info.validate()?;
        Ok(Self {
            info: Arc::new(info),
            backend: Arc::new(backend),
            lease: Arc::new(Mutex::new(Lease::default())),
        })
    }

    /// Wrap a caller-provided network
    pub fn from_unit(info: ModelInfo, unit: Arc<dyn InferenceUnit>) -> SeparationResult<Self> {
        Self::new(info, ModelBackend::External(unit))
    }

    /// Metadata
    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    /// Repository name
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Model sample rate
    pub fn sample_rate(&self) -> u32 {
        self.info.sample_rate
    }

    /// Expected channel count
    pub fn channels(&self) -> usize {
        self.info.channels
    }

    /// Segment length in samples
    pub fn segment_samples(&self) -> usize {
        self.info.segment_samples
    }

    /// Source labels in output order
    pub fn sources(&self) -> &[String] {
        &self.info.sources
    }

    /// Number of output sources
    pub fn num_sources(&self) -> usize {
        self.info.sources.len()
    }

    /// Input normalization
    pub fn normalization(&self) -> Normalization {
        self.info.normalization
    }

    /// Default overlap fraction
    pub fn overlap(&self) -> f32 {
        self.info.overlap
    }

    /// Run the network and check the output contract
    pub fn forward(&self, batch: &Array3<f32>) -> SeparationResult<Array4<f32>> {
        let (items, channels, samples) = batch.dim();
        if channels != self.channels() {
            return Err(SeparationError::InferenceFailed {
                reason: format!(
                    "{} expects {} channels, batch has {}",
                    self.name(),
                    self.channels(),
                    channels
                ),
            });
        }

        let output = self.backend.unit().forward(batch)?;
        let expected = (items, self.num_sources(), channels, samples);
        if output.dim() != expected {
            return Err(SeparationError::InvalidOutputShape {
                expected: format!("{:?}", expected),
                got: format!("{:?}", output.dim()),
            });
        }

        Ok(output)
    }

    /// Place the model on a device, or join the placement already in use
    ///
    /// Only the first holder prepares the unit; later holders get the same
    /// device until every holder has called [`release`](Self::release).
    pub fn prepare(&self, preference: DevicePreference) -> SeparationResult<Device> {
        let mut lease = self.lease.lock();
        let device = match lease.device {
            Some(device) => device,
            None => {
                let device = self.backend.unit().prepare(preference)?;
                lease.device = Some(device);
                device
            }
        };
        lease.holders += 1;
        Ok(device)
    }

    /// Drop one hold; the unit frees its resources when the last one goes
    pub fn release(&self) {
        let mut lease = self.lease.lock();
        if lease.holders == 0 {
            return;
        }
        lease.holders -= 1;
        if lease.holders == 0 {
            lease.device = None;
            self.backend.unit().release();
        }
    }

    /// Calls currently holding the model on its device
    pub fn holders(&self) -> usize {
        self.lease.lock().holders
    }

    /// Whether batched calls are accepted
    pub fn supports_batching(&self) -> bool {
        self.backend.unit().supports_batching()
    }

    /// True when both handles share one loaded model
    pub fn same_model(&self, other: &ModelDescriptor) -> bool {
        Arc::ptr_eq(&self.backend, &other.backend)
    }
}

impl fmt::Debug for ModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelDescriptor")
            .field("info", &self.info)
            .field("backend", &self.backend.kind())
            .finish()
    }
}
