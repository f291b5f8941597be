//! # ReelForge Stem Separation
//!
//! Offline inference orchestration for music source separation:
//! - Overlapping segmentation sized to each model's receptive field
//! - Seamless windowed overlap-add reconstruction
//! - Seeded shift augmentation (test-time time-shift averaging)
//! - Weighted multi-model ensembling and bags of models
//! - Memory-bounded streaming over long inputs
//!
//! ## Architecture
//!
//! Models are opaque [`InferenceUnit`]s mapping `[batch, channels, samples]` to
//! `[batch, sources, channels, samples]`. ONNX graphs run on pure Rust `tract`;
//! accelerator backends plug in through the same trait and are serialized per
//! device by a shared [`DeviceQueue`].

pub mod audio;
pub mod separation;

mod error;
mod inference;
mod model;
mod repository;
mod waveform;

pub use audio::{AudioIo, BitDepth, ClipMode, FileAudioIo, Resampler, RubatoResampler, WriteOptions};
pub use error::{SeparationError, SeparationResult};
pub use inference::{Device, DevicePreference, DeviceQueue, OnnxModel};
pub use model::{InferenceUnit, ModelBackend, ModelDescriptor, ModelInfo, NormStats, Normalization};
pub use repository::{
    BagOfModels, InMemoryRepository, LocalRepository, Manifest, ModelManifest, ModelRepository,
    ModelSelection, select_model,
};
pub use separation::{
    CancellationToken, EnsembleWeights, FadeShape, MismatchPolicy, SeparatedSources,
    SeparationOptions, SeparationProgress, SeparationStats, Separator,
};
pub use waveform::Waveform;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate version
pub fn version() -> &'static str {
    VERSION
}
