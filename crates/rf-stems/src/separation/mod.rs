//! Segmented, shift-augmented, ensembled source separation
//!
//! ## Pipeline
//!
//! ```text
//! Separator ─▶ Segmenter ─▶ ShiftAugmenter ─▶ InferenceRunner ─▶ OverlapAdd ─▶ Ensembler
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rf_stems::{LocalRepository, SeparationOptions, Separator};
//!
//! let separator = Separator::new(Arc::new(LocalRepository::new("models")));
//! let options = SeparationOptions::high_quality().with_seed(42);
//! let stems = separator.separate_file(Path::new("song.flac"), &["htdemucs"], &options)?;
//!
//! let vocals = stems.get("vocals").unwrap();
//! let karaoke = stems.two_stems("vocals")?;
//! ```

mod cancel;
mod config;
mod ensemble;
mod overlap_add;
mod runner;
mod segment;
mod separator;
mod shift;
mod stems;
mod window;

pub use cancel::CancellationToken;
pub use config::{MismatchPolicy, ProgressCallback, SeparationOptions, SeparationProgress};
pub use ensemble::{EnsembleWeights, Ensembler};
pub use overlap_add::OverlapAdd;
pub use runner::InferenceRunner;
pub use segment::{Segment, SegmentLayout, Segmenter, Segments};
pub use separator::Separator;
pub use shift::ShiftAugmenter;
pub use stems::{SeparatedSources, SeparationStats};
pub use window::{FadeShape, FadeWindows};
