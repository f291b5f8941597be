//! ReelForge stem separation CLI
//!
//! Usage:
//!   rf-stems song.flac                          - 4 stems with htdemucs
//!   rf-stems song.flac -n a -n b --shifts 2     - ensemble two models
//!   rf-stems song.flac --two-stems vocals       - vocals + no_vocals
//!   rf-stems --list                             - show available models

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};

use rf_stems::{
    BitDepth, ClipMode, DevicePreference, FadeShape, LocalRepository, MismatchPolicy,
    ModelRepository, SeparationOptions, Separator, WriteOptions,
};

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    Fast,
    Default,
    High,
}

#[derive(Clone, Copy, ValueEnum)]
enum Clip {
    Rescale,
    Clamp,
    None,
}

#[derive(Parser)]
#[command(name = "rf-stems", version, about = "Separate a mix into stems")]
struct Cli {
    /// Input audio file (WAV, AIFF, FLAC, MP3, OGG)
    #[arg(required_unless_present = "list")]
    input: Option<PathBuf>,

    /// Model or bag name; repeat to ensemble
    #[arg(short = 'n', long = "name", default_value = "htdemucs")]
    models: Vec<String>,

    /// Directory with model manifests and ONNX graphs
    #[arg(long, default_value = "models")]
    repo: PathBuf,

    /// Output directory
    #[arg(short, long, default_value = "separated")]
    out: PathBuf,

    /// Output file name template ({track}, {stem}, {ext})
    #[arg(long, default_value = "{track}/{stem}.{ext}")]
    filename: String,

    /// Option preset
    #[arg(long, value_enum, default_value = "default")]
    preset: Preset,

    /// JSON options file (overrides the preset)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Random shifts per segment
    #[arg(long)]
    shifts: Option<usize>,

    /// Overlap between segments (0.0 - 1.0)
    #[arg(long)]
    overlap: Option<f32>,

    /// Seed for shift offsets
    #[arg(long)]
    seed: Option<u64>,

    /// Segment length in seconds
    #[arg(long)]
    segment: Option<f32>,

    /// Use raised-cosine fades instead of linear
    #[arg(long)]
    smooth_fades: bool,

    /// Segments and shift copies per forward pass
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Working memory budget in MB (streams segments)
    #[arg(long)]
    memory_mb: Option<u64>,

    /// Device: auto, cpu or accel:<id>
    #[arg(short, long, default_value = "auto")]
    device: String,

    /// Reject inputs whose rate or channels differ from the model
    #[arg(long)]
    strict: bool,

    /// Run ensemble members in parallel
    #[arg(long)]
    parallel: bool,

    /// Worker threads (0 = one per core)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Keep only this source plus everything else mixed together
    #[arg(long)]
    two_stems: Option<String>,

    /// Overload handling before writing
    #[arg(long, value_enum, default_value = "rescale")]
    clip: Clip,

    /// Write 24-bit integer WAV
    #[arg(long, conflicts_with = "float32")]
    int24: bool,

    /// Write 32-bit float WAV
    #[arg(long)]
    float32: bool,

    /// List models in the repository and exit
    #[arg(long)]
    list: bool,
}

impl Cli {
    fn options(&self) -> Result<SeparationOptions> {
        let mut options = match &self.config {
            Some(path) => SeparationOptions::from_json_file(path)
                .with_context(|| format!("Failed to load options from {}", path.display()))?,
            None => match self.preset {
                Preset::Fast => SeparationOptions::fast(),
                Preset::Default => SeparationOptions::default(),
                Preset::High => SeparationOptions::high_quality(),
            },
        };

        if let Some(shifts) = self.shifts {
            options.shifts = shifts;
        }
        if let Some(overlap) = self.overlap {
            options.overlap = Some(overlap);
        }
        if let Some(seed) = self.seed {
            options.seed = seed;
        }
        if let Some(segment) = self.segment {
            options.segment_secs = Some(segment);
        }
        if self.smooth_fades {
            options.fade = FadeShape::RaisedCosine;
        }
        if let Some(batch_size) = self.batch_size {
            options.batch_size = batch_size;
        }
        if let Some(mb) = self.memory_mb {
            options.memory_budget = Some(mb * 1024 * 1024);
        }
        if self.strict {
            options.mismatch = MismatchPolicy::Fail;
        }
        if self.parallel {
            options.parallel_models = true;
        }
        if let Some(jobs) = self.jobs {
            options.workers = jobs;
        }
        options.device = self
            .device
            .parse::<DevicePreference>()
            .context("Invalid --device")?;

        options.validate().context("Invalid separation options")?;
        Ok(options)
    }

    fn write_options(&self) -> WriteOptions {
        WriteOptions {
            bit_depth: if self.float32 {
                BitDepth::Float32
            } else if self.int24 {
                BitDepth::Int24
            } else {
                BitDepth::Int16
            },
            clip: match self.clip {
                Clip::Rescale => ClipMode::Rescale,
                Clip::Clamp => ClipMode::Clamp,
                Clip::None => ClipMode::None,
            },
            filename: self.filename.clone(),
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let repository = Arc::new(LocalRepository::new(&cli.repo));

    if cli.list {
        for name in repository.list() {
            println!("{}", name);
        }
        return Ok(());
    }

    let Some(input) = cli.input.as_deref() else {
        bail!("No input file given");
    };
    let options = cli.options()?;

    log::info!("rf-stems {}", rf_stems::version());

    let separator = Separator::new(repository);
    let mut stems = separator
        .separate_file(input, &cli.models, &options)
        .with_context(|| format!("Failed to separate {}", input.display()))?;

    if let Some(label) = &cli.two_stems {
        stems = stems.two_stems(label)?;
    }

    let track = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("track");
    let written = stems
        .write_all(separator.audio_io(), &cli.out, track, &cli.write_options())
        .with_context(|| format!("Failed to write stems to {}", cli.out.display()))?;

    println!(
        "Separated {} into {} stems in {:.1}s ({:.1}x real time)",
        input.display(),
        written.len(),
        stems.stats.total_time_ms as f64 / 1000.0,
        stems.stats.rtf
    );

    Ok(())
}
