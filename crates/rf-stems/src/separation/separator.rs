//! Separation orchestrator
//!
//! Resolves models, validates them against the input, then runs each model
//! through segmentation, shift augmentation, batched inference and
//! overlap-add before ensembling the per-model results.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use ndarray::{Array3, s};
use rayon::prelude::*;

use super::config::{MismatchPolicy, SeparationOptions, SeparationProgress};
use super::ensemble::Ensembler;
use super::overlap_add::OverlapAdd;
use super::runner::InferenceRunner;
use super::segment::{Segment, Segmenter};
use super::shift::ShiftAugmenter;
use super::stems::SeparatedSources;
use super::window::FadeWindows;
use crate::audio::{AudioIo, FileAudioIo, Resampler, RubatoResampler};
use crate::error::{SeparationError, SeparationResult};
use crate::inference::DeviceQueue;
use crate::model::ModelDescriptor;
use crate::repository::{ModelRepository, ModelSelection, select_model};
use crate::waveform::Waveform;

/// One model run within a separation call
#[derive(Debug, Clone)]
struct Member {
    descriptor: ModelDescriptor,
    /// Ensemble weight per source label
    weights: HashMap<String, f32>,
    /// Effective segment length in model samples
    segment: usize,
}

/// Separates waveforms into stems with models from a repository
pub struct Separator {
    repository: Arc<dyn ModelRepository>,
    audio: Arc<dyn AudioIo>,
    resampler: Arc<dyn Resampler>,
    devices: Arc<DeviceQueue>,
}

impl Separator {
    /// Separator with symphonia/hound file I/O and rubato resampling
    pub fn new(repository: Arc<dyn ModelRepository>) -> Self {
        Self {
            repository,
            audio: Arc::new(FileAudioIo),
            resampler: Arc::new(RubatoResampler::default()),
            devices: Arc::new(DeviceQueue::new()),
        }
    }

    /// Replace the audio reader/writer
    pub fn with_audio_io(mut self, audio: Arc<dyn AudioIo>) -> Self {
        self.audio = audio;
        self
    }

    /// Replace the resampler
    pub fn with_resampler(mut self, resampler: Arc<dyn Resampler>) -> Self {
        self.resampler = resampler;
        self
    }

    /// Share a device queue with other separators
    pub fn with_device_queue(mut self, devices: Arc<DeviceQueue>) -> Self {
        self.devices = devices;
        self
    }

    /// Model repository
    pub fn repository(&self) -> &dyn ModelRepository {
        self.repository.as_ref()
    }

    /// Audio reader/writer
    pub fn audio_io(&self) -> &dyn AudioIo {
        self.audio.as_ref()
    }

    /// Resolve models ahead of the first call
    pub fn preload<S: AsRef<str>>(&self, model_names: &[S]) -> SeparationResult<Vec<ModelDescriptor>> {
        let mut loaded = Vec::new();
        for name in model_names {
            loaded.extend_from_slice(select_model(self.repository(), name.as_ref())?.models());
        }
        Ok(loaded)
    }

    /// Decode `path` and separate it
    pub fn separate_file<S: AsRef<str>>(
        &self,
        path: &Path,
        model_names: &[S],
        options: &SeparationOptions,
    ) -> SeparationResult<SeparatedSources> {
        options.validate()?;
        let waveform = self.audio.read(path)?;
        self.separate(&waveform, model_names, options)
    }

    /// Separate `waveform` with one or more models
    ///
    /// Output stems have the input's sample rate, channel count and length.
    pub fn separate<S: AsRef<str>>(
        &self,
        waveform: &Waveform,
        model_names: &[S],
        options: &SeparationOptions,
    ) -> SeparationResult<SeparatedSources> {
        let started = Instant::now();

        options.validate()?;
        if waveform.is_empty() || waveform.channels() == 0 {
            return Err(SeparationError::config("cannot separate an empty waveform"));
        }
        if waveform.sample_rate() == 0 {
            return Err(SeparationError::config("waveform sample rate must be positive"));
        }
        if model_names.is_empty() {
            return Err(SeparationError::config("no models requested"));
        }

        let members = self.plan(model_names, options)?;
        check_members(waveform, &members, options.mismatch)?;
        options.cancel.check()?;

        log::info!(
            "Separating {:.1}s ({} ch, {} Hz) with {} model(s)",
            waveform.duration_secs(),
            waveform.channels(),
            waveform.sample_rate(),
            members.len()
        );

        let outputs: Vec<SeparatedSources> = if options.parallel_models && members.len() > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(options.effective_workers())
                .build()
                .map_err(|e| SeparationError::config(format!("thread pool: {}", e)))?;
            pool.install(|| {
                members
                    .par_iter()
                    .enumerate()
                    .map(|(index, member)| self.run_member(index, member, waveform, options))
                    .collect::<SeparationResult<Vec<_>>>()
            })?
        } else {
            members
                .iter()
                .enumerate()
                .map(|(index, member)| self.run_member(index, member, waveform, options))
                .collect::<SeparationResult<Vec<_>>>()?
        };

        let mut ensembler = Ensembler::new();
        for (output, member) in outputs.into_iter().zip(&members) {
            ensembler.push(output, member.weights.clone())?;
        }
        let mut result = ensembler.finish()?;

        let elapsed = started.elapsed();
        result.stats.total_time_ms = elapsed.as_millis() as u64;
        result.stats.rtf = if elapsed.as_secs_f64() > 0.0 {
            (waveform.duration_secs() / elapsed.as_secs_f64()) as f32
        } else {
            0.0
        };

        log::info!(
            "Separated into {:?} in {} ms ({:.1}x real time)",
            result.labels(),
            result.stats.total_time_ms,
            result.stats.rtf
        );

        Ok(result)
    }

    /// Resolve names, expand bags and fix per-member weights and segment length
    fn plan<S: AsRef<str>>(
        &self,
        model_names: &[S],
        options: &SeparationOptions,
    ) -> SeparationResult<Vec<Member>> {
        let mut members = Vec::new();

        for name in model_names {
            let name = name.as_ref();
            match select_model(self.repository(), name)? {
                ModelSelection::Single(descriptor) => {
                    let weights = descriptor
                        .sources()
                        .iter()
                        .map(|src| (src.clone(), options.weights.weight(name, src)))
                        .collect();
                    let segment = segment_length(&descriptor, options.segment_secs)?;
                    members.push(Member {
                        descriptor,
                        weights,
                        segment,
                    });
                }
                ModelSelection::Bag { bag, members: models } => {
                    let override_secs = options.segment_secs.or(bag.segment_secs);
                    for (index, descriptor) in models.into_iter().enumerate() {
                        let row = bag.member_weights(index);
                        let weights = descriptor
                            .sources()
                            .iter()
                            .enumerate()
                            .map(|(k, src)| {
                                let bag_weight = row.map_or(1.0, |r| r[k]);
                                let user = options.weights.weight(name, src);
                                (src.clone(), bag_weight * user)
                            })
                            .collect();
                        let segment = segment_length(&descriptor, override_secs)?;
                        members.push(Member {
                            descriptor,
                            weights,
                            segment,
                        });
                    }
                }
            }
        }

        Ok(members)
    }

    /// Full pipeline for one model
    fn run_member(
        &self,
        index: usize,
        member: &Member,
        waveform: &Waveform,
        options: &SeparationOptions,
    ) -> SeparationResult<SeparatedSources> {
        let model = &member.descriptor;
        options.cancel.check()?;

        let input = self.to_model(waveform, model)?;
        let stats = model.normalization().stats(&input);
        let normalized = stats.apply(&input);

        let overlap = options.overlap.unwrap_or(model.overlap());
        let segmenter = Segmenter::new(normalized.view(), member.segment, overlap)?;
        let layout = segmenter.layout();
        let max_shift = (options.max_shift_secs * model.sample_rate() as f32).round() as usize;
        let seed = model_seed(options.seed, model.name());
        let shifts = ShiftAugmenter::new(options.shifts, max_shift, seed);
        let group = options.segments_per_batch(member.segment, model.channels(), model.num_sources());

        log::debug!(
            "{}: {} segments of {} samples, stride {}, {} shift(s), {} segment(s) per batch",
            model.name(),
            layout.count(),
            layout.length(),
            layout.stride(),
            options.shifts,
            group
        );

        // shift copies of one segment may be split across forward passes
        let runner =
            InferenceRunner::start(model, options.device, self.devices.clone(), options.batch_size)?
                .with_cancel(options.cancel.clone());

        let mut pass = ModelPass {
            index,
            model,
            options,
            windows: FadeWindows::new(layout, options.fade),
            shifts,
            runner,
            ola: OverlapAdd::new(model.num_sources(), model.channels(), input.len()),
        };

        if options.memory_budget.is_some() {
            let mut segments = segmenter.iter();
            loop {
                let batch: Vec<Segment> = segments.by_ref().take(group).collect();
                if batch.is_empty() {
                    break;
                }
                pass.process(&batch)?;
            }
        } else {
            let segments: Vec<Segment> = segmenter.iter().collect();
            for batch in segments.chunks(group) {
                pass.process(batch)?;
            }
        }

        let calls = pass.runner.calls();
        let merged = pass.ola.merged();
        let mut separated = pass.ola.finish()?;
        drop(pass.runner);
        stats.restore(&mut separated);

        let mut output = SeparatedSources::new(waveform.sample_rate(), vec![model.name().to_string()]);
        for (label, stem) in model.sources().iter().zip(separated.outer_iter()) {
            let stem = Waveform::new(stem.to_owned(), model.sample_rate());
            output.add(label.clone(), self.from_model(stem, waveform)?)?;
        }
        output.stats.segments_processed = merged;
        output.stats.inference_calls = calls;

        Ok(output)
    }

    /// Adapt the input to the model's rate and channel layout
    fn to_model(&self, waveform: &Waveform, model: &ModelDescriptor) -> SeparationResult<Waveform> {
        let adapted = waveform.with_channels(model.channels())?;
        if adapted.sample_rate() == model.sample_rate() {
            return Ok(adapted);
        }
        self.resampler.resample(&adapted, model.sample_rate())
    }

    /// Bring a stem back to the input's rate, channels and exact length
    fn from_model(&self, stem: Waveform, original: &Waveform) -> SeparationResult<Waveform> {
        let stem = if stem.sample_rate() == original.sample_rate() {
            stem
        } else {
            self.resampler.resample(&stem, original.sample_rate())?
        };
        Ok(stem
            .with_channels(original.channels())?
            .fit_length(original.len()))
    }
}

/// Per-model state while segments stream through
struct ModelPass<'a> {
    index: usize,
    model: &'a ModelDescriptor,
    options: &'a SeparationOptions,
    windows: FadeWindows,
    shifts: ShiftAugmenter,
    runner: InferenceRunner<'a>,
    ola: OverlapAdd,
}

impl ModelPass<'_> {
    /// Shift, infer, unshift and merge one batch of segments
    fn process(&mut self, batch: &[Segment]) -> SeparationResult<()> {
        self.options.cancel.check()?;

        let variants = self.shifts.variants();
        let length = self.windows.layout().length();
        let channels = self.model.channels();

        let mut offsets = Vec::with_capacity(batch.len());
        let mut items = Array3::<f32>::zeros((batch.len() * variants, channels, length));
        for (i, segment) in batch.iter().enumerate() {
            self.options.cancel.check()?;
            let drawn = self.shifts.draw_offsets(length);
            items
                .slice_mut(s![i * variants..(i + 1) * variants, .., ..])
                .assign(&ShiftAugmenter::expand(segment.data.view(), &drawn));
            offsets.push(drawn);
        }

        let predictions = self.runner.run(items.view())?;
        self.options.cancel.check()?;

        for (i, segment) in batch.iter().enumerate() {
            self.options.cancel.check()?;
            let prediction = predictions.slice(s![i * variants..(i + 1) * variants, .., .., ..]);
            let merged = ShiftAugmenter::collapse(prediction, &offsets[i]);
            self.ola
                .add(segment.start, merged.view(), &self.windows.window(segment.index))?;
        }

        if let Some(progress) = &self.options.progress {
            progress.report(SeparationProgress {
                model_index: self.index,
                model: self.model.name().to_string(),
                segments_done: self.ola.merged(),
                segments_total: self.windows.layout().count(),
            });
        }

        Ok(())
    }
}

/// Seed for one model, fixed by its name so repeated members draw alike
fn model_seed(seed: u64, name: &str) -> u64 {
    // FNV-1a
    let hash = name.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
        (h ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
    });
    seed ^ hash
}

/// Segment length in model samples after applying an override
fn segment_length(model: &ModelDescriptor, override_secs: Option<f32>) -> SeparationResult<usize> {
    let Some(secs) = override_secs else {
        return Ok(model.segment_samples());
    };

    let samples = (secs as f64 * model.sample_rate() as f64).round() as usize;
    if samples == 0 {
        return Err(SeparationError::config(format!(
            "segment of {}s is empty at {} Hz",
            secs,
            model.sample_rate()
        )));
    }
    if model.info().fixed_segment && samples != model.segment_samples() {
        return Err(SeparationError::config(format!(
            "{} has a fixed segment of {} samples, cannot use {}s",
            model.name(),
            model.segment_samples(),
            secs
        )));
    }
    Ok(samples)
}

/// Channel conversion between layouts is defined
fn can_adapt(from: usize, to: usize) -> bool {
    from == to || from == 1 || to < from
}

/// Fail fast on source set, sample rate and channel mismatches
fn check_members(
    waveform: &Waveform,
    members: &[Member],
    policy: MismatchPolicy,
) -> SeparationResult<()> {
    let Some(first) = members.first() else {
        return Err(SeparationError::config("no models requested"));
    };
    let sources: HashSet<&String> = first.descriptor.sources().iter().collect();

    for member in members {
        let model = &member.descriptor;

        let other: HashSet<&String> = model.sources().iter().collect();
        if other != sources {
            return Err(SeparationError::incompatible(format!(
                "{} produces {:?} but {} produces {:?}",
                model.name(),
                model.sources(),
                first.descriptor.name(),
                first.descriptor.sources()
            )));
        }

        let rate_ok = model.sample_rate() == waveform.sample_rate();
        let channels_ok = model.channels() == waveform.channels();
        match policy {
            MismatchPolicy::Fail if !rate_ok || !channels_ok => {
                return Err(SeparationError::incompatible(format!(
                    "{} expects {} ch at {} Hz, input is {} ch at {} Hz",
                    model.name(),
                    model.channels(),
                    model.sample_rate(),
                    waveform.channels(),
                    waveform.sample_rate()
                )));
            }
            MismatchPolicy::Convert
                if !can_adapt(waveform.channels(), model.channels())
                    || !can_adapt(model.channels(), waveform.channels()) =>
            {
                return Err(SeparationError::incompatible(format!(
                    "cannot map {} input channels onto {} ({} ch)",
                    waveform.channels(),
                    model.name(),
                    model.channels()
                )));
            }
            _ => {}
        }
    }

    Ok(())
}
