//! End-to-end separation tests with synthetic inference units

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use approx::assert_abs_diff_eq;
use ndarray::{Array2, Array3, Array4, Axis, s};
use parking_lot::Mutex;

use rf_stems::{
    CancellationToken, Device, DevicePreference, EnsembleWeights, FadeShape, FileAudioIo,
    InMemoryRepository, InferenceUnit, MismatchPolicy, ModelInfo, ModelRepository, Normalization,
    SeparationError, SeparationOptions, SeparationResult, Separator, Waveform, WriteOptions,
};

// ═══════════════════════════════════════════════════════════════════════════════
// TEST UNITS
// ═══════════════════════════════════════════════════════════════════════════════

/// One source per gain, each a scaled copy of the input
struct Gains(Vec<f32>);

impl InferenceUnit for Gains {
    fn forward(&self, batch: &Array3<f32>) -> SeparationResult<Array4<f32>> {
        let (b, c, n) = batch.dim();
        let mut out = Array4::zeros((b, self.0.len(), c, n));
        for (k, &g) in self.0.iter().enumerate() {
            out.slice_mut(s![.., k, .., ..]).assign(&(batch * g));
        }
        Ok(out)
    }
}

/// Weights each sample by its position in the segment, so shifts matter
struct Positional;

impl InferenceUnit for Positional {
    fn forward(&self, batch: &Array3<f32>) -> SeparationResult<Array4<f32>> {
        let n = batch.len_of(Axis(2));
        let mut out = batch.clone();
        for mut lane in out.lanes_mut(Axis(2)) {
            for (i, x) in lane.iter_mut().enumerate() {
                *x *= 1.0 + i as f32 / n as f32;
            }
        }
        Ok(out.insert_axis(Axis(1)))
    }
}

/// Identity unit that records lifecycle calls and can misbehave
#[derive(Default)]
struct Tracker {
    prepared: AtomicUsize,
    released: AtomicUsize,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    batches: Mutex<Vec<usize>>,
    /// Batches above this size fail with a resource error
    limit: Option<usize>,
    /// Cancel this token on the given call
    cancel_at: Option<(usize, CancellationToken)>,
    /// Report running on an accelerator
    accelerator: bool,
}

impl InferenceUnit for Tracker {
    fn forward(&self, batch: &Array3<f32>) -> SeparationResult<Array4<f32>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        thread::yield_now();

        let items = batch.len_of(Axis(0));
        self.batches.lock().push(items);
        let result = match self.limit {
            Some(limit) if items > limit => Err(SeparationError::ResourceExhausted {
                reason: format!("{} items", items),
            }),
            _ => Ok(batch.clone().insert_axis(Axis(1))),
        };

        if let Some((at, token)) = &self.cancel_at {
            if call == *at {
                token.cancel();
            }
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn prepare(&self, _preference: DevicePreference) -> SeparationResult<Device> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        Ok(if self.accelerator {
            Device::Accelerator(0)
        } else {
            Device::Cpu
        })
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Identity unit that refuses to run while released
#[derive(Default)]
struct Leased {
    live: AtomicBool,
    prepared: AtomicUsize,
    released: AtomicUsize,
}

impl InferenceUnit for Leased {
    fn forward(&self, batch: &Array3<f32>) -> SeparationResult<Array4<f32>> {
        if !self.live.load(Ordering::SeqCst) {
            return Err(SeparationError::InferenceFailed {
                reason: "forward on a released unit".into(),
            });
        }
        Ok(batch.clone().insert_axis(Axis(1)))
    }

    fn prepare(&self, _preference: DevicePreference) -> SeparationResult<Device> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        self.live.store(true, Ordering::SeqCst);
        Ok(Device::Cpu)
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.live.store(false, Ordering::SeqCst);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

fn test_signal(channels: usize, len: usize, rate: u32) -> Waveform {
    let data = Array2::from_shape_fn((channels, len), |(c, i)| {
        let t = i as f32 / rate as f32;
        0.5 * (2.0 * std::f32::consts::PI * (220.0 + 110.0 * c as f32) * t).sin()
            + 0.1 * ((i * 7919 + c * 31) % 101) as f32 / 101.0
    });
    Waveform::new(data, rate)
}

fn identity_info(name: &str, rate: u32, channels: usize, segment: usize) -> ModelInfo {
    ModelInfo::new(name, rate, channels, segment, &["mix"])
}

fn separator_with(register: impl FnOnce(&InMemoryRepository)) -> Separator {
    let repo = InMemoryRepository::new();
    register(&repo);
    Separator::new(Arc::new(repo))
}

fn assert_waveforms_close(a: &Waveform, b: &Waveform, tolerance: f32) {
    assert_eq!(a.channels(), b.channels());
    assert_eq!(a.len(), b.len());
    for (x, y) in a.data().iter().zip(b.data().iter()) {
        assert_abs_diff_eq!(*x, *y, epsilon = tolerance);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECONSTRUCTION
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_identity_model_reconstructs_input() {
    let sep = separator_with(|repo| {
        repo.register_unit(identity_info("identity", 8000, 2, 512), Arc::new(Gains(vec![1.0])))
            .unwrap();
    });

    for &len in &[1usize, 100, 512, 513, 3000, 8191] {
        for &overlap in &[0.0f32, 0.1, 0.25, 0.5, 0.75] {
            for fade in [FadeShape::Linear, FadeShape::RaisedCosine] {
                let input = test_signal(2, len, 8000);
                let options = SeparationOptions::default()
                    .with_shifts(2)
                    .with_overlap(overlap)
                    .with_fade(fade);
                let out = sep.separate(&input, &["identity"], &options).unwrap();
                assert_waveforms_close(out.get("mix").unwrap(), &input, 1e-5);
            }
        }
    }
}

#[test]
fn test_per_track_normalization_is_undone() {
    let sep = separator_with(|repo| {
        let info = identity_info("norm", 8000, 2, 256).with_normalization(Normalization::PerTrack);
        repo.register_unit(info, Arc::new(Gains(vec![1.0]))).unwrap();
    });

    let input = test_signal(2, 2000, 8000);
    let out = sep
        .separate(&input, &["norm"], &SeparationOptions::default().with_shifts(0))
        .unwrap();
    assert_waveforms_close(out.get("mix").unwrap(), &input, 1e-4);
}

#[test]
fn test_ten_seconds_four_sources() {
    let sep = separator_with(|repo| {
        let info = ModelInfo::new("four", 44100, 2, 176_400, &["drums", "bass", "other", "vocals"]);
        repo.register_unit(info, Arc::new(Gains(vec![0.1, 0.2, 0.3, 0.4])))
            .unwrap();
    });

    let input = test_signal(2, 441_000, 44100);
    let options = SeparationOptions::default().with_shifts(0).with_overlap(0.25);
    let out = sep.separate(&input, &["four"], &options).unwrap();

    assert_eq!(out.labels(), &["drums", "bass", "other", "vocals"]);
    for (_, stem) in out.iter() {
        assert_eq!(stem.len(), 441_000);
        assert_eq!(stem.channels(), 2);
        assert_eq!(stem.sample_rate(), 44100);
    }
    assert_abs_diff_eq!(
        out.get("vocals").unwrap().data()[[1, 300_000]],
        0.4 * input.data()[[1, 300_000]],
        epsilon = 1e-5
    );
}

#[test]
fn test_input_shorter_than_segment() {
    let sep = separator_with(|repo| {
        let info = ModelInfo::new("pair", 8000, 2, 4096, &["a", "b"]);
        repo.register_unit(info, Arc::new(Gains(vec![0.5, 0.5]))).unwrap();
    });

    let input = test_signal(2, 1234, 8000);
    let out = sep
        .separate(&input, &["pair"], &SeparationOptions::default())
        .unwrap();
    assert_eq!(out.samples(), 1234);
    assert_eq!(out.stats.segments_processed, 1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// DETERMINISM
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_repeated_runs_are_bit_identical() {
    let sep = separator_with(|repo| {
        repo.register_unit(identity_info("pos", 8000, 2, 300), Arc::new(Positional))
            .unwrap();
    });
    let input = test_signal(2, 5000, 8000);
    let options = SeparationOptions::default().with_shifts(0);

    let a = sep.separate(&input, &["pos"], &options).unwrap();
    let b = sep.separate(&input, &["pos"], &options).unwrap();
    assert_eq!(a.get("mix").unwrap(), b.get("mix").unwrap());
}

#[test]
fn test_seeded_shifts_are_reproducible() {
    let sep = separator_with(|repo| {
        repo.register_unit(identity_info("pos", 8000, 2, 300), Arc::new(Positional))
            .unwrap();
    });
    let input = test_signal(2, 5000, 8000);
    let options = SeparationOptions::default().with_shifts(3).with_seed(11);

    let a = sep.separate(&input, &["pos"], &options).unwrap();
    let b = sep.separate(&input, &["pos"], &options).unwrap();
    assert_eq!(a.get("mix").unwrap(), b.get("mix").unwrap());

    let c = sep
        .separate(&input, &["pos"], &options.clone().with_seed(12))
        .unwrap();
    assert_ne!(a.get("mix").unwrap(), c.get("mix").unwrap());
}

#[test]
fn test_streaming_matches_unbounded() {
    let sep = separator_with(|repo| {
        repo.register_unit(identity_info("pos", 8000, 2, 256), Arc::new(Positional))
            .unwrap();
    });
    let input = test_signal(2, 6000, 8000);
    let options = SeparationOptions::default()
        .with_shifts(2)
        .with_seed(5)
        .with_batch_size(12);

    let unbounded = sep.separate(&input, &["pos"], &options).unwrap();
    let streamed = sep
        .separate(&input, &["pos"], &options.clone().with_memory_budget(20_000))
        .unwrap();
    assert_eq!(unbounded.get("mix").unwrap(), streamed.get("mix").unwrap());
    assert!(streamed.stats.inference_calls > unbounded.stats.inference_calls);
}

#[test]
fn test_parallel_models_match_sequential() {
    let sep = separator_with(|repo| {
        repo.register_unit(identity_info("p1", 8000, 2, 256), Arc::new(Positional))
            .unwrap();
        repo.register_unit(identity_info("p2", 8000, 2, 200), Arc::new(Positional))
            .unwrap();
    });
    let input = test_signal(2, 4000, 8000);
    let options = SeparationOptions::default().with_shifts(1).with_seed(3);

    let sequential = sep.separate(&input, &["p1", "p2"], &options).unwrap();
    let parallel = sep
        .separate(&input, &["p1", "p2"], &options.clone().with_parallel_models(true))
        .unwrap();
    assert_eq!(sequential.get("mix").unwrap(), parallel.get("mix").unwrap());
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENSEMBLING
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_self_ensemble_equals_single_run() {
    let sep = separator_with(|repo| {
        repo.register_unit(identity_info("pos", 8000, 2, 256), Arc::new(Positional))
            .unwrap();
    });
    let input = test_signal(2, 3000, 8000);
    let options = SeparationOptions::default().with_shifts(0);

    let single = sep.separate(&input, &["pos"], &options).unwrap();
    let doubled = sep.separate(&input, &["pos", "pos"], &options).unwrap();
    assert_eq!(single.get("mix").unwrap(), doubled.get("mix").unwrap());
}

#[test]
fn test_self_ensemble_with_shifts_equals_single_run() {
    let sep = separator_with(|repo| {
        repo.register_unit(identity_info("pos", 8000, 2, 256), Arc::new(Positional))
            .unwrap();
    });
    let input = test_signal(2, 3000, 8000);

    for options in [
        SeparationOptions::default(),
        SeparationOptions::default().with_shifts(3).with_seed(21),
        SeparationOptions::default()
            .with_shifts(3)
            .with_seed(21)
            .with_parallel_models(true),
    ] {
        let single = sep.separate(&input, &["pos"], &options).unwrap();
        let doubled = sep.separate(&input, &["pos", "pos"], &options).unwrap();
        assert_eq!(single.get("mix").unwrap(), doubled.get("mix").unwrap());
    }
}

#[test]
fn test_weighted_ensemble() {
    let sep = separator_with(|repo| {
        repo.register_unit(
            ModelInfo::new("loud", 8000, 1, 128, &["x", "y"]),
            Arc::new(Gains(vec![1.0, 1.0])),
        )
        .unwrap();
        repo.register_unit(
            ModelInfo::new("quiet", 8000, 1, 128, &["y", "x"]),
            Arc::new(Gains(vec![0.0, 0.0])),
        )
        .unwrap();
    });
    let input = test_signal(1, 1000, 8000);
    let weights = EnsembleWeights::new()
        .with_model("loud", 3.0)
        .with_source("quiet", "y", 0.0);
    let options = SeparationOptions::default().with_shifts(0).with_weights(weights);

    let out = sep.separate(&input, &["loud", "quiet"], &options).unwrap();
    let x = input.data()[[0, 500]];
    // x: 3/(3+1), y: quiet has zero weight
    assert_abs_diff_eq!(out.get("x").unwrap().data()[[0, 500]], 0.75 * x, epsilon = 1e-5);
    assert_abs_diff_eq!(out.get("y").unwrap().data()[[0, 500]], x, epsilon = 1e-5);
}

#[test]
fn test_source_mismatch_fails_before_inference() {
    let tracker = Arc::new(Tracker::default());
    let sep = separator_with(|repo| {
        repo.register_unit(identity_info("tracker", 8000, 2, 128), tracker.clone())
            .unwrap();
        repo.register_unit(
            ModelInfo::new("other", 8000, 2, 128, &["a", "b"]),
            Arc::new(Gains(vec![1.0, 0.0])),
        )
        .unwrap();
    });

    let err = sep
        .separate(&test_signal(2, 500, 8000), &["tracker", "other"], &SeparationOptions::default())
        .unwrap_err();
    assert!(matches!(err, SeparationError::IncompatibleModel { .. }));
    assert_eq!(tracker.prepared.load(Ordering::SeqCst), 0);
}

// ═══════════════════════════════════════════════════════════════════════════════
// ERRORS AND RESOURCES
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_unknown_model_prepares_nothing() {
    let tracker = Arc::new(Tracker::default());
    let sep = separator_with(|repo| {
        repo.register_unit(identity_info("tracker", 8000, 2, 128), tracker.clone())
            .unwrap();
    });

    let err = sep
        .separate(&test_signal(2, 500, 8000), &["tracker", "ghost"], &SeparationOptions::default())
        .unwrap_err();
    assert!(matches!(err, SeparationError::ModelNotFound { ref name } if name == "ghost"));
    assert_eq!(tracker.prepared.load(Ordering::SeqCst), 0);
    assert_eq!(tracker.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_invalid_options_fail_fast() {
    let tracker = Arc::new(Tracker::default());
    let sep = separator_with(|repo| {
        repo.register_unit(identity_info("tracker", 8000, 2, 128), tracker.clone())
            .unwrap();
    });

    let options = SeparationOptions::default().with_overlap(1.5);
    let err = sep
        .separate(&test_signal(2, 500, 8000), &["tracker"], &options)
        .unwrap_err();
    assert!(matches!(err, SeparationError::Configuration { .. }));
    assert_eq!(tracker.prepared.load(Ordering::SeqCst), 0);
}

#[test]
fn test_resource_exhaustion_halves_batches() {
    let tracker = Arc::new(Tracker {
        limit: Some(2),
        ..Tracker::default()
    });
    let sep = separator_with(|repo| {
        repo.register_unit(identity_info("tracker", 8000, 2, 128), tracker.clone())
            .unwrap();
    });

    let input = test_signal(2, 2000, 8000);
    let options = SeparationOptions::default().with_shifts(0).with_batch_size(8);
    let out = sep.separate(&input, &["tracker"], &options).unwrap();

    assert_waveforms_close(out.get("mix").unwrap(), &input, 1e-5);
    let batches = tracker.batches.lock().clone();
    assert_eq!(&batches[..3], &[8, 4, 2]);
    // once shrunk, the smaller batch size sticks
    assert!(batches[3..].iter().all(|&b| b <= 2));
    assert_eq!(tracker.released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_resource_exhaustion_at_single_item_propagates() {
    let tracker = Arc::new(Tracker {
        limit: Some(0),
        ..Tracker::default()
    });
    let sep = separator_with(|repo| {
        repo.register_unit(identity_info("tracker", 8000, 2, 128), tracker.clone())
            .unwrap();
    });

    let options = SeparationOptions::default().with_shifts(0).with_batch_size(4);
    let err = sep
        .separate(&test_signal(2, 1000, 8000), &["tracker"], &options)
        .unwrap_err();
    assert!(err.is_resource_exhausted());
    assert_eq!(tracker.released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_shift_copies_respect_batch_size() {
    let tracker = Arc::new(Tracker::default());
    let sep = separator_with(|repo| {
        repo.register_unit(identity_info("tracker", 8000, 2, 128), tracker.clone())
            .unwrap();
    });

    let input = test_signal(2, 1000, 8000);
    let options = SeparationOptions::default().with_shifts(3).with_batch_size(2);
    let out = sep.separate(&input, &["tracker"], &options).unwrap();

    assert_waveforms_close(out.get("mix").unwrap(), &input, 1e-5);
    let batches = tracker.batches.lock();
    assert!(batches.iter().all(|&b| b <= 2));
    assert_eq!(batches.iter().sum::<usize>(), 4 * out.stats.segments_processed);
}

#[test]
fn test_cancellation_inside_split_batch() {
    let token = CancellationToken::new();
    let tracker = Arc::new(Tracker {
        limit: Some(2),
        cancel_at: Some((3, token.clone())),
        ..Tracker::default()
    });
    let sep = separator_with(|repo| {
        repo.register_unit(identity_info("tracker", 8000, 2, 128), tracker.clone())
            .unwrap();
    });

    let options = SeparationOptions::default()
        .with_shifts(0)
        .with_batch_size(8)
        .with_cancel(token);
    let err = sep
        .separate(&test_signal(2, 2000, 8000), &["tracker"], &options)
        .unwrap_err();

    // 8 and 4 fail, the first pair succeeds, then the remaining pairs are skipped
    assert!(matches!(err, SeparationError::Cancelled));
    assert_eq!(*tracker.batches.lock(), vec![8, 4, 2]);
    assert_eq!(tracker.released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_overlapping_calls_share_one_preparation() {
    let unit = Arc::new(Leased::default());
    let sep = Arc::new(separator_with(|repo| {
        repo.register_unit(identity_info("leased", 8000, 2, 128), unit.clone())
            .unwrap();
    }));

    // a second, shorter separation starts and finishes while the first is mid-run
    let inner = Arc::new(Mutex::new(None));
    let (nested, slot) = (sep.clone(), inner.clone());
    let options = SeparationOptions::default()
        .with_shifts(0)
        .with_progress(move |p| {
            if p.segments_done == 1 {
                let short = SeparationOptions::default().with_shifts(0);
                *slot.lock() = Some(nested.separate(&test_signal(2, 300, 8000), &["leased"], &short));
            }
        });

    let input = test_signal(2, 4000, 8000);
    let out = sep.separate(&input, &["leased"], &options).unwrap();
    assert_waveforms_close(out.get("mix").unwrap(), &input, 1e-5);

    let short = inner.lock().take().unwrap().unwrap();
    assert_eq!(short.samples(), 300);
    assert_eq!(unit.prepared.load(Ordering::SeqCst), 1);
    assert_eq!(unit.released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cancellation_releases_device() {
    let token = CancellationToken::new();
    let tracker = Arc::new(Tracker {
        cancel_at: Some((2, token.clone())),
        ..Tracker::default()
    });
    let sep = separator_with(|repo| {
        repo.register_unit(identity_info("tracker", 8000, 2, 128), tracker.clone())
            .unwrap();
    });

    let options = SeparationOptions::default()
        .with_shifts(0)
        .with_cancel(token.clone());
    let err = sep
        .separate(&test_signal(2, 4000, 8000), &["tracker"], &options)
        .unwrap_err();

    assert!(matches!(err, SeparationError::Cancelled));
    assert_eq!(tracker.calls.load(Ordering::SeqCst), 2);
    assert_eq!(tracker.prepared.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_accelerator_calls_never_overlap() {
    let tracker = Arc::new(Tracker {
        accelerator: true,
        ..Tracker::default()
    });
    let sep = Arc::new(separator_with(|repo| {
        repo.register_unit(identity_info("gpu", 8000, 2, 64), tracker.clone())
            .unwrap();
    }));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let sep = sep.clone();
            thread::spawn(move || {
                let options = SeparationOptions::default()
                    .with_seed(i)
                    .with_shifts(1)
                    .with_parallel_models(true);
                sep.separate(&test_signal(2, 2000, 8000), &["gpu", "gpu"], &options)
                    .map(|out| out.samples())
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap().unwrap(), 2000);
    }
    assert_eq!(tracker.peak.load(Ordering::SeqCst), 1);
    assert_eq!(
        tracker.prepared.load(Ordering::SeqCst),
        tracker.released.load(Ordering::SeqCst)
    );
}

// ═══════════════════════════════════════════════════════════════════════════════
// FORMAT MISMATCH
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_mismatch_fail_policy() {
    let sep = separator_with(|repo| {
        repo.register_unit(identity_info("hifi", 44100, 2, 4096), Arc::new(Gains(vec![1.0])))
            .unwrap();
    });
    let options = SeparationOptions::default().with_mismatch(MismatchPolicy::Fail);

    let err = sep
        .separate(&test_signal(2, 5000, 22050), &["hifi"], &options)
        .unwrap_err();
    assert!(matches!(err, SeparationError::IncompatibleModel { .. }));

    let err = sep
        .separate(&test_signal(1, 5000, 44100), &["hifi"], &options)
        .unwrap_err();
    assert!(matches!(err, SeparationError::IncompatibleModel { .. }));
}

#[test]
fn test_mismatch_convert_policy() {
    let sep = separator_with(|repo| {
        repo.register_unit(identity_info("hifi", 44100, 2, 4096), Arc::new(Gains(vec![1.0])))
            .unwrap();
    });
    let options = SeparationOptions::default()
        .with_shifts(0)
        .with_mismatch(MismatchPolicy::Convert);

    let input = test_signal(1, 11025, 22050);
    let out = sep.separate(&input, &["hifi"], &options).unwrap();
    let mix = out.get("mix").unwrap();

    assert_eq!(mix.sample_rate(), 22050);
    assert_eq!(mix.channels(), 1);
    assert_eq!(mix.len(), 11025);
    assert_eq!(out.sample_rate, 22050);
}

#[test]
fn test_unmappable_channels_rejected() {
    let sep = separator_with(|repo| {
        repo.register_unit(identity_info("surround", 8000, 6, 128), Arc::new(Gains(vec![1.0])))
            .unwrap();
    });
    let err = sep
        .separate(&test_signal(2, 500, 8000), &["surround"], &SeparationOptions::default())
        .unwrap_err();
    assert!(matches!(err, SeparationError::IncompatibleModel { .. }));
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROGRESS AND FILES
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_progress_reports_every_batch() {
    let sep = separator_with(|repo| {
        repo.register_unit(identity_info("identity", 8000, 2, 256), Arc::new(Gains(vec![1.0])))
            .unwrap();
    });
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let options = SeparationOptions::default()
        .with_shifts(0)
        .with_progress(move |p| sink.lock().push((p.segments_done, p.segments_total)));

    sep.separate(&test_signal(2, 3000, 8000), &["identity"], &options)
        .unwrap();

    let seen = seen.lock();
    let (done, total) = *seen.last().unwrap();
    assert_eq!(done, total);
    assert_eq!(seen.len(), total);
    assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
}

#[test]
fn test_separate_file_and_write_stems() {
    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("song.wav");
    let input = test_signal(2, 4000, 8000);
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: 8000,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&input_path, spec).unwrap();
    for sample in input.to_interleaved() {
        writer.write_sample(sample).unwrap();
    }
    writer.finalize().unwrap();

    let sep = separator_with(|repo| {
        let info = ModelInfo::new("pair", 8000, 2, 512, &["vocals", "rest"]);
        repo.register_unit(info, Arc::new(Gains(vec![0.25, 0.75]))).unwrap();
    });
    let out = sep
        .separate_file(&input_path, &["pair"], &SeparationOptions::default())
        .unwrap();
    assert_eq!(out.samples(), 4000);

    let split = out.two_stems("vocals").unwrap();
    let written = split
        .write_all(&FileAudioIo, &dir.path().join("stems"), "song", &WriteOptions::default())
        .unwrap();

    assert_eq!(written.len(), 2);
    assert!(written[0].ends_with("song/vocals.wav"));
    assert!(written[1].ends_with("song/no_vocals.wav"));
    let reader = hound::WavReader::open(&written[1]).unwrap();
    assert_eq!(reader.spec().sample_rate, 8000);
    assert_eq!(reader.duration(), 4000);
}

#[test]
fn test_repository_is_shared() {
    let repo = Arc::new(InMemoryRepository::new());
    repo.register_unit(identity_info("identity", 8000, 2, 64), Arc::new(Gains(vec![1.0])))
        .unwrap();
    let sep = Separator::new(repo.clone());

    let loaded = sep.preload(&["identity"]).unwrap();
    assert!(loaded[0].same_model(&repo.resolve("identity").unwrap()));
    assert!(sep.preload(&["missing"]).is_err());
}
