//! Inference backends and device placement
//!
//! ONNX graphs run through tract (pure Rust, CPU). Accelerator-backed networks
//! plug in through [`InferenceUnit`](crate::model::InferenceUnit) and report the
//! device they were placed on from `prepare`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{Array3, Array4};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tract_onnx::prelude::*;

use crate::error::{SeparationError, SeparationResult};
use crate::model::InferenceUnit;

/// Where a separation call would like inference to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    /// Accelerator when the model supports one, otherwise CPU
    #[default]
    Auto,
    /// Host CPU
    Cpu,
    /// Specific accelerator
    Accelerator(u32),
}

impl std::str::FromStr for DevicePreference {
    type Err = SeparationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            other => {
                let id = other
                    .strip_prefix("accel:")
                    .or_else(|| other.strip_prefix("gpu:"))
                    .and_then(|id| id.parse().ok())
                    .ok_or_else(|| {
                        SeparationError::config(format!(
                            "unknown device '{}', expected auto, cpu or accel:<id>",
                            other
                        ))
                    })?;
                Ok(Self::Accelerator(id))
            }
        }
    }
}

/// Device a model was actually placed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Accelerator(u32),
}

impl Device {
    /// True for accelerators
    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Accelerator(_))
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accelerator(id) => write!(f, "accel:{}", id),
        }
    }
}

/// Serializes inference per accelerator
///
/// Each accelerator id gets one lane; holding the lane guard is the only way
/// to run a forward pass on that device. CPU work is never queued.
#[derive(Debug, Default)]
pub struct DeviceQueue {
    lanes: Mutex<HashMap<u32, Arc<Mutex<()>>>>,
}

impl DeviceQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with exclusive use of `device`
    pub fn run<T>(&self, device: Device, f: impl FnOnce() -> T) -> T {
        match device {
            Device::Cpu => f(),
            Device::Accelerator(id) => {
                let lane = self.lanes.lock().entry(id).or_default().clone();
                let _guard = lane.lock();
                f()
            }
        }
    }
}

/// Optimized runnable tract plan
type TractPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// ONNX separation network executed with tract
///
/// Graphs are specialized per input geometry; plans are built on first use
/// and cached for the lifetime of the model.
pub struct OnnxModel {
    path: PathBuf,
    graph: InferenceModel,
    channels: usize,
    plans: Mutex<HashMap<(usize, usize), Arc<TractPlan>>>,
}

impl OnnxModel {
    /// Load and verify an ONNX graph for the given input geometry
    pub fn load<P: AsRef<Path>>(
        path: P,
        channels: usize,
        segment_samples: usize,
    ) -> SeparationResult<Self> {
        let path = path.as_ref();
        let load_err = |reason: String| SeparationError::ModelLoad {
            name: path.display().to_string(),
            reason,
        };

        if !path.exists() {
            return Err(load_err("weights file does not exist".into()));
        }

        let graph = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(|e| load_err(e.to_string()))?;

        let model = Self {
            path: path.to_path_buf(),
            graph,
            channels,
            plans: Mutex::new(HashMap::new()),
        };

        // A graph that cannot be specialized for one item is unusable
        model
            .plan(1, segment_samples)
            .map_err(|e| load_err(e.to_string()))?;

        log::info!(
            "Loaded ONNX model {} ({} ch, {} samples/segment)",
            path.display(),
            channels,
            segment_samples
        );

        Ok(model)
    }

    /// Weights path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn plan(&self, batch: usize, samples: usize) -> TractResult<Arc<TractPlan>> {
        let mut plans = self.plans.lock();
        if let Some(plan) = plans.get(&(batch, samples)) {
            return Ok(plan.clone());
        }

        let plan = self
            .graph
            .clone()
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(batch, self.channels, samples),
                ),
            )?
            .into_optimized()?
            .into_runnable()?;

        let plan = Arc::new(plan);
        plans.insert((batch, samples), plan.clone());
        log::debug!("Built tract plan for {} x {} samples", batch, samples);
        Ok(plan)
    }
}

impl InferenceUnit for OnnxModel {
    fn forward(&self, batch: &Array3<f32>) -> SeparationResult<Array4<f32>> {
        let (items, channels, samples) = batch.dim();
        let failed = |e: TractError| SeparationError::InferenceFailed {
            reason: e.to_string(),
        };

        let plan = self.plan(items, samples).map_err(failed)?;

        let contiguous = batch.as_standard_layout();
        let data = contiguous.as_slice().ok_or_else(|| SeparationError::InferenceFailed {
            reason: "input batch is not contiguous".into(),
        })?;
        let input = Tensor::from_shape(&[items, channels, samples], data).map_err(failed)?;

        let outputs = plan.run(tvec!(input.into())).map_err(failed)?;
        let output = outputs.first().ok_or_else(|| SeparationError::InferenceFailed {
            reason: "No output from model".into(),
        })?;

        let shape = output.shape().to_vec();
        if shape.len() != 4 {
            return Err(SeparationError::InvalidOutputShape {
                expected: "4D tensor [batch, sources, channels, samples]".into(),
                got: format!("{}D tensor {:?}", shape.len(), shape),
            });
        }

        let values = output.as_slice::<f32>().map_err(failed)?.to_vec();
        Array4::from_shape_vec((shape[0], shape[1], shape[2], shape[3]), values).map_err(|e| {
            SeparationError::InferenceFailed {
                reason: format!("Shape conversion failed: {}", e),
            }
        })
    }

    fn prepare(&self, preference: DevicePreference) -> SeparationResult<Device> {
        if let DevicePreference::Accelerator(id) = preference {
            log::warn!(
                "{}: tract runs on CPU only, ignoring accelerator {}",
                self.path.display(),
                id
            );
        }
        Ok(Device::Cpu)
    }
}
