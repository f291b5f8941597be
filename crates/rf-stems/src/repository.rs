//! Model repositories
//!
//! A repository turns a model name into a loaded [`ModelDescriptor`], or into a
//! [`BagOfModels`] that the separator expands into its members.
//!
//! [`LocalRepository`] reads a directory of JSON manifests:
//!
//! ```text
//! models/
//!   htdemucs.json      {"kind": "model", "sample_rate": 44100, ...}
//!   htdemucs.onnx
//!   mdx_bag.json       {"kind": "bag", "models": ["a", "b"], "weights": [[...], [...]]}
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{SeparationError, SeparationResult};
use crate::inference::OnnxModel;
use crate::model::{InferenceUnit, ModelBackend, ModelDescriptor, ModelInfo, Normalization};

/// Several models averaged together under one name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BagOfModels {
    /// Member model names, resolved through the same repository
    pub models: Vec<String>,

    /// Per-member, per-source weights in each member's source order
    /// (empty = uniform)
    #[serde(default)]
    pub weights: Vec<Vec<f32>>,

    /// Segment length override for every member, seconds
    #[serde(default)]
    pub segment_secs: Option<f32>,
}

impl BagOfModels {
    /// Uniformly weighted bag
    pub fn new(models: &[&str]) -> Self {
        Self {
            models: models.iter().map(|s| s.to_string()).collect(),
            weights: Vec::new(),
            segment_secs: None,
        }
    }

    /// Set per-member weights
    pub fn with_weights(mut self, weights: Vec<Vec<f32>>) -> Self {
        self.weights = weights;
        self
    }

    /// Set the segment override
    pub fn with_segment_secs(mut self, secs: f32) -> Self {
        self.segment_secs = Some(secs);
        self
    }

    /// Weights of member `index`, if given
    pub fn member_weights(&self, index: usize) -> Option<&[f32]> {
        self.weights.get(index).map(Vec::as_slice)
    }

    fn validate(&self, name: &str) -> SeparationResult<()> {
        let fail = |reason: String| SeparationError::ModelLoad {
            name: name.to_string(),
            reason,
        };
        if self.models.is_empty() {
            return Err(fail("bag has no members".into()));
        }
        if !self.weights.is_empty() && self.weights.len() != self.models.len() {
            return Err(fail(format!(
                "{} weight rows for {} models",
                self.weights.len(),
                self.models.len()
            )));
        }
        if self.weights.iter().flatten().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(fail("bag weights must be finite and non-negative".into()));
        }
        Ok(())
    }
}

/// Source of separation models
pub trait ModelRepository: Send + Sync {
    /// Load a single model by name
    fn resolve(&self, name: &str) -> SeparationResult<ModelDescriptor>;

    /// Bag of models registered under `name`, if any
    fn bag(&self, name: &str) -> SeparationResult<Option<BagOfModels>> {
        let _ = name;
        Ok(None)
    }

    /// Names this repository can resolve
    fn list(&self) -> Vec<String>;
}

/// A resolved model name
#[derive(Debug, Clone)]
pub enum ModelSelection {
    /// One model
    Single(ModelDescriptor),
    /// A bag and its resolved members, in bag order
    Bag {
        bag: BagOfModels,
        members: Vec<ModelDescriptor>,
    },
}

impl ModelSelection {
    /// Loaded models behind this selection
    pub fn models(&self) -> &[ModelDescriptor] {
        match self {
            ModelSelection::Single(model) => std::slice::from_ref(model),
            ModelSelection::Bag { members, .. } => members,
        }
    }
}

/// Resolve `name` to a single model or an expanded bag of models
pub fn select_model(repository: &dyn ModelRepository, name: &str) -> SeparationResult<ModelSelection> {
    let Some(bag) = repository.bag(name)? else {
        let model = repository.resolve(name)?;
        log::debug!("Selected model {}", model.name());
        return Ok(ModelSelection::Single(model));
    };

    let members = bag
        .models
        .iter()
        .map(|member| repository.resolve(member))
        .collect::<SeparationResult<Vec<_>>>()?;

    for (index, member) in members.iter().enumerate() {
        if let Some(row) = bag.member_weights(index) {
            if row.len() != member.num_sources() {
                return Err(SeparationError::ModelLoad {
                    name: name.to_string(),
                    reason: format!(
                        "{} weights for {} sources of {}",
                        row.len(),
                        member.num_sources(),
                        member.name()
                    ),
                });
            }
        }
    }

    log::debug!("Selected bag {} with {} models", name, members.len());
    Ok(ModelSelection::Bag { bag, members })
}

// ═══════════════════════════════════════════════════════════════════════════════
// IN-MEMORY REPOSITORY
// ═══════════════════════════════════════════════════════════════════════════════

/// Registry of already-loaded models
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    models: RwLock<HashMap<String, ModelDescriptor>>,
    bags: RwLock<HashMap<String, BagOfModels>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor under its own name
    pub fn register(&self, descriptor: ModelDescriptor) {
        self.models
            .write()
            .insert(descriptor.name().to_string(), descriptor);
    }

    /// Register a caller-provided network
    pub fn register_unit(
        &self,
        info: ModelInfo,
        unit: Arc<dyn InferenceUnit>,
    ) -> SeparationResult<ModelDescriptor> {
        let descriptor = ModelDescriptor::from_unit(info, unit)?;
        self.register(descriptor.clone());
        Ok(descriptor)
    }

    /// Register a bag of models
    pub fn register_bag(&self, name: impl Into<String>, bag: BagOfModels) -> SeparationResult<()> {
        let name = name.into();
        bag.validate(&name)?;
        self.bags.write().insert(name, bag);
        Ok(())
    }
}

impl ModelRepository for InMemoryRepository {
    fn resolve(&self, name: &str) -> SeparationResult<ModelDescriptor> {
        self.models
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SeparationError::ModelNotFound {
                name: name.to_string(),
            })
    }

    fn bag(&self, name: &str) -> SeparationResult<Option<BagOfModels>> {
        Ok(self.bags.read().get(name).cloned())
    }

    fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .models
            .read()
            .keys()
            .chain(self.bags.read().keys())
            .cloned()
            .collect();
        names.sort();
        names
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOCAL DIRECTORY REPOSITORY
// ═══════════════════════════════════════════════════════════════════════════════

/// Manifest for one ONNX model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    /// Graph file relative to the manifest (default `<name>.onnx`)
    #[serde(default)]
    pub onnx: Option<String>,
    pub sample_rate: u32,
    pub channels: usize,
    pub segment_samples: usize,
    pub sources: Vec<String>,
    #[serde(default)]
    pub normalization: Normalization,
    #[serde(default)]
    pub overlap: Option<f32>,
    #[serde(default)]
    pub fixed_segment: bool,
}

impl ModelManifest {
    fn into_info(self, name: &str) -> ModelInfo {
        let sources: Vec<&str> = self.sources.iter().map(String::as_str).collect();
        let info = ModelInfo::new(name, self.sample_rate, self.channels, self.segment_samples, &sources)
            .with_normalization(self.normalization)
            .with_fixed_segment(self.fixed_segment);
        match self.overlap {
            Some(overlap) => info.with_overlap(overlap),
            None => info,
        }
    }
}

/// Contents of `<name>.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Manifest {
    Model(ModelManifest),
    Bag(BagOfModels),
}

/// Directory of JSON manifests and ONNX graphs
///
/// Loaded models are cached, so resolving a name twice shares one graph.
pub struct LocalRepository {
    root: PathBuf,
    loaded: Mutex<HashMap<String, ModelDescriptor>>,
}

impl LocalRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    /// Repository directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifest_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.json", name))
    }

    /// Parse `<name>.json`
    pub fn manifest(&self, name: &str) -> SeparationResult<Manifest> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(SeparationError::ModelNotFound {
                name: name.to_string(),
            });
        }

        let path = self.manifest_path(name);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SeparationError::ModelNotFound {
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(SeparationError::Io(e)),
        };

        serde_json::from_str(&text).map_err(|e| SeparationError::ModelLoad {
            name: name.to_string(),
            reason: format!("{}: {}", path.display(), e),
        })
    }
}

impl ModelRepository for LocalRepository {
    fn resolve(&self, name: &str) -> SeparationResult<ModelDescriptor> {
        if let Some(descriptor) = self.loaded.lock().get(name) {
            return Ok(descriptor.clone());
        }

        let manifest = match self.manifest(name)? {
            Manifest::Model(manifest) => manifest,
            Manifest::Bag(_) => {
                return Err(SeparationError::ModelLoad {
                    name: name.to_string(),
                    reason: "is a bag of models, not a single model".into(),
                });
            }
        };

        let onnx = self.root.join(
            manifest
                .onnx
                .clone()
                .unwrap_or_else(|| format!("{}.onnx", name)),
        );
        let model = OnnxModel::load(&onnx, manifest.channels, manifest.segment_samples).map_err(
            |e| SeparationError::ModelLoad {
                name: name.to_string(),
                reason: e.to_string(),
            },
        )?;

        let descriptor = ModelDescriptor::new(manifest.into_info(name), ModelBackend::Onnx(model))?;
        self.loaded
            .lock()
            .insert(name.to_string(), descriptor.clone());
        Ok(descriptor)
    }

    fn bag(&self, name: &str) -> SeparationResult<Option<BagOfModels>> {
        match self.manifest(name) {
            Ok(Manifest::Bag(bag)) => {
                bag.validate(name)?;
                Ok(Some(bag))
            }
            Ok(Manifest::Model(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn list(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(String::from))
            .collect();
        names.sort();
        names
    }
}
