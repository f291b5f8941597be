//! Weighted multi-model ensembling

use std::collections::{HashMap, HashSet};

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::stems::SeparatedSources;
use crate::error::{SeparationError, SeparationResult};
use crate::waveform::Waveform;

/// User weights per model and optionally per (model, source)
///
/// Missing entries weigh 1.0. Weights need not sum to one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnsembleWeights {
    /// Scalar weight per model name
    #[serde(default)]
    pub models: HashMap<String, f32>,

    /// Per-source weights, overriding the model scalar
    #[serde(default)]
    pub sources: HashMap<String, HashMap<String, f32>>,
}

impl EnsembleWeights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Weight every source of `model`
    pub fn with_model(mut self, model: impl Into<String>, weight: f32) -> Self {
        self.models.insert(model.into(), weight);
        self
    }

    /// Weight one source of `model`
    pub fn with_source(
        mut self,
        model: impl Into<String>,
        source: impl Into<String>,
        weight: f32,
    ) -> Self {
        self.sources
            .entry(model.into())
            .or_default()
            .insert(source.into(), weight);
        self
    }

    /// Effective weight of `source` from `model`
    pub fn weight(&self, model: &str, source: &str) -> f32 {
        self.sources
            .get(model)
            .and_then(|s| s.get(source))
            .or_else(|| self.models.get(model))
            .copied()
            .unwrap_or(1.0)
    }

    /// All weights must be finite and non-negative
    pub fn validate(&self) -> SeparationResult<()> {
        let scalars = self.models.iter().map(|(m, w)| (m.as_str(), *w));
        let per_source = self
            .sources
            .iter()
            .flat_map(|(m, s)| s.values().map(move |w| (m.as_str(), *w)));

        for (model, weight) in scalars.chain(per_source) {
            if !weight.is_finite() || weight < 0.0 {
                return Err(SeparationError::config(format!(
                    "weight {} for model '{}' must be finite and non-negative",
                    weight, model
                )));
            }
        }
        Ok(())
    }
}

/// Joins per-model outputs into one weighted average per source
#[derive(Debug, Default)]
pub struct Ensembler {
    members: Vec<(SeparatedSources, HashMap<String, f32>)>,
}

impl Ensembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Models added so far
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Add one model's output with its per-source weights
    ///
    /// The source set and stem geometry must match earlier outputs.
    pub fn push(
        &mut self,
        output: SeparatedSources,
        weights: HashMap<String, f32>,
    ) -> SeparationResult<()> {
        if let Some((first, _)) = self.members.first() {
            check_compatible(first, &output)?;
        }
        self.members.push((output, weights));
        Ok(())
    }

    /// Weighted average per source, in the first model's source order
    pub fn finish(self) -> SeparationResult<SeparatedSources> {
        let mut members = self.members;
        let Some((first, _)) = members.first() else {
            return Err(SeparationError::config("nothing to ensemble"));
        };
        let labels = first.labels().to_vec();

        for label in &labels {
            let total: f32 = members
                .iter()
                .map(|(_, w)| w.get(label).copied().unwrap_or(1.0))
                .sum();
            if total <= 0.0 {
                return Err(SeparationError::config(format!(
                    "ensemble weights for source '{}' sum to zero",
                    label
                )));
            }
        }

        if members.len() == 1 {
            return Ok(members.remove(0).0);
        }

        let (sample_rate, channels, samples) = {
            let first = &members[0].0;
            let stem = first.iter().next().map(|(_, s)| s);
            (
                first.sample_rate,
                stem.map_or(0, Waveform::channels),
                first.samples(),
            )
        };

        let models: Vec<String> = members
            .iter()
            .flat_map(|(m, _)| m.models.iter().cloned())
            .collect();
        let mut out = SeparatedSources::new(sample_rate, models);

        for label in &labels {
            let mut acc = Array2::<f32>::zeros((channels, samples));
            let mut total = 0.0f32;
            for (member, weights) in &members {
                let weight = weights.get(label).copied().unwrap_or(1.0);
                if let Some(stem) = member.get(label) {
                    acc.scaled_add(weight, stem.data());
                    total += weight;
                }
            }
            acc /= total;
            out.add(label.clone(), Waveform::new(acc, sample_rate))?;
        }

        for (member, _) in &members {
            out.stats.segments_processed += member.stats.segments_processed;
            out.stats.inference_calls += member.stats.inference_calls;
        }

        Ok(out)
    }
}

fn check_compatible(first: &SeparatedSources, other: &SeparatedSources) -> SeparationResult<()> {
    let a: HashSet<&String> = first.labels().iter().collect();
    let b: HashSet<&String> = other.labels().iter().collect();
    if a != b {
        return Err(SeparationError::incompatible(format!(
            "models {:?} and {:?} disagree on sources: {:?} vs {:?}",
            first.models,
            other.models,
            first.labels(),
            other.labels()
        )));
    }
    if first.sample_rate != other.sample_rate || first.samples() != other.samples() {
        return Err(SeparationError::incompatible(format!(
            "outputs differ in shape: {} samples at {} Hz vs {} samples at {} Hz",
            first.samples(),
            first.sample_rate,
            other.samples(),
            other.sample_rate
        )));
    }
    Ok(())
}
