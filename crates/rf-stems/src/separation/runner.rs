//! Batched model execution with out-of-resource fallback

use std::sync::Arc;

use ndarray::{Array3, Array4, ArrayView3, Axis, concatenate, s};

use super::cancel::CancellationToken;
use crate::error::{SeparationError, SeparationResult};
use crate::inference::{Device, DevicePreference, DeviceQueue};
use crate::model::ModelDescriptor;

/// Runs one model for the duration of a separation call
///
/// The model is prepared for its device on construction and released when the
/// runner is dropped, whether the call finished, failed or was cancelled.
pub struct InferenceRunner<'a> {
    model: &'a ModelDescriptor,
    device: Device,
    queue: Arc<DeviceQueue>,
    batch_size: usize,
    calls: usize,
    cancel: CancellationToken,
}

impl<'a> InferenceRunner<'a> {
    /// Prepare `model` and start a runner with the given batch size hint
    pub fn start(
        model: &'a ModelDescriptor,
        preference: DevicePreference,
        queue: Arc<DeviceQueue>,
        batch_size: usize,
    ) -> SeparationResult<Self> {
        let device = model.prepare(preference)?;
        let batch_size = if model.supports_batching() {
            batch_size.max(1)
        } else {
            1
        };

        log::debug!(
            "{}: running on {} with batch size {}",
            model.name(),
            device,
            batch_size
        );

        Ok(Self {
            model,
            device,
            queue,
            batch_size,
            calls: 0,
            cancel: CancellationToken::new(),
        })
    }

    /// Stop between forward passes once `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Device in use
    pub fn device(&self) -> Device {
        self.device
    }

    /// Current batch size (may have shrunk after resource failures)
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Forward passes issued so far
    pub fn calls(&self) -> usize {
        self.calls
    }

    /// Run `[items, channels, samples]` to `[items, sources, channels, samples]`
    ///
    /// Items are split into chunks of the batch size. When a chunk fails with
    /// a resource error the batch size is halved and the chunk retried; a
    /// failure at batch size one is returned. The cancellation token is
    /// checked before every chunk.
    pub fn run(&mut self, items: ArrayView3<'_, f32>) -> SeparationResult<Array4<f32>> {
        let total = items.len_of(Axis(0));
        let mut outputs: Vec<Array4<f32>> = Vec::new();
        let mut start = 0;

        while start < total {
            self.cancel.check()?;
            let end = (start + self.batch_size).min(total);
            let chunk = items.slice(s![start..end, .., ..]).to_owned();

            match self.forward(&chunk) {
                Ok(output) => {
                    outputs.push(output);
                    start = end;
                }
                Err(e) if e.is_resource_exhausted() && end - start > 1 => {
                    let reduced = ((end - start) / 2).max(1);
                    log::warn!(
                        "{}: {}; retrying with batch size {}",
                        self.model.name(),
                        e,
                        reduced
                    );
                    self.batch_size = reduced;
                }
                Err(e) => return Err(e),
            }
        }

        if outputs.len() == 1 {
            return Ok(outputs.remove(0));
        }

        let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
        concatenate(Axis(0), &views).map_err(|e| SeparationError::InferenceFailed {
            reason: format!("cannot join batch outputs: {}", e),
        })
    }

    fn forward(&mut self, chunk: &Array3<f32>) -> SeparationResult<Array4<f32>> {
        self.calls += 1;
        let model = self.model;
        self.queue.run(self.device, || model.forward(chunk))
    }
}

impl Drop for InferenceRunner<'_> {
    fn drop(&mut self) {
        self.model.release();
        log::debug!(
            "{}: released {} after {} calls",
            self.model.name(),
            self.device,
            self.calls
        );
    }
}
