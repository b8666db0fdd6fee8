//! The fine-tuning loop
//!
//! Drives micro-batches through the adapter-augmented model: forward under
//! the run-wide precision policy, loss scaled for accumulation and numeric
//! stability, backward into per-parameter gradient buffers, and on every
//! accumulation boundary either an optimizer step or a skip-and-shrink when
//! the gradients went non-finite. The loop stops the instant the step
//! budget is reached, mid-epoch included.

use std::path::Path;

use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::config::ComputeProfile;
use crate::data::{CaptionDataset, Collator, Sample};
use crate::error::{Error, Result};
use crate::model::adapter::{self, AdapterMetadata};
use crate::model::CaptionModel;
use crate::processor::CaptionProcessor;
use crate::training::optim::{AdamW, AdamWParams};
use crate::training::scaler::{BoundaryOutcome, LossScaler};
use crate::training::scheduler::WarmupCosineSchedule;

/// Fine-tuning hyperparameters.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// Samples per micro-batch
    pub batch_size: usize,
    /// Micro-batches per optimizer step
    pub grad_accum_steps: usize,
    /// Passes over the dataset (upper bound; the step budget may cut in)
    pub epochs: usize,
    /// Peak learning rate
    pub learning_rate: f64,
    /// Requested warmup positions (capped at a fifth of the budget)
    pub warmup_steps: usize,
    /// Hard cap on `global_step`
    pub max_steps: usize,
    /// Shuffling seed
    pub seed: u64,
    /// Log cadence in micro-batches
    pub log_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            grad_accum_steps: 4,
            epochs: 1,
            learning_rate: 2e-4,
            warmup_steps: 200,
            max_steps: 2000,
            seed: 42,
            log_every: 50,
        }
    }
}

impl TrainConfig {
    /// Validate hyperparameters.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be positive"));
        }
        if self.grad_accum_steps == 0 {
            return Err(Error::config("grad_accum_steps must be positive"));
        }
        if self.epochs == 0 {
            return Err(Error::config("epochs must be positive"));
        }
        if self.max_steps == 0 {
            return Err(Error::config("max_steps must be positive"));
        }
        if self.learning_rate <= 0.0 {
            return Err(Error::config("learning_rate must be positive"));
        }
        Ok(())
    }
}

/// Where the loop currently is relative to its thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No micro-batch processed yet
    Idle,
    /// Inside the linear learning-rate ramp
    Warmup,
    /// Past warmup, cosine decay in effect
    SteadyState,
    /// Step budget exhausted
    Terminated,
}

/// Mutable counters owned by the loop.
#[derive(Debug, Clone, Default)]
pub struct TrainerState {
    /// Micro-batches processed (incremented unconditionally)
    pub global_step: usize,
    /// Schedule position, advanced once per applied boundary
    pub schedule_position: usize,
    /// Current epoch index
    pub epoch: usize,
    /// Planned step budget for this run
    pub total_steps: usize,
    /// Warmup positions in effect for this run
    pub warmup_steps: usize,
}

impl TrainerState {
    /// Phase derived purely from the step counter and thresholds.
    pub fn phase(&self) -> Phase {
        if self.total_steps == 0 || self.global_step == 0 {
            Phase::Idle
        } else if self.global_step >= self.total_steps {
            Phase::Terminated
        } else if self.global_step < self.warmup_steps {
            Phase::Warmup
        } else {
            Phase::SteadyState
        }
    }
}

/// Step budget: `min(max_steps, steps_per_epoch * epochs)` where an epoch
/// contributes one step per accumulation window.
pub fn planned_steps(
    num_batches: usize,
    grad_accum_steps: usize,
    epochs: usize,
    max_steps: usize,
) -> usize {
    let steps_per_epoch = (num_batches / grad_accum_steps).max(1);
    max_steps.min(steps_per_epoch * epochs)
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct TrainReport {
    /// Micro-batches processed
    pub steps: usize,
    /// Optimizer steps applied
    pub optimizer_steps: usize,
    /// Boundaries skipped for non-finite gradients
    pub skipped_boundaries: usize,
    /// Last observed (accumulation-scaled) training loss
    pub final_loss: Option<f64>,
    /// Mean validation loss, when a validation set was supplied
    pub val_loss: Option<f64>,
}

/// Owns the optimization step and every piece of training state.
pub struct Trainer {
    model: CaptionModel,
    varmap: VarMap,
    vars: Vec<Var>,
    optimizer: AdamW,
    scaler: LossScaler,
    grad_buffers: Vec<Option<Tensor>>,
    collator: Collator,
    profile: ComputeProfile,
    config: TrainConfig,
    state: TrainerState,
}

impl Trainer {
    /// Assemble a trainer around an adapter-augmented model.
    ///
    /// `varmap` must hold exactly the trainable adapter factors; the frozen
    /// base weights never enter the optimizer.
    pub fn new(
        model: CaptionModel,
        varmap: VarMap,
        collator: Collator,
        profile: ComputeProfile,
        config: TrainConfig,
    ) -> Result<Self> {
        config.validate()?;
        let vars = varmap.all_vars();
        if vars.is_empty() {
            return Err(Error::config(
                "no trainable parameters; was an adapter attached?",
            ));
        }
        let scaler = if profile.kind.is_accelerator() {
            LossScaler::new()
        } else {
            LossScaler::with_scale(1.0)
        };
        let buffer_count = vars.len();
        let optimizer = AdamW::new(vars.clone(), AdamWParams::default());
        Ok(Self {
            model,
            varmap,
            vars,
            optimizer,
            scaler,
            grad_buffers: vec![None; buffer_count],
            collator,
            profile,
            config,
            state: TrainerState::default(),
        })
    }

    /// Counters for inspection.
    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    /// Run the loop over `dataset` until the step budget is exhausted.
    pub fn train(
        &mut self,
        dataset: &CaptionDataset,
        val_dataset: Option<&CaptionDataset>,
    ) -> Result<TrainReport> {
        if dataset.is_empty() {
            return Err(Error::invalid_input("training dataset is empty"));
        }
        let num_batches = dataset.len().div_ceil(self.config.batch_size);
        let total_steps = planned_steps(
            num_batches,
            self.config.grad_accum_steps,
            self.config.epochs,
            self.config.max_steps,
        );
        let warmup = self.config.warmup_steps.min(total_steps / 5);
        let schedule = WarmupCosineSchedule::new(self.config.learning_rate, warmup, total_steps);
        self.state.total_steps = total_steps;
        self.state.warmup_steps = schedule.warmup_steps();

        let trainable: usize = self
            .vars
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum();
        info!(
            total_steps,
            warmup_steps = schedule.warmup_steps(),
            trainable_params = trainable,
            "starting fine-tuning"
        );

        let bar = ProgressBar::new(total_steps as u64);
        bar.set_style(
            ProgressStyle::with_template(
                "{bar:40.cyan/blue} {pos}/{len} steps [{elapsed_precise}] {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut last_loss = None;

        'epochs: for epoch in 0..self.config.epochs {
            self.state.epoch = epoch;
            let mut indices: Vec<usize> = (0..dataset.len()).collect();
            indices.shuffle(&mut rng);

            for chunk in indices.chunks(self.config.batch_size) {
                if self.state.global_step >= total_steps {
                    break 'epochs;
                }
                let samples: Vec<Sample> = chunk
                    .iter()
                    .filter_map(|&index| dataset.get(index).cloned())
                    .collect();
                let loss = self.micro_step(&samples)?;
                last_loss = Some(loss);

                if (self.state.global_step + 1) % self.config.grad_accum_steps == 0 {
                    self.boundary_step(&schedule)?;
                }
                self.state.global_step += 1;
                bar.inc(1);

                if self.state.global_step % self.config.log_every == 0 {
                    let lr = schedule.lr_at(self.state.schedule_position);
                    info!(
                        step = self.state.global_step,
                        total = total_steps,
                        loss,
                        lr,
                        "training progress"
                    );
                    bar.set_message(format!("loss {loss:.4}"));
                }
            }
        }
        bar.finish_and_clear();

        let val_loss = match val_dataset {
            Some(val) if !val.is_empty() => {
                let loss = self.evaluate(val)?;
                info!(val_loss = loss, "validation");
                Some(loss)
            }
            _ => None,
        };

        info!(
            steps = self.state.global_step,
            optimizer_steps = self.optimizer.step_count(),
            skipped = self.scaler.skipped_boundaries(),
            "fine-tuning complete"
        );
        Ok(TrainReport {
            steps: self.state.global_step,
            optimizer_steps: self.optimizer.step_count(),
            skipped_boundaries: self.scaler.skipped_boundaries(),
            final_loss: last_loss,
            val_loss,
        })
    }

    /// Mean loss over a held-out dataset, no gradients involved.
    pub fn evaluate(&self, dataset: &CaptionDataset) -> Result<f64> {
        let mut total = 0.0;
        let mut batches = 0usize;
        for chunk in dataset.samples().chunks(self.config.batch_size) {
            let batch = self
                .collator
                .collate(chunk)?
                .to_device(&self.profile.device, self.profile.dtype)?;
            let loss = self.model.forward_train(&batch, false)?;
            total += f64::from(loss.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?);
            batches += 1;
        }
        Ok(total / batches.max(1) as f64)
    }

    /// Persist the trained adapter plus the preprocessing configuration.
    pub fn save_adapter(
        &self,
        dir: &Path,
        metadata: &AdapterMetadata,
        processor: &CaptionProcessor,
    ) -> Result<()> {
        adapter::save_adapter(dir, &self.varmap, metadata)?;
        processor.save(dir)?;
        info!(dir = %dir.display(), "saved adapter");
        Ok(())
    }

    /// One micro-batch: collate, forward, scale, backward, accumulate.
    /// Returns the accumulation-scaled loss for logging.
    fn micro_step(&mut self, samples: &[Sample]) -> Result<f64> {
        let batch = self
            .collator
            .collate(samples)?
            .to_device(&self.profile.device, self.profile.dtype)?;
        let loss = self.model.forward_train(&batch, true)?;
        let loss = (loss * (1.0 / self.config.grad_accum_steps as f64))?;
        let loss_value = f64::from(loss.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?);
        let scaled = (loss * self.scaler.scale())?;
        let grads = scaled.backward()?;
        for (index, var) in self.vars.iter().enumerate() {
            if let Some(grad) = grads.get(var) {
                self.grad_buffers[index] = Some(match self.grad_buffers[index].take() {
                    Some(acc) => (acc + grad)?,
                    None => grad.clone(),
                });
            }
        }
        Ok(loss_value)
    }

    /// Accumulation boundary: unscale, check finiteness, then either step
    /// the optimizer and advance the schedule or skip and shrink the scale.
    /// The buffers are zeroed either way; skipped work is not retried.
    fn boundary_step(&mut self, schedule: &WarmupCosineSchedule) -> Result<BoundaryOutcome> {
        let inv_scale = 1.0 / self.scaler.scale();
        let mut unscaled: Vec<Option<Tensor>> = Vec::with_capacity(self.grad_buffers.len());
        let mut finite = true;
        for buffer in &self.grad_buffers {
            match buffer {
                Some(grad) => {
                    let grad = (grad * inv_scale)?;
                    let magnitude = grad.abs()?.sum_all()?.to_scalar::<f32>()?;
                    if !magnitude.is_finite() {
                        finite = false;
                    }
                    unscaled.push(Some(grad));
                }
                None => unscaled.push(None),
            }
        }

        let outcome = self.scaler.on_boundary(finite);
        match outcome {
            BoundaryOutcome::Stepped => {
                let lr = schedule.lr_at(self.state.schedule_position);
                self.optimizer.step(&unscaled, lr)?;
                self.state.schedule_position += 1;
            }
            BoundaryOutcome::Skipped => {
                warn!(
                    step = self.state.global_step,
                    scale = self.scaler.scale(),
                    "non-finite gradients; skipping optimizer step"
                );
            }
        }
        for buffer in &mut self.grad_buffers {
            *buffer = None;
        }
        Ok(outcome)
    }
}
