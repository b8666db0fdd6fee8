//! Learning-rate schedule: linear warmup then cosine decay
//!
//! The schedule is a pure function of its position, which the trainer
//! advances once per accumulation boundary.

/// Warmup + cosine learning-rate schedule.
#[derive(Debug, Clone)]
pub struct WarmupCosineSchedule {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl WarmupCosineSchedule {
    /// Create a schedule over `total_steps` with a linear ramp of
    /// `warmup_steps` positions up to `base_lr`.
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps: warmup_steps.min(total_steps),
            total_steps,
        }
    }

    /// Learning rate at the given schedule position.
    pub fn lr_at(&self, position: usize) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        if position < self.warmup_steps {
            return self.base_lr * position as f64 / self.warmup_steps.max(1) as f64;
        }
        let decay_span = (self.total_steps - self.warmup_steps).max(1);
        let progress = (position - self.warmup_steps) as f64 / decay_span as f64;
        let progress = progress.min(1.0);
        self.base_lr * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
    }

    /// Number of warmup positions actually in effect.
    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }
}
