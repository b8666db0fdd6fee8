//! Dynamic loss scaling for reduced-precision training
//!
//! The loss is multiplied by a large factor before backward so that small
//! gradients survive half precision, then gradients are unscaled before the
//! optimizer step. Non-finite gradients at a boundary shrink the factor and
//! skip the step; a run of clean boundaries grows it back.

/// Outcome of an accumulation boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryOutcome {
    /// Gradients were finite; the optimizer step should be applied.
    Stepped,
    /// Non-finite gradients; the step was skipped and the scale shrunk.
    Skipped,
}

/// Explicit loss-scale state machine.
#[derive(Debug, Clone)]
pub struct LossScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    good_boundaries: usize,
    skipped: usize,
}

impl LossScaler {
    /// Scaler with the conventional defaults: initial scale 2^16, growth 2x
    /// every 2000 clean boundaries, halving on overflow.
    pub fn new() -> Self {
        Self::with_scale(65536.0)
    }

    /// Scaler starting from a specific scale (full-precision runs pass 1.0).
    pub fn with_scale(scale: f64) -> Self {
        Self {
            scale,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            good_boundaries: 0,
            skipped: 0,
        }
    }

    /// Factor to multiply the loss by this micro-batch.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Number of boundaries skipped so far.
    pub fn skipped_boundaries(&self) -> usize {
        self.skipped
    }

    /// Advance the state machine at an accumulation boundary.
    pub fn on_boundary(&mut self, grads_finite: bool) -> BoundaryOutcome {
        if grads_finite {
            self.good_boundaries += 1;
            if self.good_boundaries >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.good_boundaries = 0;
            }
            BoundaryOutcome::Stepped
        } else {
            self.scale *= self.backoff_factor;
            self.good_boundaries = 0;
            self.skipped += 1;
            BoundaryOutcome::Skipped
        }
    }
}

impl Default for LossScaler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_finite_gradients_shrink_the_scale() {
        let mut scaler = LossScaler::new();
        let before = scaler.scale();
        assert_eq!(scaler.on_boundary(false), BoundaryOutcome::Skipped);
        assert_eq!(scaler.scale(), before * 0.5);
        assert_eq!(scaler.skipped_boundaries(), 1);
    }

    #[test]
    fn scale_grows_after_a_clean_interval() {
        let mut scaler = LossScaler::with_scale(1024.0);
        for _ in 0..1999 {
            assert_eq!(scaler.on_boundary(true), BoundaryOutcome::Stepped);
            assert_eq!(scaler.scale(), 1024.0);
        }
        scaler.on_boundary(true);
        assert_eq!(scaler.scale(), 2048.0);
    }

    #[test]
    fn an_overflow_resets_the_growth_run() {
        let mut scaler = LossScaler::with_scale(1024.0);
        for _ in 0..1999 {
            scaler.on_boundary(true);
        }
        scaler.on_boundary(false);
        assert_eq!(scaler.scale(), 512.0);
        // The clean-run counter restarted; one more good boundary must not grow.
        scaler.on_boundary(true);
        assert_eq!(scaler.scale(), 512.0);
    }
}
