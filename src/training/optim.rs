//! AdamW over the trainable adapter parameters
//!
//! Explicit first/second moment tensors with bias correction and decoupled
//! weight decay. The per-step learning rate comes from the schedule; the
//! trainer hands in already-unscaled, already-accumulated gradients.

use candle_core::{Tensor, Var};

use crate::error::{Error, Result};

/// AdamW hyperparameters.
#[derive(Debug, Clone)]
pub struct AdamWParams {
    /// First-moment decay
    pub beta1: f64,
    /// Second-moment decay
    pub beta2: f64,
    /// Numerical-stability epsilon
    pub eps: f64,
    /// Decoupled weight-decay coefficient
    pub weight_decay: f64,
}

impl Default for AdamWParams {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

/// AdamW optimizer state over a fixed parameter list.
pub struct AdamW {
    vars: Vec<Var>,
    params: AdamWParams,
    step_count: usize,
    first_moments: Vec<Option<Tensor>>,
    second_moments: Vec<Option<Tensor>>,
}

impl AdamW {
    /// Create optimizer state for `vars`; moments are allocated lazily.
    pub fn new(vars: Vec<Var>, params: AdamWParams) -> Self {
        let count = vars.len();
        Self {
            vars,
            params,
            step_count: 0,
            first_moments: vec![None; count],
            second_moments: vec![None; count],
        }
    }

    /// Parameters this optimizer updates.
    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    /// Number of optimizer steps applied so far.
    pub fn step_count(&self) -> usize {
        self.step_count
    }

    /// Apply one update with learning rate `lr`.
    ///
    /// `grads` is indexed like [`AdamW::vars`]; `None` entries (parameters
    /// untouched this round) are left unchanged.
    pub fn step(&mut self, grads: &[Option<Tensor>], lr: f64) -> Result<()> {
        if grads.len() != self.vars.len() {
            return Err(Error::invalid_input(format!(
                "gradient count {} does not match parameter count {}",
                grads.len(),
                self.vars.len()
            )));
        }
        self.step_count += 1;
        let AdamWParams {
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params;
        let bias_correction1 = 1.0 - beta1.powi(self.step_count as i32);
        let bias_correction2 = 1.0 - beta2.powi(self.step_count as i32);

        for (index, grad) in grads.iter().enumerate() {
            let Some(grad) = grad else { continue };
            let var = &self.vars[index];

            let first = match &self.first_moments[index] {
                Some(moment) => ((moment * beta1)? + (grad * (1.0 - beta1))?)?,
                None => (grad * (1.0 - beta1))?,
            };
            let second = match &self.second_moments[index] {
                Some(moment) => ((moment * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?,
                None => (grad.sqr()? * (1.0 - beta2))?,
            };

            let corrected_first = (&first / bias_correction1)?;
            let corrected_second = (&second / bias_correction2)?;
            let denom = (corrected_second.sqrt()? + eps)?;
            let update = (corrected_first / denom)?;

            let mut next = (var.as_tensor() - (update * lr)?)?;
            if weight_decay > 0.0 {
                next = (next - (var.as_tensor() * (lr * weight_decay))?)?;
            }
            var.set(&next)?;

            self.first_moments[index] = Some(first);
            self.second_moments[index] = Some(second);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn descends_a_quadratic() {
        let device = Device::Cpu;
        let x = Var::from_tensor(&Tensor::new(&[4f32], &device).unwrap()).unwrap();
        let mut optimizer = AdamW::new(
            vec![x.clone()],
            AdamWParams {
                weight_decay: 0.0,
                ..Default::default()
            },
        );
        let initial = x.as_tensor().sqr().unwrap().to_vec1::<f32>().unwrap()[0];
        for _ in 0..200 {
            let loss = x.as_tensor().sqr().unwrap();
            let grads = loss.backward().unwrap();
            let grad = grads.get(&x).unwrap().clone();
            optimizer.step(&[Some(grad)], 0.1).unwrap();
        }
        let final_loss = x.as_tensor().sqr().unwrap().to_vec1::<f32>().unwrap()[0];
        let final_x = x.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!(final_loss < initial);
        assert!(final_x.abs() < 1.0, "did not descend: {final_x}");
    }

    #[test]
    fn none_gradients_leave_parameters_alone() {
        let device = Device::Cpu;
        let x = Var::from_tensor(&Tensor::new(&[1f32], &device).unwrap()).unwrap();
        let mut optimizer = AdamW::new(vec![x.clone()], AdamWParams::default());
        optimizer.step(&[None], 0.1).unwrap();
        assert_eq!(x.as_tensor().to_vec1::<f32>().unwrap(), vec![1f32]);
    }

    #[test]
    fn mismatched_gradient_count_is_rejected() {
        let device = Device::Cpu;
        let x = Var::from_tensor(&Tensor::new(&[1f32], &device).unwrap()).unwrap();
        let mut optimizer = AdamW::new(vec![x], AdamWParams::default());
        assert!(optimizer.step(&[], 0.1).is_err());
    }
}
