//! Gradient optimizer for codebook parameters.
//!
//! [`Adam`] treats a bank as the flat parameter vector
//! `[centers..., temperature]` and applies the usual bias-corrected Adam update
//! with an L2 penalty folded into the gradient. [`StepLr`] decays the learning
//! rate by `gamma` every `step_size` optimizer steps.
//!
//! Optimizer state is tied to a parameter count, so a fresh optimizer is
//! needed after [`crate::CodebookBank::get_product_quantizer`].

use crate::codebook::CodebookBank;
use crate::constants::optim as defaults;
use crate::error::{QuantizerError, Result};
use crate::objective::ParameterGradient;
use serde::{Deserialize, Serialize};

/// Hyperparameters for [`Adam`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    /// Learning rate.
    pub lr: f32,
    /// First-moment decay.
    pub beta1: f32,
    /// Second-moment decay.
    pub beta2: f32,
    /// Denominator guard.
    pub eps: f32,
    /// L2 penalty added to the gradient.
    pub weight_decay: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: defaults::LEARNING_RATE,
            beta1: defaults::BETA1,
            beta2: defaults::BETA2,
            eps: defaults::EPS,
            weight_decay: defaults::WEIGHT_DECAY,
        }
    }
}

impl AdamConfig {
    /// Set the learning rate.
    pub fn with_lr(mut self, lr: f32) -> Self {
        self.lr = lr;
        self
    }

    /// Set both moment decays.
    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    /// Set the denominator guard.
    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    /// Set the L2 penalty.
    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Check that every hyperparameter is in its valid range.
    pub fn validate(&self) -> Result<()> {
        if !(self.lr > 0.0 && self.lr.is_finite()) {
            return Err(QuantizerError::invalid_parameter(format!(
                "lr must be positive, got {}",
                self.lr
            )));
        }
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(QuantizerError::invalid_parameter(format!(
                    "{} must be in [0, 1), got {}",
                    name, beta
                )));
            }
        }
        if self.eps <= 0.0 || self.weight_decay < 0.0 {
            return Err(QuantizerError::invalid_parameter(
                "eps must be > 0 and weight_decay >= 0",
            ));
        }
        Ok(())
    }
}

/// Adam optimizer over the parameters of one [`CodebookBank`].
#[derive(Debug, Clone)]
pub struct Adam {
    config: AdamConfig,
    first_moment: Vec<f32>,
    second_moment: Vec<f32>,
    steps: u32,
}

impl Adam {
    /// Create an optimizer for `num_parameters` scalars.
    pub fn new(config: AdamConfig, num_parameters: usize) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            first_moment: vec![0.0; num_parameters],
            second_moment: vec![0.0; num_parameters],
            steps: 0,
        })
    }

    /// Create an optimizer sized for `bank`.
    pub fn for_bank(config: AdamConfig, bank: &CodebookBank) -> Result<Self> {
        Self::new(config, bank.num_parameters())
    }

    /// Current learning rate.
    pub fn lr(&self) -> f32 {
        self.config.lr
    }

    /// Override the learning rate (used by schedules).
    pub fn set_lr(&mut self, lr: f32) {
        self.config.lr = lr;
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> u32 {
        self.steps
    }

    /// Apply one update to `bank` using `grad`.
    ///
    /// # Errors
    /// Returns [`QuantizerError::ParameterCountMismatch`] if the bank or the
    /// gradient does not match the optimizer state.
    pub fn step(&mut self, bank: &mut CodebookBank, grad: &ParameterGradient) -> Result<()> {
        let expected = self.first_moment.len();
        if bank.num_parameters() != expected {
            return Err(QuantizerError::parameter_count_mismatch(
                expected,
                bank.num_parameters(),
            ));
        }
        if grad.len() != expected {
            return Err(QuantizerError::parameter_count_mismatch(expected, grad.len()));
        }

        self.steps += 1;
        let AdamConfig {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;
        let t = self.steps as i32;
        let bias1 = 1.0 - beta1.powi(t);
        let bias2 = 1.0 - beta2.powi(t);

        let update = |param: &mut f32, g: f32, m: &mut f32, v: &mut f32| {
            let g = g + weight_decay * *param;
            *m = beta1 * *m + (1.0 - beta1) * g;
            *v = beta2 * *v + (1.0 - beta2) * g * g;
            let m_hat = *m / bias1;
            let v_hat = *v / bias2;
            *param -= lr * m_hat / (v_hat.sqrt() + eps);
        };

        let n = bank.centers().len();
        let (m_centers, m_temp) = self.first_moment.split_at_mut(n);
        let (v_centers, v_temp) = self.second_moment.split_at_mut(n);
        for (((param, &g), m), v) in bank
            .centers_mut()
            .iter_mut()
            .zip(&grad.centers)
            .zip(m_centers.iter_mut())
            .zip(v_centers.iter_mut())
        {
            update(param, g, m, v);
        }

        let mut temperature = bank.temperature();
        update(&mut temperature, grad.temperature, &mut m_temp[0], &mut v_temp[0]);
        bank.set_temperature(temperature);
        Ok(())
    }
}

/// Multiply the learning rate by `gamma` every `step_size` scheduler steps.
#[derive(Debug, Clone)]
pub struct StepLr {
    base_lr: f32,
    step_size: usize,
    gamma: f32,
    steps: usize,
}

impl StepLr {
    /// Create a schedule starting from `base_lr`.
    pub fn new(base_lr: f32, step_size: usize, gamma: f32) -> Result<Self> {
        if step_size == 0 {
            return Err(QuantizerError::invalid_parameter("step_size must be > 0"));
        }
        Ok(Self {
            base_lr,
            step_size,
            gamma,
            steps: 0,
        })
    }

    /// Learning rate for the current position in the schedule.
    pub fn current_lr(&self) -> f32 {
        let decays = (self.steps / self.step_size) as i32;
        self.base_lr * self.gamma.powi(decays)
    }

    /// Advance the schedule and push the new rate into `optimizer`.
    pub fn step(&mut self, optimizer: &mut Adam) {
        self.steps += 1;
        optimizer.set_lr(self.current_lr());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grad_for(bank: &CodebookBank, value: f32) -> ParameterGradient {
        ParameterGradient {
            centers: vec![value; bank.centers().len()],
            temperature: value,
        }
    }

    #[test]
    fn test_first_step_moves_by_lr() {
        // with bias correction the first Adam step is lr * sign(g)
        let mut bank = CodebookBank::from_centers(1, 2, 1, vec![0.5, -0.5]).unwrap();
        let config = AdamConfig::default().with_lr(0.1).with_weight_decay(0.0);
        let mut adam = Adam::for_bank(config, &bank).unwrap();

        let grad = grad_for(&bank, 2.0);
        adam.step(&mut bank, &grad).unwrap();
        assert!((bank.centers()[0] - 0.4).abs() < 1e-5);
        assert!((bank.centers()[1] + 0.6).abs() < 1e-5);
        assert!((bank.temperature() + 0.1).abs() < 1e-5);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn test_adam_minimizes_quadratic() {
        let mut bank = CodebookBank::from_centers(2, 2, 1, vec![3.0, -2.0, 1.0, 4.0]).unwrap();
        let config = AdamConfig::default().with_lr(0.05).with_betas(0.9, 0.999);
        let mut adam = Adam::for_bank(config, &bank).unwrap();

        for _ in 0..2000 {
            // d/dp of 0.5 p²
            let grad = ParameterGradient {
                centers: bank.centers().to_vec(),
                temperature: bank.temperature(),
            };
            adam.step(&mut bank, &grad).unwrap();
        }
        assert!(bank.centers().iter().all(|p| p.abs() < 0.05));
    }

    #[test]
    fn test_parameter_count_mismatch() {
        let mut small = CodebookBank::new(2, 2, 1).unwrap();
        let big = CodebookBank::new(2, 4, 1).unwrap();
        let mut adam = Adam::for_bank(AdamConfig::default(), &big).unwrap();
        let grad = grad_for(&small, 1.0);
        assert!(matches!(
            adam.step(&mut small, &grad).unwrap_err(),
            QuantizerError::ParameterCountMismatch { .. }
        ));
    }

    #[test]
    fn test_invalid_config() {
        assert!(AdamConfig::default().with_lr(0.0).validate().is_err());
        assert!(AdamConfig::default().with_betas(1.0, 0.9).validate().is_err());
        assert!(AdamConfig::default().validate().is_ok());
    }

    #[test]
    fn test_step_lr_schedule() {
        let bank = CodebookBank::new(2, 2, 1).unwrap();
        let mut adam = Adam::for_bank(AdamConfig::default().with_lr(1.0), &bank).unwrap();
        let mut schedule = StepLr::new(1.0, 3, 0.5).unwrap();

        let mut rates = Vec::new();
        for _ in 0..7 {
            schedule.step(&mut adam);
            rates.push(adam.lr());
        }
        assert_eq!(rates, vec![1.0, 1.0, 0.5, 0.5, 0.5, 0.25, 0.25]);
        assert!(StepLr::new(1.0, 0, 0.5).is_err());
    }

    #[test]
    fn test_config_from_json() {
        let config: AdamConfig = serde_json::from_str(r#"{"lr": 0.01}"#).unwrap();
        assert_eq!(config.lr, 0.01);
        assert_eq!(config.beta2, defaults::BETA2);
    }
}
