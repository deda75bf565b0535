//! Training objective and typed gradients.
//!
//! The stochastic refinement step produces three loss terms whose gradients
//! are deliberately routed to disjoint parameters:
//!
//! | term | gradient flows into |
//! |------|---------------------|
//! | `reconstruction_loss` | centers only |
//! | `entropy_loss` | centers only |
//! | `frame_entropy` | temperature only |
//!
//! The routing is encoded in the types: center-side terms carry a
//! [`CenterGradient`], the frame entropy carries a [`TemperatureGradient`],
//! and only [`Objective::gradient`] combines them into a full
//! [`ParameterGradient`].

use crate::refine::TrainStep;

/// Gradient of a scalar loss with respect to every center, laid out `[C][K][D]`.
#[derive(Debug, Clone, PartialEq)]
pub struct CenterGradient {
    values: Vec<f32>,
}

impl CenterGradient {
    pub(crate) fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Flat gradient values, same layout as [`crate::CodebookBank::centers`].
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Consume and return the flat values.
    pub fn into_values(self) -> Vec<f32> {
        self.values
    }

    /// Euclidean norm of the gradient.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|g| g * g).sum::<f32>().sqrt()
    }
}

/// Gradient of a scalar loss with respect to the raw temperature parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureGradient(pub f32);

/// Per-term gradients of one training step.
#[derive(Debug, Clone, PartialEq)]
pub struct LossGradients {
    /// d reconstruction_loss / d centers (temperature held fixed).
    pub reconstruction: CenterGradient,
    /// d entropy_loss / d centers (temperature held fixed).
    pub entropy: CenterGradient,
    /// d frame_entropy / d temperature (costs held fixed).
    pub frame_entropy: TemperatureGradient,
}

/// Gradient over every trainable parameter of a bank.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterGradient {
    /// Gradient for the centers, laid out `[C][K][D]`.
    pub centers: Vec<f32>,
    /// Gradient for the raw temperature.
    pub temperature: f32,
}

impl ParameterGradient {
    /// Number of scalars covered (centers plus temperature).
    pub fn len(&self) -> usize {
        self.centers.len() + 1
    }

    /// Always false: the temperature is always present.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// The usual objective
/// `reconstruction_loss + entropy_scale · entropy_loss + |frame_entropy - target_frame_entropy|`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Objective {
    /// Weight of the usage-entropy term.
    pub entropy_scale: f32,
    /// Frame entropy the temperature is trained towards.
    pub target_frame_entropy: f32,
}

impl Objective {
    /// Create an objective with the given entropy weight and target frame entropy.
    pub fn new(entropy_scale: f32, target_frame_entropy: f32) -> Self {
        Self {
            entropy_scale,
            target_frame_entropy,
        }
    }

    /// Scalar objective value for a training step.
    pub fn value(&self, step: &TrainStep) -> f32 {
        step.reconstruction_loss
            + self.entropy_scale * step.entropy_loss
            + (step.frame_entropy - self.target_frame_entropy).abs()
    }

    /// Gradient of [`Objective::value`] with respect to all parameters.
    ///
    /// The absolute-value term contributes `sign(frame_entropy - target)`
    /// times the frame-entropy gradient, and nothing at the target itself.
    pub fn gradient(&self, step: &TrainStep) -> ParameterGradient {
        let grads = &step.gradients;
        let centers = grads
            .reconstruction
            .values()
            .iter()
            .zip(grads.entropy.values())
            .map(|(&r, &e)| r + self.entropy_scale * e)
            .collect();

        let gap = step.frame_entropy - self.target_frame_entropy;
        let sign = if gap > 0.0 {
            1.0
        } else if gap < 0.0 {
            -1.0
        } else {
            0.0
        };

        ParameterGradient {
            centers,
            temperature: sign * grads.frame_entropy.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Codes;

    fn step(frame_entropy: f32) -> TrainStep {
        TrainStep {
            codes: Codes::zeros(1, 1),
            entropy_loss: 0.5,
            frame_entropy,
            reconstruction_loss: 0.25,
            gradients: LossGradients {
                reconstruction: CenterGradient::new(vec![1.0, 2.0]),
                entropy: CenterGradient::new(vec![10.0, -10.0]),
                frame_entropy: TemperatureGradient(-3.0),
            },
        }
    }

    #[test]
    fn test_objective_value() {
        let objective = Objective::new(0.1, 0.2);
        let value = objective.value(&step(0.5));
        assert!((value - (0.25 + 0.05 + 0.3)).abs() < 1e-6);
    }

    #[test]
    fn test_objective_gradient_routing() {
        let objective = Objective::new(0.1, 0.2);

        let above = objective.gradient(&step(0.5));
        assert_eq!(above.centers, vec![2.0, 1.0]);
        assert_eq!(above.temperature, -3.0);
        assert_eq!(above.len(), 3);

        let below = objective.gradient(&step(0.1));
        assert_eq!(below.temperature, 3.0);

        let at = objective.gradient(&step(0.2));
        assert_eq!(at.temperature, 0.0);
    }

    #[test]
    fn test_center_gradient_norm() {
        let g = CenterGradient::new(vec![3.0, 4.0]);
        assert!((g.norm() - 5.0).abs() < 1e-6);
    }
}
