//! Named constants for configuration values.
//!
//! This module centralizes magic numbers and default values used throughout
//! the codebase, making them easier to find, document, and tune.

/// Constants for the refinement search.
pub mod refine {
    /// Default number of refinement iterations for encoding and training.
    pub const DEFAULT_NUM_ITERS: usize = 4;

    /// Multiplier applied to the learned temperature before exponentiation.
    /// Makes the temperature equilibrate faster against its target.
    pub const TEMPERATURE_GAIN: f32 = 10.0;
}

/// Constants guarding numeric edge cases.
pub mod numeric {
    /// Added to every energy normalization so zero-energy inputs yield 0, not NaN.
    pub const ENERGY_EPSILON: f64 = 1.0e-20;

    /// Added inside `ln` when computing the usage entropy of averaged probabilities.
    pub const USAGE_EPSILON: f32 = 1.0e-20;
}

/// Defaults for the Adam optimizer and learning-rate schedule.
pub mod optim {
    /// Base learning rate.
    pub const LEARNING_RATE: f32 = 1.0e-3;

    /// Exponential decay for the first moment.
    pub const BETA1: f32 = 0.9;

    /// Exponential decay for the second moment.
    pub const BETA2: f32 = 0.9;

    /// Denominator guard.
    pub const EPS: f32 = 1.0e-9;

    /// L2 penalty added to the gradient.
    pub const WEIGHT_DECAY: f32 = 1.0e-6;

    /// Number of optimizer steps between learning-rate decays.
    pub const LR_STEP_SIZE: usize = 1000;

    /// Multiplicative learning-rate decay per schedule step.
    pub const LR_GAMMA: f32 = 0.5;
}

/// Defaults for the curriculum trainer.
pub mod trainer {
    /// Frames per training batch.
    pub const BATCH_SIZE: usize = 600;

    /// Optimizer steps per curriculum stage.
    pub const STEPS_PER_STAGE: usize = 10_000;

    /// Number of curriculum stages (merges happen between stages).
    pub const NUM_STAGES: usize = 3;

    /// Frame entropy the temperature is trained towards in the first stage.
    pub const TARGET_FRAME_ENTROPY: f32 = 0.2;

    /// Factor applied to the target frame entropy after every merge.
    pub const TARGET_GROWTH: f32 = 1.5;

    /// Factor applied to the learning rate after every merge.
    pub const LR_DECAY_PER_STAGE: f32 = 0.5;

    /// Weight of the usage-entropy loss in the objective.
    pub const ENTROPY_SCALE: f32 = 1.0e-7;

    /// Steps between progress reports.
    pub const LOG_EVERY: usize = 100;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refine_defaults() {
        assert_eq!(refine::DEFAULT_NUM_ITERS, 4);
        assert!((refine::TEMPERATURE_GAIN - 10.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_trainer_schedule_is_growing() {
        assert!(trainer::TARGET_GROWTH > 1.0);
        assert!(trainer::LR_DECAY_PER_STAGE < 1.0);
    }
}
