//! multi-kmeans: a trainable multi-codebook k-means quantizer.
//!
//! A vector `x ∈ R^D` is approximated by the sum of one center from each of
//! `C` codebooks of `K` centers, so it can be stored as `C` small integers.
//! Codes are found by an iterative local search rather than exhaustively.
//!
//! # Features
//!
//! - **Encode / Decode**: deterministic refinement from the all-zero code
//! - **Stochastic Training Step**: temperature-scaled sampling with analytic
//!   gradients for reconstruction, usage entropy and frame entropy
//! - **Codebook Merging**: pairs of `K`-center codebooks become one
//!   `K²`-center codebook
//! - **Curriculum Training**: Adam with a step schedule and merges between stages
//! - **Parallel Batches**: per-frame work is spread across cores with Rayon
//!
//! # Example
//!
//! ```
//! use multi_kmeans::{Frames, Quantizer};
//!
//! let quantizer = Quantizer::new(16, 8, 4).unwrap();
//! let x = Frames::from_flat(vec![0.1; 10 * 16], 16).unwrap();
//!
//! let codes = quantizer.encode(&x, 4).unwrap();
//! let err = quantizer.relative_error(&x, &codes).unwrap();
//! println!("relative error: {}", err);
//! ```

pub mod codebook;
pub mod constants;
pub mod dataset;
pub mod error;
pub mod objective;
pub mod optim;
mod product;
pub mod quantizer;
pub mod refine;
pub mod trainer;
pub mod types;

// Re-export commonly used types at crate root
pub use codebook::CodebookBank;
pub use dataset::{FrameSource, SyntheticSource};
pub use error::{QuantizerError, Result};
pub use objective::{CenterGradient, LossGradients, Objective, ParameterGradient, TemperatureGradient};
pub use optim::{Adam, AdamConfig, StepLr};
pub use quantizer::Quantizer;
pub use refine::{refine_deterministic, refine_stochastic, sample_stochastic, squared_error, TrainStep};
pub use trainer::{CurriculumTrainer, StageReport, TrainerConfig, TrainingReport};
pub use types::{Codes, Frames};
