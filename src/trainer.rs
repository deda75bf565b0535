//! Staged training with periodic codebook merging.
//!
//! Each stage trains the current quantizer with [`Adam`] and a [`StepLr`]
//! schedule against the usual [`Objective`]. Between stages the codebooks are
//! merged pairwise, the frame-entropy target grows and the learning rate
//! shrinks, so later stages refine a larger, already-good product codebook.

use crate::constants::{optim, refine, trainer as defaults};
use crate::dataset::FrameSource;
use crate::error::{QuantizerError, Result};
use crate::objective::Objective;
use crate::optim::{Adam, AdamConfig, StepLr};
use crate::quantizer::Quantizer;
use crate::refine::TrainStep;
use crate::types::Frames;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Configuration for [`CurriculumTrainer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Frames per training batch.
    pub batch_size: usize,
    /// Optimizer steps in every stage.
    pub steps_per_stage: usize,
    /// Number of stages; codebooks are merged between consecutive stages.
    pub num_stages: usize,
    /// Refinement iterations for both `forward` and `encode`.
    pub num_iters: usize,
    /// Frame-entropy target of the first stage.
    pub target_frame_entropy: f32,
    /// Factor applied to the target after each merge.
    pub target_growth: f32,
    /// Factor applied to the learning rate after each merge.
    pub lr_decay_per_stage: f32,
    /// Weight of the usage-entropy term.
    pub entropy_scale: f32,
    /// Steps between progress events.
    pub log_every: usize,
    /// Optimizer steps between learning-rate decays.
    pub lr_step_size: usize,
    /// Learning-rate decay factor of the schedule.
    pub lr_gamma: f32,
    /// Optimizer hyperparameters of the first stage.
    pub adam: AdamConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::BATCH_SIZE,
            steps_per_stage: defaults::STEPS_PER_STAGE,
            num_stages: defaults::NUM_STAGES,
            num_iters: refine::DEFAULT_NUM_ITERS,
            target_frame_entropy: defaults::TARGET_FRAME_ENTROPY,
            target_growth: defaults::TARGET_GROWTH,
            lr_decay_per_stage: defaults::LR_DECAY_PER_STAGE,
            entropy_scale: defaults::ENTROPY_SCALE,
            log_every: defaults::LOG_EVERY,
            lr_step_size: optim::LR_STEP_SIZE,
            lr_gamma: optim::LR_GAMMA,
            adam: AdamConfig::default(),
        }
    }
}

impl TrainerConfig {
    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the number of steps per stage.
    pub fn with_steps_per_stage(mut self, steps: usize) -> Self {
        self.steps_per_stage = steps;
        self
    }

    /// Set the number of stages.
    pub fn with_num_stages(mut self, num_stages: usize) -> Self {
        self.num_stages = num_stages;
        self
    }

    /// Set the refinement iterations.
    pub fn with_num_iters(mut self, num_iters: usize) -> Self {
        self.num_iters = num_iters;
        self
    }

    /// Set the initial frame-entropy target.
    pub fn with_target_frame_entropy(mut self, target: f32) -> Self {
        self.target_frame_entropy = target;
        self
    }

    /// Set the usage-entropy weight.
    pub fn with_entropy_scale(mut self, scale: f32) -> Self {
        self.entropy_scale = scale;
        self
    }

    /// Set the logging interval.
    pub fn with_log_every(mut self, log_every: usize) -> Self {
        self.log_every = log_every;
        self
    }

    /// Set the optimizer hyperparameters.
    pub fn with_adam(mut self, adam: AdamConfig) -> Self {
        self.adam = adam;
        self
    }

    /// Check the configuration before a run.
    pub fn validate(&self) -> Result<()> {
        let counts = [
            ("batch_size", self.batch_size),
            ("steps_per_stage", self.steps_per_stage),
            ("num_stages", self.num_stages),
            ("num_iters", self.num_iters),
            ("log_every", self.log_every),
            ("lr_step_size", self.lr_step_size),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(QuantizerError::invalid_parameter(format!(
                    "{} must be > 0",
                    name
                )));
            }
        }
        if self.target_growth <= 0.0 || self.lr_decay_per_stage <= 0.0 {
            return Err(QuantizerError::invalid_parameter(
                "target_growth and lr_decay_per_stage must be > 0",
            ));
        }
        self.adam.validate()
    }
}

/// Metrics at the end of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    /// Zero-based stage index.
    pub stage: usize,
    /// Codebooks trained in this stage.
    pub num_codebooks: usize,
    /// Centers per codebook in this stage.
    pub codebook_size: usize,
    /// Frame-entropy target used in this stage.
    pub target_frame_entropy: f32,
    /// Relative error of `encode` on the last batch.
    pub ref_loss: f32,
    /// Reconstruction loss of the last step.
    pub reconstruction_loss: f32,
    /// Usage-entropy loss of the last step.
    pub entropy_loss: f32,
    /// Mean selection entropy of the last step.
    pub frame_entropy: f32,
    /// Raw temperature after the last step.
    pub temperature: f32,
    /// Learning rate after the last step.
    pub lr: f32,
}

/// Outcome of [`CurriculumTrainer::run`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    /// One entry per completed stage.
    pub stages: Vec<StageReport>,
}

impl TrainingReport {
    /// Report of the last completed stage.
    pub fn last(&self) -> Option<&StageReport> {
        self.stages.last()
    }
}

/// Runs the staged training loop.
#[derive(Debug, Clone)]
pub struct CurriculumTrainer {
    config: TrainerConfig,
}

impl CurriculumTrainer {
    /// Create a trainer after validating `config`.
    pub fn new(config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The trainer configuration.
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Train `quantizer` in place on batches from `source`.
    ///
    /// After every non-final stage `quantizer` is replaced by its product
    /// quantizer, so on return it has `num_codebooks / 2^(num_stages - 1)`
    /// codebooks.
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if the source and quantizer disagree on `D`,
    /// `OddCodebookCount` if a merge is impossible, and any error raised by
    /// the source or a training step.
    pub fn run<S, R>(
        &self,
        quantizer: &mut Quantizer,
        source: &mut S,
        rng: &mut R,
    ) -> Result<TrainingReport>
    where
        S: FrameSource + ?Sized,
        R: Rng + ?Sized,
    {
        if source.dim() != quantizer.dim() {
            return Err(QuantizerError::dimension_mismatch(
                quantizer.dim(),
                source.dim(),
            ));
        }

        let cfg = &self.config;
        let mut report = TrainingReport::default();
        let mut target = cfg.target_frame_entropy;
        let mut lr = cfg.adam.lr;

        for stage in 0..cfg.num_stages {
            info!(
                stage,
                num_codebooks = quantizer.num_codebooks(),
                codebook_size = quantizer.codebook_size(),
                target_frame_entropy = target,
                lr,
                "starting stage"
            );
            let stage_report = self.run_stage(stage, quantizer, source, rng, target, lr)?;
            report.stages.push(stage_report);

            if stage + 1 < cfg.num_stages {
                *quantizer = quantizer.get_product_quantizer()?;
                target *= cfg.target_growth;
                lr *= cfg.lr_decay_per_stage;
                info!(
                    stage,
                    num_codebooks = quantizer.num_codebooks(),
                    codebook_size = quantizer.codebook_size(),
                    "merged codebooks"
                );
            }
        }
        Ok(report)
    }

    fn run_stage<S, R>(
        &self,
        stage: usize,
        quantizer: &mut Quantizer,
        source: &mut S,
        rng: &mut R,
        target: f32,
        lr: f32,
    ) -> Result<StageReport>
    where
        S: FrameSource + ?Sized,
        R: Rng + ?Sized,
    {
        let cfg = &self.config;
        let objective = Objective::new(cfg.entropy_scale, target);
        let mut adam = Adam::for_bank(cfg.adam.with_lr(lr), quantizer.bank())?;
        let mut schedule = StepLr::new(lr, cfg.lr_step_size, cfg.lr_gamma)?;

        let mut last: Option<(Frames, TrainStep)> = None;
        for step in 1..=cfg.steps_per_stage {
            let x = source.next_batch(cfg.batch_size)?;
            let out = quantizer.forward(&x, cfg.num_iters, rng)?;
            let grad = objective.gradient(&out);
            adam.step(quantizer.bank_mut(), &grad)?;
            schedule.step(&mut adam);

            if step % cfg.log_every == 0 {
                let ref_loss = self.ref_loss(quantizer, &x)?;
                info!(
                    stage,
                    step,
                    ref_loss,
                    reconstruction_loss = out.reconstruction_loss,
                    entropy_loss = out.entropy_loss,
                    frame_entropy = out.frame_entropy,
                    objective = objective.value(&out),
                    lr = adam.lr(),
                    "training progress"
                );
            }
            last = Some((x, out));
        }

        // steps_per_stage > 0 is validated, so a step always ran
        let (x, out) = last.ok_or_else(|| QuantizerError::invalid_parameter("stage ran no steps"))?;
        let ref_loss = self.ref_loss(quantizer, &x)?;
        if !ref_loss.is_finite() {
            warn!(stage, ref_loss, "non-finite reference loss at end of stage");
        }

        Ok(StageReport {
            stage,
            num_codebooks: quantizer.num_codebooks(),
            codebook_size: quantizer.codebook_size(),
            target_frame_entropy: target,
            ref_loss,
            reconstruction_loss: out.reconstruction_loss,
            entropy_loss: out.entropy_loss,
            frame_entropy: out.frame_entropy,
            temperature: quantizer.bank().temperature(),
            lr: adam.lr(),
        })
    }

    fn ref_loss(&self, quantizer: &Quantizer, x: &Frames) -> Result<f32> {
        let codes = quantizer.encode(x, self.config.num_iters)?;
        quantizer.relative_error(x, &codes)
    }
}
