//! Multi-codebook quantizer: encode, decode, train and merge.
//!
//! A [`Quantizer`] wraps a [`CodebookBank`] and drives the refinement search:
//!
//! - [`Quantizer::encode`] starts every frame at the all-zero code tuple and
//!   applies deterministic refinement `num_iters` times.
//! - [`Quantizer::forward`] starts from random indices and applies stochastic
//!   refinement, returning the training signals of the final iteration.
//! - [`Quantizer::decode`] sums the selected centers.
//!
//! # Example
//!
//! ```
//! use multi_kmeans::{Frames, Quantizer};
//!
//! let quantizer = Quantizer::new(8, 16, 4).unwrap();
//! let x = Frames::from_flat(vec![0.25; 3 * 8], 8).unwrap();
//!
//! let codes = quantizer.encode(&x, 4).unwrap();
//! assert_eq!(codes.shape(), &[3, 4]);
//!
//! let approx = quantizer.decode(&codes).unwrap();
//! assert_eq!(approx.shape(), x.shape());
//! ```

use crate::codebook::CodebookBank;
use crate::constants::numeric::ENERGY_EPSILON;
use crate::error::{QuantizerError, Result};
use crate::refine::deterministic::refine_in_place;
use crate::refine::stochastic::{sample_unchecked, train_step_unchecked};
use crate::refine::{
    candidate_costs, check_codes, check_frames, check_pair, row_squared_error,
    squared_error_unchecked, RowScratch, TrainStep,
};
use crate::types::{Codes, Frames};
use rand::Rng;
use rayon::prelude::*;
use tracing::{debug, warn};

/// Trainable quantizer that encodes vectors as one index per codebook.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantizer {
    bank: CodebookBank,
}

impl Quantizer {
    /// Create a quantizer with randomly initialized codebooks.
    ///
    /// # Errors
    /// Returns `InvalidParameter` unless `dim > 0`, `codebook_size > 1` and
    /// `num_codebooks > 0`.
    pub fn new(dim: usize, codebook_size: usize, num_codebooks: usize) -> Result<Self> {
        Ok(Self::from_bank(CodebookBank::new(
            dim,
            codebook_size,
            num_codebooks,
        )?))
    }

    /// Create a quantizer whose initialization is drawn from `rng`.
    pub fn with_rng<R: Rng + ?Sized>(
        dim: usize,
        codebook_size: usize,
        num_codebooks: usize,
        rng: &mut R,
    ) -> Result<Self> {
        Ok(Self::from_bank(CodebookBank::with_rng(
            dim,
            codebook_size,
            num_codebooks,
            rng,
        )?))
    }

    /// Wrap an existing bank.
    pub fn from_bank(bank: CodebookBank) -> Self {
        Self { bank }
    }

    /// The underlying parameters.
    pub fn bank(&self) -> &CodebookBank {
        &self.bank
    }

    /// Mutable parameters, for an external optimizer.
    pub fn bank_mut(&mut self) -> &mut CodebookBank {
        &mut self.bank
    }

    /// Consume the quantizer and return its parameters.
    pub fn into_bank(self) -> CodebookBank {
        self.bank
    }

    /// Vector dimension.
    pub fn dim(&self) -> usize {
        self.bank.dim()
    }

    /// Centers per codebook.
    pub fn codebook_size(&self) -> usize {
        self.bank.codebook_size()
    }

    /// Number of codebooks (codes per vector).
    pub fn num_codebooks(&self) -> usize {
        self.bank.num_codebooks()
    }

    /// Encode frames of shape `(..., dim)` as codes of shape `(..., num_codebooks)`.
    ///
    /// # Errors
    /// Returns [`QuantizerError::DimensionMismatch`] if the trailing
    /// dimension is not `dim`.
    pub fn encode(&self, x: &Frames, num_iters: usize) -> Result<Codes> {
        check_frames(&self.bank, x)?;
        let n = x.num_frames();
        let mut data = vec![0u32; n * self.num_codebooks()];
        for _ in 0..num_iters {
            refine_in_place(&self.bank, x, &mut data);
        }
        debug!(frames = n, num_iters, "encoded batch");
        Ok(Codes::with_leading_shape(
            x.leading_shape(),
            self.num_codebooks(),
            data,
        ))
    }

    /// Reconstruct frames of shape `(..., dim)` from codes `(..., num_codebooks)`.
    ///
    /// # Errors
    /// Returns `CodeLengthMismatch` for a wrong trailing dimension and
    /// `CodeOutOfRange` for any index outside `[0, codebook_size)`.
    pub fn decode(&self, codes: &Codes) -> Result<Frames> {
        check_codes(&self.bank, codes)?;
        let dim = self.dim();
        let mut data = vec![0.0f32; codes.num_frames() * dim];
        data.par_chunks_mut(dim)
            .zip(codes.data().par_chunks(self.num_codebooks()))
            .for_each(|(out, code)| self.bank.reconstruct_into(code, out));

        let mut shape = codes.leading_shape().to_vec();
        shape.push(dim);
        Frames::new(shape, data)
    }

    /// Training-mode pass: stochastic refinement plus loss terms and gradients.
    ///
    /// Starting indices are drawn uniformly from `[0, codebook_size - 1)`;
    /// after `num_iters` stochastic steps the sampled codes and the training
    /// signals of the last step are returned. Earlier steps only sample.
    ///
    /// # Errors
    /// Returns `DimensionMismatch` for a wrong trailing dimension,
    /// `EmptyBatch` for no frames and `InvalidParameter` for `num_iters == 0`.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        x: &Frames,
        num_iters: usize,
        rng: &mut R,
    ) -> Result<TrainStep> {
        check_frames(&self.bank, x)?;
        if num_iters == 0 {
            return Err(QuantizerError::invalid_parameter(
                "forward requires num_iters >= 1",
            ));
        }
        let n = x.num_frames();
        if n == 0 {
            return Err(QuantizerError::EmptyBatch);
        }

        let mut codes = initial_codes(n * self.num_codebooks(), self.codebook_size(), rng);
        for _ in 1..num_iters {
            codes = sample_unchecked(&self.bank, x, &codes, rng);
        }

        let mut step = train_step_unchecked(&self.bank, x, &codes, rng);
        step.codes = Codes::with_leading_shape(
            x.leading_shape(),
            self.num_codebooks(),
            step.codes.into_data(),
        );

        if !(step.reconstruction_loss.is_finite()
            && step.entropy_loss.is_finite()
            && step.frame_entropy.is_finite())
        {
            warn!(
                reconstruction_loss = step.reconstruction_loss,
                entropy_loss = step.entropy_loss,
                frame_entropy = step.frame_entropy,
                temperature = self.bank.temperature(),
                "non-finite training signal"
            );
        }
        debug!(
            frames = n,
            num_iters,
            reconstruction_loss = step.reconstruction_loss,
            entropy_loss = step.entropy_loss,
            frame_entropy = step.frame_entropy,
            "forward pass"
        );
        Ok(step)
    }

    /// [`Quantizer::forward`] with the thread-local RNG.
    pub fn train_step(&self, x: &Frames, num_iters: usize) -> Result<TrainStep> {
        self.forward(x, num_iters, &mut rand::thread_rng())
    }

    /// Diagnostic relative error of a single, non-iterative selection.
    ///
    /// Each codebook independently picks the candidate with the lowest cost
    /// against the all-zero code tuple (the arg-max of the negated costs); the
    /// result is `Σ ‖x - x̂‖² / (Σ ‖x‖² + ε)` over the whole batch.
    ///
    /// # Errors
    /// Returns `DimensionMismatch` for a wrong trailing dimension.
    pub fn compute_ref_loss(&self, x: &Frames) -> Result<f32> {
        check_frames(&self.bank, x)?;
        let bank = &self.bank;
        let c_count = bank.num_codebooks();
        let k_size = bank.codebook_size();
        let zeros = vec![0u32; c_count];

        let total: f64 = x
            .data()
            .par_chunks(bank.dim())
            .map_init(
                || (RowScratch::new(bank), vec![0u32; c_count]),
                |(scratch, chosen), row| {
                    candidate_costs(
                        bank,
                        row,
                        &zeros,
                        &mut scratch.residual,
                        &mut scratch.costs,
                        None,
                    );
                    for (c, choice) in chosen.iter_mut().enumerate() {
                        let costs = &scratch.costs[c * k_size..(c + 1) * k_size];
                        *choice = argmin(costs) as u32;
                    }
                    f64::from(row_squared_error(bank, row, chosen, &mut scratch.residual))
                },
            )
            .sum();

        Ok((total / (x.energy() + ENERGY_EPSILON)) as f32)
    }

    /// Total squared reconstruction error of `codes` against `x`.
    pub fn squared_error(&self, x: &Frames, codes: &Codes) -> Result<f64> {
        check_pair(&self.bank, x, codes)?;
        Ok(squared_error_unchecked(&self.bank, x, codes))
    }

    /// Squared reconstruction error of `codes` relative to the energy of `x`.
    pub fn relative_error(&self, x: &Frames, codes: &Codes) -> Result<f32> {
        let err = self.squared_error(x, codes)?;
        Ok((err / (x.energy() + ENERGY_EPSILON)) as f32)
    }

    /// Merge codebook pairs into a quantizer with `codebook_size²` centers and
    /// half as many codebooks.
    ///
    /// # Errors
    /// Returns [`QuantizerError::OddCodebookCount`] if `num_codebooks` is odd.
    pub fn get_product_quantizer(&self) -> Result<Quantizer> {
        let merged = self.bank.get_product_quantizer()?;
        debug!(
            codebook_size = merged.codebook_size(),
            num_codebooks = merged.num_codebooks(),
            "merged codebook pairs"
        );
        Ok(Quantizer::from_bank(merged))
    }
}

/// Random starting indices for `forward`, uniform on `[0, codebook_size - 1)`.
fn initial_codes<R: Rng + ?Sized>(len: usize, codebook_size: usize, rng: &mut R) -> Vec<u32> {
    let upper = codebook_size as u32 - 1;
    (0..len).map(|_| rng.gen_range(0..upper)).collect()
}

/// Index of the smallest value; the first one wins ties.
fn argmin(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0)
}
