//! One-step local search over code tuples.
//!
//! Both refinement variants score every (codebook, candidate) pair of a frame
//! by the squared error the reconstruction would have if that codebook's
//! contribution were swapped to that candidate:
//!
//! ```text
//! e          = Σ_c centers[c][code[c]] - x          (current residual)
//! cost[c][k] = ‖e - centers[c][code[c]] + centers[c][k]‖²
//! ```
//!
//! All codebooks are scored against the same stale residual, so one step is an
//! approximate, simultaneous coordinate-descent move rather than an exact one.
//!
//! - [`deterministic`]: pick the cheapest candidate per codebook (used by `encode`).
//! - [`stochastic`]: sample from a temperature-scaled softmax of negated costs
//!   and compute the training signals (used by `forward`).

pub mod deterministic;
pub mod stochastic;

pub use deterministic::refine_deterministic;
pub use stochastic::{refine_stochastic, sample_stochastic, TrainStep};

use crate::codebook::CodebookBank;
use crate::error::{QuantizerError, Result};
use crate::types::{Codes, Frames};
use rayon::prelude::*;

/// Per-task scratch buffers for scoring one frame.
pub(crate) struct RowScratch {
    /// Current residual `e`, length `D`.
    pub residual: Vec<f32>,
    /// Costs for every candidate, length `C * K`.
    pub costs: Vec<f32>,
}

impl RowScratch {
    pub fn new(bank: &CodebookBank) -> Self {
        Self {
            residual: vec![0.0; bank.dim()],
            costs: vec![0.0; bank.num_codebooks() * bank.codebook_size()],
        }
    }
}

/// Check that `frames` has trailing dimension `D`.
pub(crate) fn check_frames(bank: &CodebookBank, frames: &Frames) -> Result<()> {
    if frames.dim() != bank.dim() {
        return Err(QuantizerError::dimension_mismatch(bank.dim(), frames.dim()));
    }
    Ok(())
}

/// Check that `codes` has trailing dimension `C` and every index is in `[0, K)`.
pub(crate) fn check_codes(bank: &CodebookBank, codes: &Codes) -> Result<()> {
    if codes.num_codebooks() != bank.num_codebooks() {
        return Err(QuantizerError::code_length_mismatch(
            bank.num_codebooks(),
            codes.num_codebooks(),
        ));
    }
    let k = bank.codebook_size();
    for row in codes.rows() {
        for (c, &index) in row.iter().enumerate() {
            if index as usize >= k {
                return Err(QuantizerError::code_out_of_range(c, index, k));
            }
        }
    }
    Ok(())
}

/// Check a frame batch and a code batch against the bank and each other.
pub(crate) fn check_pair(bank: &CodebookBank, frames: &Frames, codes: &Codes) -> Result<()> {
    check_frames(bank, frames)?;
    check_codes(bank, codes)?;
    if codes.num_frames() != frames.num_frames() {
        return Err(QuantizerError::shape_mismatch(
            frames.num_frames() * bank.num_codebooks(),
            codes.data().len(),
        ));
    }
    Ok(())
}

/// Write the residual `Σ_c centers[c][code[c]] - x` into `residual`.
#[inline]
pub(crate) fn residual_into(bank: &CodebookBank, x: &[f32], code: &[u32], residual: &mut [f32]) {
    bank.reconstruct_into(code, residual);
    for (r, &v) in residual.iter_mut().zip(x) {
        *r -= v;
    }
}

/// Squared reconstruction error of one frame.
#[inline]
pub(crate) fn row_squared_error(
    bank: &CodebookBank,
    x: &[f32],
    code: &[u32],
    residual: &mut [f32],
) -> f32 {
    residual_into(bank, x, code, residual);
    residual.iter().map(|r| r * r).sum()
}

/// Score every candidate of every codebook for one frame.
///
/// Fills `residual` with the current residual and `costs` (laid out `[C][K]`)
/// with the hypothetical squared errors. If `bases` is given (length `C * D`),
/// it receives `e - centers[c][code[c]]` per codebook.
pub(crate) fn candidate_costs(
    bank: &CodebookBank,
    x: &[f32],
    code: &[u32],
    residual: &mut [f32],
    costs: &mut [f32],
    mut bases: Option<&mut [f32]>,
) {
    let dim = bank.dim();
    let k_size = bank.codebook_size();
    residual_into(bank, x, code, residual);

    let mut base = vec![0.0f32; dim];
    for (c, &cur) in code.iter().enumerate() {
        for ((b, &e), &v) in base
            .iter_mut()
            .zip(residual.iter())
            .zip(bank.center(c, cur as usize))
        {
            *b = e - v;
        }
        if let Some(bases) = bases.as_deref_mut() {
            bases[c * dim..(c + 1) * dim].copy_from_slice(&base);
        }

        let row = &mut costs[c * k_size..(c + 1) * k_size];
        for (k, cost) in row.iter_mut().enumerate() {
            *cost = base
                .iter()
                .zip(bank.center(c, k))
                .map(|(&b, &v)| {
                    let m = b + v;
                    m * m
                })
                .sum();
        }
    }
}

/// Total squared reconstruction error `Σ ‖x - decode(codes)‖²` over a batch.
///
/// # Errors
/// Returns an error if the frames or codes do not match the bank.
pub fn squared_error(bank: &CodebookBank, frames: &Frames, codes: &Codes) -> Result<f64> {
    check_pair(bank, frames, codes)?;
    Ok(squared_error_unchecked(bank, frames, codes))
}

pub(crate) fn squared_error_unchecked(bank: &CodebookBank, frames: &Frames, codes: &Codes) -> f64 {
    frames
        .data()
        .par_chunks(bank.dim())
        .zip(codes.data().par_chunks(bank.num_codebooks()))
        .map_init(
            || vec![0.0f32; bank.dim()],
            |residual, (x, code)| f64::from(row_squared_error(bank, x, code, residual)),
        )
        .sum()
}
