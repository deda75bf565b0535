//! Deterministic refinement: pick the cheapest candidate per codebook.
//!
//! Every codebook moves to its minimum-cost candidate at once, using the
//! residual from before the move. When two codebooks chase the same correction
//! that joint move can overshoot, so each step is guarded to keep the
//! guarantee that refinement never increases a frame's squared error:
//!
//! 1. accept the joint move if its error is not greater than the current one;
//! 2. otherwise apply only the single codebook change with the largest
//!    predicted gain (an exact coordinate-descent move) if it does not hurt;
//! 3. otherwise keep the current tuple.

use super::{candidate_costs, check_pair, row_squared_error, RowScratch};
use crate::codebook::CodebookBank;
use crate::error::Result;
use crate::types::{Codes, Frames};
use rayon::prelude::*;

/// Run one deterministic refinement step over a batch.
///
/// `codes` must hold one tuple per frame. The result has the same shape as
/// `codes`, and every frame's squared error is at most its error under `codes`.
///
/// # Errors
/// Returns an error if the frames or codes do not match the bank.
pub fn refine_deterministic(bank: &CodebookBank, frames: &Frames, codes: &Codes) -> Result<Codes> {
    check_pair(bank, frames, codes)?;
    let mut data = codes.data().to_vec();
    refine_in_place(bank, frames, &mut data);
    Ok(Codes::with_leading_shape(
        codes.leading_shape(),
        bank.num_codebooks(),
        data,
    ))
}

/// Refine flat, pre-validated codes in place.
pub(crate) fn refine_in_place(bank: &CodebookBank, frames: &Frames, codes: &mut [u32]) {
    codes
        .par_chunks_mut(bank.num_codebooks())
        .zip(frames.data().par_chunks(bank.dim()))
        .for_each_init(
            || RowScratch::new(bank),
            |scratch, (code, x)| refine_row(bank, x, code, scratch),
        );
}

fn refine_row(bank: &CodebookBank, x: &[f32], code: &mut [u32], scratch: &mut RowScratch) {
    let k_size = bank.codebook_size();
    candidate_costs(
        bank,
        x,
        code,
        &mut scratch.residual,
        &mut scratch.costs,
        None,
    );

    // Per codebook: cheapest candidate, staying put on ties.
    let mut proposal = code.to_vec();
    let mut best_gain = 0.0f32;
    let mut best_codebook = None;
    for (c, choice) in proposal.iter_mut().enumerate() {
        let costs = &scratch.costs[c * k_size..(c + 1) * k_size];
        let current_cost = costs[*choice as usize];
        let mut best_cost = current_cost;
        for (k, &cost) in costs.iter().enumerate() {
            if cost < best_cost {
                best_cost = cost;
                *choice = k as u32;
            }
        }
        let gain = current_cost - best_cost;
        if gain > best_gain {
            best_gain = gain;
            best_codebook = Some(c);
        }
    }

    let Some(single) = best_codebook else {
        return;
    };

    let current_err = row_squared_error(bank, x, code, &mut scratch.residual);
    if row_squared_error(bank, x, &proposal, &mut scratch.residual) <= current_err {
        code.copy_from_slice(&proposal);
        return;
    }

    let previous = code[single];
    code[single] = proposal[single];
    if row_squared_error(bank, x, code, &mut scratch.residual) > current_err {
        code[single] = previous;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refine::squared_error;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_single_codebook_finds_nearest_center() {
        let bank = CodebookBank::from_centers(2, 2, 1, vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let frames = Frames::from_rows(&[vec![0.1, 0.9], vec![0.8, 0.3]]).unwrap();
        let codes = Codes::zeros(2, 1);
        let refined = refine_deterministic(&bank, &frames, &codes).unwrap();
        assert_eq!(refined.data(), &[1, 0]);
    }

    #[test]
    fn test_overshoot_is_guarded() {
        // Two identical codebooks {0, 1} in one dimension and x = 0.8: both
        // codebooks want to move to 1, which would overshoot to 2.
        let bank = CodebookBank::from_centers(1, 2, 2, vec![0.0, 1.0, 0.0, 1.0]).unwrap();
        let frames = Frames::from_rows(&[vec![0.8]]).unwrap();
        let codes = Codes::zeros(1, 2);

        let before = squared_error(&bank, &frames, &codes).unwrap();
        let refined = refine_deterministic(&bank, &frames, &codes).unwrap();
        let after = squared_error(&bank, &frames, &refined).unwrap();

        assert!(after <= before);
        assert_eq!(refined.data().iter().filter(|&&k| k == 1).count(), 1);
        assert!((after - 0.04).abs() < 1e-6);
    }

    #[test]
    fn test_never_increases_error_random() {
        let mut rng = StdRng::seed_from_u64(42);
        let bank = CodebookBank::with_rng(16, 8, 4, &mut rng).unwrap();
        let n = 64;
        let data: Vec<f32> = (0..n * 16).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let frames = Frames::from_flat(data, 16).unwrap();
        let code_data: Vec<u32> = (0..n * 4).map(|_| rng.gen_range(0..8)).collect();
        let mut codes = Codes::new(vec![n, 4], code_data).unwrap();

        let mut residual = vec![0.0f32; 16];
        for _ in 0..5 {
            let refined = refine_deterministic(&bank, &frames, &codes).unwrap();
            for i in 0..n {
                let before = row_squared_error(&bank, frames.row(i), codes.row(i), &mut residual);
                let after = row_squared_error(&bank, frames.row(i), refined.row(i), &mut residual);
                assert!(after <= before, "frame {}: {} > {}", i, after, before);
            }
            codes = refined;
        }
    }

    #[test]
    fn test_preserves_leading_shape() {
        let bank = CodebookBank::new(3, 4, 2).unwrap();
        let frames = Frames::new(vec![2, 5, 3], vec![0.5; 30]).unwrap();
        let codes = Codes::new(vec![2, 5, 2], vec![0; 20]).unwrap();
        let refined = refine_deterministic(&bank, &frames, &codes).unwrap();
        assert_eq!(refined.shape(), &[2, 5, 2]);
    }
}
