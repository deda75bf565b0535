//! Stochastic refinement with a learned temperature.
//!
//! Candidate costs `s[b][c][k]` (see the parent module) become a categorical
//! distribution per frame and codebook:
//!
//! ```text
//! p[b][c][k] = softmax_k(-β · s[b][c][k]),   β = exp(10 · temperature)
//! ```
//!
//! and the new index is sampled from it. Alongside the sampled codes a full
//! step yields three training signals and their gradients:
//!
//! - `frame_entropy`: mean entropy of `p[b][c]`. Costs are held fixed, so its
//!   gradient reaches only the temperature:
//!   `∂F/∂T = -10 β² · mean_{b,c} Var_{p[b][c]}(s[b][c])`.
//! - `entropy_loss`: `ln K - mean_c H(mean_b p[b][c])`. Temperature is held
//!   fixed, so its gradient reaches only the centers.
//! - `reconstruction_loss`: `Σ p·s / C / (Σ x² + ε)`, the expected squared
//!   error under the selection distribution. Temperature is held fixed.
//!
//! Center gradients are backpropagated through the costs: with
//! `m = e - centers[c][code[c]] + centers[c][k]`, `∂s/∂centers[c][k] = 2m` and
//! the same `2m` reaches the current center of every other codebook.

use super::{candidate_costs, check_pair, RowScratch};
use crate::codebook::CodebookBank;
use crate::constants::numeric::{ENERGY_EPSILON, USAGE_EPSILON};
use crate::constants::refine::TEMPERATURE_GAIN;
use crate::error::{QuantizerError, Result};
use crate::objective::{CenterGradient, LossGradients, TemperatureGradient};
use crate::types::{Codes, Frames};
use rand::Rng;
use rayon::prelude::*;

/// Output of a stochastic refinement step in training mode.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainStep {
    /// Sampled code tuples, one per frame.
    pub codes: Codes,
    /// `ln K` minus the mean usage entropy of the batch-averaged distributions.
    pub entropy_loss: f32,
    /// Mean entropy of the per-frame selection distributions.
    pub frame_entropy: f32,
    /// Expected squared error per codebook, relative to the batch energy.
    pub reconstruction_loss: f32,
    /// Gradients of the three terms above.
    pub gradients: LossGradients,
}

/// Softmax summary for one (frame, codebook) pair.
#[derive(Debug, Clone, Copy, Default)]
struct SelectionStats {
    entropy: f32,
    mean_cost: f32,
    cost_variance: f32,
}

/// Costs, selection probabilities and per-codebook bases for a whole batch.
struct SelectionTable {
    /// `[B][C][K]`
    costs: Vec<f32>,
    /// `[B][C][K]`
    probs: Vec<f32>,
    /// `[B][C]`
    stats: Vec<SelectionStats>,
    /// `[B][C][D]`, `e - centers[c][code[c]]`
    bases: Vec<f32>,
}

/// Fill `probs` with `softmax(-beta · costs)` and summarize the distribution.
fn softmax_stats(costs: &[f32], beta: f32, probs: &mut [f32]) -> SelectionStats {
    let min = costs.iter().copied().fold(f32::INFINITY, f32::min);
    let mut z = 0.0f32;
    for (p, &s) in probs.iter_mut().zip(costs) {
        *p = (-beta * (s - min)).exp();
        z += *p;
    }
    let ln_z = z.ln();

    let mut entropy = 0.0f32;
    let mut mean_cost = 0.0f32;
    for (p, &s) in probs.iter_mut().zip(costs) {
        *p /= z;
        if *p > 0.0 {
            // -ln p = β (s - min) + ln z
            entropy += *p * (beta * (s - min) + ln_z);
        }
        mean_cost += *p * s;
    }
    let cost_variance = probs
        .iter()
        .zip(costs)
        .map(|(&p, &s)| p * (s - mean_cost) * (s - mean_cost))
        .sum();

    SelectionStats {
        entropy,
        mean_cost,
        cost_variance,
    }
}

/// Inverse-CDF draw from a categorical distribution.
fn sample_index<R: Rng + ?Sized>(probs: &[f32], rng: &mut R) -> u32 {
    let u: f32 = rng.gen();
    let mut acc = 0.0f32;
    let mut last = 0;
    for (k, &p) in probs.iter().enumerate() {
        if p > 0.0 {
            last = k;
            acc += p;
            if u < acc {
                return k as u32;
            }
        }
    }
    // rounding left the cumulative sum just short of u
    last as u32
}

fn score_batch(bank: &CodebookBank, frames: &Frames, codes: &[u32]) -> SelectionTable {
    let c_count = bank.num_codebooks();
    let k_size = bank.codebook_size();
    let dim = bank.dim();
    let n = frames.num_frames();
    let ck = c_count * k_size;
    let beta = bank.scale();

    let mut costs = vec![0.0f32; n * ck];
    let mut probs = vec![0.0f32; n * ck];
    let mut stats = vec![SelectionStats::default(); n * c_count];
    let mut bases = vec![0.0f32; n * c_count * dim];

    costs
        .par_chunks_mut(ck)
        .zip(probs.par_chunks_mut(ck))
        .zip(stats.par_chunks_mut(c_count))
        .zip(bases.par_chunks_mut(c_count * dim))
        .zip(frames.data().par_chunks(dim).zip(codes.par_chunks(c_count)))
        .for_each_init(
            || RowScratch::new(bank),
            |scratch, ((((row_costs, row_probs), row_stats), row_bases), (x, code))| {
                candidate_costs(bank, x, code, &mut scratch.residual, row_costs, Some(row_bases));
                for (c, stat) in row_stats.iter_mut().enumerate() {
                    let range = c * k_size..(c + 1) * k_size;
                    *stat = softmax_stats(&row_costs[range.clone()], beta, &mut row_probs[range]);
                }
            },
        );

    SelectionTable {
        costs,
        probs,
        stats,
        bases,
    }
}

/// Draw one index per frame and codebook, sequentially from `rng`.
fn sample_all<R: Rng + ?Sized>(probs: &[f32], k_size: usize, rng: &mut R) -> Vec<u32> {
    probs
        .chunks_exact(k_size)
        .map(|p| sample_index(p, rng))
        .collect()
}

/// Backpropagate per-cost upstream gradients `u[b][c][k]` into the centers.
fn backprop_costs(bank: &CodebookBank, codes: &[u32], bases: &[f32], upstream: &[f32]) -> Vec<f32> {
    let c_count = bank.num_codebooks();
    let k_size = bank.codebook_size();
    let dim = bank.dim();
    let n = codes.len() / c_count;

    // v[b][c] = Σ_k 2·u[b][c][k]·(base[b][c] + centers[c][k])
    let mut v = vec![0.0f32; n * c_count * dim];
    v.par_chunks_mut(c_count * dim)
        .zip(bases.par_chunks(c_count * dim))
        .zip(upstream.par_chunks(c_count * k_size))
        .for_each(|((row_v, row_bases), row_u)| {
            for c in 0..c_count {
                let out = &mut row_v[c * dim..(c + 1) * dim];
                let base = &row_bases[c * dim..(c + 1) * dim];
                let u = &row_u[c * k_size..(c + 1) * k_size];
                let u_sum: f32 = u.iter().sum();
                for (o, &b) in out.iter_mut().zip(base) {
                    *o = u_sum * b;
                }
                for (k, &w) in u.iter().enumerate() {
                    if w == 0.0 {
                        continue;
                    }
                    for (o, &x) in out.iter_mut().zip(bank.center(c, k)) {
                        *o += w * x;
                    }
                }
                for o in out.iter_mut() {
                    *o *= 2.0;
                }
            }
        });

    let mut totals = vec![0.0f32; n * dim];
    totals
        .par_chunks_mut(dim)
        .zip(v.par_chunks(c_count * dim))
        .for_each(|(total, row_v)| {
            for part in row_v.chunks_exact(dim) {
                for (t, &x) in total.iter_mut().zip(part) {
                    *t += x;
                }
            }
        });

    let mut grad = vec![0.0f32; c_count * k_size * dim];
    grad.par_chunks_mut(k_size * dim)
        .enumerate()
        .for_each(|(c, g)| {
            for b in 0..n {
                let row = b * c_count + c;
                let base = &bases[row * dim..(row + 1) * dim];
                let u = &upstream[row * k_size..(row + 1) * k_size];
                for (k, &w) in u.iter().enumerate() {
                    if w == 0.0 {
                        continue;
                    }
                    let w2 = 2.0 * w;
                    let g_k = &mut g[k * dim..(k + 1) * dim];
                    for ((gv, &bv), &cv) in g_k.iter_mut().zip(base).zip(bank.center(c, k)) {
                        *gv += w2 * (bv + cv);
                    }
                }

                // every other codebook's costs include this codebook's current center
                let cur = codes[row] as usize;
                let own = &v[row * dim..(row + 1) * dim];
                let total = &totals[b * dim..(b + 1) * dim];
                let g_cur = &mut g[cur * dim..(cur + 1) * dim];
                for ((gv, &t), &o) in g_cur.iter_mut().zip(total).zip(own) {
                    *gv += t - o;
                }
            }
        });

    grad
}

/// Run one stochastic step: sample new codes and compute the training signals.
pub(crate) fn train_step_unchecked<R: Rng + ?Sized>(
    bank: &CodebookBank,
    frames: &Frames,
    codes: &[u32],
    rng: &mut R,
) -> TrainStep {
    let c_count = bank.num_codebooks();
    let k_size = bank.codebook_size();
    let n = frames.num_frames();
    let beta = bank.scale();
    let pairs = (n * c_count) as f64;

    let table = score_batch(bank, frames, codes);
    let sampled = sample_all(&table.probs, k_size, rng);

    // frame entropy: temperature side only
    let frame_entropy = table.stats.iter().map(|s| f64::from(s.entropy)).sum::<f64>() / pairs;
    let mean_variance = table
        .stats
        .iter()
        .map(|s| f64::from(s.cost_variance))
        .sum::<f64>()
        / pairs;
    // β² may exceed the f32 range even when the product is representable
    let d_frame_entropy = (-f64::from(TEMPERATURE_GAIN) * f64::from(beta) * f64::from(beta)
        * mean_variance)
        .max(-f64::from(f32::MAX));

    // reconstruction: expected squared error per codebook, relative to energy
    let energy = frames.energy() + ENERGY_EPSILON;
    let expected_sumsq = table.stats.iter().map(|s| f64::from(s.mean_cost)).sum::<f64>();
    let reconstruction_loss = expected_sumsq / c_count as f64 / energy;

    // usage: batch-averaged selection probability per candidate
    let mut avg = vec![0.0f64; c_count * k_size];
    for row in table.probs.chunks_exact(c_count * k_size) {
        for (a, &p) in avg.iter_mut().zip(row) {
            *a += f64::from(p);
        }
    }
    for a in avg.iter_mut() {
        *a /= n as f64;
    }
    let eps = f64::from(USAGE_EPSILON);
    let class_entropy = avg
        .chunks_exact(k_size)
        .map(|a| -a.iter().map(|&p| p * (p + eps).ln()).sum::<f64>())
        .sum::<f64>()
        / c_count as f64;
    let entropy_loss = (k_size as f64).ln() - class_entropy;

    // d entropy_loss / d p[b][c][k]; identical for every frame
    let usage_grad: Vec<f32> = avg
        .iter()
        .map(|&a| (((a + eps).ln() + a / (a + eps)) / pairs) as f32)
        .collect();

    let recon_scale = (1.0 / (c_count as f64 * energy)) as f32;
    let ck = c_count * k_size;
    let mut upstream_recon = vec![0.0f32; n * ck];
    let mut upstream_usage = vec![0.0f32; n * ck];
    upstream_recon
        .par_chunks_mut(k_size)
        .zip(upstream_usage.par_chunks_mut(k_size))
        .zip(table.costs.par_chunks(k_size))
        .zip(table.probs.par_chunks(k_size))
        .zip(table.stats.par_iter())
        .enumerate()
        .for_each(|(row, ((((u_r, u_h), s), p), stat))| {
            let c = row % c_count;
            let g = &usage_grad[c * k_size..(c + 1) * k_size];
            let g_mean: f32 = g.iter().zip(p).map(|(&gk, &pk)| gk * pk).sum();
            for k in 0..k_size {
                // ∂(Σ p·s)/∂s_k = p_k (1 - β (s_k - Σ p·s))
                // β·p stays finite even at a saturated scale
                let beta_p = beta * p[k];
                u_r[k] = recon_scale * (p[k] - beta_p * (s[k] - stat.mean_cost));
                // ∂/∂s_k of Σ_j g_j p_j = -β p_k (g_k - Σ_j g_j p_j)
                u_h[k] = -beta_p * (g[k] - g_mean);
            }
        });

    let gradients = LossGradients {
        reconstruction: CenterGradient::new(backprop_costs(bank, codes, &table.bases, &upstream_recon)),
        entropy: CenterGradient::new(backprop_costs(bank, codes, &table.bases, &upstream_usage)),
        frame_entropy: TemperatureGradient(d_frame_entropy as f32),
    };

    TrainStep {
        codes: Codes::with_leading_shape(&[n], c_count, sampled),
        entropy_loss: entropy_loss as f32,
        frame_entropy: frame_entropy as f32,
        reconstruction_loss: reconstruction_loss as f32,
        gradients,
    }
}

/// Sample new codes without computing any training signal.
pub(crate) fn sample_unchecked<R: Rng + ?Sized>(
    bank: &CodebookBank,
    frames: &Frames,
    codes: &[u32],
    rng: &mut R,
) -> Vec<u32> {
    let table = score_batch(bank, frames, codes);
    sample_all(&table.probs, bank.codebook_size(), rng)
}

/// Run one stochastic refinement step in training mode.
///
/// Sampling draws from `rng` in frame-major, codebook-minor order, so a seeded
/// RNG reproduces the same codes regardless of the thread count.
///
/// # Errors
/// Returns an error if the frames or codes do not match the bank, or
/// [`QuantizerError::EmptyBatch`] for a batch without frames.
pub fn refine_stochastic<R: Rng + ?Sized>(
    bank: &CodebookBank,
    frames: &Frames,
    codes: &Codes,
    rng: &mut R,
) -> Result<TrainStep> {
    check_pair(bank, frames, codes)?;
    if frames.num_frames() == 0 {
        return Err(QuantizerError::EmptyBatch);
    }
    let mut step = train_step_unchecked(bank, frames, codes.data(), rng);
    step.codes = Codes::with_leading_shape(
        codes.leading_shape(),
        bank.num_codebooks(),
        step.codes.into_data(),
    );
    Ok(step)
}

/// Run one stochastic refinement step, returning only the sampled codes.
///
/// # Errors
/// Returns an error if the frames or codes do not match the bank.
pub fn sample_stochastic<R: Rng + ?Sized>(
    bank: &CodebookBank,
    frames: &Frames,
    codes: &Codes,
    rng: &mut R,
) -> Result<Codes> {
    check_pair(bank, frames, codes)?;
    let data = sample_unchecked(bank, frames, codes.data(), rng);
    Ok(Codes::with_leading_shape(
        codes.leading_shape(),
        bank.num_codebooks(),
        data,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_problem(seed: u64) -> (CodebookBank, Frames, Codes) {
        let mut rng = StdRng::seed_from_u64(seed);
        let bank = CodebookBank::with_rng(3, 3, 2, &mut rng).unwrap();
        let data: Vec<f32> = (0..4 * 3).map(|_| rng.gen_range(-0.8..0.8)).collect();
        let frames = Frames::from_flat(data, 3).unwrap();
        let codes: Vec<u32> = (0..4 * 2).map(|_| rng.gen_range(0..3)).collect();
        (bank, frames, Codes::new(vec![4, 2], codes).unwrap())
    }

    fn losses(bank: &CodebookBank, frames: &Frames, codes: &Codes) -> (f32, f32, f32) {
        let step = refine_stochastic(bank, frames, codes, &mut StdRng::seed_from_u64(0)).unwrap();
        (step.reconstruction_loss, step.entropy_loss, step.frame_entropy)
    }

    fn assert_close(analytic: f32, numeric: f32, what: &str) {
        let tol = 3e-3 + 5e-2 * analytic.abs().max(numeric.abs());
        assert!(
            (analytic - numeric).abs() <= tol,
            "{}: analytic {} vs finite difference {}",
            what,
            analytic,
            numeric
        );
    }

    #[test]
    fn test_softmax_stats_uniform() {
        let mut probs = [0.0f32; 4];
        let stats = softmax_stats(&[2.0; 4], 1.0, &mut probs);
        for p in probs {
            assert!((p - 0.25).abs() < 1e-6);
        }
        assert!((stats.entropy - 4.0f32.ln()).abs() < 1e-6);
        assert!(stats.cost_variance.abs() < 1e-6);
    }

    #[test]
    fn test_sample_index_follows_support() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            assert_eq!(sample_index(&[0.0, 1.0, 0.0], &mut rng), 1);
        }
    }

    #[test]
    fn test_sample_frequencies() {
        let mut rng = StdRng::seed_from_u64(2);
        let probs = [0.1f32, 0.6, 0.3];
        let mut counts = [0usize; 3];
        for _ in 0..20_000 {
            counts[sample_index(&probs, &mut rng) as usize] += 1;
        }
        for (count, p) in counts.iter().zip(probs) {
            let freq = *count as f32 / 20_000.0;
            assert!((freq - p).abs() < 0.02, "freq {} vs p {}", freq, p);
        }
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let (bank, frames, codes) = small_problem(5);
        let a = sample_stochastic(&bank, &frames, &codes, &mut StdRng::seed_from_u64(9)).unwrap();
        let b = sample_stochastic(&bank, &frames, &codes, &mut StdRng::seed_from_u64(9)).unwrap();
        assert_eq!(a, b);
        let step = refine_stochastic(&bank, &frames, &codes, &mut StdRng::seed_from_u64(9)).unwrap();
        assert_eq!(step.codes, a);
    }

    #[test]
    fn test_center_gradients_match_finite_differences() {
        let (bank, frames, codes) = small_problem(11);
        let step = refine_stochastic(&bank, &frames, &codes, &mut StdRng::seed_from_u64(0)).unwrap();
        let h = 4e-3f32;

        for i in 0..bank.centers().len() {
            let mut plus = bank.clone();
            plus.centers_mut()[i] += h;
            let mut minus = bank.clone();
            minus.centers_mut()[i] -= h;
            let (r_p, e_p, _) = losses(&plus, &frames, &codes);
            let (r_m, e_m, _) = losses(&minus, &frames, &codes);

            assert_close(
                step.gradients.reconstruction.values()[i],
                (r_p - r_m) / (2.0 * h),
                &format!("reconstruction param {}", i),
            );
            assert_close(
                step.gradients.entropy.values()[i],
                (e_p - e_m) / (2.0 * h),
                &format!("entropy param {}", i),
            );
        }
    }

    #[test]
    fn test_temperature_gradient_matches_finite_difference() {
        let (mut bank, frames, codes) = small_problem(13);
        bank.set_temperature(0.05);
        let step = refine_stochastic(&bank, &frames, &codes, &mut StdRng::seed_from_u64(0)).unwrap();
        let h = 1e-3f32;

        let mut plus = bank.clone();
        plus.set_temperature(bank.temperature() + h);
        let mut minus = bank.clone();
        minus.set_temperature(bank.temperature() - h);
        let (_, _, f_p) = losses(&plus, &frames, &codes);
        let (_, _, f_m) = losses(&minus, &frames, &codes);

        let analytic = step.gradients.frame_entropy.0;
        assert!(analytic <= 0.0, "sharper distributions must lower entropy");
        assert_close(analytic, (f_p - f_m) / (2.0 * h), "temperature");
    }

    #[test]
    fn test_uniform_usage_has_zero_entropy_loss() {
        // every center of a codebook is identical, so every candidate costs the same
        let centers = vec![0.5, -0.5, 0.5, -0.5, 0.5, -0.5, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0];
        let bank = CodebookBank::from_centers(2, 3, 2, centers).unwrap();
        let frames = Frames::from_rows(&[vec![0.3, 0.1], vec![-1.0, 2.0]]).unwrap();
        let codes = Codes::zeros(2, 2);
        let step = refine_stochastic(&bank, &frames, &codes, &mut StdRng::seed_from_u64(0)).unwrap();

        assert!(step.entropy_loss.abs() < 1e-6, "entropy_loss {}", step.entropy_loss);
        assert!((step.frame_entropy - 3.0f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_skewed_usage_has_positive_entropy_loss() {
        let (bank, frames, codes) = small_problem(17);
        let step = refine_stochastic(&bank, &frames, &codes, &mut StdRng::seed_from_u64(0)).unwrap();
        assert!(step.entropy_loss > 1e-6, "entropy_loss {}", step.entropy_loss);
    }

    #[test]
    fn test_saturated_temperature_stays_finite() {
        let mut rng = StdRng::seed_from_u64(8);
        let mut bank = CodebookBank::with_rng(6, 4, 2, &mut rng).unwrap();
        let data: Vec<f32> = (0..16 * 6).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let frames = Frames::from_flat(data, 6).unwrap();
        let codes: Vec<u32> = (0..16 * 2).map(|_| rng.gen_range(0..4)).collect();
        let codes = Codes::new(vec![16, 2], codes).unwrap();

        for temperature in [5.0f32, 8.0, 9.0, 12.0, 50.0] {
            bank.set_temperature(temperature);
            let step = refine_stochastic(&bank, &frames, &codes, &mut rng).unwrap();

            assert!(
                step.frame_entropy >= 0.0 && step.frame_entropy <= 4.0f32.ln() + 1e-5,
                "T={}: frame_entropy {}",
                temperature,
                step.frame_entropy
            );
            assert!(step.entropy_loss.is_finite(), "T={}", temperature);
            assert!(step.reconstruction_loss.is_finite(), "T={}", temperature);
            assert!(step.gradients.frame_entropy.0.is_finite(), "T={}", temperature);
            assert!(step.gradients.reconstruction.values().iter().all(|g| g.is_finite()));
            assert!(step.gradients.entropy.values().iter().all(|g| g.is_finite()));
        }
    }

    #[test]
    fn test_one_hot_softmax_at_max_scale() {
        let mut probs = [0.0f32; 3];
        let stats = softmax_stats(&[0.5, 0.2, 0.9], f32::MAX, &mut probs);
        assert_eq!(probs, [0.0, 1.0, 0.0]);
        assert_eq!(stats.entropy, 0.0);
        assert_eq!(stats.mean_cost, 0.2);
        assert_eq!(stats.cost_variance, 0.0);
    }

    #[test]
    fn test_empty_batch_rejected() {
        let bank = CodebookBank::new(2, 2, 1).unwrap();
        let frames = Frames::new(vec![0, 2], vec![]).unwrap();
        let codes = Codes::new(vec![0, 1], vec![]).unwrap();
        let err = refine_stochastic(&bank, &frames, &codes, &mut StdRng::seed_from_u64(0)).unwrap_err();
        assert_eq!(err, QuantizerError::EmptyBatch);
    }
}
