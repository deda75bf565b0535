//! Trainable codebook parameters.
//!
//! A [`CodebookBank`] owns `C` independent codebooks of `K` centers each,
//! all of dimension `D`, plus a scalar temperature that controls how sharp the
//! stochastic selection distribution is during training. The bank has no
//! behavior beyond storage: refinement and loss functions borrow it, and an
//! external optimizer mutates it between calls.

use crate::constants::refine::TEMPERATURE_GAIN;
use crate::error::{QuantizerError, Result};
use rand::Rng;
use rand_distr::StandardNormal;

/// Codebook centers `[C][K][D]` (flat, row-major) and the learned temperature.
#[derive(Debug, Clone, PartialEq)]
pub struct CodebookBank {
    centers: Vec<f32>,
    temperature: f32,
    dim: usize,
    codebook_size: usize,
    num_codebooks: usize,
}

fn validate(dim: usize, codebook_size: usize, num_codebooks: usize) -> Result<()> {
    if dim == 0 {
        return Err(QuantizerError::invalid_parameter("dim must be > 0"));
    }
    if codebook_size < 2 {
        return Err(QuantizerError::invalid_parameter(format!(
            "codebook_size must be > 1, got {}",
            codebook_size
        )));
    }
    if u32::try_from(codebook_size).is_err() {
        return Err(QuantizerError::invalid_parameter(format!(
            "codebook_size {} does not fit a u32 code",
            codebook_size
        )));
    }
    if num_codebooks == 0 {
        return Err(QuantizerError::invalid_parameter("num_codebooks must be > 0"));
    }
    Ok(())
}

impl CodebookBank {
    /// Create a randomly initialized bank using the thread-local RNG.
    ///
    /// Centers are drawn i.i.d. from `N(0, 1/dim)`; the temperature starts at 0.
    pub fn new(dim: usize, codebook_size: usize, num_codebooks: usize) -> Result<Self> {
        Self::with_rng(dim, codebook_size, num_codebooks, &mut rand::thread_rng())
    }

    /// Create a randomly initialized bank from the given RNG.
    pub fn with_rng<R: Rng + ?Sized>(
        dim: usize,
        codebook_size: usize,
        num_codebooks: usize,
        rng: &mut R,
    ) -> Result<Self> {
        validate(dim, codebook_size, num_codebooks)?;
        let std_dev = (dim as f32).powf(-0.5);
        let centers = (0..num_codebooks * codebook_size * dim)
            .map(|_| std_dev * rng.sample::<f32, _>(StandardNormal))
            .collect();
        Ok(Self {
            centers,
            temperature: 0.0,
            dim,
            codebook_size,
            num_codebooks,
        })
    }

    /// Create a bank from explicit center values laid out as `[C][K][D]`.
    ///
    /// # Errors
    /// Returns `InvalidParameter` for invalid sizes and `ShapeMismatch` if
    /// `centers.len() != num_codebooks * codebook_size * dim`.
    pub fn from_centers(
        dim: usize,
        codebook_size: usize,
        num_codebooks: usize,
        centers: Vec<f32>,
    ) -> Result<Self> {
        validate(dim, codebook_size, num_codebooks)?;
        let expected = num_codebooks * codebook_size * dim;
        if centers.len() != expected {
            return Err(QuantizerError::shape_mismatch(expected, centers.len()));
        }
        Ok(Self {
            centers,
            temperature: 0.0,
            dim,
            codebook_size,
            num_codebooks,
        })
    }

    /// Vector dimension `D`.
    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Centers per codebook `K`.
    #[inline]
    pub fn codebook_size(&self) -> usize {
        self.codebook_size
    }

    /// Number of codebooks `C`.
    #[inline]
    pub fn num_codebooks(&self) -> usize {
        self.num_codebooks
    }

    /// Center `k` of codebook `c`.
    #[inline]
    pub fn center(&self, c: usize, k: usize) -> &[f32] {
        let start = (c * self.codebook_size + k) * self.dim;
        &self.centers[start..start + self.dim]
    }

    /// All `K` centers of codebook `c`, flat `[K][D]`.
    #[inline]
    pub fn codebook(&self, c: usize) -> &[f32] {
        let stride = self.codebook_size * self.dim;
        &self.centers[c * stride..(c + 1) * stride]
    }

    /// All centers, flat `[C][K][D]`.
    pub fn centers(&self) -> &[f32] {
        &self.centers
    }

    /// Mutable access to all centers for an external optimizer.
    pub fn centers_mut(&mut self) -> &mut [f32] {
        &mut self.centers
    }

    /// The raw (unconstrained) temperature parameter.
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Overwrite the raw temperature parameter.
    pub fn set_temperature(&mut self, temperature: f32) {
        self.temperature = temperature;
    }

    /// Selection scale `exp(10 · temperature)` applied to negated costs.
    ///
    /// Saturates at `f32::MAX` so a large temperature yields a one-hot
    /// selection instead of an infinite scale.
    #[inline]
    pub fn scale(&self) -> f32 {
        (TEMPERATURE_GAIN * self.temperature).exp().min(f32::MAX)
    }

    /// Total number of trainable scalars (centers plus temperature).
    pub fn num_parameters(&self) -> usize {
        self.centers.len() + 1
    }

    /// Number of bits needed to store one code tuple, `C · ⌈log2 K⌉`.
    pub fn bits_per_code(&self) -> usize {
        let bits = usize::BITS - (self.codebook_size - 1).leading_zeros();
        self.num_codebooks * bits as usize
    }

    /// Sum of the selected centers for one code tuple, written into `out`.
    ///
    /// Indices must already be validated to lie in `[0, K)`.
    #[inline]
    pub(crate) fn reconstruct_into(&self, code: &[u32], out: &mut [f32]) {
        out.fill(0.0);
        for (c, &k) in code.iter().enumerate() {
            for (o, &v) in out.iter_mut().zip(self.center(c, k as usize)) {
                *o += v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_bank_shapes() {
        let bank = CodebookBank::new(8, 16, 4).unwrap();
        assert_eq!(bank.centers().len(), 4 * 16 * 8);
        assert_eq!(bank.center(3, 15).len(), 8);
        assert_eq!(bank.codebook(2).len(), 16 * 8);
        assert_eq!(bank.temperature(), 0.0);
        assert!((bank.scale() - 1.0).abs() < 1e-6);
        assert_eq!(bank.num_parameters(), 4 * 16 * 8 + 1);
    }

    #[test]
    fn test_invalid_sizes() {
        assert!(CodebookBank::new(0, 4, 2).is_err());
        assert!(CodebookBank::new(4, 1, 2).is_err());
        assert!(CodebookBank::new(4, 4, 0).is_err());
        assert!(CodebookBank::from_centers(2, 2, 1, vec![0.0; 3]).is_err());
    }

    #[test]
    fn test_init_variance_scales_with_dim() {
        let mut rng = StdRng::seed_from_u64(7);
        for dim in [4usize, 64, 256] {
            let bank = CodebookBank::with_rng(dim, 64, 4, &mut rng).unwrap();
            let n = bank.centers().len() as f64;
            let var: f64 = bank.centers().iter().map(|&v| f64::from(v).powi(2)).sum::<f64>() / n;
            let expected = 1.0 / dim as f64;
            assert!(
                (var - expected).abs() < 0.25 * expected,
                "dim {}: variance {} vs expected {}",
                dim,
                var,
                expected
            );
        }
    }

    #[test]
    fn test_seeded_init_is_reproducible() {
        let a = CodebookBank::with_rng(8, 4, 2, &mut StdRng::seed_from_u64(3)).unwrap();
        let b = CodebookBank::with_rng(8, 4, 2, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_scale_saturates() {
        let mut bank = CodebookBank::new(2, 2, 1).unwrap();
        bank.set_temperature(12.0);
        assert_eq!(bank.scale(), f32::MAX);
        bank.set_temperature(-1.0);
        assert!((bank.scale() - (-10.0f32).exp()).abs() < 1e-9);
    }

    #[test]
    fn test_bits_per_code() {
        let bank = CodebookBank::new(4, 16, 8).unwrap();
        assert_eq!(bank.bits_per_code(), 32);
        let bank = CodebookBank::new(4, 5, 2).unwrap();
        assert_eq!(bank.bits_per_code(), 6);
    }

    #[test]
    fn test_reconstruct_into() {
        let bank = CodebookBank::from_centers(2, 2, 2, vec![1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0])
            .unwrap();
        let mut out = [0.0f32; 2];
        bank.reconstruct_into(&[1, 0], &mut out);
        assert_eq!(out, [0.0, 2.0]);
    }
}
