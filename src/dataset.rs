//! Training data sources.
//!
//! [`FrameSource`] is the seam the trainer pulls batches through.
//! [`SyntheticSource`] is a seeded generator of clustered frames used by the
//! tests, benches and demo.

use crate::error::{QuantizerError, Result};
use crate::types::Frames;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Anything that can hand out batches of `D`-dimensional frames.
pub trait FrameSource {
    /// Frame dimension `D`.
    fn dim(&self) -> usize;

    /// Produce the next batch of `batch_size` frames, shaped `[batch_size, D]`.
    fn next_batch(&mut self, batch_size: usize) -> Result<Frames>;
}

/// Gaussian clusters around fixed random means.
///
/// Means are drawn once from `N(0, 1/dim)` per coordinate, so they have roughly
/// unit norm; each sample is a uniformly chosen mean plus isotropic noise.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    means: Vec<f32>,
    dim: usize,
    num_clusters: usize,
    noise_std: f32,
    rng: StdRng,
}

impl SyntheticSource {
    /// Create a source with `num_clusters` means in `dim` dimensions.
    ///
    /// `noise_std` is the per-coordinate standard deviation of the noise.
    pub fn new(dim: usize, num_clusters: usize, noise_std: f32, seed: u64) -> Result<Self> {
        if dim == 0 || num_clusters == 0 {
            return Err(QuantizerError::invalid_parameter(
                "dim and num_clusters must be > 0",
            ));
        }
        if !(noise_std >= 0.0 && noise_std.is_finite()) {
            return Err(QuantizerError::invalid_parameter(format!(
                "noise_std must be finite and >= 0, got {}",
                noise_std
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let std_dev = (dim as f32).powf(-0.5);
        let means = (0..num_clusters * dim)
            .map(|_| std_dev * rng.sample::<f32, _>(StandardNormal))
            .collect();

        Ok(Self {
            means,
            dim,
            num_clusters,
            noise_std,
            rng,
        })
    }

    /// Number of cluster means.
    pub fn num_clusters(&self) -> usize {
        self.num_clusters
    }

    /// Cluster mean `i`.
    pub fn mean(&self, i: usize) -> &[f32] {
        &self.means[i * self.dim..(i + 1) * self.dim]
    }

    /// Generate `n` frames shaped `[n, D]`.
    pub fn generate(&mut self, n: usize) -> Result<Frames> {
        let mut data = Vec::with_capacity(n * self.dim);
        for _ in 0..n {
            let cluster = self.rng.gen_range(0..self.num_clusters);
            let start = cluster * self.dim;
            for &m in &self.means[start..start + self.dim] {
                let noise: f32 = self.rng.sample(StandardNormal);
                data.push(m + self.noise_std * noise);
            }
        }
        Frames::from_flat(data, self.dim)
    }
}

impl FrameSource for SyntheticSource {
    fn dim(&self) -> usize {
        self.dim
    }

    fn next_batch(&mut self, batch_size: usize) -> Result<Frames> {
        if batch_size == 0 {
            return Err(QuantizerError::EmptyBatch);
        }
        self.generate(batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_shape() {
        let mut source = SyntheticSource::new(16, 4, 0.1, 0).unwrap();
        let frames = source.next_batch(100).unwrap();
        assert_eq!(frames.shape(), &[100, 16]);
        assert_eq!(source.dim(), 16);
        assert_eq!(source.num_clusters(), 4);
    }

    #[test]
    fn test_seeded_source_is_reproducible() {
        let mut a = SyntheticSource::new(8, 3, 0.05, 42).unwrap();
        let mut b = SyntheticSource::new(8, 3, 0.05, 42).unwrap();
        assert_eq!(a.generate(10).unwrap(), b.generate(10).unwrap());
        assert_eq!(a.generate(10).unwrap(), b.generate(10).unwrap());
    }

    #[test]
    fn test_noiseless_samples_are_means() {
        let mut source = SyntheticSource::new(4, 2, 0.0, 1).unwrap();
        let frames = source.generate(20).unwrap();
        for row in frames.rows() {
            assert!(row == source.mean(0) || row == source.mean(1));
        }
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(SyntheticSource::new(0, 2, 0.1, 0).is_err());
        assert!(SyntheticSource::new(4, 0, 0.1, 0).is_err());
        assert!(SyntheticSource::new(4, 2, -1.0, 0).is_err());

        let mut source = SyntheticSource::new(4, 2, 0.1, 0).unwrap();
        assert_eq!(source.next_batch(0).unwrap_err(), QuantizerError::EmptyBatch);
    }
}
