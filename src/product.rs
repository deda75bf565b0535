//! Hierarchical product merge of codebook pairs.
//!
//! Merging codebooks `2c` and `2c+1` into a single codebook of size `K²`
//! halves the number of codes per vector. Every merged center is the sum of
//! one center from each source, so before any further training the merged
//! bank reproduces exactly the reconstructions the pair could express jointly:
//!
//! ```text
//! new[c'][k1 * K + k2] = centers[2c'][k1] + centers[2c' + 1][k2]
//! ```
//!
//! Intended for curriculum training: start with many small codebooks and
//! periodically merge pairs into fewer, larger ones.

use crate::codebook::CodebookBank;
use crate::error::{QuantizerError, Result};
use rayon::prelude::*;

impl CodebookBank {
    /// Build a coarser bank with `K' = K²` and `C' = C / 2`.
    ///
    /// The result is a fresh, independent parameter set: values are copied
    /// and its temperature starts at 0.
    ///
    /// # Errors
    /// Returns [`QuantizerError::OddCodebookCount`] if `C` is odd and
    /// `InvalidParameter` if `K²` no longer fits a `u32` code.
    pub fn get_product_quantizer(&self) -> Result<CodebookBank> {
        let num_codebooks = self.num_codebooks();
        if num_codebooks % 2 != 0 {
            return Err(QuantizerError::OddCodebookCount(num_codebooks));
        }

        let k = self.codebook_size();
        let dim = self.dim();
        let new_size = k
            .checked_mul(k)
            .ok_or_else(|| QuantizerError::invalid_parameter("merged codebook size overflows"))?;
        if u32::try_from(new_size).is_err() {
            return Err(QuantizerError::invalid_parameter(format!(
                "merged codebook size {} does not fit a u32 code",
                new_size
            )));
        }
        let new_count = num_codebooks / 2;
        let total = new_count
            .checked_mul(new_size)
            .and_then(|n| n.checked_mul(dim))
            .ok_or_else(|| QuantizerError::invalid_parameter("merged codebook size overflows"))?;

        let mut centers = vec![0.0f32; total];
        centers
            .par_chunks_mut(new_size * dim)
            .enumerate()
            .for_each(|(c_out, out)| {
                let (c_in1, c_in2) = (2 * c_out, 2 * c_out + 1);
                for k1 in 0..k {
                    let a = self.center(c_in1, k1);
                    for k2 in 0..k {
                        let b = self.center(c_in2, k2);
                        let k_out = k1 * k + k2;
                        let dst = &mut out[k_out * dim..(k_out + 1) * dim];
                        for ((d, &x), &y) in dst.iter_mut().zip(a).zip(b) {
                            *d = x + y;
                        }
                    }
                }
            });

        CodebookBank::from_centers(dim, new_size, new_count, centers)
    }
}
