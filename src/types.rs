//! Shape-aware batches of frames and codes.
//!
//! Inputs to the quantizer may have any number of leading dimensions; the
//! batch is their flattened product and the trailing dimension is the vector
//! dimension (for [`Frames`]) or the number of codebooks (for [`Codes`]).
//! Both types keep the full shape so encoding and decoding can restore it.

use crate::error::{QuantizerError, Result};
use std::fmt;

/// Validate a shape against a data length and return the trailing dimension.
fn check_shape(shape: &[usize], len: usize) -> Result<usize> {
    let trailing = *shape
        .last()
        .ok_or_else(|| QuantizerError::invalid_parameter("shape must have at least one dimension"))?;
    if trailing == 0 {
        return Err(QuantizerError::invalid_parameter(
            "trailing dimension must be > 0",
        ));
    }
    let expected: usize = shape.iter().product();
    if expected != len {
        return Err(QuantizerError::shape_mismatch(expected, len));
    }
    Ok(trailing)
}

fn format_shape(shape: &[usize]) -> String {
    shape
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("x")
}

/// A batch of float vectors with shape `(..., dim)`, stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Frames {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Frames {
    /// Create frames from a full shape (leading dimensions followed by `dim`).
    ///
    /// # Errors
    /// Returns [`QuantizerError::ShapeMismatch`] if the shape does not describe
    /// `data.len()` elements, or `InvalidParameter` for an empty shape or a
    /// zero trailing dimension.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        check_shape(&shape, data.len())?;
        Ok(Self { shape, data })
    }

    /// Create a `(n, dim)` batch from flat row-major data.
    pub fn from_flat(data: Vec<f32>, dim: usize) -> Result<Self> {
        if dim == 0 || data.len() % dim != 0 {
            return Err(QuantizerError::invalid_parameter(format!(
                "{} values cannot be split into rows of dimension {}",
                data.len(),
                dim
            )));
        }
        let n = data.len() / dim;
        Self::new(vec![n, dim], data)
    }

    /// Create a `(n, dim)` batch from individual rows.
    ///
    /// # Errors
    /// Returns [`QuantizerError::EmptyBatch`] for no rows and
    /// `DimensionMismatch` if rows have different lengths.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let dim = rows.first().ok_or(QuantizerError::EmptyBatch)?.len();
        let mut data = Vec::with_capacity(rows.len() * dim);
        for row in rows {
            if row.len() != dim {
                return Err(QuantizerError::dimension_mismatch(dim, row.len()));
            }
            data.extend_from_slice(row);
        }
        Self::new(vec![rows.len(), dim], data)
    }

    /// The full shape, including the trailing vector dimension.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// All dimensions except the trailing one.
    pub fn leading_shape(&self) -> &[usize] {
        &self.shape[..self.shape.len() - 1]
    }

    /// The trailing (vector) dimension.
    pub fn dim(&self) -> usize {
        self.shape[self.shape.len() - 1]
    }

    /// Number of frames: the product of the leading dimensions.
    pub fn num_frames(&self) -> usize {
        self.data.len() / self.dim()
    }

    /// Flat row-major data.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Consume the batch and return its flat data.
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Frame `i` as a slice of length `dim`.
    pub fn row(&self, i: usize) -> &[f32] {
        let dim = self.dim();
        &self.data[i * dim..(i + 1) * dim]
    }

    /// Iterate over frames.
    pub fn rows(&self) -> std::slice::ChunksExact<'_, f32> {
        self.data.chunks_exact(self.dim())
    }

    /// Total squared energy `Σ x²`, accumulated in `f64`.
    pub fn energy(&self) -> f64 {
        self.data.iter().map(|&v| f64::from(v) * f64::from(v)).sum()
    }
}

impl fmt::Display for Frames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frames({})", format_shape(&self.shape))
    }
}

/// A batch of code tuples with shape `(..., num_codebooks)`, stored row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codes {
    shape: Vec<usize>,
    data: Vec<u32>,
}

impl Codes {
    /// Create codes from a full shape (leading dimensions followed by the
    /// number of codebooks).
    pub fn new(shape: Vec<usize>, data: Vec<u32>) -> Result<Self> {
        check_shape(&shape, data.len())?;
        Ok(Self { shape, data })
    }

    /// Create a `(n, num_codebooks)` batch from individual code tuples.
    pub fn from_rows(rows: &[Vec<u32>]) -> Result<Self> {
        let c = rows.first().ok_or(QuantizerError::EmptyBatch)?.len();
        let mut data = Vec::with_capacity(rows.len() * c);
        for row in rows {
            if row.len() != c {
                return Err(QuantizerError::code_length_mismatch(c, row.len()));
            }
            data.extend_from_slice(row);
        }
        Self::new(vec![rows.len(), c], data)
    }

    /// All-zero codes for `num_frames` frames.
    pub fn zeros(num_frames: usize, num_codebooks: usize) -> Self {
        Self {
            shape: vec![num_frames, num_codebooks],
            data: vec![0; num_frames * num_codebooks],
        }
    }

    /// Reuse flat code data under a new leading shape.
    pub(crate) fn with_leading_shape(leading: &[usize], num_codebooks: usize, data: Vec<u32>) -> Self {
        let mut shape = leading.to_vec();
        shape.push(num_codebooks);
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { shape, data }
    }

    /// The full shape, including the trailing codebook dimension.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// All dimensions except the trailing one.
    pub fn leading_shape(&self) -> &[usize] {
        &self.shape[..self.shape.len() - 1]
    }

    /// Codes per frame.
    pub fn num_codebooks(&self) -> usize {
        self.shape[self.shape.len() - 1]
    }

    /// Number of frames: the product of the leading dimensions.
    pub fn num_frames(&self) -> usize {
        self.data.len() / self.num_codebooks()
    }

    /// Flat row-major data.
    pub fn data(&self) -> &[u32] {
        &self.data
    }

    /// Consume the batch and return its flat data.
    pub fn into_data(self) -> Vec<u32> {
        self.data
    }

    /// Code tuple of frame `i`.
    pub fn row(&self, i: usize) -> &[u32] {
        let c = self.num_codebooks();
        &self.data[i * c..(i + 1) * c]
    }

    /// Iterate over code tuples.
    pub fn rows(&self) -> std::slice::ChunksExact<'_, u32> {
        self.data.chunks_exact(self.num_codebooks())
    }
}

impl fmt::Display for Codes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Codes({})", format_shape(&self.shape))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_shape() {
        let frames = Frames::new(vec![2, 3, 4], (0..24).map(|v| v as f32).collect()).unwrap();
        assert_eq!(frames.dim(), 4);
        assert_eq!(frames.num_frames(), 6);
        assert_eq!(frames.leading_shape(), &[2, 3]);
        assert_eq!(frames.row(1), &[4.0, 5.0, 6.0, 7.0]);
        assert_eq!(format!("{}", frames), "Frames(2x3x4)");
    }

    #[test]
    fn test_frames_shape_mismatch() {
        let err = Frames::new(vec![2, 4], vec![0.0; 7]).unwrap_err();
        assert_eq!(err, QuantizerError::shape_mismatch(8, 7));

        assert!(Frames::new(vec![], vec![]).is_err());
        assert!(Frames::new(vec![3, 0], vec![]).is_err());
    }

    #[test]
    fn test_frames_from_rows() {
        let frames = Frames::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(frames.shape(), &[2, 2]);
        assert!((frames.energy() - 30.0).abs() < 1e-9);

        let err = Frames::from_rows(&[vec![1.0, 2.0], vec![3.0]]).unwrap_err();
        assert_eq!(err, QuantizerError::dimension_mismatch(2, 1));

        assert_eq!(Frames::from_rows(&[]).unwrap_err(), QuantizerError::EmptyBatch);
    }

    #[test]
    fn test_frames_from_flat() {
        let frames = Frames::from_flat(vec![0.0; 12], 3).unwrap();
        assert_eq!(frames.shape(), &[4, 3]);
        assert!(Frames::from_flat(vec![0.0; 10], 3).is_err());
    }

    #[test]
    fn test_codes_rows() {
        let codes = Codes::from_rows(&[vec![0, 1, 2], vec![3, 4, 5]]).unwrap();
        assert_eq!(codes.num_codebooks(), 3);
        assert_eq!(codes.num_frames(), 2);
        assert_eq!(codes.rows().nth(1).unwrap(), &[3, 4, 5]);

        let zeros = Codes::zeros(4, 2);
        assert!(zeros.data().iter().all(|&c| c == 0));
        assert_eq!(zeros.shape(), &[4, 2]);
    }
}
