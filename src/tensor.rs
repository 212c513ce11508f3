//! Tensor Operations for Neural Networks
//!
//! This module provides the minimal dense tensor the model is built on.
//! Tensors store multi-dimensional `f32` arrays with shape and stride
//! information for row-major indexing.
//!
//! ## Core Concepts
//!
//! - **Data**: Flat `Vec<f32>` storing all elements in row-major order
//! - **Shape**: Dimensions of the tensor (e.g., `[batch, seq, dim]`)
//! - **Strides**: Step sizes for each dimension to compute flat indices
//!
//! ## Example
//!
//! ```rust
//! use nanogpt::Tensor;
//!
//! // Create a 2x3 matrix
//! let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
//! let tensor = Tensor::new(data, vec![2, 3]);
//!
//! // Matrix multiplication
//! let other = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! let result = tensor.matmul(&other);
//! assert_eq!(result.shape, vec![2, 2]);
//! ```
//!
//! ## Performance
//!
//! Matrix multiplication, softmax and the element-wise operations run in
//! parallel via Rayon. Small matrices fall back to a sequential loop to avoid
//! thread overhead.
//!
//! Shape mismatches are programming errors and panic with a descriptive
//! message, the same way slice indexing does.

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;

/// A multi-dimensional array for neural network computations
///
/// For shape `[2, 3]`, data is stored as
/// `[row0_col0, row0_col1, row0_col2, row1_col0, row1_col1, row1_col2]`
/// and the strides are `[3, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all tensor elements
    pub data: Vec<f32>,
    /// Shape of the tensor (dimensions)
    pub shape: Vec<usize>,
    /// Strides for each dimension (computed from shape)
    pub strides: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor with given data and shape
    ///
    /// # Panics
    ///
    /// Panics if the product of shape dimensions doesn't equal data length
    ///
    /// # Example
    ///
    /// ```rust
    /// # use nanogpt::Tensor;
    /// let tensor = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
    /// assert_eq!(tensor.shape, vec![2, 2]);
    /// ```
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected_size: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_size,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_size
        );

        let strides = Self::compute_strides(&shape);
        Self {
            data,
            shape,
            strides,
        }
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, 0.0)
    }

    /// Create a tensor filled with a constant
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![value; size], shape)
    }

    /// Create a tensor with values drawn from N(0, std²)
    ///
    /// # Example
    ///
    /// ```rust
    /// # use nanogpt::Tensor;
    /// use rand::SeedableRng;
    /// let mut rng = rand::rngs::StdRng::seed_from_u64(0);
    /// let t = Tensor::randn(vec![4, 8], 0.02, &mut rng);
    /// assert_eq!(t.numel(), 32);
    /// ```
    pub fn randn<R: Rng + ?Sized>(shape: Vec<usize>, std: f32, rng: &mut R) -> Self {
        let size: usize = shape.iter().product();
        let data = (0..size)
            .map(|_| {
                let z: f32 = StandardNormal.sample(rng);
                z * std
            })
            .collect();
        Self::new(data, shape)
    }

    /// Compute strides from shape (row-major layout)
    ///
    /// For shape `[d0, d1, d2]`, strides are `[d1*d2, d2, 1]`
    fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Total number of elements
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Number of dimensions
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Size of the last dimension
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// SIMD-friendly inner loop: `result[j] += a_val * b[j]`
    #[inline(always)]
    fn matmul_inner_simd(a_val: f32, b: &[f32], result: &mut [f32]) {
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a_val * b_val;
        }
    }

    /// Matrix multiplication
    ///
    /// Supports:
    /// - 2D × 2D: `[m, k] @ [k, n] -> [m, n]`
    /// - 4D × 4D: batched matmul for attention,
    ///   `[b, h, m, k] @ [b, h, k, n] -> [b, h, m, n]`
    ///
    /// # Panics
    ///
    /// Panics if dimensions are incompatible or unsupported
    ///
    /// # Example
    ///
    /// ```rust
    /// # use nanogpt::Tensor;
    /// let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
    /// let b = Tensor::new(vec![1.0, 0.0, 0.0, 1.0], vec![2, 2]);
    /// let c = a.matmul(&b);
    /// assert_eq!(c.data, vec![1.0, 2.0, 3.0, 4.0]);
    /// ```
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        // === 2D MATRIX MULTIPLICATION ===
        if self.shape.len() == 2 && other.shape.len() == 2 {
            assert_eq!(
                self.shape[1], other.shape[0],
                "Matrix dimensions incompatible: [{}, {}] @ [{}, {}]",
                self.shape[0], self.shape[1], other.shape[0], other.shape[1]
            );

            let m = self.shape[0];
            let n = other.shape[1];
            let k = self.shape[1];

            if m * n * k >= 1_000 {
                return self.matmul_parallel_blocked(other, m, n, k);
            }

            let mut result = vec![0.0; m * n];
            for i in 0..m {
                for l in 0..k {
                    let a_val = self.data[i * k + l];
                    Self::matmul_inner_simd(
                        a_val,
                        &other.data[l * n..(l + 1) * n],
                        &mut result[i * n..(i + 1) * n],
                    );
                }
            }

            return Tensor::new(result, vec![m, n]);
        }

        // === 4D BATCHED MATRIX MULTIPLICATION (for attention) ===
        if self.shape.len() == 4 && other.shape.len() == 4 {
            let batch = self.shape[0];
            let n_heads = self.shape[1];
            let seq1 = self.shape[2];
            let inner_dim = self.shape[3];
            let seq2 = other.shape[3];

            assert_eq!(
                &self.shape[..2],
                &other.shape[..2],
                "Batch dimensions must match for batched matmul"
            );
            assert_eq!(
                other.shape[2], inner_dim,
                "Inner dimensions must match for batched matmul"
            );

            let mut result = vec![0.0; batch * n_heads * seq1 * seq2];

            // Each (batch, head) pair is an independent seq1×seq2 product
            result
                .par_chunks_mut(seq1 * seq2)
                .enumerate()
                .for_each(|(bh_idx, chunk)| {
                    let a = &self.data[bh_idx * seq1 * inner_dim..(bh_idx + 1) * seq1 * inner_dim];
                    let b = &other.data[bh_idx * inner_dim * seq2..(bh_idx + 1) * inner_dim * seq2];
                    for i in 0..seq1 {
                        let out_row = &mut chunk[i * seq2..(i + 1) * seq2];
                        for l in 0..inner_dim {
                            Self::matmul_inner_simd(
                                a[i * inner_dim + l],
                                &b[l * seq2..(l + 1) * seq2],
                                out_row,
                            );
                        }
                    }
                });

            return Tensor::new(result, vec![batch, n_heads, seq1, seq2]);
        }

        panic!(
            "Unsupported matmul shapes: {:?} @ {:?}",
            self.shape, other.shape
        );
    }

    /// Parallel cache-blocked matrix multiplication
    ///
    /// Processes the output in 8-row blocks, one block per Rayon task, with
    /// 8×8 tiles over the column and inner dimensions so the working set
    /// stays in L1.
    fn matmul_parallel_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const BLOCK_SIZE: usize = 8;

        let mut result = vec![0.0; m * n];

        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for j_start in (0..n).step_by(BLOCK_SIZE) {
                    let j_end = (j_start + BLOCK_SIZE).min(n);

                    for k_start in (0..k).step_by(BLOCK_SIZE) {
                        let k_end = (k_start + BLOCK_SIZE).min(k);

                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for k_idx in k_start..k_end {
                                let a_val = self.data[i * k + k_idx];
                                Self::matmul_inner_simd(
                                    a_val,
                                    &other.data[k_idx * n + j_start..k_idx * n + j_end],
                                    &mut result_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// Multiply by the transpose of `other`: `[m, k] @ [n, k]ᵀ -> [m, n]`
    ///
    /// Both operands are read row-wise, so no transposed copy of `other` is
    /// materialized. Used for the weight-tied output head and for the input
    /// gradient of linear layers.
    pub fn matmul_transposed(&self, other: &Tensor) -> Tensor {
        assert!(
            self.shape.len() == 2 && other.shape.len() == 2,
            "matmul_transposed expects 2D operands, got {:?} and {:?}",
            self.shape,
            other.shape
        );
        assert_eq!(
            self.shape[1], other.shape[1],
            "Inner dimensions incompatible: [{}, {}] @ [{}, {}]^T",
            self.shape[0], self.shape[1], other.shape[0], other.shape[1]
        );

        let m = self.shape[0];
        let k = self.shape[1];
        let n = other.shape[0];

        let mut result = vec![0.0; m * n];
        result.par_chunks_mut(n.max(1)).enumerate().for_each(|(i, out_row)| {
            let a_row = &self.data[i * k..(i + 1) * k];
            for (j, out) in out_row.iter_mut().enumerate() {
                let b_row = &other.data[j * k..(j + 1) * k];
                *out = a_row.iter().zip(b_row).map(|(a, b)| a * b).sum();
            }
        });

        Tensor::new(result, vec![m, n])
    }

    /// Softmax over the last axis
    ///
    /// Uses the numerically stable form
    /// `softmax(x)[i] = exp(x[i] - max(x)) / sum(exp(x[j] - max(x)))`.
    ///
    /// Entries equal to `-inf` receive exactly zero probability as long as the
    /// row holds at least one finite value.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use nanogpt::Tensor;
    /// let t = Tensor::new(vec![1.0, 2.0, 3.0, f32::NEG_INFINITY], vec![1, 4]);
    /// let p = t.softmax();
    /// assert!((p.data.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    /// assert_eq!(p.data[3], 0.0);
    /// ```
    pub fn softmax(&self) -> Tensor {
        let cols = self.last_dim();
        let mut result = self.data.clone();

        result.par_chunks_mut(cols.max(1)).for_each(|row| {
            let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let mut sum = 0.0;
            for val in row.iter_mut() {
                *val = (*val - max).exp();
                sum += *val;
            }
            for val in row.iter_mut() {
                *val /= sum;
            }
        });

        Tensor::new(result, self.shape.clone())
    }

    /// Element-wise addition with broadcasting support
    ///
    /// Supports:
    /// 1. **Exact match**: Same shape
    /// 2. **Broadcast last dim**: `[*, n] + [n]` (e.g., adding bias)
    ///
    /// # Example
    ///
    /// ```rust
    /// # use nanogpt::Tensor;
    /// let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
    /// let b = Tensor::new(vec![1.0, 1.0], vec![2]);
    /// let c = a.add(&b);
    /// assert_eq!(c.data, vec![2.0, 3.0, 4.0, 5.0]);
    /// ```
    pub fn add(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            let result = self
                .data
                .par_iter()
                .zip(&other.data)
                .map(|(a, b)| a + b)
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        if self.shape.len() > other.shape.len() && other.data.len() == self.last_dim() {
            let last_dim = self.last_dim();
            let result: Vec<f32> = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &x)| x + other.data[i % last_dim])
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        panic!(
            "Unsupported broadcast for add: {:?} + {:?}",
            self.shape, other.shape
        );
    }

    /// In-place element-wise accumulation: `self += other`
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(
            self.shape, other.shape,
            "Shapes must match for accumulation"
        );
        self.data
            .par_iter_mut()
            .zip(&other.data)
            .for_each(|(a, &b)| *a += b);
    }

    /// In-place scalar multiplication
    pub fn scale_in_place(&mut self, scalar: f32) {
        self.data.par_iter_mut().for_each(|x| *x *= scalar);
    }

    /// Sum of squared elements
    pub fn sum_sq(&self) -> f32 {
        self.data.par_iter().map(|&x| x * x).sum()
    }

    /// Reshape tensor to new shape (copies data)
    ///
    /// # Example
    ///
    /// ```rust
    /// # use nanogpt::Tensor;
    /// let tensor = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
    /// let reshaped = tensor.reshape(&[3, 2]);
    /// assert_eq!(reshaped.shape, vec![3, 2]);
    /// ```
    pub fn reshape(&self, new_shape: &[usize]) -> Tensor {
        self.clone().into_shape(new_shape)
    }

    /// Reshape without copying, consuming the tensor
    pub fn into_shape(self, new_shape: &[usize]) -> Tensor {
        let new_size: usize = new_shape.iter().product();
        assert_eq!(
            self.data.len(),
            new_size,
            "Cannot reshape {:?} into {:?}: element count mismatch",
            self.shape,
            new_shape
        );
        Tensor::new(self.data, new_shape.to_vec())
    }

    /// Transpose two dimensions
    ///
    /// Supports negative indexing (`-1` is the last axis).
    ///
    /// # Example
    ///
    /// ```rust
    /// # use nanogpt::Tensor;
    /// let tensor = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
    /// let transposed = tensor.transpose(0, 1);
    /// assert_eq!(transposed.shape, vec![3, 2]);
    /// assert_eq!(transposed.data, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    /// ```
    pub fn transpose(&self, dim1: isize, dim2: isize) -> Tensor {
        let ndim = self.shape.len() as isize;
        let d1 = if dim1 < 0 { ndim + dim1 } else { dim1 } as usize;
        let d2 = if dim2 < 0 { ndim + dim2 } else { dim2 } as usize;

        let mut new_shape = self.shape.clone();
        new_shape.swap(d1, d2);

        if self.shape.len() == 2 {
            let rows = self.shape[0];
            let cols = self.shape[1];
            let mut result = vec![0.0; rows * cols];
            for i in 0..rows {
                for j in 0..cols {
                    result[j * rows + i] = self.data[i * cols + j];
                }
            }
            return Tensor::new(result, new_shape);
        }

        // Walk the output in row-major order; each output axis reads from the
        // input axis it was swapped with.
        let out_strides = Self::compute_strides(&new_shape);
        let mut src_strides = self.strides.clone();
        src_strides.swap(d1, d2);

        let mut result = vec![0.0; self.data.len()];
        result.par_iter_mut().enumerate().for_each(|(i, item)| {
            let mut remaining = i;
            let mut src = 0;
            for (axis, &stride) in out_strides.iter().enumerate() {
                let coord = remaining / stride;
                remaining %= stride;
                src += coord * src_strides[axis];
            }
            *item = self.data[src];
        });

        Tensor::new(result, new_shape)
    }

    /// Split the last axis into consecutive pieces of the given widths
    ///
    /// `[.., a + b + c]` becomes `[.., a]`, `[.., b]`, `[.., c]`.
    pub fn split_last(&self, widths: &[usize]) -> Vec<Tensor> {
        let cols = self.last_dim();
        assert_eq!(
            widths.iter().sum::<usize>(),
            cols,
            "Split widths {:?} don't cover last dimension {}",
            widths,
            cols
        );
        let rows = self.data.len() / cols.max(1);

        let mut offset = 0;
        widths
            .iter()
            .map(|&w| {
                let mut data = Vec::with_capacity(rows * w);
                for r in 0..rows {
                    let start = r * cols + offset;
                    data.extend_from_slice(&self.data[start..start + w]);
                }
                offset += w;
                let mut shape = self.shape.clone();
                if let Some(last) = shape.last_mut() {
                    *last = w;
                }
                Tensor::new(data, shape)
            })
            .collect()
    }

    /// Concatenate tensors along the last axis (inverse of [`split_last`])
    ///
    /// [`split_last`]: Tensor::split_last
    pub fn concat_last(parts: &[&Tensor]) -> Tensor {
        assert!(!parts.is_empty(), "concat_last needs at least one tensor");
        let lead = &parts[0].shape[..parts[0].shape.len() - 1];
        let rows: usize = lead.iter().product();
        let total: usize = parts.iter().map(|p| p.last_dim()).sum();

        let mut data = Vec::with_capacity(rows * total);
        for r in 0..rows {
            for p in parts {
                assert_eq!(
                    &p.shape[..p.shape.len() - 1],
                    lead,
                    "Leading dimensions must match for concatenation"
                );
                let w = p.last_dim();
                data.extend_from_slice(&p.data[r * w..(r + 1) * w]);
            }
        }

        let mut shape = lead.to_vec();
        shape.push(total);
        Tensor::new(data, shape)
    }

    /// Keep only the first `n` rows (along axis 0)
    pub fn narrow_rows(&self, n: usize) -> Tensor {
        assert!(
            n <= self.shape[0],
            "Cannot narrow {} rows to {}",
            self.shape[0],
            n
        );
        let row_len: usize = self.shape[1..].iter().product();
        let mut shape = self.shape.clone();
        shape[0] = n;
        Tensor::new(self.data[..n * row_len].to_vec(), shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_small_and_blocked_agree() {
        let m = 17;
        let k = 13;
        let n = 11;
        let a = Tensor::new((0..m * k).map(|i| (i % 7) as f32 - 3.0).collect(), vec![m, k]);
        let b = Tensor::new((0..k * n).map(|i| (i % 5) as f32 * 0.5).collect(), vec![k, n]);

        let fast = a.matmul(&b);

        for i in 0..m {
            for j in 0..n {
                let expected: f32 = (0..k).map(|l| a.data[i * k + l] * b.data[l * n + j]).sum();
                assert!((fast.data[i * n + j] - expected).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_matmul_transposed_matches_explicit_transpose() {
        let a = Tensor::new((0..12).map(|i| i as f32).collect(), vec![3, 4]);
        let b = Tensor::new((0..20).map(|i| (i as f32) * 0.1).collect(), vec![5, 4]);

        let direct = a.matmul_transposed(&b);
        let explicit = a.matmul(&b.transpose(0, 1));

        assert_eq!(direct.shape, vec![3, 5]);
        for (x, y) in direct.data.iter().zip(&explicit.data) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn test_transpose_4d_swaps_middle_axes() {
        // [b=1, t=2, h=3, d=2]
        let t = Tensor::new((0..12).map(|i| i as f32).collect(), vec![1, 2, 3, 2]);
        let swapped = t.transpose(1, 2);
        assert_eq!(swapped.shape, vec![1, 3, 2, 2]);

        // element [0, h, t, d] of the result equals [0, t, h, d] of the input
        for tt in 0..2 {
            for h in 0..3 {
                for d in 0..2 {
                    let src = tt * 6 + h * 2 + d;
                    let dst = h * 4 + tt * 2 + d;
                    assert_eq!(swapped.data[dst], t.data[src]);
                }
            }
        }

        // swapping twice is the identity
        assert_eq!(swapped.transpose(1, 2), t);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, -1.0, 0.0, 1000.0], vec![2, 3]);
        let p = t.softmax();
        let row0: f32 = p.data[..3].iter().sum();
        let row1: f32 = p.data[3..].iter().sum();
        assert!((row0 - 1.0).abs() < 1e-6);
        assert!((row1 - 1.0).abs() < 1e-6);
        assert!(p.data.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_split_and_concat_last() {
        let t = Tensor::new((0..12).map(|i| i as f32).collect(), vec![2, 6]);
        let parts = t.split_last(&[2, 2, 2]);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].data, vec![2.0, 3.0, 8.0, 9.0]);

        let joined = Tensor::concat_last(&[&parts[0], &parts[1], &parts[2]]);
        assert_eq!(joined, t);
    }

    #[test]
    fn test_narrow_rows() {
        let t = Tensor::new((0..12).map(|i| i as f32).collect(), vec![4, 3]);
        let n = t.narrow_rows(2);
        assert_eq!(n.shape, vec![2, 3]);
        assert_eq!(n.data, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    #[should_panic(expected = "doesn't match shape")]
    fn test_new_rejects_bad_shape() {
        Tensor::new(vec![1.0, 2.0, 3.0], vec![2, 2]);
    }
}
