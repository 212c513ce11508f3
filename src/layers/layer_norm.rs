//! Layer Normalization
//!
//! Normalizes each position's feature vector to zero mean and unit variance,
//! then applies a learnable scale (weight) and, optionally, a learnable
//! shift (bias).
//!
//! ## Forward Pass
//!
//! ```text
//! 1. mean = E[x] = sum(x) / N
//! 2. var = E[(x - mean)²] = sum((x - mean)²) / N
//! 3. x_norm = (x - mean) / √(var + ε)
//! 4. y = weight * x_norm (+ bias)
//! ```
//!
//! ## Backward Pass
//!
//! Mean and variance depend on every element in the row, so the input
//! gradient has two correction terms:
//!
//! ```text
//! grad_x_norm = grad_y * weight
//! grad_x = (grad_x_norm - E[grad_x_norm] - x_norm * E[grad_x_norm * x_norm]) / √(var + ε)
//! ```

use crate::parameter::{Module, Parameter};
use crate::tensor::Tensor;
use rand::Rng;
use rayon::prelude::*;

/// Epsilon added to the variance
pub const LAYER_NORM_EPS: f32 = 1e-5;

/// Layer normalization over the last axis with optional bias
pub struct LayerNorm {
    pub weight: Parameter,
    pub bias: Option<Parameter>,
    pub eps: f32,
}

impl LayerNorm {
    /// Create a new layer norm over `normalized_shape` features
    pub fn new(name: &str, normalized_shape: usize, bias: bool) -> Self {
        Self {
            weight: Parameter::new(
                format!("{}.weight", name),
                Tensor::full(vec![normalized_shape], 1.0),
            ),
            bias: bias.then(|| {
                Parameter::new(
                    format!("{}.bias", name),
                    Tensor::zeros(vec![normalized_shape]),
                )
            }),
            eps: LAYER_NORM_EPS,
        }
    }

    /// Forward pass
    ///
    /// Output shape equals input shape.
    pub fn forward(&self, x: &Tensor) -> (Tensor, LayerNormCache) {
        let dim = x.last_dim();
        let gamma = &self.weight.value.data;
        let beta = self.bias.as_ref().map(|b| &b.value.data);
        let eps = self.eps;

        let rows = x.numel() / dim;
        let mut x_norm = vec![0.0; x.numel()];
        let mut inv_std = vec![0.0; rows];

        x_norm
            .par_chunks_mut(dim)
            .zip(inv_std.par_iter_mut())
            .zip(x.data.par_chunks(dim))
            .for_each(|((norm_row, inv), row)| {
                let mean = row.iter().sum::<f32>() / dim as f32;
                let var = row.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / dim as f32;
                *inv = 1.0 / (var + eps).sqrt();
                for (n, &v) in norm_row.iter_mut().zip(row) {
                    *n = (v - mean) * *inv;
                }
            });

        let y: Vec<f32> = x_norm
            .par_iter()
            .enumerate()
            .map(|(i, &n)| {
                let j = i % dim;
                let scaled = n * gamma[j];
                match beta {
                    Some(b) => scaled + b[j],
                    None => scaled,
                }
            })
            .collect();

        let cache = LayerNormCache {
            x_norm: Tensor::new(x_norm, x.shape.clone()),
            inv_std,
        };
        (Tensor::new(y, x.shape.clone()), cache)
    }

    /// Backward pass
    ///
    /// Accumulates weight/bias gradients and returns the input gradient.
    pub fn backward(&mut self, grad_out: &Tensor, cache: LayerNormCache) -> Tensor {
        let dim = grad_out.last_dim();
        let gamma = &self.weight.value.data;

        let mut grad_gamma = vec![0.0; dim];
        let mut grad_beta = vec![0.0; dim];
        for (g_row, n_row) in grad_out.data.chunks(dim).zip(cache.x_norm.data.chunks(dim)) {
            for j in 0..dim {
                grad_gamma[j] += g_row[j] * n_row[j];
                grad_beta[j] += g_row[j];
            }
        }

        let mut grad_x = vec![0.0; grad_out.numel()];
        grad_x
            .par_chunks_mut(dim)
            .zip(grad_out.data.par_chunks(dim))
            .zip(cache.x_norm.data.par_chunks(dim))
            .zip(cache.inv_std.par_iter())
            .for_each(|(((out_row, g_row), n_row), &inv)| {
                let mut mean_grad = 0.0;
                let mut mean_grad_x = 0.0;
                for j in 0..dim {
                    let gx = g_row[j] * gamma[j];
                    mean_grad += gx;
                    mean_grad_x += gx * n_row[j];
                }
                mean_grad /= dim as f32;
                mean_grad_x /= dim as f32;

                for j in 0..dim {
                    let gx = g_row[j] * gamma[j];
                    out_row[j] = (gx - mean_grad - n_row[j] * mean_grad_x) * inv;
                }
            });

        self.weight
            .accumulate_grad(&Tensor::new(grad_gamma, vec![dim]));
        if let Some(bias) = &mut self.bias {
            bias.accumulate_grad(&Tensor::new(grad_beta, vec![dim]));
        }

        Tensor::new(grad_x, grad_out.shape.clone())
    }
}

impl Module for LayerNorm {
    fn parameters(&self) -> Vec<&Parameter> {
        std::iter::once(&self.weight).chain(self.bias.as_ref()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        std::iter::once(&mut self.weight)
            .chain(self.bias.as_mut())
            .collect()
    }

    fn initialize_weights<R: Rng + ?Sized>(&mut self, _rng: &mut R) {
        let dim = self.weight.value.numel();
        self.weight.set_value(Tensor::full(vec![dim], 1.0));
        if let Some(bias) = &mut self.bias {
            bias.set_value(Tensor::zeros(vec![dim]));
        }
    }
}

/// Cache for layer norm backward pass
pub struct LayerNormCache {
    pub x_norm: Tensor,
    /// 1 / √(var + ε) per row
    pub inv_std: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn check_normalized(bias: bool) {
        let mut rng = StdRng::seed_from_u64(3);
        let ln = LayerNorm::new("ln", 16, bias);
        let x = Tensor::randn(vec![2, 5, 16], 3.0, &mut rng).add(&Tensor::full(vec![16], 4.0));

        let (y, _) = ln.forward(&x);
        assert_eq!(y.shape, x.shape);

        for row in y.data.chunks(16) {
            let mean = row.iter().sum::<f32>() / 16.0;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 16.0;
            assert!(mean.abs() < 1e-5, "mean {} not ~0", mean);
            assert!((var - 1.0).abs() < 1e-3, "var {} not ~1", var);
        }
    }

    #[test]
    fn test_normalizes_with_bias() {
        check_normalized(true);
    }

    #[test]
    fn test_normalizes_without_bias() {
        check_normalized(false);
    }

    #[test]
    fn test_bias_flag_controls_parameters() {
        assert_eq!(LayerNorm::new("ln", 8, true).parameters().len(), 2);
        assert_eq!(LayerNorm::new("ln", 8, false).parameters().len(), 1);
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut ln = LayerNorm::new("ln", 5, true);
        ln.weight.value = Tensor::randn(vec![5], 1.0, &mut rng);
        let x = Tensor::randn(vec![3, 5], 1.0, &mut rng);
        // weighted sum makes the gradient non-trivial
        let w = Tensor::randn(vec![3, 5], 1.0, &mut rng);

        let loss = |ln: &LayerNorm, x: &Tensor| -> f32 {
            let (y, _) = ln.forward(x);
            y.data.iter().zip(&w.data).map(|(a, b)| a * b).sum()
        };

        let (_, cache) = ln.forward(&x);
        let grad_x = ln.backward(&w, cache);

        let eps = 1e-2;
        for i in 0..x.numel() {
            let mut plus = x.clone();
            plus.data[i] += eps;
            let mut minus = x.clone();
            minus.data[i] -= eps;
            let numeric = (loss(&ln, &plus) - loss(&ln, &minus)) / (2.0 * eps);
            assert!(
                (numeric - grad_x.data[i]).abs() < 2e-2,
                "index {}: numeric {} vs analytic {}",
                i,
                numeric,
                grad_x.data[i]
            );
        }
    }
}
