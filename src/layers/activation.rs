//! GELU Activation
//!
//! The feed-forward block uses GELU with the tanh approximation:
//!
//! ```text
//! GELU(x) ≈ 0.5 × x × (1 + tanh(√(2/π) × (x + 0.044715 × x³)))
//! ```
//!
//! Backward needs the original input, so callers keep it in their cache.

use crate::tensor::Tensor;
use rayon::prelude::*;

const GELU_COEFF: f32 = 0.044715;

fn sqrt_2_over_pi() -> f32 {
    (2.0 / std::f32::consts::PI).sqrt()
}

/// GELU forward, element-wise
pub fn gelu_forward(x: &Tensor) -> Tensor {
    let k = sqrt_2_over_pi();
    let data = x
        .data
        .par_iter()
        .map(|&v| 0.5 * v * (1.0 + (k * (v + GELU_COEFF * v * v * v)).tanh()))
        .collect();
    Tensor::new(data, x.shape.clone())
}

/// GELU backward: `grad_out * GELU'(x)`
///
/// `x` is the input the forward pass saw, not its output.
pub fn gelu_backward(grad_out: &Tensor, x: &Tensor) -> Tensor {
    let k = sqrt_2_over_pi();
    let data = x
        .data
        .par_iter()
        .zip(grad_out.data.par_iter())
        .map(|(&v, &g)| {
            let t = (k * (v + GELU_COEFF * v * v * v)).tanh();
            let sech_sq = 1.0 - t * t;
            let d = 0.5 * (1.0 + t) + 0.5 * v * sech_sq * k * (1.0 + 3.0 * GELU_COEFF * v * v);
            g * d
        })
        .collect();
    Tensor::new(data, x.shape.clone())
}
