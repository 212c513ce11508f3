//! Gradient Utilities
//!
//! Global gradient norm and norm clipping across every parameter.
//!
//! ```text
//! norm = √(Σ g²)                     over all parameters
//! coef = max_norm / (norm + 1e-6)
//! if coef < 1: g *= coef             for every gradient
//! ```
//!
//! Every gradient is scaled by the same factor, so the update direction is
//! preserved and only its length is capped.

use crate::parameter::Parameter;
use rayon::prelude::*;

const CLIP_EPS: f32 = 1e-6;

/// L2 norm of all gradients taken together
pub fn grad_norm(params: &[&mut Parameter]) -> f32 {
    params
        .iter()
        .map(|p| p.grad.data.par_iter().map(|&g| g * g).sum::<f32>())
        .sum::<f32>()
        .sqrt()
}

/// Scale all gradients so their global norm is at most `max_norm`
///
/// Returns the norm measured before clipping.
pub fn clip_grad_norm(params: &mut [&mut Parameter], max_norm: f32) -> f32 {
    let norm = grad_norm(params);
    let coef = max_norm / (norm + CLIP_EPS);
    if coef < 1.0 {
        for p in params.iter_mut() {
            p.grad.scale_in_place(coef);
        }
    }
    norm
}
