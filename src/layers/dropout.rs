//! Dropout
//!
//! Zeros each activation with probability `rate` during training and scales
//! survivors by `1 / (1 - rate)`. In evaluation mode, or with `rate == 0`,
//! the input passes through unchanged. Randomness comes from the caller's RNG
//! so a seeded run is reproducible.

use crate::tensor::Tensor;
use rand::Rng;

/// Dropout layer
pub struct Dropout {
    pub rate: f32,
    pub training: bool,
}

impl Dropout {
    /// Create a new dropout layer in training mode
    ///
    /// # Panics
    ///
    /// If `rate` is outside `[0, 1)`.
    pub fn new(rate: f32) -> Self {
        assert!(
            (0.0..1.0).contains(&rate),
            "Dropout rate must be in [0.0, 1.0)"
        );
        Self {
            rate,
            training: true,
        }
    }

    /// Whether this layer will drop anything on the next forward pass
    pub fn is_active(&self) -> bool {
        self.training && self.rate > 0.0
    }

    pub fn forward<R: Rng + ?Sized>(&self, x: Tensor, rng: &mut R) -> (Tensor, DropoutCache) {
        if !self.is_active() {
            return (x, DropoutCache { mask: None, scale: 1.0 });
        }

        let scale = 1.0 / (1.0 - self.rate);
        let mut out = x;
        let mut mask = Vec::with_capacity(out.data.len());
        for v in out.data.iter_mut() {
            let keep = rng.random::<f32>() >= self.rate;
            mask.push(keep);
            *v = if keep { *v * scale } else { 0.0 };
        }

        (
            out,
            DropoutCache {
                mask: Some(mask),
                scale,
            },
        )
    }

    pub fn backward(&self, grad_out: Tensor, cache: DropoutCache) -> Tensor {
        let Some(mask) = cache.mask else {
            return grad_out;
        };
        let mut grad = grad_out;
        for (g, keep) in grad.data.iter_mut().zip(mask) {
            *g = if keep { *g * cache.scale } else { 0.0 };
        }
        grad
    }
}

/// Cache for dropout backward pass
pub struct DropoutCache {
    /// Kept positions; `None` when dropout was inactive
    pub mask: Option<Vec<bool>>,
    pub scale: f32,
}
