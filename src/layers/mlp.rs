//! Feed-Forward Network (MLP)
//!
//! ```text
//! x → c_fc (C → 4C) → GELU → c_proj (4C → C) → dropout → y
//! ```
//!
//! `c_proj` writes into the residual stream, so it takes the depth-scaled
//! init std `0.02 / √(2 · n_layer)`.

use super::activation::{gelu_backward, gelu_forward};
use super::dropout::{Dropout, DropoutCache};
use super::linear::{Linear, LinearCache, INIT_STD};
use crate::config::ModelConfig;
use crate::parameter::{Module, Parameter};
use crate::tensor::Tensor;
use rand::Rng;

/// Two-layer feed-forward network with GELU
pub struct Mlp {
    pub c_fc: Linear,
    pub c_proj: Linear,
    pub dropout: Dropout,
}

impl Mlp {
    pub fn new(name: &str, config: &ModelConfig) -> Self {
        let n_embd = config.n_embd;
        let proj_std = INIT_STD / ((2 * config.n_layer) as f32).sqrt();
        Self {
            c_fc: Linear::new(&format!("{}.c_fc", name), n_embd, 4 * n_embd, config.bias),
            c_proj: Linear::new(&format!("{}.c_proj", name), 4 * n_embd, n_embd, config.bias)
                .with_init_std(proj_std),
            dropout: Dropout::new(config.dropout),
        }
    }

    pub fn forward<R: Rng + ?Sized>(&self, x: &Tensor, rng: &mut R) -> (Tensor, MlpCache) {
        let (hidden, c_fc_cache) = self.c_fc.forward(x);
        let activated = gelu_forward(&hidden);
        let (out, c_proj_cache) = self.c_proj.forward(&activated);
        drop(activated);
        let (out, dropout_cache) = self.dropout.forward(out, rng);

        let cache = MlpCache {
            c_fc_cache,
            hidden,
            c_proj_cache,
            dropout_cache,
        };
        (out, cache)
    }

    pub fn backward(&mut self, grad_out: &Tensor, cache: MlpCache) -> Tensor {
        let grad = self.dropout.backward(grad_out.clone(), cache.dropout_cache);
        let grad_activated = self.c_proj.backward(&grad, cache.c_proj_cache);
        let grad_hidden = gelu_backward(&grad_activated, &cache.hidden);
        self.c_fc.backward(&grad_hidden, cache.c_fc_cache)
    }
}

impl Module for Mlp {
    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = self.c_fc.parameters();
        params.extend(self.c_proj.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = self.c_fc.parameters_mut();
        params.extend(self.c_proj.parameters_mut());
        params
    }

    fn initialize_weights<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.c_fc.initialize_weights(rng);
        self.c_proj.initialize_weights(rng);
    }
}

/// Cache for MLP backward pass
pub struct MlpCache {
    pub c_fc_cache: LinearCache,
    /// Pre-activation (GELU input)
    pub hidden: Tensor,
    pub c_proj_cache: LinearCache,
    pub dropout_cache: DropoutCache,
}
