//! Transformer Block
//!
//! Pre-norm residual block:
//!
//! ```text
//! x = x + attn(ln_1(x))
//! x = x + mlp(ln_2(x))
//! ```
//!
//! At each residual join the incoming gradient feeds both the skip path and
//! the sublayer path, and the two are summed on the way back.

use super::attention::{AttentionCache, CausalSelfAttention};
use super::layer_norm::{LayerNorm, LayerNormCache};
use super::mlp::{Mlp, MlpCache};
use crate::config::ModelConfig;
use crate::error::Result;
use crate::parameter::{Module, Parameter};
use crate::tensor::Tensor;
use rand::Rng;

/// Transformer block: attention and MLP sublayers with residuals
pub struct Block {
    pub ln_1: LayerNorm,
    pub attn: CausalSelfAttention,
    pub ln_2: LayerNorm,
    pub mlp: Mlp,
}

impl Block {
    /// Block named `name` (e.g. `h.3`)
    pub fn new(name: &str, config: &ModelConfig) -> Result<Self> {
        Ok(Self {
            ln_1: LayerNorm::new(&format!("{}.ln_1", name), config.n_embd, config.bias),
            attn: CausalSelfAttention::new(&format!("{}.attn", name), config)?,
            ln_2: LayerNorm::new(&format!("{}.ln_2", name), config.n_embd, config.bias),
            mlp: Mlp::new(&format!("{}.mlp", name), config),
        })
    }

    pub fn set_training(&mut self, training: bool) {
        self.attn.set_training(training);
        self.mlp.dropout.training = training;
    }

    pub fn forward<R: Rng + ?Sized>(&self, x: Tensor, rng: &mut R) -> (Tensor, BlockCache) {
        let (normed, ln_1_cache) = self.ln_1.forward(&x);
        let (attn_out, attn_cache) = self.attn.forward(&normed, rng);
        drop(normed);
        let mut x = x;
        x.add_assign(&attn_out);
        drop(attn_out);

        let (normed, ln_2_cache) = self.ln_2.forward(&x);
        let (mlp_out, mlp_cache) = self.mlp.forward(&normed, rng);
        drop(normed);
        x.add_assign(&mlp_out);

        let cache = BlockCache {
            ln_1_cache,
            attn_cache,
            ln_2_cache,
            mlp_cache,
        };
        (x, cache)
    }

    /// Backward pass; consumes the cache so activations are freed layer by layer
    pub fn backward(&mut self, grad_out: Tensor, cache: BlockCache) -> Tensor {
        let mut grad = grad_out;

        let grad_mlp_in = self.mlp.backward(&grad, cache.mlp_cache);
        let grad_ln_2 = self.ln_2.backward(&grad_mlp_in, cache.ln_2_cache);
        grad.add_assign(&grad_ln_2);

        let grad_attn_in = self.attn.backward(&grad, cache.attn_cache);
        let grad_ln_1 = self.ln_1.backward(&grad_attn_in, cache.ln_1_cache);
        grad.add_assign(&grad_ln_1);

        grad
    }
}

impl Module for Block {
    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = self.ln_1.parameters();
        params.extend(self.attn.parameters());
        params.extend(self.ln_2.parameters());
        params.extend(self.mlp.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = self.ln_1.parameters_mut();
        params.extend(self.attn.parameters_mut());
        params.extend(self.ln_2.parameters_mut());
        params.extend(self.mlp.parameters_mut());
        params
    }

    fn initialize_weights<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.ln_1.initialize_weights(rng);
        self.attn.initialize_weights(rng);
        self.ln_2.initialize_weights(rng);
        self.mlp.initialize_weights(rng);
    }
}

/// Cache for block backward pass
pub struct BlockCache {
    pub ln_1_cache: LayerNormCache,
    pub attn_cache: AttentionCache,
    pub ln_2_cache: LayerNormCache,
    pub mlp_cache: MlpCache,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_block_preserves_shape() {
        let mut rng = StdRng::seed_from_u64(4);
        let cfg = ModelConfig::tiny(10);
        let mut block = Block::new("h.0", &cfg).unwrap();
        block.initialize_weights(&mut rng);

        let x = Tensor::randn(vec![2, 5, 16], 1.0, &mut rng);
        let (y, cache) = block.forward(x.clone(), &mut rng);
        assert_eq!(y.shape, x.shape);

        let grad = block.backward(Tensor::full(y.shape.clone(), 1.0), cache);
        assert_eq!(grad.shape, x.shape);
    }

    #[test]
    fn test_residual_projections_use_scaled_init() {
        let mut rng = StdRng::seed_from_u64(8);
        let cfg = ModelConfig {
            n_layer: 8,
            n_embd: 64,
            n_head: 4,
            ..ModelConfig::tiny(10)
        };
        let mut block = Block::new("h.0", &cfg).unwrap();
        block.initialize_weights(&mut rng);

        let std_of = |p: &Parameter| (p.value.sum_sq() / p.numel() as f32).sqrt();
        let fc_std = std_of(&block.mlp.c_fc.weight);
        let proj_std = std_of(&block.mlp.c_proj.weight);
        let expected = 0.02 / (16.0f32).sqrt();

        assert!((fc_std - 0.02).abs() < 0.002, "c_fc std {}", fc_std);
        assert!((proj_std - expected).abs() < 0.001, "c_proj std {}", proj_std);
    }
}
