//! Causal Multi-Head Self-Attention
//!
//! ## Scaled Dot-Product Attention
//!
//! ```text
//! q, k, v = split(x @ W_attn)                  [B, T, C] each
//! q, k, v -> [B, H, T, hs]                     (hs = C / H)
//! scores = q @ kᵀ / √hs                         [B, H, T, T]
//! scores[i, j] = -inf for j > i                 (causal mask)
//! att = dropout(softmax(scores))
//! y = att @ v -> [B, T, C] -> y @ W_proj -> dropout
//! ```
//!
//! The mask is a precomputed `block_size × block_size` lower triangle; a
//! forward pass over `T` tokens reads its top-left `T × T` corner. Masked
//! scores are `-inf`, so their softmax weight is exactly zero.
//!
//! ## Backward Pass
//!
//! Softmax couples every entry of a row:
//!
//! ```text
//! grad_scores = att * (grad_att - sum(grad_att * att, axis=-1))
//! ```
//!
//! The 1/√hs scale then flows into both q and k gradients, and the three
//! gradients are re-fused before the `c_attn` backward.

use super::dropout::{Dropout, DropoutCache};
use super::linear::{Linear, LinearCache};
use crate::config::ModelConfig;
use crate::error::{GptError, Result};
use crate::parameter::{Module, Parameter};
use crate::tensor::Tensor;
use rand::Rng;
use rayon::prelude::*;

/// Causal multi-head self-attention
pub struct CausalSelfAttention {
    /// Fused q/k/v projection, C -> 3C
    pub c_attn: Linear,
    /// Output projection, C -> C
    pub c_proj: Linear,
    pub attn_dropout: Dropout,
    pub resid_dropout: Dropout,
    pub n_head: usize,
    pub n_embd: usize,
    block_size: usize,
    /// Row-major `block_size × block_size`; `true` where attention is allowed
    mask: Vec<bool>,
}

impl CausalSelfAttention {
    /// Build the attention layer for `config`
    ///
    /// # Errors
    ///
    /// `Configuration` if `n_embd` is not divisible by `n_head`, or if
    /// `block_size` is unset.
    pub fn new(name: &str, config: &ModelConfig) -> Result<Self> {
        if config.n_head == 0 || config.n_embd % config.n_head != 0 {
            return Err(GptError::Configuration(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                config.n_embd, config.n_head
            )));
        }
        let block_size = config.require_block_size()?;
        let n_embd = config.n_embd;
        let proj_std = super::linear::INIT_STD / ((2 * config.n_layer) as f32).sqrt();

        Ok(Self {
            c_attn: Linear::new(&format!("{}.c_attn", name), n_embd, 3 * n_embd, config.bias),
            c_proj: Linear::new(&format!("{}.c_proj", name), n_embd, n_embd, config.bias)
                .with_init_std(proj_std),
            attn_dropout: Dropout::new(config.dropout),
            resid_dropout: Dropout::new(config.dropout),
            n_head: config.n_head,
            n_embd,
            block_size,
            mask: causal_mask(block_size),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Rebuild the causal mask for a new context length
    pub fn set_block_size(&mut self, block_size: usize) {
        self.block_size = block_size;
        self.mask = causal_mask(block_size);
    }

    pub fn set_training(&mut self, training: bool) {
        self.attn_dropout.training = training;
        self.resid_dropout.training = training;
    }

    /// Forward pass over `x: [B, T, C]`
    ///
    /// # Panics
    ///
    /// If `T` exceeds the mask size; the model validates sequence length
    /// before calling in.
    pub fn forward<R: Rng + ?Sized>(&self, x: &Tensor, rng: &mut R) -> (Tensor, AttentionCache) {
        let (b, t, c) = (x.shape[0], x.shape[1], x.shape[2]);
        assert!(
            t <= self.block_size,
            "sequence length {} exceeds block size {}",
            t,
            self.block_size
        );
        let h = self.n_head;
        let hs = c / h;

        let (qkv, c_attn_cache) = self.c_attn.forward(x);
        let parts = qkv.split_last(&[c, c, c]);
        let to_heads = |p: &Tensor| p.reshape(&[b, t, h, hs]).transpose(1, 2);
        let (q, k, v) = (to_heads(&parts[0]), to_heads(&parts[1]), to_heads(&parts[2]));
        drop(parts);

        let scale = 1.0 / (hs as f32).sqrt();
        let mut scores = q.matmul(&k.transpose(2, 3));
        scores.scale_in_place(scale);
        self.apply_mask(&mut scores, t);

        let att = scores.softmax();
        let (att_drop, attn_dropout_cache) = self.attn_dropout.forward(att.clone(), rng);

        let y = att_drop
            .matmul(&v)
            .transpose(1, 2)
            .into_shape(&[b, t, c]);
        let (y, c_proj_cache) = self.c_proj.forward(&y);
        let (y, resid_dropout_cache) = self.resid_dropout.forward(y, rng);

        let cache = AttentionCache {
            c_attn_cache,
            q,
            k,
            v,
            att,
            att_drop,
            attn_dropout_cache,
            c_proj_cache,
            resid_dropout_cache,
        };
        (y, cache)
    }

    fn apply_mask(&self, scores: &mut Tensor, t: usize) {
        let block = self.block_size;
        let mask = &self.mask;
        scores.data.par_chunks_mut(t * t).for_each(|head| {
            for i in 0..t {
                for j in 0..t {
                    if !mask[i * block + j] {
                        head[i * t + j] = f32::NEG_INFINITY;
                    }
                }
            }
        });
    }

    /// Backward pass
    ///
    /// Accumulates into `c_attn` and `c_proj` gradients and returns the
    /// gradient with respect to the input `[B, T, C]`.
    pub fn backward(&mut self, grad_out: &Tensor, cache: AttentionCache) -> Tensor {
        let (b, t, c) = (grad_out.shape[0], grad_out.shape[1], grad_out.shape[2]);
        let h = self.n_head;
        let hs = c / h;
        let scale = 1.0 / (hs as f32).sqrt();

        let grad = self
            .resid_dropout
            .backward(grad_out.clone(), cache.resid_dropout_cache);
        let grad_y = self.c_proj.backward(&grad, cache.c_proj_cache);
        let grad_y = grad_y.into_shape(&[b, t, h, hs]).transpose(1, 2);

        // y = att_drop @ v
        let grad_att_drop = grad_y.matmul(&cache.v.transpose(2, 3));
        let grad_v = cache.att_drop.transpose(2, 3).matmul(&grad_y);
        drop(grad_y);

        let grad_att = self
            .attn_dropout
            .backward(grad_att_drop, cache.attn_dropout_cache);
        let grad_scores = softmax_backward(&grad_att, &cache.att, t, scale);

        let grad_q = grad_scores.matmul(&cache.k);
        let grad_k = grad_scores.transpose(2, 3).matmul(&cache.q);

        let merge = |g: Tensor| g.transpose(1, 2).into_shape(&[b, t, c]);
        let grad_qkv = Tensor::concat_last(&[&merge(grad_q), &merge(grad_k), &merge(grad_v)]);

        self.c_attn.backward(&grad_qkv, cache.c_attn_cache)
    }
}

/// Row-wise softmax gradient, scaled by the pre-softmax factor
fn softmax_backward(grad_att: &Tensor, att: &Tensor, t: usize, scale: f32) -> Tensor {
    let mut out = vec![0.0; att.numel()];
    out.par_chunks_mut(t)
        .zip(grad_att.data.par_chunks(t))
        .zip(att.data.par_chunks(t))
        .for_each(|((o, g), a)| {
            let dot: f32 = g.iter().zip(a).map(|(g, a)| g * a).sum();
            for j in 0..t {
                o[j] = a[j] * (g[j] - dot) * scale;
            }
        });
    Tensor::new(out, att.shape.clone())
}

fn causal_mask(block_size: usize) -> Vec<bool> {
    let mut mask = vec![false; block_size * block_size];
    for i in 0..block_size {
        for j in 0..=i {
            mask[i * block_size + j] = true;
        }
    }
    mask
}

impl Module for CausalSelfAttention {
    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = self.c_attn.parameters();
        params.extend(self.c_proj.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = self.c_attn.parameters_mut();
        params.extend(self.c_proj.parameters_mut());
        params
    }

    fn initialize_weights<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.c_attn.initialize_weights(rng);
        self.c_proj.initialize_weights(rng);
    }
}

/// Cache for attention backward pass
pub struct AttentionCache {
    pub c_attn_cache: LinearCache,
    /// `[B, H, T, hs]`
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    /// Softmax output before dropout, `[B, H, T, T]`
    pub att: Tensor,
    /// Attention weights actually applied to `v`
    pub att_drop: Tensor,
    pub attn_dropout_cache: DropoutCache,
    pub c_proj_cache: LinearCache,
    pub resid_dropout_cache: DropoutCache,
}
