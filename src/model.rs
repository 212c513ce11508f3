//! GPT Language Model
//!
//! A decoder-only transformer:
//!
//! ```text
//! idx [B, T]
//!   → wte[idx] + wpe[0..T]          token + position embeddings
//!   → dropout
//!   → Block × n_layer               attention + MLP with residuals
//!   → ln_f
//!   → h @ wteᵀ                      output head tied to wte
//!   → logits [B, T, V]
//! ```
//!
//! ## Weight Tying
//!
//! The output head reuses the token embedding matrix, so `wte` receives
//! gradient from two places: the embedding lookup at the bottom of the
//! network and the logit projection at the top. Both land in the same
//! [`Parameter`] buffer.
//!
//! ## Training Pass
//!
//! [`Gpt::forward_backward`] runs the forward pass keeping every layer's
//! cache, computes cross-entropy, and walks the caches in reverse,
//! accumulating into each parameter's gradient. Each cache is consumed as
//! its layer's backward finishes, so activations are freed block by block.

use crate::config::ModelConfig;
use crate::data::TokenBatch;
use crate::error::{GptError, Result};
use crate::layers::{Block, BlockCache, Dropout, LayerNorm, INIT_STD};
use crate::optimizer::{AdamW, ParamGroup};
use crate::parameter::{Module, Parameter};
use crate::tensor::Tensor;
use rand::Rng;
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Target id excluded from the loss
pub const IGNORE_INDEX: usize = usize::MAX;

/// GPT model
pub struct Gpt {
    config: ModelConfig,
    /// Token embedding `[vocab_size, n_embd]`, also the output head
    pub wte: Parameter,
    /// Position embedding `[block_size, n_embd]`
    pub wpe: Parameter,
    pub drop: Dropout,
    pub h: Vec<Block>,
    pub ln_f: LayerNorm,
    training: bool,
}

impl Gpt {
    /// Build and initialize a model
    ///
    /// # Errors
    ///
    /// `Configuration` if `vocab_size` or `block_size` is unset, dropout is
    /// outside `[0, 1)`, or `n_embd` is not divisible by `n_head`.
    pub fn new<R: Rng + ?Sized>(config: ModelConfig, rng: &mut R) -> Result<Self> {
        let vocab_size = config.require_vocab_size()?;
        let block_size = config.require_block_size()?;
        if !(0.0..1.0).contains(&config.dropout) {
            return Err(GptError::Configuration(format!(
                "dropout must be in [0, 1), got {}",
                config.dropout
            )));
        }

        let n_embd = config.n_embd;
        let h = (0..config.n_layer)
            .map(|i| Block::new(&format!("h.{}", i), &config))
            .collect::<Result<Vec<_>>>()?;

        let mut model = Self {
            wte: Parameter::new("wte.weight", Tensor::zeros(vec![vocab_size, n_embd])),
            wpe: Parameter::new("wpe.weight", Tensor::zeros(vec![block_size, n_embd])),
            drop: Dropout::new(config.dropout),
            h,
            ln_f: LayerNorm::new("ln_f", n_embd, config.bias),
            config,
            training: true,
        };
        model.initialize_weights(rng);

        info!(
            "number of parameters: {:.2}M",
            model.num_params(true) as f64 / 1e6
        );
        Ok(model)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn block_size(&self) -> usize {
        self.wpe.value.shape[0]
    }

    pub fn vocab_size(&self) -> usize {
        self.wte.value.shape[0]
    }

    /// Switch dropout on (training) or off (evaluation)
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        self.drop.training = training;
        for block in &mut self.h {
            block.set_training(training);
        }
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    fn validate_input(&self, idx: &TokenBatch, targets: Option<&TokenBatch>) -> Result<()> {
        if idx.batch == 0 || idx.seq_len == 0 {
            return Err(GptError::Validation("input batch is empty".to_string()));
        }
        if idx.seq_len > self.block_size() {
            return Err(GptError::Validation(format!(
                "cannot forward sequence of length {}, block size is only {}",
                idx.seq_len,
                self.block_size()
            )));
        }
        let vocab = self.vocab_size();
        if let Some(&bad) = idx.ids.iter().find(|&&id| id >= vocab) {
            return Err(GptError::Validation(format!(
                "token id {} out of range for vocab size {}",
                bad, vocab
            )));
        }
        if let Some(targets) = targets {
            if (targets.batch, targets.seq_len) != (idx.batch, idx.seq_len) {
                return Err(GptError::Validation(format!(
                    "targets [{}, {}] do not match input [{}, {}]",
                    targets.batch, targets.seq_len, idx.batch, idx.seq_len
                )));
            }
            if let Some(&bad) = targets
                .ids
                .iter()
                .find(|&&id| id >= vocab && id != IGNORE_INDEX)
            {
                return Err(GptError::Validation(format!(
                    "target id {} out of range for vocab size {}",
                    bad, vocab
                )));
            }
        }
        Ok(())
    }

    /// `wte[idx] + wpe[pos]`, shape `[B, T, C]`
    fn embed(&self, idx: &TokenBatch) -> Tensor {
        let c = self.config.n_embd;
        let t = idx.seq_len;
        let wte = &self.wte.value.data;
        let wpe = &self.wpe.value.data;

        let mut x = vec![0.0; idx.batch * t * c];
        x.par_chunks_mut(c).enumerate().for_each(|(row, out)| {
            let token = idx.ids[row];
            let pos = row % t;
            let tok = &wte[token * c..(token + 1) * c];
            let posv = &wpe[pos * c..(pos + 1) * c];
            for ((o, &a), &b) in out.iter_mut().zip(tok).zip(posv) {
                *o = a + b;
            }
        });
        Tensor::new(x, vec![idx.batch, t, c])
    }

    /// Forward pass
    ///
    /// With `targets`, returns logits `[B, T, V]` and the mean cross-entropy
    /// over targets that are not [`IGNORE_INDEX`]. Without, returns logits
    /// for the last position only, `[B, 1, V]`, and `None`.
    ///
    /// # Errors
    ///
    /// `Validation` if `T` exceeds the block size, the batch is empty, or an
    /// id is out of range.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        idx: &TokenBatch,
        targets: Option<&TokenBatch>,
        rng: &mut R,
    ) -> Result<(Tensor, Option<f32>)> {
        self.validate_input(idx, targets)?;
        let (b, t, c) = (idx.batch, idx.seq_len, self.config.n_embd);
        let v = self.vocab_size();

        let (mut x, _) = self.drop.forward(self.embed(idx), rng);
        for block in &self.h {
            // caches are dropped immediately outside training
            x = block.forward(x, rng).0;
        }
        let (x, _) = self.ln_f.forward(&x);

        match targets {
            Some(targets) => {
                let logits = x
                    .into_shape(&[b * t, c])
                    .matmul_transposed(&self.wte.value);
                let loss = cross_entropy(&logits, &targets.ids)?;
                Ok((logits.into_shape(&[b, t, v]), Some(loss)))
            }
            None => {
                let mut last = Vec::with_capacity(b * c);
                for row in 0..b {
                    let start = (row * t + t - 1) * c;
                    last.extend_from_slice(&x.data[start..start + c]);
                }
                let logits = Tensor::new(last, vec![b, c]).matmul_transposed(&self.wte.value);
                Ok((logits.into_shape(&[b, 1, v]), None))
            }
        }
    }

    /// Training forward + backward pass
    ///
    /// Back-propagates `loss * loss_scale` and accumulates into every
    /// parameter's gradient buffer (call [`Module::zero_grad`] first to
    /// start fresh). Returns the unscaled loss.
    pub fn forward_backward<R: Rng + ?Sized>(
        &mut self,
        idx: &TokenBatch,
        targets: &TokenBatch,
        loss_scale: f32,
        rng: &mut R,
    ) -> Result<f32> {
        self.validate_input(idx, Some(targets))?;
        let (b, t, c) = (idx.batch, idx.seq_len, self.config.n_embd);

        // forward, keeping caches
        let (mut x, drop_cache) = self.drop.forward(self.embed(idx), rng);
        let mut caches: Vec<BlockCache> = Vec::with_capacity(self.h.len());
        for block in &self.h {
            let (next, cache) = block.forward(x, rng);
            caches.push(cache);
            x = next;
        }
        let (x, ln_f_cache) = self.ln_f.forward(&x);
        let x = x.into_shape(&[b * t, c]);
        let logits = x.matmul_transposed(&self.wte.value);

        let (loss, grad_logits) = cross_entropy_backward(&logits, &targets.ids, loss_scale)?;
        drop(logits);

        // tied head: logits = x @ wteᵀ
        let grad_wte_head = grad_logits.transpose(0, 1).matmul(&x);
        self.wte.accumulate_grad(&grad_wte_head);
        drop(grad_wte_head);
        let grad_x = grad_logits.matmul(&self.wte.value).into_shape(&[b, t, c]);
        drop(grad_logits);

        let mut grad = self.ln_f.backward(&grad_x, ln_f_cache);
        for (block, cache) in self.h.iter_mut().zip(caches).rev() {
            grad = block.backward(grad, cache);
        }
        let grad = self.drop.backward(grad, drop_cache);

        self.accumulate_embedding_grads(idx, &grad);
        debug!(loss, "forward_backward");
        Ok(loss)
    }

    fn accumulate_embedding_grads(&mut self, idx: &TokenBatch, grad: &Tensor) {
        let c = self.config.n_embd;
        let t = idx.seq_len;
        let wte_grad = &mut self.wte.grad.data;
        let wpe_grad = &mut self.wpe.grad.data;
        for (row, g) in grad.data.chunks(c).enumerate() {
            let token = idx.ids[row];
            let pos = row % t;
            for j in 0..c {
                wte_grad[token * c + j] += g[j];
                wpe_grad[pos * c + j] += g[j];
            }
        }
    }

    /// Autoregressively extend every row of `idx` by `max_new_tokens`
    ///
    /// Each step feeds at most the last `block_size` tokens, divides the
    /// final logits by `temperature`, optionally keeps only the `top_k`
    /// largest (k clamped to the vocabulary), and samples from the softmax.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        idx: &TokenBatch,
        max_new_tokens: usize,
        temperature: f32,
        top_k: Option<usize>,
        rng: &mut R,
    ) -> Result<TokenBatch> {
        if temperature.is_nan() || temperature <= 0.0 {
            return Err(GptError::Validation(format!(
                "temperature must be positive, got {}",
                temperature
            )));
        }
        if idx.seq_len == 0 {
            return Err(GptError::Validation(
                "generation needs at least one context token".to_string(),
            ));
        }

        let block_size = self.block_size();
        let vocab = self.vocab_size();
        let top_k = top_k.map(|k| k.clamp(1, vocab));
        let mut rows: Vec<Vec<usize>> = idx.rows().map(<[usize]>::to_vec).collect();

        for _ in 0..max_new_tokens {
            let context: Vec<Vec<usize>> = rows
                .iter()
                .map(|r| r[r.len().saturating_sub(block_size)..].to_vec())
                .collect();
            let context = TokenBatch::from_rows(&context)?;
            let (logits, _) = self.forward(&context, None, rng)?;

            for (row, out) in logits.data.chunks(vocab).zip(rows.iter_mut()) {
                let mut scaled: Vec<f32> = row.iter().map(|&l| l / temperature).collect();
                if let Some(k) = top_k {
                    apply_top_k(&mut scaled, k);
                }
                let probs = Tensor::new(scaled, vec![vocab]).softmax();
                out.push(sample_from_probs(&probs.data, rng));
            }
        }

        TokenBatch::from_rows(&rows)
    }

    /// Number of parameters
    ///
    /// The tied head is counted once, as `wte`. With `non_embedding`, the
    /// position embedding is excluded.
    pub fn num_params(&self, non_embedding: bool) -> usize {
        let total = self.num_elements();
        if non_embedding {
            total - self.wpe.numel()
        } else {
            total
        }
    }

    /// Shrink the context window
    ///
    /// Truncates `wpe` (value and gradient) to the first `new_block_size`
    /// rows and rebuilds every attention mask.
    pub fn crop_block_size(&mut self, new_block_size: usize) -> Result<()> {
        let current = self.block_size();
        if new_block_size > current {
            return Err(GptError::Validation(format!(
                "cannot crop block size {} up to {}",
                current, new_block_size
            )));
        }
        if new_block_size == 0 {
            return Err(GptError::Validation("block size must be positive".to_string()));
        }

        self.wpe.value = self.wpe.value.narrow_rows(new_block_size);
        self.wpe.grad = self.wpe.grad.narrow_rows(new_block_size);
        for block in &mut self.h {
            block.attn.set_block_size(new_block_size);
        }
        self.config.block_size = Some(new_block_size);
        info!(from = current, to = new_block_size, "cropped block size");
        Ok(())
    }

    /// Build AdamW with decayed matrices and undecayed vectors
    ///
    /// Every parameter with `ndim >= 2` gets `weight_decay`; the rest get 0.
    pub fn configure_optimizers(
        &self,
        weight_decay: f32,
        learning_rate: f32,
        betas: (f32, f32),
        device_type: &str,
    ) -> Result<AdamW> {
        let params = self.parameters();
        let (decay, no_decay): (Vec<usize>, Vec<usize>) =
            (0..params.len()).partition(|&i| params[i].ndim() >= 2);

        let count = |ids: &[usize]| ids.iter().map(|&i| params[i].numel()).sum::<usize>();
        info!(
            "num decayed parameter tensors: {}, with {} parameters",
            decay.len(),
            count(&decay)
        );
        info!(
            "num non-decayed parameter tensors: {}, with {} parameters",
            no_decay.len(),
            count(&no_decay)
        );
        debug!(device_type, "using unfused AdamW");

        let groups = vec![
            ParamGroup {
                name: "decay".to_string(),
                param_indices: decay,
                lr: learning_rate,
                weight_decay,
            },
            ParamGroup {
                name: "no_decay".to_string(),
                param_indices: no_decay,
                lr: learning_rate,
                weight_decay: 0.0,
            },
        ];
        let sizes: Vec<usize> = params.iter().map(|p| p.numel()).collect();
        AdamW::new(groups, &sizes, betas)
    }

    /// Model FLOPs utilization
    ///
    /// Achieved FLOPs per second as a fraction of `peak_flops`, counting
    /// `6N + 12·L·H·hs·T` FLOPs per token for a forward and backward pass.
    pub fn estimate_mfu(&self, fwdbwd_per_iter: usize, dt: f64, peak_flops: f64) -> f64 {
        let n = self.num_params(true) as f64;
        let l = self.config.n_layer as f64;
        let h = self.config.n_head as f64;
        let q = self.config.head_size() as f64;
        let t = self.block_size() as f64;

        let flops_per_token = 6.0 * n + 12.0 * l * h * q * t;
        let flops_per_iter = flops_per_token * t * fwdbwd_per_iter as f64;
        (flops_per_iter / dt) / peak_flops
    }

    /// Copy of every parameter value keyed by name
    pub fn state_dict(&self) -> BTreeMap<String, Tensor> {
        self.parameters()
            .into_iter()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect()
    }

    /// Overwrite parameters from a name → tensor map
    ///
    /// Every parameter must be present with a matching shape, and no extra
    /// keys are allowed. Gradients are reset.
    pub fn load_state_dict(&mut self, mut state: BTreeMap<String, Tensor>) -> Result<()> {
        for p in self.parameters_mut() {
            let value = state.remove(&p.name).ok_or_else(|| {
                GptError::Checkpoint(format!("missing parameter '{}'", p.name))
            })?;
            if value.shape != p.value.shape {
                return Err(GptError::Checkpoint(format!(
                    "shape mismatch for '{}': checkpoint {:?}, model {:?}",
                    p.name, value.shape, p.value.shape
                )));
            }
            p.set_value(value);
        }
        if let Some(extra) = state.keys().next() {
            return Err(GptError::Checkpoint(format!(
                "unexpected parameter '{}'",
                extra
            )));
        }
        Ok(())
    }
}

impl Module for Gpt {
    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = vec![&self.wte, &self.wpe];
        for block in &self.h {
            params.extend(block.parameters());
        }
        params.extend(self.ln_f.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = vec![&mut self.wte, &mut self.wpe];
        for block in &mut self.h {
            params.extend(block.parameters_mut());
        }
        params.extend(self.ln_f.parameters_mut());
        params
    }

    fn initialize_weights<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let wte_shape = self.wte.value.shape.clone();
        self.wte.set_value(Tensor::randn(wte_shape, INIT_STD, rng));
        let wpe_shape = self.wpe.value.shape.clone();
        self.wpe.set_value(Tensor::randn(wpe_shape, INIT_STD, rng));
        for block in &mut self.h {
            block.initialize_weights(rng);
        }
        self.ln_f.initialize_weights(rng);
    }
}

fn scored_count(targets: &[usize]) -> Result<usize> {
    let count = targets.iter().filter(|&&t| t != IGNORE_INDEX).count();
    if count == 0 {
        return Err(GptError::Validation(
            "every target is IGNORE_INDEX; loss is undefined".to_string(),
        ));
    }
    Ok(count)
}

/// `log Σ exp(row)` computed stably
fn log_sum_exp(row: &[f32]) -> (f32, f32) {
    let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let sum: f32 = row.iter().map(|&x| (x - max).exp()).sum();
    (max, max + sum.ln())
}

/// Mean cross-entropy of `logits [N, V]` against `targets [N]`
pub fn cross_entropy(logits: &Tensor, targets: &[usize]) -> Result<f32> {
    let v = logits.last_dim();
    let count = scored_count(targets)?;
    let total: f32 = logits
        .data
        .par_chunks(v)
        .zip(targets.par_iter())
        .filter(|&(_, &t)| t != IGNORE_INDEX)
        .map(|(row, &t)| log_sum_exp(row).1 - row[t])
        .sum();
    Ok(total / count as f32)
}

/// Cross-entropy plus its gradient with respect to the logits
///
/// The gradient is `(softmax - onehot) * scale / count`, zero on ignored rows.
fn cross_entropy_backward(logits: &Tensor, targets: &[usize], scale: f32) -> Result<(f32, Tensor)> {
    let v = logits.last_dim();
    let count = scored_count(targets)?;
    let factor = scale / count as f32;

    let mut grad = vec![0.0; logits.numel()];
    let total: f32 = grad
        .par_chunks_mut(v)
        .zip(logits.data.par_chunks(v))
        .zip(targets.par_iter())
        .map(|((g, row), &t)| {
            if t == IGNORE_INDEX {
                return 0.0;
            }
            let (max, lse) = log_sum_exp(row);
            let denom = (lse - max).exp();
            for (gj, &x) in g.iter_mut().zip(row) {
                *gj = (x - max).exp() / denom * factor;
            }
            g[t] -= factor;
            lse - row[t]
        })
        .sum();

    Ok((total / count as f32, Tensor::new(grad, logits.shape.clone())))
}

/// Mask every logit below the k-th largest to `-inf`
fn apply_top_k(logits: &mut [f32], k: usize) {
    if k >= logits.len() {
        return;
    }
    let mut sorted = logits.to_vec();
    sorted.sort_unstable_by(|a, b| b.total_cmp(a));
    let threshold = sorted[k - 1];
    for l in logits.iter_mut() {
        if *l < threshold {
            *l = f32::NEG_INFINITY;
        }
    }
}

/// Draw an index from a categorical distribution
pub fn sample_from_probs<R: Rng + ?Sized>(probs: &[f32], rng: &mut R) -> usize {
    let r: f32 = rng.random::<f32>();
    let mut cumsum = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return i;
        }
    }
    // rounding left r above the total; take the last reachable index
    probs.iter().rposition(|&p| p > 0.0).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny_model(seed: u64) -> (Gpt, StdRng) {
        let mut rng = StdRng::seed_from_u64(seed);
        let model = Gpt::new(ModelConfig::tiny(11), &mut rng).unwrap();
        (model, rng)
    }

    fn batch(b: usize, t: usize, offset: usize) -> TokenBatch {
        TokenBatch::new((0..b * t).map(|i| (i + offset) % 11).collect(), b, t).unwrap()
    }

    #[test]
    fn test_missing_sizes_are_configuration_errors() {
        let mut rng = StdRng::seed_from_u64(0);
        let no_vocab = ModelConfig {
            vocab_size: None,
            ..ModelConfig::tiny(11)
        };
        assert!(matches!(
            Gpt::new(no_vocab, &mut rng),
            Err(GptError::Configuration(_))
        ));

        let bad_heads = ModelConfig {
            n_head: 3,
            ..ModelConfig::tiny(11)
        };
        assert!(matches!(
            Gpt::new(bad_heads, &mut rng),
            Err(GptError::Configuration(_))
        ));
    }

    #[test]
    fn test_forward_shapes_with_and_without_targets() {
        let (model, mut rng) = tiny_model(1);
        let idx = batch(2, 5, 0);

        let (logits, loss) = model.forward(&idx, None, &mut rng).unwrap();
        assert_eq!(logits.shape, vec![2, 1, 11]);
        assert!(loss.is_none());

        let targets = batch(2, 5, 1);
        let (logits, loss) = model.forward(&idx, Some(&targets), &mut rng).unwrap();
        assert_eq!(logits.shape, vec![2, 5, 11]);
        let loss = loss.unwrap();
        assert!(loss > 0.0);
        // near-uniform predictions at init
        assert!((loss - (11.0f32).ln()).abs() < 0.5, "loss {}", loss);
    }

    #[test]
    fn test_sequence_longer_than_block_is_rejected() {
        let mut rng = StdRng::seed_from_u64(2);
        let cfg = ModelConfig {
            block_size: Some(32),
            ..ModelConfig::tiny(11)
        };
        let model = Gpt::new(cfg, &mut rng).unwrap();
        let idx = batch(1, 33, 0);
        assert!(matches!(
            model.forward(&idx, None, &mut rng),
            Err(GptError::Validation(_))
        ));
    }

    #[test]
    fn test_last_position_logits_match_full_forward() {
        let (model, mut rng) = tiny_model(3);
        let idx = batch(2, 4, 0);
        let targets = batch(2, 4, 1);

        let (full, _) = model.forward(&idx, Some(&targets), &mut rng).unwrap();
        let (last, _) = model.forward(&idx, None, &mut rng).unwrap();
        for b in 0..2 {
            for v in 0..11 {
                let a = full.data[(b * 4 + 3) * 11 + v];
                let c = last.data[b * 11 + v];
                assert!((a - c).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_ignore_index_excluded_from_loss() {
        let (model, mut rng) = tiny_model(4);
        let idx = batch(1, 4, 0);
        let full = batch(1, 4, 1);
        let mut partial = full.clone();
        partial.ids[0] = IGNORE_INDEX;
        partial.ids[1] = IGNORE_INDEX;

        let (logits, _) = model.forward(&idx, Some(&full), &mut rng).unwrap();
        let v = 11;
        let manual: f32 = (2..4)
            .map(|i| {
                let row = &logits.data[i * v..(i + 1) * v];
                log_sum_exp(row).1 - row[full.ids[i]]
            })
            .sum::<f32>()
            / 2.0;

        let (_, loss) = model.forward(&idx, Some(&partial), &mut rng).unwrap();
        assert!((loss.unwrap() - manual).abs() < 1e-5);
    }

    #[test]
    fn test_forward_backward_matches_finite_difference() {
        let (mut model, mut rng) = tiny_model(5);
        let idx = batch(2, 3, 0);
        let targets = batch(2, 3, 2);

        model.zero_grad();
        let loss = model.forward_backward(&idx, &targets, 1.0, &mut rng).unwrap();
        let (_, reference) = model.forward(&idx, Some(&targets), &mut rng).unwrap();
        assert!((loss - reference.unwrap()).abs() < 1e-5);

        // probe a few entries of tied wte, a block weight and ln_f
        let probes: Vec<(usize, usize)> = vec![(0, 3), (0, 16 * 2 + 5), (2, 7), (6, 1)];
        let eps = 1e-2;
        for (param_idx, elem) in probes {
            let analytic = model.parameters()[param_idx].grad.data[elem];
            let original = model.parameters()[param_idx].value.data[elem];

            model.parameters_mut()[param_idx].value.data[elem] = original + eps;
            let (_, plus) = model.forward(&idx, Some(&targets), &mut rng).unwrap();
            model.parameters_mut()[param_idx].value.data[elem] = original - eps;
            let (_, minus) = model.forward(&idx, Some(&targets), &mut rng).unwrap();
            model.parameters_mut()[param_idx].value.data[elem] = original;

            let numeric = (plus.unwrap() - minus.unwrap()) / (2.0 * eps);
            assert!(
                (numeric - analytic).abs() < 1e-3 + 0.05 * analytic.abs(),
                "param {} elem {}: numeric {} vs analytic {}",
                param_idx,
                elem,
                numeric,
                analytic
            );
        }
    }

    #[test]
    fn test_loss_scale_scales_gradients_and_accumulates() {
        let (mut model, mut rng) = tiny_model(6);
        let idx = batch(2, 4, 0);
        let targets = batch(2, 4, 1);

        model.zero_grad();
        model.forward_backward(&idx, &targets, 1.0, &mut rng).unwrap();
        let full: Vec<f32> = model.wte.grad.data.clone();

        model.zero_grad();
        model.forward_backward(&idx, &targets, 0.5, &mut rng).unwrap();
        model.forward_backward(&idx, &targets, 0.5, &mut rng).unwrap();
        for (a, b) in full.iter().zip(&model.wte.grad.data) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_generate_length_and_range() {
        let (mut model, mut rng) = tiny_model(7);
        model.set_training(false);
        let idx = TokenBatch::from_rows(&[vec![1, 2, 3], vec![4, 5, 6]]).unwrap();

        // more new tokens than block_size forces context cropping
        let out = model.generate(&idx, 20, 0.8, Some(5), &mut rng).unwrap();
        assert_eq!(out.seq_len, 23);
        assert_eq!(out.batch, 2);
        assert_eq!(&out.row(0)[..3], &[1, 2, 3]);
        assert!(out.ids.iter().all(|&id| id < 11));

        // k larger than vocab is clamped
        let out = model.generate(&idx, 2, 1.0, Some(1000), &mut rng).unwrap();
        assert_eq!(out.seq_len, 5);
    }

    #[test]
    fn test_top_k_one_is_greedy() {
        let (mut model, mut rng) = tiny_model(8);
        model.set_training(false);
        let idx = TokenBatch::single(vec![3, 1]);

        let (logits, _) = model.forward(&idx, None, &mut rng).unwrap();
        let argmax = logits
            .data
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();

        let out = model.generate(&idx, 1, 1.0, Some(1), &mut rng).unwrap();
        assert_eq!(out.get(0, 2), argmax);
    }

    #[test]
    fn test_num_params_counts_tied_head_once() {
        let (model, _) = tiny_model(9);
        let c = 16;
        let per_block = 2 * (2 * c) // ln_1, ln_2
            + (c * 3 * c + 3 * c) + (c * c + c) // attention
            + (c * 4 * c + 4 * c) + (4 * c * c + c); // mlp
        let expected = 11 * c + 16 * c + 2 * per_block + 2 * c;
        assert_eq!(model.num_params(false), expected);
        assert_eq!(model.num_params(true), expected - 16 * c);
    }

    #[test]
    fn test_crop_block_size() {
        let (mut model, mut rng) = tiny_model(10);
        assert!(matches!(
            model.crop_block_size(32),
            Err(GptError::Validation(_))
        ));

        model.crop_block_size(8).unwrap();
        assert_eq!(model.block_size(), 8);
        assert_eq!(model.config().block_size, Some(8));
        assert_eq!(model.wpe.grad.shape, vec![8, 16]);
        assert!(model.h.iter().all(|b| b.attn.block_size() == 8));

        assert!(model.forward(&batch(1, 8, 0), None, &mut rng).is_ok());
        assert!(model.forward(&batch(1, 9, 0), None, &mut rng).is_err());
    }

    #[test]
    fn test_configure_optimizers_partitions_every_parameter_once() {
        let (model, _) = tiny_model(11);
        let opt = model
            .configure_optimizers(0.1, 6e-4, (0.9, 0.95), "cpu")
            .unwrap();
        let groups = crate::optimizer::Optimizer::param_groups(&opt);
        let params = model.parameters();

        let mut seen = vec![0usize; params.len()];
        for group in groups {
            for &i in &group.param_indices {
                seen[i] += 1;
                if group.weight_decay > 0.0 {
                    assert!(params[i].ndim() >= 2, "{} decayed", params[i].name);
                } else {
                    assert!(params[i].ndim() < 2, "{} not decayed", params[i].name);
                }
            }
        }
        assert!(seen.iter().all(|&n| n == 1));
    }

    #[test]
    fn test_state_dict_round_trip_and_mismatch() {
        let (model, mut rng) = tiny_model(12);
        let mut other = Gpt::new(ModelConfig::tiny(11), &mut StdRng::seed_from_u64(99)).unwrap();
        other.load_state_dict(model.state_dict()).unwrap();

        let idx = batch(1, 4, 0);
        let (a, _) = model.forward(&idx, None, &mut rng).unwrap();
        let (b, _) = other.forward(&idx, None, &mut rng).unwrap();
        assert_eq!(a, b);

        let mut wrong = Gpt::new(ModelConfig::tiny(12), &mut rng).unwrap();
        assert!(matches!(
            wrong.load_state_dict(model.state_dict()),
            Err(GptError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_estimate_mfu_scales_inversely_with_time() {
        let (model, _) = tiny_model(13);
        let fast = model.estimate_mfu(4, 0.5, 1e12);
        let slow = model.estimate_mfu(4, 1.0, 1e12);
        assert!(fast > 0.0);
        assert!((fast - 2.0 * slow).abs() < 1e-12);
    }

    #[test]
    fn test_sample_from_probs_respects_zeros() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..100 {
            let i = sample_from_probs(&[0.0, 0.3, 0.0, 0.7], &mut rng);
            assert!(i == 1 || i == 3);
        }
    }
}
