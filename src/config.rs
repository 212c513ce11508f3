//! Model and Training Configuration
//!
//! Two value types:
//!
//! - [`ModelConfig`]: the architecture (context length, vocabulary, depth,
//!   width, heads, dropout, bias). Stored inside every checkpoint so a model
//!   can be rebuilt with the exact same shapes.
//! - [`TrainConfig`]: everything the trainer needs, including the
//!   architecture fields a fresh run starts from. Loadable from JSON; missing
//!   keys fall back to the defaults below.
//!
//! # Parameter Count
//!
//! ```text
//! embeddings = vocab_size × n_embd + block_size × n_embd
//! per_layer ≈ 12 × n_embd²
//! total ≈ embeddings + n_layer × per_layer
//! ```
//!
//! The output head shares `wte`, so it adds nothing.

use crate::error::{GptError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Transformer architecture hyperparameters
///
/// `vocab_size` and `block_size` are optional so that a config assembled
/// before the dataset is inspected can say "not yet known". Both must be set
/// before a model is built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub block_size: Option<usize>,
    pub vocab_size: Option<usize>,
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
    pub dropout: f32,
    /// Bias in linear layers and layer norms
    pub bias: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            block_size: Some(1024),
            // GPT-2's 50257 rounded up to a multiple of 64
            vocab_size: Some(50304),
            n_layer: 12,
            n_head: 12,
            n_embd: 768,
            dropout: 0.0,
            bias: true,
        }
    }
}

impl ModelConfig {
    /// Small config for tests and quick experiments
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            block_size: Some(16),
            vocab_size: Some(vocab_size),
            n_layer: 2,
            n_head: 2,
            n_embd: 16,
            dropout: 0.0,
            bias: true,
        }
    }

    /// Architecture section of a training config
    ///
    /// `vocab_size` usually comes from the dataset's `meta.json`.
    pub fn from_train_config(cfg: &TrainConfig, vocab_size: Option<usize>) -> Self {
        Self {
            block_size: Some(cfg.block_size),
            vocab_size,
            n_layer: cfg.n_layer,
            n_head: cfg.n_head,
            n_embd: cfg.n_embd,
            dropout: cfg.dropout,
            bias: cfg.bias,
        }
    }

    /// Per-head dimension `n_embd / n_head`
    pub fn head_size(&self) -> usize {
        self.n_embd / self.n_head.max(1)
    }

    pub fn require_block_size(&self) -> Result<usize> {
        self.block_size
            .ok_or_else(|| GptError::Configuration("block_size must be set".to_string()))
    }

    pub fn require_vocab_size(&self) -> Result<usize> {
        self.vocab_size
            .ok_or_else(|| GptError::Configuration("vocab_size must be set".to_string()))
    }
}

/// How a training run obtains its starting weights
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InitFrom {
    /// Fresh random initialization
    Scratch,
    /// Continue from `out_dir/ckpt.bin`
    Resume,
}

/// Training hyperparameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    // I/O
    pub out_dir: PathBuf,
    pub eval_interval: usize,
    pub log_interval: usize,
    pub eval_iters: usize,
    /// Run one evaluation and exit
    pub eval_only: bool,
    pub always_save_checkpoint: bool,
    pub init_from: InitFrom,

    // data
    pub data_dir: PathBuf,
    pub gradient_accumulation_steps: usize,
    pub batch_size: usize,
    pub block_size: usize,

    // model
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
    pub dropout: f32,
    pub bias: bool,

    // AdamW
    pub learning_rate: f32,
    pub max_iters: usize,
    pub weight_decay: f32,
    pub beta1: f32,
    pub beta2: f32,
    /// Clip gradients at this global norm; 0 disables clipping
    pub grad_clip: f32,

    // learning rate schedule
    pub decay_lr: bool,
    pub warmup_iters: usize,
    pub lr_decay_iters: usize,
    pub min_lr: f32,

    // system
    pub device: String,
    pub seed: u64,
    /// Peak FLOP/s of the machine, the denominator of the logged MFU
    pub peak_flops: f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("out"),
            eval_interval: 2000,
            log_interval: 1,
            eval_iters: 200,
            eval_only: false,
            always_save_checkpoint: true,
            init_from: InitFrom::Scratch,

            data_dir: PathBuf::from("data/openwebtext"),
            gradient_accumulation_steps: 40,
            batch_size: 12,
            block_size: 1024,

            n_layer: 12,
            n_head: 12,
            n_embd: 768,
            dropout: 0.0,
            bias: false,

            learning_rate: 6e-4,
            max_iters: 600_000,
            weight_decay: 1e-1,
            beta1: 0.9,
            beta2: 0.95,
            grad_clip: 1.0,

            decay_lr: true,
            warmup_iters: 2000,
            lr_decay_iters: 600_000,
            min_lr: 6e-5,

            device: "cpu".to_string(),
            seed: 1337,
            peak_flops: 1e12,
        }
    }
}

impl TrainConfig {
    /// Character-level Shakespeare baby GPT
    ///
    /// Small enough to train on a laptop CPU; overfits without the dropout.
    pub fn shakespeare_char() -> Self {
        Self {
            out_dir: PathBuf::from("out-shakespeare-char"),
            eval_interval: 250,
            log_interval: 10,
            eval_iters: 200,
            always_save_checkpoint: false,
            data_dir: PathBuf::from("data/shakespeare_char"),
            gradient_accumulation_steps: 1,
            batch_size: 64,
            block_size: 256,
            n_layer: 6,
            n_head: 6,
            n_embd: 384,
            dropout: 0.2,
            learning_rate: 1e-3,
            max_iters: 5000,
            lr_decay_iters: 5000,
            min_lr: 1e-4,
            beta2: 0.99,
            warmup_iters: 100,
            ..Self::default()
        }
    }

    /// Tiny run for smoke tests: a few iterations of a 2-layer model
    pub fn tiny() -> Self {
        Self {
            out_dir: PathBuf::from("out-tiny"),
            eval_interval: 5,
            log_interval: 1,
            eval_iters: 2,
            always_save_checkpoint: true,
            data_dir: PathBuf::from("data/tiny"),
            gradient_accumulation_steps: 2,
            batch_size: 4,
            block_size: 16,
            n_layer: 2,
            n_head: 2,
            n_embd: 16,
            learning_rate: 1e-2,
            max_iters: 10,
            warmup_iters: 2,
            lr_decay_iters: 10,
            min_lr: 1e-3,
            ..Self::default()
        }
    }

    /// Look up a named preset
    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "default" | "gpt2" => Ok(Self::default()),
            "shakespeare_char" | "shakespeare-char" => Ok(Self::shakespeare_char()),
            "tiny" => Ok(Self::tiny()),
            other => Err(GptError::Configuration(format!(
                "unknown preset '{}' (expected default, shakespeare_char or tiny)",
                other
            ))),
        }
    }

    /// Load a config from a JSON file; absent keys keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the trainer cannot run with
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size", self.batch_size),
            ("block_size", self.block_size),
            ("gradient_accumulation_steps", self.gradient_accumulation_steps),
            ("eval_interval", self.eval_interval),
            ("log_interval", self.log_interval),
            ("eval_iters", self.eval_iters),
            ("n_layer", self.n_layer),
            ("n_head", self.n_head),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(GptError::Configuration(format!("{} must be > 0", name)));
            }
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(GptError::Configuration(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.min_lr > self.learning_rate {
            return Err(GptError::Configuration(format!(
                "min_lr ({}) exceeds learning_rate ({})",
                self.min_lr, self.learning_rate
            )));
        }
        Ok(())
    }

    /// Tokens consumed per optimizer step
    pub fn tokens_per_iter(&self) -> usize {
        self.gradient_accumulation_steps * self.batch_size * self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, r#"{{"batch_size": 3, "init_from": "resume", "out_dir": "runs/a"}}"#).unwrap();

        let cfg = TrainConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.batch_size, 3);
        assert_eq!(cfg.init_from, InitFrom::Resume);
        assert_eq!(cfg.out_dir, PathBuf::from("runs/a"));
        assert_eq!(cfg.block_size, TrainConfig::default().block_size);
    }

    #[test]
    fn test_validate_rejects_zero_accumulation() {
        let cfg = TrainConfig {
            gradient_accumulation_steps: 0,
            ..TrainConfig::tiny()
        };
        assert!(matches!(cfg.validate(), Err(GptError::Configuration(_))));
    }

    #[test]
    fn test_model_config_from_train_config() {
        let cfg = TrainConfig::shakespeare_char();
        let model = ModelConfig::from_train_config(&cfg, Some(65));
        assert_eq!(model.block_size, Some(256));
        assert_eq!(model.vocab_size, Some(65));
        assert_eq!(model.head_size(), 64);
        assert!((model.dropout - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_missing_vocab_size_is_configuration_error() {
        let cfg = ModelConfig {
            vocab_size: None,
            ..ModelConfig::default()
        };
        assert!(matches!(
            cfg.require_vocab_size(),
            Err(GptError::Configuration(_))
        ));
    }

    #[test]
    fn test_unknown_preset() {
        assert!(TrainConfig::preset("shakespeare_char").is_ok());
        assert!(TrainConfig::preset("nope").is_err());
    }
}
