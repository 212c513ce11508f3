//! Train a GPT model on pre-tokenized data
//!
//! ```bash
//! # character-level Shakespeare
//! cargo run --release --bin train -- --preset shakespeare_char
//!
//! # JSON config with overrides
//! cargo run --release --bin train -- --config run.json --max-iters 2000 --batch-size 32
//!
//! # continue from out_dir/ckpt.bin
//! cargo run --release --bin train -- --config run.json --init-from resume
//! ```
//!
//! The data directory must hold `train.bin` and `val.bin` (little-endian
//! `u16` token ids) and optionally `meta.json` with `vocab_size`.

use anyhow::Context;
use clap::Parser;
use nanogpt::{InitFrom, TrainConfig, Trainer};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "train", about = "Train a GPT language model from scratch")]
struct Args {
    /// JSON config file; absent keys keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Named preset (default, shakespeare_char, tiny); ignored with --config
    #[arg(long)]
    preset: Option<String>,

    /// Print the available presets and exit
    #[arg(long)]
    list_presets: bool,

    #[arg(long, value_enum)]
    init_from: Option<InitFrom>,

    #[arg(long)]
    out_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    eval_interval: Option<usize>,

    #[arg(long)]
    eval_iters: Option<usize>,

    #[arg(long)]
    log_interval: Option<usize>,

    /// Evaluate once and exit
    #[arg(long)]
    eval_only: bool,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    block_size: Option<usize>,

    #[arg(long)]
    gradient_accumulation_steps: Option<usize>,

    #[arg(long)]
    n_layer: Option<usize>,

    #[arg(long)]
    n_head: Option<usize>,

    #[arg(long)]
    n_embd: Option<usize>,

    #[arg(long)]
    dropout: Option<f32>,

    #[arg(long)]
    learning_rate: Option<f32>,

    #[arg(long)]
    min_lr: Option<f32>,

    #[arg(long)]
    max_iters: Option<usize>,

    #[arg(long)]
    warmup_iters: Option<usize>,

    #[arg(long)]
    lr_decay_iters: Option<usize>,

    #[arg(long)]
    weight_decay: Option<f32>,

    #[arg(long)]
    grad_clip: Option<f32>,

    #[arg(long)]
    seed: Option<u64>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<TrainConfig> {
        let mut cfg = match (&self.config, &self.preset) {
            (Some(path), _) => TrainConfig::from_json_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            (None, Some(name)) => TrainConfig::preset(name)?,
            (None, None) => TrainConfig::default(),
        };

        macro_rules! apply {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = self.$field {
                    cfg.$field = v;
                })*
            };
        }
        apply!(
            init_from,
            out_dir,
            data_dir,
            eval_interval,
            eval_iters,
            log_interval,
            batch_size,
            block_size,
            gradient_accumulation_steps,
            n_layer,
            n_head,
            n_embd,
            dropout,
            learning_rate,
            min_lr,
            max_iters,
            warmup_iters,
            lr_decay_iters,
            weight_decay,
            grad_clip,
            seed,
        );
        if self.eval_only {
            cfg.eval_only = true;
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

fn list_presets() {
    println!("Available presets:\n");
    for name in ["default", "shakespeare_char", "tiny"] {
        if let Ok(cfg) = TrainConfig::preset(name) {
            println!(
                "  {:<18} {} layers, {} heads, {} embd, block {}, {} iters",
                name, cfg.n_layer, cfg.n_head, cfg.n_embd, cfg.block_size, cfg.max_iters
            );
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nanogpt=info,train=info")),
        )
        .init();

    let args = Args::parse();
    if args.list_presets {
        list_presets();
        return Ok(());
    }
    let config = args.into_config()?;
    info!(
        "config:\n{}",
        serde_json::to_string_pretty(&config).context("serializing config")?
    );

    let mut trainer = Trainer::new(config).context("setting up training")?;
    let summary = trainer.train()?;
    info!(
        iter_num = summary.iter_num,
        best_val_loss = summary.best_val_loss,
        "training finished"
    );
    Ok(())
}
