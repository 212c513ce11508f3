//! Sample text from a trained checkpoint
//!
//! ```bash
//! cargo run --release --bin sample -- --out-dir out-shakespeare-char \
//!     --start "ROMEO:" --num-samples 3 --max-new-tokens 200
//! ```
//!
//! The prompt is either comma separated token ids (`--start-ids 0,5,9`) or,
//! for character-level datasets with a `meta.json` vocabulary, plain text
//! (`--start`). Output is decoded with the same vocabulary when available.

use anyhow::{bail, Context};
use clap::Parser;
use nanogpt::{Checkpoint, DatasetMeta, TokenBatch, CHECKPOINT_FILE};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "sample", about = "Generate samples from a trained GPT checkpoint")]
struct Args {
    /// Directory holding ckpt.bin
    #[arg(long, default_value = "out")]
    out_dir: PathBuf,

    /// Dataset directory for meta.json; defaults to the checkpoint's data_dir
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Prompt text, encoded with the meta.json character table
    #[arg(long)]
    start: Option<String>,

    /// Prompt as comma separated token ids
    #[arg(long, value_delimiter = ',')]
    start_ids: Vec<usize>,

    #[arg(long, default_value_t = 3)]
    num_samples: usize,

    #[arg(long, default_value_t = 500)]
    max_new_tokens: usize,

    /// Values below 1.0 sharpen the distribution, above 1.0 flatten it
    #[arg(long, default_value_t = 0.8)]
    temperature: f32,

    /// Keep only the k most likely tokens at each step
    #[arg(long, default_value_t = 200)]
    top_k: usize,

    #[arg(long, default_value_t = 1337)]
    seed: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nanogpt=info,sample=info")),
        )
        .init();

    let args = Args::parse();
    let mut rng = StdRng::seed_from_u64(args.seed);

    let ckpt_path = args.out_dir.join(CHECKPOINT_FILE);
    let ckpt = Checkpoint::load(&ckpt_path)
        .with_context(|| format!("loading {}", ckpt_path.display()))?;
    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| ckpt.config.data_dir.clone());
    let meta = DatasetMeta::load(&data_dir)?;

    let mut model = ckpt.into_model(&mut rng)?;
    model.set_training(false);

    let prompt = match (&args.start, args.start_ids.is_empty()) {
        (Some(text), _) => {
            let Some(meta) = &meta else {
                bail!("--start needs {}/meta.json; use --start-ids", data_dir.display());
            };
            match meta.encode(text) {
                Some(ids) => ids,
                None => bail!("prompt contains characters outside the vocabulary"),
            }
        }
        (None, false) => args.start_ids.clone(),
        // no prompt: start from token 0
        (None, true) => vec![0],
    };
    info!(prompt_tokens = prompt.len(), "sampling");

    let idx = TokenBatch::single(prompt);
    for _ in 0..args.num_samples {
        let out = model.generate(
            &idx,
            args.max_new_tokens,
            args.temperature,
            Some(args.top_k),
            &mut rng,
        )?;
        let ids = out.row(0);
        match meta.as_ref().and_then(|m| m.decode(ids)) {
            Some(text) => println!("{}", text),
            None => println!("{:?}", ids),
        }
        println!("---------------");
    }
    Ok(())
}
