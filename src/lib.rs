//! nanogpt: a GPT-style language model trained from scratch
//!
//! A decoder-only transformer with hand-written backward passes, an AdamW
//! optimizer, a random-access token data loader, and a warmup + cosine
//! learning-rate schedule. Everything runs on the CPU, parallelized with
//! Rayon inside individual tensor operations.
//!
//! # Modules
//!
//! - [`tensor`] - n-dimensional `f32` arrays and the operations the model needs
//! - [`parameter`] - trainable tensors with gradient buffers, the [`Module`] trait
//! - [`layers`] - linear, layer norm, attention, MLP, block; forward and backward
//! - [`model`] - the [`Gpt`] model: loss, generation, optimizer groups
//! - [`optimizer`], [`gradients`], [`lr_schedule`] - the update rule
//! - [`data`] - `train.bin` / `val.bin` batch sampling
//! - [`checkpoint`] - `ckpt.bin` save and load
//! - [`trainer`] - the training loop
//!
//! # Example
//!
//! ```rust,no_run
//! use nanogpt::{Trainer, TrainConfig};
//!
//! let mut trainer = Trainer::new(TrainConfig::shakespeare_char())?;
//! let summary = trainer.train()?;
//! println!("best val loss {:.4}", summary.best_val_loss);
//! # Ok::<(), nanogpt::GptError>(())
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod gradients;
pub mod layers;
pub mod lr_schedule;
pub mod model;
pub mod optimizer;
pub mod parameter;
pub mod tensor;
pub mod trainer;
pub mod training_logger;

pub use checkpoint::{save_checkpoint, Checkpoint, CHECKPOINT_FILE};
pub use config::{InitFrom, ModelConfig, TrainConfig};
pub use data::{DataLoader, DatasetMeta, Split, TokenBatch};
pub use error::{GptError, Result};
pub use lr_schedule::CosineSchedule;
pub use model::{Gpt, IGNORE_INDEX};
pub use optimizer::{AdamW, Optimizer, ParamGroup};
pub use parameter::{Module, Parameter};
pub use tensor::Tensor;
pub use trainer::{EvalLosses, TrainSummary, Trainer};
pub use training_logger::TrainingLogger;
