//! Training Loop
//!
//! One iteration:
//!
//! ```text
//! lr = schedule(iter_num)                    written to every param group
//! every eval_interval: estimate losses, log CSV row, maybe checkpoint
//!     (eval_only: evaluate once, then stop)
//! zero gradients
//! repeat gradient_accumulation_steps:
//!     forward_backward(x, y, scale = 1 / steps)
//!     prefetch next (x, y)
//! clip global gradient norm at grad_clip
//! AdamW step
//! iter_num += 1
//! ```
//!
//! The loop runs while `iter_num <= max_iters`. Only the model weights and
//! the two counters survive a checkpoint; the optimizer is rebuilt on
//! resume.

use crate::checkpoint::{save_checkpoint, Checkpoint, CHECKPOINT_FILE};
use crate::config::{InitFrom, ModelConfig, TrainConfig};
use crate::data::{DataLoader, DatasetMeta, Split, TokenBatch};
use crate::error::Result;
use crate::gradients::clip_grad_norm;
use crate::lr_schedule::CosineSchedule;
use crate::model::Gpt;
use crate::optimizer::{AdamW, Optimizer};
use crate::parameter::Module;
use crate::training_logger::{TrainingLogger, TRAINING_LOG_FILE};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Vocabulary assumed when the dataset has no `meta.json`
pub const DEFAULT_VOCAB_SIZE: usize = 50304;

/// Mean loss per split from [`Trainer::estimate_loss`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EvalLosses {
    pub train: f32,
    pub val: f32,
}

/// What a call to [`Trainer::train`] ended with
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrainSummary {
    /// Iteration counter after the loop
    pub iter_num: usize,
    pub best_val_loss: f32,
    /// Mean micro-batch loss of the last optimizer step, if any ran
    pub last_loss: Option<f32>,
    pub last_eval: Option<EvalLosses>,
}

/// Owns everything a training run needs
pub struct Trainer {
    pub model: Gpt,
    loader: DataLoader,
    optimizer: AdamW,
    schedule: CosineSchedule,
    pub config: TrainConfig,
    rng: StdRng,
    pub iter_num: usize,
    pub best_val_loss: f32,
}

impl Trainer {
    /// Set up a run according to `config.init_from`
    ///
    /// `scratch` builds a fresh model, reading `vocab_size` from the
    /// dataset's `meta.json` when present. `resume` loads
    /// `out_dir/ckpt.bin`, takes the architecture from the checkpoint
    /// (dropout stays as configured) and continues its counters.
    pub fn new(mut config: TrainConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);

        let (mut model, iter_num, best_val_loss) = match config.init_from {
            InitFrom::Scratch => {
                info!("initializing a new model from scratch");
                let vocab_size = match DatasetMeta::load(&config.data_dir)? {
                    Some(meta) => {
                        info!(vocab_size = meta.vocab_size, "found vocab_size in meta.json");
                        meta.vocab_size
                    }
                    None => {
                        warn!(
                            "no meta.json in {}; defaulting vocab_size to {}",
                            config.data_dir.display(),
                            DEFAULT_VOCAB_SIZE
                        );
                        DEFAULT_VOCAB_SIZE
                    }
                };
                let model_args = ModelConfig::from_train_config(&config, Some(vocab_size));
                (Gpt::new(model_args, &mut rng)?, 0, f32::INFINITY)
            }
            InitFrom::Resume => {
                let path = config.out_dir.join(CHECKPOINT_FILE);
                info!(path = %path.display(), "resuming training");
                let ckpt = Checkpoint::load(&path)?;
                let model_args = ModelConfig {
                    dropout: config.dropout,
                    ..ckpt.model_args.clone()
                };
                let (iter_num, best_val_loss) = (ckpt.iter_num, ckpt.best_val_loss);
                let mut model = Gpt::new(model_args, &mut rng)?;
                model.load_state_dict(ckpt.state)?;
                (model, iter_num, best_val_loss)
            }
        };

        if config.block_size < model.block_size() {
            model.crop_block_size(config.block_size)?;
        } else if config.block_size > model.block_size() {
            warn!(
                requested = config.block_size,
                model = model.block_size(),
                "block_size larger than the checkpoint's; using the checkpoint's"
            );
        }
        config.block_size = model.block_size();

        let loader = DataLoader::new(&config.data_dir, config.batch_size, config.block_size)?;
        let optimizer = Self::build_optimizer(&model, &config)?;
        let schedule = Self::build_schedule(&config);

        info!(
            tokens_per_iter = config.tokens_per_iter(),
            "{} sequences x {} tokens x {} accumulation steps",
            config.batch_size,
            config.block_size,
            config.gradient_accumulation_steps
        );

        Ok(Self {
            model,
            loader,
            optimizer,
            schedule,
            config,
            rng,
            iter_num,
            best_val_loss,
        })
    }

    fn build_optimizer(model: &Gpt, config: &TrainConfig) -> Result<AdamW> {
        model.configure_optimizers(
            config.weight_decay,
            config.learning_rate,
            (config.beta1, config.beta2),
            &config.device,
        )
    }

    fn build_schedule(config: &TrainConfig) -> CosineSchedule {
        CosineSchedule {
            decay_lr: config.decay_lr,
            ..CosineSchedule::new(
                config.learning_rate,
                config.min_lr,
                config.warmup_iters,
                config.lr_decay_iters,
            )
        }
    }

    pub fn optimizer(&self) -> &AdamW {
        &self.optimizer
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.config.out_dir.join(CHECKPOINT_FILE)
    }

    /// Average loss over `eval_iters` random batches of each split
    ///
    /// Runs with dropout off and restores the previous mode afterwards.
    pub fn estimate_loss(&mut self) -> Result<EvalLosses> {
        let was_training = self.model.is_training();
        self.model.set_training(false);

        let result = self.eval_splits();
        self.model.set_training(was_training);
        result
    }

    fn eval_splits(&mut self) -> Result<EvalLosses> {
        let mut means = [0.0f32; 2];
        for (mean, split) in means.iter_mut().zip(Split::ALL) {
            let mut total = 0.0;
            for _ in 0..self.config.eval_iters {
                let (x, y) = self.loader.get_batch(split, &mut self.rng)?;
                let (_, loss) = self.model.forward(&x, Some(&y), &mut self.rng)?;
                total += loss.unwrap_or(f32::NAN);
            }
            *mean = total / self.config.eval_iters as f32;
        }
        Ok(EvalLosses {
            train: means[0],
            val: means[1],
        })
    }

    /// Write `out_dir/ckpt.bin`
    pub fn save_checkpoint(&self) -> Result<()> {
        save_checkpoint(
            self.checkpoint_path(),
            &self.model,
            &self.config,
            self.iter_num,
            self.best_val_loss,
        )
    }

    /// Restore weights and counters from `path`; the optimizer starts fresh
    pub fn load_checkpoint(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let ckpt = Checkpoint::load(path)?;
        self.model.load_state_dict(ckpt.state)?;
        self.iter_num = ckpt.iter_num;
        self.best_val_loss = ckpt.best_val_loss;
        self.optimizer = Self::build_optimizer(&self.model, &self.config)?;
        Ok(())
    }

    /// Evaluate both splits, log the CSV row and checkpoint if warranted
    ///
    /// From iteration 1 on, an improved val loss (or any val loss with
    /// `always_save_checkpoint`) becomes `best_val_loss` and is saved.
    fn evaluate_and_checkpoint(
        &mut self,
        logger: &mut TrainingLogger,
        lr: f32,
    ) -> Result<EvalLosses> {
        let losses = self.estimate_loss()?;
        logger.log(self.iter_num, lr, losses.train, losses.val)?;

        let improved = losses.val < self.best_val_loss;
        if (improved || self.config.always_save_checkpoint) && self.iter_num > 0 {
            self.best_val_loss = losses.val;
            self.save_checkpoint()?;
        }
        Ok(losses)
    }

    /// Forward and backward over `gradient_accumulation_steps` micro-batches
    ///
    /// Each micro-step back-propagates `loss / steps` on the held batch and
    /// then prefetches the next one into `x`, `y`. Returns the sum of the
    /// scaled losses, which is the mean micro-batch loss.
    fn accumulate_gradients(&mut self, x: &mut TokenBatch, y: &mut TokenBatch) -> Result<f32> {
        let accum = self.config.gradient_accumulation_steps;
        let loss_scale = 1.0 / accum as f32;
        let mut loss = 0.0;
        for _ in 0..accum {
            loss += loss_scale
                * self
                    .model
                    .forward_backward(x, y, loss_scale, &mut self.rng)?;
            (*x, *y) = self.loader.get_batch(Split::Train, &mut self.rng)?;
        }
        Ok(loss)
    }

    /// Run the training loop until `iter_num > max_iters`
    pub fn train(&mut self) -> Result<TrainSummary> {
        let mut logger = TrainingLogger::new(self.config.out_dir.join(TRAINING_LOG_FILE))?;
        self.model.set_training(true);

        let accum = self.config.gradient_accumulation_steps;
        let mut last_loss = None;
        let mut last_eval = None;
        let mut running_mfu: Option<f64> = None;
        let mut local_iter = 0usize;

        let (mut x, mut y) = self.loader.get_batch(Split::Train, &mut self.rng)?;
        let mut t0 = Instant::now();

        while self.iter_num <= self.config.max_iters {
            let lr = self.schedule.step(&mut self.optimizer, self.iter_num);

            // eval_only always gets its one evaluation, even off-interval
            if self.iter_num % self.config.eval_interval == 0 || self.config.eval_only {
                last_eval = Some(self.evaluate_and_checkpoint(&mut logger, lr)?);
            }
            if self.config.eval_only {
                break;
            }

            self.model.zero_grad();
            let loss = self.accumulate_gradients(&mut x, &mut y)?;

            let mut params = self.model.parameters_mut();
            if self.config.grad_clip > 0.0 {
                let norm = clip_grad_norm(&mut params, self.config.grad_clip);
                debug!(grad_norm = norm, "clipped gradients");
            }
            self.optimizer.step(&mut params)?;
            drop(params);
            self.model.zero_grad();

            let dt = t0.elapsed().as_secs_f64();
            t0 = Instant::now();
            if self.iter_num % self.config.log_interval == 0 {
                // the first iterations include warm-up noise
                if local_iter >= 5 {
                    let mfu = self.model.estimate_mfu(
                        self.config.batch_size * accum,
                        dt,
                        self.config.peak_flops,
                    );
                    running_mfu = Some(match running_mfu {
                        Some(prev) => 0.9 * prev + 0.1 * mfu,
                        None => mfu,
                    });
                }
                info!(
                    "iter {}: loss {:.4}, lr {:.3e}, time {:.2}ms, mfu {:.2}%",
                    self.iter_num,
                    loss,
                    lr,
                    dt * 1000.0,
                    running_mfu.unwrap_or(0.0) * 100.0
                );
            }
            last_loss = Some(loss);

            self.iter_num += 1;
            local_iter += 1;
        }

        Ok(TrainSummary {
            iter_num: self.iter_num,
            best_val_loss: self.best_val_loss,
            last_loss,
            last_eval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::write_tokens;
    use tempfile::TempDir;

    /// Repeating pattern over a 7-token vocabulary
    fn dataset() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        let tokens: Vec<u16> = (0..2000).map(|i| (i % 7) as u16).collect();
        write_tokens(dir.path().join("train.bin"), &tokens).unwrap();
        write_tokens(dir.path().join("val.bin"), &tokens[..300]).unwrap();
        DatasetMeta {
            vocab_size: 7,
            itos: None,
            stoi: None,
        }
        .save(dir.path())
        .unwrap();
        dir
    }

    fn config(data: &TempDir, out: &TempDir) -> TrainConfig {
        TrainConfig {
            data_dir: data.path().to_path_buf(),
            out_dir: out.path().to_path_buf(),
            block_size: 8,
            ..TrainConfig::tiny()
        }
    }

    #[test]
    fn test_vocab_size_comes_from_meta() {
        let (data, out) = (dataset(), tempfile::tempdir().unwrap());
        let trainer = Trainer::new(config(&data, &out)).unwrap();
        assert_eq!(trainer.model.vocab_size(), 7);
        assert_eq!(trainer.model.block_size(), 8);
        assert_eq!(trainer.iter_num, 0);
        assert!(trainer.best_val_loss.is_infinite());
    }

    #[test]
    fn test_estimate_loss_restores_training_mode() {
        let (data, out) = (dataset(), tempfile::tempdir().unwrap());
        let mut trainer = Trainer::new(config(&data, &out)).unwrap();

        trainer.model.set_training(true);
        let losses = trainer.estimate_loss().unwrap();
        assert!(trainer.model.is_training());
        assert!(losses.train > 0.0 && losses.val > 0.0);
    }

    #[test]
    fn test_eval_only_runs_no_steps() {
        let (data, out) = (dataset(), tempfile::tempdir().unwrap());
        let cfg = TrainConfig {
            eval_only: true,
            ..config(&data, &out)
        };
        let mut trainer = Trainer::new(cfg).unwrap();
        let summary = trainer.train().unwrap();

        assert_eq!(summary.iter_num, 0);
        assert!(summary.last_loss.is_none());
        assert!(summary.last_eval.is_some());
        // iter 0 never checkpoints
        assert!(!trainer.checkpoint_path().exists());
    }

    #[test]
    fn test_training_reduces_loss_and_checkpoints() {
        let (data, out) = (dataset(), tempfile::tempdir().unwrap());
        let cfg = TrainConfig {
            max_iters: 30,
            lr_decay_iters: 30,
            eval_interval: 10,
            ..config(&data, &out)
        };
        let mut trainer = Trainer::new(cfg).unwrap();
        let initial = trainer.estimate_loss().unwrap();
        let summary = trainer.train().unwrap();

        assert_eq!(summary.iter_num, 31);
        let last = summary.last_eval.unwrap();
        assert!(
            last.val < initial.val,
            "val loss {} did not improve on {}",
            last.val,
            initial.val
        );
        assert!(trainer.checkpoint_path().exists());
        assert!(out.path().join(TRAINING_LOG_FILE).exists());
    }

    #[test]
    fn test_load_checkpoint_restores_counters_and_resets_optimizer() {
        let (data, out) = (dataset(), tempfile::tempdir().unwrap());
        let mut trainer = Trainer::new(config(&data, &out)).unwrap();
        trainer.iter_num = 17;
        trainer.best_val_loss = 1.5;
        trainer.save_checkpoint().unwrap();

        let other_out = tempfile::tempdir().unwrap();
        let mut other = Trainer::new(TrainConfig {
            seed: 4,
            ..config(&data, &other_out)
        })
        .unwrap();
        other.train().unwrap();
        assert!(other.optimizer().step > 0);

        other.load_checkpoint(trainer.checkpoint_path()).unwrap();
        assert_eq!(other.iter_num, 17);
        assert_eq!(other.best_val_loss, 1.5);
        assert_eq!(other.optimizer().step, 0);
        assert_eq!(other.model.state_dict(), trainer.model.state_dict());
    }

    #[test]
    fn test_always_save_overwrites_best_val_loss() {
        let (data, out) = (dataset(), tempfile::tempdir().unwrap());
        let mut trainer = Trainer::new(TrainConfig {
            always_save_checkpoint: true,
            ..config(&data, &out)
        })
        .unwrap();
        let mut logger = TrainingLogger::new(out.path().join(TRAINING_LOG_FILE)).unwrap();

        // an unbeatable best still gets replaced by the current val loss
        trainer.iter_num = 5;
        trainer.best_val_loss = 0.0;
        let losses = trainer.evaluate_and_checkpoint(&mut logger, 1e-3).unwrap();
        assert!(losses.val > 0.0);
        assert_eq!(trainer.best_val_loss, losses.val);

        let ckpt = Checkpoint::load(trainer.checkpoint_path()).unwrap();
        assert_eq!(ckpt.best_val_loss, losses.val);
        assert_eq!(ckpt.iter_num, 5);
    }

    #[test]
    fn test_best_val_loss_untouched_at_iter_zero() {
        let (data, out) = (dataset(), tempfile::tempdir().unwrap());
        let mut trainer = Trainer::new(config(&data, &out)).unwrap();
        let mut logger = TrainingLogger::new(out.path().join(TRAINING_LOG_FILE)).unwrap();

        trainer.evaluate_and_checkpoint(&mut logger, 1e-3).unwrap();
        assert!(trainer.best_val_loss.is_infinite());
        assert!(!trainer.checkpoint_path().exists());

        let summary = Trainer::new(TrainConfig {
            eval_only: true,
            ..config(&data, &out)
        })
        .unwrap()
        .train()
        .unwrap();
        assert!(summary.best_val_loss.is_infinite());
    }

    #[test]
    fn test_improvement_without_always_save() {
        let (data, out) = (dataset(), tempfile::tempdir().unwrap());
        let mut trainer = Trainer::new(TrainConfig {
            always_save_checkpoint: false,
            ..config(&data, &out)
        })
        .unwrap();
        let mut logger = TrainingLogger::new(out.path().join(TRAINING_LOG_FILE)).unwrap();

        trainer.iter_num = 5;
        trainer.best_val_loss = 0.0;
        trainer.evaluate_and_checkpoint(&mut logger, 1e-3).unwrap();
        assert_eq!(trainer.best_val_loss, 0.0);
        assert!(!trainer.checkpoint_path().exists());

        trainer.best_val_loss = f32::INFINITY;
        let losses = trainer.evaluate_and_checkpoint(&mut logger, 1e-3).unwrap();
        assert_eq!(trainer.best_val_loss, losses.val);
        assert!(trainer.checkpoint_path().exists());
    }

    #[test]
    fn test_eval_only_evaluates_off_interval_after_resume() {
        let (data, out) = (dataset(), tempfile::tempdir().unwrap());
        let mut trainer = Trainer::new(config(&data, &out)).unwrap();
        trainer.iter_num = 3;
        trainer.save_checkpoint().unwrap();

        let mut resumed = Trainer::new(TrainConfig {
            init_from: InitFrom::Resume,
            eval_only: true,
            ..config(&data, &out)
        })
        .unwrap();
        assert_eq!(resumed.iter_num % resumed.config.eval_interval, 3);
        let summary = resumed.train().unwrap();

        assert_eq!(summary.iter_num, 3);
        assert!(summary.last_eval.is_some());
        assert!(summary.last_loss.is_none());
    }

    #[test]
    fn test_accumulated_loss_is_mean_of_micro_batches() {
        let (data, out) = (dataset(), tempfile::tempdir().unwrap());
        let mut trainer = Trainer::new(TrainConfig {
            gradient_accumulation_steps: 2,
            ..config(&data, &out)
        })
        .unwrap();

        // dropout is off, so only the loader draws from the rng
        let mut rng = StdRng::seed_from_u64(9);
        let (mut x, mut y) = trainer.loader.get_batch(Split::Train, &mut rng).unwrap();
        trainer.rng = rng.clone();
        let (x1, y1) = trainer.loader.get_batch(Split::Train, &mut rng).unwrap();

        let (_, first) = trainer.model.forward(&x, Some(&y), &mut rng).unwrap();
        let (_, second) = trainer.model.forward(&x1, Some(&y1), &mut rng).unwrap();
        let expected = (first.unwrap() + second.unwrap()) / 2.0;

        trainer.model.zero_grad();
        let loss = trainer.accumulate_gradients(&mut x, &mut y).unwrap();
        assert!(
            (loss - expected).abs() < 1e-5,
            "accumulated {} expected {}",
            loss,
            expected
        );
    }
}
