//! Training Metrics Log
//!
//! Appends one CSV row per evaluation to `out_dir/training_log.csv` and
//! mirrors it to the tracing log.
//!
//! ## CSV Format
//!
//! ```text
//! iter,elapsed_seconds,learning_rate,train_loss,val_loss,train_perplexity,val_perplexity
//! ```
//!
//! Perplexity is `exp(loss)`: 1.0 for a perfect model, about `vocab_size`
//! for uniform guessing.

use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Instant;
use tracing::info;

/// File name inside `out_dir`
pub const TRAINING_LOG_FILE: &str = "training_log.csv";

const CSV_HEADER: &str =
    "iter,elapsed_seconds,learning_rate,train_loss,val_loss,train_perplexity,val_perplexity";

/// CSV logger for evaluation results
pub struct TrainingLogger {
    log_file: File,
    start_time: Instant,
    last_log_time: Instant,
}

impl TrainingLogger {
    /// Open `log_path` for appending, writing the header if the file is new
    ///
    /// A resumed run keeps appending to the same file.
    pub fn new(log_path: impl AsRef<Path>) -> Result<Self> {
        let log_path = log_path.as_ref();
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        if log_file.metadata()?.len() == 0 {
            writeln!(log_file, "{}", CSV_HEADER)?;
        }

        let now = Instant::now();
        Ok(Self {
            log_file,
            start_time: now,
            last_log_time: now,
        })
    }

    /// Record one evaluation
    pub fn log(
        &mut self,
        iter: usize,
        learning_rate: f32,
        train_loss: f32,
        val_loss: f32,
    ) -> Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f32();
        let train_perplexity = train_loss.exp();
        let val_perplexity = val_loss.exp();

        writeln!(
            self.log_file,
            "{},{:.2},{:.6e},{:.4},{:.4},{:.2},{:.2}",
            iter, elapsed, learning_rate, train_loss, val_loss, train_perplexity, val_perplexity
        )?;
        // flushed per row so a crash keeps everything logged so far
        self.log_file.flush()?;

        let since_last = self.last_log_time.elapsed().as_secs_f32();
        info!(
            "step {}: train loss {:.4}, val loss {:.4}, val ppl {:.2}, lr {:.3e} ({:.1}s, +{:.1}s)",
            iter, train_loss, val_loss, val_perplexity, learning_rate, elapsed, since_last
        );

        self.last_log_time = Instant::now();
        Ok(())
    }
}
