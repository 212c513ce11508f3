//! Learning-Rate Schedule
//!
//! Linear warmup followed by cosine decay to a floor:
//!
//! ```text
//! t < warmup:          lr * (t + 1) / (warmup + 1)
//! t > decay_iters:     min_lr
//! otherwise:           min_lr + 0.5 * (1 + cos(π * ratio)) * (lr - min_lr)
//!                      ratio = (t - warmup) / (decay_iters - warmup)
//! ```

use crate::optimizer::Optimizer;

/// Warmup + cosine decay schedule
#[derive(Clone, Debug, PartialEq)]
pub struct CosineSchedule {
    pub learning_rate: f32,
    pub min_lr: f32,
    pub warmup_iters: usize,
    pub lr_decay_iters: usize,
    /// When false, every iteration uses `learning_rate`
    pub decay_lr: bool,
}

impl CosineSchedule {
    pub fn new(learning_rate: f32, min_lr: f32, warmup_iters: usize, lr_decay_iters: usize) -> Self {
        Self {
            learning_rate,
            min_lr,
            warmup_iters,
            lr_decay_iters,
            decay_lr: true,
        }
    }

    /// Learning rate for iteration `t`
    pub fn get_lr(&self, t: usize) -> f32 {
        if !self.decay_lr {
            return self.learning_rate;
        }

        let lr = self.learning_rate as f64;
        let min_lr = self.min_lr as f64;

        if t < self.warmup_iters {
            return (lr * (t + 1) as f64 / (self.warmup_iters + 1) as f64) as f32;
        }
        if t > self.lr_decay_iters {
            return self.min_lr;
        }
        // warmup == decay_iters leaves no cosine segment
        if self.lr_decay_iters <= self.warmup_iters {
            return self.learning_rate;
        }

        let ratio = (t - self.warmup_iters) as f64 / (self.lr_decay_iters - self.warmup_iters) as f64;
        let coeff = 0.5 * (1.0 + (std::f64::consts::PI * ratio).cos());
        (min_lr + coeff * (lr - min_lr)) as f32
    }

    /// Apply the rate for iteration `t` to every param group; returns it
    pub fn step<O: Optimizer + ?Sized>(&self, optimizer: &mut O, t: usize) -> f32 {
        let lr = self.get_lr(t);
        optimizer.set_lr(lr);
        lr
    }
}
