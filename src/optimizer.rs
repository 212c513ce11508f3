//! AdamW Optimizer
//!
//! Adam with decoupled weight decay. For each parameter θ with gradient g:
//!
//! ```text
//! θ = θ * (1 - lr * λ)                 # decoupled weight decay
//! m = β₁ * m + (1 - β₁) * g
//! v = β₂ * v + (1 - β₂) * g²
//! m_hat = m / (1 - β₁^t)
//! v_hat = v / (1 - β₂^t)
//! θ = θ - lr * m_hat / (√v_hat + ε)
//! ```
//!
//! ## Parameter Groups
//!
//! Parameters are partitioned into groups that each carry their own learning
//! rate and weight decay. The model puts every matrix (embeddings and linear
//! weights) in a decayed group and every vector (biases, layer norm
//! parameters) in an undecayed one. The learning-rate schedule rewrites
//! `lr` on every group once per iteration.
//!
//! Moment buffers are indexed by position in the model's parameter list, so
//! `step` must always be called with parameters in that same order.

use crate::error::{GptError, Result};
use crate::parameter::Parameter;
use rayon::prelude::*;
use tracing::debug;

/// Parameters sharing one learning rate and weight decay
#[derive(Clone, Debug, PartialEq)]
pub struct ParamGroup {
    pub name: String,
    /// Positions in the model's parameter list
    pub param_indices: Vec<usize>,
    pub lr: f32,
    pub weight_decay: f32,
}

/// A first-order optimizer over grouped parameters
pub trait Optimizer {
    fn param_groups(&self) -> &[ParamGroup];

    fn param_groups_mut(&mut self) -> &mut [ParamGroup];

    /// Apply one update using the gradients currently held in `params`
    fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()>;

    /// Set the learning rate of every group
    fn set_lr(&mut self, lr: f32) {
        for group in self.param_groups_mut() {
            group.lr = lr;
        }
    }
}

/// AdamW optimizer state
pub struct AdamW {
    groups: Vec<ParamGroup>,
    /// First moment per parameter
    m: Vec<Vec<f32>>,
    /// Second moment per parameter
    v: Vec<Vec<f32>>,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    /// Completed updates, for bias correction
    pub step: usize,
}

impl AdamW {
    /// Create an optimizer with zeroed moments
    ///
    /// `sizes[i]` is the element count of parameter `i`.
    ///
    /// # Errors
    ///
    /// `Configuration` if a group references a missing parameter or two groups
    /// claim the same one.
    pub fn new(groups: Vec<ParamGroup>, sizes: &[usize], betas: (f32, f32)) -> Result<Self> {
        let mut owner = vec![None; sizes.len()];
        for group in &groups {
            for &idx in &group.param_indices {
                let slot = owner.get_mut(idx).ok_or_else(|| {
                    GptError::Configuration(format!(
                        "group '{}' references parameter {} of {}",
                        group.name,
                        idx,
                        sizes.len()
                    ))
                })?;
                if let Some(other) = slot.replace(group.name.clone()) {
                    return Err(GptError::Configuration(format!(
                        "parameter {} is in both '{}' and '{}'",
                        idx, other, group.name
                    )));
                }
            }
        }

        Ok(Self {
            groups,
            m: sizes.iter().map(|&n| vec![0.0; n]).collect(),
            v: sizes.iter().map(|&n| vec![0.0; n]).collect(),
            beta1: betas.0,
            beta2: betas.1,
            epsilon: 1e-8,
            step: 0,
        })
    }
}

impl Optimizer for AdamW {
    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()> {
        if params.len() != self.m.len() {
            return Err(GptError::Validation(format!(
                "optimizer tracks {} parameters, got {}",
                self.m.len(),
                params.len()
            )));
        }

        self.step += 1;
        let t = self.step as i32;
        let (beta1, beta2, eps) = (self.beta1, self.beta2, self.epsilon);
        let bias_correction1 = 1.0 - beta1.powi(t);
        let bias_correction2 = 1.0 - beta2.powi(t);

        for group in &self.groups {
            let lr = group.lr;
            let decay = 1.0 - lr * group.weight_decay;

            for &idx in &group.param_indices {
                let param = &mut *params[idx];
                let m = &mut self.m[idx];
                let v = &mut self.v[idx];
                if m.len() != param.numel() {
                    return Err(GptError::Validation(format!(
                        "optimizer state for {} has {} elements, parameter has {}",
                        param.name,
                        m.len(),
                        param.numel()
                    )));
                }

                let update = |((theta, &g), (m, v)): ((&mut f32, &f32), (&mut f32, &mut f32))| {
                    *theta *= decay;
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / bias_correction1;
                    let v_hat = *v / bias_correction2;
                    *theta -= lr * m_hat / (v_hat.sqrt() + eps);
                };

                if param.numel() > 1000 {
                    param
                        .value
                        .data
                        .par_iter_mut()
                        .zip(param.grad.data.par_iter())
                        .zip(m.par_iter_mut().zip(v.par_iter_mut()))
                        .for_each(update);
                } else {
                    param
                        .value
                        .data
                        .iter_mut()
                        .zip(param.grad.data.iter())
                        .zip(m.iter_mut().zip(v.iter_mut()))
                        .for_each(update);
                }
            }
        }

        debug!(step = self.step, "adamw step");
        Ok(())
    }
}
