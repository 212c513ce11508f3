//! Trainable Parameters
//!
//! Every learnable tensor in the model is a [`Parameter`]: a named value plus
//! a gradient buffer of the same shape. Backward passes *accumulate* into the
//! gradient buffer, which is what makes gradient accumulation across
//! micro-batches work: zero once, run several forward/backward passes, then
//! step the optimizer.
//!
//! Layers expose their parameters through the [`Module`] trait. The model,
//! the optimizer, gradient clipping and checkpointing all walk parameters
//! through this one interface instead of naming each field by hand.

use crate::tensor::Tensor;
use rand::Rng;

/// A named, shaped, trainable tensor with its gradient
#[derive(Clone, Debug)]
pub struct Parameter {
    /// Hierarchical name, e.g. `h.0.attn.c_attn.weight`
    pub name: String,
    /// Current value
    pub value: Tensor,
    /// Accumulated gradient (same shape as `value`)
    pub grad: Tensor,
}

impl Parameter {
    /// Wrap a tensor as a parameter with a zeroed gradient
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        let grad = Tensor::zeros(value.shape.clone());
        Self {
            name: name.into(),
            value,
            grad,
        }
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.value.numel()
    }

    /// Number of dimensions (2 for weight matrices, 1 for biases and norms)
    pub fn ndim(&self) -> usize {
        self.value.ndim()
    }

    /// Reset the gradient buffer to zero
    pub fn zero_grad(&mut self) {
        self.grad.data.iter_mut().for_each(|g| *g = 0.0);
    }

    /// Add `grad` into the gradient buffer
    pub fn accumulate_grad(&mut self, grad: &Tensor) {
        self.grad.add_assign(grad);
    }

    /// Replace the value, resetting the gradient to the new shape
    pub fn set_value(&mut self, value: Tensor) {
        self.grad = Tensor::zeros(value.shape.clone());
        self.value = value;
    }
}

/// A layer that owns trainable parameters
///
/// `initialize_weights` is the per-layer initialization capability: the model
/// calls it on every layer at construction instead of dispatching on layer
/// type, so a new layer kind only needs to implement this trait.
pub trait Module {
    /// All parameters in a stable order
    fn parameters(&self) -> Vec<&Parameter>;

    /// Mutable access to all parameters, same order as [`Module::parameters`]
    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    /// (Re)initialize every parameter from `rng`
    fn initialize_weights<R: Rng + ?Sized>(&mut self, rng: &mut R);

    /// Zero every gradient buffer
    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }

    /// Total number of trainable elements
    fn num_elements(&self) -> usize {
        self.parameters().iter().map(|p| p.numel()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate_and_zero_grad() {
        let mut p = Parameter::new("w", Tensor::zeros(vec![2, 2]));
        let g = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);

        p.accumulate_grad(&g);
        p.accumulate_grad(&g);
        assert_eq!(p.grad.data, vec![2.0, 4.0, 6.0, 8.0]);

        p.zero_grad();
        assert!(p.grad.data.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_set_value_resets_grad_shape() {
        let mut p = Parameter::new("wpe", Tensor::zeros(vec![8, 4]));
        p.set_value(Tensor::zeros(vec![4, 4]));
        assert_eq!(p.grad.shape, vec![4, 4]);
        assert_eq!(p.ndim(), 2);
        assert_eq!(p.numel(), 16);
    }
}
