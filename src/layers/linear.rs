//! Linear Layer (Fully Connected)
//!
//! Performs an affine transformation: y = x @ W + b
//!
//! ## Forward Pass
//!
//! ```text
//! Input:  x [..., in_features]
//! Weight: W [in_features, out_features]
//! Bias:   b [out_features]            (optional)
//! Output: y = x @ W + b [..., out_features]
//! ```
//!
//! Leading dimensions are flattened into rows, so the same layer serves
//! `[seq, in]` and `[batch, seq, in]` inputs.
//!
//! ## Backward Pass
//!
//! ```text
//! grad_W = x^T @ grad_y
//! grad_b = sum(grad_y, axis=0)
//! grad_x = grad_y @ W^T
//! ```
//!
//! Parameter gradients are accumulated into the layer's [`Parameter`]
//! buffers; the input gradient is returned.

use crate::parameter::{Module, Parameter};
use crate::tensor::Tensor;
use rand::Rng;

/// GPT-2 initialization standard deviation for weight matrices
pub const INIT_STD: f32 = 0.02;

/// Linear layer (fully connected)
pub struct Linear {
    pub weight: Parameter,
    pub bias: Option<Parameter>,
    /// Standard deviation used by `initialize_weights`
    pub init_std: f32,
}

impl Linear {
    /// Create a new linear layer
    ///
    /// Weights start at zero; call [`Module::initialize_weights`] to draw
    /// them from N(0, init_std²).
    ///
    /// # Arguments
    ///
    /// * `name` - Parameter name prefix (e.g. `h.0.attn.c_attn`)
    /// * `in_features` - Input dimension
    /// * `out_features` - Output dimension
    /// * `bias` - Whether to allocate a bias vector
    pub fn new(name: &str, in_features: usize, out_features: usize, bias: bool) -> Self {
        Self {
            weight: Parameter::new(
                format!("{}.weight", name),
                Tensor::zeros(vec![in_features, out_features]),
            ),
            bias: bias.then(|| {
                Parameter::new(format!("{}.bias", name), Tensor::zeros(vec![out_features]))
            }),
            init_std: INIT_STD,
        }
    }

    /// Override the initialization standard deviation
    ///
    /// Residual projections use a depth-scaled value.
    pub fn with_init_std(mut self, std: f32) -> Self {
        self.init_std = std;
        self
    }

    pub fn in_features(&self) -> usize {
        self.weight.value.shape[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.value.shape[1]
    }

    /// Forward pass
    ///
    /// # Returns
    ///
    /// Tuple of (output, cache) where output has shape `[..., out_features]`
    pub fn forward(&self, x: &Tensor) -> (Tensor, LinearCache) {
        let in_features = self.in_features();
        let rows = x.numel() / in_features;
        let x2d = x.reshape(&[rows, in_features]);

        let mut y = x2d.matmul(&self.weight.value);
        if let Some(bias) = &self.bias {
            y = y.add(&bias.value);
        }

        let mut out_shape = x.shape.clone();
        if let Some(last) = out_shape.last_mut() {
            *last = self.out_features();
        }

        let cache = LinearCache {
            x: x2d,
            input_shape: x.shape.clone(),
        };
        (y.into_shape(&out_shape), cache)
    }

    /// Backward pass
    ///
    /// Accumulates weight and bias gradients and returns the gradient with
    /// respect to the input (same shape as the forward input).
    pub fn backward(&mut self, grad_out: &Tensor, cache: LinearCache) -> Tensor {
        let out_features = self.out_features();
        let rows = grad_out.numel() / out_features;
        let grad2d = grad_out.reshape(&[rows, out_features]);

        // grad_W = x^T @ grad_out
        let grad_weight = cache.x.transpose(0, 1).matmul(&grad2d);
        self.weight.accumulate_grad(&grad_weight);

        // grad_b = column sums of grad_out
        if let Some(bias) = &mut self.bias {
            let mut grad_bias = vec![0.0; out_features];
            for row in grad2d.data.chunks(out_features) {
                for (g, &v) in grad_bias.iter_mut().zip(row) {
                    *g += v;
                }
            }
            bias.accumulate_grad(&Tensor::new(grad_bias, vec![out_features]));
        }

        // grad_x = grad_out @ W^T
        grad2d
            .matmul_transposed(&self.weight.value)
            .into_shape(&cache.input_shape)
    }
}

impl Module for Linear {
    fn parameters(&self) -> Vec<&Parameter> {
        std::iter::once(&self.weight).chain(self.bias.as_ref()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        std::iter::once(&mut self.weight)
            .chain(self.bias.as_mut())
            .collect()
    }

    fn initialize_weights<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let shape = self.weight.value.shape.clone();
        self.weight.set_value(Tensor::randn(shape, self.init_std, rng));
        if let Some(bias) = &mut self.bias {
            let shape = bias.value.shape.clone();
            bias.set_value(Tensor::zeros(shape));
        }
    }
}

/// Cache for linear layer backward pass
pub struct LinearCache {
    /// Input flattened to `[rows, in_features]`
    pub x: Tensor,
    pub input_shape: Vec<usize>,
}
