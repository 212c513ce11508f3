//! Neural Network Layers
//!
//! Every layer follows the same pattern:
//!
//! ```rust,ignore
//! impl Layer {
//!     pub fn forward(&self, x: &Tensor, ...) -> (Tensor, Cache) { }
//!     pub fn backward(&mut self, grad: &Tensor, cache: Cache) -> Tensor { }
//! }
//! ```
//!
//! `forward` returns the output plus whatever the backward pass needs.
//! `backward` consumes that cache, accumulates parameter gradients into the
//! layer's own [`Parameter`](crate::parameter::Parameter) buffers, and
//! returns the gradient with respect to the input. Layers with weights
//! implement [`Module`](crate::parameter::Module).

pub mod activation;
pub mod attention;
pub mod block;
pub mod dropout;
pub mod layer_norm;
pub mod linear;
pub mod mlp;

pub use activation::{gelu_backward, gelu_forward};
pub use attention::{AttentionCache, CausalSelfAttention};
pub use block::{Block, BlockCache};
pub use dropout::{Dropout, DropoutCache};
pub use layer_norm::{LayerNorm, LayerNormCache};
pub use linear::{Linear, LinearCache, INIT_STD};
pub use mlp::{Mlp, MlpCache};
