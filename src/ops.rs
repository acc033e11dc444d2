//! Elementwise activation primitives shared by the expert transform.
//!
//! The router's normalized-exponential weighting uses
//! [`candle_nn::ops::softmax`] directly (it subtracts the per-row maximum
//! before exponentiating, so large logits do not overflow).

use candle_core::{Result, Tensor};

/// Gated-linear (SwiGLU) combination: `silu(gate) * up`.
///
/// Both inputs must have identical shapes.
pub fn swiglu(gate: &Tensor, up: &Tensor) -> Result<Tensor> {
    candle_nn::ops::silu(gate)?.mul(up)
}
