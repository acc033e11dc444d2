//! A single MoE expert: a SwiGLU feed-forward unit plus a detached,
//! transferable snapshot of its weights.
//!
//! The layer computes through [`ExpertWeights`] rather than [`Expert`]
//! directly, so that weights obtained from the prefetch cache and weights
//! produced by the synchronous fallback go through the same code path.

use candle_core::Tensor;
use candle_nn::{linear_no_bias, Linear, Module, VarBuilder};

use crate::error::MoeError;
use crate::ops::swiglu;

/// Identifier of an expert within a layer, in `[0, num_experts)`.
pub type ExpertId = usize;

/// Expert feed-forward unit with SwiGLU activation.
///
/// Weights are created at construction and read-only afterwards.
pub struct Expert {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
    hidden_size: usize,
}

impl Expert {
    pub fn new(
        hidden_size: usize,
        intermediate_size: usize,
        vb: VarBuilder,
    ) -> Result<Self, MoeError> {
        let gate_proj = linear_no_bias(hidden_size, intermediate_size, vb.pp("gate_proj"))?;
        let up_proj = linear_no_bias(hidden_size, intermediate_size, vb.pp("up_proj"))?;
        let down_proj = linear_no_bias(intermediate_size, hidden_size, vb.pp("down_proj"))?;
        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
            hidden_size,
        })
    }

    /// Forward pass: `down(silu(gate(x)) * up(x))`.
    ///
    /// The input's last dimension must equal the hidden size.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor, MoeError> {
        check_last_dim(xs, self.hidden_size)?;
        let gate = self.gate_proj.forward(xs)?;
        let up = self.up_proj.forward(xs)?;
        let hidden = swiglu(&gate, &up)?;
        Ok(self.down_proj.forward(&hidden)?)
    }

    /// Detached snapshot of the three weight matrices, suitable for
    /// handing to the prefetch engine.
    pub fn weights(&self) -> ExpertWeights {
        ExpertWeights {
            gate_proj: self.gate_proj.weight().clone(),
            up_proj: self.up_proj.weight().clone(),
            down_proj: self.down_proj.weight().clone(),
        }
    }
}

/// The three weight matrices of one expert: gate and up projections of
/// shape `[intermediate, hidden]` and a down projection of shape
/// `[hidden, intermediate]`. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct ExpertWeights {
    gate_proj: Tensor,
    up_proj: Tensor,
    down_proj: Tensor,
}

impl ExpertWeights {
    /// Build a snapshot from raw matrices, validating that the inner
    /// dimensions agree.
    pub fn new(gate_proj: Tensor, up_proj: Tensor, down_proj: Tensor) -> Result<Self, MoeError> {
        let (inter, hidden) = gate_proj.dims2()?;
        let up_dims = up_proj.dims2()?;
        if up_dims != (inter, hidden) {
            return Err(MoeError::ShapeMismatch {
                expected: format!("[{inter}, {hidden}]"),
                found: format!("[{}, {}]", up_dims.0, up_dims.1),
            });
        }
        let down_dims = down_proj.dims2()?;
        if down_dims != (hidden, inter) {
            return Err(MoeError::ShapeMismatch {
                expected: format!("[{hidden}, {inter}]"),
                found: format!("[{}, {}]", down_dims.0, down_dims.1),
            });
        }
        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.gate_proj.dims()[1]
    }

    pub fn intermediate_size(&self) -> usize {
        self.gate_proj.dims()[0]
    }

    /// Compute the expert transform from this snapshot for a
    /// `[tokens, hidden]` batch.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor, MoeError> {
        check_last_dim(xs, self.hidden_size())?;
        let gate = xs.matmul(&self.gate_proj.t()?)?;
        let up = xs.matmul(&self.up_proj.t()?)?;
        let hidden = swiglu(&gate, &up)?;
        Ok(hidden.matmul(&self.down_proj.t()?)?)
    }
}

fn check_last_dim(xs: &Tensor, hidden_size: usize) -> Result<(), MoeError> {
    let dims = xs.dims();
    match dims.last() {
        Some(&last) if last == hidden_size => Ok(()),
        _ => Err(MoeError::ShapeMismatch {
            expected: format!("[.., {hidden_size}]"),
            found: format!("{dims:?}"),
        }),
    }
}
