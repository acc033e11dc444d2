//! Top-K router with softmax gating.
//!
//! Routes each token to the `top_k` experts with the highest gating
//! probability and renormalizes the selected probabilities to sum to 1.
//! Selection is deterministic: ties resolve to the lower expert index
//! (stable descending sort), so runs with identical weights and inputs
//! reproduce identical routing.

use candle_core::{DType, Tensor, D};
use candle_nn::{linear_no_bias, Linear, Module, VarBuilder};

use crate::error::MoeError;
use crate::expert::ExpertId;

pub struct Router {
    gate: Linear,
    num_experts: usize,
    top_k: usize,
}

impl Router {
    pub fn new(
        hidden_size: usize,
        num_experts: usize,
        top_k: usize,
        vb: VarBuilder,
    ) -> Result<Self, MoeError> {
        if top_k == 0 || top_k > num_experts {
            return Err(MoeError::InvalidConfig(format!(
                "top_k ({top_k}) must be in [1, {num_experts}]"
            )));
        }
        let gate = linear_no_bias(hidden_size, num_experts, vb)?;
        Ok(Self {
            gate,
            num_experts,
            top_k,
        })
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Route a `[num_tokens, hidden_size]` batch.
    ///
    /// Returns `(routing_weights, selected_experts)`, both shaped
    /// `[num_tokens, top_k]`. Weights are renormalized to sum to 1 per
    /// token; expert indices are `u32`.
    pub fn route(&self, hidden_states: &Tensor) -> Result<(Tensor, Tensor), MoeError> {
        let logits = self.gate.forward(hidden_states)?;
        // Stable softmax (per-row max subtraction happens inside candle).
        let probs = candle_nn::ops::softmax(&logits, D::Minus1)?;
        let rows: Vec<Vec<f32>> = probs.to_dtype(DType::F32)?.to_vec2()?;

        let num_tokens = rows.len();
        let mut weights = Vec::with_capacity(num_tokens * self.top_k);
        let mut indices = Vec::with_capacity(num_tokens * self.top_k);

        for row in &rows {
            let top = top_k_indices(row, self.top_k);
            let sum: f32 = top.iter().map(|&i| row[i]).sum();
            for &i in &top {
                indices.push(i as u32);
                weights.push(row[i] / sum);
            }
        }

        let device = hidden_states.device();
        let weights = Tensor::from_vec(weights, (num_tokens, self.top_k), device)?;
        let indices = Tensor::from_vec(indices, (num_tokens, self.top_k), device)?;
        Ok((weights, indices))
    }
}

/// Indices of the `k` largest values in `row`, highest first.
///
/// The sort is stable, so equal values keep ascending index order and the
/// lower expert index wins a tie.
fn top_k_indices(row: &[f32], k: usize) -> Vec<ExpertId> {
    let mut order: Vec<ExpertId> = (0..row.len()).collect();
    order.sort_by(|&a, &b| row[b].total_cmp(&row[a]));
    order.truncate(k);
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn top_k_indices_picks_largest() {
        let row = [0.1f32, 0.4, 0.2, 0.3];
        assert_eq!(top_k_indices(&row, 2), vec![1, 3]);
    }

    #[test]
    fn top_k_indices_tie_break_prefers_lower_index() {
        let row = [0.25f32, 0.25, 0.25, 0.25];
        assert_eq!(top_k_indices(&row, 2), vec![0, 1]);

        let row = [0.1f32, 0.3, 0.3, 0.3];
        assert_eq!(top_k_indices(&row, 2), vec![1, 2]);
    }

    #[test]
    fn top_k_equal_to_len_returns_all() {
        let row = [0.2f32, 0.5, 0.3];
        assert_eq!(top_k_indices(&row, 3), vec![1, 2, 0]);
    }

    #[test]
    fn route_output_dims_and_range() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let router = Router::new(16, 4, 2, vb).unwrap();

        assert_eq!(router.num_experts(), 4);
        assert_eq!(router.top_k(), 2);

        let hidden = Tensor::randn(0f32, 1.0, (5, 16), &device).unwrap();
        let (weights, indices) = router.route(&hidden).unwrap();

        assert_eq!(weights.dims(), &[5, 2]);
        assert_eq!(indices.dims(), &[5, 2]);

        let ids: Vec<u32> = indices.flatten_all().unwrap().to_vec1().unwrap();
        assert!(ids.iter().all(|&id| (id as usize) < 4));
    }

    #[test]
    fn route_weights_sum_to_one() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let router = Router::new(16, 4, 2, vb).unwrap();

        let hidden = Tensor::randn(0f32, 1.0, (3, 16), &device).unwrap();
        let (weights, _) = router.route(&hidden).unwrap();
        let sums: Vec<f32> = weights
            .sum_keepdim(1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn zero_weights_route_to_lowest_indices() {
        // Zeroed gate -> uniform distribution -> deterministic tie-break.
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let router = Router::new(16, 4, 2, vb).unwrap();

        let hidden = Tensor::randn(0f32, 1.0, (3, 16), &device).unwrap();
        let (weights, indices) = router.route(&hidden).unwrap();

        let ids: Vec<u32> = indices.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(ids, vec![0, 1, 0, 1, 0, 1]);

        let wts: Vec<f32> = weights.flatten_all().unwrap().to_vec1().unwrap();
        for w in wts {
            assert!((w - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn route_is_deterministic() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let router = Router::new(8, 4, 2, vb).unwrap();

        let hidden = Tensor::randn(0f32, 1.0, (4, 8), &device).unwrap();
        let (w1, i1) = router.route(&hidden).unwrap();
        let (w2, i2) = router.route(&hidden).unwrap();

        let w1: Vec<f32> = w1.flatten_all().unwrap().to_vec1().unwrap();
        let w2: Vec<f32> = w2.flatten_all().unwrap().to_vec1().unwrap();
        let i1: Vec<u32> = i1.flatten_all().unwrap().to_vec1().unwrap();
        let i2: Vec<u32> = i2.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(w1, w2);
        assert_eq!(i1, i2);
    }

    #[test]
    fn invalid_top_k_rejected() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        assert!(Router::new(16, 4, 5, vb.clone()).is_err());
        assert!(Router::new(16, 4, 0, vb).is_err());
    }
}
