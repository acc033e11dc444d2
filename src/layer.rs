//! MoE feed-forward layer with expert weight prefetch.
//!
//! Composes the router, the prefetch engine, and the expert units into a
//! single forward step. Per token, the router picks `top_k` experts; the
//! layer obtains each needed expert's weights through the prefetch engine
//! (resident hit, blocking wait on an in-flight transfer, or synchronous
//! fallback) and blends the expert outputs weighted by the renormalized
//! gate probabilities.
//!
//! Latency hiding requires hints: pass the experts expected for the
//! *next* step as `next_step_hints` so their transfers overlap with the
//! current step's compute. Without hints, the first use of an expert
//! falls back synchronously and only later steps benefit from the
//! transfers scheduled at the end of each forward.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use candle_core::{IndexOp, Tensor};
use candle_nn::VarBuilder;
use serde::Serialize;
use tracing::debug;

use crate::config::MoeConfig;
use crate::error::MoeError;
use crate::expert::{Expert, ExpertId};
use crate::prefetch::{PrefetchEngine, PrefetchStats};
use crate::router::Router;

/// Per-forward stats record returned alongside the output.
#[derive(Debug, Clone)]
pub struct ForwardStats {
    pub router_time: Duration,
    pub compute_time: Duration,
    pub total_time: Duration,
    pub prefetch_hits: u64,
    pub prefetch_misses: u64,
    /// Selected expert ids, `u32`, shaped like the input's leading
    /// dimensions with a trailing `top_k` axis.
    pub selected_experts: Tensor,
    /// Renormalized gate weights, same shape as `selected_experts`.
    pub routing_weights: Tensor,
    /// Distinct experts used this step, ascending id order.
    pub unique_experts: Vec<ExpertId>,
}

/// Cumulative layer timings, accumulated across forwards.
#[derive(Debug, Clone, Default)]
struct LayerTimings {
    router_time: Duration,
    compute_time: Duration,
    total_forward_time: Duration,
    num_forwards: u64,
}

/// Combined cumulative statistics of the layer and its prefetch engine.
#[derive(Debug, Clone, Serialize)]
pub struct MoeStats {
    pub router_time: Duration,
    pub compute_time: Duration,
    pub total_forward_time: Duration,
    pub num_forwards: u64,
    pub prefetch: PrefetchStats,
}

/// MoE layer with prefetch-overlapped expert execution.
pub struct MoeLayer {
    config: MoeConfig,
    router: Router,
    experts: Vec<Expert>,
    engine: PrefetchEngine,
    timings: Mutex<LayerTimings>,
}

impl MoeLayer {
    pub fn new(config: MoeConfig, vb: VarBuilder) -> Result<Self, MoeError> {
        config.validate()?;

        let router = Router::new(
            config.hidden_size,
            config.num_experts,
            config.top_k,
            vb.pp("gate"),
        )?;

        let mut experts = Vec::with_capacity(config.num_experts);
        for i in 0..config.num_experts {
            experts.push(Expert::new(
                config.hidden_size,
                config.intermediate_size,
                vb.pp(format!("experts.{i}")),
            )?);
        }

        let engine = PrefetchEngine::new(config.transfer_delay);

        Ok(Self {
            config,
            router,
            experts,
            engine,
            timings: Mutex::new(LayerTimings::default()),
        })
    }

    pub fn config(&self) -> &MoeConfig {
        &self.config
    }

    pub fn num_experts(&self) -> usize {
        self.config.num_experts
    }

    pub fn top_k(&self) -> usize {
        self.config.top_k
    }

    /// Direct access to the prefetch engine (e.g. for `clear` or
    /// standalone scheduling experiments).
    pub fn prefetcher(&self) -> &PrefetchEngine {
        &self.engine
    }

    /// Start the background transfer worker. No-op when prefetch is
    /// disabled or the worker is already running.
    pub fn start(&mut self) {
        if self.config.enable_prefetch {
            self.engine.start();
        }
    }

    /// Stop the background worker. Idempotent; safe before `start`.
    /// May return the non-fatal [`MoeError::JoinTimeout`].
    pub fn stop(&mut self) -> Result<(), MoeError> {
        self.engine.stop()
    }

    /// Schedule transfers for the given experts (fire-and-forget).
    ///
    /// No-op when prefetch is disabled. Experts already resident or
    /// pending are skipped. Errors with [`MoeError::InvalidExpertId`] on
    /// an out-of-range id and [`MoeError::EngineNotRunning`] when
    /// prefetch is enabled but the worker was never started.
    pub fn prefetch_experts(&self, expert_ids: &[ExpertId]) -> Result<(), MoeError> {
        for &id in expert_ids {
            if id >= self.config.num_experts {
                return Err(MoeError::InvalidExpertId {
                    id,
                    num_experts: self.config.num_experts,
                });
            }
        }
        if !self.config.enable_prefetch {
            return Ok(());
        }
        for &id in expert_ids {
            if self.engine.is_resident(id)? || self.engine.is_pending(id)? {
                continue;
            }
            self.engine.schedule(id, self.experts[id].weights())?;
        }
        Ok(())
    }

    /// One MoE forward step.
    ///
    /// `hidden_states` is `[tokens, hidden]` or `[batch, seq, hidden]`;
    /// the output has the same shape. `next_step_hints` names the experts
    /// expected for the next step; their transfers are scheduled up front
    /// and overlap with this step's compute.
    ///
    /// The current step's experts are scheduled only after the weight
    /// lookups, so a first use without a hint falls back synchronously
    /// rather than blocking on its own just-scheduled transfer. Repeated
    /// invocation patterns hit on later calls.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        next_step_hints: Option<&[ExpertId]>,
    ) -> Result<(Tensor, ForwardStats), MoeError> {
        let forward_start = Instant::now();
        let hidden_size = self.config.hidden_size;
        let top_k = self.config.top_k;

        let dims = hidden_states.dims().to_vec();
        let (num_tokens, batch_seq) = match *dims {
            [tokens, hidden] if hidden == hidden_size => (tokens, None),
            [batch, seq, hidden] if hidden == hidden_size => (batch * seq, Some((batch, seq))),
            _ => {
                return Err(MoeError::ShapeMismatch {
                    expected: format!("[tokens, {hidden_size}] or [batch, seq, {hidden_size}]"),
                    found: format!("{dims:?}"),
                })
            }
        };
        let flat = hidden_states.reshape((num_tokens, hidden_size))?;

        let router_start = Instant::now();
        let (routing_weights, selected_experts) = self.router.route(&flat)?;
        let router_time = router_start.elapsed();

        let ids_vec: Vec<u32> = selected_experts.flatten_all()?.to_vec1()?;
        let weights_vec: Vec<f32> = routing_weights.flatten_all()?.to_vec1()?;

        // Group (token, gate weight) pairs per expert.
        let mut expert_tokens: Vec<Vec<(usize, f32)>> =
            vec![Vec::new(); self.config.num_experts];
        for token_idx in 0..num_tokens {
            for k in 0..top_k {
                let flat_idx = token_idx * top_k + k;
                expert_tokens[ids_vec[flat_idx] as usize]
                    .push((token_idx, weights_vec[flat_idx]));
            }
        }
        let unique_experts: Vec<ExpertId> = expert_tokens
            .iter()
            .enumerate()
            .filter(|(_, tokens)| !tokens.is_empty())
            .map(|(id, _)| id)
            .collect();

        // Overlap mechanism: the next step's weights transfer in the
        // background while this step computes.
        if let Some(hints) = next_step_hints {
            self.prefetch_experts(hints)?;
        }

        let compute_start = Instant::now();
        let device = hidden_states.device();
        let dtype = hidden_states.dtype();
        let mut output = Tensor::zeros((num_tokens, hidden_size), dtype, device)?;
        let mut prefetch_hits = 0u64;
        let mut prefetch_misses = 0u64;

        for &expert_id in &unique_experts {
            let (weights, was_hit) = self
                .engine
                .get(expert_id, || self.experts[expert_id].weights())?;
            if was_hit {
                prefetch_hits += 1;
            } else {
                prefetch_misses += 1;
            }

            let tokens = &expert_tokens[expert_id];
            let batch_size = tokens.len();

            let mut input_rows = Vec::with_capacity(batch_size);
            for &(token_idx, _) in tokens {
                input_rows.push(flat.i(token_idx)?.unsqueeze(0)?);
            }
            let batch_input = Tensor::cat(&input_rows, 0)?;

            let expert_output = weights.forward(&batch_input)?;

            let gate_weights: Vec<f32> = tokens.iter().map(|&(_, w)| w).collect();
            let gate_weights =
                Tensor::from_vec(gate_weights, (batch_size, 1), device)?.to_dtype(dtype)?;
            let weighted = expert_output.broadcast_mul(&gate_weights)?;

            let indices: Vec<u32> = tokens.iter().map(|&(idx, _)| idx as u32).collect();
            let indices = Tensor::from_vec(indices, batch_size, device)?;
            output = output.index_add(&indices, &weighted, 0)?;
        }
        let compute_time = compute_start.elapsed();

        // Schedule this step's experts so repeated invocation patterns
        // hit on later calls.
        self.prefetch_experts(&unique_experts)?;

        let output = output.reshape(dims)?;
        let (selected_experts, routing_weights) = match batch_seq {
            Some((batch, seq)) => (
                selected_experts.reshape((batch, seq, top_k))?,
                routing_weights.reshape((batch, seq, top_k))?,
            ),
            None => (selected_experts, routing_weights),
        };

        let total_time = forward_start.elapsed();
        {
            let mut timings = self.timings.lock().map_err(|_| MoeError::LockPoisoned)?;
            timings.router_time += router_time;
            timings.compute_time += compute_time;
            timings.total_forward_time += total_time;
            timings.num_forwards += 1;
        }

        debug!(
            num_tokens,
            hits = prefetch_hits,
            misses = prefetch_misses,
            "moe forward complete"
        );

        Ok((
            output,
            ForwardStats {
                router_time,
                compute_time,
                total_time,
                prefetch_hits,
                prefetch_misses,
                selected_experts,
                routing_weights,
                unique_experts,
            },
        ))
    }

    /// Snapshot of the cumulative layer and prefetch statistics.
    pub fn stats(&self) -> Result<MoeStats, MoeError> {
        let timings = self.timings.lock().map_err(|_| MoeError::LockPoisoned)?;
        Ok(MoeStats {
            router_time: timings.router_time,
            compute_time: timings.compute_time,
            total_forward_time: timings.total_forward_time,
            num_forwards: timings.num_forwards,
            prefetch: self.engine.stats()?,
        })
    }

    /// Zero all cumulative statistics.
    pub fn reset_stats(&self) -> Result<(), MoeError> {
        {
            let mut timings = self.timings.lock().map_err(|_| MoeError::LockPoisoned)?;
            *timings = LayerTimings::default();
        }
        self.engine.reset_stats()
    }
}
