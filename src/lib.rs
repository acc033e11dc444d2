//! Simulation harness for latency-hiding expert weight prefetch in
//! mixture-of-experts (MoE) feed-forward layers.
//!
//! A MoE layer activates only a few experts per token, so expert weights
//! can be fetched into fast memory ahead of need while other experts are
//! still computing. This crate models that pipeline in-process: a
//! background worker simulates weight transfers, a single-consumer cache
//! holds completed transfers, and the layer's forward pass measures how
//! much transfer latency was hidden behind useful work (hits, misses,
//! blocked time, overlap efficiency).
//!
//! ```no_run
//! use candle_core::{DType, Device, Tensor};
//! use candle_nn::VarBuilder;
//! use moe_prefetch::config::MoeConfig;
//! use moe_prefetch::layer::MoeLayer;
//!
//! # fn main() -> Result<(), moe_prefetch::error::MoeError> {
//! let device = Device::Cpu;
//! let vb = VarBuilder::zeros(DType::F32, &device);
//! let mut layer = MoeLayer::new(MoeConfig::default(), vb)?;
//! layer.start();
//!
//! let x = Tensor::zeros((2, 8, 256), DType::F32, &device)?;
//! // Hint the next step's experts so their transfers overlap compute.
//! let (out, stats) = layer.forward(&x, Some(&[0, 1]))?;
//! assert_eq!(out.dims(), x.dims());
//! println!("hits: {}, misses: {}", stats.prefetch_hits, stats.prefetch_misses);
//!
//! layer.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod expert;
pub mod layer;
pub mod ops;
pub mod prefetch;
pub mod router;
