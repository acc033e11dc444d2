use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MoeError {
    #[error("shape mismatch: expected {expected}, found {found}")]
    ShapeMismatch { expected: String, found: String },

    #[error("expert id {id} out of range for {num_experts} experts")]
    InvalidExpertId { id: usize, num_experts: usize },

    #[error("prefetch engine is not running")]
    EngineNotRunning,

    #[error("prefetch worker did not exit within {timeout:?}")]
    JoinTimeout { timeout: Duration },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("shared prefetch state lock poisoned")]
    LockPoisoned,

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
