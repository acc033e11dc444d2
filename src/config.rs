use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MoeError;

/// Configuration for a prefetching MoE layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoeConfig {
    /// Hidden size of token vectors.
    pub hidden_size: usize,
    /// Intermediate (FFN) size of each expert.
    pub intermediate_size: usize,
    /// Number of experts.
    pub num_experts: usize,
    /// Number of experts each token is routed to.
    pub top_k: usize,
    /// Whether expert weights are prefetched by the background worker.
    /// When disabled, every weight access is a synchronous fallback.
    #[serde(default = "default_enable_prefetch")]
    pub enable_prefetch: bool,
    /// Simulated duration of one expert weight transfer.
    #[serde(default = "default_transfer_delay")]
    pub transfer_delay: Duration,
}

fn default_enable_prefetch() -> bool {
    true
}

fn default_transfer_delay() -> Duration {
    Duration::from_millis(1)
}

impl Default for MoeConfig {
    fn default() -> Self {
        Self {
            hidden_size: 256,
            intermediate_size: 512,
            num_experts: 8,
            top_k: 2,
            enable_prefetch: default_enable_prefetch(),
            transfer_delay: default_transfer_delay(),
        }
    }
}

impl MoeConfig {
    /// Check constructor invariants. Dimensions must be non-zero and
    /// `top_k` cannot exceed `num_experts`.
    pub fn validate(&self) -> Result<(), MoeError> {
        if self.hidden_size == 0 {
            return Err(MoeError::InvalidConfig("hidden_size must be > 0".into()));
        }
        if self.intermediate_size == 0 {
            return Err(MoeError::InvalidConfig(
                "intermediate_size must be > 0".into(),
            ));
        }
        if self.num_experts == 0 {
            return Err(MoeError::InvalidConfig("num_experts must be > 0".into()));
        }
        if self.top_k == 0 {
            return Err(MoeError::InvalidConfig("top_k must be > 0".into()));
        }
        if self.top_k > self.num_experts {
            return Err(MoeError::InvalidConfig(format!(
                "top_k ({}) exceeds num_experts ({})",
                self.top_k, self.num_experts
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = MoeConfig::default();
        cfg.validate().unwrap();
        assert!(cfg.enable_prefetch);
        assert_eq!(cfg.transfer_delay, Duration::from_millis(1));
    }

    #[test]
    fn top_k_cannot_exceed_num_experts() {
        let cfg = MoeConfig {
            num_experts: 2,
            top_k: 3,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, MoeError::InvalidConfig(_)));
    }

    #[test]
    fn zero_dimensions_rejected() {
        for cfg in [
            MoeConfig {
                hidden_size: 0,
                ..Default::default()
            },
            MoeConfig {
                intermediate_size: 0,
                ..Default::default()
            },
            MoeConfig {
                num_experts: 0,
                ..Default::default()
            },
            MoeConfig {
                top_k: 0,
                ..Default::default()
            },
        ] {
            assert!(cfg.validate().is_err());
        }
    }

    #[test]
    fn deserialize_from_json_with_defaults() {
        let json = r#"{
            "hidden_size": 64,
            "intermediate_size": 128,
            "num_experts": 4,
            "top_k": 2
        }"#;
        let cfg: MoeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.hidden_size, 64);
        assert_eq!(cfg.num_experts, 4);
        // Omitted fields fall back to defaults.
        assert!(cfg.enable_prefetch);
        assert_eq!(cfg.transfer_delay, Duration::from_millis(1));
        cfg.validate().unwrap();
    }

    #[test]
    fn serde_round_trip() {
        let cfg = MoeConfig {
            hidden_size: 32,
            intermediate_size: 64,
            num_experts: 4,
            top_k: 2,
            enable_prefetch: false,
            transfer_delay: Duration::from_millis(5),
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: MoeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hidden_size, cfg.hidden_size);
        assert_eq!(back.transfer_delay, cfg.transfer_delay);
        assert!(!back.enable_prefetch);
    }
}
