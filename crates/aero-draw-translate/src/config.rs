use std::time::Duration;

use crate::device_loss::ResetPolicy;

/// Default size of the vertex streaming buffer. Grows on demand.
pub const DEFAULT_VERTEX_STREAM_SIZE: u64 = 1024 * 1024;
/// Default size of each index streaming buffer (one per native index format).
pub const DEFAULT_INDEX_STREAM_SIZE: u64 = 16 * 1024;
/// Per-attribute buffer used for current (constant) attribute values.
pub const DEFAULT_CURRENT_VALUE_STREAM_SIZE: u64 = 4096;

/// Tuning knobs for the translation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatorConfig {
    pub initial_vertex_stream_size: u64,
    pub initial_index_stream_size: u64,
    pub current_value_stream_size: u64,
    /// A buffer whose unmodified contents have been read more than `factor * size` bytes is
    /// promoted from streaming to a static translation.
    pub static_promotion_factor: u64,
    /// Allow binding buffer storage in place when the backend supports it.
    pub direct_binding: bool,
    /// Compare against the last-applied state before issuing backend state calls. Disabling this
    /// only costs redundant calls; results are identical.
    pub state_diffing: bool,
    pub reset_policy: ResetPolicy,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            initial_vertex_stream_size: DEFAULT_VERTEX_STREAM_SIZE,
            initial_index_stream_size: DEFAULT_INDEX_STREAM_SIZE,
            current_value_stream_size: DEFAULT_CURRENT_VALUE_STREAM_SIZE,
            static_promotion_factor: 3,
            direct_binding: true,
            state_diffing: true,
            reset_policy: ResetPolicy::default(),
        }
    }
}

impl TranslatorConfig {
    /// Default config with environment overrides applied.
    ///
    /// - `AERO_DRAW_DISABLE_DIRECT_BINDING=1` forces every attribute through a copy.
    /// - `AERO_DRAW_DISABLE_STATE_DIFF=1` re-applies every state category on each call.
    /// - `AERO_DRAW_RESET_ATTEMPTS=<n>` overrides the number of device reset attempts.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if env_var_truthy("AERO_DRAW_DISABLE_DIRECT_BINDING") {
            config.direct_binding = false;
        }
        if env_var_truthy("AERO_DRAW_DISABLE_STATE_DIFF") {
            config.state_diffing = false;
        }
        if let Some(attempts) = std::env::var("AERO_DRAW_RESET_ATTEMPTS")
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok())
        {
            config.reset_policy.max_attempts = attempts.max(1);
        }
        config
    }

    /// Config suitable for unit tests: small streams and no sleeping between reset attempts.
    pub fn for_tests() -> Self {
        Self {
            initial_vertex_stream_size: 256,
            initial_index_stream_size: 64,
            current_value_stream_size: 64,
            reset_policy: ResetPolicy {
                retry_delay: Duration::ZERO,
                poll_delay: Duration::ZERO,
                ..ResetPolicy::default()
            },
            ..Self::default()
        }
    }
}

fn env_var_truthy(name: &str) -> bool {
    let Ok(raw) = std::env::var(name) else {
        return false;
    };
    let v = raw.trim();
    v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_all_fast_paths() {
        let config = TranslatorConfig::default();
        assert!(config.direct_binding);
        assert!(config.state_diffing);
        assert_eq!(config.reset_policy.max_attempts, 3);
        assert_eq!(config.initial_vertex_stream_size, DEFAULT_VERTEX_STREAM_SIZE);
    }

    #[test]
    fn test_config_never_sleeps() {
        assert_eq!(
            TranslatorConfig::for_tests().reset_policy.retry_delay,
            Duration::ZERO
        );
    }
}
