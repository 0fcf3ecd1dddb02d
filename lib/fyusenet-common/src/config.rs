use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the execution engine, loaded up front and passed down as plain data.
///
/// The engine never reads environment variables or files itself; an embedding application is
/// expected to build this (directly, via `Default`, or by deserializing it) and hand it to
/// `Engine::new`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bound on a GPU fence client-wait before `PipelineTimeout` is raised.
    pub fence_timeout: Duration,
    /// Bound on `finish()`'s poll loop before `FinishTimeout` is raised.
    pub finish_timeout: Duration,
    /// Sleep interval between polls inside `finish()`.
    pub finish_poll_interval: Duration,
    /// How many sequences may be admitted ahead of the last fully-retired `engineSequence`
    /// before `forward` blocks the caller. The spec's engine allows at most two in flight.
    pub sequence_lookahead: u64,
    /// Whether per-layer wall-clock timings are recorded during `execute`.
    pub timings_enabled: bool,
    /// Whether each layer's `write_result` debug hook fires after it executes.
    pub intermediate_output_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fence_timeout: Duration::from_secs(5),
            finish_timeout: Duration::from_secs(5),
            finish_poll_interval: Duration::from_millis(10),
            sequence_lookahead: 2,
            timings_enabled: false,
            intermediate_output_enabled: false,
        }
    }
}

impl EngineConfig {
    /// Parse a config from JSON, falling back to defaults for any field left unspecified.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.fence_timeout, Duration::from_secs(5));
        assert_eq!(cfg.finish_timeout, Duration::from_secs(5));
        assert_eq!(cfg.sequence_lookahead, 2);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let cfg = EngineConfig::from_json(r#"{"timings_enabled": true}"#).unwrap();
        assert!(cfg.timings_enabled);
        assert_eq!(cfg.fence_timeout, Duration::from_secs(5));
    }
}
