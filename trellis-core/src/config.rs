//! Runtime configuration.

use serde::{Deserialize, Serialize};

/// Tunables for a [`Runtime`](crate::reactive::Runtime).
///
/// Hosts usually embed this in their own configuration file; missing fields
/// fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound on scheduling passes in a single flush. Effects that keep
    /// writing signals other effects depend on would otherwise loop forever.
    pub max_flush_passes: usize,
}

impl RuntimeConfig {
    pub const DEFAULT_MAX_FLUSH_PASSES: usize = 100;

    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of passes per flush. Clamped to at least one.
    pub fn max_flush_passes(mut self, passes: usize) -> Self {
        self.max_flush_passes = passes.max(1);
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_flush_passes: Self::DEFAULT_MAX_FLUSH_PASSES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_clamps_passes() {
        assert_eq!(RuntimeConfig::new().max_flush_passes(0).max_flush_passes, 1);
        assert_eq!(RuntimeConfig::new().max_flush_passes(7).max_flush_passes, 7);
    }

    #[test]
    fn missing_fields_use_defaults() {
        let config: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());

        let config: RuntimeConfig = serde_json::from_str(r#"{"max_flush_passes": 3}"#).unwrap();
        assert_eq!(config.max_flush_passes, 3);
    }
}
