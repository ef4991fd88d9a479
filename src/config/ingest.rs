//! Ingestion configuration types.

use serde::Deserialize;

/// Command ingestion settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Recognized command types. Empty accepts any non-empty type.
    pub command_types: Vec<String>,
    /// Longest idempotency key accepted.
    pub max_key_length: usize,
    /// Outbox topics are `{topic_prefix}.{command_type}`.
    pub topic_prefix: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            command_types: Vec::new(),
            max_key_length: 255,
            topic_prefix: "commands".to_string(),
        }
    }
}
