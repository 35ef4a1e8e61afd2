use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables shared by every document actor spawned from a registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    /// Quiet period after the last edit before the markdown export runs
    pub debounce_secs: u64,
    /// Blob key prefix for exported markdown (`{prefix}{document_id}.md`)
    pub export_prefix: String,
    /// Upper bound on keys per bulk blob delete
    pub delete_batch_size: usize,
    /// Update log append attempts per delta before the failure is surfaced
    pub append_attempts: u32,
    /// Capacity of each actor's command queue
    pub mailbox_capacity: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            debounce_secs: 60,
            export_prefix: "markdown/".to_string(),
            delete_batch_size: 1000,
            append_attempts: 3,
            mailbox_capacity: 256,
        }
    }
}

impl ActorConfig {
    /// Load a configuration from JSON; missing fields keep their defaults
    pub fn from_json(data: &str) -> crate::SyncResult<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// Set the debounce window
    pub fn set_debounce_window(&mut self, window: Duration) {
        self.debounce_secs = window.as_secs();
    }

    /// Set the bulk delete batch size
    pub fn set_delete_batch_size(&mut self, size: usize) {
        self.delete_batch_size = size.max(1);
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    /// Blob key of the exported markdown for a document
    pub fn export_key(&self, document_id: &str) -> String {
        format!("{}{}.md", self.export_prefix, document_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ActorConfig::default();
        assert_eq!(config.debounce_window(), Duration::from_secs(60));
        assert_eq!(config.delete_batch_size, 1000);
        assert_eq!(config.export_key("doc-1"), "markdown/doc-1.md");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ActorConfig::from_json(r#"{"debounce_secs": 5, "export_prefix": "exports/"}"#)
            .unwrap();
        assert_eq!(config.debounce_window(), Duration::from_secs(5));
        assert_eq!(config.export_key("abc"), "exports/abc.md");
        assert_eq!(config.append_attempts, 3);
        assert_eq!(config.mailbox_capacity, 256);
    }

    #[test]
    fn test_batch_size_never_zero() {
        let mut config = ActorConfig::default();
        config.set_delete_batch_size(0);
        assert_eq!(config.delete_batch_size, 1);
    }
}
