use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// One row of the `device_mapper` table: the most recently observed routing
/// decision for a `(topic, device_id)` key, plus first/last-seen bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceMapping {
    pub topic: String,
    pub device_id: String,
    pub table_name: String,
    pub pattern_name: String,
    pub device_name: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub message_count: u64,
}

/// Aggregate counters over the whole registry, as returned by `stats()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: u64,
    pub named: u64,
    pub unnamed: u64,
    pub per_topic: BTreeMap<String, u64>,
    pub per_table: BTreeMap<String, u64>,
}

/// The outcome of a [`DeviceRepository::register`] call: whether this was
/// the key's first observation or an update to an existing mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    New,
    Updated,
}

/// Persists and resolves `(topic, device_id)` routing history. Implementations
/// must be safe to call concurrently for distinct keys; each write is its own
/// short transaction (no cross-op locking is required or provided).
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Inserts a new mapping or, if `(topic, device_id)` already exists,
    /// updates `table_name`/`pattern_name`, increments `message_count`, and
    /// refreshes `last_seen`. When `device_name` is `None` on an update, the
    /// existing name (if any) is preserved rather than cleared.
    async fn register(
        &self,
        topic: &str,
        device_id: &str,
        table_name: &str,
        pattern_name: &str,
        device_name: Option<&str>,
    ) -> Result<RegisterOutcome>;

    async fn find(&self, topic: &str, device_id: &str) -> Result<Option<DeviceMapping>>;
    async fn find_by_topic(&self, topic: &str) -> Result<Vec<DeviceMapping>>;
    async fn find_by_table(&self, table_name: &str) -> Result<Vec<DeviceMapping>>;
    async fn list_all(&self) -> Result<Vec<DeviceMapping>>;
    async fn set_name(&self, topic: &str, device_id: &str, device_name: &str) -> Result<()>;
    async fn stats(&self) -> Result<RegistryStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_mapping_equality() {
        let now = Utc::now();
        let a = DeviceMapping {
            topic: "Gree1".into(),
            device_id: "103".into(),
            table_name: "gree1_9".into(),
            pattern_name: "auto".into(),
            device_name: None,
            first_seen: now,
            last_seen: now,
            message_count: 1,
        };
        let b = a.clone();
        assert_eq!(a, b);
    }
}
