use crate::pattern::PatternSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerConn {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    #[serde(default = "default_keepalive_seconds")]
    pub keepalive_seconds: u16,
}

fn default_client_id_prefix() -> String {
    "ingest".to_string()
}

fn default_keepalive_seconds() -> u16 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DbConn {
    pub uri: String,
    #[serde(default = "default_pool_size")]
    pub max_connections: u32,
}

fn default_pool_size() -> u32 {
    10
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct IntervalDifferenceConfig {
    #[serde(default)]
    pub enabled: bool,
    pub frequency_minutes: i64,
}

/// How a rule's destination table name and schema evolution are decided.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TableConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub auto_create: bool,
    #[serde(default = "default_true")]
    pub version_on_conflict: bool,
    /// Legacy alias for `name`, accepted for backward compatibility with
    /// older configuration files.
    #[serde(default)]
    pub table_override: Option<String>,
}

fn default_true() -> bool {
    true
}

impl TableConfig {
    pub fn explicit_name(&self) -> Option<&str> {
        self.name.as_deref().or(self.table_override.as_deref())
    }
}

/// Selects which pattern governs messages matching a rule's device pattern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(untagged)]
pub enum PatternNameOverride {
    #[default]
    Unspecified,
    Named(String),
}

impl PatternNameOverride {
    /// `true` for the `auto` sentinel value, which forces auto-column mode
    /// regardless of what the PatternMatcher would otherwise have scored.
    pub fn forces_auto(&self) -> bool {
        matches!(self, PatternNameOverride::Named(n) if n == "auto")
    }

    pub fn named(&self) -> Option<&str> {
        match self {
            PatternNameOverride::Named(n) if n != "auto" => Some(n.as_str()),
            _ => None,
        }
    }
}

/// One per-device rule under a route: which device id(s) it covers and how
/// their rows are routed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    /// A literal device id, or `"*"` to match any device on this route.
    pub pattern: String,
    #[serde(default)]
    pub pattern_name: PatternNameOverride,
    #[serde(default)]
    pub table_config: TableConfig,
    #[serde(default)]
    pub interval_difference: Option<IntervalDifferenceConfig>,
}

impl Rule {
    pub fn matches_device(&self, device_id: &str) -> bool {
        self.pattern == "*" || self.pattern == device_id
    }
}

/// One subscription: which topic filter to listen to on which broker, and
/// how its devices are routed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Route {
    pub topic: String,
    pub mqtt_server: String,
    #[serde(default = "default_true")]
    pub auto_discover: bool,
    #[serde(default)]
    pub device_ids: Vec<Rule>,
}

impl Route {
    /// The rule governing `device_id` on this route: the first rule whose
    /// `pattern` matches it literally, falling back to the first wildcard
    /// rule, else `None` (no per-device configuration at all).
    pub fn rule_for(&self, device_id: &str) -> Option<&Rule> {
        self.device_ids
            .iter()
            .find(|r| r.pattern == device_id)
            .or_else(|| self.device_ids.iter().find(|r| r.pattern == "*"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertThreshold {
    pub topic_filter: String,
    pub parameter: String,
    #[serde(default)]
    pub low: Option<f64>,
    #[serde(default)]
    pub high: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AlertConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mqtt_server: String,
    #[serde(default)]
    pub alert_topic: String,
    #[serde(default)]
    pub thresholds: Vec<AlertThreshold>,
}

/// One immutable, versioned view of the whole configuration tree. Readers
/// always see either the old or the new snapshot, never a torn mix of the
/// two — swapped in atomically by the infrastructure layer's config
/// hot-reload watcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    #[serde(default, skip_deserializing)]
    pub version: u64,
    pub mqtt_servers: BTreeMap<String, BrokerConn>,
    pub database: DbConn,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub patterns: PatternSet,
    #[serde(default)]
    pub alerts: AlertConfig,
}

impl Snapshot {
    /// Normalizes a freshly-parsed snapshot: assigns stable pattern
    /// registration order (for specificity tie-breaking) and stamps the
    /// version counter. Call once right after deserializing.
    pub fn finalize(mut self, version: u64) -> Self {
        self.patterns.assign_registration_order();
        self.version = version;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_matches_literal_device_before_wildcard() {
        let route = Route {
            topic: "sensors/+".into(),
            mqtt_server: "main".into(),
            auto_discover: true,
            device_ids: vec![
                Rule { pattern: "*".into(), pattern_name: PatternNameOverride::Unspecified, table_config: TableConfig::default(), interval_difference: None },
                Rule { pattern: "dev-1".into(), pattern_name: PatternNameOverride::Unspecified, table_config: TableConfig::default(), interval_difference: None },
            ],
        };
        assert_eq!(route.rule_for("dev-1").unwrap().pattern, "dev-1");
        assert_eq!(route.rule_for("dev-2").unwrap().pattern, "*");
    }

    #[test]
    fn pattern_name_override_auto_sentinel_forces_auto() {
        let over = PatternNameOverride::Named("auto".into());
        assert!(over.forces_auto());
        assert_eq!(over.named(), None);
    }

    #[test]
    fn table_config_prefers_name_over_legacy_override() {
        let cfg = TableConfig { name: Some("explicit".into()), table_override: Some("legacy".into()), ..Default::default() };
        assert_eq!(cfg.explicit_name(), Some("explicit"));
    }
}
