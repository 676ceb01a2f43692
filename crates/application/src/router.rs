//! §4.7 Router: per-message orchestration of match → transform → resolve
//! table → insert, including both derivation substreams and the
//! raw-insertion suppression rule resolved in DESIGN.md / SPEC_FULL.md §9.

use crate::derivation_state::DerivationStateMap;
use domain::derivation::DerivationKey;
use domain::envelope::{extract_device_id, extract_device_id_from_row, to_row};
use domain::naming::sanitize_identifier;
use domain::schema::{next_version_name, plan_schema, resolve_table_name, SchemaPlan};
use domain::{
    apply_all, ColumnType, ColumnsSpec, DeviceRepository, IngestError, Resolved, Result, Row, Rule, SchemaRepository,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Suffix appended to a base table's name for its consecutive-difference
/// companion table.
const CONSECUTIVE_DIFF_SUFFIX: &str = "_diff";
/// Default companion-table suffix for the interval-difference substream, per
/// `spec.md` §4.7 ("defaults to `_interval_diff`"). The domain's
/// `IntervalDifferenceConfig` carries no `table_suffix` override, so this is
/// the only suffix this implementation produces.
const INTERVAL_DIFF_SUFFIX: &str = "_interval_diff";

/// What a single [`Router::route`] call resolved and did.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteOutcome {
    pub table: String,
    pub pattern_name: String,
    /// `true` when this observation only established a derivation baseline
    /// (or carries no device id) and no diff row was emitted.
    pub baseline: bool,
}

/// Orchestrates one inbound message end to end. Cheap to clone (wraps
/// `Arc`s internally is unnecessary since all state is already shared); hold
/// it behind an `Arc` at the call site instead.
pub struct Router {
    schema_repo: Arc<dyn SchemaRepository>,
    device_repo: Arc<dyn DeviceRepository>,
    derivation: DerivationStateMap,
    /// §5's "single coarse mutex around resolution and DDL" for SchemaManager.
    schema_lock: AsyncMutex<()>,
}

impl Router {
    pub fn new(schema_repo: Arc<dyn SchemaRepository>, device_repo: Arc<dyn DeviceRepository>) -> Self {
        Self { schema_repo, device_repo, derivation: DerivationStateMap::new(), schema_lock: AsyncMutex::new(()) }
    }

    /// Routes one decoded payload for a topic, under the resolved `rule` (if
    /// the owning route has per-device configuration) and the snapshot's
    /// pattern library.
    pub async fn route(
        &self,
        topic: &str,
        payload: &serde_json::Value,
        rule: Option<&Rule>,
        patterns: &domain::pattern::PatternSet,
    ) -> Result<RouteOutcome> {
        let device_id = extract_device_id(payload);
        let mut row = to_row(topic, payload);
        let device_id = device_id.or_else(|| extract_device_id_from_row(&row));

        let resolved_pattern = self.resolve_pattern(payload, rule, patterns);
        let pattern_name = resolved_pattern.map(|p| p.name.clone()).unwrap_or_else(|| "auto".to_string());

        if let Some(p) = resolved_pattern {
            let (transformed, errors) = apply_all(topic, &row, &p.transformations);
            for e in &errors {
                warn!(topic, pattern = %p.name, error = %e, "transformation error; continuing with remaining rules");
            }
            row = transformed;
        }

        let data_columns = self.data_columns_for(resolved_pattern, &row);
        let safe_topic = sanitize_identifier(topic);
        let device_pattern = rule.map(|r| r.pattern.as_str()).unwrap_or("*");

        let explicit_name = resolved_pattern
            .and_then(|p| p.table.as_ref())
            .map(|template| template.replace("{topic}", &safe_topic))
            .or_else(|| rule.and_then(|r| r.table_config.explicit_name()).map(str::to_string));

        let version_on_conflict = rule.map(|r| r.table_config.version_on_conflict).unwrap_or(true);

        let data_column_names: BTreeSet<String> = data_columns.keys().cloned().collect();
        let existing = self.schema_repo.existing_tables().await?;
        let desired_table =
            resolve_table_name(&safe_topic, device_pattern, explicit_name.as_deref(), &data_column_names, &existing);
        let table = self.ensure_schema(&desired_table, &data_columns, version_on_conflict).await?;

        let mut baseline = true;

        if let Some(device_id) = &device_id {
            let key = DerivationKey { topic: topic.to_string(), device_id: device_id.clone() };
            let interval_cfg = rule.and_then(|r| r.interval_difference.as_ref());
            let (consecutive_emit, interval_emit) = self.derivation.observe(key, &row, interval_cfg);

            if let Some(diff_row) = consecutive_emit {
                let diff_table = format!("{table}{CONSECUTIVE_DIFF_SUFFIX}");
                self.ensure_and_insert(&diff_table, &diff_row, version_on_conflict).await?;
                baseline = false;
            }
            if let Some(diff_row) = interval_emit {
                let diff_table = format!("{table}{INTERVAL_DIFF_SUFFIX}");
                self.ensure_and_insert(&diff_table, &diff_row, version_on_conflict).await?;
                baseline = false;
            }

            self.device_repo.register(topic, device_id, &table, &pattern_name, None).await?;
            debug!(topic, device_id, table = %table, baseline, "row routed for known device");
        } else if explicit_name.is_some() {
            // §4.7 step 8: an unattributed row routed through a shared
            // pattern-template table is dropped rather than polluting it.
            warn!(topic, table = %table, "no device id resolved for pattern-templated table; dropping raw row");
        } else {
            self.schema_repo.insert_row(&table, &row).await?;
            debug!(topic, table = %table, "raw row inserted (no device id to attribute)");
        }

        Ok(RouteOutcome { table, pattern_name, baseline })
    }

    fn resolve_pattern<'a>(
        &self,
        payload: &serde_json::Value,
        rule: Option<&Rule>,
        patterns: &'a domain::pattern::PatternSet,
    ) -> Option<&'a domain::Pattern> {
        if rule.map(|r| r.pattern_name.forces_auto()).unwrap_or(false) {
            return None;
        }
        if let Some(named) = rule.and_then(|r| r.pattern_name.named()) {
            return patterns.find_by_name(named);
        }

        let top_level_keys: BTreeSet<String> =
            payload.as_object().map(|o| o.keys().cloned().collect()).unwrap_or_default();
        let nested_d_keys: Option<BTreeSet<String>> =
            payload.as_object().and_then(|o| o.get("d")).and_then(|d| d.as_object()).map(|o| o.keys().cloned().collect());
        let has_d_and_ts = payload.as_object().map(|o| o.contains_key("d") && o.contains_key("ts")).unwrap_or(false);

        match patterns.resolve(&top_level_keys, nested_d_keys.as_ref(), has_d_and_ts) {
            Resolved::Matched(p) => Some(p),
            Resolved::Auto => None,
        }
    }

    fn data_columns_for(&self, pattern: Option<&domain::Pattern>, row: &Row) -> BTreeMap<String, ColumnType> {
        match pattern.map(|p| &p.columns) {
            Some(ColumnsSpec::Explicit(cols)) => cols.clone(),
            _ => row.iter().filter(|(k, _)| k.as_str() != "topic").map(|(k, v)| (k.clone(), v.column_type())).collect(),
        }
    }

    /// §4.5/§5: resolves `desired_name`'s schema against `required` columns
    /// under the coarse schema lock, creating, widening, or versioning as
    /// needed, and returns the table actually used (which may differ from
    /// `desired_name` on a version conflict).
    async fn ensure_schema(
        &self,
        desired_name: &str,
        required: &BTreeMap<String, ColumnType>,
        version_on_conflict: bool,
    ) -> Result<String> {
        let _guard = self.schema_lock.lock().await;
        let existing = self.schema_repo.existing_tables().await?;
        let mut name = desired_name.to_string();

        loop {
            let current = existing.iter().find(|t| t.name == name);
            match plan_schema(current, required) {
                SchemaPlan::Create { columns } => {
                    self.schema_repo.create_table(&name, &columns).await?;
                    info!(table = %name, columns = columns.len(), "table created");
                    return Ok(name);
                }
                SchemaPlan::Widen { new_columns } => {
                    self.schema_repo.widen_columns(&name, &new_columns).await?;
                    info!(table = %name, new_columns = new_columns.len(), "table widened");
                    return Ok(name);
                }
                SchemaPlan::NoOp => return Ok(name),
                SchemaPlan::VersionConflict { conflicting_columns } => {
                    if !version_on_conflict {
                        return Err(IngestError::Schema(format!(
                            "column type conflict on table {name}: {conflicting_columns:?} (versioning disabled)"
                        )));
                    }
                    warn!(table = %name, ?conflicting_columns, "schema conflict; creating shadow version table");
                    name = next_version_name(&name, &existing);
                }
            }
        }
    }

    async fn ensure_and_insert(&self, table: &str, row: &Row, version_on_conflict: bool) -> Result<()> {
        let columns: BTreeMap<String, ColumnType> =
            row.iter().filter(|(k, _)| k.as_str() != "topic").map(|(k, v)| (k.clone(), v.column_type())).collect();
        let name = self.ensure_schema(table, &columns, version_on_conflict).await?;
        self.schema_repo.insert_row(&name, row).await
    }
}
