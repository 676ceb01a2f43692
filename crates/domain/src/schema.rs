use crate::error::Result;
use crate::naming::{jaccard_similarity, param_count_bucket, JACCARD_REUSE_THRESHOLD};
use crate::value::{ColumnType, Row};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

/// Metadata columns every managed table carries alongside its payload-derived
/// ones; excluded from the Jaccard similarity comparison used for table
/// reuse, since every table shares them.
pub const METADATA_COLUMNS: [&str; 3] = ["id", "topic", "ingested_at"];

/// A destination table's known structure, as currently persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: BTreeMap<String, ColumnType>,
}

impl TableSchema {
    pub fn data_column_names(&self) -> BTreeSet<String> {
        self.columns
            .keys()
            .filter(|c| !METADATA_COLUMNS.contains(&c.as_str()))
            .cloned()
            .collect()
    }
}

/// The DDL/DML surface the schema-naming and widening logic in this module
/// is driven through. Implementations talk to the actual relational backend.
#[async_trait]
pub trait SchemaRepository: Send + Sync {
    async fn existing_tables(&self) -> Result<Vec<TableSchema>>;
    async fn create_table(&self, name: &str, columns: &BTreeMap<String, ColumnType>) -> Result<()>;
    async fn widen_columns(&self, name: &str, columns: &BTreeMap<String, ColumnType>) -> Result<()>;
    async fn insert_row(&self, table: &str, row: &Row) -> Result<()>;
}

/// §4.2 table-name resolution, steps 1–4, given the candidate explicit name
/// (already `{topic}`-substituted by the caller), the device pattern for
/// step 4's fallback, the required non-metadata data columns, and the set of
/// tables already known to the schema cache.
pub fn resolve_table_name(
    safe_topic: &str,
    device_pattern: &str,
    explicit_name: Option<&str>,
    data_columns: &BTreeSet<String>,
    existing: &[TableSchema],
) -> String {
    if let Some(name) = explicit_name {
        return name.to_string();
    }

    let count = data_columns.len();

    if let Some(bucket) = param_count_bucket(count) {
        return format!("{safe_topic}_{bucket}");
    }

    let prefix = format!("{safe_topic}_");
    let reused = existing
        .iter()
        .filter(|t| t.name.starts_with(&prefix))
        .map(|t| (jaccard_similarity(&t.data_column_names(), data_columns), t))
        .filter(|(sim, _)| *sim >= JACCARD_REUSE_THRESHOLD)
        .max_by(|(a, _), (b, _)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if let Some((_, table)) = reused {
        return table.name.clone();
    }

    if device_pattern != "*" {
        format!("{safe_topic}_{device_pattern}_{count}")
    } else {
        format!("{safe_topic}_auto_{count}")
    }
}

/// What must happen to make a table's schema a superset of `required`.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaPlan {
    /// Table doesn't exist yet; create it with `required` plus metadata columns.
    Create { columns: BTreeMap<String, ColumnType> },
    /// Table exists and every required column is present with a compatible
    /// type; only genuinely new columns (if any) need `ALTER ADD`.
    Widen { new_columns: BTreeMap<String, ColumnType> },
    /// Table exists with no new or conflicting columns; nothing to do.
    NoOp,
    /// An existing column's type is irreconcilable with what's required
    /// (see [`ColumnType::widen`]); a shadow version table is needed.
    VersionConflict { conflicting_columns: BTreeSet<String> },
}

/// Computes the widening plan for an existing (or absent) table against the
/// columns a new payload shape requires. Does not decide the destination
/// table's *name* — see [`resolve_table_name`] and [`next_version_name`].
pub fn plan_schema(existing: Option<&TableSchema>, required: &BTreeMap<String, ColumnType>) -> SchemaPlan {
    let Some(existing) = existing else {
        return SchemaPlan::Create { columns: required.clone() };
    };

    let mut new_columns = BTreeMap::new();
    let mut conflicting = BTreeSet::new();
    for (name, required_type) in required {
        match existing.columns.get(name) {
            None => {
                new_columns.insert(name.clone(), *required_type);
            }
            Some(existing_type) => {
                if existing_type.widen(*required_type).is_none() {
                    conflicting.insert(name.clone());
                }
            }
        }
    }

    if !conflicting.is_empty() {
        SchemaPlan::VersionConflict { conflicting_columns: conflicting }
    } else if new_columns.is_empty() {
        SchemaPlan::NoOp
    } else {
        SchemaPlan::Widen { new_columns }
    }
}

/// Picks the next unused `{base_name}_v{k}` suffix, given the set of table
/// names already known to the schema cache.
pub fn next_version_name(base_name: &str, existing: &[TableSchema]) -> String {
    let mut k = 1u32;
    loop {
        let candidate = format!("{base_name}_v{k}");
        if !existing.iter().any(|t| t.name == candidate) {
            return candidate;
        }
        k += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(pairs: &[(&str, ColumnType)]) -> BTreeMap<String, ColumnType> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn set(fields: &[&str]) -> BTreeSet<String> {
        fields.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn explicit_name_wins_over_everything_else() {
        let name = resolve_table_name("gree1", "*", Some("custom_table"), &set(&["a", "b"]), &[]);
        assert_eq!(name, "custom_table");
    }

    #[test]
    fn param_count_bucket_names_before_jaccard_or_fallback() {
        let name = resolve_table_name("gree1", "103", None, &set(&["P0", "P1", "P2", "P3"]), &[]);
        assert_eq!(name, "gree1_4");
    }

    #[test]
    fn jaccard_reuse_picks_an_existing_similar_table() {
        let existing = TableSchema {
            name: "devx_existing".into(),
            columns: cols(&[
                ("id", ColumnType::Integer),
                ("topic", ColumnType::Text),
                ("ingested_at", ColumnType::Text),
                ("Temp", ColumnType::Float),
                ("Status", ColumnType::Text),
                ("Humidity", ColumnType::Float),
                ("Pressure", ColumnType::Float),
                ("Wind", ColumnType::Float),
                ("Rain", ColumnType::Float),
                ("Extra", ColumnType::Float),
            ]),
        };
        // 6 required fields overlapping 6 of 7 existing data columns: 6/7 ≈ 0.857 ≥ 0.8
        let required = set(&["Temp", "Status", "Humidity", "Pressure", "Wind", "Rain"]);
        let name = resolve_table_name("devx", "*", None, &required, std::slice::from_ref(&existing));
        assert_eq!(name, "devx_existing");
    }

    #[test]
    fn fallback_uses_device_pattern_when_no_bucket_or_reuse() {
        let required = set(&["a", "b", "c", "d", "e", "f", "g"]);
        let name = resolve_table_name("gree1", "103", None, &required, &[]);
        assert_eq!(name, "gree1_103_7");
    }

    #[test]
    fn fallback_uses_auto_for_wildcard_device_pattern() {
        let required = set(&["a", "b", "c", "d", "e", "f", "g"]);
        let name = resolve_table_name("gree1", "*", None, &required, &[]);
        assert_eq!(name, "gree1_auto_7");
    }

    #[test]
    fn plan_schema_creates_when_table_absent() {
        let plan = plan_schema(None, &cols(&[("a", ColumnType::Integer)]));
        assert!(matches!(plan, SchemaPlan::Create { .. }));
    }

    #[test]
    fn plan_schema_is_noop_when_nothing_new_or_conflicting() {
        let existing = TableSchema { name: "t".into(), columns: cols(&[("a", ColumnType::Integer)]) };
        let plan = plan_schema(Some(&existing), &cols(&[("a", ColumnType::Integer)]));
        assert_eq!(plan, SchemaPlan::NoOp);
    }

    #[test]
    fn plan_schema_widens_with_only_new_columns() {
        let existing = TableSchema { name: "t".into(), columns: cols(&[("a", ColumnType::Integer)]) };
        let plan = plan_schema(Some(&existing), &cols(&[("a", ColumnType::Integer), ("b", ColumnType::Text)]));
        match plan {
            SchemaPlan::Widen { new_columns } => assert_eq!(new_columns.len(), 1),
            other => panic!("expected Widen, got {other:?}"),
        }
    }

    #[test]
    fn plan_schema_flags_type_conflicts_as_version_conflict() {
        let existing = TableSchema {
            name: "devx_4".into(),
            columns: cols(&[("Temp", ColumnType::Float), ("Status", ColumnType::Text)]),
        };
        let required = cols(&[("Temp", ColumnType::Text), ("Status", ColumnType::Text)]);
        let plan = plan_schema(Some(&existing), &required);
        match plan {
            SchemaPlan::VersionConflict { conflicting_columns } => {
                assert!(conflicting_columns.contains("Temp"));
                assert!(!conflicting_columns.contains("Status"));
            }
            other => panic!("expected VersionConflict, got {other:?}"),
        }
    }

    #[test]
    fn plan_schema_allows_int_to_float_widening() {
        let existing = TableSchema { name: "t".into(), columns: cols(&[("a", ColumnType::Integer)]) };
        let plan = plan_schema(Some(&existing), &cols(&[("a", ColumnType::Float)]));
        assert_eq!(plan, SchemaPlan::NoOp);
    }

    #[test]
    fn next_version_name_skips_taken_suffixes() {
        let existing = vec![
            TableSchema { name: "devx_4".into(), columns: BTreeMap::new() },
            TableSchema { name: "devx_4_v1".into(), columns: BTreeMap::new() },
        ];
        assert_eq!(next_version_name("devx_4", &existing), "devx_4_v2");
    }

    #[test]
    fn next_version_name_starts_at_v1() {
        assert_eq!(next_version_name("devx_4", &[]), "devx_4_v1");
    }
}
