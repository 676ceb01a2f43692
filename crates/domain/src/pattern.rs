use crate::transform::TransformRule;
use crate::value::ColumnType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// How a pattern decides whether a payload belongs to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MatchMode {
    /// Payload (or its nested `d` envelope) must contain every key in this
    /// set; among patterns whose keys are a subset of the payload's, the
    /// one with the highest specificity score wins.
    Keys { keys: BTreeSet<String> },
    /// Matches any payload carrying both a nested `d` object and a `ts`
    /// field, regardless of `d`'s own keys. A fallback step below key-set
    /// matching, for free-form envelopes that don't declare a fixed shape.
    Schema { schema: String },
}

/// Deserializes the configured columns for a pattern: either the literal
/// string `"auto"` or an explicit `{name: type}` map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ColumnsSpec {
    Auto(AutoTag),
    Explicit(BTreeMap<String, ColumnType>),
}

/// Unit type that only deserializes from the literal string `"auto"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AutoTag;

impl Serialize for AutoTag {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("auto")
    }
}

impl<'de> Deserialize<'de> for AutoTag {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == "auto" {
            Ok(AutoTag)
        } else {
            Err(serde::de::Error::custom(format!("expected \"auto\", got \"{s}\"")))
        }
    }
}

impl ColumnsSpec {
    pub fn is_auto(&self) -> bool {
        matches!(self, ColumnsSpec::Auto(_))
    }
}

/// A single declarative payload pattern, as configured under `patterns:` in
/// the ingestion YAML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pattern {
    pub name: String,
    #[serde(rename = "match")]
    pub match_mode: MatchMode,
    #[serde(default = "default_columns")]
    pub columns: ColumnsSpec,
    /// Optional table-name template, e.g. `"{topic}_9"`. `{topic}` is
    /// substituted with the sanitized topic at routing time.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub transformations: Vec<TransformRule>,
    /// Position in the configured pattern list; used to break specificity
    /// ties. Assigned by [`PatternSet::assign_registration_order`], not
    /// read from configuration.
    #[serde(default, skip_deserializing)]
    pub registration_order: usize,
}

fn default_columns() -> ColumnsSpec {
    ColumnsSpec::Auto(AutoTag)
}

/// The outcome of scoring a pattern against a payload's key set. Ordered so
/// that an exact full-set match always outranks a partial one, larger
/// partial matches outrank smaller ones, and ties favor earlier registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MatchScore {
    exact: bool,
    field_count: usize,
    reverse_registration_order: std::cmp::Reverse<usize>,
}

impl Pattern {
    /// Scores this pattern's `match.keys` against a payload's key set `k`.
    /// Returns `None` when the pattern's keys aren't a (non-empty) subset of
    /// `k`, or the pattern uses `match.schema` instead (schema matching is a
    /// separate fallback step, not scored alongside key-set matches).
    pub fn score_keys(&self, k: &BTreeSet<String>) -> Option<MatchScore> {
        let MatchMode::Keys { keys } = &self.match_mode else {
            return None;
        };
        if keys.is_empty() || !keys.is_subset(k) {
            return None;
        }
        Some(MatchScore {
            exact: keys.len() == k.len(),
            field_count: keys.len(),
            reverse_registration_order: std::cmp::Reverse(self.registration_order),
        })
    }

    pub fn schema_marker(&self) -> Option<&str> {
        match &self.match_mode {
            MatchMode::Schema { schema } => Some(schema.as_str()),
            MatchMode::Keys { .. } => None,
        }
    }
}

/// The ordered collection of declarative patterns plus the "auto" fallback,
/// as configured globally for the whole ingestion snapshot.
///
/// `#[serde(transparent)]` so this deserializes (and serializes) exactly
/// like a bare `Vec<Pattern>` — matching the configuration file's `patterns:`
/// key, which is a plain list of pattern definitions, not a wrapping map.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(transparent)]
pub struct PatternSet {
    pub patterns: Vec<Pattern>,
}

/// What a payload resolved to after running through a [`PatternSet`].
#[derive(Debug, Clone, Copy)]
pub enum Resolved<'a> {
    Matched(&'a Pattern),
    Auto,
}

impl PatternSet {
    /// Assigns stable registration order to each pattern, so tie-breaking in
    /// [`Pattern::score_keys`] reflects configuration order. Call once after
    /// loading/deserializing a snapshot.
    pub fn assign_registration_order(&mut self) {
        for (i, p) in self.patterns.iter_mut().enumerate() {
            p.registration_order = i;
        }
    }

    /// Runs the full PatternMatcher algorithm: top-level key-set match, then
    /// (if the payload carries a nested `d` map) a key-set match over `d`'s
    /// keys, then the first schema-marker pattern if `d` and `ts` are both
    /// present, then `Auto`.
    pub fn resolve(
        &self,
        top_level_keys: &BTreeSet<String>,
        nested_d_keys: Option<&BTreeSet<String>>,
        has_d_and_ts: bool,
    ) -> Resolved<'_> {
        if let Some(best) = self.best_key_match(top_level_keys) {
            return Resolved::Matched(best);
        }
        if let Some(d_keys) = nested_d_keys {
            if let Some(best) = self.best_key_match(d_keys) {
                return Resolved::Matched(best);
            }
        }
        if has_d_and_ts {
            if let Some(first) = self
                .patterns
                .iter()
                .filter(|p| p.schema_marker().is_some())
                .min_by_key(|p| p.registration_order)
            {
                return Resolved::Matched(first);
            }
        }
        Resolved::Auto
    }

    fn best_key_match(&self, keys: &BTreeSet<String>) -> Option<&Pattern> {
        self.patterns
            .iter()
            .filter_map(|p| p.score_keys(keys).map(|score| (score, p)))
            .max_by_key(|(score, _)| *score)
            .map(|(_, p)| p)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Pattern> {
        self.patterns.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(fields: &[&str]) -> BTreeSet<String> {
        fields.iter().map(|s| s.to_string()).collect()
    }

    fn pattern(name: &str, req: &[&str], order: usize) -> Pattern {
        Pattern {
            name: name.into(),
            match_mode: MatchMode::Keys { keys: keys(req) },
            columns: ColumnsSpec::Auto(AutoTag),
            table: None,
            transformations: Vec::new(),
            registration_order: order,
        }
    }

    #[test]
    fn exact_full_match_beats_partial_subset_match() {
        let partial = pattern("partial", &["kind"], 0);
        let exact = pattern("exact", &["kind", "unit"], 1);
        let set = PatternSet { patterns: vec![partial, exact] };

        let payload = keys(&["kind", "unit"]);
        match set.resolve(&payload, None, false) {
            Resolved::Matched(p) => assert_eq!(p.name, "exact"),
            Resolved::Auto => panic!("expected a match"),
        }
    }

    #[test]
    fn ties_resolve_to_first_registered() {
        let a = pattern("a", &["kind"], 0);
        let b = pattern("b", &["kind"], 1);
        let set = PatternSet { patterns: vec![a, b] };

        let payload = keys(&["kind", "extra"]);
        match set.resolve(&payload, None, false) {
            Resolved::Matched(p) => assert_eq!(p.name, "a"),
            Resolved::Auto => panic!("expected a match"),
        }
    }

    #[test]
    fn non_subset_keys_do_not_match() {
        let a = pattern("a", &["kind", "missing_field"], 0);
        let set = PatternSet { patterns: vec![a] };
        let payload = keys(&["kind"]);
        assert!(matches!(set.resolve(&payload, None, false), Resolved::Auto));
    }

    #[test]
    fn falls_back_to_nested_d_keys_when_top_level_has_no_match() {
        let inner = pattern("inner", &["DeviceID", "P0"], 0);
        let set = PatternSet { patterns: vec![inner] };
        let top = keys(&["d", "ts"]);
        let nested = keys(&["DeviceID", "P0", "P1"]);
        match set.resolve(&top, Some(&nested), true) {
            Resolved::Matched(p) => assert_eq!(p.name, "inner"),
            Resolved::Auto => panic!("expected a nested match"),
        }
    }

    #[test]
    fn schema_marker_wins_when_d_and_ts_present_and_no_key_match() {
        let schema_pattern = Pattern {
            name: "envelope".into(),
            match_mode: MatchMode::Schema { schema: "generic".into() },
            columns: ColumnsSpec::Auto(AutoTag),
            table: None,
            transformations: Vec::new(),
            registration_order: 0,
        };
        let set = PatternSet { patterns: vec![schema_pattern] };
        let top = keys(&["d", "ts"]);
        let nested = keys(&["whatever"]);
        match set.resolve(&top, Some(&nested), true) {
            Resolved::Matched(p) => assert_eq!(p.name, "envelope"),
            Resolved::Auto => panic!("expected schema match"),
        }
    }

    #[test]
    fn no_match_falls_back_to_auto() {
        let a = pattern("a", &["kind"], 0);
        let set = PatternSet { patterns: vec![a] };
        let payload = keys(&["other"]);
        assert!(matches!(set.resolve(&payload, None, false), Resolved::Auto));
    }
}
