use crate::error::{IngestError, Result};
use crate::value::{Row, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A gate deciding whether a [`Transformation`] applies to a given row. All
/// configured clauses must hold (logical AND); an entirely empty condition
/// always matches.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Condition {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub has_fields: Vec<String>,
}

impl Condition {
    pub fn matches(&self, topic: &str, row: &Row) -> bool {
        if let Some(expected) = &self.topic {
            if expected != topic {
                return false;
            }
        }
        for (field, expected) in &self.fields {
            match row.get(field) {
                Some(actual) if matches_json(actual, expected) => {}
                _ => return false,
            }
        }
        for field in &self.has_fields {
            if !row.contains_key(field) {
                return false;
            }
        }
        true
    }
}

fn matches_json(value: &Value, expected: &serde_json::Value) -> bool {
    match value {
        Value::Text(s) => expected.as_str().map(|e| e == s).unwrap_or(false),
        Value::Int(i) => expected.as_i64().map(|e| e == *i).unwrap_or(false),
        Value::Float(f) => expected.as_f64().map(|e| (e - f).abs() < f64::EPSILON).unwrap_or(false),
        Value::Bool(b) => expected.as_bool().map(|e| e == *b).unwrap_or(false),
        _ => false,
    }
}

/// A single field-level rewrite applied to a row after pattern matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transformation {
    /// Combines an integer part and a fractional part field into one
    /// decimal value: `target = integer + fractional / 10^D`, where `D` is
    /// the digit count of the fractional field's integer representation.
    CombineDecimal {
        integer_field: String,
        fractional_field: String,
        target_field: String,
        #[serde(default)]
        remove_fractional: bool,
    },
    /// Multiplies a numeric field by a fixed factor in place.
    ScaleValue { field: String, scale_factor: f64 },
    RenameField { from_field: String, to_field: String },
    RemoveField { field: String },
}

impl Transformation {
    pub fn apply(&self, row: &mut Row) -> Result<()> {
        match self {
            Transformation::CombineDecimal {
                integer_field,
                fractional_field,
                target_field,
                remove_fractional,
            } => {
                let int_part = row
                    .get(integer_field)
                    .and_then(Value::as_i64)
                    .ok_or_else(|| IngestError::Transform(format!("missing integer field '{integer_field}'")))?;
                let frac_part = row
                    .get(fractional_field)
                    .and_then(Value::as_i64)
                    .ok_or_else(|| IngestError::Transform(format!("missing fractional field '{fractional_field}'")))?;
                let digits = frac_part.unsigned_abs().to_string().len().max(1) as i32;
                let sign = if int_part < 0 { -1.0 } else { 1.0 };
                let combined = int_part as f64 + sign * frac_part.unsigned_abs() as f64 / 10f64.powi(digits);
                row.insert(target_field.clone(), Value::Float(combined));
                if *remove_fractional {
                    row.remove(fractional_field);
                }
                Ok(())
            }
            Transformation::ScaleValue { field, scale_factor } => {
                let current = row
                    .get(field)
                    .and_then(Value::as_f64)
                    .ok_or_else(|| IngestError::Transform(format!("missing numeric field '{field}'")))?;
                row.insert(field.clone(), Value::Float(current * scale_factor));
                Ok(())
            }
            Transformation::RenameField { from_field, to_field } => {
                let value = row
                    .remove(from_field)
                    .ok_or_else(|| IngestError::Transform(format!("missing field '{from_field}' to rename")))?;
                row.insert(to_field.clone(), value);
                Ok(())
            }
            Transformation::RemoveField { field } => {
                row.remove(field);
                Ok(())
            }
        }
    }
}

/// One configured transformation plus its optional condition gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransformRule {
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(flatten)]
    pub transformation: Transformation,
}

/// Applies a sequence of transformations to a defensive copy of `row`,
/// skipping any whose condition doesn't hold and isolating any that error
/// (returned for the caller to log) so the remaining transformations still
/// run.
pub fn apply_all(topic: &str, row: &Row, rules: &[TransformRule]) -> (Row, Vec<IngestError>) {
    let mut out = row.clone();
    let mut errors = Vec::new();
    for rule in rules {
        let gate_open = rule.condition.as_ref().map(|c| c.matches(topic, &out)).unwrap_or(true);
        if !gate_open {
            continue;
        }
        if let Err(e) = rule.transformation.apply(&mut out) {
            errors.push(e);
        }
    }
    (out, errors)
}
