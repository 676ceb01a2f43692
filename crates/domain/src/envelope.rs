use crate::value::{ColumnType, Row, Value};
use std::collections::BTreeMap;

/// Metadata keys never treated as payload data, whether at the top level of
/// a flat payload or synthesized by the router.
const EXCLUDED_KEYS: [&str; 3] = ["topic", "id", "ingested_at"];

/// Flattens a decoded JSON payload into a [`Row`], prepending `topic`.
///
/// If the payload carries a nested `d` object (the envelope convention),
/// `d`'s fields are promoted to the top level — list-valued fields reduced
/// to their first element — and `ts` is carried through unchanged. Otherwise
/// the payload's own top-level fields are used directly (also reducing any
/// list values), which is how flat sensor payloads like `{"DeviceID": ...,
/// "P0": ...}` are handled.
pub fn to_row(topic: &str, payload: &serde_json::Value) -> Row {
    let mut row = Row::new();
    row.insert("topic".to_string(), Value::Text(topic.to_string()));

    let Some(obj) = payload.as_object() else {
        return row;
    };

    if let Some(d) = obj.get("d").and_then(|v| v.as_object()) {
        for (k, v) in d {
            row.insert(k.clone(), Value::from_json(v.clone()).reduce_list());
        }
        if let Some(ts) = obj.get("ts") {
            row.insert("ts".to_string(), Value::from_json(ts.clone()).reduce_list());
        }
    } else {
        for (k, v) in obj {
            if EXCLUDED_KEYS.contains(&k.as_str()) {
                continue;
            }
            row.insert(k.clone(), Value::from_json(v.clone()).reduce_list());
        }
    }

    row
}

/// §4.2's data-column extraction: the payload's non-metadata fields, typed
/// for column synthesis. Shares [`to_row`]'s `d`/`ts` flattening rules.
pub fn extract_data_columns(payload: &serde_json::Value) -> BTreeMap<String, ColumnType> {
    to_row("", payload)
        .into_iter()
        .filter(|(k, _)| k != "topic")
        .map(|(k, v)| (k, v.column_type()))
        .collect()
}

fn matches_device_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    lower == "deviceid" || lower == "device_id" || lower == "device"
}

fn value_to_id_string(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::Array(items) => items.first().and_then(value_to_id_string),
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// §4.7 step 1's device-id resolution order: top-level `DeviceID`, nested
/// `d.DeviceID`, then a case-insensitive `deviceid`/`device_id`/`device`
/// search first at the top level and then under `d`. List values reduce to
/// their first element.
pub fn extract_device_id(payload: &serde_json::Value) -> Option<String> {
    let obj = payload.as_object()?;

    if let Some(v) = obj.get("DeviceID") {
        if let Some(id) = value_to_id_string(v) {
            return Some(id);
        }
    }
    if let Some(d) = obj.get("d").and_then(|v| v.as_object()) {
        if let Some(v) = d.get("DeviceID") {
            if let Some(id) = value_to_id_string(v) {
                return Some(id);
            }
        }
    }
    for (key, v) in obj {
        if matches_device_key(key) {
            if let Some(id) = value_to_id_string(v) {
                return Some(id);
            }
        }
    }
    if let Some(d) = obj.get("d").and_then(|v| v.as_object()) {
        for (key, v) in d {
            if matches_device_key(key) {
                if let Some(id) = value_to_id_string(v) {
                    return Some(id);
                }
            }
        }
    }
    None
}

/// Last-resort device-id probe over an already-flattened row, used when the
/// raw payload didn't carry a recognizable field but a transformation may
/// have introduced one (e.g. a `rename_field` onto `DeviceID`).
pub fn extract_device_id_from_row(row: &Row) -> Option<String> {
    row.iter().find(|(k, _)| matches_device_key(k)).map(|(_, v)| match v {
        Value::Text(s) => s.clone(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flat_payload_counts_nine_data_columns() {
        let payload = json!({
            "DeviceID": "103", "Date": "01012024", "Time": "120000",
            "P0": "10", "P1": "20", "P2": "30", "P3": "40", "P4": "50", "P5": "60"
        });
        let cols = extract_data_columns(&payload);
        assert_eq!(cols.len(), 9);
    }

    #[test]
    fn nested_envelope_flattens_d_and_keeps_ts() {
        let payload = json!({"d": {"DeviceID": ["103"], "P0": [5]}, "ts": "20240101T120000"});
        let row = to_row("Gree1", &payload);
        assert_eq!(row.get("topic"), Some(&Value::Text("Gree1".into())));
        assert_eq!(row.get("DeviceID"), Some(&Value::Text("103".into())));
        assert_eq!(row.get("P0"), Some(&Value::Int(5)));
        assert!(row.contains_key("ts"));
    }

    #[test]
    fn device_id_resolves_case_insensitively_under_nested_envelope() {
        let payload = json!({"d": {"deviceID": [77], "P0": [5]}, "ts": "2026-01-01T00:00:00"});
        assert_eq!(extract_device_id(&payload), Some("77".to_string()));
    }

    #[test]
    fn device_id_prefers_top_level_exact_field() {
        let payload = json!({"DeviceID": "m1", "d": {"DeviceID": "other"}});
        assert_eq!(extract_device_id(&payload), Some("m1".to_string()));
    }

    #[test]
    fn device_id_absent_returns_none() {
        let payload = json!({"P0": 1});
        assert_eq!(extract_device_id(&payload), None);
    }
}
