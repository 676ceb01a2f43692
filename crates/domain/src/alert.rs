use crate::config::AlertThreshold;
use crate::value::Row;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ViolationKind {
    Low,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertViolation {
    pub parameter: String,
    pub value: f64,
    pub threshold: f64,
    #[serde(rename = "type")]
    pub kind: ViolationKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertNotice {
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub device_id: String,
    pub violations: Vec<AlertViolation>,
}

/// Evaluates a row's numeric fields against the thresholds configured for
/// its topic, returning one violation per breached bound.
pub fn check_thresholds(row: &Row, thresholds: &[AlertThreshold]) -> Vec<AlertViolation> {
    let mut violations = Vec::new();
    for threshold in thresholds {
        let Some(value) = row.get(&threshold.parameter).and_then(|v| v.as_f64()) else {
            continue;
        };
        if let Some(low) = threshold.low {
            if value < low {
                violations.push(AlertViolation {
                    parameter: threshold.parameter.clone(),
                    value,
                    threshold: low,
                    kind: ViolationKind::Low,
                });
            }
        }
        if let Some(high) = threshold.high {
            if value > high {
                violations.push(AlertViolation {
                    parameter: threshold.parameter.clone(),
                    value,
                    threshold: high,
                    kind: ViolationKind::High,
                });
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn detects_high_violation() {
        let mut row = Row::new();
        row.insert("temperature".into(), Value::Float(105.0));
        let thresholds = vec![AlertThreshold {
            topic_filter: "sensors/+".into(),
            parameter: "temperature".into(),
            low: Some(0.0),
            high: Some(100.0),
        }];
        let violations = check_thresholds(&row, &thresholds);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::High);
    }

    #[test]
    fn within_bounds_produces_no_violations() {
        let mut row = Row::new();
        row.insert("temperature".into(), Value::Float(50.0));
        let thresholds = vec![AlertThreshold {
            topic_filter: "sensors/+".into(),
            parameter: "temperature".into(),
            low: Some(0.0),
            high: Some(100.0),
        }];
        assert!(check_thresholds(&row, &thresholds).is_empty());
    }

    #[test]
    fn missing_parameter_is_skipped() {
        let row = Row::new();
        let thresholds = vec![AlertThreshold {
            topic_filter: "sensors/+".into(),
            parameter: "temperature".into(),
            low: None,
            high: Some(100.0),
        }];
        assert!(check_thresholds(&row, &thresholds).is_empty());
    }
}
