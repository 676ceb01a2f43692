use std::collections::BTreeSet;

/// Table-name reuse threshold: an existing table is reused for a new payload
/// shape once the column-name Jaccard similarity reaches this value.
pub const JACCARD_REUSE_THRESHOLD: f64 = 0.8;

/// Parameter-count buckets eligible for name-based grouping before falling
/// back to Jaccard similarity.
pub const PARAM_COUNT_BUCKETS: [usize; 3] = [4, 5, 9];

pub fn param_count_bucket(column_count: usize) -> Option<usize> {
    PARAM_COUNT_BUCKETS.iter().copied().find(|&n| n == column_count)
}

/// Column-name Jaccard similarity between a candidate table's existing
/// columns and a new payload's column set.
pub fn jaccard_similarity(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 { 0.0 } else { intersection as f64 / union as f64 }
}

/// Sanitizes a topic segment or pattern name into a valid lowercase SQL
/// identifier fragment: non-alphanumeric runs collapse to a single underscore.
pub fn sanitize_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_sep = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "t".to_string()
    } else if trimmed.chars().next().unwrap().is_ascii_digit() {
        format!("t_{trimmed}")
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jaccard_identical_sets_is_one() {
        let a: BTreeSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(jaccard_similarity(&a, &a), 1.0);
    }

    #[test]
    fn jaccard_disjoint_sets_is_zero() {
        let a: BTreeSet<String> = ["a"].iter().map(|s| s.to_string()).collect();
        let b: BTreeSet<String> = ["b"].iter().map(|s| s.to_string()).collect();
        assert_eq!(jaccard_similarity(&a, &b), 0.0);
    }

    #[test]
    fn jaccard_above_threshold_for_mostly_overlapping_columns() {
        let a: BTreeSet<String> = ["temp", "humidity", "pressure", "ts"].iter().map(|s| s.to_string()).collect();
        let b: BTreeSet<String> = ["temp", "humidity", "pressure", "device_id"].iter().map(|s| s.to_string()).collect();
        let sim = jaccard_similarity(&a, &b);
        assert!(sim >= 0.5 && sim < JACCARD_REUSE_THRESHOLD);
    }

    #[test]
    fn param_count_bucket_recognizes_configured_sizes() {
        assert_eq!(param_count_bucket(5), Some(5));
        assert_eq!(param_count_bucket(6), None);
    }

    #[test]
    fn sanitize_identifier_collapses_separators_and_lowercases() {
        assert_eq!(sanitize_identifier("Sensors/Device-1/Temp C"), "sensors_device_1_temp_c");
    }

    #[test]
    fn sanitize_identifier_prefixes_leading_digit() {
        assert_eq!(sanitize_identifier("123abc"), "t_123abc");
    }
}
