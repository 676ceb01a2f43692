use crate::value::{Row, Value};
use std::collections::BTreeMap;

/// Identifies one independent derivation stream: a specific topic and the
/// device that reported on it. Handler invocations sharing a key may run
/// concurrently and must be serialized by the caller (sharded locking).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DerivationKey {
    pub topic: String,
    pub device_id: String,
}

/// §4.6's metadata field set: carried through a derived row unchanged,
/// never differenced as a numeric payload field.
const METADATA_FIELDS: [&str; 6] = ["topic", "DeviceID", "Date", "Time", "ts", "ingested_at"];

fn is_metadata_field(field: &str) -> bool {
    METADATA_FIELDS.contains(&field)
}

/// Per-key state for the consecutive-sample difference stream.
#[derive(Debug, Clone, Default)]
pub struct ConsecutiveState {
    last: Option<Row>,
}

impl ConsecutiveState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes the difference between `current` and the stored baseline,
    /// then replaces the baseline with `current`.
    ///
    /// Returns `None` on the first sample ever seen for this key (the
    /// baseline is established but nothing is emitted). Metadata fields
    /// (§4.6: `topic, DeviceID, Date, Time, ts, ingested_at`) are copied
    /// through unchanged rather than differenced. A non-metadata field
    /// absent from the previous sample emits at its raw value rather than a
    /// difference, whether that happens on the very first sample or
    /// mid-stream when a new field appears.
    pub fn diff(&mut self, current: &Row) -> Option<Row> {
        let previous = self.last.replace(current.clone());

        let previous = match previous {
            None => return None,
            Some(p) => p,
        };

        let mut out = Row::new();
        for (field, value) in current {
            if is_metadata_field(field) {
                out.insert(field.clone(), value.clone());
                continue;
            }
            match previous.get(field) {
                Some(prev_value) => match (prev_value.as_f64(), value.as_f64()) {
                    (Some(p), Some(c)) => {
                        out.insert(field.clone(), Value::Float(c - p));
                    }
                    _ => {
                        out.insert(field.clone(), value.clone());
                    }
                },
                None => {
                    out.insert(field.clone(), value.clone());
                }
            }
        }
        Some(out)
    }
}

/// Per-key state for the fixed-interval boundary difference stream.
///
/// Samples are bucketed into fixed windows by the caller-supplied interval
/// key (a floor-aligned timestamp bucket). Within a window, the most
/// recently observed sample is kept as that window's representative value.
/// A difference is emitted at the moment a sample rolls over into a new
/// window, computed between the window that just closed and the window
/// before it — which means the first two distinct windows only establish
/// baselines; emission starts once the third distinct window is entered.
/// The emitted row is stamped with the newly entered window's key.
#[derive(Debug, Clone, Default)]
pub struct IntervalState {
    current_interval: Option<i64>,
    current_sample: Option<(Row, i64)>,
    previous_closed_sample: Option<(Row, i64)>,
    distinct_intervals_seen: u32,
}

impl IntervalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one sample, tagged with its pre-computed interval key and the
    /// epoch-seconds timestamp it was observed at. Returns `Some(row)` only
    /// on a rollover that has cleared the warm-up period; the returned row
    /// carries `interval_boundary` (the newly entered window's key, rendered
    /// per §4.6), metadata fields copied through from the sample that
    /// triggered the rollover, a plain `current - previous` diff for every
    /// non-metadata field present in both readings, and the five `P0`-scoped
    /// interval columns (`start_P0_value`/`start_P0_time` for the
    /// closed-out previous window, `end_P0_value`/`end_P0_time` for the
    /// window that just closed).
    pub fn observe(&mut self, interval_key: i64, timestamp: i64, current: Row) -> Option<Row> {
        match self.current_interval {
            None => {
                self.current_interval = Some(interval_key);
                self.current_sample = Some((current, timestamp));
                self.distinct_intervals_seen = 1;
                None
            }
            Some(active) if active == interval_key => {
                self.current_sample = Some((current, timestamp));
                None
            }
            Some(_) => {
                let (closing_sample, closing_ts) =
                    self.current_sample.take().expect("interval always has a sample once active");
                self.distinct_intervals_seen += 1;

                let emitted = if self.distinct_intervals_seen >= 3 {
                    self.previous_closed_sample
                        .as_ref()
                        .map(|(baseline, baseline_ts)| {
                            build_interval_row(interval_key, &current, &closing_sample, closing_ts, baseline, *baseline_ts)
                        })
                } else {
                    None
                };

                self.previous_closed_sample = Some((closing_sample, closing_ts));
                self.current_interval = Some(interval_key);
                self.current_sample = Some((current, timestamp));

                emitted
            }
        }
    }
}

/// Assembles one emitted interval-difference row: the boundary, metadata
/// copied through from the sample that triggered this rollover, the plain
/// numeric diffs over non-metadata fields, and the five `P0`-scoped interval
/// columns (`start_P0_value`, `start_P0_time`, `end_P0_value`,
/// `end_P0_time`), per §4.6/§4.7 step 6.
fn build_interval_row(
    interval_key: i64,
    metadata_source: &Row,
    closing: &Row,
    closing_ts: i64,
    baseline: &Row,
    baseline_ts: i64,
) -> Row {
    let mut out = Row::new();
    out.insert("interval_boundary".to_string(), Value::Text(format_boundary(interval_key)));
    for (field, value) in metadata_source {
        if is_metadata_field(field) {
            out.insert(field.clone(), value.clone());
        }
    }
    for (field, value) in closing {
        if is_metadata_field(field) {
            continue;
        }
        let Some(prev_value) = baseline.get(field) else {
            out.insert(field.clone(), value.clone());
            continue;
        };
        match (prev_value.as_f64(), value.as_f64()) {
            (Some(p), Some(c)) => {
                out.insert(field.clone(), Value::Float(c - p));
            }
            _ => {
                out.insert(field.clone(), value.clone());
            }
        }
    }
    let start_p0 = baseline.get("P0").cloned().unwrap_or(Value::Float(0.0));
    let end_p0 = closing.get("P0").cloned().unwrap_or(Value::Float(0.0));
    out.insert("start_P0_value".to_string(), start_p0);
    out.insert("end_P0_value".to_string(), end_p0);
    out.insert("start_P0_time".to_string(), Value::Text(format_time(baseline_ts)));
    out.insert("end_P0_time".to_string(), Value::Text(format_time(closing_ts)));
    out
}

/// Renders a floor-aligned interval key as `YYYY-MM-DDTHH:MM`, per §4.6.
fn format_boundary(epoch_seconds: i64) -> String {
    chrono::DateTime::from_timestamp(epoch_seconds, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M").to_string())
        .unwrap_or_default()
}

fn format_time(epoch_seconds: i64) -> String {
    chrono::DateTime::from_timestamp(epoch_seconds, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_default()
}

/// Floors a Unix-epoch-seconds timestamp to the start of its
/// `interval_seconds`-wide bucket.
pub fn interval_key(epoch_seconds: i64, interval_seconds: i64) -> i64 {
    if interval_seconds <= 0 {
        return epoch_seconds;
    }
    epoch_seconds.div_euclid(interval_seconds) * interval_seconds
}

/// Scans `s` for a run of six consecutive ASCII digits that parses as a
/// plausible `HHMMSS` time-of-day, per §4.6's timestamp-parsing rule. Used
/// against a row's `ts`/`Time`/`timestamp`/`Date` fields, in that order, by
/// the caller; falls back to wall-clock time when none of them carry one.
pub fn find_hhmmss(s: &str) -> Option<(u32, u32, u32)> {
    let chars: Vec<char> = s.chars().collect();
    for window in chars.windows(6) {
        if window.iter().all(|c| c.is_ascii_digit()) {
            let digits: String = window.iter().collect();
            let h: u32 = digits[0..2].parse().ok()?;
            let m: u32 = digits[2..4].parse().ok()?;
            let sec: u32 = digits[4..6].parse().ok()?;
            if h < 24 && m < 60 && sec < 60 {
                return Some((h, m, sec));
            }
        }
    }
    None
}

/// Applies [`find_hhmmss`] to a row's timestamp-carrying fields, in the
/// fixed search order `ts`, `Time`, `timestamp`, `Date`.
pub fn extract_time_of_day(row: &Row) -> Option<(u32, u32, u32)> {
    for key in ["ts", "Time", "timestamp", "Date"] {
        if let Some(Value::Text(s)) = row.get(key) {
            if let Some(hms) = find_hhmmss(s) {
                return Some(hms);
            }
        }
    }
    None
}

pub type DerivationState = BTreeMap<DerivationKey, (ConsecutiveState, IntervalState)>;

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn consecutive_first_sample_establishes_baseline_without_emitting() {
        let mut state = ConsecutiveState::new();
        let r = row(&[("temp", Value::Float(20.0))]);
        assert_eq!(state.diff(&r), None);
    }

    #[test]
    fn consecutive_second_sample_emits_difference() {
        let mut state = ConsecutiveState::new();
        state.diff(&row(&[("temp", Value::Float(20.0))]));
        let diff = state.diff(&row(&[("temp", Value::Float(23.0))])).unwrap();
        assert_eq!(diff.get("temp"), Some(&Value::Float(3.0)));
    }

    #[test]
    fn consecutive_new_field_emits_raw_value_mid_stream() {
        let mut state = ConsecutiveState::new();
        state.diff(&row(&[("temp", Value::Float(20.0))]));
        let diff = state
            .diff(&row(&[("temp", Value::Float(21.0)), ("humidity", Value::Float(55.0))]))
            .unwrap();
        assert_eq!(diff.get("humidity"), Some(&Value::Float(55.0)));
        assert_eq!(diff.get("temp"), Some(&Value::Float(1.0)));
    }

    #[test]
    fn interval_key_floors_to_bucket_start() {
        assert_eq!(interval_key(125, 60), 120);
        assert_eq!(interval_key(119, 60), 60);
        assert_eq!(interval_key(0, 60), 0);
    }

    #[test]
    fn interval_no_emission_during_warmup() {
        let mut state = IntervalState::new();
        assert_eq!(state.observe(0, 0, row(&[("temp", Value::Float(10.0))])), None);
        assert_eq!(state.observe(0, 30, row(&[("temp", Value::Float(11.0))])), None);
        // rollover into the 2nd distinct interval: still warming up
        assert_eq!(state.observe(60, 60, row(&[("temp", Value::Float(12.0))])), None);
    }

    #[test]
    fn interval_emits_on_third_distinct_interval_stamped_with_new_key() {
        let mut state = IntervalState::new();
        state.observe(0, 0, row(&[("P0", Value::Float(10.0))]));
        state.observe(60, 60, row(&[("P0", Value::Float(12.0))]));
        // the 3rd sample opens a 3rd distinct interval; the emitted diff
        // compares the window that just closed (P0=12, closed at t=60)
        // against the window before it (P0=10, closed at t=0) — the
        // brand new sample (P0=15) only opens the next window and isn't
        // part of this emission.
        let diff = state.observe(120, 120, row(&[("P0", Value::Float(15.0))])).unwrap();
        assert_eq!(diff.get("interval_boundary"), Some(&Value::Text(format_boundary(120))));
        assert_eq!(diff.get("P0"), Some(&Value::Float(2.0)));
        assert_eq!(diff.get("start_P0_value"), Some(&Value::Float(10.0)));
        assert_eq!(diff.get("end_P0_value"), Some(&Value::Float(12.0)));
    }

    #[test]
    fn consecutive_diff_copies_metadata_fields_through_unchanged() {
        let mut state = ConsecutiveState::new();
        state.diff(&row(&[
            ("DeviceID", Value::Text("103".into())),
            ("Date", Value::Text("20240101".into())),
            ("Time", Value::Text("120000".into())),
            ("P0", Value::Float(20.0)),
        ]));
        let diff = state
            .diff(&row(&[
                ("DeviceID", Value::Text("103".into())),
                ("Date", Value::Text("20240101".into())),
                ("Time", Value::Text("120100".into())),
                ("P0", Value::Float(23.0)),
            ]))
            .unwrap();
        assert_eq!(diff.get("DeviceID"), Some(&Value::Text("103".into())));
        assert_eq!(diff.get("Date"), Some(&Value::Text("20240101".into())));
        assert_eq!(diff.get("Time"), Some(&Value::Text("120100".into())));
        assert_eq!(diff.get("P0"), Some(&Value::Float(3.0)));
    }

    #[test]
    fn build_interval_row_copies_metadata_from_triggering_sample_and_scopes_to_p0() {
        let mut state = IntervalState::new();
        state.observe(
            0,
            0,
            row(&[("DeviceID", Value::Text("103".into())), ("P0", Value::Float(10.0))]),
        );
        state.observe(
            60,
            60,
            row(&[("DeviceID", Value::Text("103".into())), ("P0", Value::Float(12.0))]),
        );
        let diff = state
            .observe(
                120,
                120,
                row(&[
                    ("DeviceID", Value::Text("103".into())),
                    ("Time", Value::Text("120200".into())),
                    ("P0", Value::Float(15.0)),
                ]),
            )
            .unwrap();
        assert_eq!(diff.get("DeviceID"), Some(&Value::Text("103".into())));
        assert_eq!(diff.get("Time"), Some(&Value::Text("120200".into())));
        assert_eq!(diff.get("start_DeviceID_value"), None);
        assert_eq!(diff.get("start_Time_value"), None);
        assert_eq!(diff.get("P0"), Some(&Value::Float(2.0)));
    }

    #[test]
    fn find_hhmmss_extracts_a_plausible_time_run() {
        assert_eq!(find_hhmmss("120000"), Some((12, 0, 0)));
        assert_eq!(find_hhmmss("prefix120000suffix"), Some((12, 0, 0)));
        assert_eq!(find_hhmmss("no digits here"), None);
    }

    #[test]
    fn find_hhmmss_rejects_out_of_range_runs() {
        assert_eq!(find_hhmmss("999999"), None);
    }

    #[test]
    fn extract_time_of_day_falls_through_fields_until_one_parses() {
        let r = row(&[("Time", Value::Text("120000".into())), ("ts", Value::Text("not-a-time".into()))]);
        assert_eq!(extract_time_of_day(&r), Some((12, 0, 0)));
    }

    #[test]
    fn interval_last_sample_in_a_window_wins() {
        let mut state = IntervalState::new();
        state.observe(0, 0, row(&[("temp", Value::Float(10.0))]));
        state.observe(60, 60, row(&[("temp", Value::Float(100.0))]));
        state.observe(65, 65, row(&[("temp", Value::Float(12.0))])); // overwrites within window
        let diff = state.observe(120, 120, row(&[("temp", Value::Float(15.0))])).unwrap();
        assert_eq!(diff.get("temp"), Some(&Value::Float(2.0)));
    }

    #[test]
    fn interval_emission_carries_start_and_end_columns_per_field() {
        // 5-minute buckets: samples at :00:30, :02:10 land in the same
        // bucket; :06:15 opens the next one; :11:05 opens the one after,
        // which is where emission starts.
        let f = 300;
        let mut state = IntervalState::new();
        state.observe(interval_key(30, f), 30, row(&[("P0", Value::Float(100.0))]));
        state.observe(interval_key(130, f), 130, row(&[("P0", Value::Float(110.0))]));
        state.observe(interval_key(375, f), 375, row(&[("P0", Value::Float(150.0))]));
        let diff = state.observe(interval_key(665, f), 665, row(&[("P0", Value::Float(200.0))])).unwrap();
        assert_eq!(diff.get("start_P0_value"), Some(&Value::Float(110.0)));
        assert_eq!(diff.get("end_P0_value"), Some(&Value::Float(150.0)));
        assert_eq!(diff.get("P0"), Some(&Value::Float(40.0)));
    }
}
