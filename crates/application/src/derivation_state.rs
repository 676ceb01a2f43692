//! §5 concurrency model: a sharded-lock wrapper around the pure
//! [`domain::derivation`] state machines, so concurrent handler invocations
//! for distinct `(topic, device_id)` keys proceed independently while same-key
//! invocations serialize their mutations.

use chrono::{NaiveDateTime, NaiveTime, Utc};
use dashmap::DashMap;
use domain::derivation::{extract_time_of_day, interval_key, ConsecutiveState, DerivationKey, IntervalState};
use domain::value::Row;
use domain::IntervalDifferenceConfig;
use std::sync::Mutex;

/// Resolves the epoch-seconds timestamp a sample buckets into, per §4.6: an
/// `HHMMSS` run found in the row's timestamp-carrying fields, attached to
/// today's UTC date; current wall-clock time otherwise.
fn timestamp_epoch_seconds(row: &Row) -> i64 {
    match extract_time_of_day(row) {
        Some((h, m, s)) => {
            let today = Utc::now().date_naive();
            let time = NaiveTime::from_hms_opt(h, m, s).unwrap_or_default();
            NaiveDateTime::new(today, time).and_utc().timestamp()
        }
        None => Utc::now().timestamp(),
    }
}

/// Owns per-key derivation state for both substreams. One instance is shared
/// across the whole process; keys for distinct `(topic, device_id)` pairs
/// never contend with each other.
pub struct DerivationStateMap {
    shards: DashMap<DerivationKey, Mutex<(ConsecutiveState, IntervalState)>>,
}

impl DerivationStateMap {
    pub fn new() -> Self {
        Self { shards: DashMap::new() }
    }

    /// Feeds one observed row through both substreams: the consecutive-diff
    /// substream unconditionally, the interval-diff substream only when
    /// `interval_cfg` is `Some` and enabled with a positive frequency.
    /// Returns each substream's emission, if any, from this observation. The
    /// interval emission (when present) already carries its
    /// `interval_boundary` and the five `P0`-scoped interval columns — see
    /// [`IntervalState::observe`].
    pub fn observe(
        &self,
        key: DerivationKey,
        row: &Row,
        interval_cfg: Option<&IntervalDifferenceConfig>,
    ) -> (Option<Row>, Option<Row>) {
        let entry = self.shards.entry(key).or_insert_with(|| Mutex::new((ConsecutiveState::new(), IntervalState::new())));
        let mut guard = entry.lock().expect("derivation state lock poisoned");
        let (consecutive, interval) = &mut *guard;

        let consecutive_emit = consecutive.diff(row);

        let interval_emit = match interval_cfg {
            Some(cfg) if cfg.enabled && cfg.frequency_minutes > 0 => {
                let epoch = timestamp_epoch_seconds(row);
                let bucket = interval_key(epoch, cfg.frequency_minutes * 60);
                interval.observe(bucket, epoch, row.clone())
            }
            _ => None,
        };

        (consecutive_emit, interval_emit)
    }
}

impl Default for DerivationStateMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::value::Value;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn consecutive_substream_runs_even_without_interval_config() {
        let state = DerivationStateMap::new();
        let key = DerivationKey { topic: "t".into(), device_id: "d".into() };
        let (first, _) = state.observe(key.clone(), &row(&[("P0", Value::Float(10.0))]), None);
        assert_eq!(first, None);
        let (second, _) = state.observe(key, &row(&[("P0", Value::Float(12.0))]), None);
        assert_eq!(second.unwrap().get("P0"), Some(&Value::Float(2.0)));
    }

    #[test]
    fn interval_substream_is_skipped_when_disabled() {
        let state = DerivationStateMap::new();
        let key = DerivationKey { topic: "t".into(), device_id: "d".into() };
        let cfg = IntervalDifferenceConfig { enabled: false, frequency_minutes: 5 };
        let (_, interval) = state.observe(key, &row(&[("P0", Value::Float(10.0))]), Some(&cfg));
        assert_eq!(interval, None);
    }

    #[test]
    fn distinct_keys_maintain_independent_state() {
        let state = DerivationStateMap::new();
        let a = DerivationKey { topic: "t".into(), device_id: "a".into() };
        let b = DerivationKey { topic: "t".into(), device_id: "b".into() };
        state.observe(a, &row(&[("P0", Value::Float(10.0))]), None);
        let (first_b, _) = state.observe(b, &row(&[("P0", Value::Float(999.0))]), None);
        assert_eq!(first_b, None);
    }
}
