//! §4.1 ConfigSource: loads the YAML configuration tree into an immutable
//! [`domain::Snapshot`], polls the backing file for changes, and fans out
//! atomic snapshot swaps to registered subscribers.

use domain::Snapshot;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// A subscriber callback invoked with every new snapshot after a successful
/// reload. Boxed so the supervisor can register closures that capture state
/// (e.g. "rebuild broker subscriptions").
pub type ReloadCallback = Box<dyn Fn(Arc<Snapshot>) + Send + Sync>;

fn default_poll_interval() -> Duration {
    Duration::from_secs(15)
}

/// Parses a YAML file at `path` layered with `APP_`-prefixed environment
/// variable overrides (double-underscore separated, e.g.
/// `APP_DATABASE__MAX_CONNECTIONS=20`) into a [`Snapshot`], stamping it with
/// `version`. The caller decides what `version` means (a monotonic reload
/// counter here).
fn parse_snapshot(path: &Path, version: u64) -> anyhow::Result<Snapshot> {
    let raw = std::fs::read_to_string(path)?;
    // `config::File::from_str` parses eagerly, so a malformed file surfaces
    // here rather than at `build()` time; `serde_yaml` gives a clearer error
    // than the `config` crate's own YAML backend would.
    let _: serde_yaml::Value = serde_yaml::from_str(&raw)?;

    let settings = config::Config::builder()
        .add_source(config::File::from_str(&raw, config::FileFormat::Yaml))
        .add_source(config::Environment::with_prefix("APP").separator("__"))
        .build()?;
    let snapshot: Snapshot = settings.try_deserialize()?;
    Ok(snapshot.finalize(version))
}

/// Owns the current configuration snapshot and the poll loop that keeps it
/// fresh. `current()` is a cheap `Arc` clone; readers never see a torn or
/// partially-applied snapshot. Parse failures at reload time are logged and
/// leave the previous snapshot in place — subscribers are never invoked with
/// a failed reload, only with a successfully parsed one.
pub struct ConfigSource {
    path: PathBuf,
    poll_interval: Duration,
    current: RwLock<Arc<Snapshot>>,
    version: AtomicU64,
    last_mtime: RwLock<Option<SystemTime>>,
    subscribers: RwLock<Vec<ReloadCallback>>,
}

impl ConfigSource {
    /// Loads the initial snapshot synchronously. Startup-time parse failures
    /// are fatal — there is no previous snapshot to fall back to yet.
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let snapshot = parse_snapshot(&path, 0)
            .map_err(|e| anyhow::anyhow!("failed to load configuration from {:?}: {e}", path))?;
        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

        Ok(Self {
            path,
            poll_interval: default_poll_interval(),
            current: RwLock::new(Arc::new(snapshot)),
            version: AtomicU64::new(0),
            last_mtime: RwLock::new(mtime),
            subscribers: RwLock::new(Vec::new()),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// A cheap, lock-free-safe read of the current snapshot.
    pub fn current(&self) -> Arc<Snapshot> {
        self.current.read().expect("config lock poisoned").clone()
    }

    /// Registers a callback fired with every new snapshot after a successful
    /// reload. Never fired with the initial, `load`-time snapshot — only on
    /// subsequent changes.
    pub fn subscribe(&self, callback: ReloadCallback) {
        self.subscribers.write().expect("config lock poisoned").push(callback);
    }

    /// Runs the poll loop forever: checks the file's mtime every
    /// `poll_interval`, and on change, reparses and atomically swaps in the
    /// new snapshot, then notifies subscribers. Intended to be spawned as its
    /// own task; never returns under normal operation.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.poll_interval);
        loop {
            ticker.tick().await;
            self.poll_once();
        }
    }

    /// One poll cycle, split out so tests can drive it without a timer.
    pub fn poll_once(&self) {
        let mtime = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "could not stat config file; keeping current snapshot");
                return;
            }
        };

        let changed = {
            let last = self.last_mtime.read().expect("config lock poisoned");
            last.map(|last| last != mtime).unwrap_or(true)
        };
        if !changed {
            debug!(path = %self.path.display(), "config unchanged");
            return;
        }

        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        match parse_snapshot(&self.path, version) {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                *self.current.write().expect("config lock poisoned") = snapshot.clone();
                *self.last_mtime.write().expect("config lock poisoned") = Some(mtime);
                info!(path = %self.path.display(), version, "configuration reloaded");
                self.notify(snapshot);
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "configuration reload failed; keeping previous snapshot");
            }
        }
    }

    /// Fires every subscriber with the new snapshot. A panicking subscriber
    /// is caught and logged so it never prevents the rest from firing.
    fn notify(&self, snapshot: Arc<Snapshot>) {
        let subscribers = self.subscribers.read().expect("config lock poisoned");
        for (i, callback) in subscribers.iter().enumerate() {
            let snapshot = snapshot.clone();
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(snapshot))) {
                error!(subscriber = i, ?panic, "config reload subscriber panicked; continuing with remaining subscribers");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn write_temp_yaml(contents: &str) -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!("ingest-config-test-{}-{n}.yaml", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    fn minimal_yaml() -> &'static str {
        r#"
mqtt_servers: {}
database:
  uri: "postgres://localhost/ingest"
routes: []
patterns: []
"#
    }

    #[test]
    fn load_parses_a_valid_snapshot() {
        let path = write_temp_yaml(minimal_yaml());
        let source = ConfigSource::load(&path).unwrap();
        assert!(source.current().routes.is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn poll_once_is_a_noop_when_mtime_unchanged() {
        let path = write_temp_yaml(minimal_yaml());
        let source = ConfigSource::load(&path).unwrap();
        let before = source.current().version;
        source.poll_once();
        assert_eq!(source.current().version, before);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn notify_isolates_a_panicking_subscriber() {
        let path = write_temp_yaml(minimal_yaml());
        let source = ConfigSource::load(&path).unwrap();
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_clone = fired.clone();
        source.subscribe(Box::new(|_| panic!("boom")));
        source.subscribe(Box::new(move |_| {
            fired_clone.store(true, Ordering::SeqCst);
        }));
        source.notify(source.current());
        assert!(fired.load(Ordering::SeqCst));
        let _ = std::fs::remove_file(&path);
    }
}
