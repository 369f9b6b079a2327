//! Memory-first persistence for gateway state (credentials, usage, caches).
//!
//! `ResilientWriter::write` never fails: the in-memory cell is always updated,
//! and a failed disk write parks the payload in a retry buffer that a
//! background ticker drains every 30 seconds. The final flush runs at process
//! shutdown.

use fs2::FileExt;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const RETRY_INTERVAL: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// State layout
// ---------------------------------------------------------------------------

/// Well-known locations of persisted state under the gateway's data root.
#[derive(Debug, Clone)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default root: `~/.aigate`.
    pub fn default_root() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".aigate"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Per-provider usage store: `usage/usage_<provider>.json`.
    pub fn usage_file(&self, provider: &str) -> PathBuf {
        self.root.join("usage").join(format!("usage_{provider}.json"))
    }

    /// OAuth credential file: `oauth_creds/<provider>_oauth_<n>.json`.
    pub fn oauth_cred_file(&self, provider: &str, index: u32) -> PathBuf {
        self.root
            .join("oauth_creds")
            .join(format!("{provider}_oauth_{index}.json"))
    }

    pub fn oauth_creds_dir(&self) -> PathBuf {
        self.root.join("oauth_creds")
    }

    /// Adapter-owned scratch state: `cache/<provider>/...`.
    pub fn cache_dir(&self, provider: &str) -> PathBuf {
        self.root.join("cache").join(provider)
    }
}

// ---------------------------------------------------------------------------
// Resilient writer
// ---------------------------------------------------------------------------

struct WriterInner {
    /// Latest payload per path. Readers see this even when disk is broken.
    cells: Mutex<HashMap<PathBuf, serde_json::Value>>,
    /// Payloads whose last disk write failed, awaiting the retry ticker.
    pending: Mutex<HashMap<PathBuf, serde_json::Value>>,
    healthy: AtomicBool,
    secure: bool,
}

#[derive(Clone)]
pub struct ResilientWriter {
    inner: Arc<WriterInner>,
}

impl ResilientWriter {
    /// `secure` narrows file permissions to owner read/write after rename.
    pub fn new(secure: bool) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                cells: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                healthy: AtomicBool::new(true),
                secure,
            }),
        }
    }

    /// Whether the most recent disk attempt succeeded.
    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::Relaxed)
    }

    /// Latest in-memory payload for a path, if any write has happened.
    pub fn cached(&self, path: &Path) -> Option<serde_json::Value> {
        self.inner.cells.lock().expect("writer cells lock").get(path).cloned()
    }

    /// Read a path, preferring the in-memory cell over disk.
    pub fn load(&self, path: &Path) -> Option<serde_json::Value> {
        if let Some(value) = self.cached(path) {
            return Some(value);
        }
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Persist `value` at `path`. Total: the in-memory cell always updates,
    /// and a disk failure parks the payload for the retry ticker. The encode
    /// and filesystem work run on a blocking worker.
    pub async fn write(&self, path: impl Into<PathBuf>, value: serde_json::Value) {
        let path = path.into();
        self.inner
            .cells
            .lock()
            .expect("writer cells lock")
            .insert(path.clone(), value.clone());

        let inner = Arc::clone(&self.inner);
        let join = tokio::task::spawn_blocking(move || {
            WriterInner::commit(&inner, &path, &value);
        })
        .await;
        if let Err(e) = join {
            tracing::error!(error = %e, "state writer worker panicked");
        }
    }

    /// Synchronous variant for shutdown paths where spawning is unavailable.
    pub fn write_blocking(&self, path: impl Into<PathBuf>, value: serde_json::Value) {
        let path = path.into();
        self.inner
            .cells
            .lock()
            .expect("writer cells lock")
            .insert(path.clone(), value.clone());
        WriterInner::commit(&self.inner, &path, &value);
    }

    /// Retry every parked payload once. Returns the number still pending.
    pub fn flush(&self) -> usize {
        let parked: Vec<(PathBuf, serde_json::Value)> = {
            let mut pending = self.inner.pending.lock().expect("writer pending lock");
            pending.drain().collect()
        };
        for (path, value) in parked {
            WriterInner::commit(&self.inner, &path, &value);
        }
        self.inner.pending.lock().expect("writer pending lock").len()
    }

    /// Background ticker that retries parked payloads every 30 seconds.
    pub fn spawn_retry_ticker(&self) -> tokio::task::JoinHandle<()> {
        let writer = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETRY_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let retry_writer = writer.clone();
                let remaining = tokio::task::spawn_blocking(move || retry_writer.flush())
                    .await
                    .unwrap_or(0);
                if remaining > 0 {
                    tracing::warn!(remaining, "state writes still pending after retry");
                }
            }
        })
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().expect("writer pending lock").len()
    }
}

impl WriterInner {
    fn commit(inner: &Arc<WriterInner>, path: &Path, value: &serde_json::Value) {
        match atomic_write(path, value, inner.secure) {
            Ok(()) => {
                inner.healthy.store(true, Ordering::Relaxed);
                inner.pending.lock().expect("writer pending lock").remove(path);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "state write failed, buffering for retry");
                inner.healthy.store(false, Ordering::Relaxed);
                inner
                    .pending
                    .lock()
                    .expect("writer pending lock")
                    .insert(path.to_path_buf(), value.clone());
            }
        }
    }
}

/// Atomic write: temp sibling, fsync, rename, under an advisory sibling lock.
/// JSON key order is stable (serde_json maps are ordered), so repeated writes
/// of equal state produce identical bytes.
fn atomic_write(path: &Path, value: &serde_json::Value, secure: bool) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("state path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)?;
    #[cfg(unix)]
    if secure {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
    }

    // A sibling lock file (avoids locking the state file itself during the
    // atomic replace).
    let lock_path = path.with_extension("json.lock");
    let lock_file = fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&lock_path)?;
    lock_file.lock_exclusive()?;

    let result = (|| -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        let tmp_path = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        #[cfg(unix)]
        if secure {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600));
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    let _ = fs2::FileExt::unlock(&lock_file);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn write_persists_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage").join("usage_openai.json");
        let writer = ResilientWriter::new(true);

        writer.write(&path, json!({"b": 2, "a": 1})).await;

        assert!(writer.is_healthy());
        assert_eq!(writer.pending_count(), 0);
        let on_disk: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, json!({"a": 1, "b": 2}));
        assert_eq!(writer.cached(&path), Some(json!({"a": 1, "b": 2})));
    }

    #[tokio::test]
    async fn failed_write_parks_payload_and_flush_recovers() {
        let dir = tempfile::tempdir().unwrap();
        // A file where a directory is expected makes create_dir_all fail.
        let blocker = dir.path().join("usage");
        fs::write(&blocker, b"not a dir").unwrap();
        let path = blocker.join("usage_openai.json");

        let writer = ResilientWriter::new(false);
        writer.write(&path, json!({"n": 1})).await;

        assert!(!writer.is_healthy());
        assert_eq!(writer.pending_count(), 1);
        // Memory still serves the latest payload.
        assert_eq!(writer.load(&path), Some(json!({"n": 1})));

        fs::remove_file(&blocker).unwrap();
        let remaining = writer.flush();
        assert_eq!(remaining, 0);
        assert!(writer.is_healthy());
        assert!(path.exists());
    }

    #[test]
    fn state_paths_layout() {
        let paths = StatePaths::new("/data/aigate");
        assert_eq!(
            paths.usage_file("google-oauth"),
            PathBuf::from("/data/aigate/usage/usage_google-oauth.json")
        );
        assert_eq!(
            paths.oauth_cred_file("google-oauth", 2),
            PathBuf::from("/data/aigate/oauth_creds/google-oauth_oauth_2.json")
        );
        assert_eq!(
            paths.cache_dir("openai"),
            PathBuf::from("/data/aigate/cache/openai")
        );
    }

    #[tokio::test]
    async fn deterministic_bytes_for_equal_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let writer = ResilientWriter::new(false);

        writer.write(&path, json!({"z": 1, "a": {"y": 2, "b": 3}})).await;
        let first = fs::read(&path).unwrap();
        writer.write(&path, json!({"a": {"b": 3, "y": 2}, "z": 1})).await;
        let second = fs::read(&path).unwrap();
        assert_eq!(first, second);
    }
}
