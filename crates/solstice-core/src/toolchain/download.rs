//! Local compiler cache with single-flight downloads.
//!
//! Concurrent `ensure` calls for one version share a single download: the
//! first caller registers an in-flight entry and performs the fetch, later
//! callers wait on the entry's condition variable. The entry is removed when
//! the download finishes either way, so a failed download is retried by the
//! next caller rather than cached.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::errors::{SolsticeError, SolsticeResult};
use crate::toolchain::version::Version;

const BINARY_PREFIX: &str = "solidity-";

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// Transport seam: copy the body at `url` into `dest`, returning the number
/// of bytes written.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str, dest: &mut dyn Write) -> Result<u64, String>;
}

pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .build();
        Self { agent }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &mut dyn Write) -> Result<u64, String> {
        let response = match self.agent.get(url).call() {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, _)) => {
                return Err(format!("GET {url} returned status {code}"));
            }
            Err(ureq::Error::Transport(error)) => {
                return Err(format!("GET {url} failed: {error}"));
            }
        };
        let mut reader = response.into_reader();
        std::io::copy(&mut reader, dest).map_err(|e| format!("reading {url}: {e}"))
    }
}

// ---------------------------------------------------------------------------
// In-flight registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct InFlight {
    outcome: Mutex<Option<Result<(), String>>>,
    done: Condvar,
}

impl InFlight {
    fn wait(&self) -> Result<(), String> {
        let mut outcome = self.outcome.lock();
        while outcome.is_none() {
            self.done.wait(&mut outcome);
        }
        outcome.clone().unwrap_or(Ok(()))
    }

    fn publish(&self, result: Result<(), String>) {
        let mut outcome = self.outcome.lock();
        if outcome.is_none() {
            *outcome = Some(result);
        }
        self.done.notify_all();
    }
}

/// Held by the caller performing a download. Dropping it unregisters the
/// entry and wakes waiters, also when the download unwinds.
struct Leader<'a> {
    registry: &'a Mutex<HashMap<String, Arc<InFlight>>>,
    key: String,
    flight: Arc<InFlight>,
}

impl Leader<'_> {
    /// Unregister, then wake waiters with `result`. Callers arriving after
    /// the removal start a fresh flight instead of reading this outcome.
    fn finish(self, result: Result<(), String>) {
        self.registry.lock().remove(&self.key);
        self.flight.publish(result);
    }
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        let mut registry = self.registry.lock();
        if registry
            .get(&self.key)
            .is_some_and(|entry| Arc::ptr_eq(entry, &self.flight))
        {
            registry.remove(&self.key);
        }
        drop(registry);
        self.flight.publish(Err("download interrupted".to_string()));
    }
}

// ---------------------------------------------------------------------------
// ToolchainManager
// ---------------------------------------------------------------------------

pub struct ToolchainManager {
    cache_root: PathBuf,
    release_url: String,
    fetcher: Arc<dyn Fetcher>,
    in_flight: Mutex<HashMap<String, Arc<InFlight>>>,
}

impl ToolchainManager {
    pub fn new(cache_root: impl Into<PathBuf>, release_url: impl Into<String>) -> Self {
        Self::with_fetcher(cache_root, release_url, Arc::new(HttpFetcher::new()))
    }

    pub fn with_fetcher(
        cache_root: impl Into<PathBuf>,
        release_url: impl Into<String>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            cache_root: cache_root.into(),
            release_url: release_url.into(),
            fetcher,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Deterministic location of the binary for `version`.
    pub fn path(&self, version: &Version) -> PathBuf {
        self.cache_root.join(format!("{BINARY_PREFIX}{version}"))
    }

    pub fn exists(&self, version: &Version) -> bool {
        self.path(version).is_file()
    }

    pub fn release_url_for(&self, version: &Version) -> String {
        self.release_url.replace("{version}", &version.to_string())
    }

    /// Make sure the binary for `version` is present, downloading it if
    /// needed. Returns its path.
    pub fn ensure(&self, version: &Version) -> SolsticeResult<PathBuf> {
        let path = self.path(version);
        if path.is_file() {
            return Ok(path);
        }

        let key = version.to_string();
        let (flight, leader) = {
            let mut registry = self.in_flight.lock();
            // A previous leader may have finished between the check above
            // and taking the lock.
            if path.is_file() {
                return Ok(path);
            }
            match registry.get(&key) {
                Some(flight) => (Arc::clone(flight), None),
                None => {
                    let flight = Arc::new(InFlight::default());
                    registry.insert(key.clone(), Arc::clone(&flight));
                    let leader = Leader {
                        registry: &self.in_flight,
                        key: key.clone(),
                        flight: Arc::clone(&flight),
                    };
                    (flight, Some(leader))
                }
            }
        };

        let outcome = match leader {
            Some(leader) => {
                let result = self.download(version, &path);
                leader.finish(result.clone());
                result
            }
            None => {
                debug!(%version, "waiting for in-flight compiler download");
                flight.wait()
            }
        };

        outcome.map(|()| path).map_err(|reason| SolsticeError::Download {
            version: key,
            reason,
        })
    }

    /// Versions currently present in the cache, ascending.
    pub fn installed(&self) -> SolsticeResult<Vec<Version>> {
        let entries = match std::fs::read_dir(&self.cache_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(raw) = name.to_str().and_then(|n| n.strip_prefix(BINARY_PREFIX)) else {
                continue;
            };
            if let Ok(version) = Version::parse(raw) {
                versions.push(version);
            }
        }
        versions.sort();
        Ok(versions)
    }

    fn download(&self, version: &Version, dest: &Path) -> Result<(), String> {
        let url = self.release_url_for(version);
        info!(%version, %url, "downloading compiler");

        std::fs::create_dir_all(&self.cache_root)
            .map_err(|e| format!("create {}: {e}", self.cache_root.display()))?;
        // Staged inside the cache root so the final rename stays on one
        // filesystem.
        let staging = tempfile::Builder::new()
            .prefix(".download-")
            .tempdir_in(&self.cache_root)
            .map_err(|e| format!("create staging dir: {e}"))?;
        let staged = staging.path().join(format!("{BINARY_PREFIX}{version}"));

        let mut file = File::create(&staged).map_err(|e| format!("create {}: {e}", staged.display()))?;
        let bytes = self.fetcher.fetch(&url, &mut file)?;
        if bytes == 0 {
            return Err(format!("GET {url} returned an empty body"));
        }
        file.sync_all().map_err(|e| format!("sync {}: {e}", staged.display()))?;
        drop(file);

        make_executable(&staged).map_err(|e| format!("chmod {}: {e}", staged.display()))?;
        std::fs::rename(&staged, dest).map_err(|e| {
            warn!(%version, error = %e, "failed to move downloaded compiler into place");
            format!("rename onto {}: {e}", dest.display())
        })?;
        info!(%version, bytes, path = %dest.display(), "compiler installed");
        Ok(())
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    const URL: &str = "https://example.invalid/v{version}/solc";

    struct CountingFetcher {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl CountingFetcher {
        fn new(delay: Duration, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                fail,
            })
        }
    }

    impl Fetcher for CountingFetcher {
        fn fetch(&self, url: &str, dest: &mut dyn Write) -> Result<u64, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(format!("GET {url} returned status 404"));
            }
            let body = format!("#!/bin/sh\n# {url}\n");
            dest.write_all(body.as_bytes()).map_err(|e| e.to_string())?;
            Ok(body.len() as u64)
        }
    }

    #[test]
    fn path_is_named_by_version() {
        let manager = ToolchainManager::with_fetcher("/cache", URL, CountingFetcher::new(Duration::ZERO, false));
        let v = Version::new(0, 8, 5);
        assert_eq!(manager.path(&v), PathBuf::from("/cache/solidity-0.8.5"));
        assert_eq!(manager.release_url_for(&v), "https://example.invalid/v0.8.5/solc");
    }

    #[test]
    fn concurrent_ensure_downloads_once() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = CountingFetcher::new(Duration::from_millis(50), false);
        let manager = Arc::new(ToolchainManager::with_fetcher(dir.path(), URL, fetcher.clone()));
        let version = Version::new(0, 8, 5);
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    manager.ensure(&version)
                })
            })
            .collect();
        for handle in handles {
            let path = handle.join().unwrap().unwrap();
            assert!(path.is_file());
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(manager.exists(&version));
        assert!(manager.in_flight.lock().is_empty());
    }

    #[test]
    fn different_versions_download_independently() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = CountingFetcher::new(Duration::ZERO, false);
        let manager = ToolchainManager::with_fetcher(dir.path(), URL, fetcher.clone());
        manager.ensure(&Version::new(0, 8, 5)).unwrap();
        manager.ensure(&Version::new(0, 7, 6)).unwrap();
        manager.ensure(&Version::new(0, 8, 5)).unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            manager.installed().unwrap(),
            vec![Version::new(0, 7, 6), Version::new(0, 8, 5)]
        );
    }

    #[test]
    fn failed_download_leaves_no_binary_and_can_retry() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = CountingFetcher::new(Duration::ZERO, true);
        let manager = ToolchainManager::with_fetcher(dir.path(), URL, fetcher.clone());
        let version = Version::new(0, 8, 5);

        let err = manager.ensure(&version).unwrap_err();
        assert!(matches!(err, SolsticeError::Download { ref version, .. } if version == "0.8.5"));
        assert!(!manager.exists(&version));
        // no staging leftovers either
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        manager.ensure(&version).unwrap_err();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[cfg(unix)]
    #[test]
    fn downloaded_binary_is_executable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let manager =
            ToolchainManager::with_fetcher(dir.path(), URL, CountingFetcher::new(Duration::ZERO, false));
        let path = manager.ensure(&Version::new(0, 8, 5)).unwrap();
        let mode = std::fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn registered_flight_never_carries_an_outcome() {
        let registry: Mutex<HashMap<String, Arc<InFlight>>> = Mutex::new(HashMap::new());
        let flight = Arc::new(InFlight::default());
        registry.lock().insert("0.8.5".into(), Arc::clone(&flight));

        std::thread::scope(|scope| {
            let leader = Leader {
                registry: &registry,
                key: "0.8.5".into(),
                flight: Arc::clone(&flight),
            };
            let handle = scope.spawn(move || leader.finish(Err("status 503".into())));
            // a caller that can still attach must not read a stale result
            while !handle.is_finished() {
                let entries = registry.lock();
                if entries.contains_key("0.8.5") {
                    assert!(flight.outcome.lock().is_none());
                }
            }
        });

        assert!(registry.lock().is_empty());
        assert_eq!(flight.wait(), Err("status 503".to_string()));
    }

    #[test]
    fn installed_on_missing_cache_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ToolchainManager::with_fetcher(
            dir.path().join("absent"),
            URL,
            CountingFetcher::new(Duration::ZERO, false),
        );
        assert!(manager.installed().unwrap().is_empty());
    }
}
