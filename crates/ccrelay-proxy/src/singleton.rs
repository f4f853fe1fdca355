//! One proxy per port, shared between launchers.
//!
//! Two records live in the state directory:
//! - `proxy.lock`: the owning process ID as bare text
//! - `proxy.session.json`: `{pid, url, apiKey}`, readable only by the owner,
//!   so a second launcher can reuse the running proxy's credential
//!
//! The records are claimed as soon as the port is bound, before the initial
//! health checks, so a launcher that finds the port busy during startup sees
//! a lock and waits for the owner to answer.

use crate::error::{ProxyError, Result};
use crate::status::ProxyStatus;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

pub const LOCK_FILE: &str = "proxy.lock";
pub const SESSION_FILE: &str = "proxy.session.json";

/// How long a busy port may go without a lock record before it counts as
/// foreign. Covers the gap between another launcher binding and claiming.
pub const DEFAULT_CLAIM_WAIT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    pid: u32,
    url: String,
    api_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub pid: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeaseGrant {
    pub lease: u64,
}

/// A proxy started by another launcher that is still running.
#[derive(Debug)]
pub struct SharedProxy {
    pid: u32,
    url: String,
    api_key: SecretString,
    lease: Option<u64>,
    client: reqwest::Client,
}

impl SharedProxy {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    pub fn lease(&self) -> Option<u64> {
        self.lease
    }

    /// Query the running proxy's `/status` route.
    pub async fn fetch_status(&self) -> Result<ProxyStatus> {
        let response = self
            .client
            .get(format!("{}/status", self.url))
            .header("x-api-key", self.api_key.expose_secret())
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<ProxyStatus>().await?)
    }

    /// Poll `/health` until the owner serves it. An owner still running its
    /// initial health checks holds connections in the listen backlog.
    pub async fn wait_ready(&self, within: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + within;
        let url = format!("{}/health", self.url);
        loop {
            let last_error = match tokio::time::timeout_at(deadline, self.client.get(&url).send()).await {
                Ok(Ok(response)) if response.status().is_success() => return Ok(()),
                Ok(Ok(response)) => format!("status {}", response.status().as_u16()),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("no answer within {}ms", within.as_millis()),
            };
            if tokio::time::Instant::now() >= deadline {
                return Err(ProxyError::Unresponsive {
                    url: self.url.clone(),
                    message: last_error,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Register this process with the owner so it keeps serving until
    /// [`SharedProxy::release_lease`].
    pub async fn acquire_lease(&mut self) -> Result<u64> {
        let grant: LeaseGrant = self
            .client
            .post(format!("{}/leases", self.url))
            .header("x-api-key", self.api_key.expose_secret())
            .json(&LeaseRequest {
                pid: std::process::id(),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        self.lease = Some(grant.lease);
        debug!(lease = grant.lease, url = %self.url, "lease acquired");
        Ok(grant.lease)
    }

    pub async fn release_lease(&mut self) -> Result<()> {
        let Some(lease) = self.lease.take() else {
            return Ok(());
        };
        self.client
            .delete(format!("{}/leases/{}", self.url, lease))
            .header("x-api-key", self.api_key.expose_secret())
            .send()
            .await?
            .error_for_status()?;
        debug!(lease, "lease released");
        Ok(())
    }
}

/// Outcome of looking at the configured port.
#[derive(Debug)]
pub enum Occupancy {
    /// Port was free; the listener is already bound to it.
    Vacant(TcpListener),
    Reuse(SharedProxy),
}

/// Removes the lock and session records on drop, if they still name this
/// process.
#[derive(Debug)]
pub struct LockGuard {
    lock_path: PathBuf,
    session_path: PathBuf,
    pid: u32,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if read_lock_pid(&self.lock_path) != Some(self.pid) {
            debug!("lock record was taken over, leaving it in place");
            return;
        }
        for path in [&self.session_path, &self.lock_path] {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove proxy record");
                }
            }
        }
        debug!("proxy lock released");
    }
}

#[derive(Debug, Clone)]
pub struct SingletonCoordinator {
    state_dir: PathBuf,
    host: String,
    port: u16,
    claim_wait: Duration,
}

impl SingletonCoordinator {
    pub fn new(state_dir: impl Into<PathBuf>, host: impl Into<String>, port: u16) -> Self {
        Self {
            state_dir: state_dir.into(),
            host: host.into(),
            port,
            claim_wait: DEFAULT_CLAIM_WAIT,
        }
    }

    pub fn with_claim_wait(mut self, claim_wait: Duration) -> Self {
        self.claim_wait = claim_wait;
        self
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join(LOCK_FILE)
    }

    pub fn session_path(&self) -> PathBuf {
        self.state_dir.join(SESSION_FILE)
    }

    /// Decide between starting a proxy and reusing one.
    ///
    /// A free port discards any stale records. An occupied port is only
    /// reusable when the lock names a live process and its session record is
    /// readable. A busy port without such records is re-checked for up to the
    /// claim wait before it is reported as held by a foreign process.
    pub async fn inspect(&self) -> Result<Occupancy> {
        let deadline = tokio::time::Instant::now() + self.claim_wait;
        loop {
            match TcpListener::bind((self.host.as_str(), self.port)) {
                Ok(listener) => {
                    self.discard_records();
                    return Ok(Occupancy::Vacant(listener));
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    if let Some(shared) = self.running()? {
                        info!(pid = shared.pid, url = %shared.url, "reusing running proxy");
                        return Ok(Occupancy::Reuse(shared));
                    }
                }
                Err(e) => return Err(e.into()),
            }

            if tokio::time::Instant::now() >= deadline {
                if read_lock_pid(&self.lock_path()).is_some_and(|pid| !process_alive(pid)) {
                    self.discard_records();
                }
                return Err(ProxyError::PortInUse { port: self.port });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// The proxy named by the records, if its process is alive. Does not touch
    /// the port.
    pub fn running(&self) -> Result<Option<SharedProxy>> {
        let Some(pid) = read_lock_pid(&self.lock_path()) else {
            return Ok(None);
        };
        if !process_alive(pid) {
            debug!(pid, "lock names a dead process");
            return Ok(None);
        }

        let session = match fs::read_to_string(self.session_path()) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: SessionRecord = match serde_json::from_str(&session) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "unreadable session record");
                return Ok(None);
            }
        };
        if record.pid != pid {
            return Ok(None);
        }

        Ok(Some(SharedProxy {
            pid,
            url: record.url,
            api_key: SecretString::from(record.api_key),
            lease: None,
            client: reqwest::Client::new(),
        }))
    }

    /// Record this process as the proxy owner.
    pub fn claim(&self, url: &str, api_key: &str) -> Result<LockGuard> {
        let pid = std::process::id();
        let session = SessionRecord {
            pid,
            url: url.to_string(),
            api_key: api_key.to_string(),
        };
        let session_json = serde_json::to_vec_pretty(&session)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        // Session first, so a lock is never visible without its credential.
        write_atomic(&self.session_path(), &session_json, 0o600)?;
        write_atomic(&self.lock_path(), pid.to_string().as_bytes(), 0o644)?;
        info!(pid, lock = %self.lock_path().display(), "proxy lock claimed");

        Ok(LockGuard {
            lock_path: self.lock_path(),
            session_path: self.session_path(),
            pid,
        })
    }

    fn discard_records(&self) {
        for path in [self.lock_path(), self.session_path()] {
            if fs::remove_file(&path).is_ok() {
                debug!(path = %path.display(), "discarded stale proxy record");
            }
        }
    }
}

fn read_lock_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
pub(crate) fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // EPERM still means the process exists.
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
pub(crate) fn process_alive(pid: u32) -> bool {
    pid == std::process::id()
}

/// Write to a sibling temp file, fsync, then rename over `path`.
fn write_atomic(path: &Path, content: &[u8], mode: u32) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent)?;

    let temp_path = path.with_file_name(format!(
        ".{}.tmp.{}",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id()
    ));

    {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        opts.mode(mode);
        #[cfg(not(unix))]
        let _ = mode;

        let mut file = opts.open(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    fs::rename(&temp_path, path)?;

    #[cfg(unix)]
    {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // Far above any kernel pid_max.
    const DEAD_PID: u32 = 999_999_999;

    fn occupied_port() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_vacant_port_discards_stale_records() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(LOCK_FILE), DEAD_PID.to_string()).unwrap();
        fs::write(dir.path().join(SESSION_FILE), "{}").unwrap();

        let coordinator = SingletonCoordinator::new(dir.path(), "127.0.0.1", 0);
        match coordinator.inspect().await.unwrap() {
            Occupancy::Vacant(listener) => assert!(listener.local_addr().is_ok()),
            other => panic!("expected vacant, got {:?}", other),
        }
        assert!(!dir.path().join(LOCK_FILE).exists());
        assert!(!dir.path().join(SESSION_FILE).exists());
    }

    #[tokio::test]
    async fn test_live_owner_is_reused() {
        let dir = tempdir().unwrap();
        let (_held, port) = occupied_port();
        let coordinator = SingletonCoordinator::new(dir.path(), "127.0.0.1", port);
        let _guard = coordinator
            .claim(&format!("http://127.0.0.1:{}", port), "ccr-abc")
            .unwrap();

        match coordinator.inspect().await.unwrap() {
            Occupancy::Reuse(shared) => {
                assert_eq!(shared.pid(), std::process::id());
                assert_eq!(shared.lease(), None);
                assert_eq!(shared.api_key(), "ccr-abc");
                assert_eq!(shared.url(), format!("http://127.0.0.1:{}", port));
            }
            other => panic!("expected reuse, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_foreign_process_on_port_is_port_in_use() {
        let dir = tempdir().unwrap();
        let (_held, port) = occupied_port();
        fs::write(dir.path().join(LOCK_FILE), DEAD_PID.to_string()).unwrap();

        let coordinator = SingletonCoordinator::new(dir.path(), "127.0.0.1", port)
            .with_claim_wait(Duration::from_millis(100));
        let err = coordinator.inspect().await.unwrap_err();
        assert!(matches!(err, ProxyError::PortInUse { port: p } if p == port));
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn test_missing_lock_on_occupied_port_is_port_in_use() {
        let dir = tempdir().unwrap();
        let (_held, port) = occupied_port();
        let coordinator = SingletonCoordinator::new(dir.path(), "127.0.0.1", port)
            .with_claim_wait(Duration::from_millis(100));
        assert!(matches!(
            coordinator.inspect().await,
            Err(ProxyError::PortInUse { .. })
        ));
    }

    #[tokio::test]
    async fn test_lock_claimed_while_waiting_is_reused() {
        let dir = tempdir().unwrap();
        let (_held, port) = occupied_port();
        let coordinator = SingletonCoordinator::new(dir.path(), "127.0.0.1", port);

        let owner = coordinator.clone();
        let claimer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            owner.claim(&format!("http://127.0.0.1:{}", port), "ccr-late").unwrap()
        });

        match coordinator.inspect().await.unwrap() {
            Occupancy::Reuse(shared) => assert_eq!(shared.api_key(), "ccr-late"),
            other => panic!("expected reuse, got {:?}", other),
        }
        drop(claimer.await.unwrap());
    }

    #[test]
    fn test_claim_writes_records_and_guard_removes_them() {
        let dir = tempdir().unwrap();
        let coordinator = SingletonCoordinator::new(dir.path().join("nested"), "127.0.0.1", 0);
        let guard = coordinator.claim("http://127.0.0.1:8788", "ccr-key").unwrap();

        let lock = fs::read_to_string(coordinator.lock_path()).unwrap();
        assert_eq!(lock, std::process::id().to_string());
        let session: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(coordinator.session_path()).unwrap()).unwrap();
        assert_eq!(session["apiKey"], "ccr-key");
        assert_eq!(session["url"], "http://127.0.0.1:8788");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(coordinator.session_path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        drop(guard);
        assert!(!coordinator.lock_path().exists());
        assert!(!coordinator.session_path().exists());
    }

    #[test]
    fn test_guard_leaves_records_taken_over_by_another_process() {
        let dir = tempdir().unwrap();
        let coordinator = SingletonCoordinator::new(dir.path(), "127.0.0.1", 0);
        let guard = coordinator.claim("http://127.0.0.1:8788", "ccr-key").unwrap();
        fs::write(coordinator.lock_path(), "1").unwrap();

        drop(guard);
        assert!(coordinator.lock_path().exists());
    }

    #[test]
    fn test_running_ignores_dead_owner() {
        let dir = tempdir().unwrap();
        let coordinator = SingletonCoordinator::new(dir.path(), "127.0.0.1", 0);
        fs::write(coordinator.lock_path(), DEAD_PID.to_string()).unwrap();
        assert!(coordinator.running().unwrap().is_none());
    }
}
