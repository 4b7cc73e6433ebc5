//! Daemon discovery: lock file + liveness probe + idempotent spawn, used by
//! any client to find or start the proxy daemon. Mirrors the teacher's
//! `utils::daemon` flow (fast-path check, spawn lock, health-checked spawn,
//! poll-for-ready) but targets the proxy's Unix socket and a lock file that
//! carries `{pid, proxy_port, sock_path}` instead of a bare pid.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::os::unix::process::CommandExt as _;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use fs2::FileExt as _;
use serde::{Deserialize, Serialize};

use crate::utils::paths;

const DEFAULT_DAEMON_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const SPAWN_HEALTH_CHECK_DELAY: Duration = Duration::from_millis(200);

/// Contents of `proxy/daemon.lock`, per the external-interfaces daemon IPC
/// contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonLock {
    /// PID of the daemon process.
    pub pid: u32,
    /// Port the proxy is listening on.
    pub proxy_port: u16,
    /// Path to the control-channel Unix socket.
    pub sock_path: PathBuf,
}

impl DaemonLock {
    fn spawn_lock_path(state_root: &Path) -> PathBuf {
        state_root.join("proxy").join("spawn.lock")
    }

    /// Read and parse an existing lock file, if present.
    pub fn read(state_root: &Path) -> Option<Self> {
        let bytes = std::fs::read(paths::daemon_lock_path(state_root)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Atomically persist this lock, overwriting any stale one.
    pub fn write(&self, state_root: &Path) -> anyhow::Result<()> {
        let path = paths::daemon_lock_path(state_root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(self)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Whether the daemon is actually responsive, by attempting a connection to
/// its control socket rather than just checking the lock file exists (a
/// stale socket from a crashed daemon would fail here).
#[must_use]
pub fn is_daemon_running(state_root: &Path) -> bool {
    use std::os::unix::net::UnixStream;
    UnixStream::connect(paths::daemon_socket_path(state_root)).is_ok()
}

struct SpawnLockGuard {
    _file: File,
    path: PathBuf,
}

impl Drop for SpawnLockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn acquire_spawn_lock(state_root: &Path) -> anyhow::Result<SpawnLockGuard> {
    let lock_path = DaemonLock::spawn_lock_path(state_root);
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new().write(true).create(true).truncate(true).open(&lock_path)?;
    file.try_lock_exclusive().map_err(|_| anyhow::anyhow!("another process is already spawning the daemon"))?;

    let mut file = file;
    writeln!(file, "{}", std::process::id())?;

    Ok(SpawnLockGuard { _file: file, path: lock_path })
}

fn spawn_daemon_process() -> anyhow::Result<Child> {
    let exe_path = std::env::current_exe()?;
    let child = Command::new(&exe_path)
        .args(["proxy", "serve"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()?;
    Ok(child)
}

/// Spawn the daemon, checking that it did not crash immediately.
pub fn spawn_daemon() -> anyhow::Result<()> {
    let mut child = spawn_daemon_process()?;
    std::thread::sleep(SPAWN_HEALTH_CHECK_DELAY);
    match child.try_wait()? {
        Some(status) => anyhow::bail!("daemon process exited immediately with status: {status}"),
        None => Ok(()),
    }
}

/// Idempotent: find a live daemon or spawn one, waiting until its control
/// socket accepts connections.
pub async fn ensure_daemon_running(state_root: &Path) -> anyhow::Result<()> {
    if is_daemon_running(state_root) {
        return Ok(());
    }

    let _lock = match acquire_spawn_lock(state_root) {
        Ok(lock) => lock,
        Err(_) => {
            tracing::info!("another process is spawning the daemon, waiting");
            return wait_for_daemon(state_root, DEFAULT_DAEMON_TIMEOUT).await;
        }
    };

    if is_daemon_running(state_root) {
        return Ok(());
    }

    tracing::info!("proxy daemon not running, spawning");
    spawn_daemon()?;
    wait_for_daemon(state_root, DEFAULT_DAEMON_TIMEOUT).await
}

/// Poll the control socket until it accepts connections or `timeout` elapses.
pub async fn wait_for_daemon(state_root: &Path, timeout: Duration) -> anyhow::Result<()> {
    use tokio::net::UnixStream;

    let sock_path = paths::daemon_socket_path(state_root);
    let start = std::time::Instant::now();

    while start.elapsed() < timeout {
        if UnixStream::connect(&sock_path).await.is_ok() {
            tracing::info!(elapsed_ms = start.elapsed().as_millis() as u64, "daemon is ready");
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    anyhow::bail!("daemon not ready after {}ms", timeout.as_millis())
}
