//! On-disk layout under the user's state root (default `~/.moat/`), per the
//! external-interfaces on-disk layout table.

use std::path::PathBuf;

/// The default state root, `~/.moat`.
///
/// # Panics
///
/// Panics if the home directory cannot be determined.
#[must_use]
pub fn default_state_root() -> PathBuf {
    #[expect(clippy::expect_used, reason = "home directory is required for operation")]
    dirs::home_dir().expect("could not find home directory").join(".moat")
}

/// Directory holding one encrypted `<provider>.enc` file per credential.
#[must_use]
pub fn credentials_dir(state_root: &std::path::Path) -> PathBuf {
    state_root.join("credentials")
}

/// Directory holding the proxy's root CA (`cert.pem` / `key.pem`) and leaf
/// cache.
#[must_use]
pub fn proxy_ca_dir(state_root: &std::path::Path) -> PathBuf {
    state_root.join("proxy").join("ca")
}

/// Daemon discovery lock file, `{pid, proxy_port, sock_path}`.
#[must_use]
pub fn daemon_lock_path(state_root: &std::path::Path) -> PathBuf {
    state_root.join("proxy").join("daemon.lock")
}

/// Unix-domain control socket for `register`/`revoke`/`list`.
#[must_use]
pub fn daemon_socket_path(state_root: &std::path::Path) -> PathBuf {
    state_root.join("proxy").join("control.sock")
}

/// Root directory for all runs.
#[must_use]
pub fn runs_dir(state_root: &std::path::Path) -> PathBuf {
    state_root.join("runs")
}

/// Private directory for one run.
#[must_use]
pub fn run_dir(state_root: &std::path::Path, run_id: &str) -> PathBuf {
    runs_dir(state_root).join(run_id)
}

/// Persisted `Run` record.
#[must_use]
pub fn run_meta_path(state_root: &std::path::Path, run_id: &str) -> PathBuf {
    run_dir(state_root, run_id).join("meta.json")
}

/// Line-indexed log segments for a run.
#[must_use]
pub fn run_logs_dir(state_root: &std::path::Path, run_id: &str) -> PathBuf {
    run_dir(state_root, run_id).join("logs")
}

/// Request-record JSONL file for a run.
#[must_use]
pub fn run_requests_path(state_root: &std::path::Path, run_id: &str) -> PathBuf {
    run_dir(state_root, run_id).join("network").join("requests.jsonl")
}

/// Single-file audit database for a run.
#[must_use]
pub fn run_audit_db_path(state_root: &std::path::Path, run_id: &str) -> PathBuf {
    run_dir(state_root, run_id).join("audit.db")
}

/// Filesystem snapshot directory, opaque to the core.
#[must_use]
pub fn run_snapshots_dir(state_root: &std::path::Path, run_id: &str) -> PathBuf {
    run_dir(state_root, run_id).join("snapshots")
}

/// State-root exclusivity lock (no two Manager instances may hold the same
/// run directory).
#[must_use]
pub fn state_root_lock_path(state_root: &std::path::Path) -> PathBuf {
    state_root.join(".lock")
}

/// Layered config file path, `~/.moat/config.toml`.
#[must_use]
pub fn config_path(state_root: &std::path::Path) -> PathBuf {
    state_root.join("config.toml")
}
