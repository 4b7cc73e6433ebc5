/// Daemon discovery: lock file, liveness probe, idempotent spawn.
pub mod daemon;
/// Directory listing and path normalization.
pub mod directory;
/// Log file cleanup and rotation.
pub mod log_cleanup;
/// Host machine identity, used to derive the vault's encryption key.
pub mod machine_id;
/// On-disk layout under the state root.
pub mod paths;
/// Generated adjective-noun run names.
pub mod random;

pub use daemon::{ensure_daemon_running, is_daemon_running, wait_for_daemon};
pub use directory::{expand_tilde, normalize_path, read_directories};
pub use random::generate_run_name;
