//! The proxy daemon: one long-lived process hosting the Injection Proxy
//! listener and the `RunManager`, reachable from short-lived CLI
//! invocations over a Unix-domain control socket. The external-interfaces
//! daemon IPC contract names `register`/`revoke`/`list`; this generalizes
//! that single control channel to the run lifecycle operations as a whole,
//! so there is exactly one process holding the Registry and the `RunManager`
//! together (an Open Question decision recorded in the grounding ledger).
//!
//! `ensure_running`/`is_daemon_running` (the client half) live in
//! `utils::daemon`; this module is the server half: `serve` binds the
//! socket, writes the lock file, and dispatches requests until told to
//! stop. Lifecycle is idempotent: a second `ensure_running` against an
//! already-live daemon is a no-op, and `stop` only removes the lock file
//! after the listener has actually closed.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::core::session::{Run, RunConfig};
use crate::core::manager::RunManager;
use crate::utils::daemon::DaemonLock;
use crate::utils::paths;

/// One request sent over the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonRequest {
    /// Liveness check.
    Ping,
    /// `RunManager::create`.
    CreateRun(RunConfig),
    /// `RunManager::start`.
    StartRun { run_id: String },
    /// `RunManager::stop`.
    StopRun { run_id: String },
    /// `RunManager::destroy`.
    DestroyRun { run_id: String },
    /// `RunManager::get`.
    GetRun { run_id: String },
    /// `RunManager::list`.
    ListRuns,
}

/// The daemon's reply to one [`DaemonRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonResponse {
    /// Liveness reply.
    Pong,
    /// A single run record.
    Run(Run),
    /// Every known run record.
    Runs(Vec<Run>),
    /// A request that does not return data succeeded.
    Ok,
    /// The request failed; `message` never includes secret material.
    Error {
        /// Human-readable failure reason.
        message: String,
    },
}

async fn dispatch(manager: &RunManager, request: DaemonRequest) -> DaemonResponse {
    let result = match request {
        DaemonRequest::Ping => return DaemonResponse::Pong,
        DaemonRequest::CreateRun(config) => manager.create(config).await.map(DaemonResponse::Run),
        DaemonRequest::StartRun { run_id } => manager.start(&run_id).await.map(DaemonResponse::Run),
        DaemonRequest::StopRun { run_id } => manager.stop(&run_id).await.map(DaemonResponse::Run),
        DaemonRequest::DestroyRun { run_id } => manager.destroy(&run_id).await.map(|()| DaemonResponse::Ok),
        DaemonRequest::GetRun { run_id } => manager.get(&run_id).await.map(DaemonResponse::Run),
        DaemonRequest::ListRuns => Ok(DaemonResponse::Runs(manager.list().await)),
    };

    result.unwrap_or_else(|err| DaemonResponse::Error { message: err.to_string() })
}

async fn handle_connection(stream: UnixStream, manager: Arc<RunManager>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "control connection read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => dispatch(&manager, request).await,
            Err(err) => DaemonResponse::Error { message: format!("malformed request: {err}") },
        };

        let Ok(mut encoded) = serde_json::to_string(&response) else {
            break;
        };
        encoded.push('\n');
        if write_half.write_all(encoded.as_bytes()).await.is_err() {
            break;
        }
    }
}

/// Bind the control socket, write `daemon.lock`, and serve requests until
/// the process is terminated. Stale sockets from a prior crash are removed
/// before binding.
pub async fn serve(state_root: &Path, proxy_port: u16, manager: Arc<RunManager>) -> anyhow::Result<()> {
    let sock_path = paths::daemon_socket_path(state_root);
    if sock_path.exists() {
        std::fs::remove_file(&sock_path)?;
    }
    if let Some(parent) = sock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(&sock_path)?;

    let lock = DaemonLock { pid: std::process::id(), proxy_port, sock_path: sock_path.clone() };
    lock.write(state_root)?;

    tracing::info!(sock = %sock_path.display(), proxy_port, "daemon control socket listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let manager = Arc::clone(&manager);
        tokio::spawn(handle_connection(stream, manager));
    }
}

/// Send one request to a running daemon's control socket and await its
/// response.
pub async fn request(state_root: &Path, request: &DaemonRequest) -> anyhow::Result<DaemonResponse> {
    let sock_path = paths::daemon_socket_path(state_root);
    let stream = UnixStream::connect(&sock_path).await?;
    let (read_half, mut write_half) = stream.into_split();

    let mut encoded = serde_json::to_string(request)?;
    encoded.push('\n');
    write_half.write_all(encoded.as_bytes()).await?;

    let mut lines = BufReader::new(read_half).lines();
    let line = lines
        .next_line()
        .await?
        .ok_or_else(|| anyhow::anyhow!("daemon closed the connection without responding"))?;
    Ok(serde_json::from_str(&line)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_json() {
        let req = DaemonRequest::StartRun { run_id: "run-1".to_string() };
        let encoded = serde_json::to_string(&req).unwrap();
        let decoded: DaemonRequest = serde_json::from_str(&encoded).unwrap();
        matches!(decoded, DaemonRequest::StartRun { run_id } if run_id == "run-1");
    }
}
