//! Run Lifecycle Manager (E): owns every [`Run`] and drives it through
//! Create/Start/Stop/Destroy/Wait, enforcing the state-machine invariant
//! table and coordinating the vault, the proxy registry, and the execution
//! backend. Grounded on the teacher's `SessionManager`: an in-memory table
//! behind one lock, a semaphore-limited creation path, and a startup
//! reconciliation pass over persisted state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex as AsyncMutex, RwLock, Semaphore};

use crate::audit::AuditLog;
use crate::backends::{ContainerSpec, ExecutionBackend};
use crate::core::session::{Run, RunConfig, RunState};
use crate::error::{MoatError, Result};
use crate::proxy::ca::CertificateAuthority;
use crate::proxy::http_proxy::{RequestSink, TOKEN_HEADER};
use crate::proxy::registry::{Registry, RunContext};
use crate::utils::{generate_run_name, paths};
use crate::vault::Vault;

const MAX_CONCURRENT_CREATIONS: usize = 3;

/// How a waited-on run ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The container's main process exited with this code.
    Exited(i32),
    /// The run transitioned to `Failed` for this reason.
    Failed(String),
}

/// What startup reconciliation found and did, mirroring the teacher's
/// `ReconcileReport`.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Runs found stuck mid-transition (`Starting` or `Stopping`) and
    /// recovered into a terminal state.
    pub recovered: Vec<String>,
    /// Runs whose container no longer existed, removed as orphans.
    pub orphaned: Vec<String>,
}

/// Drives every run through its lifecycle. One instance per daemon process;
/// owns the only path by which a run's state is mutated.
pub struct RunManager {
    state_root: PathBuf,
    vault: Arc<Vault>,
    registry: Arc<Registry>,
    ca: Arc<CertificateAuthority>,
    backend: Arc<dyn ExecutionBackend>,
    runs: RwLock<HashMap<String, Run>>,
    run_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    creation_semaphore: Arc<Semaphore>,
    stop_grace: Duration,
    /// Port the Injection Proxy is actually listening on, used to point
    /// every container's `HTTP_PROXY`/`HTTPS_PROXY` at a reachable address
    /// instead of a placeholder.
    proxy_port: u16,
}

impl std::fmt::Debug for RunManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunManager").field("state_root", &self.state_root).finish_non_exhaustive()
    }
}

impl RunManager {
    /// Construct a manager over `state_root`, loading persisted runs and
    /// reconciling any left mid-transition by a prior crash (e.g. a process
    /// killed during `Starting` after the token was registered but before
    /// `Running`).
    pub async fn new(
        state_root: PathBuf,
        vault: Arc<Vault>,
        registry: Arc<Registry>,
        ca: Arc<CertificateAuthority>,
        backend: Arc<dyn ExecutionBackend>,
        stop_grace: Duration,
        proxy_port: u16,
    ) -> Result<(Self, ReconcileReport)> {
        let manager = Self {
            state_root,
            vault,
            registry,
            ca,
            backend,
            runs: RwLock::new(HashMap::new()),
            run_locks: DashMap::new(),
            creation_semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_CREATIONS)),
            stop_grace,
            proxy_port,
        };

        manager.load_persisted_runs().await?;
        let report = manager.reconcile_on_startup().await?;
        Ok((manager, report))
    }

    fn lock_for(&self, run_id: &str) -> Arc<AsyncMutex<()>> {
        self.run_locks.entry(run_id.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    async fn load_persisted_runs(&self) -> Result<()> {
        let runs_dir = paths::runs_dir(&self.state_root);
        let Ok(entries) = std::fs::read_dir(&runs_dir) else {
            return Ok(());
        };

        let mut loaded = self.runs.write().await;
        for entry in entries.flatten() {
            let Some(run_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let meta_path = paths::run_meta_path(&self.state_root, &run_id);
            let Ok(bytes) = std::fs::read(&meta_path) else {
                continue;
            };
            match serde_json::from_slice::<Run>(&bytes) {
                Ok(run) => {
                    loaded.insert(run_id, run);
                }
                Err(err) => {
                    tracing::warn!(run_id, error = %err, "skipping run with corrupt meta.json");
                }
            }
        }
        Ok(())
    }

    /// Scan for runs left in a non-terminal state by a prior crash and bring
    /// each one to a consistent terminal state: revoke any lingering
    /// injection token, remove an orphaned container if one exists, and
    /// transition to `Failed`.
    async fn reconcile_on_startup(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let stuck: Vec<String> = {
            let runs = self.runs.read().await;
            runs.values()
                .filter(|r| matches!(r.state, RunState::Starting | RunState::Stopping))
                .map(|r| r.id.clone())
                .collect()
        };

        for run_id in stuck {
            let _guard = self.lock_for(&run_id).lock().await;

            if let Some(token) = self.runs.read().await.get(&run_id).and_then(|r| r.injection_token.clone()) {
                self.registry.revoke(&token).await;
            }

            let container_id = self.runs.read().await.get(&run_id).and_then(|r| r.container_id.clone());
            if let Some(container_id) = &container_id {
                match self.backend.exists(container_id).await {
                    Ok(true) => {
                        let _ = self.backend.remove(container_id).await;
                        report.orphaned.push(run_id.clone());
                    }
                    Ok(false) => {}
                    Err(err) => tracing::warn!(run_id, error = %err, "could not check orphaned container"),
                }
            }

            let mut runs = self.runs.write().await;
            if let Some(run) = runs.get_mut(&run_id) {
                let _ = run.fail("interrupted by a crash before reaching a stable state");
                self.persist(run)?;
            }
            report.recovered.push(run_id);
        }

        Ok(report)
    }

    fn persist(&self, run: &Run) -> Result<()> {
        let path = paths::run_meta_path(&self.state_root, &run.id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(run)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    async fn audit_for(&self, run_id: &str) -> Result<AuditLog> {
        AuditLog::open(&paths::run_audit_db_path(&self.state_root, run_id)).await
    }

    /// All runs currently known, most-recently-created first.
    pub async fn list(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    /// Fetch one run by id.
    pub async fn get(&self, run_id: &str) -> Result<Run> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| MoatError::NotFound { what: "run", id: run_id.to_string() })
    }

    /// Construct a fresh run in state `Created`: validate the workspace,
    /// resolve a name, persist `meta.json`, and write the genesis audit
    /// entry. Limited to [`MAX_CONCURRENT_CREATIONS`] concurrent creations.
    pub async fn create(&self, mut config: RunConfig) -> Result<Run> {
        let _permit = self.creation_semaphore.acquire().await.map_err(|_| MoatError::Cancelled)?;

        let resolved = std::fs::canonicalize(&config.workspace_path).map_err(|_| MoatError::InvalidArgument {
            message: format!("workspace path '{}' does not exist", config.workspace_path.display()),
        })?;
        if !resolved.is_dir() {
            return Err(MoatError::InvalidArgument {
                message: format!("workspace path '{}' is not a directory", resolved.display()),
            });
        }
        config.workspace_path = resolved;

        if config.name.trim().is_empty() {
            config.name = generate_run_name();
        }

        let run_id = format!("run-{}", uuid::Uuid::new_v4().simple());
        let run = Run::new(run_id.clone(), config);

        self.persist(&run)?;

        let audit = self.audit_for(&run_id).await?;
        audit
            .append("run.created", serde_json::json!({ "run_id": run_id, "name": run.name, "agent": run.agent }))
            .await?;

        self.runs.write().await.insert(run_id, run.clone());
        Ok(run)
    }

    /// `Created -> Starting -> Running` (or `-> Failed` on any failure
    /// before `Running`). Binds an injection token, registers the run
    /// context with the proxy, builds the container spec, and starts it.
    pub async fn start(&self, run_id: &str) -> Result<Run> {
        let _guard = self.lock_for(run_id).lock().await;

        let mut run = self.get(run_id).await?;
        run.transition(RunState::Starting, "start")?;

        let binding = match self.vault.bind(&run.grants, &HashMap::new()).await {
            Ok(binding) => binding,
            Err(err) => return self.fail_starting(run, err.to_string()).await,
        };

        run.injection_token = Some(binding.token.clone());
        self.persist(&run)?;

        let allow_hosts = binding.views.iter().map(|(host, _)| host.clone()).collect();
        let unresolved_hosts = binding.unresolved_hosts.iter().cloned().collect();
        let audit = Arc::new(self.audit_for(run_id).await?);
        let sink = match RequestSink::open(&paths::run_requests_path(&self.state_root, run_id), audit).await {
            Ok(sink) => Arc::new(sink),
            Err(err) => return self.fail_starting(run, err.to_string()).await,
        };

        self.registry
            .register(
                binding.token.clone(),
                RunContext {
                    run_id: run_id.to_string(),
                    allow_hosts,
                    credentials: binding.views,
                    unresolved_hosts,
                    sink: Some(sink),
                },
            )
            .await;

        let ca_bundle_path = match self.ca.root_cert_bytes() {
            Ok(bytes) => {
                let path = paths::run_dir(&self.state_root, run_id).join("ca-bundle.pem");
                if let Err(err) = std::fs::write(&path, bytes) {
                    return self.fail_starting(run, err.to_string()).await;
                }
                path
            }
            Err(err) => return self.fail_starting(run, err.to_string()).await,
        };

        let proxy_addr = format!("http://127.0.0.1:{}", self.proxy_port);
        let mut env = run.env.clone();
        env.insert("HTTP_PROXY".to_string(), proxy_addr.clone());
        env.insert("HTTPS_PROXY".to_string(), proxy_addr);
        env.insert("NO_PROXY".to_string(), "localhost,127.0.0.1".to_string());
        env.insert("MOAT_PROXY_TOKEN".to_string(), binding.token.clone());
        env.insert(TOKEN_HEADER.to_string(), format!("Bearer {}", binding.token));

        let spec = ContainerSpec {
            name: run.name.clone(),
            image: "moat/runner:latest".to_string(),
            workspace_path: run.workspace_path.clone(),
            command: run.command.clone(),
            env,
            ca_bundle_path,
            tty: run.tty,
        };

        let container_id = match self.backend.create(&spec).await {
            Ok(id) => id,
            Err(err) => return self.fail_starting(run, err.to_string()).await,
        };
        run.container_id = Some(container_id.clone());
        self.persist(&run)?;

        if let Err(err) = self.backend.start(&container_id).await {
            return self.fail_starting(run, err.to_string()).await;
        }

        run.transition(RunState::Running, "runtime reports running")?;
        run.started_at = Some(chrono::Utc::now());
        self.persist(&run)?;

        self.audit_for(run_id)
            .await?
            .append("run.started", serde_json::json!({ "run_id": run_id, "container_id": container_id }))
            .await?;

        self.runs.write().await.insert(run_id.to_string(), run.clone());
        Ok(run)
    }

    async fn fail_starting(&self, mut run: Run, reason: String) -> Result<Run> {
        if let Some(token) = run.injection_token.take() {
            self.registry.revoke(&token).await;
        }
        if let Some(container_id) = &run.container_id {
            let _ = self.backend.remove(container_id).await;
        }
        run.fail(reason.clone())?;
        self.persist(&run)?;
        if let Ok(audit) = self.audit_for(&run.id).await {
            let _ = audit.append("run.failed", serde_json::json!({ "run_id": run.id, "reason": reason })).await;
        }
        self.runs.write().await.insert(run.id.clone(), run.clone());
        Err(MoatError::RuntimeUnavailable { reason })
    }

    /// `Running -> Stopping -> Stopped`: revoke the token first (so every
    /// request racing the shutdown gets 407 rather than a forwarded
    /// response), then signal the container, wait for it to exit, and
    /// remove it unless `keep_container` was requested.
    pub async fn stop(&self, run_id: &str) -> Result<Run> {
        let _guard = self.lock_for(run_id).lock().await;

        let mut run = self.get(run_id).await?;
        run.transition(RunState::Stopping, "stop")?;

        if let Some(token) = run.injection_token.take() {
            self.registry.revoke(&token).await;
        }
        self.persist(&run)?;

        let exit_code = if let Some(container_id) = run.container_id.clone() {
            if let Err(err) = self.backend.stop(&container_id, "SIGTERM", self.stop_grace).await {
                tracing::warn!(run_id, error = %err, "stop signal failed, container may already be gone");
            }
            let code = self.backend.wait(&container_id).await.unwrap_or(-1);
            if !run.keep_container {
                let _ = self.backend.remove(&container_id).await;
            }
            code
        } else {
            0
        };

        run.exit_code = Some(exit_code);
        run.stopped_at = Some(chrono::Utc::now());
        run.transition(RunState::Stopped, "runtime reports exited")?;
        self.persist(&run)?;

        self.audit_for(run_id)
            .await?
            .append("run.stopped", serde_json::json!({ "run_id": run_id, "exit_code": exit_code }))
            .await?;

        self.runs.write().await.insert(run_id.to_string(), run.clone());
        Ok(run)
    }

    /// Only legal from `Stopped` or `Failed`: removes the container (if one
    /// still exists), the run's private directory, and revokes any
    /// lingering token.
    pub async fn destroy(&self, run_id: &str) -> Result<()> {
        let _guard = self.lock_for(run_id).lock().await;

        let run = self.get(run_id).await?;
        if !run.state.is_destroyable() {
            return Err(MoatError::InvalidState {
                run_id: run_id.to_string(),
                current: run.state.to_string(),
                attempted: "destroy".to_string(),
            });
        }

        if let Some(token) = &run.injection_token {
            self.registry.revoke(token).await;
        }
        if let Some(container_id) = &run.container_id {
            let _ = self.backend.remove(container_id).await;
        }

        let dir = paths::run_dir(&self.state_root, run_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }

        self.runs.write().await.remove(run_id);
        self.run_locks.remove(run_id);
        Ok(())
    }

    /// Block until the run reaches a terminal state, polling its in-memory
    /// record (updated by [`Self::stop`] or crash reconciliation).
    pub async fn wait(&self, run_id: &str) -> Result<RunOutcome> {
        loop {
            let run = self.get(run_id).await?;
            match run.state {
                RunState::Stopped => return Ok(RunOutcome::Exited(run.exit_code.unwrap_or(0))),
                RunState::Failed => {
                    return Ok(RunOutcome::Failed(run.error_message.unwrap_or_else(|| "unknown failure".to_string())))
                }
                _ => tokio::time::sleep(Duration::from_millis(200)).await,
            }
        }
    }

    /// The command this run's backend would execute to attach an
    /// interactive session, for callers implementing the attach I/O loop.
    pub async fn attach_command(&self, run_id: &str) -> Result<Vec<String>> {
        let run = self.get(run_id).await?;
        let container_id = run.container_id.ok_or_else(|| MoatError::InvalidState {
            run_id: run_id.to_string(),
            current: run.state.to_string(),
            attempted: "attach".to_string(),
        })?;
        Ok(self.backend.attach_command(&container_id))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::TempDir;

    use super::*;
    use crate::backends::MockExecutionBackend;
    use crate::core::session::RunConfig;
    use crate::proxy::registry::Registry;

    async fn manager_over(dir: &TempDir) -> (RunManager, Arc<MockExecutionBackend>) {
        let state_root = dir.path().to_path_buf();
        std::fs::create_dir_all(&state_root).unwrap();
        let vault = Arc::new(Vault::open(state_root.join("credentials")).unwrap());
        let registry = Arc::new(Registry::new(Duration::from_secs(300)));
        let ca = Arc::new(CertificateAuthority::load_or_generate(&state_root.join("proxy")).unwrap());
        let backend = Arc::new(MockExecutionBackend::new());
        let (manager, _report) =
            RunManager::new(state_root, vault, registry, ca, backend.clone(), Duration::from_secs(10), 18080)
                .await
                .unwrap();
        (manager, backend)
    }

    fn sample_config(workspace: &std::path::Path) -> RunConfig {
        RunConfig {
            name: String::new(),
            workspace_path: workspace.to_path_buf(),
            agent: "claude-code".to_string(),
            grants: Vec::new(),
            command: vec!["true".to_string()],
            env: HashMap::new(),
            interactive: false,
            tty: false,
            worktree: None,
            keep_container: false,
        }
    }

    #[tokio::test]
    async fn create_persists_run_in_created_state() {
        let dir = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let (manager, _backend) = manager_over(&dir).await;

        let run = manager.create(sample_config(workspace.path())).await.unwrap();
        assert_eq!(run.state, RunState::Created);
        assert!(!run.name.is_empty());

        let reloaded = manager.get(&run.id).await.unwrap();
        assert_eq!(reloaded.id, run.id);
    }

    #[tokio::test]
    async fn start_then_stop_reaches_stopped_with_exit_code() {
        let dir = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let (manager, _backend) = manager_over(&dir).await;

        let run = manager.create(sample_config(workspace.path())).await.unwrap();
        let started = manager.start(&run.id).await.unwrap();
        assert_eq!(started.state, RunState::Running);
        assert!(started.container_id.is_some());

        let stopped = manager.stop(&run.id).await.unwrap();
        assert_eq!(stopped.state, RunState::Stopped);
        assert_eq!(stopped.exit_code, Some(0));
    }

    #[tokio::test]
    async fn stop_on_already_stopped_run_returns_invalid_state() {
        let dir = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let (manager, _backend) = manager_over(&dir).await;

        let run = manager.create(sample_config(workspace.path())).await.unwrap();
        manager.start(&run.id).await.unwrap();
        manager.stop(&run.id).await.unwrap();

        let err = manager.stop(&run.id).await.unwrap_err();
        assert!(matches!(err, MoatError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn destroy_before_stop_is_rejected() {
        let dir = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let (manager, _backend) = manager_over(&dir).await;

        let run = manager.create(sample_config(workspace.path())).await.unwrap();
        manager.start(&run.id).await.unwrap();

        let err = manager.destroy(&run.id).await.unwrap_err();
        assert!(matches!(err, MoatError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn start_failure_revokes_token_and_marks_failed() {
        let dir = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let (manager, backend) = manager_over(&dir).await;
        backend.fail_with("simulated runtime outage".to_string());

        let run = manager.create(sample_config(workspace.path())).await.unwrap();
        let err = manager.start(&run.id).await.unwrap_err();
        assert!(matches!(err, MoatError::RuntimeUnavailable { .. }));

        let reloaded = manager.get(&run.id).await.unwrap();
        assert_eq!(reloaded.state, RunState::Failed);
        assert!(reloaded.injection_token.is_none());
    }
}
