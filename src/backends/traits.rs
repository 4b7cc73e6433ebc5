use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Everything an [`ExecutionBackend`] needs to bring up one run's container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name, derived from the run's name.
    pub name: String,
    /// Image reference to run.
    pub image: String,
    /// Host path mounted at `/workspace` inside the container.
    pub workspace_path: PathBuf,
    /// Command to execute as the container entrypoint.
    pub command: Vec<String>,
    /// Environment variables injected into the container, including the
    /// proxy address, injection token, and CA bundle path.
    pub env: HashMap<String, String>,
    /// Host path to the proxy's root CA certificate (PEM), mounted read-only.
    pub ca_bundle_path: PathBuf,
    /// Whether the container should allocate a pseudo-tty for interactive use.
    pub tty: bool,
}

/// Abstraction over the container runtime a run executes in. The core's only
/// dependency on an out-of-process resource; every operation in
/// [`crate::core::manager::RunManager`] goes through this trait so the
/// manager can be exercised against an in-memory double.
#[async_trait]
pub trait ExecutionBackend: Send + Sync + std::fmt::Debug {
    /// Create (but do not start) a container for `spec`, returning its id.
    async fn create(&self, spec: &ContainerSpec) -> anyhow::Result<String>;

    /// Start a previously created container.
    async fn start(&self, container_id: &str) -> anyhow::Result<()>;

    /// Whether a container with this id is known to the runtime.
    async fn exists(&self, container_id: &str) -> anyhow::Result<bool>;

    /// Send `signal` to the container, waiting up to `grace` before the
    /// runtime escalates to a forced kill.
    async fn stop(&self, container_id: &str, signal: &str, grace: Duration) -> anyhow::Result<()>;

    /// Remove a stopped container and its resources.
    async fn remove(&self, container_id: &str) -> anyhow::Result<()>;

    /// Block until the container exits, returning its exit code.
    async fn wait(&self, container_id: &str) -> anyhow::Result<i32>;

    /// The argv used to attach an interactive session to a running container.
    fn attach_command(&self, container_id: &str) -> Vec<String>;
}
