//! In-memory [`ExecutionBackend`] double for exercising the run manager
//! without a real container runtime.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::traits::{ContainerSpec, ExecutionBackend};

/// A fake backend that tracks "container" existence in memory and can be
/// told to fail the next operation, for exercising the manager's error
/// handling paths.
#[derive(Debug, Default)]
pub struct MockExecutionBackend {
    containers: Mutex<HashSet<String>>,
    /// When set, every subsequent call fails with this message.
    pub should_fail: Mutex<Option<String>>,
    /// The exit code `wait` reports. Defaults to 0.
    pub exit_code: Mutex<i32>,
}

impl MockExecutionBackend {
    /// A backend that succeeds at everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call return an error with `message`.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.should_fail.lock().unwrap() = Some(message.into());
    }

    /// Make `wait` report `code` instead of the default 0.
    pub fn set_exit_code(&self, code: i32) {
        *self.exit_code.lock().unwrap() = code;
    }

    fn check_failure(&self) -> anyhow::Result<()> {
        if let Some(message) = self.should_fail.lock().unwrap().clone() {
            anyhow::bail!(message);
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionBackend for MockExecutionBackend {
    async fn create(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        self.check_failure()?;
        let id = format!("mock-{}", spec.name);
        self.containers.lock().unwrap().insert(id.clone());
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> anyhow::Result<()> {
        self.check_failure()?;
        if !self.containers.lock().unwrap().contains(container_id) {
            anyhow::bail!("no such container: {container_id}");
        }
        Ok(())
    }

    async fn exists(&self, container_id: &str) -> anyhow::Result<bool> {
        self.check_failure()?;
        Ok(self.containers.lock().unwrap().contains(container_id))
    }

    async fn stop(&self, _container_id: &str, _signal: &str, _grace: Duration) -> anyhow::Result<()> {
        self.check_failure()
    }

    async fn remove(&self, container_id: &str) -> anyhow::Result<()> {
        self.check_failure()?;
        self.containers.lock().unwrap().remove(container_id);
        Ok(())
    }

    async fn wait(&self, _container_id: &str) -> anyhow::Result<i32> {
        self.check_failure()?;
        Ok(*self.exit_code.lock().unwrap())
    }

    fn attach_command(&self, container_id: &str) -> Vec<String> {
        vec!["true".to_string(), container_id.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "test-run".to_string(),
            image: "scratch".to_string(),
            workspace_path: PathBuf::from("/tmp/ws"),
            command: vec![],
            env: HashMap::new(),
            ca_bundle_path: PathBuf::from("/tmp/ca.pem"),
            tty: false,
        }
    }

    #[tokio::test]
    async fn create_then_exists_is_true() {
        let backend = MockExecutionBackend::new();
        let id = backend.create(&spec()).await.unwrap();
        assert!(backend.exists(&id).await.unwrap());
    }

    #[tokio::test]
    async fn remove_then_exists_is_false() {
        let backend = MockExecutionBackend::new();
        let id = backend.create(&spec()).await.unwrap();
        backend.remove(&id).await.unwrap();
        assert!(!backend.exists(&id).await.unwrap());
    }

    #[tokio::test]
    async fn fail_with_makes_every_call_error() {
        let backend = MockExecutionBackend::new();
        backend.fail_with("runtime unavailable");
        assert!(backend.create(&spec()).await.is_err());
    }
}
