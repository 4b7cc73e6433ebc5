//! Docker CLI execution backend: shells out to the `docker` binary via
//! `tokio::process::Command` rather than linking a client library, matching
//! how this crate talks to every other external process.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::traits::{ContainerSpec, ExecutionBackend};

/// Backend that runs each run inside a Docker container.
#[derive(Debug, Default, Clone)]
pub struct DockerBackend;

impl DockerBackend {
    /// Construct a backend that talks to the Docker daemon via the CLI.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn build_run_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "-v".to_string(),
            format!("{}:/workspace", spec.workspace_path.display()),
            "-v".to_string(),
            format!("{}:/etc/ssl/certs/moat-ca.pem:ro", spec.ca_bundle_path.display()),
        ];

        if spec.tty {
            args.push("-it".to_string());
        }

        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }
}

#[async_trait]
impl ExecutionBackend for DockerBackend {
    async fn create(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        let args = Self::build_run_args(spec);
        let output = Command::new("docker").args(&args).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(container = %spec.name, stderr = %stderr, "docker create failed");
            anyhow::bail!("docker create failed: {stderr}");
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        tracing::info!(container_id = %container_id, name = %spec.name, "created container");
        Ok(container_id)
    }

    async fn start(&self, container_id: &str) -> anyhow::Result<()> {
        let output = Command::new("docker").args(["start", container_id]).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("docker start failed: {stderr}");
        }
        Ok(())
    }

    async fn exists(&self, container_id: &str) -> anyhow::Result<bool> {
        let output = Command::new("docker")
            .args(["ps", "-a", "--format", "{{.ID}} {{.Names}}"])
            .output()
            .await?;
        if !output.status.success() {
            return Ok(false);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().any(|line| line.split_whitespace().any(|tok| tok == container_id)))
    }

    async fn stop(&self, container_id: &str, signal: &str, grace: Duration) -> anyhow::Result<()> {
        let output = Command::new("docker")
            .args([
                "stop",
                "--signal",
                signal,
                "--time",
                &grace.as_secs().to_string(),
                container_id,
            ])
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(container = %container_id, stderr = %stderr, "docker stop failed");
        }
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> anyhow::Result<()> {
        let output = Command::new("docker").args(["rm", "-f", container_id]).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(container = %container_id, stderr = %stderr, "docker rm failed");
        }
        Ok(())
    }

    async fn wait(&self, container_id: &str) -> anyhow::Result<i32> {
        let output = Command::new("docker").args(["wait", container_id]).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("docker wait failed: {stderr}");
        }
        let code = String::from_utf8_lossy(&output.stdout).trim().parse::<i32>().unwrap_or(-1);
        Ok(code)
    }

    fn attach_command(&self, container_id: &str) -> Vec<String> {
        vec!["docker".to_string(), "attach".to_string(), container_id.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn sample_spec() -> ContainerSpec {
        ContainerSpec {
            name: "moat-swift-falcon".to_string(),
            image: "alpine:latest".to_string(),
            workspace_path: PathBuf::from("/tmp/workspace"),
            command: vec!["sleep".to_string(), "infinity".to_string()],
            env: HashMap::from([("MOAT_PROXY_ADDR".to_string(), "127.0.0.1:9000".to_string())]),
            ca_bundle_path: PathBuf::from("/tmp/ca.pem"),
            tty: false,
        }
    }

    #[test]
    fn create_args_mount_workspace_and_ca_bundle() {
        let args = DockerBackend::build_run_args(&sample_spec());
        assert!(args.contains(&"/tmp/workspace:/workspace".to_string()));
        assert!(args.iter().any(|a| a.contains("moat-ca.pem")));
    }

    #[test]
    fn attach_command_uses_docker_attach() {
        let backend = DockerBackend::new();
        assert_eq!(backend.attach_command("abc123"), vec!["docker", "attach", "abc123"]);
    }
}
