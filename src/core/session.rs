//! The `Run` record and its state machine, per the data model and the Run
//! Lifecycle Manager's state-machine invariant table. Grounded on the
//! teacher's `Session`/`SessionStatus` for overall shape (a persisted record
//! mutated through `set_*` methods that bump `updated_at`), but the status
//! enum itself is new: the teacher's `Creating/Deleting/Running/Idle/
//! Completed/Failed/Archived` does not match this machine and is not reused.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MoatError, Result};

/// `Created -> Starting -> Running -> Stopping -> Stopped`, with `Failed` as
/// a terminal alternative reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// `meta.json` persisted, nothing started yet.
    Created,
    /// Token bound, container being created and started.
    Starting,
    /// Container running, token registered in the proxy.
    Running,
    /// Token revoked, stop signal sent, awaiting exit.
    Stopping,
    /// Container exited; `exit_code` and `stopped_at` are set.
    Stopped,
    /// Terminal failure; `error_message` explains why.
    Failed,
}

impl RunState {
    /// Whether `to` is a legal transition from `self`, per the state-machine
    /// invariant table in the Run Lifecycle Manager design.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Created, Self::Starting)
                | (Self::Starting, Self::Running)
                | (Self::Starting, Self::Failed)
                | (Self::Running, Self::Stopping)
                | (Self::Running, Self::Failed)
                | (Self::Stopping, Self::Stopped)
                | (Self::Stopping, Self::Failed)
        )
    }

    /// Whether this state permits `Destroy` (only `Stopped` or `Failed`).
    #[must_use]
    pub const fn is_destroyable(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether this state has no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Where a run's git worktree came from, when it has one. Optional: the
/// spec treats the git-worktree helper as an out-of-scope external
/// collaborator, so a run may simply have `worktree: None` and point
/// `workspace_path` at an ordinary directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    /// Path to the worktree on disk.
    pub path: PathBuf,
    /// Branch checked out in the worktree.
    pub branch: String,
    /// Identifier of the repository the worktree belongs to.
    pub repo_id: String,
}

/// One sealed execution of an agent: workspace + container + proxy context
/// + logs + audit, per the glossary's definition of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// URL-safe identifier with at least 64 bits of entropy.
    pub id: String,
    /// Human-readable name: explicit > workspace config > generated.
    pub name: String,
    /// Current lifecycle state.
    pub state: RunState,
    /// Host path to the run's workspace, mounted at `/workspace`.
    pub workspace_path: PathBuf,
    /// Agent identifier (opaque to the core beyond logging).
    pub agent: String,
    /// Provider grants this run is authorized to use.
    pub grants: Vec<String>,
    /// Command executed inside the container.
    pub command: Vec<String>,
    /// User-supplied environment variables, merged with the container
    /// contract's proxy variables at Start.
    pub env: HashMap<String, String>,
    /// Host port -> container port bindings, populated once `Running`.
    pub ports: HashMap<u16, u16>,
    /// Whether the run accepts interactive input.
    pub interactive: bool,
    /// Whether the container allocates a pseudo-tty.
    pub tty: bool,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run entered `Running`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run entered `Stopped`.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Exit code of the container's main process, once known.
    pub exit_code: Option<i32>,
    /// Backend-assigned container identifier.
    pub container_id: Option<String>,
    /// Backend-assigned network identifier, if the backend allocates one.
    pub network_id: Option<String>,
    /// Git worktree this run's workspace was created from, if any.
    pub worktree: Option<WorktreeInfo>,
    /// Reason the run failed, set only when `state == Failed`.
    pub error_message: Option<String>,
    /// Whether the container should be left in place after `Stop`.
    pub keep_container: bool,
    /// The injection token bound to this run in the proxy registry, once
    /// `Start` has bound one. Persisted in `meta.json` so a crash between
    /// binding and `Running` can still be revoked on restart.
    pub injection_token: Option<String>,
}

/// Parameters needed to construct a new [`Run`] (the `Create` operation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Explicit or generated name.
    pub name: String,
    /// Validated, symlink-resolved workspace directory.
    pub workspace_path: PathBuf,
    /// Agent identifier.
    pub agent: String,
    /// Provider grants.
    pub grants: Vec<String>,
    /// Command to execute.
    pub command: Vec<String>,
    /// User-supplied environment variables.
    pub env: HashMap<String, String>,
    /// Whether the run accepts interactive input.
    pub interactive: bool,
    /// Whether to allocate a pseudo-tty.
    pub tty: bool,
    /// Git worktree provenance, if any.
    pub worktree: Option<WorktreeInfo>,
    /// Whether to keep the container around after `Stop`.
    pub keep_container: bool,
}

impl Run {
    /// Construct a new run in state `Created`.
    #[must_use]
    pub fn new(id: String, config: RunConfig) -> Self {
        Self {
            id,
            name: config.name,
            state: RunState::Created,
            workspace_path: config.workspace_path,
            agent: config.agent,
            grants: config.grants,
            command: config.command,
            env: config.env,
            ports: HashMap::new(),
            interactive: config.interactive,
            tty: config.tty,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            exit_code: None,
            container_id: None,
            network_id: None,
            worktree: config.worktree,
            error_message: None,
            keep_container: config.keep_container,
            injection_token: None,
        }
    }

    /// Apply a state transition, rejecting illegal ones per the invariant
    /// table. `Failed` is reachable from any non-terminal state (any
    /// failure) so it is checked separately from `RunState::can_transition_to`.
    pub fn transition(&mut self, to: RunState, attempted: &'static str) -> Result<()> {
        let legal = self.state.can_transition_to(to) || (to == RunState::Failed && !self.state.is_terminal());
        if !legal {
            return Err(MoatError::InvalidState {
                run_id: self.id.clone(),
                current: self.state.to_string(),
                attempted: attempted.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Mark the run `Failed` with a reason, recorded for inspection.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(RunState::Failed, "fail")?;
        self.error_message = Some(reason.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_run() -> Run {
        Run::new(
            "run-abc123".to_string(),
            RunConfig {
                name: "swift-falcon".to_string(),
                workspace_path: PathBuf::from("/tmp/ws"),
                agent: "claude-code".to_string(),
                grants: vec!["github".to_string()],
                command: vec!["curl".to_string(), "-s".to_string()],
                env: HashMap::new(),
                interactive: false,
                tty: false,
                worktree: None,
                keep_container: false,
            },
        )
    }

    #[test]
    fn new_run_starts_in_created() {
        assert_eq!(sample_run().state, RunState::Created);
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        let mut run = sample_run();
        run.transition(RunState::Starting, "start").unwrap();
        run.transition(RunState::Running, "runtime reports running").unwrap();
        run.transition(RunState::Stopping, "stop").unwrap();
        run.transition(RunState::Stopped, "runtime reports exited").unwrap();
        assert_eq!(run.state, RunState::Stopped);
    }

    #[test]
    fn stop_on_already_stopped_run_is_invalid_state() {
        let mut run = sample_run();
        run.transition(RunState::Starting, "start").unwrap();
        run.transition(RunState::Running, "runtime reports running").unwrap();
        run.transition(RunState::Stopping, "stop").unwrap();
        run.transition(RunState::Stopped, "runtime reports exited").unwrap();

        let err = run.transition(RunState::Stopping, "stop").unwrap_err();
        assert!(matches!(err, MoatError::InvalidState { .. }));
    }

    #[test]
    fn destroy_only_legal_from_stopped_or_failed() {
        let mut run = sample_run();
        assert!(!run.state.is_destroyable());
        run.transition(RunState::Starting, "start").unwrap();
        assert!(!run.state.is_destroyable());
        run.fail("container create failed").unwrap();
        assert!(run.state.is_destroyable());
    }

    #[test]
    fn failed_state_is_terminal() {
        let mut run = sample_run();
        run.fail("boom").unwrap();
        assert!(run.state.is_terminal());
        let err = run.transition(RunState::Starting, "start").unwrap_err();
        assert!(matches!(err, MoatError::InvalidState { .. }));
    }
}
