//! Attach I/O: streams a run's stdin/stdout/stderr, via a PTY when the run
//! requested one, until the child exits or the caller detaches. Re-entrant:
//! nothing here is state shared across calls, so concurrent attaches to the
//! same run each get their own child process and I/O loop (the execution
//! backend's attach command, e.g. `docker attach`, tolerates more than one
//! simultaneous observer of a container). Detaching tears down only the
//! local I/O pump and never touches the run's state.
//!
//! Three event sources feed the same loop: bytes arriving from the child,
//! bytes arriving from the local terminal, and the child exiting on its
//! own — whichever fires first ends the loop exactly once.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;

use crate::error::{MoatError, Result};

/// A running attach session. Dropping this has no effect on the loop; call
/// [`Self::detach`] to end it explicitly.
#[derive(Debug, Clone)]
pub struct AttachHandle {
    detach_signal: Arc<Notify>,
}

impl AttachHandle {
    /// Ask the attach loop to tear down its local I/O and return. The run
    /// itself keeps running.
    pub fn detach(&self) {
        self.detach_signal.notify_waiters();
    }
}

const BUF_SIZE: usize = 8192;

/// Spawn `command` (the execution backend's attach command for one run),
/// behind a PTY when `tty` is set, and pump bytes between it and the local
/// terminal until the child exits or the returned handle is detached.
pub async fn attach(command: &[String], tty: bool) -> Result<AttachHandle> {
    let Some((program, args)) = command.split_first() else {
        return Err(MoatError::InvalidArgument { message: "attach command is empty".to_string() });
    };

    let detach_signal = Arc::new(Notify::new());
    let loop_signal = Arc::clone(&detach_signal);

    if tty {
        let pty = pty_process::Pty::new().map_err(|e| MoatError::RuntimeUnavailable { reason: e.to_string() })?;
        let pts = pty.pts().map_err(|e| MoatError::RuntimeUnavailable { reason: e.to_string() })?;
        let mut child = pty_process::Command::new(program)
            .args(args)
            .spawn(&pts)
            .map_err(|e| MoatError::RuntimeUnavailable { reason: e.to_string() })?;

        let (mut pty_read, mut pty_write) = tokio::io::split(pty);

        tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut stdout = tokio::io::stdout();
            let mut buf = [0_u8; BUF_SIZE];

            loop {
                tokio::select! {
                    biased;
                    () = loop_signal.notified() => break,
                    exit = child.wait() => { let _ = exit; break; }
                    n = pty_read.read(&mut buf) => {
                        let Ok(n) = n else { break };
                        if n == 0 || stdout.write_all(&buf[..n]).await.is_err() { break; }
                        let _ = stdout.flush().await;
                    }
                    n = stdin.read(&mut buf) => {
                        let Ok(n) = n else { break };
                        if n == 0 || pty_write.write_all(&buf[..n]).await.is_err() { break; }
                    }
                }
            }
        });

        Ok(AttachHandle { detach_signal })
    } else {
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .spawn()
            .map_err(|e| MoatError::RuntimeUnavailable { reason: e.to_string() })?;

        let mut child_stdin = child.stdin.take().ok_or_else(|| MoatError::RuntimeUnavailable {
            reason: "child stdin was not piped".to_string(),
        })?;
        let mut child_stdout = child.stdout.take().ok_or_else(|| MoatError::RuntimeUnavailable {
            reason: "child stdout was not piped".to_string(),
        })?;

        tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut stdout = tokio::io::stdout();
            let mut buf = [0_u8; BUF_SIZE];

            loop {
                tokio::select! {
                    biased;
                    () = loop_signal.notified() => break,
                    exit = child.wait() => { let _ = exit; break; }
                    n = child_stdout.read(&mut buf) => {
                        let Ok(n) = n else { break };
                        if n == 0 || stdout.write_all(&buf[..n]).await.is_err() { break; }
                        let _ = stdout.flush().await;
                    }
                    n = stdin.read(&mut buf) => {
                        let Ok(n) = n else { break };
                        if n == 0 || child_stdin.write_all(&buf[..n]).await.is_err() { break; }
                    }
                }
            }
        });

        Ok(AttachHandle { detach_signal })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let err = attach(&[], false).await.unwrap_err();
        assert!(matches!(err, MoatError::InvalidArgument { .. }));
    }

    #[test]
    fn detach_does_not_panic_with_no_listeners() {
        let handle = AttachHandle { detach_signal: Arc::new(Notify::new()) };
        handle.detach();
    }
}
