//! Run Lifecycle Manager (E): the `Run` domain model, its state machine, the
//! manager that drives Create/Start/Stop/Destroy/Wait, and the attach I/O
//! loop.

/// Re-entrant PTY attach and cancellable detach.
pub mod attach;
/// The `RunManager`: owns every run and enforces its lifecycle.
pub mod manager;
/// The `Run` record and its state machine.
pub mod session;

pub use attach::AttachHandle;
pub use manager::{ReconcileReport, RunManager, RunOutcome};
pub use session::{Run, RunConfig, RunState, WorktreeInfo};
