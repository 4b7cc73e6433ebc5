//! Moat: a credential vault, a credential-injecting TLS proxy, and a run
//! lifecycle manager for sandboxing an AI coding agent's network access.

#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(unreachable_pub)]
#![warn(elided_lifetimes_in_paths)]
#![warn(missing_copy_implementations)]
#![deny(unused_must_use)]
#![deny(unsafe_op_in_unsafe_fn)]

/// Execution backends (Docker CLI, plus an in-memory test double).
pub mod backends;
/// Layered process configuration: defaults, config file, environment.
pub mod config;
/// Run domain model, state machine, lifecycle manager, and attach I/O.
pub mod core;
/// Crate-wide error type.
pub mod error;
/// Correlation IDs and other observability plumbing.
pub mod observability;
/// Credential-injecting TLS proxy, its CA, registry, and daemon.
pub mod proxy;
/// Shared utilities: on-disk layout, daemon discovery, machine identity.
pub mod utils;
/// Encrypted credential store and the typed Vault facade.
pub mod vault;
/// Hash-chained, SQLite-backed append-only audit log.
pub mod audit;

pub use error::{ErrorKind, MoatError, Result};
