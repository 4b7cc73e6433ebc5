//! Audit Log (F): an append-only, hash-chained record of run events and
//! proxied requests, with portable export/verify.

/// Portable bundle format and its standalone `verify()`.
pub mod bundle;
/// Entry shape and the hash-chain digest function.
pub mod entry;
/// The SQLite-backed append-only log itself.
pub mod log;

pub use bundle::{AuditBundle, ExternalAnchor, Signature};
pub use entry::AuditEntry;
pub use log::{AuditLog, VerifyReport};
