//! Portable audit bundles: `export()`/`bundle.verify()` reproduce the same
//! verdict as `AuditLog::verify()` without needing the database.

use serde::{Deserialize, Serialize};

use crate::audit::entry::{compute_hash, AuditEntry, GENESIS_PREV_HASH};
use crate::audit::log::{AuditLog, VerifyReport};
use crate::error::Result;

/// Current bundle format version.
pub const BUNDLE_VERSION: u32 = 1;

/// An optional signature over the bundle's `last_hash`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signature {
    /// Signature bytes, hex-encoded.
    pub signature: String,
    /// Public key that produced the signature, hex-encoded.
    pub public_key: String,
}

/// An external anchor (e.g. a timestamp authority receipt) for `last_hash`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalAnchor {
    /// Name of the anchoring service.
    pub anchor_type: String,
    /// Opaque anchor reference (receipt id, transaction hash, ...).
    pub reference: String,
}

/// A portable, self-contained export of an audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditBundle {
    /// Bundle format version.
    pub version: u32,
    /// When the bundle was produced.
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Every entry in sequence order.
    pub entries: Vec<AuditEntry>,
    /// Hash of the last entry, or `"0"` for an empty log.
    pub last_hash: String,
    /// Signatures over `last_hash`, if any were attached.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<Signature>,
    /// External anchors for `last_hash`, if any were recorded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_anchors: Vec<ExternalAnchor>,
}

impl AuditBundle {
    /// Build a bundle from an [`AuditLog`]'s current contents.
    pub async fn export(log: &AuditLog) -> Result<Self> {
        let entries = log.entries().await?;
        let last_hash = entries.last().map_or_else(|| GENESIS_PREV_HASH.to_string(), |e| e.hash.clone());
        Ok(Self {
            version: BUNDLE_VERSION,
            created_at: chrono::Utc::now(),
            entries,
            last_hash,
            signatures: Vec::new(),
            external_anchors: Vec::new(),
        })
    }

    /// Replay this bundle's chain, independent of any database. Returns the
    /// same [`VerifyReport`] shape `AuditLog::verify()` would for the same
    /// underlying entries (the round-trip law `export(log); bundle.verify()
    /// == log.verify()`).
    #[must_use]
    pub fn verify(&self) -> VerifyReport {
        let mut prev_hash = GENESIS_PREV_HASH.to_string();
        for entry in &self.entries {
            let expected = compute_hash(&entry.prev_hash, entry.seq, entry.ts, &entry.kind, &entry.payload);
            if entry.prev_hash != prev_hash || entry.hash != expected {
                return VerifyReport {
                    valid: false,
                    count: self.entries.len() as u64,
                    first_invalid_seq: Some(entry.seq),
                };
            }
            prev_hash = entry.hash.clone();
        }
        VerifyReport {
            valid: true,
            count: self.entries.len() as u64,
            first_invalid_seq: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn export_then_verify_matches_log_verify() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(&dir.path().join("audit.db")).await.unwrap();
        log.append("a", serde_json::json!({"n": 1})).await.unwrap();
        log.append("b", serde_json::json!({"n": 2})).await.unwrap();

        let bundle = AuditBundle::export(&log).await.unwrap();
        let bundle_report = bundle.verify();
        let log_report = log.verify().await.unwrap();
        assert_eq!(bundle_report, log_report);
    }

    #[tokio::test]
    async fn tampered_bundle_payload_is_caught_without_a_database() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(&dir.path().join("audit.db")).await.unwrap();
        log.append("a", serde_json::json!({"n": 1})).await.unwrap();
        log.append("b", serde_json::json!({"n": 2})).await.unwrap();

        let mut bundle = AuditBundle::export(&log).await.unwrap();
        bundle.entries[0].payload = serde_json::json!({"n": 999});

        let report = bundle.verify();
        assert!(!report.valid);
        assert_eq!(report.first_invalid_seq, Some(0));
    }

    #[tokio::test]
    async fn empty_log_exports_genesis_last_hash() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(&dir.path().join("audit.db")).await.unwrap();
        let bundle = AuditBundle::export(&log).await.unwrap();
        assert_eq!(bundle.last_hash, GENESIS_PREV_HASH);
        assert!(bundle.verify().valid);
    }
}
