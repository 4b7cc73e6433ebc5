//! Audit entries and the hash-chain digest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The hash of a genesis entry's (nonexistent) predecessor.
pub const GENESIS_PREV_HASH: &str = "0";

/// One append-only audit log record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntry {
    /// Monotonically increasing sequence number, starting at 0.
    pub seq: u64,
    /// When the entry was appended.
    pub ts: DateTime<Utc>,
    /// Event kind (e.g. `"request"`, `"state_transition"`, `"grant"`).
    pub kind: String,
    /// Canonical JSON payload. Never contains secret material.
    pub payload: serde_json::Value,
    /// Hash of the previous entry (`"0"` for `seq == 0`).
    pub prev_hash: String,
    /// `H(prev_hash || seq || ts || kind || payload)`.
    pub hash: String,
}

/// Compute the chain hash for an entry given its predecessor's hash.
///
/// `payload` must already be in canonical form; `serde_json::Value`'s `Map`
/// is key-sorted by default (the `preserve_order` feature is not enabled),
/// so `to_vec` of a `Value` is a stable, canonical byte encoding.
#[must_use]
pub fn compute_hash(prev_hash: &str, seq: u64, ts: DateTime<Utc>, kind: &str, payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(seq.to_be_bytes());
    hasher.update(ts.timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
    hasher.update(kind.as_bytes());
    hasher.update(serde_json::to_vec(payload).unwrap_or_default());
    hex::encode(hasher.finalize())
}

impl AuditEntry {
    /// Recompute this entry's hash from its own fields and compare.
    #[must_use]
    pub fn hash_is_self_consistent(&self) -> bool {
        compute_hash(&self.prev_hash, self.seq, self.ts, &self.kind, &self.payload) == self.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let ts = Utc::now();
        let payload = serde_json::json!({"a": 1, "b": 2});
        let h1 = compute_hash("0", 0, ts, "grant", &payload);
        let h2 = compute_hash("0", 0, ts, "grant", &payload);
        assert_eq!(h1, h2);
    }

    #[test]
    fn different_seq_changes_hash() {
        let ts = Utc::now();
        let payload = serde_json::json!({"a": 1});
        let h1 = compute_hash("0", 0, ts, "grant", &payload);
        let h2 = compute_hash("0", 1, ts, "grant", &payload);
        assert_ne!(h1, h2);
    }

    #[test]
    fn tampered_payload_breaks_self_consistency() {
        let ts = Utc::now();
        let payload = serde_json::json!({"a": 1});
        let hash = compute_hash(GENESIS_PREV_HASH, 0, ts, "grant", &payload);
        let mut entry = AuditEntry {
            seq: 0,
            ts,
            kind: "grant".to_string(),
            payload,
            prev_hash: GENESIS_PREV_HASH.to_string(),
            hash,
        };
        assert!(entry.hash_is_self_consistent());
        entry.payload = serde_json::json!({"a": 2});
        assert!(!entry.hash_is_self_consistent());
    }
}
