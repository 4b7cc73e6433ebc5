//! Certificate Authority (C): a long-lived root plus on-demand, cached leaf
//! certificates for arbitrary SNI hostnames.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use hudsucker::certificate_authority::RcgenAuthority;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::crypto::aws_lc_rs::default_provider;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{MoatError, Result};

/// Leaf certificates are valid for at most this long.
const LEAF_MAX_VALIDITY_DAYS: i64 = 90;
/// Root certificate validity.
const ROOT_VALIDITY_DAYS: i64 = 3650;

/// A cached leaf certificate (PEM cert + PEM key).
#[derive(Debug, Clone)]
pub struct LeafCert {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

/// The proxy's certificate authority: one self-signed root, an on-demand
/// leaf cache keyed by hostname (memory + disk), and per-hostname issuance
/// locks so concurrent requests for the same host never race.
pub struct CertificateAuthority {
    cert_path: PathBuf,
    key_path: PathBuf,
    leaf_dir: PathBuf,
    memory_cache: DashMap<String, LeafCert>,
    issuance_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_path", &self.cert_path)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Load the root CA from `state_dir`, generating it on first use.
    pub fn load_or_generate(state_dir: &std::path::Path) -> Result<Self> {
        let cert_path = state_dir.join("ca").join("cert.pem");
        let key_path = state_dir.join("ca").join("key.pem");
        let leaf_dir = state_dir.join("ca").join("leaves");
        std::fs::create_dir_all(&leaf_dir)?;

        if !cert_path.exists() || !key_path.exists() {
            Self::generate_root(&cert_path, &key_path)?;
        }

        Ok(Self {
            cert_path,
            key_path,
            leaf_dir,
            memory_cache: DashMap::new(),
            issuance_locks: DashMap::new(),
        })
    }

    fn generate_root(cert_path: &std::path::Path, key_path: &std::path::Path) -> Result<()> {
        if let Some(parent) = cert_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Moat Proxy CA");
        dn.push(DnType::OrganizationName, "Moat");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = params.not_before + time::Duration::days(ROOT_VALIDITY_DAYS);

        let key_pair = KeyPair::generate().map_err(rcgen_err)?;
        let cert = params.self_signed(&key_pair).map_err(rcgen_err)?;

        std::fs::write(cert_path, cert.pem())?;
        std::fs::write(key_path, key_pair.serialize_pem())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// The root certificate in DER form, for mounting into containers as a
    /// trusted CA bundle.
    pub fn root_cert_bytes(&self) -> Result<Vec<u8>> {
        let pem = std::fs::read_to_string(&self.cert_path)?;
        let der = rustls_pemfile::certs(&mut pem.as_bytes())
            .next()
            .ok_or_else(|| MoatError::Corrupt {
                location: self.cert_path.display().to_string(),
                reason: "no certificate found in root PEM".to_string(),
            })?
            .map_err(|e| MoatError::Corrupt {
                location: self.cert_path.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(der.to_vec())
    }

    fn leaf_path(&self, hostname: &str) -> PathBuf {
        self.leaf_dir.join(format!("{}.json", sanitize(hostname)))
    }

    /// Issue (or return a cached) leaf certificate for `hostname`. Two calls
    /// for the same hostname return identical certificate bytes (cache
    /// idempotence), as required by the round-trip laws.
    pub async fn issue_leaf(&self, hostname: &str) -> Result<LeafCert> {
        if let Some(cached) = self.memory_cache.get(hostname) {
            return Ok(cached.clone());
        }

        let lock = self
            .issuance_locks
            .entry(hostname.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another task may have populated the cache while we waited.
        if let Some(cached) = self.memory_cache.get(hostname) {
            return Ok(cached.clone());
        }

        if let Ok(bytes) = std::fs::read(self.leaf_path(hostname)) {
            if let Ok(leaf) = serde_json::from_slice::<LeafCert>(&bytes) {
                self.memory_cache.insert(hostname.to_string(), leaf.clone());
                return Ok(leaf);
            }
        }

        let leaf = self.generate_leaf(hostname)?;
        std::fs::write(self.leaf_path(hostname), serde_json::to_vec(&leaf)?)?;
        self.memory_cache.insert(hostname.to_string(), leaf.clone());
        Ok(leaf)
    }

    fn generate_leaf(&self, hostname: &str) -> Result<LeafCert> {
        let cert_pem = std::fs::read_to_string(&self.cert_path)?;
        let key_pem = std::fs::read_to_string(&self.key_path)?;
        let ca_key_pair = KeyPair::from_pem(&key_pem).map_err(rcgen_err)?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, ca_key_pair).map_err(rcgen_err)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        params.distinguished_name = dn;
        let dns_name = hostname
            .to_owned()
            .try_into()
            .map_err(|_| MoatError::InvalidArgument {
                message: format!("'{hostname}' is not a valid DNS name"),
            })?;
        params.subject_alt_names = vec![SanType::DnsName(dns_name)];
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = params.not_before + time::Duration::days(LEAF_MAX_VALIDITY_DAYS);

        let key_pair = KeyPair::generate().map_err(rcgen_err)?;
        let cert = params.signed_by(&key_pair, &issuer).map_err(rcgen_err)?;

        Ok(LeafCert {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Build a hudsucker [`RcgenAuthority`] backed by this root, for the
    /// proxy's MITM TLS termination toward clients.
    pub fn to_rcgen_authority(&self) -> Result<RcgenAuthority> {
        let cert_pem = std::fs::read_to_string(&self.cert_path)?;
        let key_pem = std::fs::read_to_string(&self.key_path)?;
        let key_pair = KeyPair::from_pem(&key_pem).map_err(rcgen_err)?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair).map_err(rcgen_err)?;
        Ok(RcgenAuthority::new(issuer, 1000, default_provider()))
    }
}

impl serde::Serialize for LeafCert {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct as _;
        let mut st = s.serialize_struct("LeafCert", 2)?;
        st.serialize_field("cert_pem", &self.cert_pem)?;
        st.serialize_field("key_pem", &self.key_pem)?;
        st.end()
    }
}

impl<'de> serde::Deserialize<'de> for LeafCert {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        #[derive(serde::Deserialize)]
        struct Raw {
            cert_pem: String,
            key_pem: String,
        }
        let raw = Raw::deserialize(d)?;
        Ok(Self {
            cert_pem: raw.cert_pem,
            key_pem: raw.key_pem,
        })
    }
}

fn sanitize(hostname: &str) -> String {
    hostname
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

fn rcgen_err(e: rcgen::Error) -> MoatError {
    MoatError::Corrupt {
        location: "certificate authority".to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn generates_and_reloads_root() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::load_or_generate(dir.path()).unwrap();
        assert!(ca.cert_path.exists());
        let _authority = ca.to_rcgen_authority().unwrap();

        let ca2 = CertificateAuthority::load_or_generate(dir.path()).unwrap();
        let _authority2 = ca2.to_rcgen_authority().unwrap();
    }

    #[tokio::test]
    async fn issuing_twice_for_same_host_is_idempotent() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::load_or_generate(dir.path()).unwrap();
        let first = ca.issue_leaf("api.example.com").await.unwrap();
        let second = ca.issue_leaf("api.example.com").await.unwrap();
        assert_eq!(first.cert_pem, second.cert_pem);
    }

    #[tokio::test]
    async fn leaf_survives_reload_from_disk_cache() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::load_or_generate(dir.path()).unwrap();
        let first = ca.issue_leaf("cached.example.com").await.unwrap();

        let ca2 = CertificateAuthority::load_or_generate(dir.path()).unwrap();
        let second = ca2.issue_leaf("cached.example.com").await.unwrap();
        assert_eq!(first.cert_pem, second.cert_pem);
    }

    #[test]
    fn root_cert_bytes_are_der_encoded() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::load_or_generate(dir.path()).unwrap();
        let der = ca.root_cert_bytes().unwrap();
        assert!(!der.is_empty());
    }
}
