//! Credential Vault: a typed facade over the [`EncryptedStore`] adding
//! expiry/refresh, grant-time validation, and injection-token binding.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore as _;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use zeroize::Zeroizing;

use crate::error::{MoatError, Result};
use crate::vault::provider::{self, InjectScheme};
use crate::vault::store::EncryptedStore;

/// `auth_type` metadata discriminant.
pub const AUTH_TYPE_API_KEY: &str = "api-key";
/// `auth_type` metadata discriminant.
pub const AUTH_TYPE_OAUTH: &str = "oauth";

/// A typed credential record as defined by the data model: one token per
/// provider, with optional OAuth refresh material carried in `metadata`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Short provider identifier (`"github"`, `"anthropic"`, `"mcp-foo"`, ...).
    pub provider: String,
    /// The opaque secret token. Never logged; see the redacting [`fmt::Debug`].
    pub token: String,
    /// Scopes the token was granted with, if known.
    pub scopes: Vec<String>,
    /// Absolute UTC expiry, if the credential is time-limited.
    pub expires_at: Option<DateTime<Utc>>,
    /// When this record was created (grant time, not issue time).
    pub created_at: DateTime<Utc>,
    /// Auxiliary fields: `auth_type`, `refresh_token`, `token_url`, `client_id`.
    pub metadata: HashMap<String, String>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("provider", &self.provider)
            .field("token", &"<redacted>")
            .field("scopes", &self.scopes)
            .field("expires_at", &self.expires_at)
            .field("created_at", &self.created_at)
            .field("metadata", &"<redacted>")
            .finish()
    }
}

impl Credential {
    /// Whether this credential is expired as of `now` (inclusive: exactly
    /// `now` counts as expired, per the boundary-behaviour requirement).
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    fn refresh_token(&self) -> Option<&str> {
        self.metadata.get("refresh_token").map(String::as_str)
    }

    fn token_url(&self) -> Option<&str> {
        self.metadata.get("token_url").map(String::as_str)
    }
}

/// A many-to-many mapping from host to an ssh-agent identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshMapping {
    /// Host this identity should be used for.
    pub host: String,
    /// Fingerprint of the key, as reported by `ssh-add -l`.
    pub key_fingerprint: String,
    /// Path to the private key file, if known (vs. agent-only).
    pub key_path: Option<PathBuf>,
    /// When this mapping was recorded.
    pub created_at: DateTime<Utc>,
}

/// The minimum material the proxy needs to rewrite one request: how to
/// inject, any static auxiliary headers, and the resolved secret.
#[derive(Clone)]
pub struct CredentialView {
    /// Provider that produced this view (recorded in request records).
    pub provider: String,
    /// How to write the secret into the request.
    pub inject: InjectScheme,
    /// Headers that accompany every request using this view.
    pub aux_headers: Vec<(String, String)>,
    /// The resolved secret. Zeroized on drop.
    pub secret: Zeroizing<String>,
}

impl fmt::Debug for CredentialView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialView")
            .field("provider", &self.provider)
            .field("inject", &self.inject)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A fresh injection token plus the per-host credential-views it unlocks,
/// produced by [`Vault::bind`] and handed to the proxy's Registry.
#[derive(Debug)]
pub struct Binding {
    /// High-entropy opaque token naming the run context in the proxy.
    pub token: String,
    /// Host pattern to credential-view, as the proxy will match it.
    pub views: Vec<(String, CredentialView)>,
    /// Host patterns for grants that are recognized providers but whose
    /// credential could not be resolved right now (expired with no usable
    /// refresh, or never actually granted). These hosts are still reachable
    /// through the run context, but the proxy has no view to inject for
    /// them and must answer `407` instead of forwarding un-injected or
    /// refusing the host outright (see S3).
    pub unresolved_hosts: Vec<String>,
}

const STORE_KEY_PREFIX_SSH: &str = "ssh-";

/// The Credential Vault.
pub struct Vault {
    store: EncryptedStore,
    refresh_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    http: reqwest::Client,
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault").finish_non_exhaustive()
    }
}

impl Vault {
    /// Open a vault backed by an encrypted store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            store: EncryptedStore::open(dir)?,
            refresh_locks: DashMap::new(),
            http: reqwest::Client::new(),
        })
    }

    /// Grant (create or replace) a credential. Runs the provider's
    /// validation probe first when `probe` is `true`; a failed probe yields
    /// [`MoatError::InvalidCredential`] without persisting anything.
    pub async fn grant(&self, credential: Credential, probe: bool) -> Result<()> {
        provider::require_known(&credential.provider)?;

        if credential.provider.is_empty() || credential.token.is_empty() {
            return Err(MoatError::InvalidArgument {
                message: "provider and token must be non-empty".to_string(),
            });
        }

        if probe {
            self.run_probe(&credential).await?;
        }

        let bytes = serde_json::to_vec(&credential)?;
        self.store.put(&credential.provider, &bytes)
    }

    async fn run_probe(&self, credential: &Credential) -> Result<()> {
        let Some(url) = probe_url(&credential.provider) else {
            return Ok(());
        };
        let resp = self
            .http
            .get(url)
            .bearer_auth(&credential.token)
            .send()
            .await
            .map_err(|e| MoatError::InvalidCredential {
                provider: format!("{}: probe request failed ({e})", credential.provider),
            })?;
        if resp.status().is_client_error() {
            return Err(MoatError::InvalidCredential {
                provider: credential.provider.clone(),
            });
        }
        Ok(())
    }

    /// Fetch a credential, refreshing it silently if it is OAuth-backed,
    /// expired, and carries a refresh token. Concurrent callers for the
    /// same provider share a single refresh round-trip.
    pub async fn get(&self, provider: &str) -> Result<Credential> {
        let bytes = self.store.get(provider)?;
        let credential: Credential = serde_json::from_slice(&bytes)?;

        if !credential.is_expired_at(Utc::now()) {
            return Ok(credential);
        }

        if credential.refresh_token().is_some() && credential.token_url().is_some() {
            return self.refresh(provider).await;
        }

        Err(MoatError::NotFound {
            what: "credential",
            id: provider.to_string(),
        })
    }

    async fn refresh(&self, provider: &str) -> Result<Credential> {
        let lock = self
            .refresh_locks
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Re-read: another task may have completed the refresh while we
        // waited for the lock.
        let bytes = self.store.get(provider)?;
        let mut credential: Credential = serde_json::from_slice(&bytes)?;
        if !credential.is_expired_at(Utc::now()) {
            return Ok(credential);
        }

        let Some(refresh_token) = credential.refresh_token().map(str::to_string) else {
            return Err(MoatError::NotFound {
                what: "credential",
                id: provider.to_string(),
            });
        };
        let Some(token_url) = credential.token_url().map(str::to_string) else {
            return Err(MoatError::NotFound {
                what: "credential",
                id: provider.to_string(),
            });
        };

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            #[serde(default)]
            refresh_token: Option<String>,
            #[serde(default)]
            expires_in: Option<i64>,
        }

        let mut form = HashMap::new();
        form.insert("grant_type", "refresh_token");
        form.insert("refresh_token", refresh_token.as_str());
        if let Some(client_id) = credential.metadata.get("client_id") {
            form.insert("client_id", client_id.as_str());
        }

        let resp = self
            .http
            .post(token_url.as_str())
            .form(&form)
            .send()
            .await
            .map_err(|e| MoatError::UpstreamUnavailable {
                host: token_url.clone(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(MoatError::UpstreamUnavailable {
                host: token_url,
                reason: format!("refresh returned {}", resp.status()),
            });
        }

        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| MoatError::Corrupt {
                location: "oauth refresh response".to_string(),
                reason: e.to_string(),
            })?;

        credential.token = parsed.access_token;
        if let Some(rt) = parsed.refresh_token {
            credential.metadata.insert("refresh_token".to_string(), rt);
        }
        credential.expires_at = parsed
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));

        let bytes = serde_json::to_vec(&credential)?;
        self.store.put(provider, &bytes)?;
        Ok(credential)
    }

    /// Permanently remove a credential.
    pub fn revoke(&self, provider: &str) -> Result<()> {
        self.store.delete(provider)
    }

    /// List all granted credentials (including expired ones).
    pub fn list(&self) -> Result<Vec<Credential>> {
        let mut out = Vec::new();
        for key in self.store.list_keys()? {
            if key.starts_with(STORE_KEY_PREFIX_SSH) {
                continue;
            }
            if let Ok(bytes) = self.store.get(&key) {
                out.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(out)
    }

    /// Record an ssh-agent identity mapping for `host`.
    pub fn put_ssh_mapping(&self, mapping: &SshMapping) -> Result<()> {
        let key = format!("{STORE_KEY_PREFIX_SSH}{}", sanitize_host(&mapping.host));
        self.store.put(&key, &serde_json::to_vec(mapping)?)
    }

    /// Look up the ssh-agent identity mapping for `host`.
    pub fn get_ssh_mapping(&self, host: &str) -> Result<SshMapping> {
        let key = format!("{STORE_KEY_PREFIX_SSH}{}", sanitize_host(host));
        let bytes = self.store.get(&key)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Remove the ssh-agent identity mapping for `host`.
    pub fn delete_ssh_mapping(&self, host: &str) -> Result<()> {
        let key = format!("{STORE_KEY_PREFIX_SSH}{}", sanitize_host(host));
        self.store.delete(&key)
    }

    /// Produce a fresh injection token and the credential-views it unlocks
    /// for `grants`. `mcp_hosts` supplies the upstream host for any
    /// `mcp-<name>` grant (its binding is not static). Unknown grants yield
    /// [`MoatError::UnknownProvider`] before any token is generated.
    pub async fn bind(&self, grants: &[String], mcp_hosts: &HashMap<String, String>) -> Result<Binding> {
        for grant in grants {
            provider::require_known(grant)?;
        }

        let mut views = Vec::new();
        let mut unresolved_hosts = Vec::new();
        for grant in grants {
            if let Some(host) = grant.strip_prefix(provider::MCP_PREFIX) {
                let host = mcp_hosts.get(grant).cloned().unwrap_or_else(|| host.to_string());
                let credential = match self.get(grant).await {
                    Ok(credential) => credential,
                    Err(MoatError::NotFound { .. }) => {
                        unresolved_hosts.push(host);
                        continue;
                    }
                    Err(err) => return Err(err),
                };
                views.push((
                    host,
                    CredentialView {
                        provider: grant.clone(),
                        inject: InjectScheme::Header {
                            header: "Authorization",
                            format: "Bearer {}",
                        },
                        aux_headers: Vec::new(),
                        secret: Zeroizing::new(credential.token),
                    },
                ));
                continue;
            }

            let descriptor = provider::find(grant).expect("checked known above");
            // A grant whose credential cannot be resolved right now (expired
            // with no usable refresh, or never actually granted) does not
            // fail the whole run: its host patterns are recorded as
            // unresolved so the proxy can answer 407 per-request instead
            // (see S3), and `start()` still succeeds.
            let credential = match self.get(grant).await {
                Ok(credential) => credential,
                Err(MoatError::NotFound { .. }) => {
                    unresolved_hosts.extend(descriptor.bindings.iter().map(|b| b.host_pattern.to_string()));
                    continue;
                }
                Err(err) => return Err(err),
            };
            for binding in descriptor.bindings {
                views.push((
                    binding.host_pattern.to_string(),
                    CredentialView {
                        provider: grant.clone(),
                        inject: binding.inject,
                        aux_headers: binding
                            .aux_headers
                            .iter()
                            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                            .collect(),
                        secret: Zeroizing::new(credential.token.clone()),
                    },
                ));
            }
        }

        Ok(Binding {
            token: random_token(),
            views,
            unresolved_hosts,
        })
    }
}

fn sanitize_host(host: &str) -> String {
    host.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

fn random_token() -> String {
    let mut bytes = [0u8; 24]; // 192 bits, well over the required 128-bit minimum
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn probe_url(provider: &str) -> Option<&'static str> {
    match provider {
        "github" => Some("https://api.github.com/user"),
        "anthropic" => None, // no side-effect-free probe endpoint
        "openai" => Some("https://api.openai.com/v1/models"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_credential(provider: &str) -> Credential {
        Credential {
            provider: provider.to_string(),
            token: "tok".to_string(),
            scopes: vec![],
            expires_at: None,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn grant_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let vault = Vault::open(dir.path().to_path_buf()).unwrap();
        vault.grant(sample_credential("github"), false).await.unwrap();
        let got = vault.get("github").await.unwrap();
        assert_eq!(got.token, "tok");
    }

    #[tokio::test]
    async fn expired_with_no_refresh_token_is_not_found() {
        let dir = tempdir().unwrap();
        let vault = Vault::open(dir.path().to_path_buf()).unwrap();
        let mut cred = sample_credential("anthropic");
        cred.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        vault.grant(cred, false).await.unwrap();

        let err = vault.get("anthropic").await.unwrap_err();
        assert!(matches!(err, MoatError::NotFound { .. }));
    }

    #[tokio::test]
    async fn expiry_exactly_at_now_counts_as_expired() {
        let cred = Credential {
            expires_at: Some(Utc::now()),
            ..sample_credential("github")
        };
        assert!(cred.is_expired_at(cred.expires_at.unwrap()));
    }

    #[tokio::test]
    async fn unknown_grant_is_rejected_before_any_binding_is_produced() {
        let dir = tempdir().unwrap();
        let vault = Vault::open(dir.path().to_path_buf()).unwrap();
        let err = vault
            .bind(&["not-a-provider".to_string()], &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MoatError::UnknownProvider { .. }));
    }

    #[tokio::test]
    async fn bind_produces_one_view_per_host_pattern() {
        let dir = tempdir().unwrap();
        let vault = Vault::open(dir.path().to_path_buf()).unwrap();
        vault.grant(sample_credential("github"), false).await.unwrap();

        let binding = vault.bind(&["github".to_string()], &HashMap::new()).await.unwrap();
        assert_eq!(binding.views.len(), 2); // api.github.com + github.com
        assert!(binding.token.len() >= 32);
    }

    #[tokio::test]
    async fn bind_skips_an_expired_grant_instead_of_failing() {
        // S3: an expired anthropic credential with no refresh token must not
        // fail the whole bind; its host pattern surfaces as unresolved so
        // the run still starts and the proxy can answer 407 per request.
        let dir = tempdir().unwrap();
        let vault = Vault::open(dir.path().to_path_buf()).unwrap();
        let mut cred = sample_credential("anthropic");
        cred.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        vault.grant(cred, false).await.unwrap();

        let binding = vault.bind(&["anthropic".to_string()], &HashMap::new()).await.unwrap();
        assert!(binding.views.is_empty());
        assert_eq!(binding.unresolved_hosts, vec!["api.anthropic.com".to_string()]);
    }

    #[tokio::test]
    async fn bind_skips_a_never_granted_provider_instead_of_failing() {
        let dir = tempdir().unwrap();
        let vault = Vault::open(dir.path().to_path_buf()).unwrap();

        let binding = vault.bind(&["github".to_string()], &HashMap::new()).await.unwrap();
        assert!(binding.views.is_empty());
        assert!(binding.unresolved_hosts.contains(&"api.github.com".to_string()));
    }

    #[test]
    fn ssh_mapping_round_trips() {
        let dir = tempdir().unwrap();
        let vault = Vault::open(dir.path().to_path_buf()).unwrap();
        let mapping = SshMapping {
            host: "git.example.com".to_string(),
            key_fingerprint: "SHA256:abc".to_string(),
            key_path: None,
            created_at: Utc::now(),
        };
        vault.put_ssh_mapping(&mapping).unwrap();
        let got = vault.get_ssh_mapping("git.example.com").unwrap();
        assert_eq!(got.key_fingerprint, "SHA256:abc");
    }

    #[test]
    fn list_excludes_ssh_mappings() {
        let dir = tempdir().unwrap();
        let vault = Vault::open(dir.path().to_path_buf()).unwrap();
        vault.put_ssh_mapping(&SshMapping {
            host: "x".to_string(),
            key_fingerprint: "f".to_string(),
            key_path: None,
            created_at: Utc::now(),
        }).unwrap();
        assert!(vault.list().unwrap().is_empty());
    }
}
