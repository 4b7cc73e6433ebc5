//! Encrypted Store (A) and Credential Vault (B).
//!
//! The Store persists opaque AEAD-encrypted blobs; the Vault is a typed
//! facade adding expiry/refresh, grant-time validation, and the
//! injection-token binding that hands credential-views to the proxy.

/// Typed credential records, SSH mappings, and the Vault facade.
pub mod credential;
/// Tagged-variant provider descriptors (§9 dynamic-dispatch replacement).
pub mod provider;
/// Authenticated-encryption blob storage.
pub mod store;

pub use credential::{Binding, Credential, CredentialView, SshMapping, Vault};
pub use provider::{InjectScheme, ProviderBinding, ProviderDescriptor};
pub use store::EncryptedStore;
