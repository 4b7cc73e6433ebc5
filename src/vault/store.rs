//! Encrypted Store: authenticated-encryption persistence for opaque blobs.
//!
//! Each key is one file on disk, named `<key>.enc`, containing a random
//! 12-byte nonce followed by the `ChaCha20-Poly1305` ciphertext (which
//! includes its own authentication tag). The store fails closed: if the key
//! cannot be derived, or a file's tag fails to verify, the record is
//! reported as [`MoatError::NotFound`] rather than surfaced as corruption,
//! per the encrypted-store design's "fails closed" requirement. A separate
//! integrity failure after a positive directory listing (the bytes exist
//! but don't decrypt) is reported as [`MoatError::Corrupt`].

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use fs2::FileExt as _;
use hkdf::Hkdf;
use rand::RngCore as _;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{MoatError, Result};

const NONCE_LEN: usize = 12;
const HKDF_INFO: &[u8] = b"moat-encrypted-store-v1";
const MASTER_KEY_ENV: &str = "MOAT_MASTER_KEY";

/// A directory of individually AEAD-encrypted blobs.
#[derive(Debug)]
pub struct EncryptedStore {
    dir: PathBuf,
    key: Zeroizing<[u8; 32]>,
}

impl EncryptedStore {
    /// Open (creating if necessary) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }
        let key = derive_key()?;
        Ok(Self { dir, key })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.enc", sanitize(key)))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", sanitize(key)))
    }

    /// Encrypt and atomically persist `plaintext` under `key`.
    pub fn put(&self, key: &str, plaintext: &[u8]) -> Result<()> {
        let cipher = ChaCha20Poly1305::new((&*self.key).into());
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| MoatError::KeyUnavailable {
                reason: "encryption failed".to_string(),
            })?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.lock_path(key))?;
        lock_file.lock_exclusive()?;

        let final_path = self.path_for(key);
        let tmp_path = self.dir.join(format!("{}.tmp", sanitize(key)));
        {
            let mut tmp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            tmp.write_all(&payload)?;
            tmp.sync_all()?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp_path, &final_path)?;
        fs2::FileExt::unlock(&lock_file)?;
        Ok(())
    }

    /// Decrypt the record stored under `key`.
    ///
    /// Missing files and tag-verification failures are both reported as
    /// `NotFound` (fail-closed); only a readable-but-undecryptable file that
    /// exists is treated differently from a genuinely absent one at the
    /// call site via [`EncryptedStore::contains`] when that distinction
    /// matters.
    pub fn get(&self, key: &str) -> Result<Zeroizing<Vec<u8>>> {
        let path = self.path_for(key);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MoatError::NotFound {
                    what: "credential",
                    id: key.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if bytes.len() < NONCE_LEN {
            return Err(MoatError::Corrupt {
                location: path.display().to_string(),
                reason: "file shorter than nonce length".to_string(),
            });
        }

        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new((&*self.key).into());
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher.decrypt(nonce, ciphertext).map_err(|_| MoatError::NotFound {
            what: "credential",
            id: key.to_string(),
        })?;

        Ok(Zeroizing::new(plaintext))
    }

    /// Remove the record stored under `key`, if any.
    pub fn delete(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List the keys for which a record currently exists.
    pub fn list_keys(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("enc") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    out.push(stem.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Whether a record file exists for `key` (regardless of whether it
    /// still decrypts).
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.path_for(key).exists()
    }
}

fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn derive_key() -> Result<Zeroizing<[u8; 32]>> {
    let ikm: Zeroizing<Vec<u8>> = if let Ok(env_key) = std::env::var(MASTER_KEY_ENV) {
        Zeroizing::new(decode_master_key(&env_key)?)
    } else {
        let id = crate::utils::machine_id::machine_id().map_err(|e| MoatError::KeyUnavailable {
            reason: format!("could not determine machine id: {e}"),
        })?;
        Zeroizing::new(id.into_bytes())
    };

    let hk = Hkdf::<Sha256>::new(Some(b"moat-store-v1-salt"), &ikm);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(HKDF_INFO, &mut *okm)
        .map_err(|_| MoatError::KeyUnavailable {
            reason: "HKDF expand failed".to_string(),
        })?;
    Ok(okm)
}

fn decode_master_key(raw: &str) -> Result<Vec<u8>> {
    if let Ok(bytes) = hex_decode(raw) {
        return Ok(bytes);
    }
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map_err(|_| MoatError::KeyUnavailable {
            reason: format!("{MASTER_KEY_ENV} is neither valid hex nor base64"),
        })
}

fn hex_decode(s: &str) -> std::result::Result<Vec<u8>, ()> {
    if s.len() % 2 != 0 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let store = EncryptedStore::open(dir.path().to_path_buf()).unwrap();
        store.put("github", b"ghp_ABCD1234").unwrap();
        let got = store.get("github").unwrap();
        assert_eq!(&*got, b"ghp_ABCD1234");
    }

    #[test]
    fn missing_key_is_not_found() {
        let dir = tempdir().unwrap();
        let store = EncryptedStore::open(dir.path().to_path_buf()).unwrap();
        let err = store.get("nope").unwrap_err();
        assert!(matches!(err, MoatError::NotFound { .. }));
    }

    #[test]
    fn tampered_ciphertext_fails_closed_as_not_found() {
        let dir = tempdir().unwrap();
        let store = EncryptedStore::open(dir.path().to_path_buf()).unwrap();
        store.put("github", b"secret").unwrap();

        let path = store.path_for("github");
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let err = store.get("github").unwrap_err();
        assert!(matches!(err, MoatError::NotFound { .. }));
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = EncryptedStore::open(dir.path().to_path_buf()).unwrap();
        store.put("x", b"y").unwrap();
        store.delete("x").unwrap();
        store.delete("x").unwrap();
        assert!(!store.contains("x"));
    }

    #[test]
    fn list_keys_reflects_contents() {
        let dir = tempdir().unwrap();
        let store = EncryptedStore::open(dir.path().to_path_buf()).unwrap();
        store.put("alpha", b"1").unwrap();
        store.put("beta", b"2").unwrap();
        assert_eq!(store.list_keys().unwrap(), vec!["alpha", "beta"]);
    }
}
