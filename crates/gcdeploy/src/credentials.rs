//! SSH private key loading.
//!
//! [`load`] turns a key file and an optional passphrase into an
//! [`AuthHandle`]. An encrypted key with no passphrase is reported as
//! [`CredentialError::NeedsPassphrase`] so the caller can prompt the operator
//! instead of failing the connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::keys::ssh_key::HashAlg;
use russh::keys::{self, PrivateKey};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::debug;

/// Errors from loading a private key.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("key {} is encrypted and needs a passphrase", .path.display())]
    NeedsPassphrase { path: PathBuf },

    #[error("invalid private key {}: {source}", .path.display())]
    InvalidKey {
        path: PathBuf,
        #[source]
        source: keys::Error,
    },

    #[error("failed to read private key {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CredentialError {
    pub fn needs_passphrase(&self) -> bool {
        matches!(self, CredentialError::NeedsPassphrase { .. })
    }
}

/// Decoded private key, ready to sign an authentication request.
#[derive(Clone)]
pub struct AuthHandle {
    key: Arc<PrivateKey>,
    path: PathBuf,
}

impl AuthHandle {
    pub fn key(&self) -> Arc<PrivateKey> {
        Arc::clone(&self.key)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// SHA-256 fingerprint of the public half.
    pub fn fingerprint(&self) -> String {
        self.key.public_key().fingerprint(HashAlg::Sha256).to_string()
    }
}

impl std::fmt::Debug for AuthHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthHandle")
            .field("path", &self.path)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Load the private key at `key_path`.
///
/// The key is parsed without a passphrase first. Only when that fails because
/// the key is encrypted is `passphrase` used, exactly once.
pub fn load(key_path: &Path, passphrase: &SecretString) -> Result<AuthHandle, CredentialError> {
    let contents =
        std::fs::read_to_string(key_path).map_err(|source| CredentialError::Unreadable {
            path: key_path.to_path_buf(),
            source,
        })?;

    let key = match keys::decode_secret_key(&contents, None) {
        Ok(key) => key,
        Err(keys::Error::KeyIsEncrypted) => {
            let passphrase = passphrase.expose_secret();
            if passphrase.is_empty() {
                return Err(CredentialError::NeedsPassphrase {
                    path: key_path.to_path_buf(),
                });
            }
            keys::decode_secret_key(&contents, Some(passphrase)).map_err(|source| {
                CredentialError::InvalidKey {
                    path: key_path.to_path_buf(),
                    source,
                }
            })?
        }
        Err(source) => {
            return Err(CredentialError::InvalidKey {
                path: key_path.to_path_buf(),
                source,
            })
        }
    };

    let handle = AuthHandle {
        key: Arc::new(key),
        path: key_path.to_path_buf(),
    };
    debug!(path = %key_path.display(), fingerprint = %handle.fingerprint(), "Loaded private key");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join(name)
    }

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[test]
    fn test_plain_key_without_passphrase() {
        let handle = load(&fixture("plain_ed25519"), &secret("")).unwrap();
        assert_eq!(handle.path(), fixture("plain_ed25519"));
        assert!(handle.fingerprint().starts_with("SHA256:"));
    }

    #[test]
    fn test_plain_key_ignores_passphrase() {
        assert!(load(&fixture("plain_ed25519"), &secret("unused")).is_ok());
    }

    #[test]
    fn test_encrypted_key_needs_passphrase() {
        let err = load(&fixture("encrypted_ed25519"), &secret("")).unwrap_err();
        assert!(err.needs_passphrase());
        assert!(matches!(err, CredentialError::NeedsPassphrase { .. }));
    }

    #[test]
    fn test_encrypted_key_correct_passphrase() {
        let handle = load(&fixture("encrypted_ed25519"), &secret("correct horse")).unwrap();
        assert!(handle.fingerprint().starts_with("SHA256:"));
    }

    #[test]
    fn test_encrypted_key_wrong_passphrase() {
        let err = load(&fixture("encrypted_ed25519"), &secret("battery staple")).unwrap_err();
        assert!(matches!(err, CredentialError::InvalidKey { .. }));
        assert!(!err.needs_passphrase());
    }

    #[test]
    fn test_garbage_key_is_invalid() {
        let err = load(&fixture("garbage.key"), &secret("")).unwrap_err();
        assert!(matches!(err, CredentialError::InvalidKey { .. }));
    }

    #[test]
    fn test_missing_key_is_unreadable() {
        let err = load(Path::new("/nonexistent/id_ed25519"), &secret("")).unwrap_err();
        assert!(matches!(err, CredentialError::Unreadable { .. }));
    }

    #[test]
    fn test_debug_hides_key_material() {
        let handle = load(&fixture("plain_ed25519"), &secret("")).unwrap();
        let debug = format!("{handle:?}");
        assert!(debug.contains("fingerprint"));
        assert!(!debug.contains("BEGIN OPENSSH"));
    }
}
