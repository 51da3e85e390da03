//! Symmetric encryption of audit records
//!
//! Each record is sealed with AES-256-GCM under a fresh random 96-bit nonce.
//! The stored line is `base64(nonce ‖ ciphertext)` so every line decrypts on
//! its own.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::info;

use super::AuditError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// AES-256-GCM sealer for audit lines
#[derive(Clone)]
pub struct AuditCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for AuditCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuditCipher(..)")
    }
}

impl AuditCipher {
    pub fn from_key(key: &[u8]) -> Result<Self, AuditError> {
        if key.len() != KEY_LEN {
            return Err(AuditError::Key {
                reason: format!("expected {} key bytes, got {}", KEY_LEN, key.len()),
            });
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| AuditError::Key {
            reason: e.to_string(),
        })?;
        Ok(Self { cipher })
    }

    /// Fresh random key, never persisted
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    /// Read a base64 key file, or create one readable only by the owner
    pub fn load_or_create(path: &Path) -> Result<Self, AuditError> {
        if path.exists() {
            let encoded = fs::read_to_string(path)?;
            let key = BASE64
                .decode(encoded.trim().as_bytes())
                .map_err(|e| AuditError::Key {
                    reason: format!("{}: {}", path.display(), e),
                })?;
            return Self::from_key(&key);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        write_restricted(path, BASE64.encode(key).as_bytes())?;
        info!("Created audit key file {}", path.display());
        Self::from_key(&key)
    }

    /// Encrypt one plaintext into a base64 line (no newline)
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, AuditError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| AuditError::Crypto {
                reason: "encryption failed".to_string(),
            })?;

        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(&nonce_bytes);
        framed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(framed))
    }

    /// Decrypt a line produced by [`seal`](Self::seal)
    pub fn open(&self, line: &str) -> Result<Vec<u8>, AuditError> {
        let framed = BASE64
            .decode(line.trim().as_bytes())
            .map_err(|e| AuditError::Crypto {
                reason: format!("invalid base64: {}", e),
            })?;
        if framed.len() < NONCE_LEN {
            return Err(AuditError::Crypto {
                reason: "record shorter than nonce".to_string(),
            });
        }
        let (nonce_bytes, ciphertext) = framed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| AuditError::Crypto {
                reason: "authentication failed".to_string(),
            })
    }
}

fn write_restricted(path: &Path, data: &[u8]) -> Result<(), AuditError> {
    let mut options = OpenOptions::new();
    options.create_new(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let cipher = AuditCipher::generate();
        let line = cipher.seal(b"{\"sequenceNumber\":1}").unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(cipher.open(&line).unwrap(), b"{\"sequenceNumber\":1}");
    }

    #[test]
    fn test_nonce_is_fresh_per_record() {
        let cipher = AuditCipher::generate();
        assert_ne!(cipher.seal(b"same").unwrap(), cipher.seal(b"same").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let line = AuditCipher::generate().seal(b"secret").unwrap();
        assert!(matches!(
            AuditCipher::generate().open(&line),
            Err(AuditError::Crypto { .. })
        ));
    }

    #[test]
    fn test_load_or_create_persists_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("audit.key");

        let first = AuditCipher::load_or_create(&path).unwrap();
        let line = first.seal(b"hello").unwrap();
        let second = AuditCipher::load_or_create(&path).unwrap();
        assert_eq!(second.open(&line).unwrap(), b"hello");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_short_key_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.key");
        fs::write(&path, BASE64.encode([1u8; 16])).unwrap();
        assert!(matches!(
            AuditCipher::load_or_create(&path),
            Err(AuditError::Key { .. })
        ));
    }
}
