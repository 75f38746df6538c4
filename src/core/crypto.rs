//! Secret codec for settings flagged as secret
//!
//! Values are sealed with AES-256-GCM under a 32-byte master key. A fresh
//! 12-byte nonce is generated per encryption and prepended to the
//! ciphertext; the result is base64 encoded so it can be stored as text.
//! The master key lives in `<data_dir>/.encryption_key` with owner-only
//! permissions and is created on first use.

use crate::core::error::{Result, StoreError};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// File name of the master key inside the data directory
pub const KEY_FILE_NAME: &str = ".encryption_key";

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Placeholder shown for secrets too short to partially reveal
pub const MASK_PLACEHOLDER: &str = "****";

/// Holds the master key and performs authenticated encryption
///
/// Construct one at startup and hand it to whatever needs encryption.
#[derive(Clone)]
pub struct SecretManager {
    key: [u8; KEY_LEN],
    key_path: Option<PathBuf>,
}

impl std::fmt::Debug for SecretManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretManager")
            .field("key_path", &self.key_path)
            .finish_non_exhaustive()
    }
}

impl SecretManager {
    /// Load the key from `data_dir`, generating and persisting it if absent
    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        let key_path = data_dir.join(KEY_FILE_NAME);

        if key_path.exists() {
            let data = fs::read(&key_path)?;
            let key: [u8; KEY_LEN] = data.as_slice().try_into().map_err(|_| {
                StoreError::Crypto(format!("invalid encryption key length: {}", data.len()))
            })?;
            return Ok(Self {
                key,
                key_path: Some(key_path),
            });
        }

        fs::create_dir_all(data_dir)?;

        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        write_key_file(&key_path, &key)?;

        Ok(Self {
            key,
            key_path: Some(key_path),
        })
    }

    /// Use an explicit key; nothing is persisted
    pub fn from_key(key: [u8; KEY_LEN]) -> Self {
        Self { key, key_path: None }
    }

    /// Derive a key from a passphrase instead of a random key file
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&digest);
        Self::from_key(key)
    }

    pub fn key_path(&self) -> Option<&Path> {
        self.key_path.as_deref()
    }

    /// Encrypt `plaintext`, returning base64(nonce || ciphertext)
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new((&self.key).into());

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| StoreError::Crypto(format!("encryption failed: {}", e)))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);

        Ok(general_purpose::STANDARD.encode(&combined))
    }

    /// Decrypt a value produced by [`SecretManager::encrypt`]
    ///
    /// Fails on bad base64, input shorter than a nonce, authentication
    /// failure, or non UTF-8 plaintext. Never returns partial output.
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let combined = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| StoreError::Crypto(format!("invalid encrypted data: {}", e)))?;

        if combined.len() < NONCE_LEN {
            return Err(StoreError::Crypto("ciphertext too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new((&self.key).into());
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| StoreError::Crypto(format!("decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| StoreError::Crypto(format!("invalid UTF-8 in decrypted data: {}", e)))
    }
}

#[cfg(unix)]
fn write_key_file(path: &Path, key: &[u8]) -> Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(key)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn write_key_file(path: &Path, key: &[u8]) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(key)?;
    file.sync_all()?;
    Ok(())
}

/// Display-safe form of a secret: first 3 and last 4 characters visible
///
/// Anything under 8 characters collapses to [`MASK_PLACEHOLDER`] so the
/// length is not leaked.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() < 8 {
        return MASK_PLACEHOLDER.to_string();
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}{}", head, MASK_PLACEHOLDER, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn manager() -> SecretManager {
        SecretManager::from_key([7u8; KEY_LEN])
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let secrets = manager();
        let encrypted = secrets.encrypt("sk-live-1234567890").unwrap();
        assert_ne!(encrypted, "sk-live-1234567890");
        assert_eq!(secrets.decrypt(&encrypted).unwrap(), "sk-live-1234567890");
    }

    #[test]
    fn test_fresh_nonce_per_encryption() {
        let secrets = manager();
        let a = secrets.encrypt("same").unwrap();
        let b = secrets.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let encrypted = manager().encrypt("secret").unwrap();
        let other = SecretManager::from_key([8u8; KEY_LEN]);
        assert!(matches!(other.decrypt(&encrypted), Err(StoreError::Crypto(_))));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let secrets = manager();
        let encrypted = secrets.encrypt("api-token-value").unwrap();
        let mut raw = general_purpose::STANDARD.decode(&encrypted).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = general_purpose::STANDARD.encode(&raw);
        assert!(secrets.decrypt(&tampered).is_err());
    }

    #[test]
    fn test_too_short_and_invalid_base64() {
        let secrets = manager();
        let short = general_purpose::STANDARD.encode([1u8; 11]);
        let err = secrets.decrypt(&short).unwrap_err();
        assert!(err.to_string().contains("too short"));
        assert!(secrets.decrypt("not base64!!").is_err());
    }

    #[test]
    fn test_key_file_created_once() {
        let temp_dir = TempDir::new().unwrap();
        let first = SecretManager::load_or_create(temp_dir.path()).unwrap();
        let key_path = temp_dir.path().join(KEY_FILE_NAME);
        assert_eq!(fs::read(&key_path).unwrap().len(), KEY_LEN);

        let encrypted = first.encrypt("persisted").unwrap();
        let second = SecretManager::load_or_create(temp_dir.path()).unwrap();
        assert_eq!(second.decrypt(&encrypted).unwrap(), "persisted");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_invalid_key_length_rejected() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(KEY_FILE_NAME), [1u8; 16]).unwrap();
        let err = SecretManager::load_or_create(temp_dir.path()).unwrap_err();
        assert!(err.to_string().contains("invalid encryption key length"));
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("short"), "****");
        assert_eq!(mask_secret("1234567"), "****");
        assert_eq!(mask_secret("sk-abcdefgh1234"), "sk-****1234");
        assert_eq!(mask_secret("12345678"), "123****5678");
    }

    #[test]
    fn test_passphrase_key_is_stable() {
        let a = SecretManager::from_passphrase("correct horse");
        let b = SecretManager::from_passphrase("correct horse");
        let encrypted = a.encrypt("x").unwrap();
        assert_eq!(b.decrypt(&encrypted).unwrap(), "x");
    }

    proptest! {
        #[test]
        fn prop_roundtrip(plaintext in ".*") {
            let secrets = manager();
            let encrypted = secrets.encrypt(&plaintext).unwrap();
            prop_assert_eq!(secrets.decrypt(&encrypted).unwrap(), plaintext);
        }

        #[test]
        fn prop_mask_never_reveals_middle(secret in "[a-zA-Z0-9]{8,40}") {
            let masked = mask_secret(&secret);
            prop_assert!(masked.starts_with(&secret[..3]));
            prop_assert!(masked.ends_with(&secret[secret.len() - 4..]));
            prop_assert_eq!(masked.len(), 3 + MASK_PLACEHOLDER.len() + 4);
        }
    }
}
