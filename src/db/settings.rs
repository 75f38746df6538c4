//! Settings with transparent secret handling

use crate::core::crypto::{mask_secret, SecretManager, MASK_PLACEHOLDER};
use crate::core::error::Result;
use crate::db::models::Setting;
use crate::db::store::Store;
use std::sync::Arc;

/// Combines a store with the secret codec
///
/// Secret values are sealed before they reach the store and opened on the
/// way back out. Plain values pass through unchanged.
#[derive(Clone)]
pub struct SettingsService {
    store: Arc<dyn Store>,
    secrets: SecretManager,
}

impl SettingsService {
    pub fn new(store: Arc<dyn Store>, secrets: SecretManager) -> Self {
        Self { store, secrets }
    }

    /// Insert or replace a setting; empty secrets are stored as-is
    pub fn set(&self, key: &str, value: &str, value_type: &str, is_secret: bool) -> Result<()> {
        let stored = if is_secret && !value.is_empty() {
            self.secrets.encrypt(value)?
        } else {
            value.to_string()
        };
        self.store.put_setting(&Setting {
            key: key.to_string(),
            value: stored,
            value_type: value_type.to_string(),
            is_secret,
        })
    }

    /// Stored record, ciphertext included
    pub fn get(&self, key: &str) -> Result<Option<Setting>> {
        self.store.get_setting(key)
    }

    /// Plaintext value
    pub fn get_decrypted(&self, key: &str) -> Result<Option<String>> {
        let Some(setting) = self.store.get_setting(key)? else {
            return Ok(None);
        };
        if !setting.is_secret || setting.value.is_empty() {
            return Ok(Some(setting.value));
        }
        self.secrets.decrypt(&setting.value).map(Some)
    }

    /// Every setting by key, secrets replaced with their masked plaintext
    pub fn list_masked(&self) -> Result<Vec<Setting>> {
        let mut settings = self.store.get_all_settings()?;
        for setting in settings.iter_mut().filter(|s| s.is_secret) {
            setting.value = match self.secrets.decrypt(&setting.value) {
                Ok(plain) => mask_secret(&plain),
                Err(_) => MASK_PLACEHOLDER.to_string(),
            };
        }
        Ok(settings)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.store.delete_setting(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::crypto::KEY_LEN;
    use crate::db::kv::KvStore;
    use crate::db::sqlite_store::SqliteStore;

    fn services() -> Vec<SettingsService> {
        let secrets = SecretManager::from_key([3u8; KEY_LEN]);
        vec![
            SettingsService::new(
                Arc::new(SqliteStore::open_in_memory().unwrap()),
                secrets.clone(),
            ),
            SettingsService::new(Arc::new(KvStore::open_in_memory().unwrap()), secrets),
        ]
    }

    #[test]
    fn test_secret_is_encrypted_at_rest() {
        for service in services() {
            service
                .set("openai_api_key", "sk-abcdef123456", "string", true)
                .unwrap();
            let raw = service.get("openai_api_key").unwrap().unwrap();
            assert!(raw.is_secret);
            assert_ne!(raw.value, "sk-abcdef123456");
            assert_eq!(
                service.get_decrypted("openai_api_key").unwrap().as_deref(),
                Some("sk-abcdef123456")
            );
        }
    }

    #[test]
    fn test_plain_and_empty_values_pass_through() {
        for service in services() {
            service.set("scan_interval", "30", "int", false).unwrap();
            service.set("empty_secret", "", "string", true).unwrap();
            assert_eq!(service.get("scan_interval").unwrap().unwrap().value, "30");
            assert_eq!(service.get("empty_secret").unwrap().unwrap().value, "");
            assert_eq!(
                service.get_decrypted("empty_secret").unwrap().as_deref(),
                Some("")
            );
            assert!(service.get_decrypted("missing").unwrap().is_none());
        }
    }

    #[test]
    fn test_list_masked() {
        for service in services() {
            service.set("b_token", "tok-1234567890", "string", true).unwrap();
            service.set("a_plain", "visible", "string", false).unwrap();
            service
                .store
                .put_setting(&Setting {
                    key: "c_broken".into(),
                    value: "not-ciphertext".into(),
                    value_type: "string".into(),
                    is_secret: true,
                })
                .unwrap();

            let listed = service.list_masked().unwrap();
            let keys: Vec<&str> = listed.iter().map(|s| s.key.as_str()).collect();
            assert_eq!(keys, vec!["a_plain", "b_token", "c_broken"]);
            assert_eq!(listed[0].value, "visible");
            assert_eq!(listed[1].value, "tok****7890");
            assert_eq!(listed[2].value, MASK_PLACEHOLDER);
        }
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let store: Arc<dyn Store> = Arc::new(KvStore::open_in_memory().unwrap());
        let writer = SettingsService::new(store.clone(), SecretManager::from_key([1u8; KEY_LEN]));
        let reader = SettingsService::new(store, SecretManager::from_key([2u8; KEY_LEN]));
        writer.set("token", "super-secret-value", "string", true).unwrap();
        let err = reader.get_decrypted("token").unwrap_err();
        assert_eq!(err.error_type(), "CryptoError");
    }

    #[test]
    fn test_delete() {
        for service in services() {
            service.set("k", "v", "string", false).unwrap();
            service.delete("k").unwrap();
            assert!(service.get("k").unwrap().is_none());
        }
    }
}
