//! Credential resolution for recognition sessions.
//!
//! A session needs three secrets per account: the application id, the API key
//! and the API secret. They are looked up through a [`CredentialStore`]:
//! - [`KeyringCredentialStore`]: OS secret storage (libsecret, Keychain,
//!   Credential Manager)
//! - [`EnvCredentialStore`]: process environment, for development
//! - [`MemoryCredentialStore`]: in-process map
//!
//! Security notes:
//! - Never log secret values
//! - `CredentialSet`'s `Debug` output masks the key and secret

use keyring::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use crate::recognition::RecognitionError;

const SERVICE_NAME: &str = "iat-stream";

/// The three credentials a session needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialField {
    AppId,
    ApiKey,
    ApiSecret,
}

impl CredentialField {
    pub const ALL: [CredentialField; 3] = [
        CredentialField::AppId,
        CredentialField::ApiKey,
        CredentialField::ApiSecret,
    ];

    /// Name of the credential in the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialField::AppId => "xfyunAppId",
            CredentialField::ApiKey => "xfyunApiKey",
            CredentialField::ApiSecret => "xfyunApiSecret",
        }
    }

    fn env_var(&self) -> &'static str {
        match self {
            CredentialField::AppId => "XFYUN_APP_ID",
            CredentialField::ApiKey => "XFYUN_API_KEY",
            CredentialField::ApiSecret => "XFYUN_API_SECRET",
        }
    }
}

impl fmt::Display for CredentialField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved credentials, read-only for the lifetime of a session.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialSet {
    pub app_id: String,
    pub api_key: String,
    pub api_secret: String,
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("app_id", &self.app_id)
            .field("api_key", &mask(&self.api_key))
            .field("api_secret", &"***")
            .finish()
    }
}

/// Show only the first few characters of a key.
pub(crate) fn mask(value: &str) -> String {
    let prefix: String = value.chars().take(4).collect();
    format!("{}***", prefix)
}

/// Source of decrypted credentials, keyed by account and credential.
///
/// Returns `None` when the credential is absent. Implementations log and
/// swallow their own storage errors.
pub trait CredentialStore: Send + Sync {
    fn get(&self, account_id: &str, field: CredentialField) -> Option<String>;
}

/// Resolve all three credentials for an account.
///
/// Fails with `MissingCredentials` naming every absent (or empty) field. No
/// network activity happens here.
pub fn resolve_credentials(
    store: &dyn CredentialStore,
    account_id: &str,
) -> Result<CredentialSet, RecognitionError> {
    let mut values: Vec<Option<String>> = CredentialField::ALL
        .iter()
        .map(|field| store.get(account_id, *field).filter(|v| !v.is_empty()))
        .collect();

    let missing: Vec<CredentialField> = CredentialField::ALL
        .iter()
        .zip(values.iter())
        .filter(|(_, value)| value.is_none())
        .map(|(field, _)| *field)
        .collect();

    if !missing.is_empty() {
        log::warn!(
            "Credentials: account {} is missing {:?}",
            account_id,
            missing.iter().map(|f| f.as_str()).collect::<Vec<_>>()
        );
        return Err(RecognitionError::MissingCredentials {
            account: account_id.to_string(),
            missing,
        });
    }

    let api_secret = values.pop().flatten().unwrap_or_default();
    let api_key = values.pop().flatten().unwrap_or_default();
    let app_id = values.pop().flatten().unwrap_or_default();

    Ok(CredentialSet {
        app_id,
        api_key,
        api_secret,
    })
}

/// Credentials kept in the OS keyring, one entry per account and credential.
#[derive(Debug, Clone, Default)]
pub struct KeyringCredentialStore;

impl KeyringCredentialStore {
    fn entry(account_id: &str, field: CredentialField) -> keyring::Result<Entry> {
        Entry::new(SERVICE_NAME, &format!("{}/{}", account_id, field.as_str()))
    }

    /// Store a credential. Pass None to delete it.
    pub fn set(
        &self,
        account_id: &str,
        field: CredentialField,
        value: Option<&str>,
    ) -> Result<(), String> {
        let entry = Self::entry(account_id, field)
            .map_err(|e| format!("Failed to create keyring entry: {}", e))?;

        match value {
            Some(v) if !v.is_empty() => {
                entry
                    .set_password(v)
                    .map_err(|e| format!("Failed to store {}: {}", field, e))?;
                log::info!("Credentials: stored {} for account {}", field, account_id);
            }
            _ => match entry.delete_credential() {
                Ok(()) => log::info!("Credentials: deleted {} for account {}", field, account_id),
                Err(keyring::Error::NoEntry) => {}
                Err(e) => return Err(format!("Failed to delete {}: {}", field, e)),
            },
        }

        Ok(())
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn get(&self, account_id: &str, field: CredentialField) -> Option<String> {
        let entry = match Self::entry(account_id, field) {
            Ok(e) => e,
            Err(e) => {
                log::warn!("Credentials: failed to create keyring entry: {}", e);
                return None;
            }
        };

        match entry.get_password() {
            Ok(value) if value.is_empty() => None,
            Ok(value) => Some(value),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                log::warn!("Credentials: failed to retrieve {}: {}", field, e);
                None
            }
        }
    }
}

/// Credentials from `XFYUN_APP_ID`, `XFYUN_API_KEY` and `XFYUN_API_SECRET`.
/// The account id is ignored.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialStore;

impl CredentialStore for EnvCredentialStore {
    fn get(&self, _account_id: &str, field: CredentialField) -> Option<String> {
        std::env::var(field.env_var()).ok().filter(|v| !v.is_empty())
    }
}

/// In-process credential map.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<HashMap<(String, CredentialField), String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor holding a full set for one account.
    pub fn with_account(account_id: &str, credentials: &CredentialSet) -> Self {
        let store = Self::new();
        store.insert(account_id, CredentialField::AppId, &credentials.app_id);
        store.insert(account_id, CredentialField::ApiKey, &credentials.api_key);
        store.insert(account_id, CredentialField::ApiSecret, &credentials.api_secret);
        store
    }

    pub fn insert(&self, account_id: &str, field: CredentialField, value: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert((account_id.to_string(), field), value.to_string());
        }
    }

    pub fn remove(&self, account_id: &str, field: CredentialField) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(&(account_id.to_string(), field));
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, account_id: &str, field: CredentialField) -> Option<String> {
        self.entries
            .read()
            .ok()?
            .get(&(account_id.to_string(), field))
            .cloned()
    }
}

/// Consults each store in order; the first one holding a value wins.
pub struct LayeredCredentialStore {
    layers: Vec<Box<dyn CredentialStore>>,
}

impl LayeredCredentialStore {
    pub fn new(layers: Vec<Box<dyn CredentialStore>>) -> Self {
        Self { layers }
    }
}

impl CredentialStore for LayeredCredentialStore {
    fn get(&self, account_id: &str, field: CredentialField) -> Option<String> {
        self.layers
            .iter()
            .find_map(|layer| layer.get(account_id, field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_set() -> CredentialSet {
        CredentialSet {
            app_id: "app-1".to_string(),
            api_key: "key-123456".to_string(),
            api_secret: "secret-abcdef".to_string(),
        }
    }

    #[test]
    fn resolves_complete_set() {
        let store = MemoryCredentialStore::with_account("alice", &full_set());
        let creds = resolve_credentials(&store, "alice").unwrap();
        assert_eq!(creds, full_set());
    }

    #[test]
    fn missing_secret_is_named() {
        let store = MemoryCredentialStore::with_account("alice", &full_set());
        store.remove("alice", CredentialField::ApiSecret);

        match resolve_credentials(&store, "alice") {
            Err(RecognitionError::MissingCredentials { account, missing }) => {
                assert_eq!(account, "alice");
                assert_eq!(missing, vec![CredentialField::ApiSecret]);
            }
            other => panic!("Expected MissingCredentials, got {:?}", other),
        }
    }

    #[test]
    fn empty_value_counts_as_missing() {
        let store = MemoryCredentialStore::with_account("alice", &full_set());
        store.insert("alice", CredentialField::AppId, "");

        match resolve_credentials(&store, "alice") {
            Err(RecognitionError::MissingCredentials { missing, .. }) => {
                assert_eq!(missing, vec![CredentialField::AppId]);
            }
            other => panic!("Expected MissingCredentials, got {:?}", other),
        }
    }

    #[test]
    fn unknown_account_misses_everything() {
        let store = MemoryCredentialStore::with_account("alice", &full_set());
        match resolve_credentials(&store, "bob") {
            Err(RecognitionError::MissingCredentials { missing, .. }) => {
                assert_eq!(missing, CredentialField::ALL.to_vec());
            }
            other => panic!("Expected MissingCredentials, got {:?}", other),
        }
    }

    #[test]
    fn debug_output_masks_secrets() {
        let rendered = format!("{:?}", full_set());
        assert!(rendered.contains("app-1"));
        assert!(rendered.contains("key-***"));
        assert!(!rendered.contains("key-123456"));
        assert!(!rendered.contains("secret-abcdef"));
    }

    /// Needs a real OS secret store (Keychain, Credential Manager or a running
    /// Secret Service / keyutils session):
    /// `cargo test keyring_round_trip -- --ignored`
    #[test]
    #[ignore]
    fn keyring_round_trip() {
        let store = KeyringCredentialStore;
        let account = format!("iat-stream-test-{}", std::process::id());

        store
            .set(&account, CredentialField::ApiKey, Some("k-123"))
            .unwrap();
        assert_eq!(
            store.get(&account, CredentialField::ApiKey).as_deref(),
            Some("k-123")
        );

        store.set(&account, CredentialField::ApiKey, None).unwrap();
        assert_eq!(store.get(&account, CredentialField::ApiKey), None);
    }

    #[test]
    fn layered_store_prefers_earlier_layers() {
        let front = MemoryCredentialStore::new();
        front.insert("alice", CredentialField::ApiKey, "override-key");
        let back = MemoryCredentialStore::with_account("alice", &full_set());

        let store = LayeredCredentialStore::new(vec![Box::new(front), Box::new(back)]);
        let creds = resolve_credentials(&store, "alice").unwrap();
        assert_eq!(creds.api_key, "override-key");
        assert_eq!(creds.app_id, "app-1");
    }
}
