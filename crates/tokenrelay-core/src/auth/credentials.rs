use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock};

use anyhow::{Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Name of the single slot the credential pair is kept under.
pub const CREDENTIALS_SLOT: &str = "tokens";

const SERVICE_NAME: &str = "tokenrelay";

/// Access and refresh token issued together by the authorization endpoint.
///
/// The pair is replaced as a whole, never field by field.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialPair {
    access_token: String,
    refresh_token: String,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Durable slot for the credential pair. Absence of a pair means logged out.
///
/// Implementations must make `get` observe either the previous or the new
/// pair while a `set` is in progress, never a mix of both.
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Result<Option<CredentialPair>>;

    fn set(&self, pair: &CredentialPair) -> Result<()>;

    fn remove(&self) -> Result<()>;

    fn access_token(&self) -> Result<Option<String>> {
        Ok(self.get()?.map(|pair| pair.access_token))
    }

    /// Store `new` (or clear the slot when `None`) only if the slot still
    /// holds `expected`. Returns whether the slot was written.
    ///
    /// The default reads then writes; backends that can lock the slot
    /// override it.
    fn compare_and_swap(
        &self,
        expected: Option<&CredentialPair>,
        new: Option<&CredentialPair>,
    ) -> Result<bool> {
        if self.get()?.as_ref() != expected {
            return Ok(false);
        }
        match new {
            Some(pair) => self.set(pair)?,
            None => self.remove()?,
        }
        Ok(true)
    }
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryCredentialStore {
    slot: RwLock<Option<CredentialPair>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            slot: RwLock::new(Some(pair)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Result<Option<CredentialPair>> {
        let slot = self
            .slot
            .read()
            .map_err(|_| anyhow::anyhow!("Credential slot lock poisoned"))?;
        Ok(slot.clone())
    }

    fn set(&self, pair: &CredentialPair) -> Result<()> {
        let mut slot = self
            .slot
            .write()
            .map_err(|_| anyhow::anyhow!("Credential slot lock poisoned"))?;
        *slot = Some(pair.clone());
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        let mut slot = self
            .slot
            .write()
            .map_err(|_| anyhow::anyhow!("Credential slot lock poisoned"))?;
        *slot = None;
        Ok(())
    }

    fn compare_and_swap(
        &self,
        expected: Option<&CredentialPair>,
        new: Option<&CredentialPair>,
    ) -> Result<bool> {
        let mut slot = self
            .slot
            .write()
            .map_err(|_| anyhow::anyhow!("Credential slot lock poisoned"))?;
        if slot.as_ref() != expected {
            return Ok(false);
        }
        *slot = new.cloned();
        Ok(true)
    }
}

/// JSON file in the data directory. Writes go to a sibling temp file that is
/// renamed over the slot, so readers never see a half-written pair.
pub struct FileCredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(format!("{}.json", CREDENTIALS_SLOT)),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }
}

impl FileCredentialStore {
    fn write_pair(&self, pair: &CredentialPair) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create credential directory")?;
        }
        let temp = self.temp_path();
        let contents = serde_json::to_string(pair)?;
        std::fs::write(&temp, contents).context("Failed to write credential file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&temp, std::fs::Permissions::from_mode(0o600))
                .context("Failed to restrict credential file permissions")?;
        }
        std::fs::rename(&temp, &self.path).context("Failed to replace credential file")?;
        debug!(path = %self.path.display(), "Credential pair written");
        Ok(())
    }

    fn delete_pair(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to delete credential file")?;
        }
        Ok(())
    }

    fn lock_writes(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("Credential file lock poisoned"))
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Result<Option<CredentialPair>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)
            .context("Failed to read credential file")?;
        let pair = serde_json::from_str(&contents).context("Failed to parse credential file")?;
        Ok(Some(pair))
    }

    fn set(&self, pair: &CredentialPair) -> Result<()> {
        let _guard = self.lock_writes()?;
        self.write_pair(pair)
    }

    fn remove(&self) -> Result<()> {
        let _guard = self.lock_writes()?;
        self.delete_pair()
    }

    fn compare_and_swap(
        &self,
        expected: Option<&CredentialPair>,
        new: Option<&CredentialPair>,
    ) -> Result<bool> {
        let _guard = self.lock_writes()?;
        if self.get()?.as_ref() != expected {
            return Ok(false);
        }
        match new {
            Some(pair) => self.write_pair(pair)?,
            None => self.delete_pair()?,
        }
        Ok(true)
    }
}

/// OS keychain entry holding the pair as one JSON secret.
pub struct KeyringCredentialStore {
    service: String,
}

impl KeyringCredentialStore {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(&self.service, CREDENTIALS_SLOT).context("Failed to create keyring entry")
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn get(&self) -> Result<Option<CredentialPair>> {
        match self.entry()?.get_password() {
            Ok(secret) => {
                let pair = serde_json::from_str(&secret)
                    .context("Failed to parse credential pair from keychain")?;
                Ok(Some(pair))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve credential pair from keychain"),
        }
    }

    fn set(&self, pair: &CredentialPair) -> Result<()> {
        let secret = serde_json::to_string(pair)?;
        self.entry()?
            .set_password(&secret)
            .context("Failed to store credential pair in keychain")?;
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential pair from keychain"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn scratch_dir(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        std::env::temp_dir().join(format!(
            "tokenrelay-{}-{}-{}",
            name,
            std::process::id(),
            nanos
        ))
    }

    #[test]
    fn test_pair_uses_camel_case_slot_format() {
        let pair = CredentialPair::new("a.b.c", "r-1");
        let json = serde_json::to_string(&pair).expect("serialize pair");
        assert_eq!(json, r#"{"accessToken":"a.b.c","refreshToken":"r-1"}"#);
    }

    #[test]
    fn test_pair_debug_redacts_secrets() {
        let pair = CredentialPair::new("secret-access", "secret-refresh");
        let shown = format!("{:?}", pair);
        assert!(!shown.contains("secret-access"));
        assert!(!shown.contains("secret-refresh"));
    }

    #[test]
    fn test_memory_store_get_set_remove() {
        let store = MemoryCredentialStore::new();
        assert!(store.get().expect("get").is_none());

        store.set(&CredentialPair::new("a1", "r1")).expect("set");
        assert_eq!(store.access_token().expect("token").as_deref(), Some("a1"));

        store.remove().expect("remove");
        assert!(store.get().expect("get").is_none());
        // Removing twice is fine
        store.remove().expect("remove again");
    }

    #[test]
    fn test_memory_store_readers_see_whole_pairs() {
        let old = CredentialPair::new("access-old", "refresh-old");
        let new = CredentialPair::new("access-new", "refresh-new");
        let store = Arc::new(MemoryCredentialStore::with_pair(old.clone()));

        let writer = {
            let store = Arc::clone(&store);
            let (old, new) = (old.clone(), new.clone());
            std::thread::spawn(move || {
                for i in 0..2000 {
                    let pair = if i % 2 == 0 { &new } else { &old };
                    store.set(pair).expect("set");
                }
            })
        };

        for _ in 0..2000 {
            let seen = store.get().expect("get").expect("pair present");
            assert!(seen == old || seen == new, "observed a torn pair");
        }
        writer.join().expect("writer thread");
    }

    #[test]
    fn test_file_store_round_trips_through_disk() {
        let dir = scratch_dir("file-store");
        let store = FileCredentialStore::new(&dir);
        assert!(store.get().expect("get").is_none());

        store.set(&CredentialPair::new("a1", "r1")).expect("set");
        store.set(&CredentialPair::new("a2", "r2")).expect("overwrite");

        // A fresh handle on the same directory sees the latest pair
        let reopened = FileCredentialStore::new(&dir);
        let pair = reopened.get().expect("get").expect("pair present");
        assert_eq!(pair.access_token(), "a2");
        assert_eq!(pair.refresh_token(), "r2");
        assert!(!store.temp_path().exists());

        reopened.remove().expect("remove");
        assert!(store.get().expect("get").is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_compare_and_swap_only_replaces_expected_pair() {
        let first = CredentialPair::new("a1", "r1");
        let second = CredentialPair::new("a2", "r2");
        let store = MemoryCredentialStore::with_pair(first.clone());

        assert!(!store
            .compare_and_swap(Some(&second), None)
            .expect("cas"));
        assert_eq!(store.get().expect("get"), Some(first.clone()));

        assert!(store
            .compare_and_swap(Some(&first), Some(&second))
            .expect("cas"));
        assert_eq!(store.get().expect("get"), Some(second.clone()));

        assert!(store.compare_and_swap(Some(&second), None).expect("cas"));
        assert!(store.get().expect("get").is_none());
        assert!(store.compare_and_swap(None, Some(&first)).expect("cas"));
        assert_eq!(store.get().expect("get"), Some(first));
    }

    #[test]
    fn test_file_store_compare_and_swap() {
        let dir = scratch_dir("file-store-cas");
        let store = FileCredentialStore::new(&dir);
        let first = CredentialPair::new("a1", "r1");
        let second = CredentialPair::new("a2", "r2");
        store.set(&first).expect("set");

        assert!(!store.compare_and_swap(Some(&second), None).expect("cas"));
        assert!(store.path().exists());
        assert!(store
            .compare_and_swap(Some(&first), Some(&second))
            .expect("cas"));
        assert_eq!(store.get().expect("get"), Some(second.clone()));
        assert!(store.compare_and_swap(Some(&second), None).expect("cas"));
        assert!(!store.path().exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_keyring_store_survives_reopen() {
        let service = format!("tokenrelay-test-{}", std::process::id());
        let pair = CredentialPair::new("k-access", "k-refresh");

        let writer = KeyringCredentialStore::with_service(service.clone());
        if let Err(e) = writer.set(&pair) {
            // Sandboxed environments may have no keychain service at all
            eprintln!("skipping keyring test, no platform keystore: {:#}", e);
            return;
        }

        let reopened = KeyringCredentialStore::with_service(service);
        assert_eq!(reopened.get().expect("get"), Some(pair));
        reopened.remove().expect("remove");
        assert!(writer.get().expect("get").is_none());
    }

    #[test]
    fn test_file_store_rejects_garbage() {
        let dir = scratch_dir("file-store-garbage");
        std::fs::create_dir_all(&dir).expect("mkdir");
        let store = FileCredentialStore::new(&dir);
        std::fs::write(store.path(), "not json").expect("write garbage");
        assert!(store.get().is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
