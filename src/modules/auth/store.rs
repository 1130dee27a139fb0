use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use zeroize::Zeroizing;

use crate::modules::utils::validation::normalize_email;

/// Failures of an account store adapter
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to access account file: {0}")]
    Io(#[from] std::io::Error),

    #[error("account file is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("account store unavailable: {0}")]
    Unavailable(String),

    #[error("email address already registered: {0}")]
    Conflict(String),
}

/// Account as seen by the rest of the system; carries no credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub language: String,
    pub verified: bool,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Disabled accounts can neither log in nor refresh
    pub fn is_active(&self) -> bool {
        self.enabled
    }
}

/// Stored password material for one account
#[derive(Clone)]
pub struct CredentialRecord {
    pub subject_id: String,
    pub password_hash: Zeroizing<Vec<u8>>,
    pub salt: Vec<u8>,
    pub enabled: bool,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("subject_id", &self.subject_id)
            .field("password_hash", &"<redacted>")
            .field("salt", &"<redacted>")
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Everything needed to create an account
pub struct NewAccountRecord {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub language: String,
    pub password_hash: Vec<u8>,
    pub salt: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Lookup and mutation operations the authentication core needs from
/// the account storage. "Not found" is a normal `Ok` outcome.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Account>, StoreError>;

    async fn find_credential_by_email(
        &self,
        email: &str,
    ) -> Result<Option<CredentialRecord>, StoreError>;

    async fn exists_by_email(&self, email: &str) -> Result<bool, StoreError>;

    /// Create an account and return its identifier
    async fn insert(&self, record: NewAccountRecord) -> Result<String, StoreError>;

    async fn update_credential(
        &self,
        id: &str,
        password_hash: Vec<u8>,
        salt: Vec<u8>,
    ) -> Result<bool, StoreError>;

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool, StoreError>;

    async fn delete(&self, id: &str) -> Result<bool, StoreError>;
}

type AccountMap = HashMap<String, StoredAccount>;

/// Account plus its credential, as kept by the bundled adapters
#[derive(Clone, Serialize, Deserialize)]
struct StoredAccount {
    #[serde(flatten)]
    account: Account,
    #[serde(with = "hex")]
    password_hash: Vec<u8>,
    #[serde(with = "hex")]
    salt: Vec<u8>,
}

impl StoredAccount {
    fn credential(&self) -> CredentialRecord {
        CredentialRecord {
            subject_id: self.account.id.clone(),
            password_hash: Zeroizing::new(self.password_hash.clone()),
            salt: self.salt.clone(),
            enabled: self.account.enabled,
        }
    }
}

/// Opaque 24-character identifier
fn generate_account_id() -> String {
    let bytes: [u8; 12] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Account store held entirely in memory
#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: RwLock<AccountMap>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_accounts(accounts: AccountMap) -> Self {
        Self {
            accounts: RwLock::new(accounts),
        }
    }

    async fn snapshot(&self) -> AccountMap {
        self.accounts.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.accounts.read().await.is_empty()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Account>, StoreError> {
        let accounts = self.accounts.read().await;
        Ok(accounts.get(id).map(|stored| stored.account.clone()))
    }

    async fn find_credential_by_email(
        &self,
        email: &str,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        let email = normalize_email(email);
        let accounts = self.accounts.read().await;
        Ok(accounts
            .values()
            .find(|stored| stored.account.email == email)
            .map(StoredAccount::credential))
    }

    async fn exists_by_email(&self, email: &str) -> Result<bool, StoreError> {
        let email = normalize_email(email);
        let accounts = self.accounts.read().await;
        Ok(accounts.values().any(|stored| stored.account.email == email))
    }

    async fn insert(&self, record: NewAccountRecord) -> Result<String, StoreError> {
        insert_account(&mut *self.accounts.write().await, record)
    }

    async fn update_credential(
        &self,
        id: &str,
        password_hash: Vec<u8>,
        salt: Vec<u8>,
    ) -> Result<bool, StoreError> {
        let mut accounts = self.accounts.write().await;
        Ok(update_credential_of(&mut accounts, id, password_hash, salt))
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool, StoreError> {
        let mut accounts = self.accounts.write().await;
        Ok(set_enabled_of(&mut accounts, id, enabled))
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.accounts.write().await.remove(id).is_some())
    }
}

fn insert_account(
    accounts: &mut AccountMap,
    record: NewAccountRecord,
) -> Result<String, StoreError> {
    let email = normalize_email(&record.email);
    if accounts.values().any(|stored| stored.account.email == email) {
        return Err(StoreError::Conflict(email));
    }

    let mut id = generate_account_id();
    while accounts.contains_key(&id) {
        id = generate_account_id();
    }

    let stored = StoredAccount {
        account: Account {
            id: id.clone(),
            first_name: record.first_name,
            last_name: record.last_name,
            email,
            language: record.language,
            verified: false,
            enabled: true,
            created_at: record.created_at,
        },
        password_hash: record.password_hash,
        salt: record.salt,
    };
    accounts.insert(id.clone(), stored);

    Ok(id)
}

fn update_credential_of(
    accounts: &mut AccountMap,
    id: &str,
    password_hash: Vec<u8>,
    salt: Vec<u8>,
) -> bool {
    match accounts.get_mut(id) {
        Some(stored) => {
            stored.password_hash = password_hash;
            stored.salt = salt;
            true
        }
        None => false,
    }
}

fn set_enabled_of(accounts: &mut AccountMap, id: &str, enabled: bool) -> bool {
    match accounts.get_mut(id) {
        Some(stored) => {
            stored.account.enabled = enabled;
            true
        }
        None => false,
    }
}

/// On-disk layout of the accounts file
#[derive(Serialize, Deserialize, Default)]
struct AccountFile {
    users: AccountMap,
}

#[derive(Serialize)]
struct AccountFileRef<'a> {
    users: &'a AccountMap,
}

/// Account store persisted as JSON, rewritten after every mutation
pub struct FileAccountStore {
    path: PathBuf,
    memory: MemoryAccountStore,
    write_lock: Mutex<()>,
}

impl FileAccountStore {
    /// Load the accounts file; a missing file is an empty store
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let file = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str::<AccountFile>(&contents)?
        } else {
            AccountFile::default()
        };

        debug!("Loaded {} accounts from {}", file.users.len(), path.display());

        Ok(Self {
            path,
            memory: MemoryAccountStore::from_accounts(file.users),
            write_lock: Mutex::new(()),
        })
    }

    /// Apply `change` to a copy of the accounts, write the copy to disk, and
    /// only then make it visible. A failed write leaves the store untouched.
    async fn commit<T, F>(&self, change: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut AccountMap) -> Result<(T, bool), StoreError>,
    {
        let _guard = self.write_lock.lock().await;
        let mut next = self.memory.snapshot().await;

        let (value, changed) = change(&mut next)?;
        if changed {
            self.persist(&next)?;
            *self.memory.accounts.write().await = next;
        }
        Ok(value)
    }

    /// Write through a temp file created with owner-only permissions, then
    /// rename it over the accounts file
    fn persist(&self, accounts: &AccountMap) -> Result<(), StoreError> {
        let data = serde_json::to_string_pretty(&AccountFileRef { users: accounts })?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let temp_path = self.path.with_extension("json.tmp");
        {
            let mut options = OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut file = options.open(&temp_path)?;
            file.write_all(data.as_bytes())?;
            file.sync_all()?;
        }

        if let Err(e) = std::fs::rename(&temp_path, &self.path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl AccountStore for FileAccountStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Account>, StoreError> {
        self.memory.find_by_id(id).await
    }

    async fn find_credential_by_email(
        &self,
        email: &str,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        self.memory.find_credential_by_email(email).await
    }

    async fn exists_by_email(&self, email: &str) -> Result<bool, StoreError> {
        self.memory.exists_by_email(email).await
    }

    async fn insert(&self, record: NewAccountRecord) -> Result<String, StoreError> {
        let id = self
            .commit(|accounts| insert_account(accounts, record).map(|id| (id, true)))
            .await?;
        info!("Account file {} updated (insert)", self.path.display());
        Ok(id)
    }

    async fn update_credential(
        &self,
        id: &str,
        password_hash: Vec<u8>,
        salt: Vec<u8>,
    ) -> Result<bool, StoreError> {
        self.commit(|accounts| {
            let updated = update_credential_of(accounts, id, password_hash, salt);
            Ok((updated, updated))
        })
        .await
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool, StoreError> {
        self.commit(|accounts| {
            let updated = set_enabled_of(accounts, id, enabled);
            Ok((updated, updated))
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.commit(|accounts| {
            let deleted = accounts.remove(id).is_some();
            Ok((deleted, deleted))
        })
        .await
    }
}
