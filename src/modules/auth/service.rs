use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info};
use zeroize::Zeroizing;

use super::password::generate_salt;
use super::pool::DerivationPool;
use super::store::{AccountStore, NewAccountRecord, StoreError};
use super::tokens::{RefreshDecision, SessionToken, TokenManager};
use crate::modules::config::AuthConfig;
use crate::modules::error::AuthError;
use crate::modules::security::SigningKey;
use crate::modules::utils::logging::log_auth_event;
use crate::modules::utils::time::Clock;
use crate::modules::utils::validation::{extract_bearer_token, is_valid_email, normalize_email};

/// Registration input
pub struct NewAccount {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub language: String,
    pub password: Zeroizing<String>,
}

/// Subject proven by a valid bearer token, passed explicitly to every
/// operation that acts on behalf of a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedSubject {
    pub subject_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Login, refresh, registration and request authentication on top of the
/// credential verifier, the token manager and an account store
pub struct AuthService {
    accounts: Arc<dyn AccountStore>,
    tokens: TokenManager,
    pool: DerivationPool,
    clock: Arc<dyn Clock>,
    salt_length: usize,
    store_timeout: std::time::Duration,
}

impl AuthService {
    pub fn new(
        config: &AuthConfig,
        key: SigningKey,
        accounts: Arc<dyn AccountStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AuthError> {
        Ok(Self {
            accounts,
            tokens: TokenManager::new(key, config.token_lifetime()?, config.refresh_window()?),
            pool: DerivationPool::new(config.argon2.clone(), config.max_concurrent_derivations),
            clock,
            salt_length: config.salt_length,
            store_timeout: config.store_timeout(),
        })
    }

    #[cfg(test)]
    fn with_store_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    async fn with_timeout<T, F>(&self, call: F) -> Result<T, AuthError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(AuthError::StoreTimeout),
        }
    }

    /// Create an account and return its identifier
    pub async fn register(&self, new: NewAccount) -> Result<String, AuthError> {
        let email = normalize_email(&new.email);

        if new.first_name.trim().is_empty() {
            return Err(AuthError::RequiredFieldEmpty("firstName"));
        }
        if new.last_name.trim().is_empty() {
            return Err(AuthError::RequiredFieldEmpty("lastName"));
        }
        if email.is_empty() {
            return Err(AuthError::RequiredFieldEmpty("email"));
        }
        if new.password.is_empty() {
            return Err(AuthError::RequiredFieldEmpty("password"));
        }
        if !is_valid_email(&email) {
            return Err(AuthError::EmailAddressDomainForbidden);
        }

        if self.with_timeout(self.accounts.exists_by_email(&email)).await? {
            log_auth_event("register", &email, false, Some("email already exists"));
            return Err(AuthError::EmailAddressAlreadyExists);
        }

        let salt = generate_salt(self.salt_length)?;
        let password = Zeroizing::new(new.password.as_bytes().to_vec());
        let hash = self.pool.derive(password, salt.clone()).await?;

        let record = NewAccountRecord {
            first_name: new.first_name.trim().to_string(),
            last_name: new.last_name.trim().to_string(),
            email: email.clone(),
            language: new.language,
            password_hash: hash.to_vec(),
            salt,
            created_at: self.clock.now(),
        };

        let id = match self.with_timeout(self.accounts.insert(record)).await {
            Ok(id) => id,
            Err(AuthError::Store(StoreError::Conflict(_))) => {
                return Err(AuthError::EmailAddressAlreadyExists)
            }
            Err(e) => return Err(e),
        };

        log_auth_event("register", &email, true, None);
        Ok(id)
    }

    /// Check an email/password pair and issue a token for the account.
    ///
    /// Unknown emails, wrong passwords and disabled accounts all yield the
    /// same `CredentialMismatch`.
    pub async fn login(&self, email: &str, password: &[u8]) -> Result<SessionToken, AuthError> {
        let email = normalize_email(email);
        let password = Zeroizing::new(password.to_vec());

        let credential = match self
            .with_timeout(self.accounts.find_credential_by_email(&email))
            .await?
        {
            Some(credential) => credential,
            None => {
                // Spend the same derivation cost as a real check
                let dummy_salt = vec![0u8; self.salt_length];
                self.pool.derive(password, dummy_salt).await?;
                log_auth_event("login", &email, false, Some("credential mismatch"));
                return Err(AuthError::CredentialMismatch);
            }
        };

        let matches = self
            .pool
            .verify(password, credential.salt.clone(), credential.password_hash.clone())
            .await?;

        if !matches || !credential.enabled {
            log_auth_event("login", &email, false, Some("credential mismatch"));
            return Err(AuthError::CredentialMismatch);
        }

        let token = self
            .tokens
            .issue(&credential.subject_id, self.clock.now())
            .map_err(|e| log_internal("login", e))?;

        log_auth_event("login", &email, true, None);
        Ok(token)
    }

    /// Exchange an expired token, still inside the refresh window, for a new one
    pub async fn refresh(&self, raw_token: &str) -> Result<SessionToken, AuthError> {
        let now = self.clock.now();
        let refresh = self.tokens.refresh(raw_token, now, self.accounts.as_ref());

        let result = match tokio::time::timeout(self.store_timeout, refresh).await {
            Ok(result) => result,
            Err(_) => Err(AuthError::StoreTimeout),
        };

        match &result {
            Ok(token) => log_auth_event("refresh", token.subject_id(), true, None),
            Err(e) if e.is_internal() => error!("Refresh failed: {}", e),
            Err(e) => log_auth_event("refresh", "unknown", false, Some(e.code())),
        }
        result
    }

    /// Resolve the subject behind an `Authorization` header value
    pub async fn authenticate(
        &self,
        authorization: Option<&str>,
    ) -> Result<AuthenticatedSubject, AuthError> {
        let raw = extract_bearer_token(authorization)?;
        let now = self.clock.now();
        let parsed = self.tokens.parse(raw, now)?;

        if !parsed.valid {
            return Err(match self.tokens.classify(&parsed.token, now) {
                RefreshDecision::NonRefreshableExpired => AuthError::RefreshWindowElapsed,
                _ => AuthError::TokenExpired,
            });
        }

        let subject_id = parsed.token.subject_id();
        match self.with_timeout(self.accounts.find_by_id(subject_id)).await? {
            Some(account) if account.is_active() => {}
            _ => {
                log_auth_event("authenticate", subject_id, false, Some("subject inactive"));
                return Err(AuthError::SubjectNoLongerActive);
            }
        }

        Ok(AuthenticatedSubject {
            subject_id: subject_id.to_string(),
            expires_at: parsed.token.expires_at(),
        })
    }

    /// Replace the password of the authenticated subject under a fresh salt.
    /// Tokens already issued stay valid until they expire.
    pub async fn change_password(
        &self,
        subject: &AuthenticatedSubject,
        current: &[u8],
        new: &[u8],
    ) -> Result<(), AuthError> {
        if new.is_empty() {
            return Err(AuthError::RequiredFieldEmpty("password"));
        }

        let account = self
            .with_timeout(self.accounts.find_by_id(&subject.subject_id))
            .await?
            .filter(|account| account.is_active())
            .ok_or(AuthError::SubjectNoLongerActive)?;

        let credential = self
            .with_timeout(self.accounts.find_credential_by_email(&account.email))
            .await?
            .ok_or(AuthError::SubjectNoLongerActive)?;

        let matches = self
            .pool
            .verify(
                Zeroizing::new(current.to_vec()),
                credential.salt.clone(),
                credential.password_hash.clone(),
            )
            .await?;
        if !matches {
            log_auth_event(
                "change_password",
                &subject.subject_id,
                false,
                Some("credential mismatch"),
            );
            return Err(AuthError::CredentialMismatch);
        }

        let salt = generate_salt(self.salt_length)?;
        let hash = self
            .pool
            .derive(Zeroizing::new(new.to_vec()), salt.clone())
            .await?;

        let updated = self
            .with_timeout(
                self.accounts
                    .update_credential(&subject.subject_id, hash.to_vec(), salt),
            )
            .await?;
        if !updated {
            return Err(AuthError::SubjectNoLongerActive);
        }

        log_auth_event("change_password", &subject.subject_id, true, None);
        Ok(())
    }

    /// Disable an account; its tokens can no longer be refreshed or used
    pub async fn disable_account(&self, subject_id: &str) -> Result<bool, AuthError> {
        let disabled = self
            .with_timeout(self.accounts.set_enabled(subject_id, false))
            .await?;
        if disabled {
            info!("Account disabled");
        }
        Ok(disabled)
    }
}

fn log_internal(operation: &str, err: AuthError) -> AuthError {
    error!("{} failed: {}", operation, err);
    err
}
