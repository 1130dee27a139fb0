use std::fmt;

use keyring::Entry;
use log::info;
use zeroize::Zeroizing;

use crate::modules::auth::password::generate_salt;
use crate::modules::error::AuthError;
use crate::{KEYRING_SERVICE, SIGNING_KEY_LENGTH};

/// Process-wide secret used to sign and verify session tokens
#[derive(Clone)]
pub struct SigningKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl SigningKey {
    /// Wrap raw key material; an empty key cannot sign anything
    pub fn new(bytes: Vec<u8>) -> Result<Self, AuthError> {
        if bytes.is_empty() {
            return Err(AuthError::SigningUnavailable(
                "signing secret is empty".to_string(),
            ));
        }
        Ok(Self {
            bytes: Zeroizing::new(bytes),
        })
    }

    /// Fresh random key of the default length
    pub fn generate() -> Result<Self, AuthError> {
        Self::new(generate_salt(SIGNING_KEY_LENGTH)?)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Signing key persisted in the operating system keyring
pub struct SigningKeyStore {
    keyring: Entry,
}

impl SigningKeyStore {
    pub fn new() -> Result<Self, AuthError> {
        let keyring = Entry::new(KEYRING_SERVICE, "signing-key")
            .map_err(|e| AuthError::SigningUnavailable(e.to_string()))?;
        Ok(Self { keyring })
    }

    /// Store a key, hex encoded since the keyring holds strings
    pub fn store_key(&self, key: &SigningKey) -> Result<(), AuthError> {
        let encoded = Zeroizing::new(hex::encode(key.as_bytes()));
        self.keyring
            .set_password(&encoded)
            .map_err(|e| AuthError::SigningUnavailable(e.to_string()))
    }

    /// Return the stored key, generating and storing one on first use
    pub fn get_or_initialize(&self) -> Result<SigningKey, AuthError> {
        match self.keyring.get_password() {
            Ok(encoded) => decode_key(Zeroizing::new(encoded)),
            Err(keyring::Error::NoEntry) => self.rotate(),
            Err(e) => Err(AuthError::SigningUnavailable(e.to_string())),
        }
    }

    /// Replace the stored key; every token signed with the old key stops parsing
    pub fn rotate(&self) -> Result<SigningKey, AuthError> {
        let key = SigningKey::generate()?;
        self.store_key(&key)?;
        info!("New signing key generated and stored in system keyring");
        Ok(key)
    }
}

fn decode_key(encoded: Zeroizing<String>) -> Result<SigningKey, AuthError> {
    let bytes = hex::decode(encoded.as_str())
        .map_err(|e| AuthError::SigningUnavailable(e.to_string()))?;
    SigningKey::new(bytes)
}
