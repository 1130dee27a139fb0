use std::io;

use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

/// Output of the password derivation, wiped from memory on drop
pub type DerivedKey = Zeroizing<Vec<u8>>;

/// Failures of the credential verifier
#[derive(Error, Debug)]
pub enum PasswordError {
    #[error("invalid derivation parameters: {0}")]
    InvalidParams(String),

    #[error("key derivation failed: {0}")]
    Derivation(String),

    #[error("secure random source unavailable: {0}")]
    EntropyUnavailable(String),

    #[error("derivation worker failed: {0}")]
    Worker(String),
}

/// Argon2id cost parameters.
///
/// Registration and verification must run with identical values, otherwise
/// every stored hash stops matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivationParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
    pub output_len: usize,
}

impl Default for DerivationParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 2,
            output_len: 32,
        }
    }
}

impl DerivationParams {
    /// Build the Argon2id context, rejecting parameters the algorithm refuses
    pub fn to_argon2(&self) -> Result<Argon2<'static>, PasswordError> {
        let params = Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(self.output_len),
        )
        .map_err(|e| PasswordError::InvalidParams(e.to_string()))?;

        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    /// Cheap parameters so unit tests stay fast
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 2,
            output_len: 32,
        }
    }
}

/// Derive the comparable secret for a password and salt.
///
/// Deterministic for fixed parameters. The cost is intentional.
pub fn derive(
    password: &[u8],
    salt: &[u8],
    params: &DerivationParams,
) -> Result<DerivedKey, PasswordError> {
    let argon2 = params.to_argon2()?;
    let mut output = Zeroizing::new(vec![0u8; params.output_len]);

    argon2
        .hash_password_into(password, salt, output.as_mut_slice())
        .map_err(|e| PasswordError::Derivation(e.to_string()))?;

    Ok(output)
}

/// Draw `length` bytes from the operating system CSPRNG
pub fn generate_salt(length: usize) -> Result<Vec<u8>, PasswordError> {
    let mut salt = vec![0u8; length];
    OsRng
        .try_fill_bytes(&mut salt)
        .map_err(|e| PasswordError::EntropyUnavailable(e.to_string()))?;
    Ok(salt)
}

/// Check a password against a stored hash
pub fn verify(
    password: &[u8],
    salt: &[u8],
    expected_hash: &[u8],
    params: &DerivationParams,
) -> Result<bool, PasswordError> {
    let derived = derive(password, salt, params)?;
    Ok(constant_time_eq(&derived, expected_hash))
}

/// Byte comparison whose running time does not depend on where the inputs differ
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Read a password from the terminal without echo
pub fn read_password() -> io::Result<Zeroizing<String>> {
    rpassword::read_password().map(Zeroizing::new)
}
