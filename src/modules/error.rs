use thiserror::Error;

use crate::modules::auth::password::PasswordError;
use crate::modules::auth::store::StoreError;
use crate::modules::config::ConfigError;

/// Errors surfaced by the authentication core to its caller.
///
/// Only `CredentialMismatch` is deliberately vague; every other variant may be
/// reported precisely since none of them reveals whether an account exists.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid email address or password")]
    CredentialMismatch,

    #[error("token is not valid: {0}")]
    MalformedToken(String),

    #[error("no token were provided")]
    MissingToken,

    #[error("authorization header format must be Bearer {{token}}")]
    InvalidAuthorizationHeader,

    #[error("token is not valid yet")]
    TokenNotYetValid,

    #[error("this token is expired but can be refreshed")]
    TokenExpired,

    #[error("this token is still valid and cannot be refreshed yet")]
    StillValidNotRefreshable,

    #[error("this token is expired and cannot be refreshed, you must login")]
    RefreshWindowElapsed,

    #[error("account no longer exists or has been disabled")]
    SubjectNoLongerActive,

    #[error("at least one of the required fields is empty: {0}")]
    RequiredFieldEmpty(&'static str),

    #[error("email address domain is forbidden")]
    EmailAddressDomainForbidden,

    #[error("email address already exists")]
    EmailAddressAlreadyExists,

    #[error("secure random source unavailable: {0}")]
    EntropyUnavailable(String),

    #[error("token signing unavailable: {0}")]
    SigningUnavailable(String),

    #[error("password derivation failed: {0}")]
    Derivation(String),

    #[error("account store error: {0}")]
    Store(#[from] StoreError),

    #[error("account store did not answer in time")]
    StoreTimeout,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl AuthError {
    /// Stable machine-readable code sent alongside the message
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::CredentialMismatch => "credentialDoesNotMatch",
            AuthError::MalformedToken(_)
            | AuthError::MissingToken
            | AuthError::InvalidAuthorizationHeader
            | AuthError::TokenNotYetValid => "badRequest",
            AuthError::TokenExpired => "jwtExpiredCanBeRefreshed",
            AuthError::StillValidNotRefreshable => "jwtIsStillValid",
            AuthError::RefreshWindowElapsed => "jwtExpiredCannotBeRefreshed",
            AuthError::SubjectNoLongerActive => "resourceNotFound",
            AuthError::RequiredFieldEmpty(_) => "requiredFieldEmpty",
            AuthError::EmailAddressDomainForbidden => "emailAddressDomainForbidden",
            AuthError::EmailAddressAlreadyExists => "emailAddressAlreadyExists",
            AuthError::EntropyUnavailable(_)
            | AuthError::SigningUnavailable(_)
            | AuthError::Derivation(_)
            | AuthError::Store(_)
            | AuthError::StoreTimeout
            | AuthError::Config(_) => "internalServerError",
        }
    }

    /// HTTP status hint for the boundary layer
    pub fn status(&self) -> u16 {
        match self {
            AuthError::CredentialMismatch
            | AuthError::TokenExpired
            | AuthError::RefreshWindowElapsed
            | AuthError::SubjectNoLongerActive => 401,
            AuthError::MalformedToken(_)
            | AuthError::MissingToken
            | AuthError::InvalidAuthorizationHeader
            | AuthError::TokenNotYetValid
            | AuthError::StillValidNotRefreshable
            | AuthError::RequiredFieldEmpty(_) => 400,
            AuthError::EmailAddressDomainForbidden => 406,
            AuthError::EmailAddressAlreadyExists => 409,
            AuthError::StoreTimeout => 504,
            AuthError::Store(StoreError::Unavailable(_)) => 503,
            _ => 500,
        }
    }

    /// Infrastructure failures whose details stay in the logs
    pub fn is_internal(&self) -> bool {
        self.code() == "internalServerError"
    }
}

impl From<PasswordError> for AuthError {
    fn from(err: PasswordError) -> Self {
        match err {
            PasswordError::EntropyUnavailable(msg) => AuthError::EntropyUnavailable(msg),
            other => AuthError::Derivation(other.to_string()),
        }
    }
}
