pub mod password;
pub mod pool;
pub mod service;
pub mod store;
pub mod tokens;

// Re-export the main types and functions
pub use password::{constant_time_eq, DerivationParams, PasswordError};
pub use pool::DerivationPool;
pub use service::{AuthService, AuthenticatedSubject, NewAccount};
pub use store::{Account, AccountStore, CredentialRecord, StoreError};
pub use tokens::{ParsedToken, RefreshDecision, SessionToken, TokenManager};
