// First, declare the modules folder itself
mod modules;

// Re-export everything from modules for easier access
pub use modules::{auth, config, error, security, utils};

// Re-export commonly used types
pub use modules::auth::service::{AuthService, AuthenticatedSubject, NewAccount};
pub use modules::auth::store::{AccountStore, FileAccountStore, MemoryAccountStore};
pub use modules::auth::tokens::{RefreshDecision, SessionToken, TokenManager};
pub use modules::config::AuthConfig;
pub use modules::error::AuthError;

// Constants
pub const USERS_FILE: &str = "users.json";
pub const CONFIG_FILE: &str = "house-keys.json";
pub const KEYRING_SERVICE: &str = "house-keys";
pub const SIGNING_KEY_LENGTH: usize = 64;

