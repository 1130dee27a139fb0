use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::debug;
use serde::{Deserialize, Serialize};

use super::store::AccountStore;
use crate::modules::error::AuthError;
use crate::modules::security::SigningKey;
use crate::modules::utils::time::{from_unix_seconds, truncate_to_seconds};

const SIGNING_ALGORITHM: Algorithm = Algorithm::HS512;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: String,
    nbf: i64,
    exp: i64,
}

/// Signed bearer token. Immutable once issued; no server-side record exists.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken {
    subject_id: String,
    not_before: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    signature: Vec<u8>,
    encoded: String,
}

impl SessionToken {
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Compact form sent as the bearer credential
    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}

// The encoded form is a live credential and stays out of debug output
impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionToken")
            .field("subject_id", &self.subject_id)
            .field("not_before", &self.not_before)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A structurally sound, correctly signed token and whether it is still in
/// its validity period. Expiry is not an error.
#[derive(Debug, Clone)]
pub struct ParsedToken {
    pub token: SessionToken,
    pub valid: bool,
}

/// Temporal state of a token. Only moves forward as time passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshDecision {
    StillValid,
    RefreshableExpired,
    NonRefreshableExpired,
}

/// Issues, verifies and classifies session tokens
pub struct TokenManager {
    key: SigningKey,
    lifetime: Duration,
    refresh_window: Duration,
    validation: Validation,
}

impl TokenManager {
    pub fn new(key: SigningKey, lifetime: Duration, refresh_window: Duration) -> Self {
        // Only structure and signature are checked here. Time claims are
        // compared against the caller's clock in `parse` and `classify`.
        let mut validation = Validation::new(SIGNING_ALGORITHM);
        validation.leeway = 0;
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["sub", "nbf", "exp"]);

        Self {
            key,
            lifetime,
            refresh_window,
            validation,
        }
    }

    /// Sign a new token for `subject_id`, valid from `now` for the configured lifetime
    pub fn issue(&self, subject_id: &str, now: DateTime<Utc>) -> Result<SessionToken, AuthError> {
        if subject_id.is_empty() {
            return Err(AuthError::RequiredFieldEmpty("subject"));
        }

        let not_before = truncate_to_seconds(now);
        let expires_at = not_before.checked_add_signed(self.lifetime).ok_or_else(|| {
            AuthError::SigningUnavailable("token expiry out of range".to_string())
        })?;

        let claims = Claims {
            sub: subject_id.to_string(),
            nbf: not_before.timestamp(),
            exp: expires_at.timestamp(),
        };
        let encoded = encode(
            &Header::new(SIGNING_ALGORITHM),
            &claims,
            &EncodingKey::from_secret(self.key.as_bytes()),
        )
        .map_err(|e| AuthError::SigningUnavailable(e.to_string()))?;
        let signature = signature_of(&encoded)?;

        Ok(SessionToken {
            subject_id: claims.sub,
            not_before,
            expires_at,
            signature,
            encoded,
        })
    }

    /// Verify structure and signature of a raw token.
    ///
    /// Missing, malformed, forged and not-yet-valid tokens are errors. An
    /// expired token is returned with `valid == false` so it can still be
    /// classified for refresh.
    pub fn parse(&self, raw: &str, now: DateTime<Utc>) -> Result<ParsedToken, AuthError> {
        if raw.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let claims = decode::<Claims>(
            raw,
            &DecodingKey::from_secret(self.key.as_bytes()),
            &self.validation,
        )
        .map_err(|e| AuthError::MalformedToken(e.to_string()))?
        .claims;

        if claims.sub.is_empty() {
            return Err(malformed("token has no subject"));
        }
        let not_before =
            from_unix_seconds(claims.nbf).ok_or_else(|| malformed("not-before out of range"))?;
        let expires_at =
            from_unix_seconds(claims.exp).ok_or_else(|| malformed("expiry out of range"))?;
        if expires_at <= not_before {
            return Err(malformed("expiry does not follow not-before"));
        }

        if now < not_before {
            return Err(AuthError::TokenNotYetValid);
        }

        let valid = now < expires_at;
        debug!("Parsed token expiring at {} (valid={})", expires_at, valid);

        Ok(ParsedToken {
            token: SessionToken {
                subject_id: claims.sub,
                not_before,
                expires_at,
                signature: signature_of(raw)?,
                encoded: raw.to_string(),
            },
            valid,
        })
    }

    /// Classify a token against `now`; expiry is inclusive and the refresh
    /// window is exclusive.
    pub fn classify(&self, token: &SessionToken, now: DateTime<Utc>) -> RefreshDecision {
        if now < token.expires_at {
            return RefreshDecision::StillValid;
        }
        let elapsed_since_expiry = now - token.expires_at;
        if elapsed_since_expiry < self.refresh_window {
            RefreshDecision::RefreshableExpired
        } else {
            RefreshDecision::NonRefreshableExpired
        }
    }

    /// Parse and classify a token presented for refresh, returning it only
    /// when it is expired and still inside the refresh window
    pub fn check_refresh(&self, raw: &str, now: DateTime<Utc>) -> Result<SessionToken, AuthError> {
        let parsed = self.parse(raw, now)?;
        match self.classify(&parsed.token, now) {
            RefreshDecision::StillValid => Err(AuthError::StillValidNotRefreshable),
            RefreshDecision::NonRefreshableExpired => Err(AuthError::RefreshWindowElapsed),
            RefreshDecision::RefreshableExpired => Ok(parsed.token),
        }
    }

    /// Exchange an expired token for a fresh one for the same subject,
    /// provided the subject still resolves to an active account
    pub async fn refresh(
        &self,
        raw: &str,
        now: DateTime<Utc>,
        accounts: &dyn AccountStore,
    ) -> Result<SessionToken, AuthError> {
        let expired = self.check_refresh(raw, now)?;

        match accounts.find_by_id(expired.subject_id()).await? {
            Some(account) if account.is_active() => {}
            _ => return Err(AuthError::SubjectNoLongerActive),
        }

        self.issue(expired.subject_id(), now)
    }
}

fn malformed(reason: &str) -> AuthError {
    AuthError::MalformedToken(reason.to_string())
}

/// Raw MAC bytes from the last segment of a compact token
fn signature_of(encoded: &str) -> Result<Vec<u8>, AuthError> {
    let segment = encoded
        .rsplit('.')
        .next()
        .ok_or_else(|| malformed("token has no signature"))?;
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| malformed("signature is not valid base64url"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::auth::store::{MemoryAccountStore, NewAccountRecord};

    fn start() -> DateTime<Utc> {
        from_unix_seconds(1_700_000_000).unwrap()
    }

    fn manager() -> TokenManager {
        TokenManager::new(
            SigningKey::new(b"test-signing-secret".to_vec()).unwrap(),
            Duration::minutes(15),
            Duration::hours(7 * 24),
        )
    }

    async fn store_with_subject() -> (MemoryAccountStore, String) {
        let store = MemoryAccountStore::new();
        let id = store
            .insert(NewAccountRecord {
                first_name: "Test".to_string(),
                last_name: "User".to_string(),
                email: "u1@example.com".to_string(),
                language: "en".to_string(),
                password_hash: vec![0; 32],
                salt: vec![0; 32],
                created_at: start(),
            })
            .await
            .unwrap();
        (store, id)
    }

    #[test]
    fn test_issue_and_parse() {
        let manager = manager();
        let token = manager.issue("u1", start()).unwrap();

        assert_eq!(token.subject_id(), "u1");
        assert_eq!(token.not_before(), start());
        assert_eq!(token.expires_at(), start() + Duration::minutes(15));
        assert_eq!(token.signature().len(), 64);
        assert_eq!(token.as_str().split('.').count(), 3);

        let parsed = manager.parse(token.as_str(), start()).unwrap();
        assert!(parsed.valid);
        assert_eq!(parsed.token, token);
    }

    #[test]
    fn test_issue_truncates_to_seconds() {
        let manager = manager();
        let token = manager
            .issue("u1", start() + Duration::milliseconds(900))
            .unwrap();
        assert_eq!(token.not_before(), start());

        let parsed = manager.parse(token.as_str(), start()).unwrap();
        assert_eq!(parsed.token.not_before(), token.not_before());
    }

    #[test]
    fn test_issue_requires_subject() {
        assert!(matches!(
            manager().issue("", start()),
            Err(AuthError::RequiredFieldEmpty(_))
        ));
    }

    #[test]
    fn test_still_valid_for_full_lifetime() {
        let manager = manager();
        let token = manager.issue("u1", start()).unwrap();

        for offset in [0, 1, 60, 14 * 60, 15 * 60 - 1] {
            let now = start() + Duration::seconds(offset);
            assert_eq!(manager.classify(&token, now), RefreshDecision::StillValid);
            assert!(manager.parse(token.as_str(), now).unwrap().valid);
        }
    }

    #[test]
    fn test_expired_at_expiry_instant() {
        let manager = manager();
        let token = manager.issue("u1", start()).unwrap();
        let at_expiry = token.expires_at();

        assert_eq!(
            manager.classify(&token, at_expiry),
            RefreshDecision::RefreshableExpired
        );
        let parsed = manager.parse(token.as_str(), at_expiry).unwrap();
        assert!(!parsed.valid);
        assert_eq!(parsed.token.subject_id(), "u1");
    }

    #[test]
    fn test_refresh_window_boundary() {
        let manager = manager();
        let token = manager.issue("u1", start()).unwrap();
        let window_end = token.expires_at() + Duration::hours(7 * 24);

        assert_eq!(
            manager.classify(&token, window_end - Duration::seconds(1)),
            RefreshDecision::RefreshableExpired
        );
        assert_eq!(
            manager.classify(&token, window_end),
            RefreshDecision::NonRefreshableExpired
        );
        assert_eq!(
            manager.classify(&token, window_end + Duration::days(30)),
            RefreshDecision::NonRefreshableExpired
        );
    }

    #[test]
    fn test_classification_never_moves_backward() {
        let manager = manager();
        let token = manager.issue("u1", start()).unwrap();

        let rank = |decision| match decision {
            RefreshDecision::StillValid => 0,
            RefreshDecision::RefreshableExpired => 1,
            RefreshDecision::NonRefreshableExpired => 2,
        };

        let mut previous = 0;
        for hours in 0..(8 * 24) {
            let decision = manager.classify(&token, start() + Duration::hours(hours));
            assert!(rank(decision) >= previous);
            previous = rank(decision);
        }
        assert_eq!(previous, 2);
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let token = manager().issue("u1", start()).unwrap();
        let other = TokenManager::new(
            SigningKey::new(b"another-secret".to_vec()).unwrap(),
            Duration::minutes(15),
            Duration::hours(7 * 24),
        );
        assert!(matches!(
            other.parse(token.as_str(), start()),
            Err(AuthError::MalformedToken(_))
        ));
    }

    #[test]
    fn test_malformed_tokens() {
        let manager = manager();
        assert!(matches!(
            manager.parse("", start()),
            Err(AuthError::MissingToken)
        ));
        for raw in ["abc", "a.b", "a.b.c", "a.b.c.d", "...", "ey.ey.ey"] {
            assert!(
                matches!(manager.parse(raw, start()), Err(AuthError::MalformedToken(_))),
                "accepted {:?}",
                raw
            );
        }
    }

    #[test]
    fn test_other_algorithm_is_rejected() {
        let manager = manager();
        let token = manager.issue("u1", start()).unwrap();
        let mut segments: Vec<String> = token.as_str().split('.').map(String::from).collect();
        segments[0] = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);

        assert!(matches!(
            manager.parse(&segments.join("."), start()),
            Err(AuthError::MalformedToken(_))
        ));
    }

    #[test]
    fn test_same_key_with_weaker_algorithm_is_rejected() {
        let claims = Claims {
            sub: "u1".to_string(),
            nbf: start().timestamp(),
            exp: (start() + Duration::minutes(15)).timestamp(),
        };
        let forged = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-signing-secret"),
        )
        .unwrap();

        assert!(matches!(
            manager().parse(&forged, start()),
            Err(AuthError::MalformedToken(_))
        ));
    }

    #[test]
    fn test_missing_time_claims_are_rejected() {
        #[derive(Serialize)]
        struct SubjectOnly {
            sub: String,
        }

        let token = encode(
            &Header::new(SIGNING_ALGORITHM),
            &SubjectOnly {
                sub: "u1".to_string(),
            },
            &EncodingKey::from_secret(b"test-signing-secret"),
        )
        .unwrap();

        assert!(matches!(
            manager().parse(&token, start()),
            Err(AuthError::MalformedToken(_))
        ));
    }

    #[test]
    fn test_expiry_overflow_is_an_error() {
        let manager = TokenManager::new(
            SigningKey::new(b"test-signing-secret".to_vec()).unwrap(),
            Duration::days(365 * 1_000_000),
            Duration::hours(7 * 24),
        );
        assert!(matches!(
            manager.issue("u1", start()),
            Err(AuthError::SigningUnavailable(_))
        ));
    }

    #[test]
    fn test_single_bit_mutations_are_rejected() {
        let manager = manager();
        let token = manager.issue("u1", start()).unwrap();
        let raw = token.as_str().as_bytes().to_vec();

        for index in 0..raw.len() {
            for bit in 0..8 {
                let mut mutated = raw.clone();
                mutated[index] ^= 1 << bit;
                if let Ok(mutated) = String::from_utf8(mutated) {
                    assert!(
                        manager.parse(&mutated, start()).is_err(),
                        "mutation at byte {} bit {} was accepted",
                        index,
                        bit
                    );
                }
            }
        }
    }

    #[test]
    fn test_decoded_payload_and_signature_mutations_are_rejected() {
        let manager = manager();
        let token = manager.issue("u1", start()).unwrap();
        let segments: Vec<&str> = token.as_str().split('.').collect();

        for segment in [1, 2] {
            let decoded = URL_SAFE_NO_PAD.decode(segments[segment]).unwrap();
            for index in 0..decoded.len() {
                for bit in 0..8 {
                    let mut mutated = decoded.clone();
                    mutated[index] ^= 1 << bit;

                    let mut parts: Vec<String> = segments.iter().map(|s| s.to_string()).collect();
                    parts[segment] = URL_SAFE_NO_PAD.encode(&mutated);

                    assert!(manager.parse(&parts.join("."), start()).is_err());
                }
            }
        }
    }

    #[test]
    fn test_not_yet_valid() {
        let manager = manager();
        let token = manager.issue("u1", start()).unwrap();
        assert!(matches!(
            manager.parse(token.as_str(), start() - Duration::seconds(1)),
            Err(AuthError::TokenNotYetValid)
        ));
    }

    #[test]
    fn test_debug_hides_encoded_token() {
        let token = manager().issue("u1", start()).unwrap();
        let printed = format!("{:?}", token);
        assert!(printed.contains("u1"));
        assert!(!printed.contains(token.as_str()));
    }

    #[test]
    fn test_check_refresh() {
        let manager = manager();
        let token = manager.issue("u1", start()).unwrap();

        assert!(matches!(
            manager.check_refresh(token.as_str(), start() + Duration::minutes(5)),
            Err(AuthError::StillValidNotRefreshable)
        ));
        assert_eq!(
            manager
                .check_refresh(token.as_str(), start() + Duration::minutes(20))
                .unwrap()
                .subject_id(),
            "u1"
        );
        assert!(matches!(
            manager.check_refresh(token.as_str(), start() + Duration::days(8)),
            Err(AuthError::RefreshWindowElapsed)
        ));
        assert!(matches!(
            manager.check_refresh("garbage", start()),
            Err(AuthError::MalformedToken(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_issues_new_token() {
        let manager = manager();
        let (store, id) = store_with_subject().await;
        let token = manager.issue(&id, start()).unwrap();

        let now = start() + Duration::minutes(20);
        let refreshed = manager.refresh(token.as_str(), now, &store).await.unwrap();

        assert_eq!(refreshed.subject_id(), id);
        assert!(refreshed.expires_at() > token.expires_at());
        assert_eq!(refreshed.expires_at(), now + Duration::minutes(15));
        assert!(manager.parse(refreshed.as_str(), now).unwrap().valid);
    }

    #[tokio::test]
    async fn test_refresh_rejections() {
        let manager = manager();
        let (store, id) = store_with_subject().await;
        let token = manager.issue(&id, start()).unwrap();

        assert!(matches!(
            manager.refresh(token.as_str(), start(), &store).await,
            Err(AuthError::StillValidNotRefreshable)
        ));
        assert!(matches!(
            manager
                .refresh(token.as_str(), start() + Duration::days(8), &store)
                .await,
            Err(AuthError::RefreshWindowElapsed)
        ));
        assert!(matches!(
            manager.refresh("not.a.token", start(), &store).await,
            Err(AuthError::MalformedToken(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_requires_active_subject() {
        let manager = manager();
        let (store, id) = store_with_subject().await;
        let token = manager.issue(&id, start()).unwrap();
        let now = start() + Duration::minutes(20);

        store.set_enabled(&id, false).await.unwrap();
        assert!(matches!(
            manager.refresh(token.as_str(), now, &store).await,
            Err(AuthError::SubjectNoLongerActive)
        ));

        store.delete(&id).await.unwrap();
        assert!(matches!(
            manager.refresh(token.as_str(), now, &store).await,
            Err(AuthError::SubjectNoLongerActive)
        ));

        let ghost = manager.issue("deleted-subject", start()).unwrap();
        assert!(matches!(
            manager.refresh(ghost.as_str(), now, &store).await,
            Err(AuthError::SubjectNoLongerActive)
        ));
    }
}
