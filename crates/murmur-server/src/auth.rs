//! Session authentication.
//!
//! Verifies `SessionToken`s minted by the external auth service using
//! ed25519-dalek, then resolves the user against the store so a token for a
//! deleted account is refused.

use std::sync::Arc;

use tracing::{debug, error};

use murmur_shared::session::verify_session_token;
use murmur_shared::types::UserId;
use murmur_store::ChatStore;

use crate::error::ServerError;

/// The authenticated user behind a connection or request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
}

/// Verifies session tokens against the issuer's public key.
#[derive(Clone)]
pub struct SessionVerifier {
    /// The auth service's Ed25519 public key.
    issuer_pubkey: [u8; 32],
    store: Arc<dyn ChatStore>,
}

impl SessionVerifier {
    pub fn new(issuer_pubkey: [u8; 32], store: Arc<dyn ChatStore>) -> Self {
        Self {
            issuer_pubkey,
            store,
        }
    }

    pub async fn authenticate(&self, raw: Option<&str>) -> Result<Identity, ServerError> {
        let raw = match raw.map(str::trim) {
            Some(raw) if !raw.is_empty() => raw,
            _ => return Err(ServerError::Authentication("No token provided".into())),
        };

        let token = verify_session_token(raw, &self.issuer_pubkey).map_err(|e| {
            debug!(error = %e, "Session token rejected");
            ServerError::from(e)
        })?;

        let user = match self.store.get_user(token.user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                debug!(user = %token.user_id, "Session token for unknown user");
                return Err(ServerError::Authentication("User not found".into()));
            }
            Err(e) => {
                error!(error = %e, "User lookup failed during authentication");
                return Err(e.into());
            }
        };

        Ok(Identity {
            user_id: user.id,
            display_name: user.display_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use ed25519_dalek::SigningKey;
    use murmur_shared::protocol::ErrorKind;
    use murmur_shared::session::create_session_token;
    use murmur_store::{SqliteStore, User};
    use rand::rngs::OsRng;

    async fn setup() -> (SessionVerifier, SigningKey, UserId) {
        let issuer = SigningKey::generate(&mut OsRng);
        let store = SqliteStore::open_in_memory().unwrap();
        let alice = UserId::new();
        store
            .with_db(move |db| db.upsert_user(&User::new(alice, "alice")))
            .await
            .unwrap();

        let verifier = SessionVerifier::new(issuer.verifying_key().to_bytes(), Arc::new(store));
        (verifier, issuer, alice)
    }

    #[tokio::test]
    async fn test_valid_token_resolves_identity() {
        let (verifier, issuer, alice) = setup().await;
        let token = create_session_token(alice, "alice", Utc::now() + Duration::hours(1), &issuer);

        let identity = verifier.authenticate(Some(&token.encode())).await.unwrap();
        assert_eq!(identity.user_id, alice);
        assert_eq!(identity.display_name, "alice");
    }

    #[tokio::test]
    async fn test_missing_and_expired_tokens() {
        let (verifier, issuer, alice) = setup().await;

        let err = verifier.authenticate(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationError);

        let expired = create_session_token(alice, "alice", Utc::now() - Duration::hours(1), &issuer);
        let err = verifier.authenticate(Some(&expired.encode())).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationError);
    }

    #[tokio::test]
    async fn test_unknown_user_rejected() {
        let (verifier, issuer, _) = setup().await;
        let stranger = create_session_token(
            UserId::new(),
            "mallory",
            Utc::now() + Duration::hours(1),
            &issuer,
        );

        let err = verifier.authenticate(Some(&stranger.encode())).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationError);
    }

    #[tokio::test]
    async fn test_foreign_issuer_rejected() {
        let (verifier, _, alice) = setup().await;
        let other_issuer = SigningKey::generate(&mut OsRng);
        let token = create_session_token(alice, "alice", Utc::now() + Duration::hours(1), &other_issuer);

        assert!(verifier.authenticate(Some(&token.encode())).await.is_err());
    }
}
