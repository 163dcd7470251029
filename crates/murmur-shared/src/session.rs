use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::TokenError;
use crate::types::UserId;

// Token minted by the auth service after login, presented on connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    pub user_id: UserId,
    pub display_name: String,
    pub expires_at: DateTime<Utc>,
    pub signature: Vec<u8>,
}

// payload = user_id || display_name || expires_at (rfc3339)
fn signed_payload(user_id: &UserId, display_name: &str, expires_at: &DateTime<Utc>) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(user_id.0.as_bytes());
    payload.extend_from_slice(display_name.as_bytes());
    payload.extend_from_slice(expires_at.to_rfc3339().as_bytes());
    payload
}

impl SessionToken {
    /// Wire form: base64url(JSON), unpadded, safe in a query string.
    pub fn encode(&self) -> String {
        // Serializing a plain struct of strings/bytes cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(raw: &str) -> Result<Self, TokenError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TokenError::Missing);
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|e| TokenError::Malformed(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| TokenError::Malformed(e.to_string()))
    }

    /// Check expiry, then the issuer signature.
    pub fn verify(&self, issuer_pubkey: &[u8; 32]) -> Result<(), TokenError> {
        if Utc::now() > self.expires_at {
            return Err(TokenError::Expired);
        }

        let verifying_key =
            VerifyingKey::from_bytes(issuer_pubkey).map_err(|_| TokenError::InvalidIssuerKey)?;

        let signature =
            Signature::from_slice(&self.signature).map_err(|_| TokenError::BadSignature)?;

        let payload = signed_payload(&self.user_id, &self.display_name, &self.expires_at);
        verifying_key
            .verify(&payload, &signature)
            .map_err(|_| TokenError::BadSignature)
    }
}

/// Decode and verify in one step.
pub fn verify_session_token(raw: &str, issuer_pubkey: &[u8; 32]) -> Result<SessionToken, TokenError> {
    let token = SessionToken::decode(raw)?;
    token.verify(issuer_pubkey)?;
    Ok(token)
}

/// Mint a token. Used by the auth service and by tests.
pub fn create_session_token(
    user_id: UserId,
    display_name: &str,
    expires_at: DateTime<Utc>,
    issuer_signing_key: &ed25519_dalek::SigningKey,
) -> SessionToken {
    use ed25519_dalek::Signer;

    let payload = signed_payload(&user_id, display_name, &expires_at);
    let signature = issuer_signing_key.sign(&payload);

    SessionToken {
        user_id,
        display_name: display_name.to_string(),
        expires_at,
        signature: signature.to_bytes().to_vec(),
    }
}
