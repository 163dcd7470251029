use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid payload: {0}")]
    Invalid(String),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("Missing session token")]
    Missing,

    #[error("Malformed session token: {0}")]
    Malformed(String),

    #[error("Session token expired")]
    Expired,

    #[error("Invalid session token signature")]
    BadSignature,

    #[error("Invalid issuer key")]
    InvalidIssuerKey,
}
