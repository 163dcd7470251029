use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use murmur_shared::protocol::{ErrorKind, ErrorPayload, ServerEvent};
use murmur_shared::{ProtocolError, TokenError};
use murmur_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("{0}")]
    AccessDenied(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::Authentication(_) => ErrorKind::AuthenticationError,
            ServerError::AccessDenied(_) => ErrorKind::AccessDenied,
            ServerError::Validation(_) => ErrorKind::ValidationFailed,
            ServerError::NotFound(_) => ErrorKind::NotFound,
            ServerError::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Text safe to show the client. Internal details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            ServerError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn into_event(self, client_temp_id: Option<String>) -> ServerEvent {
        ServerEvent::Error(ErrorPayload {
            message: self.client_message(),
            kind: self.kind(),
            client_temp_id,
        })
    }

    pub fn access_denied() -> Self {
        ServerError::AccessDenied("Access denied to this channel".into())
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ServerError::NotFound("Record not found".into()),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl From<ProtocolError> for ServerError {
    fn from(e: ProtocolError) -> Self {
        ServerError::Validation(e.to_string())
    }
}

impl From<TokenError> for ServerError {
    fn from(e: TokenError) -> Self {
        ServerError::Authentication(e.to_string())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::Authentication(_) => StatusCode::UNAUTHORIZED,
            ServerError::AccessDenied(_) => StatusCode::FORBIDDEN,
            ServerError::Validation(_) => StatusCode::BAD_REQUEST,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.client_message(),
            "kind": self.kind(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_details_hidden() {
        let err = ServerError::Internal("disk I/O error at /var/db".into());
        assert_eq!(err.client_message(), "Internal server error");

        let ServerEvent::Error(payload) = err.into_event(Some("t1".into())) else {
            panic!("expected error event");
        };
        assert_eq!(payload.kind, ErrorKind::InternalError);
        assert_eq!(payload.client_temp_id.as_deref(), Some("t1"));
    }

    #[test]
    fn test_store_error_mapping() {
        assert_eq!(ServerError::from(StoreError::NotFound).kind(), ErrorKind::NotFound);
        assert_eq!(
            ServerError::from(StoreError::Poisoned).kind(),
            ErrorKind::InternalError
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ServerError::access_denied().into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ServerError::Authentication("expired".into())
                .into_response()
                .status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
