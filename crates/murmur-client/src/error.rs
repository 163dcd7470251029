use thiserror::Error;

use murmur_shared::ProtocolError;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Message was not sent: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
