use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("{0}")]
    Auth(String),
    #[error("Malformed response from server: {0}")]
    MalformedResponse(String),
    #[error("{0}")]
    Validation(String),
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Api(err) => Some(err.code),
            Self::Auth(_) => Some(ErrorCode::Unauthorized),
            Self::Validation(_) => Some(ErrorCode::Validation),
            _ => None,
        }
    }

    pub fn requires_reauth(&self) -> bool {
        matches!(self.code(), Some(ErrorCode::Unauthorized))
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
