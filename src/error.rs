use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Problems found while validating user input. Every problem is collected
/// before the input is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", problems.join("\n"))]
pub struct ValidationError {
    pub problems: Vec<String>,
}

impl ValidationError {
    pub fn new(problems: Vec<String>) -> Self {
        Self { problems }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("{}", .0.join("\n"))]
    Invalid(Vec<String>),
    #[error("oauth request aborted")]
    Aborted,
    #[error("oauth request timed out after {0} milliseconds")]
    TimedOut(u64),
    #[error("oauth response did not contain an access token")]
    MissingToken,
    #[error("oauth request failed with status {0}")]
    Rejected(u16),
}

pub enum AppError {
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(message) => {
                tracing::debug!("Bad request: {}", message);
                (StatusCode::BAD_REQUEST, message).into_response()
            }
            AppError::Internal(err) => {
                tracing::error!("Error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Unexpected error!".to_string(),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Internal(err.into())
    }
}
