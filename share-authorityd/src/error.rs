//! Error taxonomy for share operations.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No valid caller identity.
    #[error("unauthenticated")]
    Unauthenticated,

    /// Record does not exist, or does not belong to the caller.
    #[error("not found")]
    NotFound,

    /// Upstream friend graph could not be read.
    #[error("friend source unavailable: {0}")]
    FriendSourceUnavailable(String),

    /// The store mutation could not be paired with its notification and was
    /// rolled back.
    #[error("notification enqueue failed: {0}")]
    NotificationEnqueueFailed(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// The store thread is no longer accepting commands.
    #[error("store unavailable")]
    StoreUnavailable,
}

impl Error {
    pub fn friend_source<S: Into<String>>(msg: S) -> Self {
        Self::FriendSourceUnavailable(msg.into())
    }

    pub fn enqueue<S: Into<String>>(msg: S) -> Self {
        Self::NotificationEnqueueFailed(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::FriendSourceUnavailable(_) => StatusCode::BAD_GATEWAY,
            Error::NotificationEnqueueFailed(_) | Error::Persistence(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Error::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::StoreUnavailable
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::StoreUnavailable
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
