//! Sidecar error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tether_proto::RequestId;
use tether_state::{BusError, KvError, StateError};
use thiserror::Error;

use crate::correlation::AwaitError;

#[derive(Error, Debug)]
pub enum SidecarError {
    #[error("Service Unavailable")]
    Cancelled,

    #[error("failed to send message: {0}")]
    Publish(#[from] BusError),

    #[error("no pending request {0}")]
    UnknownRequest(RequestId),

    #[error("Not Found")]
    KeyNotFound(String),

    #[error("store error: {0}")]
    Store(#[from] KvError),

    #[error("no direct route to {0}")]
    NoDirectRoute(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("State backend error: {0}")]
    State(#[from] StateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SidecarError {
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Publish(_) => "publish_failed",
            Self::UnknownRequest(_) => "unknown_request",
            Self::KeyNotFound(_) => "key_not_found",
            Self::Store(_) => "store_error",
            Self::NoDirectRoute(_) => "no_direct_route",
            Self::BadRequest(_) => "bad_request",
            Self::State(_) => "state_error",
            Self::Io(_) => "io_error",
        }
    }

    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            Self::UnknownRequest(_) | Self::KeyNotFound(_) | Self::NoDirectRoute(_) => {
                StatusCode::NOT_FOUND
            }
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Publish(_)
            | Self::Store(_)
            | Self::State(_)
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<AwaitError> for SidecarError {
    fn from(err: AwaitError) -> Self {
        match err {
            AwaitError::NotFound(request) => Self::UnknownRequest(request),
            AwaitError::Cancelled => Self::Cancelled,
        }
    }
}

impl IntoResponse for SidecarError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() && !matches!(self, Self::Cancelled) {
            tracing::error!(error_type = self.error_type(), error = %self, "Request failed");
        } else {
            tracing::debug!(error_type = self.error_type(), error = %self, "Request rejected");
        }

        let message = match &self {
            Self::Cancelled
            | Self::Publish(_)
            | Self::UnknownRequest(_)
            | Self::KeyNotFound(_)
            | Self::Store(_)
            | Self::NoDirectRoute(_)
            | Self::BadRequest(_) => self.to_string(),

            Self::State(_) | Self::Io(_) => "Internal server error".to_owned(),
        };

        (status, message).into_response()
    }
}
