use axum::{response::IntoResponse, Json};
use http::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::service::hub::message::ErrorCode;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    BadConfig(&'static str),
    #[error("{n}: {1}", n = _0.as_str())]
    BadRequest(ErrorCode, &'static str),
    #[error("rate limit exceeded")]
    LimitExceeded,
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error("{0}")]
    Gone(&'static str),
    #[error("could not serialize response: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("i/o error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    pub fn bad_config(message: &'static str) -> Self {
        error!("BadConfig: {}", message);
        Self::BadConfig(message)
    }
}

/// The error body every HTTP endpoint answers with.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl Error {
    pub fn to_response(&self) -> (StatusCode, Json<ErrorBody>) {
        let message = format!("{self}");

        let (code, status_code, retryable) = match self {
            Self::BadRequest(code, _) => (
                code.as_str(),
                match code {
                    ErrorCode::ServerNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
                    ErrorCode::RoomFull => StatusCode::CONFLICT,
                    ErrorCode::NotHost => StatusCode::FORBIDDEN,
                    ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                    _ => StatusCode::BAD_REQUEST,
                },
                None,
            ),
            Self::LimitExceeded => ("RATE_LIMITED", StatusCode::TOO_MANY_REQUESTS, Some(true)),
            Self::Forbidden(_) => ("FORBIDDEN", StatusCode::FORBIDDEN, None),
            Self::Unauthorized(_) => ("UNAUTHORIZED", StatusCode::UNAUTHORIZED, None),
            Self::Gone(_) => ("UNKNOWN_SESSION", StatusCode::GONE, None),
            Self::BadConfig(_) => (
                ErrorCode::ServerNotConfigured.as_str(),
                StatusCode::SERVICE_UNAVAILABLE,
                None,
            ),
            _ => (
                ErrorCode::Internal.as_str(),
                StatusCode::INTERNAL_SERVER_ERROR,
                Some(true),
            ),
        };

        info!("Returning an error: {}: {}", status_code, message);

        (
            status_code,
            Json(ErrorBody {
                code,
                message: self.sanitized_message(),
                retryable,
            }),
        )
    }

    /// Sanitizes public-facing errors that can leak internal details.
    fn sanitized_message(&self) -> String {
        match self {
            Self::Json { .. } | Self::Io { .. } => String::from("Internal server error."),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        self.to_response().into_response()
    }
}
