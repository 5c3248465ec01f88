use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use crate::server::dtos::error_dto::OfflineErrorResponse;
use crate::server::services::upstream_services::UpstreamError;

pub type AppResult<T> = Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// malformed or missing request parameters, never retried
    #[error("{0}")]
    BadRequest(String),

    /// the channel isn't broadcasting, the player should back off instead of retrying
    #[error("Stream offline")]
    StreamOffline,

    /// upstream answered with a status we don't pass through as a success
    #[error("Upstream returned {status}")]
    Upstream { status: u16 },

    /// upstream answered with something we can't hand to a player
    #[error("Bad gateway: {0}")]
    BadGateway(String),

    /// network errors or timeouts on every attempt
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("{0}")]
    InternalServerErrorWithContext(String),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::StreamOffline => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { status } => map_upstream_status(*status),
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamUnavailable(_) | Self::InternalServerErrorWithContext(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// client mistakes are not operational failures and don't count as errors in stats
    pub fn is_operational(&self) -> bool {
        !matches!(self, Self::BadRequest(_))
    }
}

/// translate what the origin said into something a browser player understands. 458 and
/// anything past 599 are this origin's own inventions, 509 is its bandwidth limit
pub fn map_upstream_status(status: u16) -> StatusCode {
    match status {
        458 => StatusCode::BAD_GATEWAY,
        509 => StatusCode::SERVICE_UNAVAILABLE,
        s if s >= 600 => StatusCode::BAD_GATEWAY,
        s => StatusCode::from_u16(s).unwrap_or(StatusCode::BAD_GATEWAY),
    }
}

impl From<UpstreamError> for Error {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Status { status, .. } => Self::Upstream { status },
            other => Self::UpstreamUnavailable(other.to_string()),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match self {
            Self::BadRequest(message) => (
                status,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                message,
            )
                .into_response(),
            Self::StreamOffline => (status, Json(OfflineErrorResponse::default())).into_response(),
            Self::Upstream { status: upstream } => (
                status,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                format!("Upstream returned {}", upstream),
            )
                .into_response(),
            Self::BadGateway(context) => {
                error!("Bad gateway: {}", context);
                (status, "Bad gateway").into_response()
            }
            Self::UpstreamUnavailable(context) => {
                // details stay in the logs, the player only needs the status
                error!("Upstream unavailable: {}", context);
                (
                    status,
                    [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                    "Upstream request failed",
                )
                    .into_response()
            }
            Self::InternalServerErrorWithContext(context) => {
                error!("Internal server error: {}", context);
                (status, "Internal server error").into_response()
            }
        }
    }
}
