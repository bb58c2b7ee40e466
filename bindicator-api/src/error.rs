//! Error envelope returned by every route.

use axum::{
    Json,
    extract::rejection::QueryRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use bindicator_core::{model::SourceKind, ports::PortError, service::ResolutionService};

const UPSTREAM_HINT: &str = "RBWM may be busy or unavailable. Please try again in a minute, \
                             or switch datasource to 'mock' for testing.";
const INTERNAL_HINT: &str = "Please retry shortly. If this persists, check server logs.";

#[derive(Debug)]
/// Failure of a request, rendered as `{ error, hint?, code, datasource, timestamp }`.
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
    hint: Option<&'static str>,
    datasource: SourceKind,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'static str>,
    code: u16,
    datasource: SourceKind,
    timestamp: DateTime<Utc>,
}

impl ApiError {
    /// Map a service error to its status code.
    pub(crate) fn from_port(service: &ResolutionService, err: PortError) -> Self {
        let datasource = service.source_kind();
        let (status, message, hint) = match err {
            _ if err.is_upstream() => (
                StatusCode::BAD_GATEWAY,
                err.to_string(),
                (datasource == SourceKind::Live).then_some(UPSTREAM_HINT),
            ),
            PortError::NotFound(detail) => (StatusCode::NOT_FOUND, detail, None),
            PortError::InvalidInput(detail) => (StatusCode::BAD_REQUEST, detail, None),
            PortError::UpstreamUnavailable(_)
            | PortError::ParseFailure(_)
            | PortError::Storage(_)
            | PortError::Internal(_) => {
                tracing::error!(error = %err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_owned(),
                    Some(INTERNAL_HINT),
                )
            }
        };

        Self {
            status,
            message,
            hint,
            datasource,
            timestamp: service.now(),
        }
    }

    /// Request the caller has to fix.
    pub(crate) fn bad_request(service: &ResolutionService, message: impl Into<String>) -> Self {
        Self::from_port(service, PortError::InvalidInput(message.into()))
    }

    /// Query string that does not deserialize.
    pub(crate) fn from_rejection(service: &ResolutionService, rejection: &QueryRejection) -> Self {
        Self::bad_request(service, rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: &self.message,
            hint: self.hint,
            code: self.status.as_u16(),
            datasource: self.datasource,
            timestamp: self.timestamp,
        };
        (self.status, Json(body)).into_response()
    }
}

/// Attach the service context needed to render a [`PortError`].
pub(crate) trait ResultExt<T> {
    fn or_api(self, service: &ResolutionService) -> Result<T, ApiError>;
}

impl<T> ResultExt<T> for Result<T, PortError> {
    fn or_api(self, service: &ResolutionService) -> Result<T, ApiError> {
        self.map_err(|err| ApiError::from_port(service, err))
    }
}
