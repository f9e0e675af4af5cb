use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::context::{Interrupted, RequestContext};
use crate::error::{CatalogueError, ErrorKind, FieldError};

/// A catalogue error bound to the request that produced it.
#[derive(Debug)]
pub struct ApiError {
    request_id: String,
    trace_id: String,
    error: CatalogueError,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    error: String,
    kind: ErrorKind,
    #[serde(skip_serializing_if = "<[FieldError]>::is_empty")]
    fields: &'a [FieldError],
    timestamp: DateTime<Utc>,
    request_id: &'a str,
    trace_id: &'a str,
}

impl ApiError {
    pub fn new(ctx: &RequestContext, error: CatalogueError) -> Self {
        let status = status_for(&error);
        if status.is_server_error() {
            tracing::error!(parent: ctx.logger(), error = %error, status = status.as_u16(), "Request failed");
        } else {
            tracing::debug!(parent: ctx.logger(), error = %error, status = status.as_u16(), "Request rejected");
        }
        Self {
            request_id: ctx.request_id().to_string(),
            trace_id: ctx.trace_id().to_string(),
            error,
        }
    }
}

pub fn status_for(error: &CatalogueError) -> StatusCode {
    match error {
        CatalogueError::Validation(_) => StatusCode::BAD_REQUEST,
        CatalogueError::NotFound { .. } => StatusCode::NOT_FOUND,
        CatalogueError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        CatalogueError::BackendQuery { .. } | CatalogueError::BackendWrite { .. } => StatusCode::BAD_GATEWAY,
        CatalogueError::DataIntegrityAnomaly(_) => StatusCode::INTERNAL_SERVER_ERROR,
        CatalogueError::Cancelled(Interrupted::DeadlineExceeded) => StatusCode::GATEWAY_TIMEOUT,
        // Only shutdown cancels a request from outside
        CatalogueError::Cancelled(Interrupted::Cancelled) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.error.to_string(),
            kind: self.error.kind(),
            fields: self.error.fields(),
            timestamp: Utc::now(),
            request_id: &self.request_id,
            trace_id: &self.trace_id,
        };
        (status_for(&self.error), Json(body)).into_response()
    }
}

/// Attach the request to a store result so failures render with its id.
pub trait ForRequest<T> {
    fn for_request(self, ctx: &RequestContext) -> Result<T, ApiError>;
}

impl<T> ForRequest<T> for Result<T, CatalogueError> {
    fn for_request(self, ctx: &RequestContext) -> Result<T, ApiError> {
        self.map_err(|e| ApiError::new(ctx, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (CatalogueError::Validation(vec![]), StatusCode::BAD_REQUEST),
            (
                CatalogueError::NotFound { entity: "service", id: "x".into() },
                StatusCode::NOT_FOUND,
            ),
            (
                CatalogueError::BackendUnavailable { status: None, message: "down".into() },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                CatalogueError::BackendQuery { status: 400, message: "bad".into() },
                StatusCode::BAD_GATEWAY,
            ),
            (
                CatalogueError::BackendWrite { status: 409, message: "conflict".into() },
                StatusCode::BAD_GATEWAY,
            ),
            (
                CatalogueError::DataIntegrityAnomaly("broken".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                CatalogueError::Cancelled(Interrupted::DeadlineExceeded),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                CatalogueError::Cancelled(Interrupted::Cancelled),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(status_for(&error), status, "{error}");
        }
    }

    #[tokio::test]
    async fn test_body_carries_request_id_and_fields() {
        let ctx = RequestContext::background("catalogue");
        let response = ApiError::new(
            &ctx,
            CatalogueError::Validation(vec![FieldError::new("name", "is required")]),
        )
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["kind"], "validation");
        assert_eq!(body["requestId"], ctx.request_id());
        assert_eq!(body["traceId"], ctx.trace_id());
        assert_eq!(body["fields"][0]["field"], "name");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_fields_omitted_when_empty() {
        let ctx = RequestContext::background("catalogue");
        let response = ApiError::new(
            &ctx,
            CatalogueError::NotFound { entity: "service", id: "x".into() },
        )
        .into_response();

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "service x not found");
        assert!(body.get("fields").is_none());
    }
}
