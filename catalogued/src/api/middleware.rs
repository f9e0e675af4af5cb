//! Builds the request context for every incoming request.

use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::Response;
use tracing::Instrument;

use catalogue_shared::protocol::{REQUEST_ID_HEADER, TRACEPARENT_HEADER, USER_ID_HEADER};
use crate::context::RequestContext;
use super::routes::AppState;

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Trace id from a W3C `traceparent` header (`version-traceid-parentid-flags`).
fn trace_id_from(traceparent: &str) -> Option<String> {
    let mut parts = traceparent.split('-');
    let _version = parts.next()?;
    let trace_id = parts.next()?;
    let valid = trace_id.len() == 32
        && trace_id.chars().all(|c| c.is_ascii_hexdigit())
        && trace_id.chars().any(|c| c != '0');
    valid.then(|| trace_id.to_ascii_lowercase())
}

pub fn context_from_headers(state: &AppState, headers: &HeaderMap) -> RequestContext {
    let request_id =
        header_string(headers, REQUEST_ID_HEADER).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let trace_id = header_string(headers, TRACEPARENT_HEADER)
        .and_then(|t| trace_id_from(&t))
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

    RequestContext::new(
        &state.config.app.service_name,
        request_id,
        trace_id,
        state.shutdown.child_token(),
    )
    .with_user(header_string(headers, USER_ID_HEADER))
    .with_timeout(state.config.api.request_timeout())
}

/// Inject a `RequestContext` extension, run the request inside its span and echo the request id.
pub async fn context_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let ctx = context_from_headers(&state, req.headers());
    let span = ctx.logger().clone();
    let request_id = ctx.request_id().to_string();
    let trace_id = ctx.trace_id().to_string();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    req.extensions_mut().insert(ctx);

    let started = Instant::now();
    let mut response = next.run(req).instrument(span.clone()).await;

    tracing::info!(
        parent: &span,
        %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        trace_id = %trace_id,
        "Request handled"
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}
