use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    extract::{Path, Query, State},
    http::{header, HeaderName, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use catalogue_shared::protocol::{
    CATALOGUE_PATH, HEALTH_PATH, REQUEST_ID_HEADER, TRACEPARENT_HEADER, USER_ID_HEADER,
};
use catalogue_shared::types::{CatalogueEntry, CatalogueVersion, CreateEntryRequest, UpdateEntryRequest};
use crate::config::Config;
use crate::context::RequestContext;
use crate::error::{CatalogueError, FieldError};
use crate::store::CatalogueStore;
use crate::validation::{self, ListQuery, SearchQuery};
use super::error::{ApiError, ForRequest};
use super::middleware::context_middleware;

#[derive(Clone)]
pub struct AppState {
    pub store: CatalogueStore,
    pub config: Arc<Config>,
    /// Parent of every request's cancellation token
    pub shutdown: CancellationToken,
    /// Set once shutdown starts so load balancers drain us
    pub shutting_down: Arc<AtomicBool>,
}

pub fn router(state: AppState) -> Router {
    with_layers(routes(), state)
}

fn routes() -> Router<AppState> {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(CATALOGUE_PATH, get(list_entries).post(create_entry))
        .route(&format!("{CATALOGUE_PATH}/search"), get(search_entries))
        .route(
            &format!("{CATALOGUE_PATH}/versions/:version_id"),
            get(get_version),
        )
        .route(
            &format!("{CATALOGUE_PATH}/:service_id"),
            get(get_entry).patch(update_entry).delete(delete_entry),
        )
        .route(
            &format!("{CATALOGUE_PATH}/:service_id/versions"),
            get(list_versions),
        )
}

/// Middleware, innermost first: panic recovery, request context, CORS, tracing.
fn with_layers(routes: Router<AppState>, state: AppState) -> Router {
    routes
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn_with_state(state.clone(), context_middleware))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Any origin may call us; preflight requests are answered here and never reach a handler.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::CONTENT_LENGTH,
            header::AUTHORIZATION,
            header::ACCEPT,
            HeaderName::from_static(REQUEST_ID_HEADER),
            HeaderName::from_static(USER_ID_HEADER),
            HeaderName::from_static(TRACEPARENT_HEADER),
        ])
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!(panic = %message, "Handler panicked");

    let body = json!({
        "error": "internal server error",
        "kind": "internal",
        "timestamp": Utc::now(),
    });
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

fn malformed(ctx: &RequestContext, field: &str, message: String) -> ApiError {
    ApiError::new(ctx, CatalogueError::Validation(vec![FieldError::new(field, message)]))
}

async fn health(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.shutting_down.load(Ordering::SeqCst) {
        (StatusCode::SERVICE_UNAVAILABLE, "Server Shutting Down")
    } else {
        (StatusCode::OK, "Working!")
    }
}

async fn list_entries(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<CatalogueEntry>>, ApiError> {
    let Query(query) = query.map_err(|e| malformed(&ctx, "query", e.body_text()))?;
    let params = validation::validate_list(&query, Utc::now()).for_request(&ctx)?;

    state.store.list_all(&ctx, &params).await.map(Json).for_request(&ctx)
}

async fn search_entries(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    query: Result<Query<SearchQuery>, QueryRejection>,
) -> Result<Json<Vec<CatalogueEntry>>, ApiError> {
    let Query(query) = query.map_err(|e| malformed(&ctx, "query", e.body_text()))?;
    let params = validation::validate_search(&query).for_request(&ctx)?;

    state.store.fuzzy_search(&ctx, &params).await.map(Json).for_request(&ctx)
}

async fn create_entry(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    body: Result<Json<CreateEntryRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CatalogueEntry>), ApiError> {
    let Json(body) = body.map_err(|e| malformed(&ctx, "body", e.body_text()))?;
    let new = validation::validate_create(body, ctx.user_id()).for_request(&ctx)?;

    let entry = state.store.create(&ctx, new).await.for_request(&ctx)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn get_entry(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(service_id): Path<String>,
) -> Result<Json<CatalogueEntry>, ApiError> {
    state.store.fetch_by_id(&ctx, &service_id).await.map(Json).for_request(&ctx)
}

async fn update_entry(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(service_id): Path<String>,
    body: Result<Json<UpdateEntryRequest>, JsonRejection>,
) -> Result<Json<CatalogueEntry>, ApiError> {
    let Json(body) = body.map_err(|e| malformed(&ctx, "body", e.body_text()))?;
    let update = validation::validate_update(&service_id, body, ctx.user_id()).for_request(&ctx)?;

    state.store.update(&ctx, update).await.map(Json).for_request(&ctx)
}

async fn delete_entry(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(service_id): Path<String>,
) -> Result<Json<CatalogueVersion>, ApiError> {
    let removal = validation::validate_delete(&service_id, ctx.user_id()).for_request(&ctx)?;

    state.store.delete(&ctx, removal).await.map(Json).for_request(&ctx)
}

async fn list_versions(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(service_id): Path<String>,
) -> Result<Json<Vec<CatalogueVersion>>, ApiError> {
    state.store.list_versions(&ctx, &service_id).await.map(Json).for_request(&ctx)
}

async fn get_version(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(version_id): Path<String>,
) -> Result<Json<CatalogueVersion>, ApiError> {
    state
        .store
        .fetch_version_by_id(&ctx, &version_id)
        .await
        .map(Json)
        .for_request(&ctx)
}
