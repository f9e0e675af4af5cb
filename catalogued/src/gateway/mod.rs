//! Backend gateway: the only code that talks to the document store.
//!
//! Every call takes the request context so cancellation and deadlines reach in-flight I/O.

pub mod elastic;
pub mod memory;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::context::{Interrupted, RequestContext};
use crate::query::SearchRequest;

pub use elastic::ElasticGateway;
pub use memory::MemoryGateway;

/// One search hit as returned by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RawHit {
    pub document_id: String,
    pub source: Value,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    /// Transport failure, the backend could not be reached or answered 5xx.
    #[error("backend unavailable: {message}")]
    Unavailable { status: Option<u16>, message: String },

    #[error("backend rejected query ({status}): {message}")]
    Query { status: u16, message: String },

    #[error("backend rejected write ({status}): {message}")]
    Write { status: u16, message: String },

    #[error("document {document_id} not found in {collection}")]
    DocumentNotFound {
        collection: String,
        document_id: String,
    },

    #[error(transparent)]
    Cancelled(#[from] Interrupted),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Run `request` against `collection`. No hits is a valid, empty result.
    async fn search(
        &self,
        ctx: &RequestContext,
        collection: &str,
        request: &SearchRequest,
    ) -> GatewayResult<Vec<RawHit>>;

    /// Insert a new document and return its backend-generated id.
    async fn create_document(
        &self,
        ctx: &RequestContext,
        collection: &str,
        document: Value,
    ) -> GatewayResult<String>;

    /// Merge `patch` into the stored document, leaving unlisted fields untouched.
    async fn partial_update_document(
        &self,
        ctx: &RequestContext,
        collection: &str,
        document_id: &str,
        patch: Value,
    ) -> GatewayResult<()>;

    async fn delete_document(
        &self,
        ctx: &RequestContext,
        collection: &str,
        document_id: &str,
    ) -> GatewayResult<()>;

    /// Create `collection` with `mapping` unless it already exists.
    async fn ensure_collection(
        &self,
        ctx: &RequestContext,
        collection: &str,
        mapping: &Value,
    ) -> GatewayResult<()>;
}

/// Emit one event per gateway call with its operation, collection and outcome.
pub(crate) fn log_outcome<T>(
    ctx: &RequestContext,
    operation: &'static str,
    collection: &str,
    result: &GatewayResult<T>,
) {
    match result {
        Ok(_) => tracing::debug!(parent: ctx.logger(), operation, collection, outcome = "ok"),
        Err(GatewayError::Cancelled(reason)) => {
            tracing::info!(parent: ctx.logger(), operation, collection, outcome = "cancelled", %reason)
        }
        Err(e) => tracing::warn!(parent: ctx.logger(), operation, collection, outcome = "error", error = %e),
    }
}

/// Names of the two collections the catalogue is split across.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collections {
    pub entries: String,
    pub versions: String,
}

impl Default for Collections {
    fn default() -> Self {
        Self {
            entries: catalogue_shared::protocol::CATALOGUE_COLLECTION.to_string(),
            versions: catalogue_shared::protocol::VERSIONS_COLLECTION.to_string(),
        }
    }
}

fn keyword_text() -> Value {
    json!({ "type": "text", "fields": { "keyword": { "type": "keyword", "ignore_above": 256 } } })
}

/// Mapping for current catalogue entries
pub fn entries_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "serviceId": keyword_text(),
                "name": keyword_text(),
                "description": { "type": "text" },
                "version": { "type": "long" },
                "createdAt": { "type": "date" },
                "updatedAt": { "type": "date" },
                "createdBy": keyword_text(),
                "updatedBy": keyword_text(),
            }
        }
    })
}

/// Mapping for version snapshots
pub fn versions_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "parentId": keyword_text(),
                "versionId": keyword_text(),
                "name": keyword_text(),
                "description": { "type": "text" },
                "version": { "type": "long" },
                "createdAt": { "type": "date" },
                "decomissionedAt": { "type": "date" },
                "createdBy": keyword_text(),
                "decomissionedBy": keyword_text(),
            }
        }
    })
}

/// Create both catalogue collections, used once at startup.
pub async fn ensure_collections(
    store: &dyn DocumentStore,
    ctx: &RequestContext,
    collections: &Collections,
) -> GatewayResult<()> {
    store
        .ensure_collection(ctx, &collections.entries, &entries_mapping())
        .await?;
    store
        .ensure_collection(ctx, &collections.versions, &versions_mapping())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_fields_have_keyword_variants() {
        let entries = entries_mapping();
        assert_eq!(
            entries["mappings"]["properties"]["serviceId"]["fields"]["keyword"]["type"],
            "keyword"
        );

        let versions = versions_mapping();
        for field in ["parentId", "versionId"] {
            assert_eq!(
                versions["mappings"]["properties"][field]["fields"]["keyword"]["type"],
                "keyword"
            );
        }
        assert_eq!(versions["mappings"]["properties"]["decomissionedAt"]["type"], "date");
    }

    #[test]
    fn test_cancelled_converts_from_interrupted() {
        let err: GatewayError = Interrupted::DeadlineExceeded.into();
        assert_eq!(err, GatewayError::Cancelled(Interrupted::DeadlineExceeded));
        assert_eq!(err.to_string(), "request deadline exceeded");
    }
}
