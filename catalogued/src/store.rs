//! Versioned catalogue store.
//!
//! Reads translate into backend searches. Every update or delete first writes an immutable
//! `CatalogueVersion` of the entry as it was, and only then touches the entry itself. The two
//! writes are independent: if the second fails the snapshot stays behind as an orphan and the
//! error is returned unchanged.

use std::sync::Arc;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use catalogue_shared::types::{CatalogueEntry, CatalogueVersion};
use crate::context::RequestContext;
use crate::error::{CatalogueError, CatalogueResult};
use crate::gateway::{Collections, DocumentStore, RawHit};
use crate::query::{fuzzy_query, keyword, range_query, term_query, SearchRequest, SortField};
use crate::validation::{EntryRemoval, EntryUpdate, ListParameters, NewEntry, SearchParameters};

const SERVICE_ID: &str = "serviceId";
const PARENT_ID: &str = "parentId";
const VERSION_ID: &str = "versionId";
const NAME: &str = "name";
const DESCRIPTION: &str = "description";

/// Upper bound on versions returned for one entry
const VERSIONS_LIMIT: u32 = 1000;

/// Enough hits to notice a duplicated id
const UNIQUE_LOOKUP_SIZE: u32 = 2;

#[derive(Clone)]
pub struct CatalogueStore {
    gateway: Arc<dyn DocumentStore>,
    collections: Collections,
}

/// An entry together with the backend id of the document holding it
struct Current {
    document_id: String,
    entry: CatalogueEntry,
}

impl CatalogueStore {
    pub fn new(gateway: Arc<dyn DocumentStore>, collections: Collections) -> Self {
        Self {
            gateway,
            collections,
        }
    }

    pub async fn fetch_by_id(&self, ctx: &RequestContext, service_id: &str) -> CatalogueResult<CatalogueEntry> {
        Ok(self.fetch_current(ctx, service_id).await?.entry)
    }

    pub async fn list_all(
        &self,
        ctx: &RequestContext,
        params: &ListParameters,
    ) -> CatalogueResult<Vec<CatalogueEntry>> {
        let window = params.time_window;
        let query = range_query(
            params.time_stamp_field.as_str(),
            Some(window.after.to_rfc3339()),
            Some(window.before.to_rfc3339()),
        );
        let sort = params
            .sort
            .iter()
            .map(|s| SortField::new(sort_target(&s.field), s.order))
            .collect();
        let request = SearchRequest::new(query)
            .sort(sort)
            .page(params.from, params.size);

        let hits = self.search(ctx, &self.collections.entries, &request).await?;
        Ok(decode_hits(ctx, &self.collections.entries, hits))
    }

    /// Relevance order is whatever the backend scores, nothing is re-ranked here.
    pub async fn fuzzy_search(
        &self,
        ctx: &RequestContext,
        params: &SearchParameters,
    ) -> CatalogueResult<Vec<CatalogueEntry>> {
        let request = SearchRequest::new(fuzzy_query(&[NAME, DESCRIPTION], params.search.as_str()))
            .page(params.from, params.size);

        let hits = self.search(ctx, &self.collections.entries, &request).await?;
        Ok(decode_hits(ctx, &self.collections.entries, hits))
    }

    /// All snapshots of one entry, in no particular order.
    pub async fn list_versions(
        &self,
        ctx: &RequestContext,
        parent_id: &str,
    ) -> CatalogueResult<Vec<CatalogueVersion>> {
        let request = SearchRequest::new(term_query(keyword(PARENT_ID), parent_id)).size(VERSIONS_LIMIT);

        let hits = self.search(ctx, &self.collections.versions, &request).await?;
        Ok(decode_hits(ctx, &self.collections.versions, hits))
    }

    pub async fn fetch_version_by_id(
        &self,
        ctx: &RequestContext,
        version_id: &str,
    ) -> CatalogueResult<CatalogueVersion> {
        let request = SearchRequest::new(term_query(keyword(VERSION_ID), version_id)).size(UNIQUE_LOOKUP_SIZE);

        let hits = self.search(ctx, &self.collections.versions, &request).await?;
        let (_, version) = self.first_hit(ctx, &self.collections.versions, "version", version_id, hits)?;
        Ok(version)
    }

    pub async fn create(&self, ctx: &RequestContext, new: NewEntry) -> CatalogueResult<CatalogueEntry> {
        let now = Utc::now();
        let entry = CatalogueEntry {
            service_id: uuid::Uuid::new_v4().to_string(),
            name: new.name,
            description: new.description,
            version: 1,
            created_at: now,
            updated_at: now,
            updated_by: new.created_by.clone(),
            created_by: new.created_by,
        };

        self.gateway
            .create_document(ctx, &self.collections.entries, to_document(&entry)?)
            .await?;

        tracing::info!(parent: ctx.logger(), service_id = %entry.service_id, "Catalogue entry created");
        Ok(entry)
    }

    /// Snapshot the current state, then merge the supplied fields and bump the version.
    pub async fn update(&self, ctx: &RequestContext, update: EntryUpdate) -> CatalogueResult<CatalogueEntry> {
        let Current { document_id, entry } = self.fetch_current(ctx, &update.service_id).await?;

        let snapshot = self.snapshot(ctx, &entry, &update.updated_by).await?;

        let mut updated = entry;
        let mut patch = Map::new();
        if let Some(name) = update.name {
            patch.insert(NAME.to_string(), Value::from(name.clone()));
            updated.name = name;
        }
        if let Some(description) = update.description {
            patch.insert(DESCRIPTION.to_string(), Value::from(description.clone()));
            updated.description = description;
        }
        updated.version += 1;
        updated.updated_at = Utc::now();
        updated.updated_by = update.updated_by;
        patch.insert("version".to_string(), Value::from(updated.version));
        patch.insert("updatedAt".to_string(), to_document(&updated.updated_at)?);
        patch.insert("updatedBy".to_string(), Value::from(updated.updated_by.clone()));

        if let Err(e) = self
            .gateway
            .partial_update_document(ctx, &self.collections.entries, &document_id, Value::Object(patch))
            .await
        {
            tracing::warn!(
                parent: ctx.logger(),
                service_id = %updated.service_id,
                version_id = %snapshot.version_id,
                error = %e,
                "Update failed after snapshot, version record left without a matching change"
            );
            return Err(e.into());
        }

        tracing::info!(
            parent: ctx.logger(),
            service_id = %updated.service_id,
            version = updated.version,
            "Catalogue entry updated"
        );
        Ok(updated)
    }

    /// Snapshot the final state, then remove the entry. Returns the snapshot.
    pub async fn delete(&self, ctx: &RequestContext, removal: EntryRemoval) -> CatalogueResult<CatalogueVersion> {
        let Current { document_id, entry } = self.fetch_current(ctx, &removal.service_id).await?;

        let snapshot = self.snapshot(ctx, &entry, &removal.deleted_by).await?;

        if let Err(e) = self
            .gateway
            .delete_document(ctx, &self.collections.entries, &document_id)
            .await
        {
            tracing::warn!(
                parent: ctx.logger(),
                service_id = %entry.service_id,
                version_id = %snapshot.version_id,
                error = %e,
                "Delete failed after snapshot, version record left without a matching change"
            );
            return Err(e.into());
        }

        tracing::info!(parent: ctx.logger(), service_id = %entry.service_id, "Catalogue entry deleted");
        Ok(snapshot)
    }

    /// Persist `entry` as it is now, superseded by `decomissioned_by`.
    async fn snapshot(
        &self,
        ctx: &RequestContext,
        entry: &CatalogueEntry,
        decomissioned_by: &str,
    ) -> CatalogueResult<CatalogueVersion> {
        let version = CatalogueVersion {
            parent_id: entry.service_id.clone(),
            version_id: uuid::Uuid::new_v4().to_string(),
            name: entry.name.clone(),
            description: entry.description.clone(),
            version: entry.version,
            created_at: entry.updated_at,
            decomissioned_at: Utc::now(),
            created_by: entry.updated_by.clone(),
            decomissioned_by: decomissioned_by.to_string(),
        };

        self.gateway
            .create_document(ctx, &self.collections.versions, to_document(&version)?)
            .await?;

        tracing::debug!(
            parent: ctx.logger(),
            service_id = %version.parent_id,
            version_id = %version.version_id,
            version = version.version,
            "Version snapshot created"
        );
        Ok(version)
    }

    async fn fetch_current(&self, ctx: &RequestContext, service_id: &str) -> CatalogueResult<Current> {
        let request = SearchRequest::new(term_query(keyword(SERVICE_ID), service_id)).size(UNIQUE_LOOKUP_SIZE);

        let hits = self.search(ctx, &self.collections.entries, &request).await?;
        let (document_id, entry) = self.first_hit(ctx, &self.collections.entries, "service", service_id, hits)?;
        Ok(Current { document_id, entry })
    }

    async fn search(
        &self,
        ctx: &RequestContext,
        collection: &str,
        request: &SearchRequest,
    ) -> CatalogueResult<Vec<RawHit>> {
        Ok(self.gateway.search(ctx, collection, request).await?)
    }

    /// Decode the single expected hit of a unique-id lookup.
    fn first_hit<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        collection: &str,
        entity: &'static str,
        id: &str,
        hits: Vec<RawHit>,
    ) -> CatalogueResult<(String, T)> {
        if hits.len() > 1 {
            tracing::warn!(
                parent: ctx.logger(),
                collection,
                id,
                hits = hits.len(),
                "Data integrity anomaly: id is not unique, using the first hit"
            );
        }
        let hit = hits.into_iter().next().ok_or_else(|| CatalogueError::NotFound {
            entity,
            id: id.to_string(),
        })?;

        match serde_json::from_value(hit.source) {
            Ok(value) => Ok((hit.document_id, value)),
            Err(e) => {
                tracing::warn!(
                    parent: ctx.logger(),
                    collection,
                    document_id = %hit.document_id,
                    error = %e,
                    "Data integrity anomaly: stored document does not decode"
                );
                Err(CatalogueError::DataIntegrityAnomaly(format!(
                    "{entity} {id} could not be decoded: {e}"
                )))
            }
        }
    }
}

/// Decode every hit, skipping (and logging) the ones that do not fit `T`.
fn decode_hits<T: DeserializeOwned>(ctx: &RequestContext, collection: &str, hits: Vec<RawHit>) -> Vec<T> {
    hits.into_iter()
        .filter_map(|hit| match serde_json::from_value(hit.source) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(
                    parent: ctx.logger(),
                    collection,
                    document_id = %hit.document_id,
                    error = %e,
                    "Data integrity anomaly: skipping undecodable hit"
                );
                None
            }
        })
        .collect()
}

fn to_document<T: Serialize>(value: &T) -> CatalogueResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| CatalogueError::DataIntegrityAnomaly(format!("failed to encode document: {e}")))
}

/// Text fields sort on their untokenized variant.
fn sort_target(field: &str) -> String {
    if field == NAME {
        keyword(field)
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use crate::context::Interrupted;
    use crate::error::ErrorKind;
    use crate::gateway::{ensure_collections, MemoryGateway};
    use crate::query::SortOrder;
    use crate::validation::{TimeStampField, TimeWindow};

    async fn setup() -> (CatalogueStore, MemoryGateway, RequestContext) {
        let gateway = MemoryGateway::spawn();
        let ctx = RequestContext::background("catalogue");
        let collections = Collections::default();
        ensure_collections(&gateway, &ctx, &collections).await.unwrap();
        let store = CatalogueStore::new(Arc::new(gateway.clone()), collections);
        (store, gateway, ctx)
    }

    fn new_entry(name: &str, description: &str, by: &str) -> NewEntry {
        NewEntry {
            name: name.to_string(),
            description: description.to_string(),
            created_by: by.to_string(),
        }
    }

    fn payments() -> NewEntry {
        new_entry("payments-api", "handles payment processing flows", "alice")
    }

    fn rename(service_id: &str, name: &str, by: &str) -> EntryUpdate {
        EntryUpdate {
            service_id: service_id.to_string(),
            name: Some(name.to_string()),
            description: None,
            updated_by: by.to_string(),
        }
    }

    fn list_params() -> ListParameters {
        let now = Utc::now();
        ListParameters {
            from: 0,
            size: 10,
            sort: vec![SortField::new("updatedAt", SortOrder::Desc)],
            time_stamp_field: TimeStampField::UpdatedAt,
            time_window: TimeWindow {
                after: now - Duration::hours(1),
                before: now + Duration::hours(1),
            },
        }
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_first_version() {
        let (store, _, ctx) = setup().await;
        let entry = store.create(&ctx, payments()).await.unwrap();

        assert!(!entry.service_id.is_empty());
        assert_eq!(entry.version, 1);
        assert_eq!(entry.created_at, entry.updated_at);
        assert_eq!(entry.created_by, "alice");
        assert_eq!(entry.updated_by, "alice");
    }

    #[tokio::test]
    async fn test_create_then_fetch_round_trips() {
        let (store, _, ctx) = setup().await;
        let created = store.create(&ctx, payments()).await.unwrap();

        let fetched = store.fetch_by_id(&ctx, &created.service_id).await.unwrap();
        assert_eq!(fetched, created);
        assert!(fetched.created_at <= fetched.updated_at);
    }

    #[tokio::test]
    async fn test_update_delete_scenario() {
        let (store, _, ctx) = setup().await;

        let created = store.create(&ctx, payments()).await.unwrap();
        assert_eq!(created.version, 1);

        let updated = store
            .update(&ctx, rename(&created.service_id, "payments-api-v2", "bob"))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.name, "payments-api-v2");
        assert_eq!(updated.description, created.description);

        let current = store.fetch_by_id(&ctx, &created.service_id).await.unwrap();
        assert_eq!(current, updated);
        assert_eq!(current.created_by, "alice");
        assert_eq!(current.updated_by, "bob");

        let versions = store.list_versions(&ctx, &created.service_id).await.unwrap();
        assert_eq!(versions.len(), 1);
        let first = &versions[0];
        assert_eq!(first.parent_id, created.service_id);
        assert_eq!(first.name, "payments-api");
        assert_eq!(first.description, created.description);
        assert_eq!(first.version, 1);
        assert_eq!(first.created_at, created.updated_at);
        assert_eq!(first.created_by, "alice");
        assert_eq!(first.decomissioned_by, "bob");

        let snapshot = store
            .delete(
                &ctx,
                EntryRemoval {
                    service_id: created.service_id.clone(),
                    deleted_by: "carol".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(snapshot.name, "payments-api-v2");
        assert_eq!(snapshot.version, 2);

        let err = store.fetch_by_id(&ctx, &created.service_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let versions = store.list_versions(&ctx, &created.service_id).await.unwrap();
        assert_eq!(versions.len(), 2);
        let last = versions
            .iter()
            .find(|v| v.decomissioned_by == "carol")
            .expect("delete snapshot");
        assert_eq!(last.name, "payments-api-v2");
        assert_eq!(last.created_by, "bob");

        let by_id = store.fetch_version_by_id(&ctx, &last.version_id).await.unwrap();
        assert_eq!(&by_id, last);
    }

    #[tokio::test]
    async fn test_snapshot_failure_leaves_entry_unchanged() {
        let (store, gateway, ctx) = setup().await;
        let created = store.create(&ctx, payments()).await.unwrap();
        let before = store.fetch_by_id(&ctx, &created.service_id).await.unwrap();

        gateway.fail_writes(&store.collections.versions, true).await;

        let err = store
            .update(&ctx, rename(&created.service_id, "payments-api-v2", "bob"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendWrite);

        let err = store
            .delete(
                &ctx,
                EntryRemoval {
                    service_id: created.service_id.clone(),
                    deleted_by: "carol".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendWrite);

        let after = store.fetch_by_id(&ctx, &created.service_id).await.unwrap();
        assert_eq!(
            serde_json::to_vec(&before).unwrap(),
            serde_json::to_vec(&after).unwrap()
        );
        assert!(store.list_versions(&ctx, &created.service_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mutation_failure_leaves_orphan_version() {
        let (store, gateway, ctx) = setup().await;
        let created = store.create(&ctx, payments()).await.unwrap();

        gateway.fail_writes(&store.collections.entries, true).await;

        let err = store
            .update(&ctx, rename(&created.service_id, "payments-api-v2", "bob"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendWrite);

        let current = store.fetch_by_id(&ctx, &created.service_id).await.unwrap();
        assert_eq!(current, created);
        assert_eq!(store.list_versions(&ctx, &created.service_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_failure_leaves_orphan_version() {
        let (store, gateway, ctx) = setup().await;
        let created = store.create(&ctx, payments()).await.unwrap();

        gateway.fail_writes(&store.collections.entries, true).await;

        let err = store
            .delete(
                &ctx,
                EntryRemoval {
                    service_id: created.service_id.clone(),
                    deleted_by: "carol".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendWrite);

        let current = store.fetch_by_id(&ctx, &created.service_id).await.unwrap();
        assert_eq!(current, created);

        let versions = store.list_versions(&ctx, &created.service_id).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].decomissioned_by, "carol");
    }

    #[tokio::test]
    async fn test_update_missing_entry_writes_nothing() {
        let (store, _, ctx) = setup().await;
        let err = store
            .update(&ctx, rename("missing", "payments-api-v2", "bob"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CatalogueError::NotFound {
                entity: "service",
                id: "missing".to_string()
            }
        );
        assert!(store.list_versions(&ctx, "missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_description_only() {
        let (store, _, ctx) = setup().await;
        let created = store.create(&ctx, payments()).await.unwrap();

        let updated = store
            .update(
                &ctx,
                EntryUpdate {
                    service_id: created.service_id.clone(),
                    name: None,
                    description: Some("routes card payments to acquirers".to_string()),
                    updated_by: "bob".to_string(),
                },
            )
            .await
            .unwrap();

        let current = store.fetch_by_id(&ctx, &created.service_id).await.unwrap();
        assert_eq!(current.name, "payments-api");
        assert_eq!(current.description, "routes card payments to acquirers");
        assert_eq!(current.version, 2);
        assert_eq!(current, updated);
    }

    #[tokio::test]
    async fn test_list_all_sorts_pages_and_skips_bad_hits() {
        let (store, gateway, ctx) = setup().await;
        for name in ["alpha-api", "bravo-api", "charlie-api"] {
            store
                .create(&ctx, new_entry(name, "a service used for listing tests", "alice"))
                .await
                .unwrap();
        }
        gateway
            .create_document(
                &ctx,
                &store.collections.entries,
                json!({ "serviceId": "broken", "updatedAt": Utc::now().to_rfc3339() }),
            )
            .await
            .unwrap();

        let mut params = list_params();
        params.sort = vec![SortField::new("name", SortOrder::Asc)];
        let entries = store.list_all(&ctx, &params).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha-api", "bravo-api", "charlie-api"]);

        params.from = 2;
        let entries = store.list_all(&ctx, &params).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "charlie-api");

        let mut old = list_params();
        old.time_window = TimeWindow {
            after: Utc::now() - Duration::days(60),
            before: Utc::now() - Duration::days(30),
        };
        assert!(store.list_all(&ctx, &old).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fuzzy_search_matches_misspelling() {
        let (store, _, ctx) = setup().await;
        store.create(&ctx, payments()).await.unwrap();
        store
            .create(&ctx, new_entry("billing-api", "issues invoices to customers monthly", "alice"))
            .await
            .unwrap();

        let params = SearchParameters {
            search: "paymnt".to_string(),
            from: 0,
            size: 10,
        };
        let found = store.fuzzy_search(&ctx, &params).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "payments-api");
    }

    #[tokio::test]
    async fn test_duplicate_ids_use_first_hit() {
        let (store, gateway, ctx) = setup().await;
        let created = store.create(&ctx, payments()).await.unwrap();
        let mut copy = created.clone();
        copy.name = "shadow-copy".to_string();
        gateway
            .create_document(&ctx, &store.collections.entries, serde_json::to_value(&copy).unwrap())
            .await
            .unwrap();

        let fetched = store.fetch_by_id(&ctx, &created.service_id).await.unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_an_anomaly() {
        let (store, gateway, ctx) = setup().await;
        gateway
            .create_document(&ctx, &store.collections.entries, json!({ "serviceId": "broken" }))
            .await
            .unwrap();

        let err = store.fetch_by_id(&ctx, "broken").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataIntegrityAnomaly);
    }

    #[tokio::test]
    async fn test_missing_version_is_not_found() {
        let (store, _, ctx) = setup().await;
        let err = store.fetch_version_by_id(&ctx, "nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_cancelled_context_fails_fast() {
        let (store, _, ctx) = setup().await;
        let created = store.create(&ctx, payments()).await.unwrap();

        let cancelled = RequestContext::background("catalogue");
        cancelled.done().cancel();
        let err = store
            .update(&cancelled, rename(&created.service_id, "payments-api-v2", "bob"))
            .await
            .unwrap_err();
        assert_eq!(err, CatalogueError::Cancelled(Interrupted::Cancelled));

        let current = store.fetch_by_id(&ctx, &created.service_id).await.unwrap();
        assert_eq!(current.version, 1);
    }
}
