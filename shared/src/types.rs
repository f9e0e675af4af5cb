use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current state of one cataloged service.
/// This is the canonical document stored in the catalogue collection and returned by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogueEntry {
    /// Generated at creation, never changes
    pub service_id: String,

    pub name: String,

    pub description: String,

    /// Starts at 1 and grows by exactly one on every update
    pub version: u64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    pub created_by: String,

    pub updated_by: String,
}

/// Immutable snapshot of an entry taken right before it was updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogueVersion {
    /// `service_id` of the entry this snapshot belongs to
    pub parent_id: String,

    pub version_id: String,

    pub name: String,

    pub description: String,

    pub version: u64,

    /// When the snapshotted state became current (the entry's previous `updated_at`)
    pub created_at: DateTime<Utc>,

    /// When the snapshotted state was superseded
    pub decomissioned_at: DateTime<Utc>,

    /// Author of the snapshotted state
    pub created_by: String,

    /// Caller whose update or delete superseded this state
    pub decomissioned_by: String,
}

/// Body of `POST /serviceCatalogue`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEntryRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created_by: Option<String>,
}

/// Body of `PATCH /serviceCatalogue/:serviceId`. Absent or empty fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEntryRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub updated_by: Option<String>,
}
