/// Collection holding the current state of every catalogue entry
pub const CATALOGUE_COLLECTION: &str = "servicecatalogue";

/// Collection holding immutable snapshots of superseded entry states
pub const VERSIONS_COLLECTION: &str = "servicecatalogueversions";

/// Headers carrying request-scoped identity
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const USER_ID_HEADER: &str = "x-user-id";
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// API paths
pub const HEALTH_PATH: &str = "/health";
pub const CATALOGUE_PATH: &str = "/serviceCatalogue";
