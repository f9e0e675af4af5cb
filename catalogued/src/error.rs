//! Error taxonomy surfaced by the catalogue store.

use serde::Serialize;
use thiserror::Error;

use crate::context::Interrupted;
use crate::gateway::GatewayError;

/// One rejected input field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Coarse classification the HTTP layer maps to status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    BackendUnavailable,
    BackendQuery,
    BackendWrite,
    DataIntegrityAnomaly,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CatalogueError {
    #[error("invalid request: {}", summarize(.0))]
    Validation(Vec<FieldError>),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("backend unavailable: {message}")]
    BackendUnavailable { status: Option<u16>, message: String },

    #[error("backend rejected query ({status}): {message}")]
    BackendQuery { status: u16, message: String },

    #[error("backend rejected write ({status}): {message}")]
    BackendWrite { status: u16, message: String },

    #[error("data integrity anomaly: {0}")]
    DataIntegrityAnomaly(String),

    #[error(transparent)]
    Cancelled(#[from] Interrupted),
}

pub type CatalogueResult<T> = Result<T, CatalogueError>;

fn summarize(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(|f| format!("{}: {}", f.field, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl CatalogueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CatalogueError::Validation(_) => ErrorKind::Validation,
            CatalogueError::NotFound { .. } => ErrorKind::NotFound,
            CatalogueError::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            CatalogueError::BackendQuery { .. } => ErrorKind::BackendQuery,
            CatalogueError::BackendWrite { .. } => ErrorKind::BackendWrite,
            CatalogueError::DataIntegrityAnomaly(_) => ErrorKind::DataIntegrityAnomaly,
            CatalogueError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Field-level details, empty unless this is a validation error.
    pub fn fields(&self) -> &[FieldError] {
        match self {
            CatalogueError::Validation(fields) => fields,
            _ => &[],
        }
    }
}

impl From<GatewayError> for CatalogueError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Unavailable { status, message } => {
                CatalogueError::BackendUnavailable { status, message }
            }
            GatewayError::Query { status, message } => CatalogueError::BackendQuery { status, message },
            GatewayError::Write { status, message } => CatalogueError::BackendWrite { status, message },
            GatewayError::DocumentNotFound { document_id, .. } => CatalogueError::NotFound {
                entity: "document",
                id: document_id,
            },
            GatewayError::Cancelled(reason) => CatalogueError::Cancelled(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_lists_fields() {
        let err = CatalogueError::Validation(vec![
            FieldError::new("size", "must be between 10 and 50"),
            FieldError::new("name", "is required"),
        ]);
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.fields().len(), 2);
        assert_eq!(
            err.to_string(),
            "invalid request: size: must be between 10 and 50; name: is required"
        );
    }

    #[test]
    fn test_gateway_errors_keep_their_kind() {
        let cases = [
            (
                GatewayError::Unavailable { status: None, message: "refused".into() },
                ErrorKind::BackendUnavailable,
            ),
            (
                GatewayError::Query { status: 400, message: "bad".into() },
                ErrorKind::BackendQuery,
            ),
            (
                GatewayError::Write { status: 409, message: "conflict".into() },
                ErrorKind::BackendWrite,
            ),
            (
                GatewayError::DocumentNotFound { collection: "c".into(), document_id: "d".into() },
                ErrorKind::NotFound,
            ),
            (GatewayError::Cancelled(Interrupted::Cancelled), ErrorKind::Cancelled),
        ];

        for (gateway, kind) in cases {
            let err = CatalogueError::from(gateway);
            assert_eq!(err.kind(), kind);
            assert!(err.fields().is_empty());
        }
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(ErrorKind::DataIntegrityAnomaly).unwrap(),
            "data_integrity_anomaly"
        );
    }
}
