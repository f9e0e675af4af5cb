//! Input validation for list, search, create, update and delete requests.
//!
//! Every function here is pure: it takes raw caller input (plus the current time where a
//! default depends on it) and returns typed parameters or the full list of field errors.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use catalogue_shared::types::{CreateEntryRequest, UpdateEntryRequest};
use crate::error::{CatalogueError, CatalogueResult, FieldError};
use crate::query::{SortField, SortOrder};

pub const MAX_FROM: u32 = 1000;
pub const MIN_SIZE: u32 = 10;
pub const MAX_SIZE: u32 = 50;
pub const NAME_LEN: (usize, usize) = (4, 20);
pub const DESCRIPTION_LEN: (usize, usize) = (20, 200);
pub const DEFAULT_WINDOW_DAYS: i64 = 30;

/// Entry fields a list may be sorted on
pub const SORTABLE_FIELDS: [&str; 4] = ["name", "version", "createdAt", "updatedAt"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeStampField {
    CreatedAt,
    UpdatedAt,
}

impl TimeStampField {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeStampField::CreatedAt => "createdAt",
            TimeStampField::UpdatedAt => "updatedAt",
        }
    }
}

/// Inclusive time bounds, `after` is strictly before `before`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub after: DateTime<Utc>,
    pub before: DateTime<Utc>,
}

/// Raw list query string
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub from: Option<String>,
    pub size: Option<String>,
    pub sort: Option<String>,
    pub time_stamp_field: Option<String>,
    pub after: Option<String>,
    pub before: Option<String>,
}

/// Raw search query string
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchQuery {
    pub search: Option<String>,
    pub from: Option<String>,
    pub size: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListParameters {
    pub from: u32,
    pub size: u32,
    pub sort: Vec<SortField>,
    pub time_stamp_field: TimeStampField,
    pub time_window: TimeWindow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParameters {
    pub search: String,
    pub from: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub name: String,
    pub description: String,
    pub created_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryUpdate {
    pub service_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub updated_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRemoval {
    pub service_id: String,
    pub deleted_by: String,
}

fn finish<T>(errors: Vec<FieldError>, value: impl FnOnce() -> T) -> CatalogueResult<T> {
    if errors.is_empty() {
        Ok(value())
    } else {
        Err(CatalogueError::Validation(errors))
    }
}

fn parse_bounded(
    raw: Option<&str>,
    field: &str,
    default: u32,
    (min, max): (u32, u32),
    errors: &mut Vec<FieldError>,
) -> u32 {
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse::<i64>() {
        Ok(n) if n >= i64::from(min) && n <= i64::from(max) => n as u32,
        Ok(_) => {
            errors.push(FieldError::new(field, format!("must be between {min} and {max}")));
            default
        }
        Err(_) => {
            errors.push(FieldError::new(field, "must be an integer"));
            default
        }
    }
}

fn parse_time(raw: &str, field: &str, errors: &mut Vec<FieldError>) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw.trim()) {
        Ok(t) => Some(t.with_timezone(&Utc)),
        Err(_) => {
            errors.push(FieldError::new(field, "must be an RFC 3339 timestamp"));
            None
        }
    }
}

/// Parse `field[:asc|desc]` pairs separated by commas.
fn parse_sort(raw: &str, errors: &mut Vec<FieldError>) -> Vec<SortField> {
    let mut sort = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (field, order) = part.split_once(':').unwrap_or((part, "asc"));
        let order = match order.trim().to_ascii_lowercase().as_str() {
            "asc" => SortOrder::Asc,
            "desc" => SortOrder::Desc,
            other => {
                errors.push(FieldError::new("sort", format!("unknown direction '{other}'")));
                continue;
            }
        };
        let field = field.trim();
        if !SORTABLE_FIELDS.contains(&field) {
            errors.push(FieldError::new("sort", format!("cannot sort on '{field}'")));
            continue;
        }
        sort.push(SortField::new(field, order));
    }
    sort
}

fn check_len(value: &str, field: &str, (min, max): (usize, usize), errors: &mut Vec<FieldError>) {
    let len = value.chars().count();
    if len < min || len > max {
        errors.push(FieldError::new(
            field,
            format!("length must be between {min} and {max} characters"),
        ));
    }
}

/// First non-empty identity, from the body or else the caller's context.
fn identity(from_body: Option<String>, caller: Option<&str>) -> Option<String> {
    from_body
        .filter(|s| !s.trim().is_empty())
        .or_else(|| caller.map(str::to_string))
        .filter(|s| !s.trim().is_empty())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

pub fn validate_list(raw: &ListQuery, now: DateTime<Utc>) -> CatalogueResult<ListParameters> {
    let mut errors = Vec::new();

    let from = parse_bounded(raw.from.as_deref(), "from", 0, (0, MAX_FROM), &mut errors);
    let size = parse_bounded(raw.size.as_deref(), "size", MIN_SIZE, (MIN_SIZE, MAX_SIZE), &mut errors);

    let time_stamp_field = match raw.time_stamp_field.as_deref().map(str::trim) {
        None | Some("") | Some("updatedAt") => TimeStampField::UpdatedAt,
        Some("createdAt") => TimeStampField::CreatedAt,
        Some(_) => {
            errors.push(FieldError::new("timeStampField", "must be createdAt or updatedAt"));
            TimeStampField::UpdatedAt
        }
    };

    let sort = match raw.sort.as_deref() {
        Some(s) if !s.trim().is_empty() => parse_sort(s, &mut errors),
        _ => vec![SortField::new("updatedAt", SortOrder::Desc)],
    };

    let after = match raw.after.as_deref() {
        Some(s) => parse_time(s, "after", &mut errors),
        None => Some(now - Duration::days(DEFAULT_WINDOW_DAYS)),
    };
    let before = match raw.before.as_deref() {
        Some(s) => parse_time(s, "before", &mut errors),
        None => Some(now),
    };
    let time_window = match (after, before) {
        (Some(after), Some(before)) if after < before => Some(TimeWindow { after, before }),
        (Some(_), Some(_)) => {
            errors.push(FieldError::new("after", "must be strictly before 'before'"));
            None
        }
        _ => None,
    };

    finish(errors, || ListParameters {
        from,
        size,
        sort,
        time_stamp_field,
        // Only reached when both bounds parsed and are ordered
        time_window: time_window.unwrap_or(TimeWindow { after: now, before: now }),
    })
}

pub fn validate_search(raw: &SearchQuery) -> CatalogueResult<SearchParameters> {
    let mut errors = Vec::new();

    let from = parse_bounded(raw.from.as_deref(), "from", 0, (0, MAX_FROM), &mut errors);
    let size = parse_bounded(raw.size.as_deref(), "size", MIN_SIZE, (MIN_SIZE, MAX_SIZE), &mut errors);
    let search = raw.search.as_deref().map(str::trim).unwrap_or_default();
    if search.is_empty() {
        errors.push(FieldError::new("search", "is required"));
    }

    finish(errors, || SearchParameters {
        search: search.to_string(),
        from,
        size,
    })
}

pub fn validate_create(req: CreateEntryRequest, caller: Option<&str>) -> CatalogueResult<NewEntry> {
    let mut errors = Vec::new();

    check_len(&req.name, "name", NAME_LEN, &mut errors);
    check_len(&req.description, "description", DESCRIPTION_LEN, &mut errors);
    let created_by = identity(req.created_by, caller);
    if created_by.is_none() {
        errors.push(FieldError::new("createdBy", "is required"));
    }

    finish(errors, || NewEntry {
        name: req.name,
        description: req.description,
        created_by: created_by.unwrap_or_default(),
    })
}

pub fn validate_update(
    service_id: &str,
    req: UpdateEntryRequest,
    caller: Option<&str>,
) -> CatalogueResult<EntryUpdate> {
    let mut errors = Vec::new();

    if service_id.trim().is_empty() {
        errors.push(FieldError::new("serviceId", "is required"));
    }
    let name = non_empty(req.name);
    let description = non_empty(req.description);
    if name.is_none() && description.is_none() {
        errors.push(FieldError::new("name", "name or description is required"));
    }
    if let Some(name) = &name {
        check_len(name, "name", NAME_LEN, &mut errors);
    }
    if let Some(description) = &description {
        check_len(description, "description", DESCRIPTION_LEN, &mut errors);
    }
    let updated_by = identity(req.updated_by, caller);
    if updated_by.is_none() {
        errors.push(FieldError::new("updatedBy", "is required"));
    }

    finish(errors, || EntryUpdate {
        service_id: service_id.to_string(),
        name,
        description,
        updated_by: updated_by.unwrap_or_default(),
    })
}

pub fn validate_delete(service_id: &str, caller: Option<&str>) -> CatalogueResult<EntryRemoval> {
    let mut errors = Vec::new();

    if service_id.trim().is_empty() {
        errors.push(FieldError::new("serviceId", "is required"));
    }
    let deleted_by = identity(None, caller);
    if deleted_by.is_none() {
        errors.push(FieldError::new("deletedBy", "is required"));
    }

    finish(errors, || EntryRemoval {
        service_id: service_id.to_string(),
        deleted_by: deleted_by.unwrap_or_default(),
    })
}
