//! Backend-agnostic search query algebra.
//!
//! Queries are plain values; `to_json` compiles them into the document backend's native
//! query DSL. Compilation never fails: every value that can be constructed is a valid query.

use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Suffix addressing the untokenized variant of a text field.
pub const KEYWORD_SUFFIX: &str = ".keyword";

/// Exact-match variant of `field`, e.g. `serviceId` -> `serviceId.keyword`.
pub fn keyword(field: &str) -> String {
    format!("{field}{KEYWORD_SUFFIX}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fuzziness {
    /// Edit distance picked from the term length
    Auto,
    Edits(u8),
}

impl Fuzziness {
    fn to_json(self) -> Value {
        match self {
            Fuzziness::Auto => Value::from("AUTO"),
            Fuzziness::Edits(n) => Value::from(n),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Match {
        field: String,
        value: String,
    },
    MultiMatch {
        fields: Vec<String>,
        query: String,
        fuzziness: Fuzziness,
    },
    Term {
        field: String,
        value: Value,
    },
    /// Inclusive on both ends; a missing bound is open.
    Range {
        field: String,
        gte: Option<Value>,
        lte: Option<Value>,
    },
    Bool(BoolQuery),
    FunctionScore {
        query: Box<Query>,
        functions: Vec<WeightedFilter>,
    },
    Script {
        source: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoolQuery {
    pub must: Vec<Query>,
    pub should: Vec<Query>,
    pub must_not: Vec<Query>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightedFilter {
    pub filter: Query,
    pub weight: f64,
}

#[cfg_attr(not(test), allow(dead_code))]
pub fn match_query(field: impl Into<String>, value: impl Into<String>) -> Query {
    Query::Match {
        field: field.into(),
        value: value.into(),
    }
}

pub fn term_query(field: impl Into<String>, value: impl Into<Value>) -> Query {
    Query::Term {
        field: field.into(),
        value: value.into(),
    }
}

/// Multi-field match tolerant of small spelling differences.
pub fn fuzzy_query<S: AsRef<str>>(fields: &[S], text: impl Into<String>) -> Query {
    Query::MultiMatch {
        fields: fields.iter().map(|f| f.as_ref().to_string()).collect(),
        query: text.into(),
        fuzziness: Fuzziness::Auto,
    }
}

pub fn range_query<T: Into<Value>>(field: impl Into<String>, gte: Option<T>, lte: Option<T>) -> Query {
    Query::Range {
        field: field.into(),
        gte: gte.map(Into::into),
        lte: lte.map(Into::into),
    }
}

#[cfg_attr(not(test), allow(dead_code))]
pub fn bool_query(must: Vec<Query>, should: Vec<Query>, must_not: Vec<Query>) -> Query {
    Query::Bool(BoolQuery {
        must,
        should,
        must_not,
    })
}

#[cfg_attr(not(test), allow(dead_code))]
pub fn function_score_query(query: Query, functions: Vec<WeightedFilter>) -> Query {
    Query::FunctionScore {
        query: Box::new(query),
        functions,
    }
}

#[cfg_attr(not(test), allow(dead_code))]
pub fn script_query(source: impl Into<String>) -> Query {
    Query::Script {
        source: source.into(),
    }
}

impl Query {
    pub fn to_json(&self) -> Value {
        match self {
            Query::Match { field, value } => json!({ "match": { field: { "query": value } } }),
            Query::MultiMatch {
                fields,
                query,
                fuzziness,
            } => json!({
                "multi_match": {
                    "query": query,
                    "fields": fields,
                    "fuzziness": fuzziness.to_json(),
                }
            }),
            Query::Term { field, value } => json!({ "term": { field: { "value": value } } }),
            Query::Range { field, gte, lte } => {
                let mut bounds = Map::new();
                if let Some(gte) = gte {
                    bounds.insert("gte".to_string(), gte.clone());
                }
                if let Some(lte) = lte {
                    bounds.insert("lte".to_string(), lte.clone());
                }
                json!({ "range": { field: bounds } })
            }
            Query::Bool(b) => {
                let mut clauses = Map::new();
                for (key, queries) in [("must", &b.must), ("should", &b.should), ("must_not", &b.must_not)] {
                    if !queries.is_empty() {
                        let compiled: Vec<Value> = queries.iter().map(Query::to_json).collect();
                        clauses.insert(key.to_string(), Value::Array(compiled));
                    }
                }
                json!({ "bool": clauses })
            }
            Query::FunctionScore { query, functions } => {
                let functions: Vec<Value> = functions
                    .iter()
                    .map(|f| json!({ "filter": f.filter.to_json(), "weight": f.weight }))
                    .collect();
                json!({ "function_score": { "query": query.to_json(), "functions": functions } })
            }
            Query::Script { source } => json!({ "script": { "script": { "source": source } } }),
        }
    }
}

impl Serialize for Query {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortField {
    pub field: String,
    pub order: SortOrder,
}

impl SortField {
    pub fn new(field: impl Into<String>, order: SortOrder) -> Self {
        Self {
            field: field.into(),
            order,
        }
    }
}

impl Serialize for SortField {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        json!({ &self.field: { "order": self.order } }).serialize(serializer)
    }
}

/// A query paired with ordering and pagination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchRequest {
    pub query: Query,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
}

impl SearchRequest {
    pub fn new(query: Query) -> Self {
        Self {
            query,
            sort: Vec::new(),
            from: None,
            size: None,
        }
    }

    #[must_use]
    pub fn sort(mut self, sort: Vec<SortField>) -> Self {
        self.sort = sort;
        self
    }

    #[must_use]
    pub fn page(mut self, from: u32, size: u32) -> Self {
        self.from = Some(from);
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_query_targets_keyword_field() {
        let q = term_query(keyword("serviceId"), "abc");
        assert_eq!(
            q.to_json(),
            json!({ "term": { "serviceId.keyword": { "value": "abc" } } })
        );
    }

    #[test]
    fn test_fuzzy_query_is_multi_match_auto() {
        let q = fuzzy_query(&["name", "description"], "paymnts");
        assert_eq!(
            q.to_json(),
            json!({
                "multi_match": {
                    "query": "paymnts",
                    "fields": ["name", "description"],
                    "fuzziness": "AUTO"
                }
            })
        );
    }

    #[test]
    fn test_range_query_omits_open_bounds() {
        let q = range_query("updatedAt", Some("2024-01-01T00:00:00Z"), None);
        assert_eq!(
            q.to_json(),
            json!({ "range": { "updatedAt": { "gte": "2024-01-01T00:00:00Z" } } })
        );
    }

    #[test]
    fn test_bool_query_skips_empty_clauses() {
        let q = bool_query(
            vec![match_query("name", "payments")],
            vec![],
            vec![term_query("version", 1)],
        );
        assert_eq!(
            q.to_json(),
            json!({
                "bool": {
                    "must": [{ "match": { "name": { "query": "payments" } } }],
                    "must_not": [{ "term": { "version": { "value": 1 } } }]
                }
            })
        );
    }

    #[test]
    fn test_function_score_and_script() {
        let q = function_score_query(
            match_query("name", "api"),
            vec![WeightedFilter {
                filter: term_query("createdBy", "alice"),
                weight: 2.0,
            }],
        );
        let json = q.to_json();
        assert_eq!(json["function_score"]["functions"][0]["weight"], 2.0);
        assert_eq!(
            json["function_score"]["functions"][0]["filter"],
            json!({ "term": { "createdBy": { "value": "alice" } } })
        );

        let s = script_query("doc['version'].value > 1");
        assert_eq!(
            s.to_json()["script"]["script"]["source"],
            "doc['version'].value > 1"
        );
    }

    #[test]
    fn test_search_request_body() {
        let req = SearchRequest::new(term_query("parentId.keyword", "svc"))
            .sort(vec![SortField::new("updatedAt", SortOrder::Desc)])
            .page(0, 10);

        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body["sort"], json!([{ "updatedAt": { "order": "desc" } }]));
        assert_eq!(body["from"], 0);
        assert_eq!(body["size"], 10);
        assert_eq!(body["query"]["term"]["parentId.keyword"]["value"], "svc");
    }

    #[test]
    fn test_search_request_without_paging_omits_fields() {
        let body = serde_json::to_value(SearchRequest::new(match_query("name", "x"))).unwrap();
        assert!(body.get("from").is_none());
        assert!(body.get("size").is_none());
        assert!(body.get("sort").is_none());
    }
}
