use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::thread;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};

use crate::context::RequestContext;
use crate::query::{Fuzziness, Query, SearchRequest, SortOrder, KEYWORD_SUFFIX};
use super::{log_outcome, DocumentStore, GatewayError, GatewayResult, RawHit};

/// Page size the backend applies when a search does not ask for one
const DEFAULT_SIZE: u32 = 10;

/// Commands sent to the store thread
enum StoreCommand {
    Search {
        collection: String,
        request: SearchRequest,
        reply: oneshot::Sender<GatewayResult<Vec<RawHit>>>,
    },
    Create {
        collection: String,
        document: Value,
        reply: oneshot::Sender<GatewayResult<String>>,
    },
    Update {
        collection: String,
        document_id: String,
        patch: Value,
        reply: oneshot::Sender<GatewayResult<()>>,
    },
    Delete {
        collection: String,
        document_id: String,
        reply: oneshot::Sender<GatewayResult<()>>,
    },
    EnsureCollection {
        collection: String,
        reply: oneshot::Sender<GatewayResult<()>>,
    },
    #[cfg(test)]
    FailWrites {
        collection: String,
        fail: bool,
    },
    Shutdown,
}

/// In-process document store evaluating the same compiled queries the search backend does.
#[derive(Clone)]
pub struct MemoryGateway {
    tx: mpsc::Sender<StoreCommand>,
}

#[derive(Default)]
struct Documents {
    /// Documents per collection, in insertion order
    collections: HashMap<String, Vec<(String, Value)>>,
    failing_writes: HashSet<String>,
}

impl MemoryGateway {
    /// Spawn the store thread
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreCommand>(256);

        thread::spawn(move || {
            let mut docs = Documents::default();
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    StoreCommand::Search { collection, request, reply } => {
                        let _ = reply.send(docs.search(&collection, &request));
                    }
                    StoreCommand::Create { collection, document, reply } => {
                        let _ = reply.send(docs.create(&collection, document));
                    }
                    StoreCommand::Update { collection, document_id, patch, reply } => {
                        let _ = reply.send(docs.update(&collection, &document_id, patch));
                    }
                    StoreCommand::Delete { collection, document_id, reply } => {
                        let _ = reply.send(docs.delete(&collection, &document_id));
                    }
                    StoreCommand::EnsureCollection { collection, reply } => {
                        docs.collections.entry(collection).or_default();
                        let _ = reply.send(Ok(()));
                    }
                    #[cfg(test)]
                    StoreCommand::FailWrites { collection, fail } => {
                        if fail {
                            docs.failing_writes.insert(collection);
                        } else {
                            docs.failing_writes.remove(&collection);
                        }
                    }
                    StoreCommand::Shutdown => {
                        tracing::info!("Memory store thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    async fn call<T>(
        &self,
        ctx: &RequestContext,
        make: impl FnOnce(oneshot::Sender<GatewayResult<T>>) -> StoreCommand,
    ) -> GatewayResult<T> {
        let (reply, rx) = oneshot::channel();
        let cmd = make(reply);
        ctx.run(async move {
            self.tx.send(cmd).await.map_err(|_| stopped())?;
            rx.await.map_err(|_| stopped())?
        })
        .await?
    }

    /// Make every write to `collection` fail until switched off again
    #[cfg(test)]
    pub async fn fail_writes(&self, collection: &str, fail: bool) {
        let _ = self
            .tx
            .send(StoreCommand::FailWrites {
                collection: collection.to_string(),
                fail,
            })
            .await;
    }

    /// Stop the store thread
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.tx.send(StoreCommand::Shutdown).await?;
        Ok(())
    }
}

fn stopped() -> GatewayError {
    GatewayError::Unavailable {
        status: None,
        message: "memory store is not running".to_string(),
    }
}

#[async_trait]
impl DocumentStore for MemoryGateway {
    async fn search(
        &self,
        ctx: &RequestContext,
        collection: &str,
        request: &SearchRequest,
    ) -> GatewayResult<Vec<RawHit>> {
        let result = self
            .call(ctx, |reply| StoreCommand::Search {
                collection: collection.to_string(),
                request: request.clone(),
                reply,
            })
            .await;
        log_outcome(ctx, "search", collection, &result);
        result
    }

    async fn create_document(
        &self,
        ctx: &RequestContext,
        collection: &str,
        document: Value,
    ) -> GatewayResult<String> {
        let result = self
            .call(ctx, |reply| StoreCommand::Create {
                collection: collection.to_string(),
                document,
                reply,
            })
            .await;
        log_outcome(ctx, "create_document", collection, &result);
        result
    }

    async fn partial_update_document(
        &self,
        ctx: &RequestContext,
        collection: &str,
        document_id: &str,
        patch: Value,
    ) -> GatewayResult<()> {
        let result = self
            .call(ctx, |reply| StoreCommand::Update {
                collection: collection.to_string(),
                document_id: document_id.to_string(),
                patch,
                reply,
            })
            .await;
        log_outcome(ctx, "partial_update_document", collection, &result);
        result
    }

    async fn delete_document(
        &self,
        ctx: &RequestContext,
        collection: &str,
        document_id: &str,
    ) -> GatewayResult<()> {
        let result = self
            .call(ctx, |reply| StoreCommand::Delete {
                collection: collection.to_string(),
                document_id: document_id.to_string(),
                reply,
            })
            .await;
        log_outcome(ctx, "delete_document", collection, &result);
        result
    }

    async fn ensure_collection(
        &self,
        ctx: &RequestContext,
        collection: &str,
        _mapping: &Value,
    ) -> GatewayResult<()> {
        let result = self
            .call(ctx, |reply| StoreCommand::EnsureCollection {
                collection: collection.to_string(),
                reply,
            })
            .await;
        log_outcome(ctx, "ensure_collection", collection, &result);
        result
    }
}

impl Documents {
    fn check_writable(&self, collection: &str) -> GatewayResult<()> {
        if self.failing_writes.contains(collection) {
            return Err(GatewayError::Write {
                status: 500,
                message: format!("writes to {collection} are failing"),
            });
        }
        Ok(())
    }

    fn not_found(collection: &str, document_id: &str) -> GatewayError {
        GatewayError::DocumentNotFound {
            collection: collection.to_string(),
            document_id: document_id.to_string(),
        }
    }

    fn search(&self, collection: &str, request: &SearchRequest) -> GatewayResult<Vec<RawHit>> {
        let Some(docs) = self.collections.get(collection) else {
            return Err(GatewayError::Query {
                status: 404,
                message: format!("no such index [{collection}]"),
            });
        };

        let mut scored = Vec::new();
        for (id, source) in docs {
            if let Some(relevance) = score(&request.query, source)? {
                scored.push((relevance, id, source));
            }
        }

        if request.sort.is_empty() {
            // Stable, so equal scores keep insertion order
            scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
        } else {
            scored.sort_by(|a, b| {
                for sort in &request.sort {
                    let ord = compare_fields(lookup(a.2, &sort.field), lookup(b.2, &sort.field));
                    let ord = match sort.order {
                        SortOrder::Asc => ord,
                        SortOrder::Desc => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        let from = request.from.unwrap_or(0) as usize;
        let size = request.size.unwrap_or(DEFAULT_SIZE) as usize;
        Ok(scored
            .into_iter()
            .skip(from)
            .take(size)
            .map(|(_, id, source)| RawHit {
                document_id: id.clone(),
                source: source.clone(),
            })
            .collect())
    }

    fn create(&mut self, collection: &str, document: Value) -> GatewayResult<String> {
        self.check_writable(collection)?;
        if !document.is_object() {
            return Err(GatewayError::Write {
                status: 400,
                message: "document must be a JSON object".to_string(),
            });
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.collections
            .entry(collection.to_string())
            .or_default()
            .push((id.clone(), document));
        Ok(id)
    }

    fn update(&mut self, collection: &str, document_id: &str, patch: Value) -> GatewayResult<()> {
        self.check_writable(collection)?;
        let Value::Object(patch) = patch else {
            return Err(GatewayError::Write {
                status: 400,
                message: "partial update must be a JSON object".to_string(),
            });
        };
        let doc = self
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|(id, _)| id == document_id))
            .ok_or_else(|| Self::not_found(collection, document_id))?;

        if let Value::Object(target) = &mut doc.1 {
            merge(target, patch);
        }
        Ok(())
    }

    fn delete(&mut self, collection: &str, document_id: &str) -> GatewayResult<()> {
        self.check_writable(collection)?;
        let docs = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| Self::not_found(collection, document_id))?;
        let idx = docs
            .iter()
            .position(|(id, _)| id == document_id)
            .ok_or_else(|| Self::not_found(collection, document_id))?;
        docs.remove(idx);
        Ok(())
    }
}

/// Deep merge, objects are merged key by key and everything else is replaced.
fn merge(target: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(inner)) => merge(existing, inner),
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

/// Resolve a field path, ignoring the keyword suffix used for exact matches.
fn lookup<'a>(doc: &'a Value, field: &str) -> Option<&'a Value> {
    let field = field.strip_suffix(KEYWORD_SUFFIX).unwrap_or(field);
    field.split('.').try_fold(doc, |v, part| v.get(part))
}

fn as_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => match (as_timestamp(a), as_timestamp(b)) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => Some(x.cmp(y)),
        },
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Sort comparator, missing values go last.
fn compare_fields(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn field_tokens(doc: &Value, field: &str) -> Vec<String> {
    match lookup(doc, field) {
        Some(Value::String(s)) => tokens(s),
        Some(other) => tokens(&other.to_string()),
        None => Vec::new(),
    }
}

fn allowed_edits(term: &str, fuzziness: Fuzziness) -> usize {
    match fuzziness {
        Fuzziness::Edits(n) => n as usize,
        Fuzziness::Auto => match term.chars().count() {
            0..=2 => 0,
            3..=5 => 1,
            _ => 2,
        },
    }
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut cur = vec![i + 1; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        prev = cur;
    }
    prev[b.len()]
}

/// Number of query terms found in `doc_tokens` within the allowed edit distance.
fn matched_terms(query: &str, doc_tokens: &[String], fuzziness: Fuzziness) -> usize {
    tokens(query)
        .iter()
        .filter(|term| {
            let edits = allowed_edits(term, fuzziness);
            doc_tokens.iter().any(|t| levenshtein(term, t) <= edits)
        })
        .count()
}

/// Relevance of `doc` for `query`, `None` when it does not match.
fn score(query: &Query, doc: &Value) -> GatewayResult<Option<f64>> {
    let hit = |matched: bool| if matched { Some(1.0) } else { None };

    Ok(match query {
        Query::Match { field, value } => {
            let n = matched_terms(value, &field_tokens(doc, field), Fuzziness::Edits(0));
            (n > 0).then_some(n as f64)
        }
        Query::MultiMatch {
            fields,
            query,
            fuzziness,
        } => {
            let best = fields
                .iter()
                .map(|f| matched_terms(query, &field_tokens(doc, f), *fuzziness))
                .max()
                .unwrap_or(0);
            (best > 0).then_some(best as f64)
        }
        Query::Term { field, value } => hit(lookup(doc, field) == Some(value)),
        Query::Range { field, gte, lte } => {
            let in_range = lookup(doc, field).is_some_and(|v| {
                let above = gte.as_ref().map_or(true, |g| {
                    matches!(compare_values(v, g), Some(Ordering::Greater | Ordering::Equal))
                });
                let below = lte.as_ref().map_or(true, |l| {
                    matches!(compare_values(v, l), Some(Ordering::Less | Ordering::Equal))
                });
                above && below
            });
            hit(in_range)
        }
        Query::Bool(b) => {
            let mut total = 0.0;
            for q in &b.must {
                match score(q, doc)? {
                    Some(s) => total += s,
                    None => return Ok(None),
                }
            }
            for q in &b.must_not {
                if score(q, doc)?.is_some() {
                    return Ok(None);
                }
            }
            let mut any_should = false;
            for q in &b.should {
                if let Some(s) = score(q, doc)? {
                    any_should = true;
                    total += s;
                }
            }
            if b.must.is_empty() && !b.should.is_empty() && !any_should {
                return Ok(None);
            }
            Some(total.max(1.0))
        }
        Query::FunctionScore { query, functions } => match score(query, doc)? {
            Some(base) => {
                let mut weight = 1.0;
                for f in functions {
                    if score(&f.filter, doc)?.is_some() {
                        weight *= f.weight;
                    }
                }
                Some(base * weight)
            }
            None => None,
        },
        Query::Script { .. } => {
            return Err(GatewayError::Query {
                status: 400,
                message: "script queries are not supported by the memory backend".to_string(),
            })
        }
    })
}
