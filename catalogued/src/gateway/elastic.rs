use async_trait::async_trait;
use anyhow::{Context, Result};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};

use crate::config::BackendConfig;
use crate::context::RequestContext;
use crate::query::SearchRequest;
use super::{log_outcome, DocumentStore, GatewayError, GatewayResult, RawHit};

/// Writes wait for the next refresh so a read right after a write observes it.
const REFRESH: (&str, &str) = ("refresh", "wait_for");

/// Document store backed by the Elasticsearch REST API.
#[derive(Clone)]
pub struct ElasticGateway {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

/// Which kind of rejection a non-success status maps to.
#[derive(Clone, Copy)]
enum Operation {
    Read,
    Write,
}

impl ElasticGateway {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build search backend HTTP client")?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn request(&self, ctx: &RequestContext, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}/{}", self.base_url, path));

        if let Some(username) = &self.username {
            builder = builder.basic_auth(username, self.password.as_deref());
        }
        // Never outlive the caller's deadline
        if let Some(remaining) = ctx.remaining() {
            builder = builder.timeout(remaining);
        }
        builder
    }

    /// Partial update, the patch is wrapped as `{"doc": patch}`.
    fn update_request(
        &self,
        ctx: &RequestContext,
        collection: &str,
        document_id: &str,
        patch: &Value,
    ) -> RequestBuilder {
        self.request(ctx, Method::POST, &format!("{collection}/_update/{document_id}"))
            .query(&[REFRESH])
            .json(&json!({ "doc": patch }))
    }

    fn delete_request(&self, ctx: &RequestContext, collection: &str, document_id: &str) -> RequestBuilder {
        self.request(ctx, Method::DELETE, &format!("{collection}/_doc/{document_id}"))
            .query(&[REFRESH])
    }

    /// Send the request and read the JSON body, aborting if the context ends first.
    async fn execute(
        &self,
        ctx: &RequestContext,
        builder: RequestBuilder,
    ) -> GatewayResult<(StatusCode, Value)> {
        ctx.run(async move {
            let response = builder.send().await.map_err(transport_error)?;
            let status = response.status();
            let bytes = response.bytes().await.map_err(transport_error)?;
            let body = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                    Value::String(String::from_utf8_lossy(&bytes).into_owned())
                })
            };
            Ok::<_, GatewayError>((status, body))
        })
        .await?
    }
}

fn transport_error(e: reqwest::Error) -> GatewayError {
    GatewayError::Unavailable {
        status: e.status().map(|s| s.as_u16()),
        message: e.to_string(),
    }
}

/// Pull the most useful message out of an Elasticsearch error body.
fn error_message(status: StatusCode, body: &Value) -> String {
    body.pointer("/error/reason")
        .and_then(Value::as_str)
        .or_else(|| body.get("error").and_then(Value::as_str))
        .or_else(|| body.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| status.to_string())
}

fn error_type(body: &Value) -> Option<&str> {
    body.pointer("/error/type").and_then(Value::as_str)
}

fn reject(status: StatusCode, body: &Value, op: Operation) -> GatewayError {
    let message = error_message(status, body);
    if status.is_server_error() {
        return GatewayError::Unavailable {
            status: Some(status.as_u16()),
            message,
        };
    }
    match op {
        Operation::Read => GatewayError::Query {
            status: status.as_u16(),
            message,
        },
        Operation::Write => GatewayError::Write {
            status: status.as_u16(),
            message,
        },
    }
}

/// Outcome of a write addressed to one existing document.
fn write_outcome(status: StatusCode, body: &Value, collection: &str, document_id: &str) -> GatewayResult<()> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::NOT_FOUND {
        Err(GatewayError::DocumentNotFound {
            collection: collection.to_string(),
            document_id: document_id.to_string(),
        })
    } else {
        Err(reject(status, body, Operation::Write))
    }
}

fn parse_hits(status: StatusCode, body: &Value) -> GatewayResult<Vec<RawHit>> {
    let hits = body
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::Query {
            status: status.as_u16(),
            message: "search response has no hits.hits array".to_string(),
        })?;

    Ok(hits
        .iter()
        .map(|hit| RawHit {
            document_id: hit
                .get("_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            source: hit.get("_source").cloned().unwrap_or(Value::Null),
        })
        .collect())
}

#[async_trait]
impl DocumentStore for ElasticGateway {
    async fn search(
        &self,
        ctx: &RequestContext,
        collection: &str,
        request: &SearchRequest,
    ) -> GatewayResult<Vec<RawHit>> {
        let builder = self
            .request(ctx, Method::POST, &format!("{collection}/_search"))
            .json(request);

        let result = match self.execute(ctx, builder).await {
            Ok((status, body)) if status.is_success() => parse_hits(status, &body),
            Ok((status, body)) => Err(reject(status, &body, Operation::Read)),
            Err(e) => Err(e),
        };
        log_outcome(ctx, "search", collection, &result);
        result
    }

    async fn create_document(
        &self,
        ctx: &RequestContext,
        collection: &str,
        document: Value,
    ) -> GatewayResult<String> {
        let builder = self
            .request(ctx, Method::POST, &format!("{collection}/_doc"))
            .query(&[REFRESH])
            .json(&document);

        let result = match self.execute(ctx, builder).await {
            Ok((status, body)) if status.is_success() => body
                .get("_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| GatewayError::Write {
                    status: status.as_u16(),
                    message: "create response has no _id".to_string(),
                }),
            Ok((status, body)) => Err(reject(status, &body, Operation::Write)),
            Err(e) => Err(e),
        };
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
        let builder = self.update_request(ctx, collection, document_id, &patch);

        let result = match self.execute(ctx, builder).await {
            Ok((status, body)) => write_outcome(status, &body, collection, document_id),
            Err(e) => Err(e),
        };
        log_outcome(ctx, "partial_update_document", collection, &result);
        result
    }

    async fn delete_document(
        &self,
        ctx: &RequestContext,
        collection: &str,
        document_id: &str,
    ) -> GatewayResult<()> {
        let builder = self.delete_request(ctx, collection, document_id);

        let result = match self.execute(ctx, builder).await {
            Ok((status, body)) => write_outcome(status, &body, collection, document_id),
            Err(e) => Err(e),
        };
        log_outcome(ctx, "delete_document", collection, &result);
        result
    }

    async fn ensure_collection(
        &self,
        ctx: &RequestContext,
        collection: &str,
        mapping: &Value,
    ) -> GatewayResult<()> {
        let builder = self.request(ctx, Method::PUT, collection).json(mapping);

        let result = match self.execute(ctx, builder).await {
            Ok((status, _)) if status.is_success() => {
                tracing::info!(parent: ctx.logger(), collection, "Index created");
                Ok(())
            }
            Ok((status, body))
                if status == StatusCode::BAD_REQUEST
                    && error_type(&body) == Some("resource_already_exists_exception") =>
            {
                tracing::debug!(parent: ctx.logger(), collection, "Index already exists");
                Ok(())
            }
            Ok((status, body)) => Err(reject(status, &body, Operation::Write)),
            Err(e) => Err(e),
        };
        log_outcome(ctx, "ensure_collection", collection, &result);
        result
    }
}
