//! Request-scoped identity, cancellation and logging.
//!
//! A `RequestContext` is built once per inbound request and passed by reference down every
//! call chain. It is never stored in shared state; cloning it produces an independent value
//! that still observes the same cancellation token.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Span;

/// Why an operation stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    #[error("request cancelled")]
    Cancelled,
    #[error("request deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: String,
    trace_id: String,
    user_id: Option<String>,
    span: Span,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Create a context with its own logging span. `cancel` is usually a child of the
    /// process shutdown token so shutdown reaches every in-flight request.
    pub fn new(
        service_name: &str,
        request_id: impl Into<String>,
        trace_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        let request_id = request_id.into();
        let trace_id = trace_id.into();
        let span = tracing::info_span!(
            "request",
            service.name = %service_name,
            request_id = %request_id,
            trace_id = %trace_id,
        );

        Self {
            request_id,
            trace_id,
            user_id: None,
            span,
            cancel,
            deadline: None,
        }
    }

    /// Context for work that happens outside any request, e.g. startup index creation.
    pub fn background(service_name: &str) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self::new(service_name, id.clone(), id, CancellationToken::new())
    }

    #[must_use]
    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id.filter(|u| !u.is_empty());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Span every event of this request is emitted under.
    pub fn logger(&self) -> &Span {
        &self.span
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline().map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn done(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns the reason this context can no longer make progress, if any.
    pub fn err(&self) -> Option<Interrupted> {
        if self.done().is_cancelled() {
            return Some(Interrupted::Cancelled);
        }
        match self.deadline() {
            Some(d) if Instant::now() >= d => Some(Interrupted::DeadlineExceeded),
            _ => None,
        }
    }

    /// Drive `fut` to completion unless the context is cancelled or its deadline passes
    /// first. The future is dropped on interruption, aborting any in-flight I/O it owns.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, Interrupted>
    where
        F: Future<Output = T>,
    {
        if let Some(reason) = self.err() {
            return Err(reason);
        }

        let sleep = async {
            match self.deadline() {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.done().cancelled() => Err(Interrupted::Cancelled),
            _ = sleep => Err(Interrupted::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new("catalogue", "req-1", "trace-1", CancellationToken::new())
    }

    #[test]
    fn test_accessors() {
        let ctx = ctx().with_user(Some("alice".to_string()));
        assert_eq!(ctx.request_id(), "req-1");
        assert_eq!(ctx.trace_id(), "trace-1");
        assert_eq!(ctx.user_id(), Some("alice"));
        assert!(ctx.deadline().is_none());
        assert!(ctx.err().is_none());
    }

    #[test]
    fn test_empty_user_is_dropped() {
        let ctx = ctx().with_user(Some(String::new()));
        assert!(ctx.user_id().is_none());
    }

    #[tokio::test]
    async fn test_run_completes_when_not_cancelled() {
        let ctx = ctx().with_timeout(Duration::from_secs(5));
        let out = ctx.run(async { 42 }).await;
        assert_eq!(out, Ok(42));
    }

    #[tokio::test]
    async fn test_run_aborts_on_cancel() {
        let token = CancellationToken::new();
        let ctx = RequestContext::new("catalogue", "req-1", "trace-1", token.child_token());

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let out = ctx.run(std::future::pending::<()>()).await;
        assert_eq!(out, Err(Interrupted::Cancelled));
        assert_eq!(ctx.err(), Some(Interrupted::Cancelled));
    }

    #[tokio::test]
    async fn test_run_aborts_on_deadline() {
        let ctx = ctx().with_timeout(Duration::from_millis(50));
        let out = ctx.run(std::future::pending::<()>()).await;
        assert_eq!(out, Err(Interrupted::DeadlineExceeded));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_clone_shares_cancellation() {
        let ctx = ctx();
        let copy = ctx.clone();
        ctx.done().cancel();
        assert_eq!(copy.err(), Some(Interrupted::Cancelled));
        assert_eq!(copy.run(async {}).await, Err(Interrupted::Cancelled));
    }
}
