//! Handler traits and the contexts passed to handlers.
//!
//! Any `Fn(RequestContext, Option<Value>) -> impl Future` closure is a
//! [`RequestHandler`]; implement the trait directly for stateful handlers
//! that are easier to express as a type.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use fastacp_protocol::RequestId;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{CancelOrigin, HandlerError, HandlerResult};
use crate::protocol::Protocol;

/// A boxed future for async handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handler for incoming requests of one method.
pub trait RequestHandler: Send + Sync + 'static {
    /// Handles one request. The returned value becomes the response result.
    fn handle(&self, ctx: RequestContext, params: Option<Value>) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(RequestContext, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, ctx: RequestContext, params: Option<Value>) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(ctx, params))
    }
}

/// Handler for incoming notifications of one method.
pub trait NotificationHandler: Send + Sync + 'static {
    /// Handles one notification. Errors are logged, never sent.
    fn handle(
        &self,
        ctx: NotificationContext,
        params: Option<Value>,
    ) -> BoxFuture<'static, Result<(), HandlerError>>;
}

impl<F, Fut> NotificationHandler for F
where
    F: Fn(NotificationContext, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(
        &self,
        ctx: NotificationContext,
        params: Option<Value>,
    ) -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin(self(ctx, params))
    }
}

/// How an incoming request was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancellation {
    /// Which side initiated it.
    pub origin: CancelOrigin,
    /// Reason text.
    pub reason: String,
}

/// Cancellation state of one running request handler.
///
/// The record is written once, before the token fires, so a handler that
/// observes the token always sees who cancelled it.
#[derive(Debug, Clone)]
pub(crate) struct CancelSlot {
    token: CancellationToken,
    record: Arc<OnceLock<Cancellation>>,
}

impl CancelSlot {
    pub(crate) fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            record: Arc::new(OnceLock::new()),
        }
    }

    /// Records the origin (first writer wins) and fires the token.
    pub(crate) fn cancel(&self, origin: CancelOrigin, reason: impl Into<String>) {
        let _ = self.record.set(Cancellation {
            origin,
            reason: reason.into(),
        });
        self.token.cancel();
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn record(&self) -> Option<&Cancellation> {
        self.record.get()
    }
}

/// Context passed to request handlers.
#[derive(Clone)]
pub struct RequestContext {
    id: RequestId,
    method: Arc<str>,
    cancel: CancelSlot,
    protocol: Protocol,
}

impl RequestContext {
    pub(crate) fn new(id: RequestId, method: &str, cancel: CancelSlot, protocol: Protocol) -> Self {
        Self {
            id,
            method: Arc::from(method),
            cancel,
            protocol,
        }
    }

    /// The id of the request being handled.
    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        &self.id
    }

    /// The method being handled.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Returns true once the request has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.token().is_cancelled()
    }

    /// Completes when the request is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.token().cancelled().await;
    }

    /// Returns how the request was cancelled, if it was.
    #[must_use]
    pub fn cancellation(&self) -> Option<&Cancellation> {
        self.cancel.record()
    }

    /// Returns `Err(Cancelled)` if the request has been cancelled.
    ///
    /// Handlers doing long synchronous stretches can call this between steps.
    pub fn checkpoint(&self) -> Result<(), HandlerError> {
        if self.is_cancelled() {
            let reason = self
                .cancellation()
                .map_or_else(|| "Request cancelled".to_owned(), |c| c.reason.clone());
            return Err(HandlerError::Cancelled(reason));
        }
        Ok(())
    }

    /// Handle to the engine, for nested outgoing calls.
    #[must_use]
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Context passed to notification handlers.
#[derive(Clone)]
pub struct NotificationContext {
    method: Arc<str>,
    protocol: Protocol,
}

impl NotificationContext {
    pub(crate) fn new(method: &str, protocol: Protocol) -> Self {
        Self {
            method: Arc::from(method),
            protocol,
        }
    }

    /// The notification method.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Handle to the engine.
    #[must_use]
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }
}

impl std::fmt::Debug for NotificationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationContext")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}
