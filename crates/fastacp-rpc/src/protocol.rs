//! The protocol engine.
//!
//! A [`Protocol`] correlates outgoing requests with their responses,
//! dispatches incoming requests and notifications to registered handlers,
//! and propagates cancellation in both directions with `$/cancelRequest`.
//!
//! # Lifecycle
//!
//! `CREATED -> STARTED -> CLOSED`. Handlers may be registered at any time;
//! requests flow only while started. A closed engine cannot be restarted.
//!
//! # Tasks
//!
//! - one pump task (on the caller's runtime) reads the transport's incoming
//!   stream in order and hands each message off without awaiting handlers
//! - one handler worker thread runs every handler (see [`crate::executor`])
//!
//! # Cancellation
//!
//! Dropping the future returned by [`Protocol::send_request`] before it
//! resolves sends exactly one `$/cancelRequest` for that id. A `CANCELLED`
//! error response from the peer resolves the call without sending one.
//! Incoming requests cancelled by the peer get no response; those cancelled
//! locally are answered with `CANCELLED`.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use fastacp_core::logging::targets;
use fastacp_core::{AcpError, ProtocolConfig, log_dispatch, log_handler};
use fastacp_protocol::schema::methods::CANCEL_REQUEST;
use fastacp_protocol::{
    CancelRequestParams, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    RequestId, to_params,
};
use fastacp_transport::Transport;
use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{CancelOrigin, HandlerError, HandlerResult, ProtocolError, RpcCallError};
use crate::executor::HandlerExecutor;
use crate::handler::{
    BoxFuture, CancelSlot, NotificationContext, NotificationHandler, RequestContext,
    RequestHandler,
};

const CREATED: u8 = 0;
const STARTED: u8 = 1;
const CLOSED: u8 = 2;

/// Reason used when the engine cancels pending work on close.
pub const CLOSED_REASON: &str = "closed";

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Built, not yet started.
    Created,
    /// Pumping messages.
    Started,
    /// Closed for good.
    Closed,
}

/// Resolution of one outgoing request.
enum Completion {
    Response(Result<Value, AcpError>),
    Cancelled(String),
}

struct IncomingTask {
    serial: u64,
    cancel: CancelSlot,
}

type RequestRegistry = RwLock<Arc<HashMap<String, Arc<dyn RequestHandler>>>>;
type NotificationRegistry = RwLock<Arc<HashMap<String, Arc<dyn NotificationHandler>>>>;

struct Inner {
    transport: Arc<dyn Transport>,
    config: ProtocolConfig,
    state: AtomicU8,
    next_id: AtomicI64,
    next_serial: AtomicU64,
    request_handlers: RequestRegistry,
    notification_handlers: NotificationRegistry,
    pending_outgoing: Mutex<HashMap<RequestId, oneshot::Sender<Completion>>>,
    pending_incoming: Mutex<HashMap<RequestId, IncomingTask>>,
    executor: Mutex<Option<HandlerExecutor>>,
    scope: CancellationToken,
}

/// A JSON-RPC peer: both caller and callee on one transport.
///
/// Cloning is cheap; all clones drive the same engine.
#[derive(Clone)]
pub struct Protocol {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Protocol {
    /// Creates an engine over the given transport, configured from the
    /// `FASTACP_*` environment variables.
    #[must_use]
    pub fn new<T: Transport>(transport: T) -> Self {
        Self::with_config(Arc::new(transport), ProtocolConfig::from_env())
    }

    /// Creates an engine over a shared transport.
    ///
    /// The configured message size limit is applied to the transport.
    #[must_use]
    pub fn with_config(transport: Arc<dyn Transport>, config: ProtocolConfig) -> Self {
        transport.set_max_message_size(config.max_message_size);
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                state: AtomicU8::new(CREATED),
                next_id: AtomicI64::new(0),
                next_serial: AtomicU64::new(0),
                request_handlers: RwLock::new(Arc::new(HashMap::new())),
                notification_handlers: RwLock::new(Arc::new(HashMap::new())),
                pending_outgoing: Mutex::new(HashMap::new()),
                pending_incoming: Mutex::new(HashMap::new()),
                executor: Mutex::new(None),
                scope: CancellationToken::new(),
            }),
        }
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProtocolState {
        match self.inner.state.load(Ordering::Acquire) {
            CREATED => ProtocolState::Created,
            STARTED => ProtocolState::Started,
            _ => ProtocolState::Closed,
        }
    }

    /// Returns the engine configuration.
    #[must_use]
    pub fn config(&self) -> &ProtocolConfig {
        &self.inner.config
    }

    /// Number of outgoing requests awaiting a response.
    #[must_use]
    pub fn pending_outgoing_count(&self) -> usize {
        lock(&self.inner.pending_outgoing).len()
    }

    /// Number of incoming requests whose handler is still running.
    #[must_use]
    pub fn pending_incoming_count(&self) -> usize {
        lock(&self.inner.pending_incoming).len()
    }

    /// Starts the engine: registers the built-in `$/cancelRequest` handler,
    /// starts the transport and begins consuming its incoming stream.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if the engine was already started or closed, if no runtime is
    /// available, or if the transport cannot start.
    pub fn start(&self) -> Result<(), ProtocolError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ProtocolError::NoRuntime)?;
        if let Err(state) = self.inner.state.compare_exchange(
            CREATED,
            STARTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(if state == STARTED {
                ProtocolError::AlreadyStarted
            } else {
                ProtocolError::Closed
            });
        }

        self.set_notification_handler(CANCEL_REQUEST, |ctx: NotificationContext, params| {
            ctx.protocol().on_cancel_request(params);
            futures::future::ready(Ok(()))
        });

        let started = self.start_pump(&runtime);
        if started.is_err() {
            self.close();
        }
        started
    }

    fn start_pump(&self, runtime: &tokio::runtime::Handle) -> Result<(), ProtocolError> {
        let executor =
            HandlerExecutor::spawn(&self.inner.config.handler_thread_name).map_err(ProtocolError::Io)?;
        *lock(&self.inner.executor) = Some(executor);

        let incoming = self
            .inner
            .transport
            .incoming()
            .ok_or(ProtocolError::IncomingTaken)?;
        self.inner.transport.start()?;

        runtime.spawn(pump(self.clone(), incoming));
        log::info!(target: targets::PROTOCOL, "protocol started");
        Ok(())
    }

    /// Completes once the engine is closed.
    pub async fn closed(&self) {
        self.inner.scope.cancelled().await;
    }

    /// Cancels all pending work with reason [`CLOSED_REASON`], closes the
    /// transport and stops the handler worker. Idempotent.
    ///
    /// Running incoming requests are answered with `CANCELLED` before the
    /// transport flushes and closes.
    pub fn close(&self) {
        if self.inner.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return;
        }
        log::info!(target: targets::PROTOCOL, "protocol closing");

        self.cancel_pending_incoming_requests(CLOSED_REASON);
        self.cancel_pending_outgoing_requests(CLOSED_REASON);
        self.inner.transport.close();
        self.inner.scope.cancel();
        if let Some(executor) = lock(&self.inner.executor).take() {
            executor.shutdown();
        }
    }

    // ----------------------------------------------------------------------
    // Registration
    // ----------------------------------------------------------------------

    /// Registers the handler for a request method, replacing any previous one.
    pub fn set_request_handler<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(RequestContext, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.set_request_handler_dyn(method, Arc::new(handler));
    }

    /// Registers a request handler trait object.
    pub fn set_request_handler_dyn(&self, method: &str, handler: Arc<dyn RequestHandler>) {
        if insert_handler(&self.inner.request_handlers, method, handler) {
            log_dispatch!("replaced request handler for {}", method);
        }
    }

    /// Registers a request handler with typed params and result.
    ///
    /// Params that fail to deserialize are answered with `PARSE_ERROR`.
    pub fn set_typed_request_handler<P, R, F, Fut>(&self, method: &str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(RequestContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.set_request_handler(method, move |ctx, params| {
            let handler = Arc::clone(&handler);
            async move {
                let params: P = serde_json::from_value(params.unwrap_or(Value::Null))?;
                let result = handler(ctx, params).await?;
                Ok::<_, HandlerError>(serde_json::to_value(result)?)
            }
        });
    }

    /// Removes the handler for a request method.
    pub fn remove_request_handler(&self, method: &str) -> bool {
        let mut registry = self
            .inner
            .request_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::make_mut(&mut registry).remove(method).is_some()
    }

    /// Registers the handler for a notification method, replacing any
    /// previous one.
    pub fn set_notification_handler<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(NotificationContext, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.set_notification_handler_dyn(method, Arc::new(handler));
    }

    /// Registers a notification handler trait object.
    pub fn set_notification_handler_dyn(&self, method: &str, handler: Arc<dyn NotificationHandler>) {
        if insert_handler(&self.inner.notification_handlers, method, handler) {
            log_dispatch!("replaced notification handler for {}", method);
        }
    }

    /// Registers a notification handler with typed params.
    pub fn set_typed_notification_handler<P, F, Fut>(&self, method: &str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(NotificationContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.set_notification_handler(method, move |ctx, params| {
            let handler = Arc::clone(&handler);
            async move {
                let params: P = serde_json::from_value(params.unwrap_or(Value::Null))?;
                handler(ctx, params).await
            }
        });
    }

    /// Returns true if a request handler is registered for `method`.
    #[must_use]
    pub fn has_request_handler(&self, method: &str) -> bool {
        lookup_handler(&self.inner.request_handlers, method).is_some()
    }

    // ----------------------------------------------------------------------
    // Outgoing
    // ----------------------------------------------------------------------

    /// Sends a request and waits for its response.
    ///
    /// Dropping the returned future before it completes cancels the request
    /// on the peer.
    ///
    /// # Errors
    ///
    /// Returns the peer's error, a cancellation, a timeout (only when
    /// configured), or a local engine condition.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RpcCallError> {
        match self.state() {
            ProtocolState::Created => return Err(RpcCallError::NotStarted),
            ProtocolState::Closed => return Err(RpcCallError::Closed),
            ProtocolState::Started => {}
        }

        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        if lock(&self.inner.pending_outgoing)
            .insert(id.clone(), tx)
            .is_some()
        {
            log::warn!(target: targets::PROTOCOL, "pending request replaced for id={}", id);
        }
        let mut guard = OutgoingGuard::new(&self.inner, id.clone());

        log::debug!(target: targets::PROTOCOL, "-> request {} id={}", method, id);
        let request = JsonRpcRequest::new(id, method, params);
        if self.inner.transport.send(request.into()).is_err() {
            guard.settle();
            return Err(RpcCallError::Closed);
        }

        let completion = match self.inner.config.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(completion) => completion,
                Err(_) => {
                    guard.cancel_reason = format!("Request timed out after {limit:?}");
                    return Err(RpcCallError::Timeout(limit));
                }
            },
            None => rx.await,
        };

        match completion {
            Ok(Completion::Response(Ok(value))) => {
                guard.settle();
                Ok(value)
            }
            Ok(Completion::Response(Err(error))) if error.is_cancelled() => {
                guard.settle();
                Err(RpcCallError::Cancelled {
                    origin: CancelOrigin::Remote,
                    reason: error.message,
                })
            }
            Ok(Completion::Response(Err(error))) => {
                guard.settle();
                Err(RpcCallError::Remote(error))
            }
            Ok(Completion::Cancelled(reason)) => {
                // The guard notifies the peer when it drops.
                guard.cancel_reason.clone_from(&reason);
                Err(RpcCallError::Cancelled {
                    origin: CancelOrigin::Local,
                    reason,
                })
            }
            Err(_) => {
                guard.settle();
                Err(RpcCallError::Closed)
            }
        }
    }

    /// Sends a request with typed params and result.
    ///
    /// # Errors
    ///
    /// As [`Protocol::send_request`], plus local (de)serialization failures.
    pub async fn request<P, R>(&self, method: &str, params: &P) -> Result<R, RpcCallError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = to_params(params).map_err(RpcCallError::Serialization)?;
        let value = self.send_request(method, params).await?;
        serde_json::from_value(value).map_err(RpcCallError::Serialization)
    }

    /// Sends a notification. Fire-and-forget.
    ///
    /// # Errors
    ///
    /// Fails only if the engine or transport is closed.
    pub fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), RpcCallError> {
        if self.state() == ProtocolState::Closed {
            return Err(RpcCallError::Closed);
        }
        log::debug!(target: targets::PROTOCOL, "-> notification {}", method);
        self.inner
            .transport
            .send(JsonRpcNotification::new(method, params).into())
            .map_err(|_| RpcCallError::Closed)
    }

    /// Sends a notification with typed params.
    ///
    /// # Errors
    ///
    /// Fails if the params do not serialize or the engine is closed.
    pub fn notify<P: Serialize + ?Sized>(&self, method: &str, params: &P) -> Result<(), RpcCallError> {
        let params = to_params(params).map_err(RpcCallError::Serialization)?;
        self.send_notification(method, params)
    }

    /// Cancels every pending outgoing request with `reason`.
    ///
    /// Each cancelled caller sends one `$/cancelRequest` to the peer and
    /// returns a local cancellation.
    pub fn cancel_pending_outgoing_requests(&self, reason: &str) {
        let drained: Vec<_> = lock(&self.inner.pending_outgoing).drain().collect();
        if !drained.is_empty() {
            log::debug!(target: targets::PROTOCOL, "cancelling {} outgoing requests: {}", drained.len(), reason);
        }
        for (_, slot) in drained {
            let _ = slot.send(Completion::Cancelled(reason.to_owned()));
        }
    }

    /// Cancels every running incoming request handler with `reason`.
    ///
    /// Each cancelled request is answered with `CANCELLED` right away; the
    /// handler's own result is discarded.
    pub fn cancel_pending_incoming_requests(&self, reason: &str) {
        let drained: Vec<_> = lock(&self.inner.pending_incoming).drain().collect();
        if !drained.is_empty() {
            log::debug!(target: targets::PROTOCOL, "cancelling {} incoming requests: {}", drained.len(), reason);
        }
        for (id, task) in drained {
            task.cancel.cancel(CancelOrigin::Local, reason);
            self.send_response(JsonRpcResponse::error(Some(id), AcpError::cancelled(reason)));
        }
    }

    fn send_response(&self, response: JsonRpcResponse) {
        if self.inner.transport.send(response.into()).is_err() {
            log_dispatch!("response dropped: transport closed");
        }
    }

    fn submit(&self, job: BoxFuture<'static, ()>) -> bool {
        lock(&self.inner.executor)
            .as_ref()
            .is_some_and(|executor| executor.submit(job))
    }

    // ----------------------------------------------------------------------
    // Incoming
    // ----------------------------------------------------------------------

    fn dispatch(&self, message: JsonRpcMessage) {
        match message {
            JsonRpcMessage::Request(request) => self.dispatch_request(request),
            JsonRpcMessage::Notification(notification) => self.dispatch_notification(notification),
            JsonRpcMessage::Response(response) => self.dispatch_response(response),
        }
    }

    fn dispatch_request(&self, request: JsonRpcRequest) {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;
        log_dispatch!("<- request {} id={}", method, id);

        let Some(handler) = lookup_handler(&self.inner.request_handlers, &method) else {
            log_dispatch!("no handler for {}", method);
            self.send_response(JsonRpcResponse::error(
                Some(id),
                AcpError::method_not_found(&method),
            ));
            return;
        };

        let cancel = CancelSlot::child_of(&self.inner.scope);
        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        let replaced = lock(&self.inner.pending_incoming).insert(
            id.clone(),
            IncomingTask {
                serial,
                cancel: cancel.clone(),
            },
        );
        if replaced.is_some() {
            log::warn!(target: targets::DISPATCH, "active request replaced for id={}", id);
        }

        let ctx = RequestContext::new(id.clone(), &method, cancel, self.clone());
        let job = run_request(self.clone(), handler, ctx, serial, params);
        // A job dropped unpolled never created its guard.
        if !self.submit(Box::pin(job)) && self.finish_incoming(&id, serial) {
            self.send_response(JsonRpcResponse::error(
                Some(id),
                AcpError::cancelled(CLOSED_REASON),
            ));
        }
    }

    fn dispatch_notification(&self, notification: JsonRpcNotification) {
        let JsonRpcNotification { method, params, .. } = notification;
        log_dispatch!("<- notification {}", method);

        let Some(handler) = lookup_handler(&self.inner.notification_handlers, &method) else {
            log_dispatch!("ignoring unhandled notification {}", method);
            return;
        };

        let ctx = NotificationContext::new(&method, self.clone());
        let job = async move {
            match AssertUnwindSafe(handler.handle(ctx, params))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    log::warn!(target: targets::HANDLER, "notification handler for {} failed: {}", method, err);
                }
                Err(panic) => {
                    log::error!(target: targets::HANDLER, "notification handler for {} panicked: {}", method, panic_message(panic.as_ref()));
                }
            }
        };
        if !self.submit(Box::pin(job)) {
            log_dispatch!("notification dropped: handler worker stopped");
        }
    }

    fn dispatch_response(&self, response: JsonRpcResponse) {
        let Some(id) = response.id.clone() else {
            log::warn!(target: targets::DISPATCH, "response without id: {:?}", response.payload);
            return;
        };
        log_dispatch!("<- response id={}", id);

        let slot = lock(&self.inner.pending_outgoing).remove(&id);
        match slot {
            Some(slot) => {
                if slot.send(Completion::Response(response.into_result())).is_err() {
                    log_dispatch!("caller for id={} already gone", id);
                }
            }
            None => {
                log::warn!(target: targets::DISPATCH, "orphaned response for id={}", id);
            }
        }
    }

    fn on_cancel_request(&self, params: Option<Value>) {
        let params: CancelRequestParams =
            match serde_json::from_value(params.unwrap_or(Value::Null)) {
                Ok(params) => params,
                Err(err) => {
                    log::warn!(target: targets::DISPATCH, "malformed $/cancelRequest: {}", err);
                    return;
                }
            };
        let reason = params
            .message
            .unwrap_or_else(|| "Cancelled by peer".to_owned());

        let cancel = lock(&self.inner.pending_incoming)
            .get(&params.request_id)
            .map(|task| task.cancel.clone());
        match cancel {
            Some(cancel) => {
                log::debug!(target: targets::DISPATCH, "peer cancelled id={}: {}", params.request_id, reason);
                cancel.cancel(CancelOrigin::Remote, reason);
            }
            None => {
                log_dispatch!("cancel for unknown or finished id={}", params.request_id);
            }
        }
    }

    /// Removes the entry for `id` if it still belongs to `serial`. Returns
    /// false if a bulk cancel already took it, and with it the response.
    fn finish_incoming(&self, id: &RequestId, serial: u64) -> bool {
        let mut pending = lock(&self.inner.pending_incoming);
        if pending.get(id).is_some_and(|task| task.serial == serial) {
            pending.remove(id);
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("state", &self.state())
            .field("pending_outgoing", &self.pending_outgoing_count())
            .field("pending_incoming", &self.pending_incoming_count())
            .finish_non_exhaustive()
    }
}

async fn pump(protocol: Protocol, mut incoming: mpsc::UnboundedReceiver<JsonRpcMessage>) {
    let scope = protocol.inner.scope.clone();
    loop {
        let message = tokio::select! {
            () = scope.cancelled() => break,
            message = incoming.recv() => message,
        };
        let Some(message) = message else {
            log::info!(target: targets::PROTOCOL, "transport stream ended");
            break;
        };
        protocol.dispatch(message);
    }
    protocol.close();
}

async fn run_request(
    protocol: Protocol,
    handler: Arc<dyn RequestHandler>,
    ctx: RequestContext,
    serial: u64,
    params: Option<Value>,
) {
    let id = ctx.request_id().clone();
    let _guard = IncomingGuard {
        protocol: protocol.clone(),
        id: id.clone(),
        serial,
    };
    log_handler!("running {} id={}", ctx.method(), id);

    let work = AssertUnwindSafe(handler.handle(ctx.clone(), params)).catch_unwind();
    // The handler is polled first so one watching its own cancellation can
    // finish cleanly; one that is still pending is dropped.
    let outcome = tokio::select! {
        biased;
        result = work => match result {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                log::error!(target: targets::HANDLER, "handler for {} panicked: {}", ctx.method(), message);
                Err(HandlerError::Internal(message))
            }
        },
        () = ctx.cancelled() => Err(HandlerError::Cancelled("Request cancelled".to_owned())),
    };

    if !protocol.finish_incoming(&id, serial) {
        log_handler!("{} id={} already answered", ctx.method(), id);
        return;
    }
    let response = match (outcome, ctx.cancellation()) {
        (_, Some(record)) if record.origin == CancelOrigin::Remote => {
            log_handler!("{} id={} cancelled by peer", ctx.method(), id);
            None
        }
        (Ok(value), _) => Some(JsonRpcResponse::success(id, value)),
        (Err(HandlerError::Cancelled(reason)), record) => {
            let reason = record.map_or(reason, |record| record.reason.clone());
            Some(JsonRpcResponse::error(Some(id), AcpError::cancelled(reason)))
        }
        (Err(err), _) => {
            log_handler!("{} id={} failed: {}", ctx.method(), id, err);
            Some(JsonRpcResponse::error(Some(id), err.into_acp_error()))
        }
    };
    if let Some(response) = response {
        protocol.send_response(response);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_owned()
    }
}

fn insert_handler<H: ?Sized>(
    registry: &RwLock<Arc<HashMap<String, Arc<H>>>>,
    method: &str,
    handler: Arc<H>,
) -> bool {
    let mut registry = registry.write().unwrap_or_else(PoisonError::into_inner);
    Arc::make_mut(&mut registry)
        .insert(method.to_owned(), handler)
        .is_some()
}

fn lookup_handler<H: ?Sized>(
    registry: &RwLock<Arc<HashMap<String, Arc<H>>>>,
    method: &str,
) -> Option<Arc<H>> {
    registry
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(method)
        .cloned()
}

/// Removes an outgoing entry on every exit path and, unless settled,
/// tells the peer the request is cancelled.
struct OutgoingGuard<'a> {
    inner: &'a Inner,
    id: RequestId,
    settled: bool,
    cancel_reason: String,
}

impl<'a> OutgoingGuard<'a> {
    fn new(inner: &'a Inner, id: RequestId) -> Self {
        Self {
            inner,
            id,
            settled: false,
            cancel_reason: "Request cancelled".to_owned(),
        }
    }

    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for OutgoingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.inner.pending_outgoing).remove(&self.id);
        if self.settled {
            return;
        }
        log::debug!(target: targets::PROTOCOL, "cancelling outgoing id={}: {}", self.id, self.cancel_reason);
        let params = CancelRequestParams {
            request_id: self.id.clone(),
            message: Some(std::mem::take(&mut self.cancel_reason)),
        };
        let notification = JsonRpcNotification::new(CANCEL_REQUEST, serde_json::to_value(params).ok());
        if self.inner.transport.send(notification.into()).is_err() {
            log::debug!(target: targets::PROTOCOL, "cancel notification for id={} not sent: transport closed", self.id);
        }
    }
}

/// Removes an incoming entry when its handler task finishes or is dropped.
struct IncomingGuard {
    protocol: Protocol,
    id: RequestId,
    serial: u64,
}

impl Drop for IncomingGuard {
    fn drop(&mut self) {
        let _ = self.protocol.finish_incoming(&self.id, self.serial);
    }
}
