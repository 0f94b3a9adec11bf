//! Transport-agnostic request/response correlation.
//!
//! One [`ProtocolEngine`] serves one connection. It assigns ids to outbound
//! requests and matches responses to them, dispatches inbound requests and
//! notifications to registered handlers, and enforces timeouts and
//! cancellation.
//!
//! Inbound frames are decoded and dispatched in arrival order on the
//! transport's callback. Request handlers then run as independent tasks;
//! notification handlers run one at a time, in arrival order.
//!
//! An attached engine keeps itself alive until its transport closes, so
//! dropping every handle does not strand a live connection.

mod handler;
mod pending;

pub use handler::{
    NotificationContext, NotificationHandler, Progress, ProgressCallback, RequestContext,
    RequestHandler, RequestOptions,
};

use crate::auth::{self, AuthContext, AuthRequest, AuthRequirements, Authenticator};
use crate::error::{HandlerError, McpError, McpResult};
use crate::protocol::{
    self, CancelledParams, Envelope, Frame, ProgressParams, RequestId, RpcError, METHOD_PING,
    NOTIFICATION_CANCELLED, NOTIFICATION_PROGRESS,
};
use crate::sync::{lock, read, write};
use crate::transport::{Transport, TransportHandlers};
use futures::future::join_all;
use pending::{PendingRequest, PendingTable};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Default time an outbound request may stay unanswered.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Created, no transport yet.
    Connected,
    /// Transport attached and callbacks wired.
    Attached,
    /// Terminal.
    Closed,
}

/// Engine construction options.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Label used in log output.
    pub name: String,
    pub default_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            name: "engine".to_string(),
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

pub type EngineErrorCallback = Arc<dyn Fn(&McpError) + Send + Sync>;
type EngineCloseCallback = Box<dyn FnOnce() + Send>;
type QueuedNotification = (Arc<dyn NotificationHandler>, NotificationContext);

/// Request/response correlation for one connection. Cheap to clone.
#[derive(Clone)]
pub struct ProtocolEngine {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    default_timeout: Duration,
    state: Mutex<EngineState>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    next_id: AtomicI64,
    pending: Mutex<PendingTable>,
    request_handlers: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
    notification_handlers: RwLock<HashMap<String, Arc<dyn NotificationHandler>>>,
    in_flight: Mutex<HashMap<RequestId, CancellationToken>>,
    authenticator: RwLock<Option<Arc<dyn Authenticator>>>,
    auth_requirements: RwLock<AuthRequirements>,
    on_error: RwLock<Option<EngineErrorCallback>>,
    on_close: Mutex<Vec<EngineCloseCallback>>,
    notifications: Mutex<Option<mpsc::UnboundedSender<QueuedNotification>>>,
    /// Strong self-reference held from attach until close.
    keepalive: Mutex<Option<Arc<Inner>>>,
}

impl Default for ProtocolEngine {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

impl ProtocolEngine {
    pub fn new(options: EngineOptions) -> Self {
        let engine = Self {
            inner: Arc::new(Inner {
                name: options.name,
                default_timeout: options.default_timeout,
                state: Mutex::new(EngineState::Connected),
                transport: RwLock::new(None),
                next_id: AtomicI64::new(1),
                pending: Mutex::new(PendingTable::default()),
                request_handlers: RwLock::new(HashMap::new()),
                notification_handlers: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                authenticator: RwLock::new(None),
                auth_requirements: RwLock::new(AuthRequirements::default()),
                on_error: RwLock::new(None),
                on_close: Mutex::new(Vec::new()),
                notifications: Mutex::new(None),
                keepalive: Mutex::new(None),
            }),
        };
        engine.set_request_handler(METHOD_PING, |_ctx: RequestContext| async {
            Ok(json!({}))
        });
        engine
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> EngineState {
        *lock(&self.inner.state)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == EngineState::Closed
    }

    /// The attached transport, while the engine is attached.
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        read(&self.inner.transport).clone()
    }

    /// Ids of outbound requests still awaiting a response, ascending.
    pub fn pending_request_ids(&self) -> Vec<RequestId> {
        lock(&self.inner.pending)
            .ids()
            .into_iter()
            .map(RequestId::Number)
            .collect()
    }

    /// Wire the transport's callbacks to this engine and start it.
    pub async fn attach(&self, transport: Arc<dyn Transport>) -> McpResult<()> {
        {
            let mut state = lock(&self.inner.state);
            match *state {
                EngineState::Connected => *state = EngineState::Attached,
                EngineState::Attached => {
                    return Err(McpError::InvalidState(
                        "a transport is already attached".to_string(),
                    ))
                }
                EngineState::Closed => return Err(McpError::ConnectionClosed),
            }
        }

        *write(&self.inner.transport) = Some(transport.clone());
        *lock(&self.inner.keepalive) = Some(self.inner.clone());
        *lock(&self.inner.notifications) = Some(self.spawn_notification_worker());

        let on_message = Arc::downgrade(&self.inner);
        let on_error = Arc::downgrade(&self.inner);
        let on_close = Arc::downgrade(&self.inner);
        transport.set_handlers(
            TransportHandlers::new()
                .on_message(move |frame| {
                    if let Some(inner) = on_message.upgrade() {
                        ProtocolEngine { inner }.handle_frame(frame);
                    }
                })
                .on_error(move |err| {
                    if let Some(inner) = on_error.upgrade() {
                        ProtocolEngine { inner }.report_error(McpError::Transport(err));
                    }
                })
                .on_close(move || {
                    if let Some(inner) = on_close.upgrade() {
                        ProtocolEngine { inner }.handle_transport_close();
                    }
                }),
        );

        if let Err(err) = transport.start().await {
            warn!(engine = %self.inner.name, error = %err, "transport failed to start");
            self.handle_transport_close();
            return Err(err.into());
        }

        debug!(
            engine = %self.inner.name,
            session = ?transport.session_id(),
            "transport attached"
        );
        Ok(())
    }

    /// Register a request handler. Replaces any handler for the same method.
    pub fn set_request_handler<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.set_request_handler_arc(method, Arc::new(handler));
    }

    pub fn set_request_handler_arc(&self, method: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        write(&self.inner.request_handlers).insert(method.into(), handler);
    }

    pub fn remove_request_handler(&self, method: &str) -> bool {
        write(&self.inner.request_handlers).remove(method).is_some()
    }

    pub fn has_request_handler(&self, method: &str) -> bool {
        read(&self.inner.request_handlers).contains_key(method)
    }

    /// Register a notification handler. Replaces any handler for the same method.
    pub fn set_notification_handler<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(NotificationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.set_notification_handler_arc(method, Arc::new(handler));
    }

    pub fn set_notification_handler_arc(
        &self,
        method: impl Into<String>,
        handler: Arc<dyn NotificationHandler>,
    ) {
        write(&self.inner.notification_handlers).insert(method.into(), handler);
    }

    pub fn remove_notification_handler(&self, method: &str) -> bool {
        write(&self.inner.notification_handlers)
            .remove(method)
            .is_some()
    }

    /// Install the adapter consulted for methods marked with [`require_auth`](Self::require_auth).
    pub fn set_authenticator(&self, authenticator: Arc<dyn Authenticator>) {
        *write(&self.inner.authenticator) = Some(authenticator);
    }

    /// Require an authenticated caller holding `scopes` for `method`.
    pub fn require_auth<I, S>(&self, method: impl Into<String>, scopes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        write(&self.inner.auth_requirements).require(method, scopes);
    }

    pub(crate) fn set_auth_requirements(&self, requirements: AuthRequirements) {
        *write(&self.inner.auth_requirements) = requirements;
    }

    /// Observe engine-level errors (transport failures, undeliverable frames).
    pub fn on_error(&self, f: impl Fn(&McpError) + Send + Sync + 'static) {
        *write(&self.inner.on_error) = Some(Arc::new(f));
    }

    /// Run `f` once the connection has closed. Runs immediately if it already has.
    pub fn on_close(&self, f: impl FnOnce() + Send + 'static) {
        {
            let state = lock(&self.inner.state);
            if *state != EngineState::Closed {
                lock(&self.inner.on_close).push(Box::new(f));
                return;
            }
        }
        f();
    }

    /// Send a request and wait for its response.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> McpResult<Value> {
        let transport = self.transport_for_send()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let request_id = RequestId::Number(id);
        let timeout = options.timeout.unwrap_or(self.inner.default_timeout);

        let params = match options.on_progress {
            Some(_) => attach_progress_token(params, &request_id),
            None => params,
        };

        let (tx, rx) = oneshot::channel();
        let sent_at = Instant::now();
        let deadline = sent_at + timeout;
        lock(&self.inner.pending).insert(PendingRequest {
            id,
            method: method.to_string(),
            sent_at,
            sink: tx,
            on_progress: options.on_progress.clone(),
        });

        debug!(engine = %self.inner.name, id, method, "sending request");
        let frame = protocol::encode(&Envelope::request(request_id.clone(), method, params));

        let cancel = options.cancel.unwrap_or_default();
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            res = tokio::time::timeout_at(deadline, transport.send(frame)) => Some(res),
        };
        match sent {
            Some(Ok(Ok(()))) => {}
            Some(Ok(Err(err))) => {
                lock(&self.inner.pending).take(id);
                return Err(err.into());
            }
            Some(Err(_)) => {
                self.abandon(id, "timeout");
                return Err(McpError::Timeout(request_id));
            }
            None => {
                self.abandon(id, "cancelled");
                return Err(McpError::Cancelled(request_id));
            }
        }

        tokio::select! {
            biased;
            outcome = rx => outcome.unwrap_or(Err(McpError::ConnectionClosed)),
            _ = tokio::time::sleep_until(deadline) => {
                warn!(engine = %self.inner.name, id, method, ?timeout, "request timed out");
                self.abandon(id, "timeout");
                Err(McpError::Timeout(request_id))
            }
            _ = cancel.cancelled() => {
                debug!(engine = %self.inner.name, id, method, "request cancelled by caller");
                self.abandon(id, "cancelled");
                Err(McpError::Cancelled(request_id))
            }
        }
    }

    /// Send a notification. Transport failures go to [`on_error`](Self::on_error).
    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        let transport = self.transport_for_send()?;
        trace!(engine = %self.inner.name, method, "sending notification");
        let frame = protocol::encode(&Envelope::notification(method, params));
        if let Err(err) = transport.send(frame).await {
            self.report_error(McpError::Transport(err));
        }
        Ok(())
    }

    /// Send a notification emitted while handling the inbound request `related`.
    pub async fn send_related_notification(
        &self,
        method: &str,
        params: Option<Value>,
        related: &RequestId,
    ) -> McpResult<()> {
        let transport = self.transport_for_send()?;
        let frame = protocol::encode(&Envelope::notification(method, params));
        if let Err(err) = transport.send_related(frame, related).await {
            self.report_error(McpError::Transport(err));
        }
        Ok(())
    }

    /// Close the transport. Pending requests fail with `ConnectionClosed`.
    pub async fn close(&self) -> McpResult<()> {
        if let Some(transport) = self.transport() {
            if let Err(err) = transport.close().await {
                warn!(engine = %self.inner.name, error = %err, "error closing transport");
            }
        }
        self.handle_transport_close();
        Ok(())
    }

    fn transport_for_send(&self) -> McpResult<Arc<dyn Transport>> {
        match self.state() {
            EngineState::Connected => Err(McpError::InvalidState(
                "no transport attached".to_string(),
            )),
            EngineState::Closed => Err(McpError::ConnectionClosed),
            EngineState::Attached => self.transport().ok_or(McpError::ConnectionClosed),
        }
    }

    /// Drop a pending request and tell the peer, best effort.
    fn abandon(&self, id: i64, reason: &'static str) {
        if lock(&self.inner.pending).take(id).is_none() {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            let params = CancelledParams {
                request_id: RequestId::Number(id),
                reason: Some(reason.to_string()),
            };
            let params = serde_json::to_value(params).ok();
            if let Err(err) = engine.send_notification(NOTIFICATION_CANCELLED, params).await {
                debug!(id, error = %err, "could not send cancellation notice");
            }
        });
    }

    /// Run queued notification handlers one at a time. The worker exits once
    /// the sender is dropped on close and the queue is empty.
    fn spawn_notification_worker(&self) -> mpsc::UnboundedSender<QueuedNotification> {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedNotification>();
        let name = self.inner.name.clone();
        tokio::spawn(async move {
            while let Some((handler, ctx)) = rx.recv().await {
                let method = ctx.method.clone();
                let run = tokio::spawn(async move { handler.handle(ctx).await });
                if let Err(err) = run.await {
                    warn!(engine = %name, method, error = %err, "notification handler panicked");
                }
            }
        });
        tx
    }

    fn report_error(&self, error: McpError) {
        warn!(engine = %self.inner.name, error = %error, "engine error");
        let callback = read(&self.inner.on_error).clone();
        if let Some(cb) = callback {
            cb(&error);
        }
    }

    fn handle_transport_close(&self) {
        {
            let mut state = lock(&self.inner.state);
            if *state == EngineState::Closed {
                return;
            }
            *state = EngineState::Closed;
        }
        write(&self.inner.transport).take();
        lock(&self.inner.notifications).take();
        let _keepalive = lock(&self.inner.keepalive).take();

        let drained = lock(&self.inner.pending).drain_in_order();
        if !drained.is_empty() {
            debug!(
                engine = %self.inner.name,
                count = drained.len(),
                "failing pending requests on close"
            );
        }
        for request in drained {
            trace!(id = request.id, method = %request.method, "connection closed");
            let _ = request.sink.send(Err(McpError::ConnectionClosed));
        }

        for (_, token) in lock(&self.inner.in_flight).drain() {
            token.cancel();
        }

        let callbacks = std::mem::take(&mut *lock(&self.inner.on_close));
        for callback in callbacks {
            callback();
        }
        info!(engine = %self.inner.name, "connection closed");
    }

    fn handle_frame(&self, frame: Vec<u8>) {
        trace!(engine = %self.inner.name, frame = %String::from_utf8_lossy(&frame), "received frame");
        match protocol::decode(&frame) {
            Ok(Frame::Single(envelope)) => self.dispatch(envelope),
            Ok(Frame::Batch(envelopes)) => self.dispatch_batch(envelopes),
            Err(err) => {
                warn!(engine = %self.inner.name, error = %err, "rejecting undecodable frame");
                self.report_error(McpError::protocol_error(err.message.clone()));
                let reply = protocol::encode(&err.to_envelope());
                let engine = self.clone();
                tokio::spawn(async move { engine.send_reply(reply, None).await });
            }
        }
    }

    fn dispatch(&self, envelope: Envelope) {
        match envelope {
            Envelope::Request { id, method, params } => {
                let token = self.track_inbound(&id);
                let engine = self.clone();
                tokio::spawn(async move {
                    if let Some(reply) = engine.run_request(id.clone(), method, params, token).await {
                        engine
                            .send_reply(protocol::encode(&reply), Some(&id))
                            .await;
                    }
                });
            }
            Envelope::Notification { method, params } => self.handle_notification(method, params),
            Envelope::Response { id, result } => self.resolve(id, Ok(result)),
            Envelope::ErrorResponse {
                id: Some(id),
                error,
            } => self.resolve(id, Err(McpError::Rpc(error))),
            Envelope::ErrorResponse { id: None, error } => {
                self.report_error(McpError::Rpc(error));
            }
        }
    }

    fn dispatch_batch(&self, envelopes: Vec<Envelope>) {
        let mut requests = Vec::new();
        for envelope in envelopes {
            match envelope {
                Envelope::Request { id, method, params } => {
                    let token = self.track_inbound(&id);
                    requests.push((id, method, params, token));
                }
                other => self.dispatch(other),
            }
        }
        if requests.is_empty() {
            return;
        }

        let related = requests[0].0.clone();
        let engine = self.clone();
        tokio::spawn(async move {
            let replies = join_all(
                requests
                    .into_iter()
                    .map(|(id, method, params, token)| engine.run_request(id, method, params, token)),
            )
            .await;
            let replies: Vec<Envelope> = replies.into_iter().flatten().collect();
            if !replies.is_empty() {
                engine
                    .send_reply(protocol::encode_batch(&replies), Some(&related))
                    .await;
            }
        });
    }

    fn track_inbound(&self, id: &RequestId) -> CancellationToken {
        let token = CancellationToken::new();
        if lock(&self.inner.in_flight)
            .insert(id.clone(), token.clone())
            .is_some()
        {
            warn!(engine = %self.inner.name, %id, "peer reused an in-flight request id");
        }
        token
    }

    async fn run_request(
        &self,
        id: RequestId,
        method: String,
        params: Option<Value>,
        token: CancellationToken,
    ) -> Option<Envelope> {
        let outcome = self.invoke(&id, &method, params, token.clone()).await;
        lock(&self.inner.in_flight).remove(&id);

        if token.is_cancelled() {
            debug!(engine = %self.inner.name, %id, method, "request cancelled, not responding");
            return None;
        }
        Some(match outcome {
            Ok(result) => Envelope::response(id, result),
            Err(error) => {
                debug!(engine = %self.inner.name, %id, method, code = error.code, "request failed");
                Envelope::error_response(Some(id), error)
            }
        })
    }

    async fn invoke(
        &self,
        id: &RequestId,
        method: &str,
        params: Option<Value>,
        token: CancellationToken,
    ) -> Result<Value, RpcError> {
        let handler = read(&self.inner.request_handlers).get(method).cloned();
        let Some(handler) = handler else {
            debug!(engine = %self.inner.name, method, "no handler for method");
            return Err(RpcError::method_not_found(method));
        };

        let auth = self.authenticate(method, params.as_ref()).await?;
        let ctx = RequestContext::new(
            id.clone(),
            method.to_string(),
            params,
            auth,
            token,
            self.clone(),
        );

        match tokio::spawn(async move { handler.handle(ctx).await }).await {
            Ok(result) => result.map_err(|e| e.into_rpc_error()),
            Err(join_err) => {
                warn!(engine = %self.inner.name, method, error = %join_err, "request handler panicked");
                Err(RpcError::internal_error("request handler failed"))
            }
        }
    }

    async fn authenticate(
        &self,
        method: &str,
        params: Option<&Value>,
    ) -> Result<Option<AuthContext>, RpcError> {
        let required = match read(&self.inner.auth_requirements).scopes_for(method) {
            Some(scopes) => scopes.clone(),
            None => return Ok(None),
        };
        let authenticator = read(&self.inner.authenticator)
            .clone()
            .ok_or_else(|| RpcError::unauthorized("no authenticator configured"))?;

        let credentials = self.transport().and_then(|t| t.credentials());
        let request = AuthRequest {
            method,
            params,
            credentials: credentials.as_deref(),
        };
        let context = authenticator.authenticate(&request).await.map_err(|denial| {
            debug!(engine = %self.inner.name, method, %denial, "request denied");
            denial.to_rpc_error()
        })?;
        auth::authorize(&context, &required).map_err(|denial| {
            debug!(engine = %self.inner.name, method, subject = %context.subject_id, %denial, "request denied");
            denial.to_rpc_error()
        })?;
        Ok(Some(context))
    }

    async fn send_reply(&self, frame: Vec<u8>, related: Option<&RequestId>) {
        let Some(transport) = self.transport() else {
            debug!(engine = %self.inner.name, "connection closed before reply could be sent");
            return;
        };
        let result = match related {
            Some(id) => transport.send_related(frame, id).await,
            None => transport.send(frame).await,
        };
        if let Err(err) = result {
            self.report_error(McpError::Transport(err));
        }
    }

    fn handle_notification(&self, method: String, params: Option<Value>) {
        match method.as_str() {
            NOTIFICATION_CANCELLED => {
                match params
                    .clone()
                    .map(serde_json::from_value::<CancelledParams>)
                {
                    Some(Ok(cancelled)) => {
                        if let Some(token) = lock(&self.inner.in_flight).get(&cancelled.request_id) {
                            debug!(
                                engine = %self.inner.name,
                                id = %cancelled.request_id,
                                reason = ?cancelled.reason,
                                "peer cancelled request"
                            );
                            token.cancel();
                        }
                    }
                    _ => debug!(engine = %self.inner.name, "ignoring malformed cancellation"),
                }
            }
            NOTIFICATION_PROGRESS => {
                if let Some(Ok(progress)) = params
                    .clone()
                    .map(serde_json::from_value::<ProgressParams>)
                {
                    if let RequestId::Number(id) = progress.progress_token {
                        let callback = lock(&self.inner.pending).progress_callback(id);
                        if let Some(callback) = callback {
                            callback(Progress {
                                progress: progress.progress,
                                total: progress.total,
                                message: progress.message,
                            });
                            return;
                        }
                    }
                }
            }
            _ => {}
        }

        let handler = read(&self.inner.notification_handlers).get(&method).cloned();
        let Some(handler) = handler else {
            trace!(engine = %self.inner.name, method, "no handler for notification");
            return;
        };
        let queue = lock(&self.inner.notifications).clone();
        let queued = queue.is_some_and(|tx| {
            tx.send((handler, NotificationContext { method: method.clone(), params }))
                .is_ok()
        });
        if !queued {
            debug!(engine = %self.inner.name, method, "dropping notification after close");
        }
    }

    fn resolve(&self, id: RequestId, outcome: McpResult<Value>) {
        let entry = match id {
            RequestId::Number(n) => lock(&self.inner.pending).take(n),
            RequestId::String(_) => None,
        };
        match entry {
            Some(request) => {
                debug!(
                    engine = %self.inner.name,
                    id = request.id,
                    method = %request.method,
                    elapsed_ms = request.sent_at.elapsed().as_millis() as u64,
                    "response received"
                );
                let _ = request.sink.send(outcome);
            }
            None => debug!(
                engine = %self.inner.name,
                %id,
                "dropping response for unknown or already resolved request"
            ),
        }
    }
}

fn attach_progress_token(params: Option<Value>, id: &RequestId) -> Option<Value> {
    let token = match id {
        RequestId::Number(n) => Value::from(*n),
        RequestId::String(s) => Value::String(s.clone()),
    };
    let mut params = match params {
        None => Map::new(),
        Some(Value::Object(map)) => map,
        Some(other) => {
            warn!("cannot attach a progress token to non-object params");
            return Some(other);
        }
    };
    let meta = params
        .entry("_meta")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(meta) = meta {
        meta.insert("progressToken".to_string(), token);
    }
    Some(Value::Object(params))
}
