//! Handler traits and the context passed to them.

use super::ProtocolEngine;
use crate::auth::AuthContext;
use crate::error::{HandlerError, McpResult};
use crate::protocol::{ProgressParams, RequestId, NOTIFICATION_PROGRESS};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A progress update for an outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub progress: f64,
    pub total: Option<f64>,
    pub message: Option<String>,
}

pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Per-call options for [`ProtocolEngine::send_request`].
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Overrides the engine's default timeout.
    pub timeout: Option<Duration>,
    /// Cancel the request from the caller's side.
    pub cancel: Option<CancellationToken>,
    /// Receive `notifications/progress` for this request.
    pub on_progress: Option<ProgressCallback>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn on_progress(mut self, f: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }
}

/// Everything a request handler gets to see about one inbound request.
pub struct RequestContext {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
    /// Set when the method requires auth.
    pub auth: Option<AuthContext>,
    cancel: CancellationToken,
    engine: ProtocolEngine,
}

impl RequestContext {
    pub(crate) fn new(
        id: RequestId,
        method: String,
        params: Option<Value>,
        auth: Option<AuthContext>,
        cancel: CancellationToken,
        engine: ProtocolEngine,
    ) -> Self {
        Self {
            id,
            method,
            params,
            auth,
            cancel,
            engine,
        }
    }

    /// Deserialize params; absent params read as an empty object.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        let value = self
            .params
            .clone()
            .unwrap_or_else(|| Value::Object(Map::new()));
        Ok(serde_json::from_value(value)?)
    }

    /// Whether the peer asked to cancel this request.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the peer cancels this request.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Token the peer attached for progress reporting.
    pub fn progress_token(&self) -> Option<RequestId> {
        self.params
            .as_ref()?
            .get("_meta")?
            .get("progressToken")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Send a notification tied to this request.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        self.engine
            .send_related_notification(method, params, &self.id)
            .await
    }

    /// Report progress if the peer asked for it; a no-op otherwise.
    pub async fn report_progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> McpResult<()> {
        let Some(token) = self.progress_token() else {
            return Ok(());
        };
        let params = ProgressParams {
            progress_token: token,
            progress,
            total,
            message,
        };
        self.notify(NOTIFICATION_PROGRESS, Some(serde_json::to_value(params)?))
            .await
    }

    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }
}

/// An inbound notification.
#[derive(Debug, Clone)]
pub struct NotificationContext {
    pub method: String,
    pub params: Option<Value>,
}

/// Handles one request method.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, ctx: RequestContext) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: RequestContext) -> Result<Value, HandlerError> {
        (self)(ctx).await
    }
}

/// Handles one notification method.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, ctx: NotificationContext);
}

#[async_trait]
impl<F, Fut> NotificationHandler for F
where
    F: Fn(NotificationContext) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, ctx: NotificationContext) {
        (self)(ctx).await
    }
}
