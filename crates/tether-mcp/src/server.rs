//! Server role: answers `initialize`, and the factory that builds one
//! session per connection from a shared, read-only handler registry.

use crate::auth::{AuthRequirements, Authenticator};
use crate::capability::{Capabilities, Role};
use crate::engine::{
    EngineOptions, NotificationContext, NotificationHandler, ProtocolEngine, RequestContext,
    RequestHandler, RequestOptions, DEFAULT_REQUEST_TIMEOUT,
};
use crate::error::{HandlerError, McpError, McpResult};
use crate::protocol::{
    negotiate_version, Implementation, InitializeParams, InitializeResult, RpcError,
    METHOD_INITIALIZE, METHOD_PING, NOTIFICATION_INITIALIZED,
};
use crate::session::{self, SessionState};
use crate::sync::{read, write};
use crate::transport::Transport;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Server construction options.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub capabilities: Capabilities,
    /// Usage hints returned to the client in `initialize`.
    pub instructions: Option<String>,
    pub request_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            capabilities: Capabilities::new(),
            instructions: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug)]
struct ServerSession {
    state: SessionState,
    capabilities: Capabilities,
    instructions: Option<String>,
    client_capabilities: Option<Capabilities>,
    client_info: Option<Implementation>,
    protocol_version: Option<String>,
}

/// One server session over one transport.
#[derive(Clone)]
pub struct Server {
    engine: ProtocolEngine,
    info: Implementation,
    session: Arc<RwLock<ServerSession>>,
}

impl Server {
    pub fn new(info: Implementation, options: ServerOptions) -> Self {
        let engine = ProtocolEngine::new(EngineOptions {
            name: "server".to_string(),
            default_timeout: options.request_timeout,
        });
        let server = Self {
            engine,
            info,
            session: Arc::new(RwLock::new(ServerSession {
                state: SessionState::Uninitialized,
                capabilities: options.capabilities,
                instructions: options.instructions,
                client_capabilities: None,
                client_info: None,
                protocol_version: None,
            })),
        };
        server.install_handshake();
        server
    }

    fn install_handshake(&self) {
        let session = self.session.clone();
        let info = self.info.clone();
        self.engine
            .set_request_handler(METHOD_INITIALIZE, move |ctx: RequestContext| {
                let session = session.clone();
                let info = info.clone();
                async move { answer_initialize(&session, info, &ctx) }
            });

        let session = self.session.clone();
        self.engine
            .set_notification_handler(NOTIFICATION_INITIALIZED, move |_ctx: NotificationContext| {
                let session = session.clone();
                async move {
                    let mut session = write(&session);
                    match session.state {
                        SessionState::Initializing => {
                            session.state = SessionState::Initialized;
                            info!(
                                client = ?session.client_info.as_ref().map(|c| &c.name),
                                "session initialized"
                            );
                        }
                        state => warn!(?state, "unexpected initialized notification"),
                    }
                }
            });
    }

    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }

    pub fn info(&self) -> &Implementation {
        &self.info
    }

    pub fn state(&self) -> SessionState {
        read(&self.session).state
    }

    /// Add local capabilities. Only legal before the client initializes.
    pub fn register_capabilities(&self, capabilities: Capabilities) -> McpResult<()> {
        let mut session = write(&self.session);
        session::check_registration(Role::Server, session.state)?;
        session.capabilities.merge(&capabilities);
        Ok(())
    }

    pub fn capabilities(&self) -> Capabilities {
        read(&self.session).capabilities.clone()
    }

    pub fn client_capabilities(&self) -> Option<Capabilities> {
        read(&self.session).client_capabilities.clone()
    }

    pub fn client_info(&self) -> Option<Implementation> {
        read(&self.session).client_info.clone()
    }

    pub fn protocol_version(&self) -> Option<String> {
        read(&self.session).protocol_version.clone()
    }

    /// Attach `transport` and start answering.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> McpResult<()> {
        self.engine.attach(transport).await
    }

    /// Attach `transport` and wait until the connection closes.
    pub async fn serve(&self, transport: Arc<dyn Transport>) -> McpResult<()> {
        let (tx, rx) = oneshot::channel();
        self.engine.on_close(move || {
            let _ = tx.send(());
        });
        self.connect(transport).await?;
        let _ = rx.await;
        Ok(())
    }

    /// Send a request to the client. Fails locally if the client lacks the
    /// needed capability.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> McpResult<Value> {
        {
            let session = read(&self.session);
            session::check_request(
                Role::Server,
                session.state,
                method,
                session.client_capabilities.as_ref(),
            )?;
        }
        self.engine.send_request(method, params, options).await
    }

    pub async fn ping(&self) -> McpResult<()> {
        self.request(METHOD_PING, None, RequestOptions::new())
            .await
            .map(|_| ())
    }

    /// Send a notification to the client.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        {
            let session = read(&self.session);
            session::check_notification(Role::Server, method, &session.capabilities)?;
        }
        self.engine.send_notification(method, params).await
    }

    /// Handle a client request. Needs the matching local capability.
    pub fn set_request_handler<F, Fut>(&self, method: &str, handler: F) -> McpResult<()>
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        session::check_handler(Role::Server, method, &read(&self.session).capabilities)?;
        self.engine.set_request_handler(method, handler);
        Ok(())
    }

    /// Handle a notification from the client. Needs the capability the peer
    /// would need to send it, registered locally.
    pub fn set_notification_handler<F, Fut>(&self, method: &str, handler: F) -> McpResult<()>
    where
        F: Fn(NotificationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        session::check_notification_handler(Role::Server, method, &read(&self.session).capabilities)?;
        self.engine.set_notification_handler(method, handler);
        Ok(())
    }

    pub async fn close(&self) -> McpResult<()> {
        self.engine.close().await
    }
}

fn answer_initialize(
    session: &RwLock<ServerSession>,
    info: Implementation,
    ctx: &RequestContext,
) -> Result<Value, HandlerError> {
    let params: InitializeParams = ctx.params_as()?;
    let mut session = write(session);
    if session.state != SessionState::Uninitialized {
        return Err(RpcError::invalid_request("session is already initialized").into());
    }

    let version = negotiate_version(&params.protocol_version);
    if version != params.protocol_version {
        warn!(
            proposed = %params.protocol_version,
            using = version,
            "client proposed an unsupported protocol version, falling back"
        );
    }
    debug!(client = %params.client_info.name, protocol = version, "client initializing");

    session.client_capabilities = Some(params.capabilities);
    session.client_info = Some(params.client_info);
    session.protocol_version = Some(version.to_string());
    session.state = SessionState::Initializing;

    let result = InitializeResult {
        protocol_version: version.to_string(),
        capabilities: session.capabilities.clone(),
        server_info: info,
        instructions: session.instructions.clone(),
    };
    serde_json::to_value(result).map_err(|e| HandlerError::Internal(e.into()))
}

/// Collects the process-wide server configuration, validated once.
pub struct ServerBuilder {
    info: Implementation,
    options: ServerOptions,
    request_handlers: Vec<(String, Arc<dyn RequestHandler>)>,
    notification_handlers: Vec<(String, Arc<dyn NotificationHandler>)>,
    authenticator: Option<Arc<dyn Authenticator>>,
    auth: AuthRequirements,
}

impl ServerBuilder {
    pub fn new(info: Implementation) -> Self {
        Self {
            info,
            options: ServerOptions::default(),
            request_handlers: Vec::new(),
            notification_handlers: Vec::new(),
            authenticator: None,
            auth: AuthRequirements::default(),
        }
    }

    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.options.capabilities.merge(&capabilities);
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.options.instructions = Some(instructions.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.options.request_timeout = timeout;
        self
    }

    pub fn request_handler<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.request_handlers.push((method.into(), Arc::new(handler)));
        self
    }

    pub fn notification_handler<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(NotificationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.notification_handlers
            .push((method.into(), Arc::new(handler)));
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Require an authenticated caller holding `scopes` for `method`.
    pub fn require_auth<I, S>(mut self, method: impl Into<String>, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.auth.require(method, scopes);
        self
    }

    /// Validate handlers against the declared capabilities.
    pub fn build(self) -> McpResult<ServerFactory> {
        for (method, _) in &self.request_handlers {
            session::check_handler(Role::Server, method, &self.options.capabilities)?;
        }
        for (method, _) in &self.notification_handlers {
            session::check_notification_handler(Role::Server, method, &self.options.capabilities)?;
        }
        if !self.auth.is_empty() && self.authenticator.is_none() {
            return Err(McpError::contract(
                "methods require auth but no authenticator was configured",
            ));
        }
        Ok(ServerFactory {
            blueprint: Arc::new(self),
        })
    }
}

/// Builds one [`Server`] per connection. Cheap to clone and share.
#[derive(Clone)]
pub struct ServerFactory {
    blueprint: Arc<ServerBuilder>,
}

impl ServerFactory {
    pub fn info(&self) -> &Implementation {
        &self.blueprint.info
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.blueprint.options.capabilities
    }

    /// A fresh, unconnected session with every registered handler installed.
    pub fn create(&self) -> Server {
        let blueprint = &self.blueprint;
        let server = Server::new(blueprint.info.clone(), blueprint.options.clone());
        let engine = server.engine();
        for (method, handler) in &blueprint.request_handlers {
            engine.set_request_handler_arc(method.clone(), handler.clone());
        }
        for (method, handler) in &blueprint.notification_handlers {
            engine.set_notification_handler_arc(method.clone(), handler.clone());
        }
        if let Some(authenticator) = &blueprint.authenticator {
            engine.set_authenticator(authenticator.clone());
        }
        engine.set_auth_requirements(blueprint.auth.clone());
        server
    }
}
