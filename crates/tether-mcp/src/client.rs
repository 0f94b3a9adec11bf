//! Client role: drives the `initialize` handshake and guards outbound requests.

use crate::capability::{Capabilities, Role};
use crate::engine::{
    EngineOptions, NotificationContext, ProtocolEngine, RequestContext, RequestOptions,
    DEFAULT_REQUEST_TIMEOUT,
};
use crate::error::{HandlerError, McpError, McpResult};
use crate::protocol::{
    negotiate_version, Implementation, InitializeParams, InitializeResult,
    LATEST_PROTOCOL_VERSION, METHOD_INITIALIZE, METHOD_PING, NOTIFICATION_INITIALIZED,
};
use crate::session::{self, SessionState};
use crate::sync::{read, write};
use crate::transport::Transport;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Client construction options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub capabilities: Capabilities,
    pub request_timeout: Duration,
    /// Version proposed in `initialize`.
    pub protocol_version: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            capabilities: Capabilities::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
        }
    }
}

#[derive(Debug)]
struct ClientSession {
    state: SessionState,
    capabilities: Capabilities,
    server_capabilities: Option<Capabilities>,
    server_info: Option<Implementation>,
    protocol_version: Option<String>,
    instructions: Option<String>,
}

/// One client session over one transport.
#[derive(Clone)]
pub struct Client {
    engine: ProtocolEngine,
    info: Implementation,
    proposed_version: String,
    session: Arc<RwLock<ClientSession>>,
}

impl Client {
    pub fn new(info: Implementation) -> Self {
        Self::with_options(info, ClientOptions::default())
    }

    pub fn with_options(info: Implementation, options: ClientOptions) -> Self {
        let engine = ProtocolEngine::new(EngineOptions {
            name: "client".to_string(),
            default_timeout: options.request_timeout,
        });
        Self {
            engine,
            info,
            proposed_version: options.protocol_version,
            session: Arc::new(RwLock::new(ClientSession {
                state: SessionState::Uninitialized,
                capabilities: options.capabilities,
                server_capabilities: None,
                server_info: None,
                protocol_version: None,
                instructions: None,
            })),
        }
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

    /// Add local capabilities. Only legal before `connect`.
    pub fn register_capabilities(&self, capabilities: Capabilities) -> McpResult<()> {
        let mut session = write(&self.session);
        session::check_registration(Role::Client, session.state)?;
        session.capabilities.merge(&capabilities);
        Ok(())
    }

    pub fn capabilities(&self) -> Capabilities {
        read(&self.session).capabilities.clone()
    }

    pub fn server_capabilities(&self) -> Option<Capabilities> {
        read(&self.session).server_capabilities.clone()
    }

    pub fn server_info(&self) -> Option<Implementation> {
        read(&self.session).server_info.clone()
    }

    /// Negotiated protocol version.
    pub fn protocol_version(&self) -> Option<String> {
        read(&self.session).protocol_version.clone()
    }

    pub fn instructions(&self) -> Option<String> {
        read(&self.session).instructions.clone()
    }

    /// Attach `transport` and run the `initialize` handshake.
    ///
    /// On failure the connection is closed.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> McpResult<InitializeResult> {
        if self.state() != SessionState::Uninitialized {
            return Err(McpError::contract("client is already connected"));
        }
        self.engine.attach(transport).await?;

        match self.handshake().await {
            Ok(result) => Ok(result),
            Err(err) => {
                warn!(error = %err, "initialize handshake failed");
                let _ = self.engine.close().await;
                Err(err)
            }
        }
    }

    async fn handshake(&self) -> McpResult<InitializeResult> {
        let params = {
            let mut session = write(&self.session);
            session.state = SessionState::Initializing;
            InitializeParams {
                protocol_version: self.proposed_version.clone(),
                capabilities: session.capabilities.clone(),
                client_info: self.info.clone(),
            }
        };

        debug!(version = %params.protocol_version, "sending initialize");
        let response = self
            .engine
            .send_request(
                METHOD_INITIALIZE,
                Some(serde_json::to_value(&params)?),
                RequestOptions::new(),
            )
            .await?;

        let mut result: InitializeResult = serde_json::from_value(response).map_err(|e| {
            McpError::protocol_error(format!("invalid initialize result: {}", e))
        })?;

        let negotiated = negotiate_version(&result.protocol_version);
        if negotiated != result.protocol_version {
            warn!(
                proposed = %result.protocol_version,
                using = negotiated,
                "server proposed an unsupported protocol version, falling back"
            );
            result.protocol_version = negotiated.to_string();
        }

        {
            let mut session = write(&self.session);
            session.server_capabilities = Some(result.capabilities.clone());
            session.server_info = Some(result.server_info.clone());
            session.protocol_version = Some(result.protocol_version.clone());
            session.instructions = result.instructions.clone();
        }

        self.engine
            .send_notification(NOTIFICATION_INITIALIZED, None)
            .await?;
        write(&self.session).state = SessionState::Initialized;

        info!(
            server = %result.server_info.name,
            server_version = %result.server_info.version,
            protocol = %result.protocol_version,
            "session initialized"
        );
        Ok(result)
    }

    /// Send a request with default options.
    pub async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        self.request_with(method, params, RequestOptions::new())
            .await
    }

    /// Send a request. Fails locally if the server lacks the needed capability.
    pub async fn request_with(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> McpResult<Value> {
        {
            let session = read(&self.session);
            session::check_request(
                Role::Client,
                session.state,
                method,
                session.server_capabilities.as_ref(),
            )?;
        }
        self.engine.send_request(method, params, options).await
    }

    /// Send a request and deserialize the result.
    pub async fn request_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> McpResult<T> {
        let value = self.request(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn ping(&self) -> McpResult<()> {
        self.request(METHOD_PING, None).await.map(|_| ())
    }

    /// Send a notification to the server.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        {
            let session = read(&self.session);
            session::check_notification(Role::Client, method, &session.capabilities)?;
        }
        self.engine.send_notification(method, params).await
    }

    /// Handle a server-to-client request. Needs the matching local capability.
    pub fn set_request_handler<F, Fut>(&self, method: &str, handler: F) -> McpResult<()>
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        session::check_handler(Role::Client, method, &read(&self.session).capabilities)?;
        self.engine.set_request_handler(method, handler);
        Ok(())
    }

    /// Handle a notification from the server. Needs the capability the peer
    /// would need to send it, registered locally.
    pub fn set_notification_handler<F, Fut>(&self, method: &str, handler: F) -> McpResult<()>
    where
        F: Fn(NotificationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        session::check_notification_handler(Role::Client, method, &read(&self.session).capabilities)?;
        self.engine.set_notification_handler(method, handler);
        Ok(())
    }

    pub async fn close(&self) -> McpResult<()> {
        self.engine.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;

    #[test]
    fn test_register_capabilities_before_connect() {
        let client = Client::new(Implementation::new("test", "1.0"));
        client
            .register_capabilities(Capabilities::new().with(Capability::Roots))
            .unwrap();
        client
            .register_capabilities(Capabilities::new().with(Capability::Sampling))
            .unwrap();
        let caps = client.capabilities();
        assert!(caps.supports(Capability::Roots));
        assert!(caps.supports(Capability::Sampling));
        assert_eq!(client.state(), SessionState::Uninitialized);
    }

    #[test]
    fn test_handler_requires_local_capability() {
        let client = Client::new(Implementation::new("test", "1.0"));
        let err = client
            .set_request_handler("roots/list", |_ctx: RequestContext| async {
                Ok(serde_json::json!({"roots": []}))
            })
            .unwrap_err();
        assert!(matches!(err, McpError::CapabilityNotSupported { .. }));

        client
            .register_capabilities(Capabilities::new().with(Capability::Roots))
            .unwrap();
        client
            .set_request_handler("roots/list", |_ctx: RequestContext| async {
                Ok(serde_json::json!({"roots": []}))
            })
            .unwrap();
        assert!(client.engine().has_request_handler("roots/list"));
    }

    #[test]
    fn test_notification_handler_requires_local_capability() {
        let client = Client::new(Implementation::new("test", "1.0"));
        let err = client
            .set_notification_handler("notifications/message", |_ctx: NotificationContext| async {})
            .unwrap_err();
        assert!(matches!(
            err,
            McpError::CapabilityNotSupported { ref capability, .. } if capability == "logging"
        ));

        client
            .set_notification_handler("notifications/custom", |_ctx: NotificationContext| async {})
            .unwrap();

        client
            .register_capabilities(Capabilities::new().with(Capability::Logging))
            .unwrap();
        client
            .set_notification_handler("notifications/message", |_ctx: NotificationContext| async {})
            .unwrap();
    }

    #[tokio::test]
    async fn test_request_before_connect_is_not_initialized() {
        let client = Client::new(Implementation::new("test", "1.0"));
        let err = client.request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, McpError::NotInitialized(_)));
    }
}
