//! Bidirectional JSON-RPC 2.0 protocol engine for connecting hosts to tool,
//! resource and prompt providers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐     ┌────────────────┐     ┌───────────┐
//! │  Client  │────▶│ ProtocolEngine │────▶│ Transport │──── stdio / WebSocket / HTTP
//! │  Server  │◀────│  (correlation) │◀────│  (frames) │
//! └──────────┘     └────────────────┘     └───────────┘
//! ```
//!
//! [`Client`] and [`Server`] own the session: the `initialize` handshake and
//! the capability guards. The [`ProtocolEngine`] underneath assigns ids,
//! correlates responses, enforces timeouts and cancellation, and dispatches
//! inbound messages. A [`Transport`] only moves whole frames.
//!
//! # Supported Transports
//!
//! - **stdio**: newline-delimited JSON over a pipe or a child process
//! - **WebSocket**: one text frame per message, with a ping/pong heartbeat
//! - **Streamable HTTP**: POST per message, answered with JSON or an SSE
//!   stream, plus a resumable standalone event stream
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether_mcp::{Client, Implementation, StdioCommand, StdioConfig, StdioTransport};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let command = StdioCommand::parse("tether serve --transport stdio").unwrap_or_default();
//! let transport = StdioTransport::spawn(&command, StdioConfig::default())?;
//!
//! let client = Client::new(Implementation::new("example", "1.0.0"));
//! let init = client.connect(Arc::new(transport)).await?;
//! println!("connected to {}", init.server_info.name);
//!
//! let tools = client.request("tools/list", None).await?;
//! println!("{tools}");
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod capability;
mod client;
pub mod config;
pub mod engine;
mod error;
pub mod http_serve;
pub mod protocol;
mod server;
mod session;
mod sync;
pub mod transport;

pub use auth::{AuthContext, AuthDenial, Authenticator, StaticTokenAuthenticator};
pub use capability::{Capabilities, Capability, Role};
pub use client::{Client, ClientOptions};
pub use config::{HttpConfig, ServerConfig, StdioConfig, TetherConfig, WebSocketConfig};
pub use engine::{
    NotificationContext, ProtocolEngine, RequestContext, RequestOptions, DEFAULT_REQUEST_TIMEOUT,
};
pub use error::{
    ErrorCode, HandlerError, McpError, McpResult, TransportError, TransportResult,
};
pub use http_serve::{create_router, serve_http, StreamableHttpState};
pub use protocol::{Envelope, Implementation, InitializeResult, RequestId, RpcError};
pub use server::{Server, ServerBuilder, ServerFactory, ServerOptions};
pub use session::SessionState;
pub use transport::{
    serve_websocket, MemoryTransport, StdioCommand, StdioTransport,
    StreamableHttpClientTransport, Transport, TransportHandlers, WebSocketTransport,
};
