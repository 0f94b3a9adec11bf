//! `tether serve`: an echo endpoint over any transport.

use super::TransportKind;
use serde_json::{json, Value};
use std::sync::Arc;
use tether_mcp::{
    serve_http, serve_websocket, AuthContext, Capabilities, Capability, HandlerError,
    Implementation, RequestContext, ServerBuilder, ServerConfig, ServerFactory,
    StaticTokenAuthenticator, StdioTransport, TetherConfig,
};
use tether_util::TimingGuard;
use tokio::net::TcpListener;
use tracing::info;

const DEFAULT_WS_BIND: &str = "127.0.0.1:8765";
const TOOLS_SCOPE: &str = "tools";

pub async fn run(
    mut config: TetherConfig,
    transport: TransportKind,
    bind: Option<String>,
    token: Option<String>,
) -> anyhow::Result<()> {
    let factory = echo_server(&config.server, token.as_deref())?;

    match transport {
        TransportKind::Stdio => {
            if token.is_some() {
                config.stdio.auth_token = token;
            }
            let server = factory.create();
            let transport = Arc::new(StdioTransport::process(config.stdio));
            tokio::select! {
                result = server.serve(transport) => result?,
                _ = tokio::signal::ctrl_c() => server.close().await?,
            }
        }
        TransportKind::Ws => {
            let addr = bind.unwrap_or_else(|| DEFAULT_WS_BIND.to_string());
            let listener = TcpListener::bind(&addr).await?;
            info!(addr = %listener.local_addr()?, "serving websocket");
            tokio::select! {
                result = serve_websocket(listener, factory, config.websocket) => result?,
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        TransportKind::Http => {
            let addr = bind.unwrap_or_else(|| config.http.bind.clone());
            let listener = TcpListener::bind(&addr).await?;
            info!(addr = %listener.local_addr()?, path = %config.http.path, "serving http");
            tokio::select! {
                result = serve_http(listener, factory, config.http) => result?,
                _ = tokio::signal::ctrl_c() => {}
            }
        }
    }

    info!("shut down");
    Ok(())
}

/// Build the echo server. With a token, `tools/call` requires it.
pub fn echo_server(config: &ServerConfig, token: Option<&str>) -> anyhow::Result<ServerFactory> {
    let mut builder = ServerBuilder::new(Implementation::new(&config.name, &config.version))
        .capabilities(Capabilities::new().with(Capability::Tools))
        .request_handler("tools/list", |_ctx: RequestContext| async {
            let _timing = TimingGuard::request("tools/list");
            Ok(list_tools())
        })
        .request_handler("tools/call", call_tool);

    if let Some(instructions) = &config.instructions {
        builder = builder.instructions(instructions.clone());
    }
    if let Some(token) = token {
        let authenticator = StaticTokenAuthenticator::new().with_token(
            token,
            AuthContext::new("operator", "tether-cli").with_scopes([TOOLS_SCOPE]),
        );
        builder = builder
            .authenticator(Arc::new(authenticator))
            .require_auth("tools/call", [TOOLS_SCOPE]);
    }

    Ok(builder.build()?)
}

fn list_tools() -> Value {
    json!({
        "tools": [{
            "name": "echo",
            "description": "Return the given text unchanged",
            "inputSchema": {
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }
        }]
    })
}

async fn call_tool(ctx: RequestContext) -> Result<Value, HandlerError> {
    let params: Value = ctx.params_as()?;
    let name = params["name"].as_str().unwrap_or_default();
    let _timing = TimingGuard::tool(name);

    if name != "echo" {
        return Err(HandlerError::invalid_params(format!("Unknown tool: {}", name)));
    }
    let text = params["arguments"]["text"]
        .as_str()
        .ok_or_else(|| HandlerError::invalid_params("echo needs a string 'text' argument"))?;

    Ok(json!({"content": [{"type": "text", "text": text}], "isError": false}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_mcp::{Client, MemoryTransport};

    /// The server handle is dropped here; the session lives on with its transport.
    async fn connected(factory: &ServerFactory) -> Client {
        let (client_end, server_end) = MemoryTransport::pair();
        factory.create().connect(server_end).await.unwrap();
        let client = Client::new(Implementation::new("test", "0"));
        client.connect(client_end).await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_echo_tool() {
        let factory = echo_server(&ServerConfig::default(), None).unwrap();
        let client = connected(&factory).await;

        let tools = client.request("tools/list", None).await.unwrap();
        assert_eq!(tools["tools"][0]["name"], "echo");

        let result = client
            .request(
                "tools/call",
                Some(json!({"name": "echo", "arguments": {"text": "hello"}})),
            )
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "hello");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_invalid_params() {
        let factory = echo_server(&ServerConfig::default(), None).unwrap();
        let client = connected(&factory).await;

        let err = client
            .request("tools/call", Some(json!({"name": "rm", "arguments": {}})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unknown tool"));
    }

    #[tokio::test]
    async fn test_token_guards_tools_call() {
        let factory = echo_server(&ServerConfig::default(), Some("s3cret")).unwrap();
        let client = connected(&factory).await;

        client.request("tools/list", None).await.unwrap();
        let err = client
            .request(
                "tools/call",
                Some(json!({"name": "echo", "arguments": {"text": "x"}})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, tether_mcp::McpError::Rpc(ref e) if e.code == -32001));
    }
}
