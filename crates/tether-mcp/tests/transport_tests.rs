//! Transport integration tests.
//!
//! Real loopback sockets for WebSocket and streamable HTTP, duplex pipes for
//! stdio, with a client and server session on top where it matters.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_mcp::transport::SESSION_HEADER;
use tether_mcp::{
    create_router, serve_websocket, AuthContext, Capabilities, Capability, Client, HttpConfig,
    Implementation, McpError, RequestContext, ServerBuilder, ServerFactory, StaticTokenAuthenticator,
    StdioConfig, StdioTransport, StreamableHttpClientTransport, StreamableHttpState, Transport,
    TransportError, TransportHandlers, WebSocketConfig, WebSocketTransport,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

fn echo_factory(calls: Arc<AtomicUsize>) -> ServerFactory {
    ServerBuilder::new(Implementation::new("echo-server", "1.0.0"))
        .capabilities(Capabilities::new().with(Capability::Tools))
        .request_handler("tools/list", |_ctx: RequestContext| async {
            Ok(json!({"tools": [{"name": "echo"}, {"name": "announce"}]}))
        })
        .request_handler("tools/call", move |ctx: RequestContext| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let params: Value = ctx.params_as()?;
                if params["name"] == "announce" {
                    ctx.engine()
                        .send_notification(
                            "notifications/message",
                            Some(json!({"level": "info", "data": "announced"})),
                        )
                        .await
                        .map_err(anyhow::Error::from)?;
                }
                Ok(json!({"content": [{"type": "text", "text": params["arguments"]["text"]}]}))
            }
        })
        .build()
        .expect("Failed to build server")
}

fn client() -> Client {
    Client::new(Implementation::new("test-client", "0.1.0"))
}

async fn echo(client: &Client, text: &str) -> Value {
    let result = client
        .request(
            "tools/call",
            Some(json!({"name": "echo", "arguments": {"text": text}})),
        )
        .await
        .expect("tools/call failed");
    result["content"][0]["text"].clone()
}

enum Event {
    Message(Vec<u8>),
    Error(TransportError),
    Close,
}

fn wire(transport: &dyn Transport) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    let (m, e, c) = (tx.clone(), tx.clone(), tx);
    transport.set_handlers(
        TransportHandlers::new()
            .on_message(move |frame| {
                let _ = m.send(Event::Message(frame));
            })
            .on_error(move |err| {
                let _ = e.send(Event::Error(err));
            })
            .on_close(move || {
                let _ = c.send(Event::Close);
            }),
    );
    rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("Timed out waiting for transport event")
        .expect("Event channel closed")
}

// ============================================================================
// Stdio
// ============================================================================

#[tokio::test]
async fn test_stdio_session_over_duplex() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_io);
    let (server_read, server_write) = tokio::io::split(server_io);

    let server = echo_factory(Arc::default()).create();
    server
        .connect(Arc::new(StdioTransport::new(
            server_read,
            server_write,
            StdioConfig::default(),
        )))
        .await
        .expect("Failed to connect server");

    let client = client();
    client
        .connect(Arc::new(StdioTransport::new(
            client_read,
            client_write,
            StdioConfig::default(),
        )))
        .await
        .expect("Handshake failed");

    assert_eq!(echo(&client, "over a pipe").await, "over a pipe");
    client.close().await.expect("Failed to close");
}

// ============================================================================
// WebSocket
// ============================================================================

async fn ws_server(factory: ServerFactory) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("No local addr");
    tokio::spawn(serve_websocket(listener, factory, WebSocketConfig::default()));
    format!("ws://{}", addr)
}

#[tokio::test]
async fn test_websocket_session() {
    let url = ws_server(echo_factory(Arc::default())).await;
    let transport = WebSocketTransport::connect(&url, WebSocketConfig::default())
        .await
        .expect("Failed to connect");

    let client = client();
    client
        .connect(Arc::new(transport))
        .await
        .expect("Handshake failed");
    assert_eq!(echo(&client, "framed").await, "framed");
    client.ping().await.expect("ping failed");
    client.close().await.expect("Failed to close");
}

#[tokio::test]
async fn test_websocket_bearer_token_reaches_authenticator() {
    let factory = ServerBuilder::new(Implementation::new("secure", "1.0.0"))
        .capabilities(Capabilities::new().with(Capability::Tools))
        .request_handler("tools/call", |ctx: RequestContext| async move {
            Ok(json!({"caller": ctx.auth.map(|a| a.subject_id)}))
        })
        .authenticator(Arc::new(StaticTokenAuthenticator::new().with_token(
            "s3cret",
            AuthContext::new("alice", "ws").with_scopes(["tools"]),
        )))
        .require_auth("tools/call", ["tools"])
        .build()
        .expect("Failed to build server");
    let url = ws_server(factory).await;

    let config = WebSocketConfig {
        auth_token: Some("s3cret".to_string()),
        ..Default::default()
    };
    let client = client();
    client
        .connect(Arc::new(
            WebSocketTransport::connect(&url, config)
                .await
                .expect("Failed to connect"),
        ))
        .await
        .expect("Handshake failed");
    let result = client
        .request("tools/call", Some(json!({"name": "whoami"})))
        .await
        .expect("Authenticated call failed");
    assert_eq!(result["caller"], "alice");
}

/// A peer that completes the upgrade but never reads never answers pings.
#[tokio::test]
async fn test_websocket_heartbeat_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("No local addr");
    let (hold_tx, mut hold_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("Accept failed");
        let socket = tokio_tungstenite::accept_async(stream)
            .await
            .expect("Upgrade failed");
        let _ = hold_tx.send(socket);
    });

    let config = WebSocketConfig {
        heartbeat_interval_ms: 10,
        ..Default::default()
    };
    let transport = WebSocketTransport::connect(&format!("ws://{}", addr), config)
        .await
        .expect("Failed to connect");
    let _silent_peer = hold_rx.recv().await.expect("Server never accepted");
    let mut events = wire(&transport);
    transport.start().await.expect("Failed to start");

    assert!(matches!(
        next_event(&mut events).await,
        Event::Error(TransportError::HeartbeatTimeout)
    ));
    assert!(matches!(next_event(&mut events).await, Event::Close));
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_websocket_rejects_binary_and_oversize_frames() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("No local addr");
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("Accept failed");
        let mut socket = tokio_tungstenite::accept_async(stream)
            .await
            .expect("Upgrade failed");
        socket
            .send(Message::Binary(vec![1, 2, 3]))
            .await
            .expect("Send failed");
        socket
            .send(Message::Text(r#"{"jsonrpc":"2.0","method":"ok"}"#.to_string()))
            .await
            .expect("Send failed");
        socket
            .send(Message::Text(format!(r#"{{"pad":"{}"}}"#, "x".repeat(256))))
            .await
            .expect("Send failed");
        while socket.next().await.is_some() {}
    });

    let config = WebSocketConfig {
        heartbeat_interval_ms: 0,
        max_message_bytes: 128,
        ..Default::default()
    };
    let transport = WebSocketTransport::connect(&format!("ws://{}", addr), config)
        .await
        .expect("Failed to connect");
    let mut events = wire(&transport);
    transport.start().await.expect("Failed to start");

    assert!(matches!(
        next_event(&mut events).await,
        Event::Error(TransportError::UnsupportedFrame(_))
    ));
    match next_event(&mut events).await {
        Event::Message(frame) => assert_eq!(frame, br#"{"jsonrpc":"2.0","method":"ok"}"#),
        _ => panic!("Expected the text frame to survive the binary one"),
    }
    assert!(matches!(
        next_event(&mut events).await,
        Event::Error(TransportError::MessageTooLarge { limit: 128, .. })
    ));
    assert!(matches!(next_event(&mut events).await, Event::Close));
}

// ============================================================================
// Streamable HTTP
// ============================================================================

async fn http_server(factory: ServerFactory, json_response: bool) -> (String, StreamableHttpState) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("No local addr");
    let config = HttpConfig {
        json_response,
        ..Default::default()
    };
    let state = StreamableHttpState::new(factory, config);
    let router = create_router(state.clone());
    tokio::spawn(async move { axum::serve(listener, router).await });
    (format!("http://{}/mcp", addr), state)
}

async fn http_client(url: &str) -> Client {
    let transport = StreamableHttpClientTransport::new(url, HttpConfig::default())
        .expect("Failed to create transport");
    let client = client();
    client
        .connect(Arc::new(transport))
        .await
        .expect("Handshake failed");
    client
}

#[tokio::test]
async fn test_http_sse_session() {
    let (url, state) = http_server(echo_factory(Arc::default()), false).await;
    let client = http_client(&url).await;

    assert_eq!(echo(&client, "streamed").await, "streamed");
    let session = client
        .engine()
        .transport()
        .and_then(|t| t.session_id())
        .expect("No session id");
    assert!(!session.is_empty());
    assert_eq!(state.session_count().await, 1);

    client.close().await.expect("Failed to close");
    for _ in 0..100 {
        if state.session_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state.session_count().await, 0);
}

#[tokio::test]
async fn test_http_json_session() {
    let (url, _state) = http_server(echo_factory(Arc::default()), true).await;
    let client = http_client(&url).await;
    assert_eq!(echo(&client, "plain json").await, "plain json");
    let tools = client
        .request("tools/list", None)
        .await
        .expect("tools/list failed");
    assert_eq!(tools["tools"].as_array().map(Vec::len), Some(2));
}

/// Server-originated messages travel on the standalone GET stream.
#[tokio::test]
async fn test_http_standalone_stream_delivers_notifications() {
    let (url, _state) = http_server(echo_factory(Arc::default()), false).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = client();
    client
        .register_capabilities(Capabilities::new().with(Capability::Logging))
        .expect("Failed to register capabilities");
    client
        .set_notification_handler("notifications/message", move |ctx| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(ctx.params);
            }
        })
        .expect("Failed to register handler");
    let transport = StreamableHttpClientTransport::new(&url, HttpConfig::default())
        .expect("Failed to create transport");
    client
        .connect(Arc::new(transport))
        .await
        .expect("Handshake failed");

    client
        .request(
            "tools/call",
            Some(json!({"name": "announce", "arguments": {"text": "x"}})),
        )
        .await
        .expect("tools/call failed");

    let params = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Notification never arrived")
        .expect("Channel closed")
        .expect("Notification without params");
    assert_eq!(params["data"], "announced");
}

/// Requests naming no session, or an unknown one, never reach a handler.
#[tokio::test]
async fn test_http_rejects_invalid_session_before_handlers() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (url, _state) = http_server(echo_factory(calls.clone()), true).await;
    let client = http_client(&url).await;
    assert_eq!(echo(&client, "once").await, "once");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let http = reqwest::Client::new();
    let call = json!({
        "jsonrpc": "2.0",
        "id": 99,
        "method": "tools/call",
        "params": {"name": "echo", "arguments": {"text": "sneaky"}}
    });

    let missing = http
        .post(&url)
        .header("accept", "application/json, text/event-stream")
        .json(&call)
        .send()
        .await
        .expect("POST failed");
    assert_eq!(missing.status(), reqwest::StatusCode::BAD_REQUEST);

    let wrong = http
        .post(&url)
        .header(SESSION_HEADER, "S2-not-issued")
        .header("accept", "application/json, text/event-stream")
        .json(&call)
        .send()
        .await
        .expect("POST failed");
    assert_eq!(wrong.status(), reqwest::StatusCode::NOT_FOUND);
    let body: Value = wrong.json().await.expect("Error body is not JSON");
    assert_eq!(body["error"]["code"], -32600);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// A client whose session was dropped server-side sees `InvalidSession`.
#[tokio::test]
async fn test_http_client_reports_expired_session() {
    let (url, state) = http_server(echo_factory(Arc::default()), true).await;
    let client = http_client(&url).await;
    let session = client
        .engine()
        .transport()
        .and_then(|t| t.session_id())
        .expect("No session id");

    reqwest::Client::new()
        .delete(&url)
        .header(SESSION_HEADER, &session)
        .send()
        .await
        .expect("DELETE failed");
    assert_eq!(state.session_count().await, 0);

    let err = client
        .request("tools/list", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        McpError::Transport(TransportError::InvalidSession(_))
    ));
}
