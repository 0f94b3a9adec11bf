//! One JSON document per WebSocket text frame, with an optional ping/pong
//! heartbeat.

use super::{bearer_token, HandlerSlot, Transport, TransportHandlers};
use crate::config::WebSocketConfig;
use crate::error::{TransportError, TransportResult};
use crate::server::ServerFactory;
use crate::sync::lock;
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::{CapacityError, Error as WsError};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig as WsConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
type WsSource = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

const OUTBOUND_QUEUE: usize = 100;

/// WebSocket transport, client or server side.
pub struct WebSocketTransport {
    shared: Arc<Shared>,
}

struct Shared {
    config: WebSocketConfig,
    credentials: Option<String>,
    socket: Mutex<Option<(WsSink, WsSource)>>,
    outbound: std::sync::Mutex<Option<mpsc::Sender<Message>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    slot: HandlerSlot,
    started: AtomicBool,
    closing: AtomicBool,
    stop: CancellationToken,
}

impl WebSocketTransport {
    /// Open a client connection to `url`.
    ///
    /// The configured bearer token, if any, rides on the upgrade request.
    pub async fn connect(url: &str, config: WebSocketConfig) -> TransportResult<Self> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::ConnectionRefused(format!("invalid url {}: {}", url, e)))?;
        if let Some(token) = &config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;
            request.headers_mut().insert("authorization", value);
        }

        debug!(%url, "connecting websocket");
        let connect = tokio_tungstenite::connect_async_with_config(
            request,
            Some(ws_config(&config)),
            false,
        );
        let (stream, response) = tokio::time::timeout(config.connect_timeout(), connect)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(handshake_error)?;
        debug!(status = %response.status(), "websocket connected");

        let (sink, source) = stream.split();
        Ok(Self::from_parts(
            Box::pin(sink),
            Box::pin(source),
            config.auth_token.clone(),
            config,
        ))
    }

    /// Wrap an already-upgraded server-side socket.
    pub fn accepted<S>(
        stream: tokio_tungstenite::WebSocketStream<S>,
        config: WebSocketConfig,
        credentials: Option<String>,
    ) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, source) = stream.split();
        Self::from_parts(Box::pin(sink), Box::pin(source), credentials, config)
    }

    fn from_parts(
        sink: WsSink,
        source: WsSource,
        credentials: Option<String>,
        config: WebSocketConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                credentials,
                socket: Mutex::new(Some((sink, source))),
                outbound: std::sync::Mutex::new(None),
                writer: Mutex::new(None),
                slot: HandlerSlot::default(),
                started: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                stop: CancellationToken::new(),
            }),
        }
    }
}

fn ws_config(config: &WebSocketConfig) -> WsConfig {
    let mut ws = WsConfig::default();
    ws.max_message_size = Some(config.max_message_bytes);
    ws.max_frame_size = Some(config.max_message_bytes);
    ws
}

fn handshake_error(err: WsError) -> TransportError {
    match err {
        WsError::Io(io) => io.into(),
        WsError::Http(response) => {
            TransportError::HandshakeFailed(format!("server answered {}", response.status()))
        }
        other => TransportError::HandshakeFailed(other.to_string()),
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn start(&self) -> TransportResult<()> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (sink, source) = self
            .shared
            .socket
            .lock()
            .await
            .take()
            .ok_or(TransportError::Closed)?;

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        *lock(&self.shared.outbound) = Some(tx);
        *self.shared.writer.lock().await = Some(tokio::spawn(write_loop(
            self.shared.clone(),
            sink,
            rx,
        )));
        tokio::spawn(read_loop(self.shared.clone(), source));
        Ok(())
    }

    async fn send(&self, frame: Vec<u8>) -> TransportResult<()> {
        if self.shared.closing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let text = String::from_utf8(frame)
            .map_err(|_| TransportError::Framing("frame is not valid UTF-8".to_string()))?;
        self.shared.queue(Message::Text(text)).await
    }

    async fn close(&self) -> TransportResult<()> {
        self.shared.shutdown(None).await;
        Ok(())
    }

    fn set_handlers(&self, handlers: TransportHandlers) {
        self.shared.slot.set(handlers);
    }

    fn is_connected(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst) && !self.shared.closing.load(Ordering::SeqCst)
    }

    fn credentials(&self) -> Option<String> {
        self.shared.credentials.clone()
    }
}

impl Shared {
    async fn queue(&self, message: Message) -> TransportResult<()> {
        let sender = lock(&self.outbound)
            .clone()
            .ok_or(TransportError::Closed)?;
        sender.send(message).await.map_err(|_| TransportError::Closed)
    }

    /// Send a close frame, let the writer drain, then fire `on_close`.
    async fn shutdown(&self, frame: Option<CloseFrame<'static>>) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.cancel();
        if let Some(sender) = lock(&self.outbound).take() {
            let frame = frame.unwrap_or(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            });
            let _ = sender.try_send(Message::Close(Some(frame)));
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            if tokio::time::timeout(self.config.close_grace(), &mut writer)
                .await
                .is_err()
            {
                warn!("websocket writer did not flush within the grace period");
                writer.abort();
            }
        }

        self.slot.emit_close();
    }

    async fn fail(&self, error: TransportError, frame: Option<CloseFrame<'static>>) {
        self.slot.emit_error(error);
        self.shutdown(frame).await;
    }
}

async fn write_loop(shared: Arc<Shared>, mut sink: WsSink, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Message::Text(text) = &message {
            trace!(frame = %text, "websocket write");
        }
        if let Err(err) = sink.send(message).await {
            if !closing {
                shared
                    .slot
                    .emit_error(TransportError::Io(format!("websocket write failed: {}", err)));
            }
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(shared: Arc<Shared>, mut source: WsSource) {
    let limit = shared.config.max_message_bytes;
    let period = shared.config.heartbeat_interval();
    // A disabled heartbeat still needs a timer to select on.
    let tick = period.unwrap_or(Duration::from_secs(3600));
    let mut heartbeat = tokio::time::interval_at(Instant::now() + tick, tick);
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = shared.stop.cancelled() => return,
            _ = heartbeat.tick(), if period.is_some() => {
                if last_pong.elapsed() > tick * 2 {
                    warn!(interval = ?tick, "websocket heartbeat timed out");
                    shared.fail(TransportError::HeartbeatTimeout, None).await;
                    return;
                }
                if shared.queue(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            next = source.next() => match next {
                Some(Ok(Message::Text(text))) => {
                    if text.len() > limit {
                        oversize(&shared, text.len(), limit).await;
                        return;
                    }
                    shared.slot.emit_message(text.into_bytes());
                }
                Some(Ok(Message::Binary(data))) => {
                    debug!(len = data.len(), "rejecting binary websocket frame");
                    shared.slot.emit_error(TransportError::UnsupportedFrame(
                        "binary frames are not supported".to_string(),
                    ));
                }
                Some(Ok(Message::Pong(_))) => last_pong = Instant::now(),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "websocket closed by peer");
                    break;
                }
                Some(Err(WsError::Capacity(CapacityError::MessageTooLong { size, max_size }))) => {
                    oversize(&shared, size, max_size).await;
                    return;
                }
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) | None => {
                    debug!("websocket stream ended");
                    break;
                }
                Some(Err(err)) => {
                    shared
                        .slot
                        .emit_error(TransportError::Io(format!("websocket read failed: {}", err)));
                    break;
                }
            }
        }
    }

    shared.shutdown(None).await;
}

async fn oversize(shared: &Shared, size: usize, limit: usize) {
    warn!(size, limit, "websocket message exceeds limit");
    let frame = CloseFrame {
        code: CloseCode::Size,
        reason: "message too large".into(),
    };
    shared
        .fail(TransportError::MessageTooLarge { size, limit }, Some(frame))
        .await;
}

/// Accept WebSocket connections on `listener`, one server session each.
///
/// Runs until the listener fails.
pub async fn serve_websocket(
    listener: TcpListener,
    factory: ServerFactory,
    config: WebSocketConfig,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "websocket server listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let factory = factory.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let mut credentials = None;
            let callback = |request: &Request, response: Response| {
                credentials = request
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .and_then(bearer_token);
                Ok::<_, ErrorResponse>(response)
            };
            let socket = match tokio_tungstenite::accept_hdr_async_with_config(
                stream,
                callback,
                Some(ws_config(&config)),
            )
            .await
            {
                Ok(socket) => socket,
                Err(err) => {
                    warn!(%peer, error = %err, "websocket handshake failed");
                    return;
                }
            };

            debug!(%peer, "websocket session opened");
            let transport = WebSocketTransport::accepted(socket, config, credentials);
            let server = factory.create();
            if let Err(err) = server.serve(Arc::new(transport)).await {
                warn!(%peer, error = %err, "websocket session failed");
            }
            debug!(%peer, "websocket session closed");
        });
    }
}
