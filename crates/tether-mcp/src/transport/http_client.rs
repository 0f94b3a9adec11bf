//! Streamable HTTP client transport.
//!
//! Every outbound frame is a POST. The server answers with a JSON body, an
//! SSE stream carrying the responses, or `202 Accepted` for frames that need
//! no reply. Once a session exists, a standalone GET stream carries
//! server-initiated messages and is resumed with `Last-Event-ID`.

use super::{HandlerSlot, SseParser, Transport, TransportHandlers, LAST_EVENT_ID_HEADER, SESSION_HEADER};
use crate::config::HttpConfig;
use crate::error::{TransportError, TransportResult};
use crate::sync::{lock, read, write};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Streamable HTTP client transport.
pub struct StreamableHttpClientTransport {
    shared: Arc<Shared>,
}

struct Shared {
    url: String,
    config: HttpConfig,
    client: Client,
    session_id: RwLock<Option<String>>,
    last_event_id: RwLock<Option<String>>,
    slot: HandlerSlot,
    started: AtomicBool,
    closing: AtomicBool,
    stream_opened: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop: CancellationToken,
}

impl StreamableHttpClientTransport {
    pub fn new(url: impl Into<String>, config: HttpConfig) -> TransportResult<Self> {
        let url = url.into();
        url::Url::parse(&url)
            .map_err(|e| TransportError::Http(format!("invalid url {}: {}", url, e)))?;
        // No overall timeout: response streams stay open indefinitely.
        let client = Client::builder()
            .connect_timeout(config.timeout())
            .build()
            .map_err(|e| TransportError::Http(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            shared: Arc::new(Shared {
                url,
                config,
                client,
                session_id: RwLock::new(None),
                last_event_id: RwLock::new(None),
                slot: HandlerSlot::default(),
                started: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                stream_opened: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                stop: CancellationToken::new(),
            }),
        })
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }
}

#[async_trait]
impl Transport for StreamableHttpClientTransport {
    async fn start(&self) -> TransportResult<()> {
        if self.shared.closing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.shared.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, frame: Vec<u8>) -> TransportResult<()> {
        if self.shared.closing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let shared = &self.shared;
        trace!(frame = %String::from_utf8_lossy(&frame), "http post");

        let request = shared
            .with_session(shared.client.post(&shared.url))
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(frame);
        let response = request.send().await.map_err(request_error)?;

        let had_session = read(&shared.session_id).is_some();
        shared.capture_session(&response);
        let status = response.status();

        if status == StatusCode::ACCEPTED {
            shared.open_event_stream();
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND && had_session {
            warn!("http session expired");
            *write(&shared.session_id) = None;
            return Err(TransportError::InvalidSession(
                "server no longer knows this session".to_string(),
            ));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!(
                "server returned {}: {}",
                status, text
            )));
        }

        if is_event_stream(&response) {
            let stream_shared = shared.clone();
            shared.track(tokio::spawn(async move {
                read_events(&stream_shared, response).await;
            }));
        } else {
            let body = response
                .bytes()
                .await
                .map_err(|e| TransportError::Http(format!("failed to read response: {}", e)))?;
            for frame in split_json_body(&body)? {
                shared.slot.emit_message(frame);
            }
        }
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        let shared = &self.shared;
        if shared.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        shared.stop.cancel();

        let session = read(&shared.session_id).clone();
        if let Some(session) = session {
            let request = shared
                .client
                .delete(&shared.url)
                .header(SESSION_HEADER, session);
            let request = shared.with_auth(request);
            match tokio::time::timeout(shared.config.timeout(), request.send()).await {
                Ok(Ok(response)) if response.status() == StatusCode::METHOD_NOT_ALLOWED => {
                    debug!("server does not support session termination");
                }
                Ok(Ok(_)) => debug!("http session terminated"),
                Ok(Err(err)) => debug!(error = %err, "session termination failed"),
                Err(_) => debug!("session termination timed out"),
            }
        }

        for task in lock(&shared.tasks).drain(..) {
            task.abort();
        }
        shared.slot.emit_close();
        Ok(())
    }

    fn set_handlers(&self, handlers: TransportHandlers) {
        self.shared.slot.set(handlers);
    }

    fn is_connected(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst) && !self.shared.closing.load(Ordering::SeqCst)
    }

    fn session_id(&self) -> Option<String> {
        read(&self.shared.session_id).clone()
    }

    fn credentials(&self) -> Option<String> {
        self.shared.config.auth_token.clone()
    }
}

impl Shared {
    fn with_auth(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.auth_token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    fn with_session(&self, request: RequestBuilder) -> RequestBuilder {
        let request = self.with_auth(request);
        match read(&self.session_id).as_deref() {
            Some(session) => request.header(SESSION_HEADER, session),
            None => request,
        }
    }

    fn capture_session(&self, response: &Response) {
        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut current = write(&self.session_id);
            if current.as_deref() != Some(id) {
                debug!(session = %id, "http session established");
                *current = Some(id.to_string());
            }
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn open_event_stream(self: &Arc<Self>) {
        if !self.config.open_event_stream || read(&self.session_id).is_none() {
            return;
        }
        if self.stream_opened.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = self.clone();
        self.track(tokio::spawn(async move { event_stream_loop(shared).await }));
    }
}

fn request_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::ConnectionRefused(err.to_string())
    } else {
        TransportError::Http(format!("request failed: {}", err))
    }
}

fn is_event_stream(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"))
}

/// A JSON body holds one message or a batch; each becomes its own frame.
fn split_json_body(body: &[u8]) -> TransportResult<Vec<Vec<u8>>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| TransportError::Framing(format!("invalid JSON response: {}", e)))?;
    match value {
        Value::Array(items) => Ok(items
            .iter()
            .map(|item| item.to_string().into_bytes())
            .collect()),
        _ => Ok(vec![body.to_vec()]),
    }
}

/// Forward every `message` event on `response` until it ends.
async fn read_events(shared: &Shared, response: Response) {
    let mut parser = SseParser::new();
    let mut stream = response.bytes_stream();

    loop {
        let chunk = tokio::select! {
            _ = shared.stop.cancelled() => return,
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                for event in parser.push(&bytes) {
                    if let Some(id) = &event.id {
                        *write(&shared.last_event_id) = Some(id.clone());
                    }
                    if event.is_message() && !event.data.is_empty() {
                        shared.slot.emit_message(event.data.into_bytes());
                    }
                }
            }
            Some(Err(err)) => {
                debug!(error = %err, "event stream interrupted");
                return;
            }
            None => return,
        }
    }
}

async fn event_stream_loop(shared: Arc<Shared>) {
    let mut attempts = 0u32;
    loop {
        let mut request = shared
            .with_session(shared.client.get(&shared.url))
            .header(ACCEPT, "text/event-stream");
        if let Some(last) = read(&shared.last_event_id).clone() {
            request = request.header(LAST_EVENT_ID_HEADER, last);
        }

        let outcome = tokio::select! {
            _ = shared.stop.cancelled() => return,
            outcome = request.send() => outcome,
        };
        match outcome {
            Ok(response) if response.status() == StatusCode::METHOD_NOT_ALLOWED => {
                debug!("server offers no standalone event stream");
                return;
            }
            Ok(response) if response.status().is_success() => {
                debug!("standalone event stream open");
                attempts = 0;
                read_events(&shared, response).await;
            }
            Ok(response) => {
                warn!(status = %response.status(), "event stream rejected");
            }
            Err(err) => {
                warn!(error = %err, "event stream request failed");
            }
        }

        if shared.stop.is_cancelled() {
            return;
        }
        attempts += 1;
        if attempts > shared.config.max_reconnects {
            shared.slot.emit_error(TransportError::Http(
                "standalone event stream lost".to_string(),
            ));
            return;
        }
        let backoff = Duration::from_secs(1 << attempts.min(5)).min(MAX_BACKOFF);
        debug!(attempt = attempts, ?backoff, "reconnecting event stream");
        tokio::select! {
            _ = shared.stop.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}
