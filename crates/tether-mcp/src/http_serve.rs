//! Streamable HTTP server.
//!
//! One endpoint carries the whole protocol:
//!
//! ```text
//! Client                                   Server
//!   │                                        │
//!   │── POST /mcp  initialize ──────────────►│ (creates a session)
//!   │◄── 200 + Mcp-Session-Id ───────────────│ (JSON body or SSE stream)
//!   │                                        │
//!   │── POST /mcp  notification ────────────►│
//!   │◄── 202 Accepted ───────────────────────│
//!   │                                        │
//!   │── GET /mcp  (Last-Event-ID?) ─────────►│ (standalone event stream)
//!   │◄── SSE: server requests/notifications ─│
//!   │                                        │
//!   │── DELETE /mcp ────────────────────────►│ (ends the session)
//! ```
//!
//! Each session gets its own [`Server`] from the shared [`ServerFactory`].
//! Responses travel back on the POST that carried their request; frames the
//! server originates go to the standalone GET stream, or wait for it.
//!
//! A session with no open stream and no traffic for
//! [`HttpConfig::session_idle_timeout`] is closed by a background reaper.

use crate::config::HttpConfig;
use crate::error::{McpResult, TransportError, TransportResult};
use crate::protocol::{self, Envelope, RequestId, RpcError, METHOD_INITIALIZE};
use crate::server::{Server, ServerFactory};
use crate::sync::{lock, read, write};
use crate::transport::{
    bearer_token, HandlerSlot, Transport, TransportHandlers, LAST_EVENT_ID_HEADER, SESSION_HEADER,
};
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::post,
    Router,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Shared state behind the HTTP endpoint.
#[derive(Clone)]
pub struct StreamableHttpState {
    factory: ServerFactory,
    config: Arc<HttpConfig>,
    sessions: Arc<RwLock<SessionMap>>,
    reaper_started: Arc<AtomicBool>,
}

type SessionMap = HashMap<String, Arc<HttpSession>>;

struct HttpSession {
    id: String,
    server: Server,
    transport: Arc<HttpServerTransport>,
}

impl StreamableHttpState {
    pub fn new(factory: ServerFactory, config: HttpConfig) -> Self {
        Self {
            factory,
            config: Arc::new(config),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            reaper_started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn session(&self, id: &str) -> Option<Arc<HttpSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    async fn create_session(&self) -> McpResult<Arc<HttpSession>> {
        let id = uuid::Uuid::new_v4().to_string();
        let transport = Arc::new(HttpServerTransport::new(
            id.clone(),
            self.config.event_retention,
        ));
        let server = self.factory.create();

        let sessions = Arc::downgrade(&self.sessions);
        let closed = id.clone();
        server.engine().on_close(move || {
            if let Some(sessions) = Weak::upgrade(&sessions) {
                tokio::spawn(async move {
                    if sessions.write().await.remove(&closed).is_some() {
                        info!(session_id = %closed, "http session closed");
                    }
                });
            }
        });
        server.connect(transport.clone()).await?;
        self.spawn_reaper();

        let session = Arc::new(HttpSession {
            id: id.clone(),
            server,
            transport,
        });
        self.sessions.write().await.insert(id.clone(), session.clone());
        info!(session_id = %id, "http session created");
        Ok(session)
    }

    async fn remove_session(&self, id: &str) -> Option<Arc<HttpSession>> {
        self.sessions.write().await.remove(id)
    }

    /// Close every session idle longer than the configured timeout.
    /// Returns how many were closed.
    pub async fn reap_idle_sessions(&self) -> usize {
        match self.config.session_idle_timeout() {
            Some(timeout) => reap_idle(&self.sessions, timeout).await,
            None => 0,
        }
    }

    /// Start the idle-session reaper once. It stops when the state is dropped.
    fn spawn_reaper(&self) {
        let Some(timeout) = self.config.session_idle_timeout() else {
            return;
        };
        if self.reaper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let sessions = Arc::downgrade(&self.sessions);
        let period = (timeout / 2).clamp(Duration::from_millis(50), Duration::from_secs(30));
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(sessions) = sessions.upgrade() else {
                    return;
                };
                reap_idle(&sessions, timeout).await;
            }
        });
    }
}

async fn reap_idle(sessions: &RwLock<SessionMap>, timeout: Duration) -> usize {
    let now = Instant::now();
    let idle: Vec<Arc<HttpSession>> = {
        let mut sessions = sessions.write().await;
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| {
                s.transport
                    .idle_since()
                    .is_some_and(|since| now.saturating_duration_since(since) >= timeout)
            })
            .map(|s| s.id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| sessions.remove(id))
            .collect()
    };
    for session in &idle {
        info!(session_id = %session.id, ?timeout, "closing idle http session");
        if let Err(err) = session.server.close().await {
            warn!(session_id = %session.id, error = %err, "error closing idle session");
        }
    }
    idle.len()
}

// ============================================================================
// Per-session transport
// ============================================================================

/// One frame headed for an HTTP response.
struct Outbound {
    event_id: Option<u64>,
    frame: Vec<u8>,
}

struct PostStream {
    tx: mpsc::UnboundedSender<Outbound>,
    pending: HashSet<RequestId>,
    sse: bool,
}

#[derive(Default)]
struct Streams {
    next_event_id: u64,
    next_key: u64,
    routes: HashMap<RequestId, u64>,
    posts: HashMap<u64, PostStream>,
    standalone: Option<(u64, mpsc::UnboundedSender<Outbound>)>,
    /// Recent SSE events, for `Last-Event-ID` replay.
    log: VecDeque<(u64, Vec<u8>)>,
    /// Server-originated events no standalone stream has seen yet.
    undelivered: VecDeque<(u64, Vec<u8>)>,
}

impl Streams {
    fn record(&mut self, frame: &[u8], retention: usize) -> u64 {
        self.next_event_id += 1;
        let id = self.next_event_id;
        self.log.push_back((id, frame.to_vec()));
        while self.log.len() > retention {
            self.log.pop_front();
        }
        id
    }

    fn release_post(&mut self, key: u64) {
        if let Some(stream) = self.posts.remove(&key) {
            for id in stream.pending {
                self.routes.remove(&id);
            }
        }
    }
}

/// The transport behind one HTTP session.
struct HttpServerTransport {
    session_id: String,
    retention: usize,
    slot: HandlerSlot,
    started: AtomicBool,
    closing: AtomicBool,
    credentials: StdRwLock<Option<String>>,
    streams: Mutex<Streams>,
    last_active: Mutex<Instant>,
}

impl HttpServerTransport {
    fn new(session_id: String, retention: usize) -> Self {
        Self {
            session_id,
            retention: retention.max(1),
            slot: HandlerSlot::default(),
            started: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            credentials: StdRwLock::new(None),
            streams: Mutex::new(Streams::default()),
            last_active: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *lock(&self.last_active) = Instant::now();
    }

    /// When the session last saw traffic, or `None` while a stream is open.
    fn idle_since(&self) -> Option<Instant> {
        let streams = lock(&self.streams);
        let standalone_open = streams
            .standalone
            .as_ref()
            .is_some_and(|(_, tx)| !tx.is_closed());
        if standalone_open || !streams.posts.is_empty() {
            return None;
        }
        Some(*lock(&self.last_active))
    }

    fn set_credentials(&self, credentials: Option<String>) {
        *write(&self.credentials) = credentials;
    }

    /// Hand an inbound POST body to the engine.
    fn deliver(&self, frame: Vec<u8>) {
        self.touch();
        self.slot.emit_message(frame);
    }

    /// Route the responses to `requests` onto a new stream.
    fn open_post(&self, requests: &[RequestId], sse: bool) -> (u64, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut streams = lock(&self.streams);
        streams.next_key += 1;
        let key = streams.next_key;
        for id in requests {
            streams.routes.insert(id.clone(), key);
        }
        streams.posts.insert(
            key,
            PostStream {
                tx,
                pending: requests.iter().cloned().collect(),
                sse,
            },
        );
        (key, rx)
    }

    fn release_post(&self, key: u64) {
        lock(&self.streams).release_post(key);
        self.touch();
    }

    /// Open the standalone stream. `None` if one is already open.
    fn open_standalone(
        &self,
        last_event_id: Option<u64>,
    ) -> Option<(u64, mpsc::UnboundedReceiver<Outbound>)> {
        let mut streams = lock(&self.streams);
        if streams
            .standalone
            .as_ref()
            .is_some_and(|(_, tx)| !tx.is_closed())
        {
            return None;
        }

        // Event ids are shared with POST streams, so a resume point can lie
        // past events that never reached any stream. Those always go out.
        let (tx, rx) = mpsc::unbounded_channel();
        let mut replay: Vec<(u64, Vec<u8>)> = streams.undelivered.drain(..).collect();
        if let Some(last) = last_event_id {
            let queued: HashSet<u64> = replay.iter().map(|(id, _)| *id).collect();
            replay.extend(
                streams
                    .log
                    .iter()
                    .filter(|(id, _)| *id > last && !queued.contains(id))
                    .cloned(),
            );
            replay.sort_by_key(|(id, _)| *id);
        }
        debug!(session_id = %self.session_id, replayed = replay.len(), "standalone stream opened");
        for (id, frame) in replay {
            let _ = tx.send(Outbound {
                event_id: Some(id),
                frame,
            });
        }

        streams.next_key += 1;
        let key = streams.next_key;
        streams.standalone = Some((key, tx));
        drop(streams);
        self.touch();
        Some((key, rx))
    }

    fn release_standalone(&self, key: u64) {
        let mut streams = lock(&self.streams);
        if streams.standalone.as_ref().is_some_and(|(k, _)| *k == key) {
            streams.standalone = None;
        }
        drop(streams);
        self.touch();
    }

    fn send_standalone(&self, frame: Vec<u8>) {
        let mut streams = lock(&self.streams);
        let id = streams.record(&frame, self.retention);
        if let Some((_, tx)) = &streams.standalone {
            if tx
                .send(Outbound {
                    event_id: Some(id),
                    frame: frame.clone(),
                })
                .is_ok()
            {
                return;
            }
            streams.standalone = None;
        }
        streams.undelivered.push_back((id, frame));
        if streams.undelivered.len() > self.retention {
            warn!(session_id = %self.session_id, "no event stream attached, dropping oldest event");
            streams.undelivered.pop_front();
        }
    }
}

/// Ids answered by a response frame (single or batch).
fn answered_ids(frame: &[u8]) -> Vec<RequestId> {
    match protocol::decode(frame) {
        Ok(frame) => frame
            .envelopes()
            .iter()
            .filter(|e| e.is_response())
            .filter_map(|e| e.id().cloned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[async_trait]
impl Transport for HttpServerTransport {
    async fn start(&self) -> TransportResult<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, frame: Vec<u8>) -> TransportResult<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.send_standalone(frame);
        Ok(())
    }

    async fn send_related(&self, frame: Vec<u8>, related: &RequestId) -> TransportResult<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut guard = lock(&self.streams);
        let streams = &mut *guard;
        let Some(key) = streams.routes.get(related).copied() else {
            drop(guard);
            debug!(session_id = %self.session_id, id = %related, "no open request stream, using standalone stream");
            self.send_standalone(frame);
            return Ok(());
        };

        let sse = streams.posts.get(&key).is_some_and(|s| s.sse);
        let event_id = sse.then(|| streams.record(&frame, self.retention));
        let answered = answered_ids(&frame);

        let Some(stream) = streams.posts.get_mut(&key) else {
            return Ok(());
        };
        if stream.tx.send(Outbound { event_id, frame }).is_err() {
            debug!(session_id = %self.session_id, "client left before the response was sent");
            streams.release_post(key);
            return Ok(());
        }
        for id in answered {
            stream.pending.remove(&id);
            streams.routes.remove(&id);
        }
        if stream.pending.is_empty() {
            streams.posts.remove(&key);
        }
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut streams = lock(&self.streams);
            streams.posts.clear();
            streams.routes.clear();
            streams.standalone = None;
        }
        self.slot.emit_close();
        Ok(())
    }

    fn set_handlers(&self, handlers: TransportHandlers) {
        self.slot.set(handlers);
    }

    fn is_connected(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.closing.load(Ordering::SeqCst)
    }

    fn session_id(&self) -> Option<String> {
        Some(self.session_id.clone())
    }

    fn credentials(&self) -> Option<String> {
        read(&self.credentials).clone()
    }
}

/// Drops a stream's routing when the client goes away.
enum StreamGuard {
    Post(Arc<HttpServerTransport>, u64),
    Standalone(Arc<HttpServerTransport>, u64),
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        match self {
            StreamGuard::Post(transport, key) => transport.release_post(*key),
            StreamGuard::Standalone(transport, key) => transport.release_standalone(*key),
        }
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the router serving the protocol at `config.path`.
pub fn create_router(state: StreamableHttpState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(SESSION_HEADER)]);

    let path = state.config.path.clone();
    Router::new()
        .route(
            &path,
            post(handle_post).get(handle_get).delete(handle_delete),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `factory` over streamable HTTP until the listener fails.
pub async fn serve_http(
    listener: TcpListener,
    factory: ServerFactory,
    config: HttpConfig,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), path = %config.path, "http server listening");
    let router = create_router(StreamableHttpState::new(factory, config));
    axum::serve(listener, router).await
}

#[derive(Debug, Default, Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

fn requested_session(headers: &HeaderMap, query: &SessionQuery) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.session_id.clone())
}

fn rpc_error(status: StatusCode, error: RpcError) -> Response {
    json_body(
        status,
        protocol::encode(&Envelope::error_response(None, error)),
    )
}

fn json_body(status: StatusCode, body: Vec<u8>) -> Response {
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

fn with_session_header(mut response: Response, session_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

/// Look up the session a request names. Errors are ready-made responses.
async fn existing_session(
    state: &StreamableHttpState,
    headers: &HeaderMap,
    query: &SessionQuery,
) -> Result<Arc<HttpSession>, Response> {
    let Some(id) = requested_session(headers, query) else {
        let err = TransportError::InvalidSession(format!("missing {} header", SESSION_HEADER));
        warn!(error = %err, "rejecting request");
        return Err(rpc_error(
            StatusCode::BAD_REQUEST,
            RpcError::invalid_request(err.to_string()),
        ));
    };
    match state.session(&id).await {
        Some(session) => Ok(session),
        None => {
            let err = TransportError::InvalidSession(id);
            warn!(error = %err, "rejecting request");
            Err(rpc_error(
                StatusCode::NOT_FOUND,
                RpcError::invalid_request(err.to_string()),
            ))
        }
    }
}

fn sse_event(out: Outbound) -> Event {
    let event = Event::default()
        .event("message")
        .data(String::from_utf8_lossy(&out.frame));
    match out.event_id {
        Some(id) => event.id(id.to_string()),
        None => event,
    }
}

fn event_stream(
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    guard: StreamGuard,
    config: &HttpConfig,
) -> Response {
    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(out) = rx.recv().await {
            yield Ok::<_, Infallible>(sse_event(out));
        }
    };
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(config.keep_alive()))
        .into_response()
}

/// Join collected frames into one JSON body.
fn join_frames(mut frames: Vec<Vec<u8>>) -> Vec<u8> {
    if frames.len() == 1 {
        return frames.remove(0);
    }
    let mut values = Vec::new();
    for frame in frames {
        match serde_json::from_slice::<Value>(&frame) {
            Ok(Value::Array(items)) => values.extend(items),
            Ok(value) => values.push(value),
            Err(err) => warn!(error = %err, "dropping unencodable outbound frame"),
        }
    }
    Value::Array(values).to_string().into_bytes()
}

async fn handle_post(
    State(state): State<StreamableHttpState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let frame = match protocol::decode(&body) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(error = %err, "rejecting undecodable POST body");
            return json_body(StatusCode::BAD_REQUEST, protocol::encode(&err.to_envelope()));
        }
    };
    let initialize = frame
        .envelopes()
        .iter()
        .any(|e| e.is_request() && e.method() == Some(METHOD_INITIALIZE));

    let session = if initialize && requested_session(&headers, &query).is_none() {
        match state.create_session().await {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "failed to create http session");
                return rpc_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    RpcError::internal_error("failed to create session"),
                );
            }
        }
    } else {
        match existing_session(&state, &headers, &query).await {
            Ok(session) => session,
            Err(response) => return response,
        }
    };

    let transport = &session.transport;
    transport.set_credentials(
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token),
    );

    let requests: Vec<RequestId> = frame
        .envelopes()
        .iter()
        .filter(|e| e.is_request())
        .filter_map(|e| e.id().cloned())
        .collect();
    debug!(session_id = %session.id, requests = requests.len(), "POST received");

    if requests.is_empty() {
        transport.deliver(body.to_vec());
        return with_session_header(StatusCode::ACCEPTED.into_response(), &session.id);
    }

    let sse = !state.config.json_response;
    let (key, mut rx) = transport.open_post(&requests, sse);
    let guard = StreamGuard::Post(transport.clone(), key);
    transport.deliver(body.to_vec());

    if sse {
        return with_session_header(event_stream(rx, guard, &state.config), &session.id);
    }

    let mut frames = Vec::new();
    let collect = async {
        while let Some(out) = rx.recv().await {
            frames.push(out.frame);
        }
    };
    let timed_out = tokio::time::timeout(state.config.timeout(), collect)
        .await
        .is_err();
    drop(guard);

    let response = if frames.is_empty() && timed_out {
        warn!(session_id = %session.id, "no response within the request timeout");
        rpc_error(
            StatusCode::GATEWAY_TIMEOUT,
            RpcError::internal_error("request timed out"),
        )
    } else if frames.is_empty() {
        StatusCode::ACCEPTED.into_response()
    } else {
        json_body(StatusCode::OK, join_frames(frames))
    };
    with_session_header(response, &session.id)
}

async fn handle_get(
    State(state): State<StreamableHttpState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Response {
    let accepts_events = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map_or(true, |accept| {
            accept.contains("text/event-stream") || accept.contains("*/*")
        });
    if !accepts_events {
        return rpc_error(
            StatusCode::NOT_ACCEPTABLE,
            RpcError::invalid_request("client must accept text/event-stream"),
        );
    }

    let session = match existing_session(&state, &headers, &query).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    let last_event_id = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    match session.transport.open_standalone(last_event_id) {
        Some((key, rx)) => {
            let guard = StreamGuard::Standalone(session.transport.clone(), key);
            with_session_header(event_stream(rx, guard, &state.config), &session.id)
        }
        None => {
            debug!(session_id = %session.id, "standalone stream already open");
            rpc_error(
                StatusCode::CONFLICT,
                RpcError::invalid_request("an event stream is already open for this session"),
            )
        }
    }
}

async fn handle_delete(
    State(state): State<StreamableHttpState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Response {
    let session = match existing_session(&state, &headers, &query).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    state.remove_session(&session.id).await;
    if let Err(err) = session.server.close().await {
        warn!(session_id = %session.id, error = %err, "error closing session");
    }
    info!(session_id = %session.id, "http session terminated by client");
    StatusCode::OK.into_response()
}
