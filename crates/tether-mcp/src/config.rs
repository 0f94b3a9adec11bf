//! Configuration for engines and transports.
//!
//! Configuration is loaded from (later sources override earlier):
//! 1. Global config: `~/.config/tether/tether.jsonc` or `tether.json`
//! 2. Project config: `tether.jsonc` or `tether.json` in the given directory
//! 3. `TETHER_*` environment variables

use crate::engine::DEFAULT_REQUEST_TIMEOUT;
use crate::error::{McpError, McpResult};
use crate::transport::DEFAULT_CLOSE_GRACE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const CONFIG_FILE_NAMES: &[&str] = &["tether.jsonc", "tether.json"];

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherConfig {
    /// Log level (`error`, `warn`, `info`, `debug`, `trace`).
    pub log_level: String,
    pub request_timeout_ms: u64,
    pub stdio: StdioConfig,
    pub websocket: WebSocketConfig,
    pub http: HttpConfig,
    pub server: ServerConfig,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            stdio: StdioConfig::default(),
            websocket: WebSocketConfig::default(),
            http: HttpConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Stdio transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StdioConfig {
    /// Longest accepted line, newline excluded.
    pub max_line_bytes: usize,
    /// Outbound frames queued before `send` waits.
    pub write_queue: usize,
    pub close_grace_ms: u64,
    /// Credentials reported for every request on this pipe.
    pub auth_token: Option<String>,
}

impl Default for StdioConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: 4 * 1024 * 1024,
            write_queue: 100,
            close_grace_ms: DEFAULT_CLOSE_GRACE.as_millis() as u64,
            auth_token: None,
        }
    }
}

impl StdioConfig {
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

/// WebSocket transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebSocketConfig {
    /// Server URL for `connect`.
    pub url: Option<String>,
    /// Ping interval; `0` disables the heartbeat.
    pub heartbeat_interval_ms: u64,
    pub max_message_bytes: usize,
    pub connect_timeout_ms: u64,
    pub close_grace_ms: u64,
    /// Bearer token sent on the upgrade request.
    pub auth_token: Option<String>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: None,
            heartbeat_interval_ms: 30_000,
            max_message_bytes: 4 * 1024 * 1024,
            connect_timeout_ms: 10_000,
            close_grace_ms: DEFAULT_CLOSE_GRACE.as_millis() as u64,
            auth_token: None,
        }
    }
}

impl WebSocketConfig {
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

/// Streamable HTTP settings, server and client side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpConfig {
    /// Listen address for the server.
    pub bind: String,
    /// Endpoint path for the server.
    pub path: String,
    /// Answer POSTs with a JSON body instead of an SSE stream.
    pub json_response: bool,
    /// Events kept per session for `Last-Event-ID` replay.
    pub event_retention: usize,
    /// Endpoint URL for the client.
    pub url: Option<String>,
    pub timeout_ms: u64,
    /// Client: open the standalone GET event stream once a session exists.
    pub open_event_stream: bool,
    /// Client: GET stream reconnect attempts before giving up.
    pub max_reconnects: u32,
    pub keep_alive_secs: u64,
    /// Server: close a session after this long with no requests and no open
    /// streams. `0` keeps sessions until DELETE.
    pub session_idle_timeout_ms: u64,
    /// Bearer token the client sends.
    pub auth_token: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            path: "/mcp".to_string(),
            json_response: false,
            event_retention: 1024,
            url: None,
            timeout_ms: 30_000,
            open_event_stream: true,
            max_reconnects: 3,
            keep_alive_secs: 15,
            session_idle_timeout_ms: 300_000,
            auth_token: None,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn session_idle_timeout(&self) -> Option<Duration> {
        (self.session_idle_timeout_ms > 0).then(|| Duration::from_millis(self.session_idle_timeout_ms))
    }
}

/// Identity the server reports in `initialize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub name: String,
    pub version: String,
    pub instructions: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "tether".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instructions: None,
        }
    }
}

impl TetherConfig {
    /// Load configuration from all sources.
    ///
    /// Returns the merged config and the files it was read from.
    pub async fn load(project_dir: Option<&Path>) -> McpResult<(Self, Vec<PathBuf>)> {
        let mut value = serde_json::to_value(Self::default())?;
        let mut sources = Vec::new();

        let dirs = Self::global_config_dir()
            .into_iter()
            .chain(project_dir.map(Path::to_path_buf));
        for dir in dirs {
            if let Some(path) = Self::find_file(&dir) {
                let loaded = Self::read_jsonc(&path).await?;
                merge_json(&mut value, loaded);
                sources.push(path);
            }
        }

        let mut config: Self = serde_json::from_value(value)
            .map_err(|e| McpError::Config(format!("invalid configuration: {}", e)))?;
        config.apply_env()?;
        debug!(?sources, "configuration loaded");
        Ok((config, sources))
    }

    /// Load one file, then apply environment overrides.
    pub async fn load_file(path: &Path) -> McpResult<Self> {
        let value = Self::read_jsonc(path).await?;
        let mut config: Self = serde_json::from_value(value)
            .map_err(|e| McpError::Config(format!("{}: {}", path.display(), e)))?;
        config.apply_env()?;
        Ok(config)
    }

    /// `~/.config/tether` on Unix, the platform config dir elsewhere.
    pub fn global_config_dir() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            if let Some(home) = dirs::home_dir() {
                let xdg = home.join(".config").join("tether");
                if xdg.exists() {
                    return Some(xdg);
                }
            }
        }
        dirs::config_dir().map(|d| d.join("tether"))
    }

    fn find_file(dir: &Path) -> Option<PathBuf> {
        CONFIG_FILE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
    }

    async fn read_jsonc(path: &Path) -> McpResult<serde_json::Value> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| McpError::Config(format!("{}: {}", path.display(), e)))?;
        parse_jsonc(&content)
            .map_err(|e| McpError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Apply `TETHER_*` environment variables.
    pub fn apply_env(&mut self) -> McpResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (keyed by environment variable name).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> McpResult<()> {
        if let Some(level) = lookup("TETHER_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(ms) = lookup("TETHER_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = parse_number("TETHER_REQUEST_TIMEOUT_MS", &ms)?;
        }
        if let Some(bind) = lookup("TETHER_HTTP_BIND") {
            self.http.bind = bind;
        }
        if let Some(ms) = lookup("TETHER_WS_HEARTBEAT_MS") {
            self.websocket.heartbeat_interval_ms = parse_number("TETHER_WS_HEARTBEAT_MS", &ms)?;
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn parse_number(key: &str, raw: &str) -> McpResult<u64> {
    raw.trim()
        .parse()
        .map_err(|_| McpError::Config(format!("{} must be a number, got '{}'", key, raw)))
}

/// Recursively overlay `overlay` onto `base`; objects merge, everything else replaces.
fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Parse JSON that may contain `//` and `/* */` comments.
pub fn parse_jsonc(content: &str) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::from_str(&strip_comments(content))
}

#[derive(Clone, Copy, PartialEq)]
enum Scan {
    Code,
    Str,
    StrEscape,
    LineComment,
    BlockComment,
    BlockCommentStar,
}

fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut state = Scan::Code;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        state = match (state, c) {
            (Scan::Code, '"') => {
                out.push(c);
                Scan::Str
            }
            (Scan::Code, '/') if chars.peek() == Some(&'/') => {
                chars.next();
                Scan::LineComment
            }
            (Scan::Code, '/') if chars.peek() == Some(&'*') => {
                chars.next();
                Scan::BlockComment
            }
            (Scan::Code, _) => {
                out.push(c);
                Scan::Code
            }
            (Scan::Str, '\\') => {
                out.push(c);
                Scan::StrEscape
            }
            (Scan::Str, '"') => {
                out.push(c);
                Scan::Code
            }
            (Scan::Str, _) | (Scan::StrEscape, _) => {
                out.push(c);
                Scan::Str
            }
            (Scan::LineComment, '\n') => {
                out.push('\n');
                Scan::Code
            }
            (Scan::LineComment, _) => Scan::LineComment,
            (Scan::BlockComment | Scan::BlockCommentStar, '\n') => {
                out.push('\n');
                Scan::BlockComment
            }
            (Scan::BlockComment | Scan::BlockCommentStar, '*') => Scan::BlockCommentStar,
            (Scan::BlockCommentStar, '/') => Scan::Code,
            (Scan::BlockComment | Scan::BlockCommentStar, _) => Scan::BlockComment,
        };
    }
    out
}
