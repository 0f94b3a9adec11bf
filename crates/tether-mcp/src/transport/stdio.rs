//! Newline-delimited JSON over a byte pipe.
//!
//! Works over the process's own stdin/stdout, a spawned child process, or
//! any `AsyncRead`/`AsyncWrite` pair.

use super::{HandlerSlot, Transport, TransportHandlers};
use crate::config::StdioConfig;
use crate::error::{TransportError, TransportResult};
use crate::sync::lock;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How to launch a server as a child process.
#[derive(Debug, Clone, Default)]
pub struct StdioCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl StdioCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Split a whitespace-separated command line. No quoting rules.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program).args(parts))
    }
}

/// Stdio transport.
pub struct StdioTransport {
    shared: Arc<Shared>,
}

struct Shared {
    config: StdioConfig,
    io: Mutex<Option<(BoxedReader, BoxedWriter)>>,
    outbound: std::sync::Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    child: Mutex<Option<Child>>,
    slot: HandlerSlot,
    started: AtomicBool,
    closing: AtomicBool,
    stop: CancellationToken,
}

impl StdioTransport {
    /// Transport over an arbitrary reader/writer pair.
    pub fn new<R, W>(reader: R, writer: W, config: StdioConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::from_parts(Box::new(reader), Box::new(writer), None, config)
    }

    /// Transport over this process's stdin and stdout.
    pub fn process(config: StdioConfig) -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), config)
    }

    /// Spawn `command` and talk to it over its stdin and stdout.
    ///
    /// The child's stderr is inherited.
    pub fn spawn(command: &StdioCommand, config: StdioConfig) -> TransportResult<Self> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }

        debug!(program = %command.program, args = ?command.args, "spawning stdio server");
        let mut child = cmd.spawn().map_err(|e| {
            TransportError::ConnectionRefused(format!("failed to start {}: {}", command.program, e))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Io("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Io("child stdout unavailable".to_string()))?;

        Ok(Self::from_parts(
            Box::new(stdout),
            Box::new(stdin),
            Some(child),
            config,
        ))
    }

    fn from_parts(
        reader: BoxedReader,
        writer: BoxedWriter,
        child: Option<Child>,
        config: StdioConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                io: Mutex::new(Some((reader, writer))),
                outbound: std::sync::Mutex::new(None),
                writer: Mutex::new(None),
                child: Mutex::new(child),
                slot: HandlerSlot::default(),
                started: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                stop: CancellationToken::new(),
            }),
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self) -> TransportResult<()> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (reader, writer) = self
            .shared
            .io
            .lock()
            .await
            .take()
            .ok_or(TransportError::Closed)?;

        let (tx, rx) = mpsc::channel(self.shared.config.write_queue.max(1));
        *lock(&self.shared.outbound) = Some(tx);
        *self.shared.writer.lock().await =
            Some(tokio::spawn(write_loop(self.shared.clone(), writer, rx)));
        tokio::spawn(read_loop(self.shared.clone(), reader));
        Ok(())
    }

    async fn send(&self, frame: Vec<u8>) -> TransportResult<()> {
        if self.shared.closing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if frame.contains(&b'\n') {
            return Err(TransportError::Framing(
                "frame contains a raw newline".to_string(),
            ));
        }
        let sender = lock(&self.shared.outbound)
            .clone()
            .ok_or(TransportError::Closed)?;
        sender.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&self) -> TransportResult<()> {
        self.shared.shutdown().await;
        Ok(())
    }

    fn set_handlers(&self, handlers: TransportHandlers) {
        self.shared.slot.set(handlers);
    }

    fn is_connected(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst) && !self.shared.closing.load(Ordering::SeqCst)
    }

    fn credentials(&self) -> Option<String> {
        self.shared.config.auth_token.clone()
    }
}

impl Shared {
    async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.cancel();
        drop(lock(&self.outbound).take());

        let grace = self.config.close_grace();
        if let Some(mut writer) = self.writer.lock().await.take() {
            if tokio::time::timeout(grace, &mut writer).await.is_err() {
                warn!("stdio writer did not flush within the grace period");
                writer.abort();
            }
        }

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "stdio child exited"),
                _ => {
                    warn!("stdio child still running after close, killing it");
                    if let Err(err) = child.kill().await {
                        warn!(error = %err, "failed to kill stdio child");
                    }
                }
            }
        }

        self.slot.emit_close();
    }
}

async fn write_loop(shared: Arc<Shared>, mut writer: BoxedWriter, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        trace!(frame = %String::from_utf8_lossy(&frame), "stdio write");
        let written = async {
            writer.write_all(&frame).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            shared.slot.emit_error(err.into());
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(shared: Arc<Shared>, reader: BoxedReader) {
    let limit = shared.config.max_line_bytes;
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        let mut bounded = (&mut reader).take(limit as u64 + 1);
        let read = tokio::select! {
            _ = shared.stop.cancelled() => break,
            read = bounded.read_until(b'\n', &mut line) => read,
        };

        match read {
            Ok(0) => {
                debug!("stdio stream ended");
                break;
            }
            Ok(_) if line.last() == Some(&b'\n') => {
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                shared.slot.emit_message(std::mem::take(&mut line));
            }
            Ok(size) if size > limit => {
                warn!(size, limit, "stdio line exceeds limit");
                shared
                    .slot
                    .emit_error(TransportError::MessageTooLarge { size, limit });
                break;
            }
            Ok(_) => {
                warn!("stdio stream ended in the middle of a line");
                shared.slot.emit_error(TransportError::Framing(
                    "stream ended without a trailing newline".to_string(),
                ));
                break;
            }
            Err(err) => {
                shared.slot.emit_error(err.into());
                break;
            }
        }
    }

    shared.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    enum Event {
        Message(Vec<u8>),
        Error(TransportError),
        Close,
    }

    fn wire(transport: &StdioTransport) -> mpsc::UnboundedReceiver<Event> {
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

    async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_two_frames_in_one_buffer() {
        let (mut peer, local) = duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let transport = StdioTransport::new(reader, writer, StdioConfig::default());
        let mut events = wire(&transport);
        transport.start().await.unwrap();

        peer.write_all(b"{\"id\":1}\n{\"id\":2}\n").await.unwrap();

        match next(&mut events).await {
            Event::Message(frame) => assert_eq!(frame, b"{\"id\":1}"),
            _ => panic!("expected first message"),
        }
        match next(&mut events).await {
            Event::Message(frame) => assert_eq!(frame, b"{\"id\":2}"),
            _ => panic!("expected second message"),
        }
    }

    #[tokio::test]
    async fn test_send_appends_newline() {
        let (mut peer, local) = duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let transport = StdioTransport::new(reader, writer, StdioConfig::default());
        transport.start().await.unwrap();

        transport.send(b"{\"a\":1}".to_vec()).await.unwrap();
        transport.send(b"{\"b\":2}".to_vec()).await.unwrap();

        let mut buf = vec![0u8; 16];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"{\"a\":1}\n{\"b\":2}\n");

        assert!(matches!(
            transport.send(b"a\nb".to_vec()).await,
            Err(TransportError::Framing(_))
        ));
    }

    #[tokio::test]
    async fn test_unterminated_line_is_framing_error() {
        let (mut peer, local) = duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let transport = StdioTransport::new(reader, writer, StdioConfig::default());
        let mut events = wire(&transport);
        transport.start().await.unwrap();

        peer.write_all(b"{\"id\":1}\n{\"id\":").await.unwrap();
        drop(peer);

        assert!(matches!(next(&mut events).await, Event::Message(_)));
        assert!(matches!(
            next(&mut events).await,
            Event::Error(TransportError::Framing(_))
        ));
        assert!(matches!(next(&mut events).await, Event::Close));
    }

    #[tokio::test]
    async fn test_oversize_line_closes() {
        let (mut peer, local) = duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let config = StdioConfig {
            max_line_bytes: 8,
            ..Default::default()
        };
        let transport = StdioTransport::new(reader, writer, config);
        let mut events = wire(&transport);
        transport.start().await.unwrap();

        peer.write_all(b"{\"much-too-long\":true}\n").await.unwrap();

        assert!(matches!(
            next(&mut events).await,
            Event::Error(TransportError::MessageTooLarge { limit: 8, .. })
        ));
        assert!(matches!(next(&mut events).await, Event::Close));
    }

    #[tokio::test]
    async fn test_close_fires_once() {
        let (_peer, local) = duplex(64);
        let (reader, writer) = tokio::io::split(local);
        let transport = StdioTransport::new(reader, writer, StdioConfig::default());
        let mut events = wire(&transport);
        transport.start().await.unwrap();

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(matches!(next(&mut events).await, Event::Close));
        assert!(events.try_recv().is_err());
        assert!(!transport.is_connected());
        assert_eq!(
            transport.send(b"{}".to_vec()).await,
            Err(TransportError::Closed)
        );
    }

    #[test]
    fn test_command_parse() {
        let cmd = StdioCommand::parse("tether serve --transport stdio").unwrap();
        assert_eq!(cmd.program, "tether");
        assert_eq!(cmd.args, vec!["serve", "--transport", "stdio"]);
        assert!(StdioCommand::parse("   ").is_none());
    }
}
