//! Human monitor protocol.

use std::{io, sync::Arc};

use tokio::{
    io::{AsyncReadExt, ReadHalf},
    sync::oneshot,
};

use crate::{
    error::{Error, Result},
    monitor::{
        Callback, Monitor, MonitorHooks, MonitorState, StringCallback,
        base::{BaseMonitor, Outbound, Protocol},
    },
    options::MonitorOptions,
    transport::{Endpoint, MonitorStream},
};

/// Marker QEMU prints after every HMP reply.
pub const PROMPT: &str = "(qemu) ";

const READ_CHUNK: usize = 4096;

/// Splits an HMP byte stream into prompt-terminated frames.
///
/// The scanner never touches a socket: feed it bytes with
/// [`push`](Self::push) and drain frames with
/// [`next_frame`](Self::next_frame).
#[derive(Debug, Default, Clone)]
pub struct PromptScanner {
    buf: Vec<u8>,
}

impl PromptScanner {
    /// Empty scanner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the peer.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame, without its trailing prompt.
    pub fn next_frame(&mut self) -> Option<String> {
        let marker = PROMPT.as_bytes();
        let end = self.buf.windows(marker.len()).position(|w| w == marker)?;
        let frame = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.drain(..end + marker.len());
        Some(frame)
    }

    /// Surrender whatever is left at end of stream as a final frame.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(rest)
    }

    /// Bytes buffered after the last prompt.
    #[must_use]
    pub fn remainder(&self) -> &[u8] {
        &self.buf
    }
}

pub(crate) struct Hmp;

impl Protocol for Hmp {
    type Command = String;
    type Reply = String;

    const NAME: &'static str = "HMP";

    fn encode(command: &String) -> Result<Outbound> {
        let line = command.trim();
        if line.contains('\n') || line.contains('\r') {
            return Err(Error::protocol(format!(
                "HMP command must be a single line: {line:?}"
            )));
        }
        Ok(Outbound {
            label: line.to_string(),
            wire: format!("{line}\n").into_bytes(),
        })
    }

    fn spawn_reader(base: Arc<BaseMonitor<Self>>, reader: ReadHalf<MonitorStream>) {
        let runtime = base.runtime().clone();
        runtime.spawn(read_loop(base, reader));
    }
}

async fn read_loop(base: Arc<BaseMonitor<Hmp>>, mut reader: ReadHalf<MonitorStream>) {
    let mut scanner = PromptScanner::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut greeted = false;

    let err = loop {
        let n = match base.guarded_read(reader.read(&mut buf)).await {
            Ok(n) => n,
            Err(e) => break e,
        };

        if n == 0 {
            if let Some(rest) = scanner.finish() {
                on_frame(&base, &mut greeted, rest);
            }
            break Error::from(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "monitor closed the connection",
            ));
        }

        scanner.push(&buf[..n]);
        while let Some(frame) = scanner.next_frame() {
            on_frame(&base, &mut greeted, frame);
        }
    };

    drop(reader);
    base.reader_exited(err);
}

fn on_frame(base: &Arc<BaseMonitor<Hmp>>, greeted: &mut bool, frame: String) {
    if !*greeted {
        *greeted = true;

        #[cfg(feature = "tracing")]
        tracing::debug!(monitor = %base.id(), banner = %frame.trim(), "HMP banner received");

        base.handshake(None);
        return;
    }

    if frame.trim().is_empty() {
        #[cfg(feature = "tracing")]
        tracing::debug!(monitor = %base.id(), "dropping empty HMP frame");
        return;
    }

    #[cfg(feature = "tracing")]
    tracing::trace!(monitor = %base.id(), frame = %frame, "HMP frame");

    base.deliver(|label| Ok(strip_echo(&frame, label)));
}

/// Remove the command line QEMU echoes back at the top of a reply.
fn strip_echo(frame: &str, command: &str) -> String {
    let text = frame.replace("\r\n", "\n");
    match text.split_once('\n') {
        Some((first, rest)) if first.trim() == command.trim() => rest.to_string(),
        None if text.trim() == command.trim() => String::new(),
        _ => text,
    }
}

/// Run state from `info status` output, e.g. `"VM status: paused (prelaunch)"`.
fn parse_status(out: &str) -> Option<String> {
    out.lines()
        .find_map(|l| l.split_once("VM status:"))
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(str::to_string)
}

/// First `major.minor.micro` token of `info version` output.
fn parse_version(out: &str) -> Option<String> {
    out.split_whitespace()
        .find(|token| {
            let parts: Vec<_> = token.split('.').collect();
            parts.len() == 3
                && parts
                    .iter()
                    .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
        })
        .map(str::to_string)
}

/// HMP monitor client.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone, Debug)]
pub struct HmpMonitor {
    base: Arc<BaseMonitor<Hmp>>,
}

impl HmpMonitor {
    /// Start a builder for a monitor named `id`.
    #[must_use]
    pub fn builder(id: impl Into<String>) -> super::MonitorBuilder {
        super::MonitorBuilder::new(id)
    }

    /// Dial `endpoint`. Returns once the socket is open; the handshake
    /// completes in the background.
    pub async fn connect(
        id: impl Into<String>,
        endpoint: &Endpoint,
        options: MonitorOptions,
        hooks: MonitorHooks,
    ) -> Result<Self> {
        super::MonitorBuilder::new(id)
            .options(options)
            .hooks(hooks)
            .connect_hmp(endpoint)
            .await
    }

    pub(crate) fn from_stream(
        id: String,
        stream: MonitorStream,
        options: MonitorOptions,
        hooks: MonitorHooks,
    ) -> Result<Self> {
        let base = BaseMonitor::new(id, Hmp, stream, &options, hooks)?;
        // The banner frame completes the handshake, so read right away.
        base.ensure_reader();
        Ok(Self { base })
    }

    /// Queue a raw command line. The callback receives the reply text with
    /// the echoed command removed.
    pub fn query(&self, line: impl Into<String>, callback: Callback<String>) {
        self.base.enqueue(line.into(), Some(callback));
    }

    /// Run a command line and wait for its reply.
    pub async fn execute(&self, line: impl Into<String>) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.query(
            line,
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        );
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Number of commands still waiting for a reply.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.base.pending()
    }
}

impl Monitor for HmpMonitor {
    fn id(&self) -> &str {
        self.base.id()
    }

    fn state(&self) -> MonitorState {
        self.base.state()
    }

    fn disconnect(&self) {
        self.base.disconnect();
    }

    fn simple_command(&self, command: &str, callback: StringCallback) {
        self.query(
            command,
            Box::new(move |res| callback(res.unwrap_or_else(|e| e.to_string()))),
        );
    }

    fn human_monitor_command(&self, command: &str, callback: StringCallback) {
        self.simple_command(command, callback);
    }

    fn query_status(&self, callback: StringCallback) {
        self.query(
            "info status",
            Box::new(move |res| {
                let status = res.ok().and_then(|out| parse_status(&out));
                callback(status.unwrap_or_else(|| "unknown".to_string()));
            }),
        );
    }

    fn get_version(&self, callback: StringCallback) {
        self.query(
            "info version",
            Box::new(move |res| {
                let version = res.ok().and_then(|out| parse_version(&out));
                callback(version.unwrap_or_default());
            }),
        );
    }
}
