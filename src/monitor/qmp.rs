//! QEMU machine protocol.

use std::{
    sync::{Arc, Mutex, OnceLock, PoisonError},
    time::Instant,
};

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, BufReader, ReadHalf},
    sync::{broadcast, oneshot},
};

use crate::{
    error::{Error, Result},
    event_stream::EventStream,
    monitor::{
        Callback, Monitor, MonitorHooks, MonitorState, StringCallback,
        base::{BaseMonitor, Outbound, Protocol},
    },
    options::MonitorOptions,
    transport::{Endpoint, MonitorStream},
    types::{
        BlockJob, BlockJobProgress, BlockJobTracker, Command, Event, MigrateInfo, MigrateProgress,
        QemuVersion, QueryStatus, Response,
    },
};

/// `block-stream` rate limit, 500 MiB/s.
const BLOCK_STREAM_SPEED: u64 = 500 * 1024 * 1024;

/// VNC passwords are limited to eight characters.
const VNC_PASSWORD_MAX: usize = 8;

pub(crate) struct Qmp {
    events: broadcast::Sender<Event>,
    version: OnceLock<QemuVersion>,
    jobs: Arc<Mutex<BlockJobTracker>>,
}

impl Protocol for Qmp {
    type Command = Command;
    type Reply = Value;

    const NAME: &'static str = "QMP";

    fn encode(command: &Command) -> Result<Outbound> {
        let mut wire = command.to_line()?.into_bytes();
        wire.push(b'\n');
        Ok(Outbound {
            label: command.execute.clone(),
            wire,
        })
    }

    fn spawn_reader(base: Arc<BaseMonitor<Self>>, reader: ReadHalf<MonitorStream>) {
        let runtime = base.runtime().clone();
        runtime.spawn(read_loop(base, BufReader::new(reader)));
    }
}

async fn read_loop(base: Arc<BaseMonitor<Qmp>>, mut reader: BufReader<ReadHalf<MonitorStream>>) {
    let mut line = Vec::new();

    let err = loop {
        line.clear();
        match base.guarded_read(reader.read_until(b'\n', &mut line)).await {
            Ok(0) => {
                break Error::from(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "monitor closed the connection",
                ));
            }
            Ok(_) => {}
            Err(e) => break e,
        }

        let Ok(text) = std::str::from_utf8(&line) else {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                monitor = %base.id(),
                line = %String::from_utf8_lossy(&line).trim_end(),
                "skipping non UTF-8 QMP line"
            );
            continue;
        };

        let raw = text.trim_end_matches(['\r', '\n']);
        if raw.trim().is_empty() {
            continue;
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(monitor = %base.id(), line = %raw, "QMP read");

        match Response::from_line(raw) {
            Ok(resp) => on_response(&base, resp),
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    monitor = %base.id(),
                    line = %raw,
                    error = %_e,
                    "skipping malformed QMP line"
                );
            }
        }
    };

    drop(reader);
    base.reader_exited(err);
}

fn on_response(base: &Arc<BaseMonitor<Qmp>>, resp: Response) {
    match resp {
        Response::Greeting(greeting) => {
            let capabilities = Command::new("qmp_capabilities");
            let prelude = match Qmp::encode(&capabilities) {
                Ok(out) => out,
                Err(_e) => return,
            };

            let version = greeting.qmp.version;
            if base.state() == MonitorState::Connecting {
                #[cfg(feature = "tracing")]
                tracing::info!(monitor = %base.id(), qemu = %version, "QMP greeting received");
                let _ = base.proto.version.set(version);
            }

            if !base.handshake(Some((prelude, None))) {
                #[cfg(feature = "tracing")]
                tracing::warn!(monitor = %base.id(), "ignoring repeated QMP greeting");
            }
        }
        Response::Event(event) => {
            #[cfg(feature = "tracing")]
            if event.is_quiet() {
                tracing::debug!(monitor = %base.id(), event = %event.name, "QMP event");
            } else {
                tracing::info!(
                    monitor = %base.id(),
                    event = %event.name,
                    data = %event.data,
                    "QMP event"
                );
            }

            // No subscribers is fine.
            let _ = base.proto.events.send(event.clone());
            base.notify_event(event);
        }
        reply if base.state() != MonitorState::Connected => {
            #[cfg(feature = "tracing")]
            tracing::warn!(monitor = %base.id(), reply = ?reply, "QMP reply before greeting");
            let _ = reply;
        }
        Response::Return(value) => {
            base.deliver(|_| Ok(value));
        }
        Response::Error(err) => {
            base.deliver(|label| {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    monitor = %base.id(),
                    command = %label,
                    class = %err.class,
                    desc = %err.desc,
                    "QMP command failed"
                );
                Err(Error::command(label, err.class, err.desc))
            });
        }
    }
}

/// Map a human-style command line to a QMP command name: `info X` becomes
/// `query-X`, anything else keeps its first word.
fn parse_cmd(line: &str) -> String {
    let mut words = line.split_whitespace();
    match (words.next(), words.next()) {
        (Some("info"), Some(what)) => format!("query-{what}"),
        (Some(first), _) => first.to_string(),
        (None, _) => String::new(),
    }
}

/// Empty on success, the error text otherwise.
fn action_result(res: Result<Value>) -> String {
    match res {
        Ok(_) => String::new(),
        Err(e) => e.to_string(),
    }
}

/// Decode a reply with field-path context in the error message.
fn decode<T: DeserializeOwned>(command: &str, value: Value) -> Result<T> {
    let line = value.to_string();
    let mut deserializer = serde_json::Deserializer::from_str(&line);
    serde_path_to_error::deserialize(&mut deserializer).map_err(|e| Error::Protocol {
        message: format!("failed to decode response for '{command}': {e}"),
    })
}

/// Decode a `query-block-jobs` reply and fold it into the job tracker.
fn track_block_jobs(
    _id: &str,
    tracker: &Mutex<BlockJobTracker>,
    res: Result<Value>,
) -> Result<Vec<BlockJob>> {
    let jobs: Vec<BlockJob> = decode("query-block-jobs", res?)?;
    let _progress = tracker
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .update(&jobs, Instant::now());

    #[cfg(feature = "tracing")]
    tracing::debug!(
        monitor = %_id,
        jobs = _progress.jobs,
        progress = _progress.progress,
        mbps = _progress.mbps,
        "block job progress"
    );

    Ok(jobs)
}

/// QMP monitor client.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone, Debug)]
pub struct QmpMonitor {
    base: Arc<BaseMonitor<Qmp>>,
}

impl QmpMonitor {
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
            .connect_qmp(endpoint)
            .await
    }

    pub(crate) fn from_stream(
        id: String,
        stream: MonitorStream,
        options: MonitorOptions,
        hooks: MonitorHooks,
    ) -> Result<Self> {
        let (events, _) = broadcast::channel(options.event_buffer.max(1));
        let proto = Qmp {
            events,
            version: OnceLock::new(),
            jobs: Arc::default(),
        };
        let base = BaseMonitor::new(id, proto, stream, &options, hooks)?;
        // Wait for the greeting.
        base.ensure_reader();
        Ok(Self { base })
    }

    /// Queue a command. The callback receives the `return` payload, or
    /// [`Error::Command`] when QEMU answers with an error object.
    pub fn query(&self, command: Command, callback: Callback<Value>) {
        self.base.enqueue(command, Some(callback));
    }

    /// Run a command and wait for its reply.
    pub async fn execute(&self, command: Command) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.query(
            command,
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        );
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Run a command and decode its reply.
    pub async fn execute_as<T: DeserializeOwned>(&self, command: Command) -> Result<T> {
        let name = command.execute.clone();
        let value = self.execute(command).await?;
        decode(&name, value)
    }

    /// Subscribe to QMP events.
    ///
    /// Only events received after this call are yielded.
    #[must_use]
    pub fn events(&self) -> EventStream {
        EventStream::new(self.base.proto.events.subscribe())
    }

    /// Version announced in the greeting, once it has arrived.
    #[must_use]
    pub fn qemu_version(&self) -> Option<QemuVersion> {
        self.base.proto.version.get().cloned()
    }

    /// Number of commands still waiting for a reply.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.base.pending()
    }

    /// `query-block`: raw block device descriptions.
    pub fn get_blocks(&self, callback: Callback<Vec<Value>>) {
        self.query(
            Command::new("query-block"),
            Box::new(move |res| callback(res.and_then(|v| decode("query-block", v)))),
        );
    }

    /// `query-block-jobs`.
    ///
    /// Each poll also updates the per-device speed and progress estimate
    /// returned by [`block_job_progress`](Self::block_job_progress).
    pub fn get_block_jobs(&self, callback: Callback<Vec<BlockJob>>) {
        let id = self.base.id().to_string();
        let tracker = self.base.proto.jobs.clone();
        self.query(
            Command::new("query-block-jobs"),
            Box::new(move |res| callback(track_block_jobs(&id, &tracker, res))),
        );
    }

    /// Number of running block jobs, -1 when the query fails.
    pub fn get_block_job_counts(&self, callback: Box<dyn FnOnce(i64) + Send + 'static>) {
        let id = self.base.id().to_string();
        let tracker = self.base.proto.jobs.clone();
        self.query(
            Command::new("query-block-jobs"),
            Box::new(move |res| {
                let count = track_block_jobs(&id, &tracker, res)
                    .map_or(-1, |jobs| i64::try_from(jobs.len()).unwrap_or(i64::MAX));
                callback(count);
            }),
        );
    }

    /// Aggregate of the last block job poll.
    #[must_use]
    pub fn block_job_progress(&self) -> BlockJobProgress {
        self.base
            .proto
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
    }

    /// `query-migrate`, reduced to a status and a progress estimate.
    pub fn get_migrate_status(&self, callback: Callback<MigrateProgress>) {
        #[cfg(feature = "tracing")]
        let id = self.base.id().to_string();

        self.query(
            Command::new("query-migrate"),
            Box::new(move |res| {
                let progress = res
                    .and_then(|v| decode::<MigrateInfo>("query-migrate", v))
                    .map(|info| MigrateProgress::from(&info));

                #[cfg(feature = "tracing")]
                if let Ok(p) = &progress {
                    tracing::info!(
                        monitor = %id,
                        status = %p.status,
                        progress = p.progress,
                        mbps = p.mbps,
                        "migration status"
                    );
                }

                callback(progress);
            }),
        );
    }

    /// Start migrating to `uri`. The callback receives an empty string on
    /// success.
    pub fn migrate(
        &self,
        uri: &str,
        copy_incremental: bool,
        copy_full: bool,
        callback: StringCallback,
    ) {
        let cmd = Command::with_args(
            "migrate",
            json!({ "uri": uri, "blk": copy_full, "inc": copy_incremental }),
        );
        self.query(cmd, Box::new(move |res| callback(action_result(res))));
    }

    /// Toggle one migration capability.
    pub fn migrate_set_capability(
        &self,
        capability: &str,
        enabled: bool,
        callback: StringCallback,
    ) {
        let cmd = Command::with_args(
            "migrate-set-capabilities",
            json!({ "capabilities": [{ "capability": capability, "state": enabled }] }),
        );
        self.query(cmd, Box::new(move |res| callback(action_result(res))));
    }

    /// Switch a running migration to post-copy.
    pub fn migrate_start_postcopy(&self, callback: StringCallback) {
        self.query(
            Command::new("migrate-start-postcopy"),
            Box::new(move |res| callback(action_result(res))),
        );
    }

    /// Set the display password. Longer passwords are cut to eight
    /// characters.
    pub fn set_vnc_password(&self, protocol: &str, password: &str, callback: StringCallback) {
        let password: String = password.chars().take(VNC_PASSWORD_MAX).collect();
        let cmd = Command::with_args(
            "set_password",
            json!({ "protocol": protocol, "password": password }),
        );
        self.query(cmd, Box::new(move |res| callback(action_result(res))));
    }

    /// Reopen `device` on an existing qcow2 snapshot file.
    pub fn reload_disk_blkdev(&self, device: &str, path: &str, callback: StringCallback) {
        let cmd = Command::with_args(
            "reload-disk-snapshot-blkdev-sync",
            json!({
                "device": device,
                "snapshot-file": path,
                "mode": "existing",
                "format": "qcow2",
            }),
        );
        self.query(cmd, Box::new(move |res| callback(action_result(res))));
    }

    /// Hot-add the vCPU with index `cpu_index` (`cpu-add`).
    pub fn add_cpu(&self, cpu_index: u32, callback: StringCallback) {
        let cmd = Command::with_args("cpu-add", json!({ "id": cpu_index }));
        self.query(cmd, Box::new(move |res| callback(action_result(res))));
    }

    /// Pull the backing chain of `drive` into the top image.
    pub fn block_stream(&self, drive: &str, callback: StringCallback) {
        let cmd = Command::with_args(
            "block-stream",
            json!({ "device": drive, "speed": BLOCK_STREAM_SPEED }),
        );
        self.query(cmd, Box::new(move |res| callback(action_result(res))));
    }

    /// Mirror `drive` into an existing `target` image.
    pub fn drive_mirror(
        &self,
        drive: &str,
        target: &str,
        sync_mode: &str,
        unmap: bool,
        block_replication: bool,
        callback: StringCallback,
    ) {
        let mut args = json!({
            "device": drive,
            "target": target,
            "mode": "existing",
            "sync": sync_mode,
            "unmap": unmap,
        });
        if block_replication {
            args["block-replication"] = Value::Bool(true);
        }
        self.query(
            Command::with_args("drive-mirror", args),
            Box::new(move |res| callback(action_result(res))),
        );
    }
}

impl Monitor for QmpMonitor {
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
            Command::new(parse_cmd(command)),
            Box::new(move |res| {
                callback(match res {
                    Ok(v) => v.to_string(),
                    Err(e) => e.to_string(),
                });
            }),
        );
    }

    fn human_monitor_command(&self, command: &str, callback: StringCallback) {
        let cmd = Command::with_args(
            "human-monitor-command",
            json!({ "command-line": command }),
        );
        self.query(
            cmd,
            Box::new(move |res| {
                callback(match res {
                    Ok(Value::String(out)) => out,
                    Ok(other) => other.to_string(),
                    Err(e) => e.to_string(),
                });
            }),
        );
    }

    fn query_status(&self, callback: StringCallback) {
        self.query(
            Command::new("query-status"),
            Box::new(move |res| {
                let status = res
                    .and_then(|v| decode::<QueryStatus>("query-status", v))
                    .ok()
                    .map(|s| s.status)
                    .filter(|s| !s.is_empty());
                callback(status.unwrap_or_else(|| "unknown".to_string()));
            }),
        );
    }

    fn get_version(&self, callback: StringCallback) {
        self.query(
            Command::new("query-version"),
            Box::new(move |res| {
                let version = res
                    .and_then(|v| decode::<QemuVersion>("query-version", v))
                    .ok()
                    .filter(|v| v.qemu.major > 0);
                callback(version.map(|v| v.to_string()).unwrap_or_default());
            }),
        );
    }
}
