//! Hypervisor monitor clients.
//!
//! Both wire protocols share one lifecycle: a socket is dialed, a
//! reader loop waits for the protocol handshake under a connect deadline,
//! and from then on commands are written by a single writer loop and replies
//! are matched to callbacks purely by queue position.
//!
//! - [`HmpMonitor`] speaks the human monitor protocol, framed on `"(qemu) "`.
//! - [`QmpMonitor`] speaks QMP, one JSON object per line.
//!
//! Both implement [`Monitor`], the surface higher layers program against.

pub(crate) mod base;
mod dispatch;
mod hmp;
mod qmp;

use std::{collections::BTreeMap, fmt, sync::Arc};

pub use hmp::{HmpMonitor, PROMPT, PromptScanner};
pub use qmp::QmpMonitor;

use crate::{
    error::{Error, Result},
    options::MonitorOptions,
    transport::{AsyncMonitorStream, Endpoint},
    types::Event,
};

/// Continuation for one command; receives the correlated reply.
pub type Callback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Continuation for the string-typed convenience queries.
pub type StringCallback = Box<dyn FnOnce(String) + Send + 'static>;

/// Continuation for the counting convenience queries.
pub type CountCallback = Box<dyn FnOnce(usize) + Send + 'static>;

/// Connection lifecycle of a monitor.
///
/// A monitor only moves forward: once `Disconnected` after having dialed, it
/// stays there. Reconnecting means creating a new monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitorState {
    /// Socket open, handshake not received yet.
    Connecting,
    /// Handshake received; commands flow.
    Connected,
    /// Closed locally or by the peer.
    Disconnected,
}

type NotifyHook = Arc<dyn Fn() + Send + Sync>;
type ErrorHook = Arc<dyn Fn(Error) + Send + Sync>;
type EventHook = Arc<dyn Fn(Event) + Send + Sync>;

/// Lifecycle callbacks.
///
/// Hooks run on the monitor's dispatch task, in order with command
/// callbacks: `on_connected` always precedes the first reply.
#[derive(Clone, Default)]
pub struct MonitorHooks {
    pub(crate) on_connected: Option<NotifyHook>,
    pub(crate) on_disconnect: Option<ErrorHook>,
    pub(crate) on_connect_failed: Option<ErrorHook>,
    pub(crate) on_event: Option<EventHook>,
}

impl MonitorHooks {
    /// Empty hook set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once the handshake frame has been received.
    #[must_use]
    pub fn on_connected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Arc::new(f));
        self
    }

    /// Called when an established connection is lost.
    ///
    /// Not called for a local [`Monitor::disconnect`].
    #[must_use]
    pub fn on_disconnect(mut self, f: impl Fn(Error) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Called when the socket closed or the connect deadline passed before
    /// the handshake arrived.
    #[must_use]
    pub fn on_connect_failed(mut self, f: impl Fn(Error) + Send + Sync + 'static) -> Self {
        self.on_connect_failed = Some(Arc::new(f));
        self
    }

    /// QMP event watcher. Ignored by HMP monitors.
    #[must_use]
    pub fn on_event(mut self, f: impl Fn(Event) + Send + Sync + 'static) -> Self {
        self.on_event = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for MonitorHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorHooks")
            .field("on_connected", &self.on_connected.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_connect_failed", &self.on_connect_failed.is_some())
            .field("on_event", &self.on_event.is_some())
            .finish()
    }
}

/// Monitor builder.
#[derive(Debug, Clone)]
pub struct MonitorBuilder {
    id: String,
    options: MonitorOptions,
    hooks: MonitorHooks,
}

impl MonitorBuilder {
    /// Create a builder. `id` names the monitor in logs and registries,
    /// typically the server id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            options: MonitorOptions::default(),
            hooks: MonitorHooks::default(),
        }
    }

    /// Replace all options.
    #[must_use]
    pub fn options(mut self, options: MonitorOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the handshake deadline.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    /// Set the QMP event buffer size.
    #[must_use]
    pub fn event_buffer(mut self, size: usize) -> Self {
        self.options.event_buffer = size;
        self
    }

    /// Set lifecycle hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: MonitorHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Dial an HMP endpoint. Returns once the socket is open.
    pub async fn connect_hmp(self, endpoint: &Endpoint) -> Result<HmpMonitor> {
        let stream = crate::transport::connect(endpoint).await?;
        HmpMonitor::from_stream(self.id, stream, self.options, self.hooks)
    }

    /// Dial a QMP endpoint. Returns once the socket is open.
    pub async fn connect_qmp(self, endpoint: &Endpoint) -> Result<QmpMonitor> {
        let stream = crate::transport::connect(endpoint).await?;
        QmpMonitor::from_stream(self.id, stream, self.options, self.hooks)
    }

    /// Run an HMP monitor on an already connected stream.
    pub fn attach_hmp(self, stream: impl AsyncMonitorStream + 'static) -> Result<HmpMonitor> {
        HmpMonitor::from_stream(self.id, Box::new(stream), self.options, self.hooks)
    }

    /// Run a QMP monitor on an already connected stream.
    pub fn attach_qmp(self, stream: impl AsyncMonitorStream + 'static) -> Result<QmpMonitor> {
        QmpMonitor::from_stream(self.id, Box::new(stream), self.options, self.hooks)
    }
}

/// Operations common to HMP and QMP monitors.
///
/// Every method only enqueues; the callback fires later on the monitor's
/// dispatch task. Commands submitted before the handshake are held and sent
/// once it completes. If the monitor disconnects first, string callbacks
/// receive the error text and count callbacks receive zero.
pub trait Monitor: Send + Sync + fmt::Debug {
    /// Monitor id used in logs.
    fn id(&self) -> &str;

    /// Current lifecycle state.
    fn state(&self) -> MonitorState;

    /// Whether the handshake completed and the connection is still up.
    fn is_connected(&self) -> bool {
        self.state() == MonitorState::Connected
    }

    /// Close the connection. Idempotent.
    ///
    /// Pending callbacks receive [`Error::Disconnected`].
    fn disconnect(&self);

    /// Run a raw monitor command line and return its textual reply.
    fn simple_command(&self, command: &str, callback: StringCallback);

    /// Run an HMP command line; on QMP monitors through
    /// `human-monitor-command`.
    fn human_monitor_command(&self, command: &str, callback: StringCallback);

    /// VM run state ("running", "paused", ...), `"unknown"` when it cannot be
    /// determined.
    fn query_status(&self, callback: StringCallback);

    /// QEMU version as `major.minor.micro`, empty when it cannot be
    /// determined.
    fn get_version(&self, callback: StringCallback);

    /// Ask QEMU to exit.
    fn quit(&self, callback: StringCallback) {
        self.simple_command("quit", callback);
    }

    /// Change the medium of a removable drive.
    fn change_cdrom(&self, device: &str, path: &str, callback: StringCallback) {
        self.human_monitor_command(&format!("change {device} {path}"), callback);
    }

    /// Force-eject the medium of a removable drive.
    fn eject_cdrom(&self, device: &str, callback: StringCallback) {
        self.human_monitor_command(&format!("eject -f {device}"), callback);
    }

    /// Remove a drive backend.
    fn drive_del(&self, id: &str, callback: StringCallback) {
        self.human_monitor_command(&format!("drive_del {id}"), callback);
    }

    /// Hot-unplug a device.
    fn device_del(&self, id: &str, callback: StringCallback) {
        self.human_monitor_command(&format!("device_del {id}"), callback);
    }

    /// Remove a QOM object.
    fn object_del(&self, id: &str, callback: StringCallback) {
        self.human_monitor_command(&format!("object_del {id}"), callback);
    }

    /// Add a QOM object.
    fn object_add(
        &self,
        object_type: &str,
        params: &BTreeMap<String, String>,
        callback: StringCallback,
    ) {
        let line = format!("object_add {object_type},{}", join_params(params));
        self.human_monitor_command(&line, callback);
    }

    /// Add a drive backend on `bus`.
    fn drive_add(&self, bus: &str, params: &BTreeMap<String, String>, callback: StringCallback) {
        let line = format!("drive_add {bus} {}", join_params(params));
        self.human_monitor_command(&line, callback);
    }

    /// Hot-plug a device.
    fn device_add(
        &self,
        driver: &str,
        params: &BTreeMap<String, String>,
        callback: StringCallback,
    ) {
        let line = format!("device_add {driver},{}", join_params(params));
        self.human_monitor_command(&line, callback);
    }

    /// Add a network backend.
    fn netdev_add(
        &self,
        id: &str,
        net_type: &str,
        params: &BTreeMap<String, String>,
        callback: StringCallback,
    ) {
        let mut line = format!("netdev_add {net_type},id={id}");
        for (k, v) in params {
            line.push_str(&format!(",{k}={v}"));
        }
        self.human_monitor_command(&line, callback);
    }

    /// Remove a network backend.
    fn netdev_del(&self, id: &str, callback: StringCallback) {
        self.human_monitor_command(&format!("netdev_del {id}"), callback);
    }

    /// Grow a disk to `size_mb` megabytes.
    fn resize_disk(&self, drive: &str, size_mb: u64, callback: StringCallback) {
        self.human_monitor_command(&format!("block_resize {drive} {size_mb}"), callback);
    }

    /// Limit total bytes and operations per second of a drive.
    fn block_io_throttle(&self, drive: &str, bps: u64, iops: u64, callback: StringCallback) {
        let line = format!("block_set_io_throttle {drive} {bps} 0 0 {iops} 0 0");
        self.human_monitor_command(&line, callback);
    }

    /// Cancel the block job running on `drive`.
    fn cancel_block_job(&self, drive: &str, force: bool, callback: StringCallback) {
        let line = if force {
            format!("block_job_cancel -f {drive}")
        } else {
            format!("block_job_cancel {drive}")
        };
        self.human_monitor_command(&line, callback);
    }

    /// Start the built-in NBD server on all interfaces.
    fn start_nbd_server(
        &self,
        port: u16,
        export_all: bool,
        writable: bool,
        callback: StringCallback,
    ) {
        let mut line = "nbd_server_start".to_string();
        if export_all {
            line.push_str(" -a");
        }
        if writable {
            line.push_str(" -w");
        }
        line.push_str(&format!(" 0.0.0.0:{port}"));
        self.human_monitor_command(&line, callback);
    }

    /// Number of vCPUs reported by `info cpus`.
    fn get_cpu_count(&self, callback: CountCallback) {
        self.human_monitor_command(
            "info cpus",
            Box::new(move |out| callback(count_cpus(&out))),
        );
    }

    /// Number of populated memory slots reported by `info memory-devices`.
    fn get_memory_slot_count(&self, callback: CountCallback) {
        self.human_monitor_command(
            "info memory-devices",
            Box::new(move |out| callback(count_memory_slots(&out))),
        );
    }
}

fn join_params(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn count_cpus(out: &str) -> usize {
    out.lines()
        .map(|l| l.trim_start().trim_start_matches('*').trim_start())
        .filter(|l| l.starts_with("CPU #"))
        .count()
}

fn count_memory_slots(out: &str) -> usize {
    out.lines()
        .filter(|l| l.trim_start().starts_with("slot:"))
        .count()
}
