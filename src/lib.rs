//! `qemu-monitor` - async clients for QEMU's control channels.
//!
//! This crate is designed for host-side VM control planes that drive many
//! QEMU processes at once:
//! - HMP (human monitor) sockets, framed on the `(qemu) ` prompt
//! - QMP sockets, one JSON object per line
//! - QEMU guest agent sockets
//!
//! It provides:
//! - socket connection management (Unix/TCP)
//! - handshake handling under a connect deadline
//! - FIFO command/reply correlation with callbacks run in submission order
//! - a subscribable QMP event stream
//! - typed guest agent operations: exec with polling, file transfer,
//!   network and password management
//! - a registry keyed by server id
//!
//! ## Quick start (QMP over a Unix socket)
//!
//! ```no_run
//! use qemu_monitor::{Endpoint, Monitor, MonitorBuilder, MonitorHooks};
//! # async fn demo() -> qemu_monitor::Result<()> {
//! let hooks = MonitorHooks::new()
//!     .on_connected(|| println!("monitor ready"))
//!     .on_disconnect(|e| eprintln!("monitor lost: {e}"));
//!
//! let monitor = MonitorBuilder::new("vm-100")
//!     .hooks(hooks)
//!     .connect_qmp(&Endpoint::unix("/var/run/qemu-server/100.qmp"))
//!     .await?;
//!
//! // Queued until the handshake completes, then answered in order.
//! monitor.query_status(Box::new(|status| println!("status = {status}")));
//!
//! // Subscribe to events:
//! let mut events = monitor.events();
//! if let Ok(ev) = events.recv().await {
//!     println!("event: {}", ev.name);
//! }
//! # Ok(()) }
//! ```
//!
//! ## Guest agent
//!
//! ```no_run
//! use qemu_monitor::{Endpoint, ExecRequest, GuestAgent, GuestAgentOptions};
//! # async fn demo() -> qemu_monitor::Result<()> {
//! let qga = GuestAgent::connect(
//!     "vm-100",
//!     Endpoint::unix("/var/run/qemu-server/100.qga"),
//!     GuestAgentOptions::default(),
//! )
//! .await?;
//!
//! let out = qga
//!     .command_with_timeout(&ExecRequest::new("uname").arg("-r").capture_output(true), 10)
//!     .await?;
//! println!("kernel {}", out.stdout.trim());
//! # Ok(()) }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod cancel;
mod event_stream;
mod options;
mod registry;
mod transport;

pub mod error;
pub mod monitor;
pub mod qga;
pub mod types;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use cancel::CancelToken;
pub use error::{Error, ErrorKind, Result};
pub use event_stream::EventStream;
pub use monitor::{
    Callback, CountCallback, HmpMonitor, Monitor, MonitorBuilder, MonitorHooks, MonitorState,
    PROMPT, PromptScanner, QmpMonitor, StringCallback,
};
pub use options::{GuestAgentOptions, MonitorOptions};
pub use qga::{ExecOutput, ExecRequest, GuestAgent, NetworkModify};
pub use registry::MonitorRegistry;
pub use transport::{AsyncMonitorStream, Endpoint};
