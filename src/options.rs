//! Connection options.

use std::time::Duration;

/// Options controlling how a monitor connection is established.
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// How long the peer may take to send its handshake (HMP banner or QMP
    /// greeting) after the socket opens.
    ///
    /// The deadline is cleared once the handshake arrives; after that reads
    /// are unbounded and rely on the peer's own liveness.
    pub connect_timeout: Duration,

    /// Size of the QMP event broadcast buffer.
    ///
    /// If subscribers lag behind, events are dropped and surfaced as
    /// [`crate::Error::EventLagged`].
    pub event_buffer: usize,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            event_buffer: 1024,
        }
    }
}

/// Options for the guest agent client.
#[derive(Debug, Clone)]
pub struct GuestAgentOptions {
    /// Default time to wait for the reply line of a single command.
    pub read_timeout: Duration,

    /// Poll budget used by [`crate::GuestAgent::command_with_timeout`] when the
    /// caller passes a non-positive timeout.
    pub exec_timeout_secs: u32,

    /// Length of one poll tick between `guest-exec-status` calls.
    pub poll_interval: Duration,
}

impl GuestAgentOptions {
    /// Default per-command read timeout.
    pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

    /// Set the per-command read timeout.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the default exec poll budget (in ticks).
    #[must_use]
    pub fn exec_timeout_secs(mut self, secs: u32) -> Self {
        self.exec_timeout_secs = secs.max(1);
        self
    }

    /// Set the poll tick length.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for GuestAgentOptions {
    fn default() -> Self {
        Self {
            read_timeout: Self::DEFAULT_READ_TIMEOUT,
            exec_timeout_secs: 30,
            poll_interval: Duration::from_secs(1),
        }
    }
}
