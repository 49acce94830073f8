//! Error model for the `qemu-monitor` crate.

use std::time::Duration;

use thiserror::Error;

/// Convenience result type.
pub type Result<T> = std::result::Result<T, Error>;

/// High-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An I/O level failure (socket, EOF, etc.).
    Io,
    /// JSON or base64 encoding/decoding failure.
    Decode,
    /// Protocol violation or unexpected message.
    Protocol,
    /// The peer answered a command with an error object.
    Command,
    /// The connection was closed.
    Disconnected,
    /// The peer never completed its handshake in time.
    ConnectTimeout,
    /// A guest process did not exit within the poll budget.
    ExecTimeout,
    /// The guest agent does not support (or has disabled) a command.
    Unsupported,
    /// The caller abandoned the wait.
    Cancelled,
    /// The event stream receiver fell behind and dropped messages.
    EventLagged,
}

/// Structured error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Socket / file I/O error.
    #[error("I/O error: {source}")]
    Io {
        /// Lower-level error.
        #[from]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {source}")]
    Json {
        /// Lower-level error.
        #[from]
        source: serde_json::Error,
    },

    /// Base64 payload from the guest agent could not be decoded.
    #[error("base64 error: {source}")]
    Base64 {
        /// Lower-level error.
        #[from]
        source: base64::DecodeError,
    },

    /// The peer sent an unexpected or invalid message.
    #[error("monitor protocol error: {message}")]
    Protocol {
        /// Human readable message.
        message: String,
    },

    /// The peer returned an `error` object for a command.
    #[error("{class}: {desc}")]
    Command {
        /// Command name.
        command: String,
        /// Error class.
        class: String,
        /// Error description.
        desc: String,
    },

    /// The connection closed before the command was answered.
    #[error("monitor connection closed")]
    Disconnected,

    /// The peer did not send its handshake before the connect deadline.
    #[error("monitor handshake not received within {timeout:?}")]
    ConnectTimeout {
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// A guest process was still running when the poll budget ran out.
    ///
    /// The process itself keeps running inside the guest.
    #[error("guest process {pid} still running after {waited:?}")]
    ExecTimeout {
        /// Guest pid returned by `guest-exec`.
        pid: i64,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The guest agent cannot run a command.
    #[error("guest agent command {command} unavailable: {reason}")]
    Unsupported {
        /// Command name.
        command: String,
        /// Reason.
        reason: String,
    },

    /// The caller cancelled the wait.
    #[error("wait cancelled")]
    Cancelled,

    /// The event receiver lagged behind and dropped events.
    #[error("event stream lagged behind and dropped {missed} events")]
    EventLagged {
        /// How many events were dropped.
        missed: usize,
    },
}

impl Error {
    /// Returns a coarse error classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Io,
            Self::Json { .. } | Self::Base64 { .. } => ErrorKind::Decode,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Command { .. } => ErrorKind::Command,
            Self::Disconnected => ErrorKind::Disconnected,
            Self::ConnectTimeout { .. } => ErrorKind::ConnectTimeout,
            Self::ExecTimeout { .. } => ErrorKind::ExecTimeout,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::EventLagged { .. } => ErrorKind::EventLagged,
        }
    }

    /// Whether this error is fatal to the connection it happened on.
    ///
    /// Command errors, decode errors of a single reply and exec timeouts leave
    /// the connection usable.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Io | ErrorKind::Disconnected | ErrorKind::ConnectTimeout
        )
    }

    /// Whether the operation may succeed if the caller tries again.
    ///
    /// Nothing in this crate retries on its own; this is a hint for callers.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.is_transport() || self.kind() == ErrorKind::ExecTimeout
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn command(
        command: impl Into<String>,
        class: impl Into<String>,
        desc: impl Into<String>,
    ) -> Self {
        Self::Command {
            command: command.into(),
            class: class.into(),
            desc: desc.into(),
        }
    }

    pub(crate) fn unsupported(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_error_displays_class_and_desc() {
        let err = Error::command("device_del", "DeviceNotFound", "Device 'x' not found");
        assert_eq!(err.to_string(), "DeviceNotFound: Device 'x' not found");
        assert_eq!(err.kind(), ErrorKind::Command);
        assert!(!err.is_transport());
    }

    #[test]
    fn exec_timeout_is_not_a_transport_failure() {
        let err = Error::ExecTimeout {
            pid: 42,
            waited: Duration::from_secs(3),
        };
        assert!(!err.is_transport());
        assert!(err.is_retryable());
    }
}
