//! Socket transport shared by the monitors and the guest agent.

use std::{fmt, path::PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};

/// Control socket endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Connect via a Unix domain socket.
    Unix {
        /// Socket path.
        path: PathBuf,
    },

    /// Connect via a TCP socket.
    Tcp {
        /// Hostname or IP.
        host: String,
        /// Port.
        port: u16,
    },
}

impl Endpoint {
    /// Create a Unix socket endpoint.
    #[must_use]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Create a TCP endpoint.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path } => write!(f, "unix:{}", path.display()),
            Self::Tcp { host, port } => write!(f, "tcp:{host}:{port}"),
        }
    }
}

/// Any duplex byte stream a monitor can run on.
pub trait AsyncMonitorStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncMonitorStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A connected stream.
///
/// Boxed so the monitors do not care whether the connection is Unix, TCP or
/// an in-memory pipe.
pub type MonitorStream = Box<dyn AsyncMonitorStream>;

/// Dial an endpoint.
pub async fn connect(endpoint: &Endpoint) -> Result<MonitorStream> {
    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix { path } => {
            let s = tokio::net::UnixStream::connect(path)
                .await
                .map_err(Error::from)?;
            Ok(Box::new(s))
        }
        #[cfg(not(unix))]
        Endpoint::Unix { .. } => Err(Error::protocol(
            "unix sockets are not supported on this platform",
        )),
        Endpoint::Tcp { host, port } => {
            let s = tokio::net::TcpStream::connect((host.as_str(), *port))
                .await
                .map_err(Error::from)?;
            // Monitor traffic is small request/response lines.
            let _ = s.set_nodelay(true);
            Ok(Box::new(s))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_display() {
        assert_eq!(
            Endpoint::unix("/run/vm/100.mon").to_string(),
            "unix:/run/vm/100.mon"
        );
        assert_eq!(Endpoint::tcp("127.0.0.1", 4444).to_string(), "tcp:127.0.0.1:4444");
    }

    #[tokio::test]
    async fn dial_failure_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = connect(&Endpoint::unix(dir.path().join("missing.sock")))
            .await
            .err()
            .expect("must fail");
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
    }
}
