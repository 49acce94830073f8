//! Scripted peers and transcript replay.
//!
//! This module is intended for:
//! - unit/integration tests
//! - reproducing a QEMU conversation recorded as JSONL
//!
//! It is gated behind `cfg(test)` or the `mock` Cargo feature.
//!
//! Every server accepts connections one at a time until it is shut down,
//! so a client that redials (like the guest agent) finds it again.

mod hmp;
mod qga;
mod qmp;
mod transcript;

#[cfg(unix)]
use std::path::Path;
use std::{future::Future, sync::Arc};

use serde_json::Value;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    sync::{Mutex, mpsc, oneshot},
};

#[cfg(unix)]
use tokio::net::UnixListener;

pub use hmp::{HmpScript, MockHmpServer};
pub use qga::{GuestAgentScript, MockExec, MockGuestAgent};
pub use qmp::{MockQmpServer, MockReply, QmpScript};
pub use transcript::{ReplayServer, Transcript, TranscriptStep};

use crate::{
    error::{Error, Result},
    transport::{Endpoint, MonitorStream},
};

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    async fn tcp() -> Result<(Self, Endpoint)> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(Error::from)?;
        let addr = listener.local_addr().map_err(Error::from)?;
        let endpoint = Endpoint::tcp(addr.ip().to_string(), addr.port());
        Ok((Self::Tcp(listener), endpoint))
    }

    #[cfg(unix)]
    fn unix(path: &Path) -> Result<(Self, Endpoint)> {
        // Best effort cleanup.
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path).map_err(Error::from)?;
        Ok((Self::Unix(listener), Endpoint::unix(path)))
    }

    async fn accept(&self) -> Result<MonitorStream> {
        match self {
            Self::Tcp(l) => {
                let (s, _peer) = l.accept().await.map_err(Error::from)?;
                Ok(Box::new(s))
            }
            #[cfg(unix)]
            Self::Unix(l) => {
                let (s, _addr) = l.accept().await.map_err(Error::from)?;
                Ok(Box::new(s))
            }
        }
    }
}

/// Accept loop shared by all mock servers.
///
/// Dropping the handle does not stop the server; call
/// [`shutdown`](Self::shutdown).
#[derive(Debug, Clone)]
pub(crate) struct ServerHandle {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    endpoint: Endpoint,
    shutdown_tx: mpsc::Sender<()>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl ServerHandle {
    async fn start_tcp<H, F>(handler: H) -> Result<Self>
    where
        H: FnMut(MonitorStream) -> F + Send + 'static,
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let (listener, endpoint) = Listener::tcp().await?;
        Ok(Self::spawn(listener, endpoint, handler))
    }

    #[cfg(unix)]
    fn start_unix<H, F>(path: &Path, handler: H) -> Result<Self>
    where
        H: FnMut(MonitorStream) -> F + Send + 'static,
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let (listener, endpoint) = Listener::unix(path)?;
        Ok(Self::spawn(listener, endpoint, handler))
    }

    fn spawn<H, F>(listener: Listener, endpoint: Endpoint, mut handler: H) -> Self
    where
        H: FnMut(MonitorStream) -> F + Send + 'static,
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(async move {
            tokio::select! {
                () = async {
                    while let Ok(stream) = listener.accept().await {
                        if let Err(_e) = handler(stream).await {
                            #[cfg(feature = "tracing")]
                            tracing::debug!(error = %_e, "mock connection ended with error");
                        }
                    }
                } => {}
                _ = shutdown_rx.recv() => {}
            }

            let _ = done_tx.send(());
        });

        Self {
            inner: Arc::new(Inner {
                endpoint,
                shutdown_tx,
                done_rx: Mutex::new(Some(done_rx)),
            }),
        }
    }

    fn endpoint(&self) -> Endpoint {
        self.inner.endpoint.clone()
    }

    /// Stop accepting, drop the active connection and wait for completion.
    async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(()).await;
        let mut rx = self.inner.done_rx.lock().await;
        if let Some(done) = rx.take() {
            let _ = done.await;
        }
    }
}

async fn send_line<W: AsyncWrite + Unpin>(w: &mut W, line: &[u8]) -> Result<()> {
    w.write_all(line).await.map_err(Error::from)?;
    w.write_all(b"\r\n").await.map_err(Error::from)?;
    w.flush().await.map_err(Error::from)
}

async fn send_json<W: AsyncWrite + Unpin>(w: &mut W, msg: &Value) -> Result<()> {
    send_line(w, msg.to_string().as_bytes()).await
}

/// Next JSON line from the client, `None` once it hangs up.
async fn recv_json<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Option<Value>> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = r.read_line(&mut line).await.map_err(Error::from)?;
        if n == 0 {
            return Ok(None);
        }

        let trimmed = line.trim();
        if !trimmed.is_empty() {
            return serde_json::from_str(trimmed).map(Some).map_err(Error::from);
        }
    }
}

fn command_name(req: &Value) -> String {
    req.get("execute")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
