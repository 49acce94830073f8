//! Running processes in the guest.
//!
//! `guest-exec` only starts a process; its result has to be collected by
//! polling `guest-exec-status` until the agent reports it exited.

use std::{future::Future, pin::Pin, time::Duration};

use serde_json::json;

use crate::{
    cancel::CancelToken,
    error::{Error, Result},
    qga::{ExecOutput, ExecRequest, GuestAgent, GuestExec, GuestExecStatus},
    types::Command,
};

/// Abstraction over sleeping between status polls, mainly for
/// deterministic tests.
pub trait Sleeper: Send + Sync {
    /// Sleep for the given duration.
    fn sleep<'a>(&'a self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Default Tokio-based sleep.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleep;

impl Sleeper for TokioSleep {
    fn sleep<'a>(&'a self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

impl GuestAgent {
    /// `guest-exec`: start a process and return its guest pid.
    pub async fn guest_exec(&self, request: &ExecRequest) -> Result<i64> {
        let exec: GuestExec = self
            .call(Command::with_args("guest-exec", request.to_args()))
            .await?;
        Ok(exec.pid)
    }

    /// `guest-exec-status` for a pid returned by [`guest_exec`](Self::guest_exec).
    pub async fn guest_exec_status(&self, pid: i64) -> Result<GuestExecStatus> {
        self.call(Command::with_args("guest-exec-status", json!({ "pid": pid })))
            .await
    }

    /// Start a process and wait for it to exit.
    ///
    /// The wait is split in ticks of
    /// [`poll_interval`](crate::GuestAgentOptions::poll_interval): each tick
    /// sleeps once and then polls the status once, so a process seen as
    /// exited on the n-th poll costs exactly n ticks. `timeout_secs` is the
    /// number of ticks; zero or less means
    /// [`exec_timeout_secs`](crate::GuestAgentOptions::exec_timeout_secs).
    ///
    /// On timeout the guest process keeps running.
    pub async fn command_with_timeout(
        &self,
        request: &ExecRequest,
        timeout_secs: i64,
    ) -> Result<ExecOutput> {
        self.wait_command(request, timeout_secs, None).await
    }

    /// Like [`command_with_timeout`](Self::command_with_timeout), but the
    /// caller can stop waiting early with `cancel`.
    pub async fn command_with_cancel(
        &self,
        request: &ExecRequest,
        timeout_secs: i64,
        cancel: &CancelToken,
    ) -> Result<ExecOutput> {
        self.wait_command(request, timeout_secs, Some(cancel)).await
    }

    /// Run `path` with `args` and `env`, feeding `stdin`, and wait for it.
    pub async fn run_command(
        &self,
        path: &str,
        args: &[&str],
        env: &[&str],
        stdin: &[u8],
        capture_output: bool,
        timeout_secs: i64,
    ) -> Result<ExecOutput> {
        let mut request = ExecRequest::new(path)
            .args(args.iter().copied())
            .stdin(stdin)
            .capture_output(capture_output);
        for entry in env {
            request = request.env(*entry);
        }
        self.command_with_timeout(&request, timeout_secs).await
    }

    async fn wait_command(
        &self,
        request: &ExecRequest,
        timeout_secs: i64,
        cancel: Option<&CancelToken>,
    ) -> Result<ExecOutput> {
        let ticks = if timeout_secs <= 0 {
            u32::max(self.options.exec_timeout_secs, 1)
        } else {
            u32::try_from(timeout_secs).unwrap_or(u32::MAX)
        };
        let interval = self.options.poll_interval;

        let pid = self.guest_exec(request).await?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            agent = %self.id,
            path = %request.path,
            pid,
            ticks,
            "guest process started"
        );

        for _tick in 1..=ticks {
            match cancel {
                Some(token) => {
                    tokio::select! {
                        biased;
                        () = token.cancelled() => {
                            #[cfg(feature = "tracing")]
                            tracing::debug!(agent = %self.id, pid, "exec wait cancelled");
                            return Err(Error::Cancelled);
                        }
                        () = self.sleeper.sleep(interval) => {}
                    }
                }
                None => self.sleeper.sleep(interval).await,
            }

            let status = self.guest_exec_status(pid).await?;
            if !status.exited {
                #[cfg(feature = "tracing")]
                tracing::trace!(agent = %self.id, pid, tick = _tick, "guest process still running");
                continue;
            }

            let output = ExecOutput::from_status(pid, status, request.capture_output)?;

            #[cfg(feature = "tracing")]
            tracing::debug!(
                agent = %self.id,
                pid,
                exit_code = output.exit_code,
                ticks = _tick,
                "guest process exited"
            );

            return Ok(output);
        }

        let waited = interval.saturating_mul(ticks);

        #[cfg(feature = "tracing")]
        tracing::warn!(
            agent = %self.id,
            path = %request.path,
            pid,
            waited = ?waited,
            "guest process did not exit in time"
        );

        Err(Error::ExecTimeout { pid, waited })
    }
}
