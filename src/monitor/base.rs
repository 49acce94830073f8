//! Connection lifecycle shared by the HMP and QMP monitors.
//!
//! One mutex guards the command queue, the callback queue and the
//! `reading`/`writing` guards. Socket I/O always happens outside of it.

use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    runtime::Handle,
    time::Instant,
};

use crate::{
    cancel::CancelToken,
    error::{Error, Result},
    monitor::{Callback, MonitorHooks, MonitorState, dispatch::Dispatcher},
    options::MonitorOptions,
    transport::MonitorStream,
};

/// Wire-specific half of a monitor.
pub(crate) trait Protocol: Send + Sync + Sized + 'static {
    /// Command as submitted by callers.
    type Command: Send + 'static;
    /// Reply handed to callbacks.
    type Reply: Send + 'static;

    /// Protocol name for logs.
    const NAME: &'static str;

    /// Render a command for the wire.
    fn encode(command: &Self::Command) -> Result<Outbound>;

    /// Start the reader loop for this protocol.
    ///
    /// The loop must end with [`BaseMonitor::reader_exited`].
    fn spawn_reader(base: Arc<BaseMonitor<Self>>, reader: ReadHalf<MonitorStream>);
}

/// A command rendered for the wire.
#[derive(Debug, Clone)]
pub(crate) struct Outbound {
    /// Short name for logs and error messages.
    pub(crate) label: String,
    pub(crate) wire: Vec<u8>,
}

struct Pending<R> {
    label: String,
    callback: Option<Callback<R>>,
}

struct Inner<R> {
    state: MonitorState,
    reading: bool,
    writing: bool,
    commands: VecDeque<Outbound>,
    callbacks: VecDeque<Pending<R>>,
    reader: Option<ReadHalf<MonitorStream>>,
    writer: Option<WriteHalf<MonitorStream>>,
    deadline: Option<Instant>,
}

impl<R> Inner<R> {
    /// Move to `Disconnected`, releasing the transport and every queued
    /// command. Returns the previous state and the orphaned callbacks.
    fn close(&mut self) -> (MonitorState, Vec<Pending<R>>) {
        let previous = self.state;
        if previous == MonitorState::Disconnected {
            return (previous, Vec::new());
        }

        self.state = MonitorState::Disconnected;
        self.deadline = None;
        self.reader = None;
        self.writer = None;
        self.commands.clear();
        (previous, self.callbacks.drain(..).collect())
    }
}

pub(crate) struct BaseMonitor<P: Protocol> {
    id: String,
    pub(crate) proto: P,
    runtime: Handle,
    dispatcher: Dispatcher,
    hooks: MonitorHooks,
    connect_timeout: Duration,
    closed: CancelToken,
    inner: Mutex<Inner<P::Reply>>,
}

impl<P: Protocol> BaseMonitor<P> {
    /// Wrap a freshly opened stream and arm the connect deadline.
    ///
    /// Must be called from within a Tokio runtime; loops and the dispatcher
    /// are spawned on it.
    pub(crate) fn new(
        id: String,
        proto: P,
        stream: MonitorStream,
        options: &MonitorOptions,
        hooks: MonitorHooks,
    ) -> Result<Arc<Self>> {
        let runtime = Handle::try_current()
            .map_err(|_| Error::protocol("monitors must be created inside a Tokio runtime"))?;
        let dispatcher = Dispatcher::spawn(&runtime, &id);
        let (reader, writer) = tokio::io::split(stream);

        Ok(Arc::new(Self {
            id,
            proto,
            runtime,
            dispatcher,
            hooks,
            connect_timeout: options.connect_timeout,
            closed: CancelToken::new(),
            inner: Mutex::new(Inner {
                state: MonitorState::Connecting,
                reading: false,
                writing: false,
                commands: VecDeque::new(),
                callbacks: VecDeque::new(),
                reader: Some(reader),
                writer: Some(writer),
                deadline: Some(Instant::now() + options.connect_timeout),
            }),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, Inner<P::Reply>> {
        // Critical sections never run user code, a poisoned lock still holds
        // consistent queues.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn state(&self) -> MonitorState {
        self.lock().state
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Number of callbacks still waiting for a reply.
    pub(crate) fn pending(&self) -> usize {
        self.lock().callbacks.len()
    }

    /// Take ownership of the reader side if no reader loop is active.
    pub(crate) fn check_reading(&self) -> Option<ReadHalf<MonitorStream>> {
        let mut inner = self.lock();
        if inner.reading {
            return None;
        }
        let reader = inner.reader.take()?;
        inner.reading = true;
        Some(reader)
    }

    /// Take ownership of the writer side if there is work, the handshake is
    /// done and no writer loop is active.
    pub(crate) fn check_writing(&self) -> Option<WriteHalf<MonitorStream>> {
        let mut inner = self.lock();
        if inner.writing || inner.state != MonitorState::Connected || inner.commands.is_empty() {
            return None;
        }
        let writer = inner.writer.take()?;
        inner.writing = true;
        Some(writer)
    }

    /// Queue a command and its continuation, then make sure the loops run.
    pub(crate) fn enqueue(
        self: &Arc<Self>,
        command: P::Command,
        callback: Option<Callback<P::Reply>>,
    ) {
        let out = match P::encode(&command) {
            Ok(out) => out,
            Err(e) => {
                if let Some(cb) = callback {
                    self.dispatch(cb, Err(e));
                }
                return;
            }
        };

        let pending = Pending {
            label: out.label.clone(),
            callback,
        };

        let rejected = {
            let mut inner = self.lock();
            if inner.state == MonitorState::Disconnected {
                Some(pending)
            } else {
                inner.commands.push_back(out);
                inner.callbacks.push_back(pending);
                None
            }
        };

        if let Some(pending) = rejected {
            self.abandon(vec![pending]);
            return;
        }

        self.ensure_loops();
    }

    pub(crate) fn ensure_loops(self: &Arc<Self>) {
        self.ensure_writer();
        self.ensure_reader();
    }

    pub(crate) fn ensure_reader(self: &Arc<Self>) {
        if let Some(reader) = self.check_reading() {
            P::spawn_reader(self.clone(), reader);
        }
    }

    pub(crate) fn ensure_writer(self: &Arc<Self>) {
        if let Some(writer) = self.check_writing() {
            let base = self.clone();
            self.runtime.spawn(base.write_loop(writer));
        }
    }

    async fn write_loop(self: Arc<Self>, mut writer: WriteHalf<MonitorStream>) {
        loop {
            let next = {
                let mut inner = self.lock();
                if inner.state != MonitorState::Connected {
                    inner.writing = false;
                    return;
                }
                match inner.commands.pop_front() {
                    Some(out) => out,
                    None => {
                        inner.writing = false;
                        inner.writer = Some(writer);
                        return;
                    }
                }
            };

            #[cfg(feature = "tracing")]
            tracing::debug!(
                monitor = %self.id,
                protocol = P::NAME,
                command = %next.label,
                "writing monitor command"
            );

            let written = tokio::select! {
                biased;
                () = self.closed.cancelled() => Err(Error::Disconnected),
                res = async {
                    writer.write_all(&next.wire).await?;
                    writer.flush().await
                } => res.map_err(Error::from),
            };

            if let Err(e) = written {
                #[cfg(feature = "tracing")]
                tracing::error!(
                    monitor = %self.id,
                    protocol = P::NAME,
                    command = %next.label,
                    error = %e,
                    "monitor write failed"
                );

                self.lock().writing = false;
                drop(writer);
                self.terminate(e);
                return;
            }
        }
    }

    /// Run a read under the connect deadline (before the handshake) and
    /// abort it once the monitor is closed.
    pub(crate) async fn guarded_read<T>(
        &self,
        read: impl Future<Output = std::io::Result<T>>,
    ) -> Result<T> {
        let deadline = self.lock().deadline;
        let timeout = self.connect_timeout;

        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(Error::Disconnected),
            res = async move {
                match deadline {
                    Some(at) => match tokio::time::timeout_at(at, read).await {
                        Ok(r) => r.map_err(Error::from),
                        Err(_elapsed) => Err(Error::ConnectTimeout { timeout }),
                    },
                    None => read.await.map_err(Error::from),
                }
            } => res,
        }
    }

    /// Complete the handshake.
    ///
    /// `prelude` is placed ahead of every command queued so far. Returns
    /// `false` if the monitor was not waiting for a handshake.
    pub(crate) fn handshake(
        self: &Arc<Self>,
        prelude: Option<(Outbound, Option<Callback<P::Reply>>)>,
    ) -> bool {
        {
            let mut inner = self.lock();
            if inner.state != MonitorState::Connecting {
                return false;
            }
            inner.state = MonitorState::Connected;
            inner.deadline = None;
            if let Some((out, callback)) = prelude {
                inner.callbacks.push_front(Pending {
                    label: out.label.clone(),
                    callback,
                });
                inner.commands.push_front(out);
            }
        }

        #[cfg(feature = "tracing")]
        tracing::info!(monitor = %self.id, protocol = P::NAME, "monitor connected");

        if let Some(hook) = self.hooks.on_connected.clone() {
            self.dispatcher.submit(Box::new(move || hook()));
        }

        self.ensure_loops();
        true
    }

    /// Hand a reply to the oldest waiting callback.
    ///
    /// `make` receives the label of the command being answered. Returns
    /// `false` if nothing was waiting.
    pub(crate) fn deliver(&self, make: impl FnOnce(&str) -> Result<P::Reply>) -> bool {
        let Some(pending) = self.lock().callbacks.pop_front() else {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                monitor = %self.id,
                protocol = P::NAME,
                "dropping reply with no pending command"
            );
            return false;
        };

        let reply = make(&pending.label);
        if let Some(cb) = pending.callback {
            self.dispatch(cb, reply);
        }
        true
    }

    /// Fire the QMP event hook, if any.
    pub(crate) fn notify_event(&self, event: crate::types::Event) {
        if let Some(hook) = self.hooks.on_event.clone() {
            self.dispatcher.submit(Box::new(move || hook(event)));
        }
    }

    fn dispatch(&self, callback: Callback<P::Reply>, reply: Result<P::Reply>) {
        self.dispatcher.submit(Box::new(move || callback(reply)));
    }

    fn abandon(&self, pending: Vec<Pending<P::Reply>>) {
        for p in pending {
            if let Some(cb) = p.callback {
                self.dispatch(cb, Err(Error::Disconnected));
            }
        }
    }

    /// Called by the reader loop when it ends, with the error that ended it.
    pub(crate) fn reader_exited(&self, err: Error) {
        self.lock().reading = false;
        self.terminate(err);
    }

    /// Tear the connection down after a transport failure.
    ///
    /// A failure before the handshake reports `on_connect_failed`, after it
    /// `on_disconnect`. Nothing is reported if the monitor was already closed.
    fn terminate(&self, err: Error) {
        let (previous, orphaned) = self.lock().close();
        if previous == MonitorState::Disconnected {
            return;
        }
        self.closed.cancel();

        #[cfg(feature = "tracing")]
        tracing::warn!(
            monitor = %self.id,
            protocol = P::NAME,
            error = %err,
            handshake_done = previous == MonitorState::Connected,
            abandoned = orphaned.len(),
            "monitor connection closed"
        );

        self.abandon(orphaned);

        let hook = match previous {
            MonitorState::Connected => self.hooks.on_disconnect.clone(),
            _ => self.hooks.on_connect_failed.clone(),
        };
        if let Some(hook) = hook {
            self.dispatcher.submit(Box::new(move || hook(err)));
        }
    }

    /// Close the connection locally. Idempotent; no lifecycle hook fires.
    pub(crate) fn disconnect(&self) {
        let (previous, orphaned) = self.lock().close();
        if previous == MonitorState::Disconnected {
            return;
        }
        self.closed.cancel();

        #[cfg(feature = "tracing")]
        tracing::info!(
            monitor = %self.id,
            protocol = P::NAME,
            abandoned = orphaned.len(),
            "monitor disconnected"
        );

        self.abandon(orphaned);
    }
}

impl<P: Protocol> fmt::Debug for BaseMonitor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("BaseMonitor")
            .field("id", &self.id)
            .field("protocol", &P::NAME)
            .field("state", &inner.state)
            .field("reading", &inner.reading)
            .field("writing", &inner.writing)
            .field("queued", &inner.commands.len())
            .field("pending", &inner.callbacks.len())
            .finish()
    }
}
