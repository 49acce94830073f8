//! Ordered callback delivery.
//!
//! Reader and writer loops never run user continuations themselves. They hand
//! each `(callback, reply)` pair to the monitor's dispatcher, a single task
//! that runs them one at a time in submission order.

use std::panic::{AssertUnwindSafe, catch_unwind};

use tokio::{runtime::Handle, sync::mpsc};

/// A continuation bound to its argument, ready to run.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone)]
pub(crate) struct Dispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

impl Dispatcher {
    /// Start the dispatch task on `runtime`.
    ///
    /// The task ends once every handle to the dispatcher is dropped and the
    /// backlog has been drained.
    pub(crate) fn spawn(runtime: &Handle, monitor: &str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        #[cfg(feature = "tracing")]
        let monitor = monitor.to_string();
        #[cfg(not(feature = "tracing"))]
        let _ = monitor;

        runtime.spawn(async move {
            while let Some(job) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::error!(monitor = %monitor, "monitor callback panicked");
                }
            }
        });

        Self { tx }
    }

    /// Queue a job behind everything submitted before it.
    pub(crate) fn submit(&self, job: Job) {
        if let Err(mpsc::error::SendError(job)) = self.tx.send(job) {
            // The runtime is shutting down; run inline rather than lose it.
            let _ = catch_unwind(AssertUnwindSafe(job));
        }
    }
}
