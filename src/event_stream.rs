//! QMP event subscriptions.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures_core::Stream;
use tokio::sync::broadcast;
use tokio_stream::{
    StreamExt,
    wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
};

use crate::{
    error::{Error, Result},
    types::Event,
};

/// Subscription to the events of one [`QmpMonitor`](crate::QmpMonitor).
///
/// Yields `Err(Error::EventLagged)` when the subscriber fell behind and
/// events were dropped, then continues with the oldest retained event. Ends
/// once the monitor is gone.
#[derive(Debug)]
pub struct EventStream {
    inner: BroadcastStream<Event>,
}

impl EventStream {
    pub(crate) fn new(rx: broadcast::Receiver<Event>) -> Self {
        Self {
            inner: BroadcastStream::new(rx),
        }
    }

    /// Next event.
    pub async fn recv(&mut self) -> Result<Event> {
        self.next().await.unwrap_or(Err(Error::Disconnected))
    }

    /// Skip events until one named `name` arrives.
    ///
    /// Lag is not an error here; the dropped events are simply skipped.
    pub async fn wait_for(&mut self, name: &str) -> Result<Event> {
        loop {
            match self.recv().await {
                Ok(ev) if ev.name == name => return Ok(ev),
                Ok(_) | Err(Error::EventLagged { .. }) => {}
                Err(e) => return Err(e),
            }
        }
    }
}

fn convert(item: std::result::Result<Event, BroadcastStreamRecvError>) -> Result<Event> {
    item.map_err(|BroadcastStreamRecvError::Lagged(missed)| Error::EventLagged {
        missed: usize::try_from(missed).unwrap_or(usize::MAX),
    })
}

impl Stream for EventStream {
    type Item = Result<Event>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner)
            .poll_next(cx)
            .map(|item| item.map(convert))
    }
}
