//! Event types delivered to callers and the stream wrapper that carries them

use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Asynchronous arrivals on an active connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// One frame read from the radio, undecoded
    Data(Vec<u8>),
    /// A firmware log record, already rendered to text
    LogLine(String),
    /// Signal strength in dBm
    SignalUpdated(i16),
    /// Terminal: the session ended without an error
    Disconnected { should_reconnect: bool },
    /// Terminal: the session ended because of `cause`
    Error {
        should_reconnect: bool,
        cause: TransportError,
    },
}

impl ConnectionEvent {
    /// True for the event that closes a connection's stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionEvent::Disconnected { .. } | ConnectionEvent::Error { .. }
        )
    }

    pub fn should_reconnect(&self) -> Option<bool> {
        match self {
            ConnectionEvent::Disconnected { should_reconnect }
            | ConnectionEvent::Error {
                should_reconnect, ..
            } => Some(*should_reconnect),
            _ => None,
        }
    }
}

/// Pull-based sequence of events. Ends when the producer closes it.
///
/// Dropping the stream tells the producer the consumer stopped listening; for
/// discovery that stops scanning.
pub struct EventStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
    on_recv: Option<Box<dyn FnMut(T) -> T + Send + Sync>>,
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl<T> EventStream<T> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self {
            rx,
            on_recv: None,
            on_drop: None,
        }
    }

    pub(crate) fn with_drop_hook(
        rx: mpsc::UnboundedReceiver<T>,
        on_drop: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            rx,
            on_recv: None,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// Rewrite every event as it is taken off the stream
    pub(crate) fn map_received(mut self, on_recv: impl FnMut(T) -> T + Send + Sync + 'static) -> Self {
        self.on_recv = Some(Box::new(on_recv));
        self
    }

    fn received(&mut self, event: Option<T>) -> Option<T> {
        match &mut self.on_recv {
            Some(on_recv) => event.map(on_recv),
            None => event,
        }
    }

    /// Wait for the next event; `None` once the stream has been closed
    pub async fn next(&mut self) -> Option<T> {
        let event = self.rx.recv().await;
        self.received(event)
    }

    /// Take an already queued event without waiting
    pub fn try_next(&mut self) -> Option<T> {
        let event = self.rx.try_recv().ok();
        self.received(event)
    }
}

impl<T> Stream for EventStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = &mut *self;
        match this.rx.poll_recv(cx) {
            Poll::Ready(event) => Poll::Ready(this.received(event)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for EventStream<T> {
    fn drop(&mut self) {
        if let Some(hook) = self.on_drop.take() {
            hook();
        }
    }
}

/// Stream of events for one connection
pub type ConnectionEvents = EventStream<ConnectionEvent>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_stream_ends_when_sender_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = EventStream::new(rx);
        tx.send(ConnectionEvent::Data(vec![1])).unwrap();
        drop(tx);
        assert_eq!(stream.next().await, Some(ConnectionEvent::Data(vec![1])));
        assert_eq!(stream.next().await, None);
    }

    #[test]
    fn test_drop_hook_runs_once() {
        let (_tx, rx) = mpsc::unbounded_channel::<ConnectionEvent>();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let stream = EventStream::with_drop_hook(rx, move || flag.store(true, Ordering::SeqCst));
        assert!(!fired.load(Ordering::SeqCst));
        drop(stream);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_received_events_are_rewritten() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = EventStream::new(rx).map_received(|event| match event {
            ConnectionEvent::SignalUpdated(rssi) => ConnectionEvent::SignalUpdated(rssi - 10),
            other => other,
        });
        tx.send(ConnectionEvent::SignalUpdated(-50)).unwrap();
        tx.send(ConnectionEvent::Data(vec![7])).unwrap();
        assert_eq!(stream.try_next(), Some(ConnectionEvent::SignalUpdated(-60)));
        assert_eq!(stream.try_next(), Some(ConnectionEvent::Data(vec![7])));
        assert_eq!(stream.try_next(), None);
    }

    #[test]
    fn test_terminal_events() {
        let err = ConnectionEvent::Error {
            should_reconnect: true,
            cause: TransportError::link_lost("gone"),
        };
        assert!(err.is_terminal());
        assert_eq!(err.should_reconnect(), Some(true));
        assert!(!ConnectionEvent::SignalUpdated(-50).is_terminal());
        assert_eq!(ConnectionEvent::LogLine("x".into()).should_reconnect(), None);
    }
}
