//! The duplex text channel synchronization runs over.
//!
//! The channel itself is established elsewhere; this module only describes the two
//! halves the protocol needs:
//! - an outbound [`MessageSink`], best-effort and order preserving
//! - an inbound stream yielding one `String` per message the peer sent
//!
//! A channel is usually shared with other consumers (game state, chat, ...). Messages
//! that are not part of the synchronization protocol are handed to the [`Passthrough`]
//! handler registered before synchronization attached itself.

pub mod link;
pub mod udp;

use std::sync::Arc;

use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};

/// Errors reported by channel implementations.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The peer side of the channel is gone.
    #[error("channel is closed")]
    Closed,

    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound half of a channel.
pub trait MessageSink: Send + Sync {
    /// Queues `text` for delivery to the peer. Delivery is not guaranteed.
    fn send(&self, text: String) -> Result<(), ChannelError>;
}

/// Handler receiving every inbound message the protocol does not recognize.
pub type Passthrough = Box<dyn FnMut(String) + Send>;

/// A connected duplex text channel to exactly one peer.
pub struct Channel {
    sink: Arc<dyn MessageSink>,
    inbound: mpsc::UnboundedReceiver<String>,
    passthrough: Option<Passthrough>,
    tasks: Vec<JoinHandle<()>>,
}

impl Channel {
    /// Creates a channel from its two halves.
    pub fn new(sink: Arc<dyn MessageSink>, inbound: mpsc::UnboundedReceiver<String>) -> Self {
        Channel {
            sink,
            inbound,
            passthrough: None,
            tasks: Vec::new(),
        }
    }

    /// Registers the handler for messages that are not part of the protocol.
    pub fn with_passthrough<F>(mut self, handler: F) -> Self
    where
        F: FnMut(String) + Send + 'static,
    {
        self.passthrough = Some(Box::new(handler));
        self
    }

    /// Ties a background task (reader, delay line) to the lifetime of the channel.
    pub(crate) fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.tasks.push(task);
        self
    }

    /// Sends a text message to the peer.
    pub fn send(&self, text: String) -> Result<(), ChannelError> {
        self.sink.send(text)
    }

    /// Outbound half, for other consumers sharing the channel.
    pub fn sink(&self) -> Arc<dyn MessageSink> {
        self.sink.clone()
    }

    /// Waits for the next inbound message; `None` once the peer is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    /// Returns true if no further inbound message can ever arrive.
    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed() && self.inbound.is_empty()
    }

    /// Hands a foreign message to the passthrough handler, if any.
    pub fn forward(&mut self, text: String) {
        match self.passthrough.as_mut() {
            Some(handler) => handler(text),
            None => log::debug!("dropping foreign message {:?}", text),
        }
    }

    /// Returns the outbound sink and the inbound stream, dropping the passthrough handler.
    ///
    /// Background tasks keep running for as long as the returned halves need them.
    pub fn into_parts(mut self) -> (Arc<dyn MessageSink>, mpsc::UnboundedReceiver<String>) {
        // Tasks are detached rather than aborted so the halves stay usable.
        self.tasks.clear();
        let (dummy_tx, dummy_rx) = mpsc::unbounded_channel();
        drop(dummy_tx);
        let inbound = std::mem::replace(&mut self.inbound, dummy_rx);
        (self.sink.clone(), inbound)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Sink backed by an in-process queue, useful for tests and adapters.
pub struct QueueSink(pub mpsc::UnboundedSender<String>);

impl MessageSink for QueueSink {
    fn send(&self, text: String) -> Result<(), ChannelError> {
        self.0.send(text).map_err(|_| ChannelError::Closed)
    }
}

/// Creates a channel whose outbound messages land in the returned receiver and whose
/// inbound messages are fed through the returned sender.
pub fn queue_channel() -> (
    Channel,
    mpsc::UnboundedSender<String>,
    mpsc::UnboundedReceiver<String>,
) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let channel = Channel::new(Arc::new(QueueSink(out_tx)), in_rx);
    (channel, in_tx, out_rx)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[tokio::test]
    async fn test_queue_channel_both_directions() {
        let (mut channel, inbound, mut outbound) = queue_channel();

        channel.send("ping".to_string()).unwrap();
        assert_eq!(outbound.recv().await.as_deref(), Some("ping"));

        inbound.send("pong".to_string()).unwrap();
        assert_eq!(channel.recv().await.as_deref(), Some("pong"));
    }

    #[tokio::test]
    async fn test_closed_after_peer_dropped() {
        let (mut channel, inbound, _outbound) = queue_channel();
        assert!(!channel.is_closed());

        inbound.send("last".to_string()).unwrap();
        drop(inbound);
        // Still readable until drained.
        assert!(!channel.is_closed());
        assert_eq!(channel.recv().await.as_deref(), Some("last"));
        assert!(channel.is_closed());
        assert_eq!(channel.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_fails_when_outbound_dropped() {
        let (channel, _inbound, outbound) = queue_channel();
        drop(outbound);
        assert!(matches!(
            channel.send("x".to_string()),
            Err(ChannelError::Closed)
        ));
    }

    #[test]
    fn test_forward_reaches_passthrough() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let (channel, _inbound, _outbound) = queue_channel();
        let mut channel = channel.with_passthrough(move |text| sink.lock().unwrap().push(text));

        channel.forward("chat:hi".to_string());
        channel.forward("state:42".to_string());

        assert_eq!(*seen.lock().unwrap(), vec!["chat:hi", "state:42"]);
    }

    #[tokio::test]
    async fn test_into_parts_keeps_both_halves() {
        let (channel, inbound, mut outbound) = queue_channel();
        let (sink, mut rx) = channel.with_passthrough(|_| {}).into_parts();

        sink.send("out".to_string()).unwrap();
        inbound.send("in".to_string()).unwrap();

        assert_eq!(outbound.recv().await.as_deref(), Some("out"));
        assert_eq!(rx.recv().await.as_deref(), Some("in"));
    }

    #[test]
    fn test_forward_without_passthrough_is_silent() {
        let (mut channel, _inbound, _outbound) = queue_channel();
        channel.forward("nobody listens".to_string());
    }
}
