//! In-process simulated link between two channels.
//!
//! Each direction is a delay line: messages are delivered in send order, each one
//! `delay` after it was sent. Deterministic loss is available by dropping every n-th
//! message of a direction. Timing uses `tokio::time`, so links behave exactly under a
//! paused test clock.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::mpsc, time::Instant};

use super::{Channel, ChannelError, MessageSink};

/// Behaviour of one direction of a simulated link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkConfig {
    /// One-way delay applied to every message.
    pub delay: Duration,
    /// Drop every n-th message sent in this direction (1 drops everything).
    pub drop_every: Option<u32>,
}

impl LinkConfig {
    pub fn with_delay(delay: Duration) -> Self {
        LinkConfig {
            delay,
            drop_every: None,
        }
    }

    pub fn dropping_every(mut self, n: u32) -> Self {
        self.drop_every = Some(n);
        self
    }
}

struct DelaySink {
    config: LinkConfig,
    sent: AtomicU32,
    line: mpsc::UnboundedSender<(Instant, String)>,
}

impl MessageSink for DelaySink {
    fn send(&self, text: String) -> Result<(), ChannelError> {
        let count = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(n) = self.config.drop_every {
            if n > 0 && count % n == 0 {
                log::trace!("link dropped {:?}", text);
                return Ok(());
            }
        }
        self.line
            .send((Instant::now() + self.config.delay, text))
            .map_err(|_| ChannelError::Closed)
    }
}

/// Builds one direction and returns its sink and the receiving end.
fn direction(config: LinkConfig) -> (Arc<DelaySink>, mpsc::UnboundedReceiver<String>) {
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<(Instant, String)>();
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    // Ends on its own once either side of the direction is dropped.
    tokio::spawn(async move {
        while let Some((deliver_at, text)) = line_rx.recv().await {
            tokio::time::sleep_until(deliver_at).await;
            if out_tx.send(text).is_err() {
                break;
            }
        }
    });

    let sink = Arc::new(DelaySink {
        config,
        sent: AtomicU32::new(0),
        line: line_tx,
    });
    (sink, out_rx)
}

/// Creates two connected channels with per-direction behaviour.
///
/// Must be called from within a tokio runtime.
pub fn pair(a_to_b: LinkConfig, b_to_a: LinkConfig) -> (Channel, Channel) {
    let (sink_a, inbound_b) = direction(a_to_b);
    let (sink_b, inbound_a) = direction(b_to_a);
    (
        Channel::new(sink_a, inbound_a),
        Channel::new(sink_b, inbound_b),
    )
}

/// Creates two connected channels with the same behaviour in both directions.
pub fn symmetric(config: LinkConfig) -> (Channel, Channel) {
    pair(config, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_delivery_after_delay_in_order() {
        let (a, mut b) = symmetric(LinkConfig::with_delay(Duration::from_millis(25)));
        let start = Instant::now();

        a.send("one".to_string()).unwrap();
        a.send("two".to_string()).unwrap();

        assert_eq!(b.recv().await.as_deref(), Some("one"));
        assert_eq!(start.elapsed(), Duration::from_millis(25));
        assert_eq!(b.recv().await.as_deref(), Some("two"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_directions_are_independent() {
        let (mut a, mut b) = pair(
            LinkConfig::with_delay(Duration::from_millis(10)),
            LinkConfig::with_delay(Duration::from_millis(40)),
        );
        let start = Instant::now();

        b.send("back".to_string()).unwrap();
        a.send("forth".to_string()).unwrap();

        assert_eq!(b.recv().await.as_deref(), Some("forth"));
        assert_eq!(start.elapsed(), Duration::from_millis(10));
        assert_eq!(a.recv().await.as_deref(), Some("back"));
        assert_eq!(start.elapsed(), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_every_nth() {
        let (a, mut b) = symmetric(LinkConfig::default().dropping_every(3));

        for i in 1..=6 {
            a.send(i.to_string()).unwrap();
        }
        drop(a);

        let mut delivered = Vec::new();
        while let Some(text) = b.recv().await {
            delivered.push(text);
        }
        assert_eq!(delivered, vec!["1", "2", "4", "5"]);
    }
}
