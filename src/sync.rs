//! Async driver running a [`Session`] over a [`Channel`].
//!
//! ```no_run
//! use peer_timesync::{channel::udp, session::{Role, SyncConfig}, sync::TimeSync};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let channel = udp::connect("0.0.0.0:8620".parse()?, "192.168.1.2:8620".parse()?).await?;
//! let mut sync = TimeSync::new(channel, SyncConfig::default())?;
//! let mut events = sync.subscribe();
//! sync.start(Role::Initiator)?;
//! let outcome = sync.run().await?;
//! println!("{:?}, last event {:?}", outcome, events.try_recv());
//! # Ok(())
//! # }
//! ```

use serde::Serialize;
use tokio::{sync::mpsc, time::Instant};

use crate::{
    channel::Channel,
    messages::{CodecError, Message},
    session::{Role, Session, SessionState, SyncConfig, SyncError, SyncEvent},
};

/// How a synchronization ended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum SyncOutcome {
    /// A latency is known; `initiator` is true if this side computed it.
    Done { initiator: bool, latency: f64 },
    TimedOut,
    Aborted,
}

impl SyncOutcome {
    pub fn latency(&self) -> Option<f64> {
        match *self {
            SyncOutcome::Done { latency, .. } => Some(latency),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, SyncOutcome::Done { .. })
    }
}

/// Clock synchronization attached to one channel.
///
/// Inbound messages that are not part of the protocol are forwarded to the channel's
/// passthrough handler while the synchronization runs.
pub struct TimeSync {
    session: Session,
    channel: Channel,
    subscribers: Vec<mpsc::UnboundedSender<SyncEvent>>,
    outcome: Option<SyncOutcome>,
}

impl TimeSync {
    /// Attaches to `channel`. Fails if the channel can no longer deliver anything or
    /// the tunables are unusable.
    pub fn new(channel: Channel, config: SyncConfig) -> Result<TimeSync, SyncError> {
        config.validate()?;
        if channel.is_closed() {
            return Err(SyncError::ChannelClosed);
        }
        Ok(TimeSync {
            session: Session::new(config),
            channel,
            subscribers: Vec::new(),
            outcome: None,
        })
    }

    /// Returns a stream of every event emitted from now on.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Starts synchronizing. See [`Session::start`].
    pub fn start(&mut self, role: Role) -> Result<(), SyncError> {
        self.session.start(role, Instant::now())?;
        self.outcome = None;
        log::info!("time sync started as {}", role);
        Ok(())
    }

    /// Stops probing. The next [`TimeSync::run`] returns [`SyncOutcome::Aborted`].
    pub fn abort(&mut self) -> bool {
        let aborted = self.session.abort();
        if aborted {
            self.outcome = Some(SyncOutcome::Aborted);
        }
        aborted
    }

    /// Drives the session until it reaches a terminal state.
    ///
    /// A responder keeps echoing probes until the peer's completion arrives. Returns
    /// [`SyncError::ChannelClosed`] if the peer goes away first.
    pub async fn run(&mut self) -> Result<SyncOutcome, SyncError> {
        loop {
            self.flush();
            if let Some(outcome) = self.outcome {
                log::info!("time sync finished: {:?}", outcome);
                return Ok(outcome);
            }

            let timer = self.session.poll_timeout();
            tokio::select! {
                inbound = self.channel.recv() => {
                    match inbound {
                        Some(text) => self.handle_text(text),
                        None => {
                            log::warn!("channel closed during time sync");
                            return Err(SyncError::ChannelClosed);
                        }
                    }
                }

                _ = sleep_until(timer) => {
                    self.session.handle_timeout(Instant::now());
                }
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Latency in milliseconds, once done.
    pub fn latency(&self) -> Option<f64> {
        self.session.latency()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Detaches from the channel and gives it back.
    pub fn into_channel(self) -> Channel {
        self.channel
    }

    fn handle_text(&mut self, text: String) {
        match Message::decode(&text) {
            Ok(msg) => self.session.handle_message(msg, Instant::now()),
            Err(CodecError::Unrecognized) => self.channel.forward(text),
            Err(e) => log::warn!("dropping message: {}", e),
        }
    }

    /// Sends queued messages and publishes queued events.
    fn flush(&mut self) {
        while let Some(msg) = self.session.poll_transmit() {
            // Best-effort transport: a failed send is a lost probe.
            if let Err(e) = self.channel.send(msg.encode()) {
                log::warn!("failed to send {}: {}", msg, e);
            }
        }

        while let Some(event) = self.session.poll_event() {
            match event {
                SyncEvent::Done { initiator, latency } => {
                    self.outcome = Some(SyncOutcome::Done { initiator, latency });
                }
                SyncEvent::Timeout => self.outcome = Some(SyncOutcome::TimedOut),
                SyncEvent::Request(_) | SyncEvent::Reply(_) => {}
            }
            self.subscribers.retain(|tx| tx.send(event).is_ok());
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Runs a whole synchronization as `role` over `channel`.
pub async fn synchronize(
    channel: Channel,
    config: SyncConfig,
    role: Role,
) -> Result<SyncOutcome, SyncError> {
    let mut sync = TimeSync::new(channel, config)?;
    sync.start(role)?;
    sync.run().await
}
