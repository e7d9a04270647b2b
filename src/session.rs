//! Synchronization session state machine.
//!
//! [`Session`] holds all protocol state and performs no I/O. The caller feeds it
//! decoded inbound messages and the current time, fires its timers when
//! [`Session::poll_timeout`] says so, and drains what it produced through
//! [`Session::poll_transmit`] and [`Session::poll_event`].
//!
//! ```text
//!   Idle --start(Initiator)--> Requesting --enough samples--> Done
//!     |                            |------deadline----------> TimedOut
//!     |                            '------abort-------------> Aborted
//!     '--peer completion----------------------------------> Done
//! ```

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    time::Duration,
};

use clap::ValueEnum;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::{
    estimator::{estimate, Estimate, EstimatorMode, Sample},
    messages::{Message, ProbeIndex},
};

/// Starting probe indexes are drawn from `0..MAX_START_INDEX`.
pub const MAX_START_INDEX: ProbeIndex = 10_000;

/// Default interval between two probes.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(30);
/// Default number of samples collected before estimating.
pub const DEFAULT_WANTED_SAMPLES: usize = 40;
/// Default time allowed to collect them.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Which side of the exchange a session plays.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Sends probes and computes the estimate.
    Initiator,
    /// Echoes probes and receives the estimate.
    Responder,
}

impl Role {
    pub fn is_initiator(&self) -> bool {
        matches!(self, Role::Initiator)
    }
}

impl From<bool> for Role {
    fn from(initiator: bool) -> Self {
        if initiator {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// What to do with a peer completion that arrives while we are still probing,
/// i.e. when both sides started as initiator.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollisionPolicy {
    /// Report it and keep probing.
    #[default]
    Ignore,
    /// Stop probing and adopt the peer's estimate.
    AcceptPeer,
}

/// Tunables of a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncConfig {
    /// Interval between two probes.
    pub tick_interval: Duration,
    /// Number of samples collected before estimating.
    pub wanted: usize,
    /// Absolute time limit measured from start.
    pub timeout: Duration,
    pub estimator: EstimatorMode,
    pub collision: CollisionPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            tick_interval: DEFAULT_TICK_INTERVAL,
            wanted: DEFAULT_WANTED_SAMPLES,
            timeout: DEFAULT_TIMEOUT,
            estimator: EstimatorMode::default(),
            collision: CollisionPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Checks that a session with these tunables can ever produce an estimate.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.wanted == 0 {
            return Err(SyncError::InvalidConfig("at least one sample is required"));
        }
        if self.tick_interval.is_zero() {
            return Err(SyncError::InvalidConfig("tick interval must be positive"));
        }
        if self.timeout <= self.tick_interval {
            return Err(SyncError::InvalidConfig(
                "timeout must be longer than the tick interval",
            ));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Requesting,
    Done,
    TimedOut,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Done | SessionState::TimedOut | SessionState::Aborted
        )
    }
}

/// Observations emitted by a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncEvent {
    /// A probe request from the peer was echoed.
    Request(ProbeIndex),
    /// A reply matched one of our pending probes.
    Reply(ProbeIndex),
    /// A latency is available. `initiator` is true if this side computed it.
    Done { initiator: bool, latency: f64 },
    /// Not enough replies arrived in time; no latency is available.
    Timeout,
}

/// Misuse of the synchronization API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("already started")]
    AlreadyStarted,

    #[error("channel is closed")]
    ChannelClosed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Protocol state of one side of a synchronization.
pub struct Session {
    config: SyncConfig,
    state: SessionState,
    samples: Vec<Sample>,
    pending: HashMap<ProbeIndex, Instant>,
    next_index: ProbeIndex,
    probes_sent: u32,
    latency: Option<f64>,
    estimate: Option<Estimate>,
    next_tick: Option<Instant>,
    deadline: Option<Instant>,
    transmits: VecDeque<Message>,
    events: VecDeque<SyncEvent>,
}

impl Session {
    pub fn new(config: SyncConfig) -> Session {
        Session {
            config,
            state: SessionState::Idle,
            samples: Vec::new(),
            pending: HashMap::new(),
            next_index: 0,
            probes_sent: 0,
            latency: None,
            estimate: None,
            next_tick: None,
            deadline: None,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Starts the session.
    ///
    /// A responder arms nothing: it keeps echoing requests and waits for the peer's
    /// completion. An initiator resets its samples, picks a random starting index and
    /// arms both the probe tick and the absolute timeout.
    pub fn start(&mut self, role: Role, now: Instant) -> Result<(), SyncError> {
        if self.is_requesting() {
            return Err(SyncError::AlreadyStarted);
        }
        self.config.validate()?;

        log::debug!("start as {}", role);

        if !role.is_initiator() {
            return Ok(());
        }

        self.samples.clear();
        self.pending.clear();
        self.latency = None;
        self.estimate = None;
        self.probes_sent = 0;
        self.next_index = rand::thread_rng().gen_range(0..MAX_START_INDEX);
        self.state = SessionState::Requesting;
        self.next_tick = Some(now + self.config.tick_interval);
        self.deadline = Some(now + self.config.timeout);
        Ok(())
    }

    /// Processes one decoded inbound message.
    pub fn handle_message(&mut self, msg: Message, now: Instant) {
        match msg {
            Message::Request(index) => {
                self.transmits.push_back(Message::Reply(index));
                log::debug!("got request {}, sent reply", index);
                self.events.push_back(SyncEvent::Request(index));
            }
            Message::Reply(index) => self.on_reply(index, now),
            Message::Done(latency) => self.on_peer_done(latency),
        }
    }

    /// Fires whichever timers are due at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        if let Some(deadline) = self.deadline {
            if now >= deadline && self.is_requesting() {
                log::debug!("timed out with {} samples", self.samples.len());
                self.teardown(SessionState::TimedOut);
                self.events.push_back(SyncEvent::Timeout);
                return;
            }
        }

        if let Some(tick) = self.next_tick {
            if now >= tick {
                self.on_tick(tick, now);
            }
        }
    }

    /// Stops an active session without producing a latency.
    ///
    /// Returns false if the session was not requesting.
    pub fn abort(&mut self) -> bool {
        if !self.is_requesting() {
            return false;
        }
        log::info!("aborted with {} samples", self.samples.len());
        self.teardown(SessionState::Aborted);
        true
    }

    /// Next instant at which [`Session::handle_timeout`] must be called.
    pub fn poll_timeout(&self) -> Option<Instant> {
        match (self.next_tick, self.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Next message to send to the peer.
    pub fn poll_transmit(&mut self) -> Option<Message> {
        self.transmits.pop_front()
    }

    /// Next observation for consumers.
    pub fn poll_event(&mut self) -> Option<SyncEvent> {
        self.events.pop_front()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_requesting(&self) -> bool {
        self.state == SessionState::Requesting
    }

    /// Latency in milliseconds, once the session is done.
    pub fn latency(&self) -> Option<f64> {
        self.latency
    }

    /// Full estimate, only on the side that computed it.
    pub fn estimate(&self) -> Option<&Estimate> {
        self.estimate.as_ref()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn probes_sent(&self) -> u32 {
        self.probes_sent
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn on_tick(&mut self, tick: Instant, now: Instant) {
        if self.is_requesting() && self.samples.len() >= self.config.wanted {
            self.complete();
        } else if self.is_requesting() {
            self.send_probe(now);
            let mut next = tick + self.config.tick_interval;
            if next <= now {
                next = now + self.config.tick_interval;
            }
            self.next_tick = Some(next);
        } else {
            self.next_tick = None;
            self.deadline = None;
        }
    }

    fn send_probe(&mut self, now: Instant) {
        let index = self.next_index;
        self.pending.insert(index, now);
        self.transmits.push_back(Message::Request(index));
        log::debug!(
            "sent request {}{}",
            index,
            if self.samples.is_empty() { " initial" } else { "" }
        );
        self.next_index = self.next_index.wrapping_add(1);
        self.probes_sent += 1;
    }

    fn on_reply(&mut self, index: ProbeIndex, now: Instant) {
        let sent_at = if self.is_requesting() {
            self.pending.remove(&index)
        } else {
            None
        };

        match sent_at {
            Some(sent_at) => {
                self.samples.push(Sample::new(sent_at, now));
                log::debug!("got reply {}", index);
                self.events.push_back(SyncEvent::Reply(index));
            }
            None => log::warn!("unexpected reply {}", index),
        }
    }

    fn on_peer_done(&mut self, latency: f64) {
        if self.is_requesting() {
            match self.config.collision {
                CollisionPolicy::Ignore => {
                    log::warn!("unexpected completion {} while requesting", latency);
                    return;
                }
                CollisionPolicy::AcceptPeer => {
                    log::warn!("peer completed first with {}, adopting it", latency);
                    self.teardown(SessionState::Done);
                }
            }
        }

        self.latency = Some(latency);
        self.state = SessionState::Done;
        log::debug!("got completion {}", latency);
        self.events.push_back(SyncEvent::Done {
            initiator: false,
            latency,
        });
    }

    fn complete(&mut self) {
        self.teardown(SessionState::Done);

        let estimate = estimate(&self.samples, self.config.estimator);
        let latency = estimate.latency;
        self.latency = Some(latency);
        self.estimate = Some(estimate);

        self.transmits.push_back(Message::Done(latency));
        log::debug!("sent completion {}", latency);
        self.events.push_back(SyncEvent::Done {
            initiator: true,
            latency,
        });
    }

    /// Leaves the requesting state: both timers are disarmed and probes still in
    /// flight are forgotten.
    fn teardown(&mut self, terminal: SessionState) {
        self.next_tick = None;
        self.deadline = None;
        self.pending.clear();
        self.state = terminal;
    }
}
