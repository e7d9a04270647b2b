//! Peer-to-peer clock synchronization for real-time sessions.
//!
//! Two peers connected by an already established text channel estimate the one-way
//! latency between them. The initiator sends timestamped probes, the responder echoes
//! them, and once enough round trips are collected the initiator reduces them to a
//! single latency and sends it over. Both sides can then start a shared clock offset
//! by that latency.
//!
//! # Usage
//!
//! Run the responder:
//! ```bash
//! timesync --remote-addr 192.168.1.1
//! ```
//!
//! Run the initiator:
//! ```bash
//! timesync --initiator --remote-addr 192.168.1.2
//! ```
//!
//! Try it in-process over a simulated 25 ms link:
//! ```bash
//! timesync --simulate-delay 25
//! ```

/// Transports the protocol runs over.
pub mod channel;
/// Command-line configuration and validation.
pub mod configuration;
/// Latency estimation from round-trip samples.
pub mod estimator;
/// Wire message encoding and decoding.
pub mod messages;
/// Outcome reporting.
pub mod report;
/// Protocol state machine.
pub mod session;
/// Async driver tying a session to a channel.
pub mod sync;
/// Shared clock and wall-clock helpers.
pub mod time;
