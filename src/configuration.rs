use std::{net::IpAddr, time::Duration};

pub use clap::Parser;
use thiserror::Error;

use crate::{
    estimator::EstimatorMode,
    report::OutputFormat,
    session::{CollisionPolicy, SyncConfig, SyncError},
};

/// Default UDP port used by both peers.
pub const DEFAULT_PORT: u16 = 8620;

/// Errors found while validating the configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Remote address is required unless running a simulation")]
    MissingRemoteAddress,

    #[error("Sync settings rejected: {0}")]
    InvalidSync(#[from] SyncError),

    #[error("Local and remote address families differ")]
    AddressFamilyMismatch,
}

#[derive(Parser, Debug)]
#[command(author = "Piotr Olszewski", version, about, long_about = None)]
pub struct Configuration {
    /// Drive the probing and compute the latency (the peer must not set this)
    #[arg(short, long)]
    pub initiator: bool,
    /// Remote peer address
    #[arg(short, long)]
    pub remote_addr: Option<IpAddr>,
    /// Local address to bind to
    #[arg(short, long, default_value = "0.0.0.0")]
    pub local_addr: IpAddr,
    /// UDP port of the remote peer
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    pub remote_port: u16,
    /// Local UDP port
    #[arg(short = 'o', long, default_value_t = DEFAULT_PORT)]
    pub local_port: u16,
    /// Interval between probes in milliseconds
    #[arg(long, default_value_t = 30)]
    pub tick_interval: u64,
    /// Number of samples to collect before estimating
    #[arg(short = 'n', long, default_value_t = 40)]
    pub samples: usize,
    /// Time allowed for the whole synchronization in milliseconds
    #[arg(short, long, default_value_t = 10_000)]
    pub timeout: u64,
    /// Arithmetic used to reduce samples to a latency
    #[arg(short, long, value_enum, default_value_t = EstimatorMode::Corrected)]
    pub estimator: EstimatorMode,
    /// What to do when the peer also acts as initiator
    #[arg(long, value_enum, default_value_t = CollisionPolicy::Ignore)]
    pub collision: CollisionPolicy,
    /// Report format
    #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Text)]
    pub output_format: OutputFormat,
    /// Run both peers in-process over a simulated link with this one-way delay (ms)
    #[arg(long)]
    pub simulate_delay: Option<u64>,
    /// Drop every n-th message on the simulated link
    #[arg(long, requires = "simulate_delay")]
    pub simulate_loss_every: Option<u32>,
}

impl Configuration {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.sync_config().validate()?;
        if self.simulate_delay.is_none() {
            match self.remote_addr {
                None => return Err(ConfigurationError::MissingRemoteAddress),
                Some(remote) if remote.is_ipv4() != self.local_addr.is_ipv4() => {
                    return Err(ConfigurationError::AddressFamilyMismatch)
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig::from(self)
    }
}

impl From<&Configuration> for SyncConfig {
    fn from(conf: &Configuration) -> Self {
        SyncConfig {
            tick_interval: Duration::from_millis(conf.tick_interval),
            wanted: conf.samples,
            timeout: Duration::from_millis(conf.timeout),
            estimator: conf.estimator,
            collision: conf.collision,
        }
    }
}
