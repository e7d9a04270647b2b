use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::time::Instant;

use crate::sync::SyncOutcome;

/// Session clock shared by both peers after a successful synchronization.
///
/// The initiator sends its completion message at the instant it finishes, so its clock
/// starts at zero. The completion reaches the responder `latency` later, so the
/// responder's clock starts at `latency`. Both clocks then read the same value at the
/// same real instant, give or take the estimation error.
///
/// ```
/// use peer_timesync::{sync::SyncOutcome, time::SharedClock};
///
/// let outcome = SyncOutcome::Done { initiator: false, latency: 25.0 };
/// let clock = SharedClock::aligned(&outcome).expect("synchronized");
/// assert!(clock.elapsed_ms() >= 25.0);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct SharedClock {
    origin: Instant,
    offset: Duration,
}

impl SharedClock {
    /// Starts a clock aligned with the peer now.
    ///
    /// Returns `None` unless the outcome carries a usable latency.
    pub fn aligned(outcome: &SyncOutcome) -> Option<SharedClock> {
        Self::aligned_at(outcome, Instant::now())
    }

    /// Starts a clock aligned with the peer, taking `origin` as the completion instant.
    pub fn aligned_at(outcome: &SyncOutcome, origin: Instant) -> Option<SharedClock> {
        match *outcome {
            SyncOutcome::Done {
                initiator: true, ..
            } => Some(SharedClock {
                origin,
                offset: Duration::ZERO,
            }),
            SyncOutcome::Done {
                initiator: false,
                latency,
            } if latency.is_finite() && latency >= 0.0 => Some(SharedClock {
                origin,
                offset: Duration::from_secs_f64(latency / 1000.0),
            }),
            _ => None,
        }
    }

    /// Time on the shared clock.
    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed() + self.offset
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }

    /// Offset applied at start, zero on the initiator.
    pub fn offset(&self) -> Duration {
        self.offset
    }
}

/// Current wall-clock time formatted as RFC 3339 with millisecond precision.
pub fn wall_clock_now() -> String {
    format_wall_clock(Utc::now())
}

fn format_wall_clock(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_initiator_clock_starts_at_zero() {
        let outcome = SyncOutcome::Done {
            initiator: true,
            latency: 25.0,
        };
        let clock = SharedClock::aligned(&outcome).unwrap();
        assert_eq!(clock.offset(), Duration::ZERO);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(clock.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_clocks_agree() {
        let start = Instant::now();
        let initiator = SharedClock::aligned_at(
            &SyncOutcome::Done {
                initiator: true,
                latency: 25.0,
            },
            start,
        )
        .unwrap();
        // The completion message reaches the responder 25 ms later.
        let responder = SharedClock::aligned_at(
            &SyncOutcome::Done {
                initiator: false,
                latency: 25.0,
            },
            start + Duration::from_millis(25),
        )
        .unwrap();

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(initiator.elapsed(), responder.elapsed());
    }

    #[test]
    fn test_no_clock_without_latency() {
        assert!(SharedClock::aligned(&SyncOutcome::TimedOut).is_none());
        assert!(SharedClock::aligned(&SyncOutcome::Aborted).is_none());
        let nan = SyncOutcome::Done {
            initiator: false,
            latency: f64::NAN,
        };
        assert!(SharedClock::aligned(&nan).is_none());
    }

    #[test]
    fn test_format_wall_clock() {
        let date =
            DateTime::<Utc>::from_timestamp(1_525_987, 151_000_000).expect("Invalid timestamp");
        assert_eq!(format_wall_clock(date), "1970-01-18T15:53:07.151Z");
    }
}
