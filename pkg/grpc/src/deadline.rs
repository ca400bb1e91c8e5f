use std::time::Duration;

use tokio::time::Instant;

/// Absolute instant on the monotonic clock by which a call must complete.
///
/// Deadlines are absolute so that they survive being propagated across
/// components without accumulating queuing delays the way relative timeouts
/// would.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Deadline {
    instant: Instant,
}

impl Deadline {
    pub fn at(instant: Instant) -> Self {
        Self { instant }
    }

    /// Deadline 'duration' from now.
    pub fn after(duration: Duration) -> Self {
        let now = Instant::now();
        Self {
            // Saturate instead of overflowing for absurdly large durations.
            instant: now.checked_add(duration).unwrap_or_else(|| {
                now + Duration::from_secs(10 * 365 * 24 * 3600)
            }),
        }
    }

    pub fn instant(&self) -> Instant {
        self.instant
    }

    pub fn expired(&self) -> bool {
        self.instant <= Instant::now()
    }

    /// Time left before expiry, or None if already expired. overdue()
    /// covers the negative half of the remaining-time number line.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.instant.checked_duration_since(Instant::now())
    }

    /// How far past the deadline we are. Zero while not yet expired.
    pub fn overdue(&self) -> Duration {
        Instant::now().saturating_duration_since(self.instant)
    }

    /// The earlier of the two deadlines.
    pub fn min(self, other: Deadline) -> Deadline {
        if self.instant <= other.instant {
            self
        } else {
            other
        }
    }
}

/// Earlier of two optional deadlines (None meaning unbounded).
pub fn min_deadline(a: Option<Deadline>, b: Option<Deadline>) -> Option<Deadline> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}
