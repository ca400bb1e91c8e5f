use std::time::Duration;

use tokio::time::Instant;

use crate::status::Status;

pub type PingCallback = Box<dyn FnOnce(Result<Duration, Status>) + Send>;

struct OutstandingPing {
    payload: [u8; 8],
    sent_at: Instant,
    callbacks: Vec<PingCallback>,
}

/// Tracks the single allowed outstanding PING on a connection.
///
/// Additional ping requests while one is in flight attach their callback to
/// the existing ping instead of sending another frame.
#[derive(Default)]
pub struct PingTracker {
    outstanding: Option<OutstandingPing>,
}

pub enum PingAck {
    /// Payload matched: callbacks to run with the round trip time.
    Matched(Vec<(PingCallback, Duration)>),
    /// Payload did not match the outstanding ping (or none was pending).
    Unexpected([u8; 8]),
}

impl PingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback. Returns the payload of a new PING frame that
    /// must be written, or None if one is already in flight.
    pub fn start(&mut self, callback: PingCallback) -> Option<[u8; 8]> {
        if let Some(outstanding) = &mut self.outstanding {
            outstanding.callbacks.push(callback);
            return None;
        }

        let payload = rand::random::<u64>().to_be_bytes();
        self.outstanding = Some(OutstandingPing {
            payload,
            sent_at: Instant::now(),
            callbacks: vec![callback],
        });
        Some(payload)
    }

    pub fn on_ack(&mut self, payload: [u8; 8]) -> PingAck {
        match &self.outstanding {
            Some(outstanding) if outstanding.payload == payload => {
                let outstanding = self.outstanding.take().unwrap();
                let rtt = outstanding.sent_at.elapsed();
                PingAck::Matched(
                    outstanding
                        .callbacks
                        .into_iter()
                        .map(|cb| (cb, rtt))
                        .collect(),
                )
            }
            _ => PingAck::Unexpected(payload),
        }
    }

    /// Fails the pending ping, e.g. on connection termination.
    pub fn fail(&mut self, status: Status) {
        if let Some(outstanding) = self.outstanding.take() {
            for callback in outstanding.callbacks {
                callback(Err(status.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn single_outstanding_ping_aggregates_callbacks() {
        let mut tracker = PingTracker::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = count.clone();
        let payload = tracker
            .start(Box::new(move |r| {
                assert!(r.is_ok());
                c1.fetch_add(1, Ordering::SeqCst);
            }))
            .expect("first ping sends a frame");

        let c2 = count.clone();
        assert!(tracker
            .start(Box::new(move |r| {
                assert!(r.is_ok());
                c2.fetch_add(1, Ordering::SeqCst);
            }))
            .is_none());

        match tracker.on_ack(payload) {
            PingAck::Matched(callbacks) => {
                assert_eq!(callbacks.len(), 2);
                for (cb, rtt) in callbacks {
                    cb(Ok(rtt));
                }
            }
            PingAck::Unexpected(_) => panic!("payload should match"),
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn mismatched_payload_is_reported() {
        let mut tracker = PingTracker::new();
        let _ = tracker.start(Box::new(|_| {}));
        match tracker.on_ack([0xde; 8]) {
            PingAck::Unexpected(p) => assert_eq!(p, [0xde; 8]),
            PingAck::Matched(_) => panic!("must not match"),
        }
    }

    #[tokio::test]
    async fn fail_invokes_callbacks_with_the_status() {
        let mut tracker = PingTracker::new();
        let failed = Arc::new(AtomicUsize::new(0));
        let f = failed.clone();
        tracker.start(Box::new(move |r| {
            assert!(r.is_err());
            f.fetch_add(1, Ordering::SeqCst);
        }));
        tracker.fail(Status::unavailable("transport closed"));
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }
}
