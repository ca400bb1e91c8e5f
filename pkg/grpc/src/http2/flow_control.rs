use crate::http2::types::{WindowSize, DEFAULT_WINDOW_SIZE};

/// Inbound flow control for one window (connection or stream scope).
///
/// Tracks how many bytes the application has consumed and converts that
/// into WINDOW_UPDATE increments once a threshold fraction of the window
/// has been eaten, so that credit is returned in few large updates rather
/// than one per message.
pub struct ReceiveWindow {
    limit: WindowSize,
    consumed: WindowSize,
}

impl ReceiveWindow {
    pub fn new(limit: WindowSize) -> Self {
        Self { limit, consumed: 0 }
    }

    /// Records bytes the application has fully processed. Returns the
    /// WINDOW_UPDATE increment to send now, if the refill threshold (half
    /// the window) was crossed.
    pub fn bytes_processed(&mut self, count: usize) -> Option<u32> {
        self.consumed = self.consumed.saturating_add(count as WindowSize);
        if self.consumed >= self.limit / 2 {
            let increment = self.consumed;
            self.consumed = 0;
            Some(increment as u32)
        } else {
            None
        }
    }
}

impl Default for ReceiveWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

/// Outbound flow control for one window.
///
/// The window may go negative when the peer shrinks its initial window
/// size while data is in flight.
pub struct SendWindow {
    available: WindowSize,
}

impl SendWindow {
    pub fn new(initial: WindowSize) -> Self {
        Self { available: initial }
    }

    pub fn available(&self) -> WindowSize {
        self.available
    }

    /// Applies a WINDOW_UPDATE (or a positive/negative SETTINGS
    /// adjustment). Fails on overflow past 2^31-1, which is a flow control
    /// protocol violation.
    pub fn adjust(&mut self, delta: i64) -> Result<(), ()> {
        let next = self.available as i64 + delta;
        if next > i32::MAX as i64 {
            return Err(());
        }
        self.available = next as WindowSize;
        Ok(())
    }

    /// Reserves up to 'want' bytes for a DATA frame, bounded by the
    /// window. Returns the number of bytes actually reserved.
    pub fn take(&mut self, want: usize) -> usize {
        if self.available <= 0 {
            return 0;
        }
        let granted = std::cmp::min(self.available as usize, want);
        self.available -= granted as WindowSize;
        granted
    }
}

impl Default for SendWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}
