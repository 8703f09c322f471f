//! HTTP/2 flow control windows (RFC 9113 Section 5.2 and 6.9).
//!
//! Send and receive directions are tracked by different types: a
//! [`FlowWindow`] is credit the peer granted us, an [`InflowWindow`] is
//! credit we granted the peer plus the bytes we owe back once the consumer
//! has drained them.

/// Initial window size before any SETTINGS (RFC 9113 Section 6.9.2).
pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;

/// Largest legal flow-control window, 2^31 - 1.
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    #[error("flow-control window would exceed 2^31-1")]
    Overflow,
    #[error("peer sent {len} bytes with only {available} bytes of credit")]
    Exceeded { len: u32, available: i64 },
}

/// Send-direction window: how many DATA bytes we may still transmit.
#[derive(Debug, Clone)]
pub struct FlowWindow {
    window: i64,
}

impl FlowWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            window: i64::from(initial),
        }
    }

    /// Current window (may be negative after a SETTINGS reduction).
    pub fn window(&self) -> i64 {
        self.window
    }

    /// Bytes that can be sent right now.
    pub fn available(&self) -> usize {
        self.window.max(0) as usize
    }

    /// Charge `n` bytes that were just queued for transmission.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n as i64 <= self.window, "sent past the flow-control window");
        self.window -= n as i64;
    }

    /// Give back credit for bytes that were charged but never written
    /// (queued DATA purged by a reset).
    pub fn refund(&mut self, n: usize) {
        self.window += n as i64;
    }

    /// Apply a WINDOW_UPDATE increment.
    pub fn increase(&mut self, increment: u32) -> Result<(), FlowError> {
        let new = self.window + i64::from(increment);
        if new > i64::from(MAX_WINDOW_SIZE) {
            return Err(FlowError::Overflow);
        }
        self.window = new;
        Ok(())
    }

    /// Apply a SETTINGS_INITIAL_WINDOW_SIZE change. `delta` is
    /// `new_initial - old_initial` and may be negative.
    pub fn adjust(&mut self, delta: i64) -> Result<(), FlowError> {
        let new = self.window + delta;
        if new > i64::from(MAX_WINDOW_SIZE) {
            return Err(FlowError::Overflow);
        }
        self.window = new;
        Ok(())
    }
}

/// Receive-direction window with batched credit return.
///
/// Bytes are charged on receipt with [`consume`](Self::consume) and handed
/// back with [`release`](Self::release) once the consumer is done with them
/// (or they were discarded). Released credit is accumulated and only
/// returned to the peer once the owed amount reaches half of the configured
/// window, or once it is at least as large as the credit the peer has left.
#[derive(Debug, Clone)]
pub struct InflowWindow {
    /// Configured window size, the reference for the batching threshold.
    max: u32,
    /// Credit the peer still holds.
    available: i64,
    /// Drained bytes whose credit has not been sent back yet.
    unsent: u32,
}

impl InflowWindow {
    pub fn new(max: u32) -> Self {
        Self::with_credit(max, max)
    }

    /// A window whose peer currently believes it holds `credit` bytes, which
    /// differs from `max` while our SETTINGS are not acknowledged yet.
    pub fn with_credit(max: u32, credit: u32) -> Self {
        Self {
            max,
            available: i64::from(credit),
            unsent: 0,
        }
    }

    pub fn available(&self) -> i64 {
        self.available
    }

    /// Bytes received and not yet drained by the consumer.
    pub fn outstanding(&self) -> u64 {
        (i64::from(self.max) - self.available - i64::from(self.unsent)).max(0) as u64
    }

    /// Charge `len` received bytes (payload plus padding).
    pub fn consume(&mut self, len: u32) -> Result<(), FlowError> {
        if i64::from(len) > self.available {
            return Err(FlowError::Exceeded {
                len,
                available: self.available,
            });
        }
        self.available -= i64::from(len);
        Ok(())
    }

    /// Mark `n` bytes as drained. Returns the WINDOW_UPDATE increment to
    /// send, if the batch is big enough.
    pub fn release(&mut self, n: u32) -> Option<u32> {
        if n == 0 {
            return None;
        }
        self.unsent = self.unsent.saturating_add(n);
        let threshold = (self.max / 2).max(1);
        if self.unsent >= threshold || i64::from(self.unsent) >= self.available {
            Some(self.take_unsent())
        } else {
            None
        }
    }

    /// Shift the credit the peer holds, e.g. when our SETTINGS get
    /// acknowledged with a window below the protocol default.
    pub fn adjust(&mut self, delta: i64) {
        self.available += delta;
    }

    fn take_unsent(&mut self) -> u32 {
        let inc = std::mem::take(&mut self.unsent);
        self.available += i64::from(inc);
        inc
    }
}
