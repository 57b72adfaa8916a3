use crate::types::MAX_WINDOW_SIZE;

/// Credit the peer has granted us for outbound DATA, at session or stream
/// scope. Signed: a SETTINGS_INITIAL_WINDOW_SIZE decrease may push a stream
/// window below zero (RFC 7540 §6.9.2).
#[derive(Debug, Clone, Copy)]
pub struct SendWindow {
    available: i64,
}

impl SendWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            available: i64::from(initial),
        }
    }

    pub fn available(&self) -> i64 {
        self.available
    }

    /// Apply a WINDOW_UPDATE. Growing the window past 2^31-1 is a
    /// FLOW_CONTROL_ERROR at the caller's scope.
    pub fn widen(&mut self, increment: u32) -> Result<(), WindowOverflow> {
        let next = self.available + i64::from(increment);
        if next > MAX_WINDOW_SIZE {
            return Err(WindowOverflow);
        }
        self.available = next;
        Ok(())
    }

    /// Spend credit for DATA the caller is about to emit. Callers only take
    /// what [`Self::available`] reported under the same lock.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n as i64 <= self.available);
        self.available -= n as i64;
    }

    /// Retroactive SETTINGS_INITIAL_WINDOW_SIZE change: shift by the delta
    /// between the old and new initial values.
    pub fn adjust(&mut self, delta: i64) -> Result<(), WindowOverflow> {
        let next = self.available + delta;
        if next > MAX_WINDOW_SIZE {
            return Err(WindowOverflow);
        }
        self.available = next;
        Ok(())
    }
}

/// A window was pushed past 2^31-1; the caller maps this to a
/// FLOW_CONTROL_ERROR at the right scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOverflow;

/// Credit we grant the peer for inbound DATA, plus the WINDOW_UPDATE
/// generation policy: replenish to the configured size once consumption
/// crosses the halfway mark, and only after DATA actually arrived. One
/// update per crossing, never one per byte.
#[derive(Debug, Clone, Copy)]
pub struct ReceiveWindow {
    limit: u32,
    available: i64,
    delivered: bool,
}

impl ReceiveWindow {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            available: i64::from(limit),
            delivered: false,
        }
    }

    pub fn available(&self) -> i64 {
        self.available
    }

    /// Account for an inbound DATA payload. `Err` means the peer overshot
    /// the advertised window.
    pub fn consume(&mut self, n: usize) -> Result<(), WindowOverflow> {
        self.available -= n as i64;
        if self.available < 0 {
            return Err(WindowOverflow);
        }
        self.delivered = true;
        Ok(())
    }

    /// WINDOW_UPDATE increment to send now, if the policy calls for one.
    pub fn replenish(&mut self) -> Option<u32> {
        if !self.delivered || self.available >= i64::from(self.limit / 2) {
            return None;
        }
        let increment = (i64::from(self.limit) - self.available) as u32;
        self.available = i64::from(self.limit);
        self.delivered = false;
        Some(increment)
    }
}
