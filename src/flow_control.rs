//! Per-stream flow-control credit accounting.
//!
//! Each stream owns one [`SendWindow`] (credit the peer granted us) and one
//! [`RecvWindow`] (credit we granted the peer). Neither type locks; the
//! stream keeps both inside its own state mutex.
//!
//! # Credit return policy
//!
//! The receiver hands credit back with a WND_INC once the bytes the
//! application has read, but not yet credited, reach half of the configured
//! window. Smaller reads are batched until then.

/// Largest window either side may hold.
pub const MAX_WINDOW_SIZE: u32 = 0x7FFF_FFFF;

/// Default window size advertised for every new stream (64KB).
pub const DEFAULT_WINDOW_SIZE: u32 = 0x10000;

/// Credit available for sending DATA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWindow {
    available: u32,
}

impl SendWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            available: initial.min(MAX_WINDOW_SIZE),
        }
    }

    /// Bytes that may be sent right now.
    #[inline]
    pub fn available(&self) -> u32 {
        self.available
    }

    /// Check if the window is exhausted.
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.available == 0
    }

    /// Take up to `wanted` bytes of credit, returning how much was taken.
    pub fn reserve(&mut self, wanted: usize) -> usize {
        let taken = wanted.min(self.available as usize);
        self.available -= taken as u32;
        taken
    }

    /// Apply a WND_INC.
    ///
    /// Returns `false`, leaving the window unchanged, if the increment would
    /// push it past [`MAX_WINDOW_SIZE`].
    pub fn increase(&mut self, increment: u32) -> bool {
        match self.available.checked_add(increment) {
            Some(next) if next <= MAX_WINDOW_SIZE => {
                self.available = next;
                true
            }
            _ => false,
        }
    }
}

/// Credit granted to the peer, and the consumed bytes not yet handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWindow {
    size: u32,
    available: u32,
    unacked: u32,
}

impl RecvWindow {
    pub fn new(size: u32) -> Self {
        let size = size.min(MAX_WINDOW_SIZE);
        Self {
            size,
            available: size,
            unacked: 0,
        }
    }

    /// Credit the peer still holds.
    #[inline]
    pub fn available(&self) -> u32 {
        self.available
    }

    /// Configured window size.
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Account for an incoming DATA payload.
    ///
    /// Returns `false`, without accepting anything, if `len` exceeds the
    /// credit the peer holds.
    pub fn accept(&mut self, len: usize) -> bool {
        if len > self.available as usize {
            return false;
        }
        self.available -= len as u32;
        true
    }

    /// Record `n` bytes handed to the application.
    ///
    /// Returns the increment to send in a WND_INC when the threshold is
    /// reached; the credit is considered granted from that point on.
    pub fn consume(&mut self, n: usize) -> Option<u32> {
        self.unacked = self.unacked.saturating_add(n as u32);
        let threshold = (self.size / 2).max(1);
        if self.unacked < threshold {
            return None;
        }

        let increment = self.unacked;
        self.unacked = 0;
        self.available = self.available.saturating_add(increment).min(MAX_WINDOW_SIZE);
        Some(increment)
    }
}
