//! Flow control for streaming write data.
//!
//! The stub buffers up to [`HIGH_WATERMARK`] bytes and commits them to flash
//! in [`WRITE_CHUNK`] pieces, acknowledging the cumulative byte count after
//! each commit. [`WriteWindow`] tracks sent and acknowledged counts and
//! decides how much may be sent next so the device buffer is never overrun.

use crate::error::FramingError;
use crate::protocol::{HIGH_WATERMARK, LOW_WATERMARK, WRITE_CHUNK};

/// Cumulative progress of a write
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Progress {
    /// Bytes committed to flash by the device
    pub written: u32,
    /// Bytes sent to the device
    pub sent: u32,
    /// Declared length of the write
    pub total: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WriteWindow {
    len: u32,
    sent: u32,
    acked: u32,
}

impl WriteWindow {
    pub fn new(len: u32) -> Self {
        Self { len, sent: 0, acked: 0 }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn sent(&self) -> u32 {
        self.sent
    }

    pub fn acked(&self) -> u32 {
        self.acked
    }

    /// Bytes sent but not yet acknowledged
    pub fn in_flight(&self) -> u32 {
        self.sent - self.acked
    }

    /// Bytes still to be sent
    pub fn remaining(&self) -> u32 {
        self.len - self.sent
    }

    /// How many bytes may be sent right now, given `available` bytes ready to go
    pub fn next_chunk(&self, available: usize) -> u32 {
        let room = HIGH_WATERMARK - self.in_flight();
        let available = available.min(u32::MAX as usize) as u32;
        WRITE_CHUNK.min(room).min(self.remaining()).min(available)
    }

    /// Whether the window is full and an acknowledgment must be awaited
    pub fn is_full(&self) -> bool {
        self.in_flight() >= HIGH_WATERMARK
    }

    /// Whether the device may idle between commits for lack of data
    pub fn is_starved(&self) -> bool {
        self.remaining() > 0 && self.in_flight() < LOW_WATERMARK
    }

    /// All data has been sent
    pub fn is_delivered(&self) -> bool {
        self.sent == self.len
    }

    /// All data has been acknowledged
    pub fn is_complete(&self) -> bool {
        self.acked == self.len
    }

    /// Record `n` bytes as sent.
    ///
    /// # Panics
    /// If this would take the in-flight count past the high watermark or the
    /// total past the declared length. Callers must size sends with
    /// [`next_chunk`](Self::next_chunk).
    pub fn record_sent(&mut self, n: u32) {
        assert!(
            n <= self.remaining() && self.in_flight() + n <= HIGH_WATERMARK,
            "write window overrun: sent {} acked {} len {} adding {}",
            self.sent,
            self.acked,
            self.len,
            n
        );
        self.sent += n;
    }

    /// Record a cumulative acknowledgment from the device
    pub fn record_ack(&mut self, acked: u32) -> Result<(), FramingError> {
        if acked < self.acked || acked > self.sent {
            return Err(FramingError::AckOutOfRange {
                acked,
                sent: self.sent,
                previous: self.acked,
            });
        }
        self.acked = acked;
        Ok(())
    }

    pub fn progress(&self) -> Progress {
        Progress {
            written: self.acked,
            sent: self.sent,
            total: self.len,
        }
    }
}
