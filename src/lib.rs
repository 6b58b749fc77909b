//! SPI flash stub loader driver.
//!
//! Host side of the stub flasher protocol: sector erase, flow controlled
//! writes, block reads, MD5 digests and boot control over a serial link.

use core::time::Duration;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod digest;
pub mod error;
pub mod flasher;
pub mod protocol;
pub mod slip;
pub mod transport;
pub mod writer;

pub use digest::{Digest, DigestSet};
pub use error::{Error, FramingError, PreconditionError, Result, TransportError};
pub use flasher::{CommandResult, FlashSummary, Flasher};
pub use protocol::{ChipId, Command, FlashRegion, Opcode, SECTOR_SIZE};
pub use transport::{NbTransport, Transport};
pub use writer::Progress;

/// Session state, only one command may be in flight at a time
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    /// Ready for the next command
    Idle,
    /// Awaiting the terminal response of a command
    InFlight(Opcode),
    /// A write was interrupted, the stub's position in the stream is unknown
    Broken,
    /// The device has booted or rebooted out of the stub
    Detached,
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Timeout to wait for stub responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "3000"))]
    pub response_timeout_ms: u32,

    /// Timeout for long running operations (erase, region digests)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "30000"))]
    pub erase_timeout_ms: u32,

    /// Period to poll for stub responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Block size for reading flash
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "4096"))]
    pub read_block_size: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout_ms: 3000,
            erase_timeout_ms: 30000,
            poll_delay_ms: 1,
            read_block_size: protocol::MAX_BLOCK_SIZE,
        }
    }
}

impl Options {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms as u64)
    }

    pub fn erase_timeout(&self) -> Duration {
        Duration::from_millis(self.erase_timeout_ms as u64)
    }
}
