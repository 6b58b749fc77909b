//! Error types for stub flasher operations

use thiserror::Error;

use crate::digest::Digest;
use crate::protocol::Opcode;

/// Top level error for a flasher operation
#[derive(Debug, Error)]
pub enum Error {
    /// Rejected locally, nothing was sent to the device
    #[error("precondition failed: {0}")]
    Precondition(#[from] PreconditionError),

    /// Malformed or unexpected inbound packet
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// Underlying channel failure, including response timeouts
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Device digest does not match the locally computed one
    #[error("digest mismatch (expected {expected}, device reported {actual})")]
    DigestMismatch { expected: Digest, actual: Digest },

    /// Non-zero status reported by the stub
    #[error("device reported error status 0x{0:02x}")]
    Device(u8),

    /// The caller cancelled the operation
    #[error("operation aborted")]
    Aborted,

    /// A write stopped before completion, nothing past `written` is on the flash
    #[error("write interrupted after {written} bytes")]
    PartialWrite {
        written: u32,
        #[source]
        cause: Box<Error>,
    },
}

/// Local argument and session state checks
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PreconditionError {
    #[error("region 0x{addr:08x}+0x{len:x} is not aligned to {sector_size} byte sectors")]
    Unaligned { addr: u32, len: u32, sector_size: u32 },

    #[error("region 0x{addr:08x}+0x{len:x} exceeds the address space")]
    RegionOverflow { addr: u32, len: u32 },

    #[error("block size {block_size} outside 1..={max}")]
    BlockSize { block_size: u32, max: u32 },

    #[error("{0:?} still in flight")]
    Busy(Opcode),

    #[error("write data length mismatch (declared {declared}, supplied {supplied})")]
    LengthMismatch { declared: u32, supplied: u64 },

    #[error("no write in progress")]
    NoWrite,

    #[error("link is desynchronised after an interrupted command, reconnect required")]
    LinkBroken,

    #[error("device has left the stub")]
    Detached,
}

/// Inbound framing failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FramingError {
    #[error("stream ended mid-frame after {0} bytes")]
    Truncated(usize),

    #[error("invalid escape sequence 0x{0:02x}")]
    InvalidEscape(u8),

    #[error("frame exceeds {0} bytes")]
    Oversize(usize),

    #[error("unexpected {len} byte packet awaiting {expected}")]
    UnexpectedPacket { expected: &'static str, len: usize },

    #[error("acknowledged {acked} bytes with {sent} sent (previous ack {previous})")]
    AckOutOfRange { acked: u32, sent: u32, previous: u32 },
}

/// Failures raised by a [`Transport`](crate::transport::Transport)
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("link disconnected")]
    Disconnected,

    #[error("timed out awaiting response")]
    Timeout,

    #[error("i/o error: {0:?}")]
    Io(std::io::ErrorKind),

    #[error("serial error: {0}")]
    Serial(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.kind())
    }
}

impl Error {
    /// Wrap a failure that occurred part way through a write
    pub(crate) fn partial(self, written: u32) -> Self {
        match self {
            e @ Error::PartialWrite { .. } => e,
            cause => Error::PartialWrite {
                written,
                cause: Box::new(cause),
            },
        }
    }

    /// Whether the command may still be running on the device, its terminal
    /// response never having been seen
    pub(crate) fn leaves_command_open(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Framing(FramingError::Truncated(_)) | Error::PartialWrite { .. }
        )
    }

    /// Whether the error leaves the byte stream in an unknown position
    pub(crate) fn desynchronises(&self) -> bool {
        matches!(self, Error::Framing(_))
    }
}

/// Result type for flasher operations
pub type Result<T> = core::result::Result<T, Error>;
