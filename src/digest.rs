//! MD5 content digests and the block digest sequences reported by the stub

use core::fmt;

use md5::{Digest as _, Md5};

use crate::error::{Error, FramingError};
use crate::protocol::DIGEST_LEN;

/// A 128-bit content digest
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    /// Compute the digest of a byte slice
    pub fn compute(data: &[u8]) -> Self {
        let mut d = [0u8; DIGEST_LEN];
        d.copy_from_slice(&Md5::digest(data));
        Self(d)
    }

    /// Parse a digest packet
    pub fn from_packet(packet: &[u8]) -> Result<Self, FramingError> {
        if packet.len() != DIGEST_LEN {
            return Err(FramingError::UnexpectedPacket {
                expected: "digest",
                len: packet.len(),
            });
        }
        let mut d = [0u8; DIGEST_LEN];
        d.copy_from_slice(packet);
        Ok(Self(d))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Fail with [`Error::DigestMismatch`] unless `actual` matches
    pub fn verify(&self, actual: &Digest) -> Result<(), Error> {
        if self != actual {
            return Err(Error::DigestMismatch {
                expected: *self,
                actual: *actual,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self)
    }
}

/// Streaming digest over data supplied in pieces
#[derive(Clone, Default)]
pub struct DigestContext(Md5);

impl DigestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> Digest {
        let mut d = [0u8; DIGEST_LEN];
        d.copy_from_slice(&self.0.finalize());
        Digest(d)
    }
}

/// Number of full blocks and whether a remainder block follows
pub fn block_layout(len: u32, block_size: u32) -> (u32, bool) {
    if block_size == 0 {
        return (0, false);
    }
    (len / block_size, len % block_size != 0)
}

/// Digests reported for a region: one per full block, the trailing
/// remainder (if any), and the overall digest.
#[derive(Clone, Debug, PartialEq)]
pub struct DigestSet {
    pub block_size: u32,
    pub blocks: Vec<Digest>,
    pub remainder: Option<Digest>,
    pub overall: Digest,
}

impl DigestSet {
    /// Compute the set the stub would report for `data`
    pub fn expected(data: &[u8], block_size: u32) -> Self {
        let mut blocks = Vec::new();
        let mut remainder = None;

        if block_size > 0 {
            for chunk in data.chunks(block_size as usize) {
                if chunk.len() == block_size as usize {
                    blocks.push(Digest::compute(chunk));
                } else {
                    remainder = Some(Digest::compute(chunk));
                }
            }
        }

        Self {
            block_size,
            blocks,
            remainder,
            overall: Digest::compute(data),
        }
    }

    /// Assemble a set from the digest packets of a region of `len` bytes, in wire order
    pub fn from_digests(
        len: u32,
        block_size: u32,
        digests: Vec<Digest>,
    ) -> Result<Self, FramingError> {
        let (full, partial) = block_layout(len, block_size);
        let count = full as usize + partial as usize + 1;
        if digests.len() != count {
            return Err(FramingError::UnexpectedPacket {
                expected: "digest sequence",
                len: digests.len(),
            });
        }

        let mut blocks = digests;
        let overall = blocks.pop().ok_or(FramingError::UnexpectedPacket {
            expected: "overall digest",
            len: 0,
        })?;
        let remainder = if partial { blocks.pop() } else { None };

        Ok(Self {
            block_size,
            blocks,
            remainder,
            overall,
        })
    }

    /// Indices of blocks (counting a remainder as the final block) whose digests differ
    pub fn mismatched_blocks(&self, other: &DigestSet) -> Vec<usize> {
        let ours = self.blocks.iter().map(Some).chain(core::iter::once(self.remainder.as_ref()));
        let theirs = other.blocks.iter().map(Some).chain(core::iter::once(other.remainder.as_ref()));

        let mut mismatched: Vec<usize> = ours
            .zip(theirs)
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| i)
            .collect();

        // Block counts can only differ if the regions differ in length
        let (a, b) = (self.blocks.len(), other.blocks.len());
        if a != b {
            mismatched.extend(a.min(b)..a.max(b) + 1);
            mismatched.sort_unstable();
            mismatched.dedup();
        }
        mismatched
    }

    /// Check every digest against `expected`, reporting the first difference
    pub fn verify(&self, expected: &DigestSet) -> Result<(), Error> {
        for (e, a) in expected.blocks.iter().zip(self.blocks.iter()) {
            e.verify(a)?;
        }
        if let (Some(e), Some(a)) = (&expected.remainder, &self.remainder) {
            e.verify(a)?;
        }
        expected.overall.verify(&self.overall)
    }
}
