//! SLIP framing for command headers and response packets.
//!
//! Command headers and every response from the stub are delimited with
//! `END` bytes and have `END`/`ESC` values escaped. Write payload data is
//! the exception, it follows the write header as a raw byte stream.

use crate::error::FramingError;

pub const SLIP_END: u8 = 0xC0;
pub const SLIP_ESC: u8 = 0xDB;
pub const SLIP_ESC_END: u8 = 0xDC;
pub const SLIP_ESC_ESC: u8 = 0xDD;

/// Encode a frame, including the leading and trailing delimiters
pub fn encode(frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len() + 2);
    out.push(SLIP_END);

    for &b in frame {
        match b {
            SLIP_END => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_END]),
            SLIP_ESC => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_ESC]),
            _ => out.push(b),
        }
    }

    out.push(SLIP_END);
    out
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum DecodeState {
    /// Discarding bytes until the next delimiter
    Hunting,
    /// Inside a frame
    Frame,
    /// Inside a frame, previous byte was `ESC`
    Escape,
}

/// Incremental SLIP decoder
#[derive(Debug)]
pub struct Decoder {
    state: DecodeState,
    buffer: Vec<u8>,
    max_len: usize,
    discarded: usize,
}

impl Decoder {
    pub fn new(max_len: usize) -> Self {
        Self {
            state: DecodeState::Hunting,
            buffer: Vec::with_capacity(max_len),
            max_len,
            discarded: 0,
        }
    }

    /// Push a byte, returning a frame when one completes.
    ///
    /// On error the partial frame is dropped and the decoder hunts for the
    /// next delimiter.
    pub fn push(&mut self, byte: u8) -> Result<Option<Vec<u8>>, FramingError> {
        match self.state {
            DecodeState::Hunting => {
                if byte == SLIP_END {
                    if self.discarded > 0 {
                        warn!("Discarded {} bytes outside of frames", self.discarded);
                        self.discarded = 0;
                    }
                    self.state = DecodeState::Frame;
                } else {
                    self.discarded += 1;
                }
                Ok(None)
            }
            DecodeState::Frame => match byte {
                // Back to back delimiters open a new frame
                SLIP_END if self.buffer.is_empty() => Ok(None),
                SLIP_END => {
                    self.state = DecodeState::Hunting;
                    Ok(Some(core::mem::take(&mut self.buffer)))
                }
                SLIP_ESC => {
                    self.state = DecodeState::Escape;
                    Ok(None)
                }
                b => self.append(b).map(|_| None),
            },
            DecodeState::Escape => {
                let b = match byte {
                    SLIP_ESC_END => SLIP_END,
                    SLIP_ESC_ESC => SLIP_ESC,
                    other => {
                        self.reset();
                        return Err(FramingError::InvalidEscape(other));
                    }
                };
                self.state = DecodeState::Frame;
                self.append(b).map(|_| None)
            }
        }
    }

    /// Number of bytes held for an incomplete frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the decoder has started but not finished a frame
    pub fn in_frame(&self) -> bool {
        self.state == DecodeState::Escape
            || (self.state == DecodeState::Frame && !self.buffer.is_empty())
    }

    /// Drop any partial frame and hunt for the next delimiter
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = DecodeState::Hunting;
    }

    fn append(&mut self, b: u8) -> Result<(), FramingError> {
        if self.buffer.len() >= self.max_len {
            self.reset();
            return Err(FramingError::Oversize(self.max_len));
        }
        self.buffer.push(b);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(d: &mut Decoder, data: &[u8]) -> Vec<Vec<u8>> {
        data.iter()
            .filter_map(|b| d.push(*b).unwrap())
            .collect()
    }

    #[test]
    fn escapes_reserved_bytes() {
        let encoded = encode(&[0x01, SLIP_END, 0x02, SLIP_ESC]);
        assert_eq!(
            encoded,
            vec![SLIP_END, 0x01, SLIP_ESC, SLIP_ESC_END, 0x02, SLIP_ESC, SLIP_ESC_ESC, SLIP_END]
        );
    }

    #[test]
    fn recovers_frames_containing_delimiters() {
        let frame = [SLIP_END, SLIP_ESC, 0x00, SLIP_END, 0xFF];
        let mut d = Decoder::new(64);
        let frames = decode_all(&mut d, &encode(&frame));
        assert_eq!(frames, vec![frame.to_vec()]);
    }

    #[test]
    fn skips_noise_before_first_delimiter() {
        let mut stream = b"boot noise\r\n".to_vec();
        stream.extend(encode(&[0x01, 0x02]));
        stream.extend(encode(&[0x03]));

        let mut d = Decoder::new(64);
        let frames = decode_all(&mut d, &stream);
        assert_eq!(frames, vec![vec![0x01, 0x02], vec![0x03]]);
    }

    #[test]
    fn invalid_escape_resyncs_at_next_frame() {
        let mut d = Decoder::new(64);
        assert_eq!(d.push(SLIP_END), Ok(None));
        assert_eq!(d.push(0x10), Ok(None));
        assert_eq!(d.push(SLIP_ESC), Ok(None));
        assert_eq!(d.push(0x00), Err(FramingError::InvalidEscape(0x00)));

        // Trailing garbage of the broken frame, then a good one
        let mut stream = vec![0x11, 0x12, SLIP_END];
        stream.extend(encode(&[0x42]));
        let frames = decode_all(&mut d, &stream);
        assert_eq!(frames, vec![vec![0x42]]);
    }

    #[test]
    fn oversize_frame_is_rejected() {
        let mut d = Decoder::new(4);
        d.push(SLIP_END).unwrap();
        for _ in 0..4 {
            d.push(0x11).unwrap();
        }
        assert_eq!(d.push(0x22), Err(FramingError::Oversize(4)));
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn tracks_partial_frames() {
        let mut d = Decoder::new(16);
        assert!(!d.in_frame());
        d.push(SLIP_END).unwrap();
        assert!(!d.in_frame());
        d.push(0x01).unwrap();
        assert!(d.in_frame());
        assert_eq!(d.pending(), 1);
    }

    #[test]
    fn pending_escape_is_a_partial_frame() {
        let mut d = Decoder::new(16);
        d.push(SLIP_END).unwrap();
        d.push(SLIP_ESC).unwrap();
        assert!(d.in_frame());
        assert_eq!(d.pending(), 0);

        d.reset();
        assert!(!d.in_frame());
    }
}
