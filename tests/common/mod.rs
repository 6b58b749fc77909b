//! In-memory stub used to exercise the flasher without hardware.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::time::Duration;

use stub_flasher::digest::{Digest, DigestContext};
use stub_flasher::protocol::{HIGH_WATERMARK, SECTOR_SIZE, WRITE_CHUNK};
use stub_flasher::slip::{self, Decoder};
use stub_flasher::{Transport, TransportError};

struct WriteState {
    addr: u32,
    len: u32,
    received: u32,
    committed: u32,
    buffer: VecDeque<u8>,
    digest: DigestContext,
    failed: bool,
}

/// Simulated stub with a bounded receive buffer and lazy flash commits.
///
/// Commits only happen when the host reads, so acknowledgments lag behind
/// sent data by as much as the host allows.
pub struct SimStub {
    pub flash: Vec<u8>,
    pub chip_id: u32,

    /// Chunks committed per host read, cycled
    pub commit_pattern: Vec<usize>,
    /// Largest number of bytes handed out per read
    pub read_fragment: usize,
    /// Respond to this opcode with this status instead of executing it
    pub fail: Option<(u8, u8)>,
    /// Flip a bit in every digest sent
    pub corrupt_digests: bool,
    /// Drop the link once this many bytes have been received
    pub disconnect_after: Option<usize>,
    /// Never respond
    pub mute: bool,
    /// Reads that come back empty before anything is delivered
    pub stall_reads: usize,
    /// Reported in place of the next write acknowledgment
    pub bogus_ack: Option<u32>,

    pub rx_log: Vec<u8>,
    pub opcodes: Vec<u8>,
    pub acks: Vec<u32>,
    pub max_buffered: usize,
    pub overrun: bool,
    pub booted: bool,
    pub rebooted: bool,
    pub disconnected: bool,

    decoder: Decoder,
    outbox: VecDeque<u8>,
    write: Option<WriteState>,
    pattern_pos: usize,
}

impl SimStub {
    pub fn new(flash_size: usize) -> Self {
        Self {
            flash: vec![0xFF; flash_size],
            chip_id: 0xA5_16_40_EF,
            commit_pattern: vec![1],
            read_fragment: 64,
            fail: None,
            corrupt_digests: false,
            disconnect_after: None,
            mute: false,
            stall_reads: 0,
            bogus_ack: None,
            rx_log: Vec::new(),
            opcodes: Vec::new(),
            acks: Vec::new(),
            max_buffered: 0,
            overrun: false,
            booted: false,
            rebooted: false,
            disconnected: false,
            decoder: Decoder::new(64),
            outbox: VecDeque::new(),
            write: None,
            pattern_pos: 0,
        }
    }

    /// Queue raw bytes ahead of any response
    pub fn inject(&mut self, bytes: &[u8]) {
        self.outbox.extend(bytes.iter().cloned());
    }

    fn send(&mut self, packet: &[u8]) {
        if self.mute {
            return;
        }
        self.outbox.extend(slip::encode(packet));
    }

    fn send_digest(&mut self, mut d: Digest) {
        if self.corrupt_digests {
            d.0[0] ^= 0x01;
        }
        self.send(&d.0);
    }

    fn receiving_data(&self) -> bool {
        matches!(&self.write, Some(w) if w.received < w.len)
    }

    fn receive(&mut self, b: u8) {
        if self.receiving_data() {
            if let Some(w) = self.write.as_mut() {
                w.received += 1;
                if !w.failed {
                    w.buffer.push_back(b);
                    w.digest.update(&[b]);
                }
                self.max_buffered = self.max_buffered.max(w.buffer.len());
                if w.buffer.len() > HIGH_WATERMARK as usize {
                    self.overrun = true;
                }
            }
            if matches!(&self.write, Some(w) if w.failed && w.received == w.len) {
                self.write = None;
            }
            return;
        }

        if let Some(frame) = self.decoder.push(b).expect("bad command framing") {
            self.command(&frame);
        }
    }

    fn command(&mut self, frame: &[u8]) {
        let op = frame[0];
        let args: Vec<u32> = frame[1..]
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        self.opcodes.push(op);

        if let Some((fail_op, code)) = self.fail {
            if fail_op == op {
                self.send(&[code]);
                if op == 1 {
                    // Swallow the data that follows
                    self.write = Some(WriteState {
                        addr: args[0],
                        len: args[1],
                        received: 0,
                        committed: 0,
                        buffer: VecDeque::new(),
                        digest: DigestContext::new(),
                        failed: true,
                    });
                }
                return;
            }
        }

        match op {
            0 => {
                let (addr, len) = (args[0] as usize, args[1] as usize);
                self.flash[addr..addr + len].iter_mut().for_each(|b| *b = 0xFF);
                self.send(&[0]);
            }
            1 => {
                let (addr, len, erase) = (args[0], args[1], args[2] != 0);
                assert_eq!(addr % SECTOR_SIZE, 0);
                assert_eq!(len % SECTOR_SIZE, 0);
                if erase {
                    self.flash[addr as usize..(addr + len) as usize]
                        .iter_mut()
                        .for_each(|b| *b = 0xFF);
                }
                self.write = Some(WriteState {
                    addr,
                    len,
                    received: 0,
                    committed: 0,
                    buffer: VecDeque::new(),
                    digest: DigestContext::new(),
                    failed: false,
                });
                if len == 0 {
                    self.commit(0);
                }
            }
            2 => {
                let (addr, len, bs) = (args[0] as usize, args[1] as usize, args[2] as usize);
                let data = self.flash[addr..addr + len].to_vec();
                for chunk in data.chunks(bs) {
                    self.send(chunk);
                }
                self.send_digest(Digest::compute(&data));
                self.send(&[0]);
            }
            3 => {
                let (addr, len, bs) = (args[0] as usize, args[1] as usize, args[2] as usize);
                let data = self.flash[addr..addr + len].to_vec();
                if bs > 0 {
                    for chunk in data.chunks(bs) {
                        self.send_digest(Digest::compute(chunk));
                    }
                }
                self.send_digest(Digest::compute(&data));
                self.send(&[0]);
            }
            4 => {
                let id = self.chip_id.to_le_bytes();
                self.send(&id);
                self.send(&[0]);
            }
            5 => {
                self.flash.iter_mut().for_each(|b| *b = 0xFF);
                self.send(&[0]);
            }
            6 => self.booted = true,
            7 => self.rebooted = true,
            _ => self.send(&[0xFF]),
        }
    }

    /// Commit up to `chunks` buffered chunks to flash, acknowledging each
    fn commit(&mut self, chunks: usize) {
        let mut done = 0;
        loop {
            let w = match self.write.as_mut() {
                Some(w) if !w.failed => w,
                _ => return,
            };

            if w.committed == w.len {
                let digest = core::mem::take(&mut w.digest).finish();
                self.write = None;
                self.send_digest(digest);
                self.send(&[0]);
                return;
            }

            let chunk = WRITE_CHUNK.min(w.len - w.committed) as usize;
            if done >= chunks || w.buffer.len() < chunk {
                return;
            }

            let start = (w.addr + w.committed) as usize;
            for i in 0..chunk {
                let b = w.buffer.pop_front().unwrap_or(0xFF);
                // NOR flash can only clear bits
                self.flash[start + i] &= b;
            }
            w.committed += chunk as u32;
            let committed = w.committed;

            self.acks.push(committed);
            let reported = self.bogus_ack.take().unwrap_or(committed);
            self.send(&reported.to_le_bytes());
            done += 1;
        }
    }
}

impl Transport for SimStub {
    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        if self.disconnected {
            return Err(TransportError::Disconnected);
        }
        if self.stall_reads > 0 {
            self.stall_reads -= 1;
            return Ok(0);
        }

        let mut chunks = self.commit_pattern[self.pattern_pos % self.commit_pattern.len()];
        self.pattern_pos += 1;
        if chunks == 0 && self.outbox.is_empty() {
            chunks = 1;
        }
        self.commit(chunks);

        let n = buf.len().min(self.read_fragment).min(self.outbox.len());
        for b in buf[..n].iter_mut() {
            *b = self.outbox.pop_front().unwrap_or(0);
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if self.disconnected {
            return Err(TransportError::Disconnected);
        }

        for &b in data {
            if let Some(limit) = self.disconnect_after {
                if self.rx_log.len() >= limit {
                    self.disconnected = true;
                    return Err(TransportError::Disconnected);
                }
            }
            self.rx_log.push(b);
            self.receive(b);
        }
        Ok(data.len())
    }
}

/// Deterministic test pattern that avoids long runs of any value
pub fn pattern(len: usize, seed: u32) -> Vec<u8> {
    let mut x = seed | 1;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            (x >> 24) as u8
        })
        .collect()
}
