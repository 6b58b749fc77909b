//! Command sequencing against the stub.
//!
//! A [`Flasher`] drives one command at a time: the header is sent, any
//! write data is streamed under flow control, and response packets are
//! consumed in order until the terminal status.

use core::ops::ControlFlow;
use core::time::Duration;

use crate::digest::{block_layout, Digest, DigestContext, DigestSet};
use crate::error::{Error, FramingError, PreconditionError, Result, TransportError};
use crate::protocol::{
    ChipId, Command, FlashRegion, Opcode, DIGEST_LEN, MAX_PACKET, SECTOR_SIZE, STATUS_OK,
};
use crate::slip::{self, Decoder};
use crate::transport::Transport;
use crate::writer::{Progress, WriteWindow};
use crate::{Options, State};

/// Size of each transport read
const RX_CHUNK: usize = 256;

/// Quiet period used to drain stale input after a framing error
const DRAIN_TIMEOUT: Duration = Duration::from_millis(20);

/// Value erased flash reads back as, used to pad images
const ERASED: u8 = 0xFF;

/// Typed result of [`Flasher::execute`]
#[derive(Clone, Debug, PartialEq)]
pub enum CommandResult {
    /// Command completed with no output
    Ack,
    /// Write completed, with the device digest of the written data
    Written { bytes: u32, digest: Digest },
    /// Data read back from flash
    Data(Vec<u8>),
    /// Digests of a region
    Digests(DigestSet),
    /// Flash chip ID
    ChipId(ChipId),
}

/// Outcome of [`Flasher::flash_image`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlashSummary {
    /// Sectors covered by the image
    pub sectors: u32,
    /// Sectors already holding the image contents
    pub skipped: u32,
    /// Sectors erased and rewritten
    pub written: u32,
}

struct WriteSession {
    erase: bool,
    window: WriteWindow,
    digest: DigestContext,
}

pub struct Flasher<T> {
    state: State,
    options: Options,
    transport: T,
    decoder: Decoder,
    rx: Vec<u8>,
    rx_pos: usize,
    write: Option<WriteSession>,
}

impl<T> Flasher<T>
where
    T: Transport,
{
    /// Create a flasher over an open transport to a running stub
    pub fn new(transport: T, options: Options) -> Self {
        Self {
            state: State::Idle,
            options,
            transport,
            decoder: Decoder::new(MAX_PACKET),
            rx: Vec::with_capacity(RX_CHUNK),
            rx_pos: 0,
            write: None,
        }
    }

    /// Fetch the session state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Release the transport to the caller
    pub fn release(self) -> T {
        self.transport
    }

    /// Close the underlying transport
    pub fn close(mut self) -> Result<()> {
        self.transport.close()?;
        Ok(())
    }

    /// Read the JEDEC ID of the flash chip
    pub fn chip_id(&mut self) -> Result<ChipId> {
        self.run(&Command::ReadChipId, |f| {
            let timeout = f.options.response_timeout();
            let p = f.next_packet(timeout)?;
            if p.len() != 4 {
                return Err(unexpected("chip id", &p));
            }
            let id = ChipId(u32::from_le_bytes([p[0], p[1], p[2], p[3]]));
            f.expect_status(timeout)?;

            debug!("Chip ID: {}", id);
            Ok(id)
        })
    }

    /// Erase a sector aligned region
    pub fn erase_region(&mut self, region: FlashRegion) -> Result<()> {
        self.run(&Command::EraseRegion(region), |f| {
            let timeout = f.options.erase_timeout();
            f.expect_status(timeout)
        })
    }

    /// Erase the whole chip
    pub fn erase_chip(&mut self) -> Result<()> {
        self.run(&Command::EraseChip, |f| {
            let timeout = f.options.erase_timeout();
            f.expect_status(timeout)
        })
    }

    /// Boot the firmware in flash, the stub does not respond
    pub fn boot_firmware(&mut self) -> Result<()> {
        self.detach(&Command::BootFirmware)
    }

    /// Reboot the device, the stub does not respond
    pub fn reboot(&mut self) -> Result<()> {
        self.detach(&Command::Reboot)
    }

    /// Read a region in packets of up to `block_size` bytes
    pub fn read_region(&mut self, region: FlashRegion, block_size: u32) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(region.len() as usize);
        self.read_region_with(region, block_size, |chunk| data.extend_from_slice(chunk))?;
        Ok(data)
    }

    /// Read a region, passing each packet to `on_data` as it arrives.
    ///
    /// The data is checked against the digest the stub appends, and that
    /// digest is returned.
    pub fn read_region_with<F>(
        &mut self,
        region: FlashRegion,
        block_size: u32,
        mut on_data: F,
    ) -> Result<Digest>
    where
        F: FnMut(&[u8]),
    {
        let cmd = Command::ReadRegion { region, block_size };

        self.run(&cmd, |f| {
            let mut last = None;
            let res = f.read_blocks(region, block_size, &mut last, &mut on_data);

            // A one byte block is indistinguishable from a status byte until
            // the stream stops short
            match (res, last) {
                (Err(Error::Transport(TransportError::Timeout)), Some(code)) => {
                    Err(Error::Device(code))
                }
                (res, _) => res,
            }
        })
    }

    /// Fetch digests for a region.
    ///
    /// With a non-zero `block_size` the stub reports a digest per full block
    /// and for any trailing remainder ahead of the overall digest.
    pub fn digest_region(&mut self, region: FlashRegion, block_size: u32) -> Result<DigestSet> {
        let cmd = Command::DigestRegion { region, block_size };

        self.run(&cmd, |f| {
            let timeout = f.options.erase_timeout();
            let (full, partial) = block_layout(region.len(), block_size);
            let count = full as usize + partial as usize + 1;

            let mut digests = Vec::new();
            for _ in 0..count {
                digests.push(f.next_digest(timeout)?);
            }
            let timeout = f.options.response_timeout();
            f.expect_status(timeout)?;

            Ok(DigestSet::from_digests(region.len(), block_size, digests)?)
        })
    }

    /// Check the contents of a region against `data`
    pub fn verify_region(&mut self, region: FlashRegion, data: &[u8]) -> Result<()> {
        if data.len() as u64 != region.len() as u64 {
            return Err(PreconditionError::LengthMismatch {
                declared: region.len(),
                supplied: data.len() as u64,
            }
            .into());
        }

        let set = self.digest_region(region, 0)?;
        Digest::compute(data).verify(&set.overall)
    }

    /// Write a sector aligned region, returning the device digest of the written data
    pub fn write_region(&mut self, region: FlashRegion, erase: bool, data: &[u8]) -> Result<Digest> {
        self.write_region_with(region, erase, data, |_| ControlFlow::Continue(()))
    }

    /// Write a sector aligned region, reporting each acknowledgment to `on_progress`.
    ///
    /// Returning [`ControlFlow::Break`] stops the write before any further
    /// data is sent and fails with [`Error::PartialWrite`].
    pub fn write_region_with<F>(
        &mut self,
        region: FlashRegion,
        erase: bool,
        data: &[u8],
        mut on_progress: F,
    ) -> Result<Digest>
    where
        F: FnMut(Progress) -> ControlFlow<()>,
    {
        self.ensure_idle()?;
        Command::WriteRegion { region, erase }.validate()?;
        if data.len() as u64 != region.len() as u64 {
            return Err(PreconditionError::LengthMismatch {
                declared: region.len(),
                supplied: data.len() as u64,
            }
            .into());
        }

        self.begin_write(region, erase)?;
        self.feed(data, &mut on_progress)?;
        self.complete(&mut on_progress)
    }

    /// Start a streamed write of `region`; data follows with [`write_data`](Self::write_data)
    pub fn begin_write(&mut self, region: FlashRegion, erase: bool) -> Result<()> {
        self.begin(&Command::WriteRegion { region, erase })?;
        self.write = Some(WriteSession {
            erase,
            window: WriteWindow::new(region.len()),
            digest: DigestContext::new(),
        });
        Ok(())
    }

    /// Stream the next piece of an open write
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.feed(data, &mut |_| ControlFlow::Continue(()))
    }

    /// Complete an open write once all data is sent, returning the device digest
    pub fn finish_write(&mut self) -> Result<Digest> {
        self.complete(&mut |_| ControlFlow::Continue(()))
    }

    /// Progress of the open write, if any
    pub fn write_progress(&self) -> Option<Progress> {
        self.write.as_ref().map(|w| w.window.progress())
    }

    /// Bring a region in line with `image`, rewriting only the sectors that differ.
    ///
    /// The image is padded with erased bytes to a whole number of sectors.
    /// `on_progress` sees cumulative progress over all rewritten sectors.
    pub fn flash_image<F>(&mut self, addr: u32, image: &[u8], mut on_progress: F) -> Result<FlashSummary>
    where
        F: FnMut(Progress) -> ControlFlow<()>,
    {
        let sector = SECTOR_SIZE as usize;
        let padded_len = (image.len() + sector - 1) / sector * sector;
        if padded_len > u32::MAX as usize {
            return Err(PreconditionError::RegionOverflow {
                addr,
                len: u32::MAX,
            }
            .into());
        }

        let region = FlashRegion::new(addr, padded_len as u32);
        region.check_sector_aligned()?;

        let mut padded = image.to_vec();
        padded.resize(padded_len, ERASED);

        let sectors = region.len() / SECTOR_SIZE;
        if sectors == 0 {
            return Ok(FlashSummary { sectors: 0, skipped: 0, written: 0 });
        }

        let local = DigestSet::expected(&padded, SECTOR_SIZE);
        let device = self.digest_region(region, SECTOR_SIZE)?;
        let stale: Vec<u32> = local
            .mismatched_blocks(&device)
            .into_iter()
            .map(|i| i as u32)
            .filter(|i| *i < sectors)
            .collect();

        info!(
            "{} of {} sectors at 0x{:08x} differ",
            stale.len(),
            sectors,
            addr
        );

        let total = stale.len() as u32 * SECTOR_SIZE;
        let mut done = 0;

        for (start, count) in runs(&stale) {
            let offset = start * SECTOR_SIZE;
            let len = count * SECTOR_SIZE;
            let run = FlashRegion::new(addr + offset, len);
            let data = &padded[offset as usize..(offset + len) as usize];

            debug!("Rewriting {} sectors at 0x{:08x}", count, run.addr());
            self.write_region_with(run, true, data, |p| {
                on_progress(Progress {
                    written: done + p.written,
                    sent: done + p.sent,
                    total,
                })
            })?;
            done += len;
        }

        let check = self.digest_region(region, 0)?;
        local.overall.verify(&check.overall)?;

        Ok(FlashSummary {
            sectors,
            skipped: sectors - stale.len() as u32,
            written: stale.len() as u32,
        })
    }

    /// Execute a single command, `input` carries the data for a write
    pub fn execute(&mut self, cmd: &Command, input: &[u8]) -> Result<CommandResult> {
        if !matches!(cmd, Command::WriteRegion { .. }) && !input.is_empty() {
            return Err(PreconditionError::LengthMismatch {
                declared: 0,
                supplied: input.len() as u64,
            }
            .into());
        }

        match cmd {
            Command::EraseRegion(region) => self.erase_region(*region).map(|_| CommandResult::Ack),
            Command::WriteRegion { region, erase } => {
                let digest = self.write_region(*region, *erase, input)?;
                Ok(CommandResult::Written {
                    bytes: region.len(),
                    digest,
                })
            }
            Command::ReadRegion { region, block_size } => self
                .read_region(*region, *block_size)
                .map(CommandResult::Data),
            Command::DigestRegion { region, block_size } => self
                .digest_region(*region, *block_size)
                .map(CommandResult::Digests),
            Command::ReadChipId => self.chip_id().map(CommandResult::ChipId),
            Command::EraseChip => self.erase_chip().map(|_| CommandResult::Ack),
            Command::BootFirmware => self.boot_firmware().map(|_| CommandResult::Ack),
            Command::Reboot => self.reboot().map(|_| CommandResult::Ack),
        }
    }

    /// Receive the data, digest and status of a read.
    ///
    /// `last` holds the most recent packet when it could have been a
    /// non-zero status byte.
    fn read_blocks(
        &mut self,
        region: FlashRegion,
        block_size: u32,
        last: &mut Option<u8>,
        on_data: &mut dyn FnMut(&[u8]),
    ) -> Result<Digest> {
        let timeout = self.options.response_timeout();
        let mut ctx = DigestContext::new();
        let mut received = 0;

        while received < region.len() {
            let expected = block_size.min(region.len() - received);
            let p = self.next_packet(timeout)?;
            if p.len() != expected as usize {
                return Err(unexpected("read data", &p));
            }

            *last = match p.as_slice() {
                [b] if *b != STATUS_OK => Some(*b),
                _ => None,
            };

            ctx.update(&p);
            on_data(&p);
            received += expected;
            trace!("Read {}/{} bytes", received, region.len());
        }

        let device = self.next_digest(timeout)?;
        *last = None;
        self.expect_status(timeout)?;

        ctx.finish().verify(&device)?;
        Ok(device)
    }

    fn ensure_idle(&self) -> core::result::Result<(), PreconditionError> {
        match self.state {
            State::Idle => Ok(()),
            State::InFlight(op) => Err(PreconditionError::Busy(op)),
            State::Broken => Err(PreconditionError::LinkBroken),
            State::Detached => Err(PreconditionError::Detached),
        }
    }

    /// Check and send a command header, marking the command in flight
    fn begin(&mut self, cmd: &Command) -> Result<()> {
        self.ensure_idle()?;
        cmd.validate()?;

        debug!("Sending {:?}", cmd);

        let header = slip::encode(&cmd.encode());
        let sent = match self.transport.write_all(&header) {
            Ok(()) => self.transport.flush(),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            // Part of the header may have reached the device
            error!("Failed sending {:?}: {}", cmd.opcode(), e);
            self.state = State::Broken;
            return Err(e.into());
        }

        self.state = State::InFlight(cmd.opcode());
        Ok(())
    }

    /// Run a command that completes with a status packet
    fn run<R, F>(&mut self, cmd: &Command, f: F) -> Result<R>
    where
        F: FnOnce(&mut Self) -> Result<R>,
    {
        self.begin(cmd)?;

        let res = f(self);
        self.state = State::Idle;

        if let Err(e) = &res {
            debug!("{:?} failed: {}", cmd.opcode(), e);
            if e.leaves_command_open() {
                // A late status would otherwise be taken as the next command's
                error!("{:?} left without a terminal response, reconnect required", cmd.opcode());
                self.state = State::Broken;
                self.rx.clear();
                self.rx_pos = 0;
                self.decoder.reset();
            } else if e.desynchronises() {
                self.resync();
            }
        }
        res
    }

    fn detach(&mut self, cmd: &Command) -> Result<()> {
        self.begin(cmd)?;
        self.state = State::Detached;
        info!("Device left the stub ({:?})", cmd.opcode());
        Ok(())
    }

    fn feed(
        &mut self,
        data: &[u8],
        on_progress: &mut dyn FnMut(Progress) -> ControlFlow<()>,
    ) -> Result<()> {
        let mut ws = self.take_write()?;

        let remaining = ws.window.remaining();
        if data.len() as u64 > remaining as u64 {
            let supplied = ws.window.sent() as u64 + data.len() as u64;
            let declared = ws.window.len();
            self.write = Some(ws);
            return Err(PreconditionError::LengthMismatch { declared, supplied }.into());
        }

        let res = self.pump(&mut ws, data, on_progress);
        self.end_write(ws, res)
    }

    fn complete(&mut self, on_progress: &mut dyn FnMut(Progress) -> ControlFlow<()>) -> Result<Digest> {
        let mut ws = self.take_write()?;

        if !ws.window.is_delivered() {
            let supplied = ws.window.sent() as u64;
            let declared = ws.window.len();
            self.write = Some(ws);
            return Err(PreconditionError::LengthMismatch { declared, supplied }.into());
        }

        let res = self.drain_write(&mut ws, on_progress);
        let acked = ws.window.acked();
        let expected = ws.digest.finish();

        match res {
            Ok(device) => {
                self.state = State::Idle;
                debug!("Write of {} bytes complete, digest {}", acked, device);
                expected.verify(&device)?;
                Ok(device)
            }
            Err(e) => self.fail_write(e, acked),
        }
    }

    fn take_write(&mut self) -> Result<WriteSession> {
        match (self.state, self.write.take()) {
            (State::InFlight(Opcode::WriteRegion), Some(ws)) => Ok(ws),
            (State::Idle, _) => Err(PreconditionError::NoWrite.into()),
            _ => Err(self.ensure_idle().err().unwrap_or(PreconditionError::NoWrite).into()),
        }
    }

    fn end_write(&mut self, ws: WriteSession, res: Result<()>) -> Result<()> {
        let acked = ws.window.acked();
        self.write = Some(ws);
        match res {
            Ok(()) => Ok(()),
            Err(e) => self.fail_write(e, acked),
        }
    }

    fn fail_write<R>(&mut self, e: Error, acked: u32) -> Result<R> {
        error!("Write failed after {} bytes: {}", acked, e);
        self.write = None;
        self.state = State::Broken;
        self.decoder.reset();
        Err(e.partial(acked))
    }

    /// Send as much of `data` as the window allows, waiting for acknowledgments as needed
    fn pump(
        &mut self,
        ws: &mut WriteSession,
        mut data: &[u8],
        on_progress: &mut dyn FnMut(Progress) -> ControlFlow<()>,
    ) -> Result<()> {
        while !data.is_empty() {
            let n = ws.window.next_chunk(data.len());
            if n == 0 {
                self.await_ack(ws, on_progress)?;
                continue;
            }

            let (chunk, rest) = data.split_at(n as usize);
            self.transport.write_all(chunk)?;
            ws.window.record_sent(n);
            ws.digest.update(chunk);
            data = rest;

            trace!(
                "Sent {}/{} bytes, {} in flight",
                ws.window.sent(),
                ws.window.len(),
                ws.window.in_flight()
            );
        }

        self.transport.flush()?;
        Ok(())
    }

    /// Collect remaining acknowledgments then the digest and status
    fn drain_write(
        &mut self,
        ws: &mut WriteSession,
        on_progress: &mut dyn FnMut(Progress) -> ControlFlow<()>,
    ) -> Result<Digest> {
        while !ws.window.is_complete() {
            self.await_ack(ws, on_progress)?;
        }

        let timeout = self.options.response_timeout();
        let digest = self.next_digest(timeout)?;
        self.expect_status(timeout)?;
        Ok(digest)
    }

    /// Block on the next progress packet
    fn await_ack(
        &mut self,
        ws: &mut WriteSession,
        on_progress: &mut dyn FnMut(Progress) -> ControlFlow<()>,
    ) -> Result<()> {
        // An erasing write clears the region before the first commit
        let timeout = if ws.erase && ws.window.acked() == 0 {
            self.options.erase_timeout()
        } else {
            self.options.response_timeout()
        };

        let p = self.next_packet(timeout)?;
        if p.len() != 4 {
            return Err(unexpected("write progress", &p));
        }

        ws.window
            .record_ack(u32::from_le_bytes([p[0], p[1], p[2], p[3]]))?;

        if ws.window.is_starved() {
            trace!("Device buffer below low watermark ({} in flight)", ws.window.in_flight());
        }

        match on_progress(ws.window.progress()) {
            ControlFlow::Continue(()) => Ok(()),
            ControlFlow::Break(()) => {
                warn!("Write aborted at {} bytes", ws.window.acked());
                Err(Error::Aborted)
            }
        }
    }

    fn expect_status(&mut self, timeout: Duration) -> Result<()> {
        let p = self.next_packet(timeout)?;
        match p.as_slice() {
            [STATUS_OK] => Ok(()),
            [code] => Err(Error::Device(*code)),
            _ => Err(unexpected("status", &p)),
        }
    }

    fn next_digest(&mut self, timeout: Duration) -> Result<Digest> {
        let p = self.next_packet(timeout)?;
        if p.len() != DIGEST_LEN {
            return Err(unexpected("digest", &p));
        }
        Ok(Digest::from_packet(&p)?)
    }

    /// Fetch the next decoded packet from the transport
    fn next_packet(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        loop {
            while self.rx_pos < self.rx.len() {
                let b = self.rx[self.rx_pos];
                self.rx_pos += 1;

                if let Some(p) = self.decoder.push(b)? {
                    trace!("Received {} byte packet", p.len());
                    return Ok(p);
                }
            }

            let mut buf = [0u8; RX_CHUNK];
            let n = self.transport.read(&mut buf, timeout)?;
            if n == 0 {
                if self.decoder.in_frame() {
                    let pending = self.decoder.pending();
                    self.decoder.reset();
                    return Err(FramingError::Truncated(pending).into());
                }
                return Err(TransportError::Timeout.into());
            }

            self.rx.clear();
            self.rx.extend_from_slice(&buf[..n]);
            self.rx_pos = 0;
        }
    }

    /// Drop buffered and pending input so the next command starts on a frame boundary
    fn resync(&mut self) {
        warn!("Resynchronising input stream");

        self.rx.clear();
        self.rx_pos = 0;
        self.decoder.reset();

        let mut buf = [0u8; RX_CHUNK];
        while let Ok(n) = self.transport.read(&mut buf, DRAIN_TIMEOUT) {
            if n == 0 {
                break;
            }
            trace!("Discarded {} stale bytes", n);
        }
    }
}

/// Interpret a packet of the wrong shape, a lone non-zero byte is a device status
fn unexpected(expected: &'static str, packet: &[u8]) -> Error {
    match packet {
        [code] if *code != STATUS_OK => Error::Device(*code),
        _ => FramingError::UnexpectedPacket {
            expected,
            len: packet.len(),
        }
        .into(),
    }
}

/// Group sorted indices into (start, count) runs
fn runs(indices: &[u32]) -> Vec<(u32, u32)> {
    let mut out: Vec<(u32, u32)> = Vec::new();
    for &i in indices {
        match out.last_mut() {
            Some((start, count)) if *start + *count == i => *count += 1,
            _ => out.push((i, 1)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_sector_runs() {
        assert!(runs(&[]).is_empty());
        assert_eq!(runs(&[0, 1, 2, 5, 7, 8]), vec![(0, 3), (5, 1), (7, 2)]);
    }

    #[test]
    fn lone_status_byte_is_a_device_error() {
        assert!(matches!(unexpected("digest", &[0x05]), Error::Device(0x05)));
        assert!(matches!(
            unexpected("digest", &[0x00]),
            Error::Framing(FramingError::UnexpectedPacket { len: 1, .. })
        ));
        assert!(matches!(
            unexpected("digest", &[1, 2, 3]),
            Error::Framing(FramingError::UnexpectedPacket { len: 3, .. })
        ));
    }
}
