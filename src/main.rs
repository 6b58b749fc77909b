#[macro_use]
extern crate log;

use std::convert::TryFrom;
use std::ops::ControlFlow;
use std::path::PathBuf;

use anyhow::Context;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use indicatif::{ProgressBar, ProgressStyle};

use stub_flasher::{FlashRegion, Flasher, Options, Progress, SECTOR_SIZE};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    #[structopt(subcommand)]
    op: Operation,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Read the flash chip ID
    ChipId,

    /// Erase a sector aligned region
    Erase {
        #[structopt(parse(try_from_str = parse_u32))]
        addr: u32,
        #[structopt(parse(try_from_str = parse_u32))]
        len: u32,
    },

    /// Erase the whole chip
    EraseChip,

    /// Write a file to flash
    Write {
        #[structopt(parse(try_from_str = parse_u32))]
        addr: u32,
        file: PathBuf,

        /// Rewrite every sector rather than only those that differ
        #[structopt(long)]
        full: bool,

        /// Skip erasing before a full write
        #[structopt(long)]
        no_erase: bool,
    },

    /// Read flash to a file
    Read {
        #[structopt(parse(try_from_str = parse_u32))]
        addr: u32,
        #[structopt(parse(try_from_str = parse_u32))]
        len: u32,
        file: PathBuf,
    },

    /// Print digests of a region
    Digest {
        #[structopt(parse(try_from_str = parse_u32))]
        addr: u32,
        #[structopt(parse(try_from_str = parse_u32))]
        len: u32,

        /// Report a digest per block of this size as well
        #[structopt(long, default_value = "0", parse(try_from_str = parse_u32))]
        block_size: u32,
    },

    /// Compare a file against flash contents
    Verify {
        #[structopt(parse(try_from_str = parse_u32))]
        addr: u32,
        file: PathBuf,
    },

    /// Boot the firmware in flash
    Boot,

    /// Reboot the device
    Reboot,
}

/// Parse a decimal or 0x prefixed hex value
fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

/// Length of a file image as a region length
fn image_len(len: usize) -> anyhow::Result<u32> {
    u32::try_from(len).context("image exceeds the 32-bit address space")
}

/// Address of digest block `i`, widened so large regions cannot overflow
fn block_offset(addr: u32, i: usize, block_size: u32) -> u64 {
    addr as u64 + i as u64 * block_size as u64
}

fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40} {bytes}/{total_bytes} ({eta})")
            .progress_chars("=> "),
    );
    pb
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    info!("Connecting to serial port");

    let mut f = Flasher::linux(&o.port, o.baud, o.options.clone())
        .map_err(|e| anyhow::anyhow!("Error connecting to serial port: {:?}", e))?;

    match o.op {
        Operation::ChipId => {
            let id = f.chip_id()?;
            match id.size_bytes() {
                Some(size) => info!("Chip ID: {} ({})", id, bytefmt::format(size)),
                None => info!("Chip ID: {}", id),
            }
        }
        Operation::Erase { addr, len } => {
            f.erase_region(FlashRegion::new(addr, len))?;
            info!("Erased {} at 0x{:08x}", bytefmt::format(len as u64), addr);
        }
        Operation::EraseChip => {
            f.erase_chip()?;
            info!("Chip erased");
        }
        Operation::Write {
            addr,
            file,
            full,
            no_erase,
        } => {
            let image = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            info!(
                "Writing {} ({}) at 0x{:08x}",
                file.display(),
                bytefmt::format(image.len() as u64),
                addr
            );

            let pb = progress_bar(0);
            let on_progress = |p: Progress| {
                pb.set_length(p.total as u64);
                pb.set_position(p.written as u64);
                ControlFlow::Continue(())
            };

            if full {
                let mut data = image;
                let padded = (data.len() + SECTOR_SIZE as usize - 1) / SECTOR_SIZE as usize
                    * SECTOR_SIZE as usize;
                data.resize(padded, 0xFF);

                let len = image_len(data.len())?;
                let region = FlashRegion::new(addr, len);
                let digest = f.write_region_with(region, !no_erase, &data, on_progress)?;
                pb.finish();
                info!("Write complete, digest {}", hex::encode(digest.as_bytes()));
            } else {
                let summary = f.flash_image(addr, &image, on_progress)?;
                pb.finish();
                info!(
                    "Write complete, {} sectors rewritten, {} unchanged",
                    summary.written, summary.skipped
                );
            }
        }
        Operation::Read { addr, len, file } => {
            let pb = progress_bar(len as u64);
            let mut data = Vec::with_capacity(len as usize);

            let block_size = o.options.read_block_size;
            let digest = f.read_region_with(FlashRegion::new(addr, len), block_size, |chunk| {
                data.extend_from_slice(chunk);
                pb.set_position(data.len() as u64);
            })?;
            pb.finish();

            std::fs::write(&file, &data).with_context(|| format!("writing {}", file.display()))?;
            info!(
                "Read {} to {}, digest {}",
                bytefmt::format(len as u64),
                file.display(),
                hex::encode(digest.as_bytes())
            );
        }
        Operation::Digest {
            addr,
            len,
            block_size,
        } => {
            let set = f.digest_region(FlashRegion::new(addr, len), block_size)?;
            for (i, d) in set.blocks.iter().enumerate() {
                println!("0x{:08x} {}", block_offset(addr, i, block_size), hex::encode(d.as_bytes()));
            }
            if let Some(d) = set.remainder {
                println!(
                    "0x{:08x} {}",
                    block_offset(addr, set.blocks.len(), block_size),
                    hex::encode(d.as_bytes())
                );
            }
            println!("overall    {}", hex::encode(set.overall.as_bytes()));
        }
        Operation::Verify { addr, file } => {
            let image = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let len = image_len(image.len())?;
            f.verify_region(FlashRegion::new(addr, len), &image)?;
            info!("Flash contents match {}", file.display());
        }
        Operation::Boot => f.boot_firmware()?,
        Operation::Reboot => f.reboot()?,
    }

    f.close()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_and_decimal() {
        assert_eq!(parse_u32("0x1000"), Ok(0x1000));
        assert_eq!(parse_u32("4096"), Ok(4096));
        assert!(parse_u32("0xZZ").is_err());
    }

    #[test]
    fn oversized_images_are_rejected() {
        assert_eq!(image_len(4096).unwrap(), 4096);
        assert!(image_len(u32::MAX as usize).is_ok());
        #[cfg(target_pointer_width = "64")]
        assert!(image_len(u32::MAX as usize + 1).is_err());
    }

    #[test]
    fn block_offsets_past_4gib_do_not_wrap() {
        assert_eq!(block_offset(0x1000, 2, 0x800), 0x2000);
        assert_eq!(block_offset(u32::MAX, 1, u32::MAX), 2 * u32::MAX as u64);
    }
}
