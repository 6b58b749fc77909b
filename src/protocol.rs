//! Stub loader command set and wire constants.

use crate::error::PreconditionError;

/// Minimum erase granularity of the SPI flash
pub const SECTOR_SIZE: u32 = 4096;

/// Largest block the stub will stream for a read
pub const MAX_BLOCK_SIZE: u32 = 4096;

/// Size of each device-side flash write
pub const WRITE_CHUNK: u32 = 1024;

/// In-flight level below which the device risks idling between commits
pub const LOW_WATERMARK: u32 = 1024;

/// Capacity of the device receive buffer, in-flight bytes must never exceed this
pub const HIGH_WATERMARK: u32 = 4096;

/// Length of an MD5 digest on the wire
pub const DIGEST_LEN: usize = 16;

/// Largest inbound packet accepted before the stream is considered garbled
pub const MAX_PACKET: usize = MAX_BLOCK_SIZE as usize;

/// Status byte reported by the stub on success
pub const STATUS_OK: u8 = 0x00;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Erases a sector aligned region of flash.
    EraseRegion = 0x00,

    /// Writes a sector aligned region, optionally erasing first. Data follows the header unframed.
    WriteRegion = 0x01,

    /// Reads a region back in blocks of up to 4K, followed by the digest of the data.
    ReadRegion = 0x02,

    /// Computes block, remainder and overall digests of a region.
    DigestRegion = 0x03,

    /// Reads the JEDEC ID of the flash chip.
    ReadChipId = 0x04,

    /// Erases the whole chip.
    EraseChip = 0x05,

    /// Boots the firmware from flash.
    BootFirmware = 0x06,

    /// Reboots the CPU into whatever mode the strapping pins select.
    Reboot = 0x07,
}

/// A byte range in the flash address space
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlashRegion {
    addr: u32,
    len: u32,
}

impl FlashRegion {
    pub const fn new(addr: u32, len: u32) -> Self {
        Self { addr, len }
    }

    pub const fn addr(&self) -> u32 {
        self.addr
    }

    pub const fn len(&self) -> u32 {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check the region lies within the 32-bit address space
    pub fn check_bounds(&self) -> Result<(), PreconditionError> {
        match self.addr.checked_add(self.len) {
            Some(_) => Ok(()),
            None => Err(PreconditionError::RegionOverflow {
                addr: self.addr,
                len: self.len,
            }),
        }
    }

    /// Check both ends of the region fall on sector boundaries
    pub fn check_sector_aligned(&self) -> Result<(), PreconditionError> {
        if self.addr % SECTOR_SIZE != 0 || self.len % SECTOR_SIZE != 0 {
            return Err(PreconditionError::Unaligned {
                addr: self.addr,
                len: self.len,
                sector_size: SECTOR_SIZE,
            });
        }
        self.check_bounds()
    }
}

/// A single stub command with the arguments it carries on the wire
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    EraseRegion(FlashRegion),
    WriteRegion { region: FlashRegion, erase: bool },
    ReadRegion { region: FlashRegion, block_size: u32 },
    DigestRegion { region: FlashRegion, block_size: u32 },
    ReadChipId,
    EraseChip,
    BootFirmware,
    Reboot,
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::EraseRegion(_) => Opcode::EraseRegion,
            Command::WriteRegion { .. } => Opcode::WriteRegion,
            Command::ReadRegion { .. } => Opcode::ReadRegion,
            Command::DigestRegion { .. } => Opcode::DigestRegion,
            Command::ReadChipId => Opcode::ReadChipId,
            Command::EraseChip => Opcode::EraseChip,
            Command::BootFirmware => Opcode::BootFirmware,
            Command::Reboot => Opcode::Reboot,
        }
    }

    /// Local argument checks, run before anything is sent
    pub fn validate(&self) -> Result<(), PreconditionError> {
        match self {
            Command::EraseRegion(region) | Command::WriteRegion { region, .. } => {
                region.check_sector_aligned()
            }
            Command::ReadRegion { region, block_size } => {
                if *block_size == 0 || *block_size > MAX_BLOCK_SIZE {
                    return Err(PreconditionError::BlockSize {
                        block_size: *block_size,
                        max: MAX_BLOCK_SIZE,
                    });
                }
                region.check_bounds()
            }
            Command::DigestRegion { region, .. } => region.check_bounds(),
            Command::ReadChipId | Command::EraseChip | Command::BootFirmware | Command::Reboot => {
                Ok(())
            }
        }
    }

    /// Whether the stub answers this command at all
    pub fn expects_response(&self) -> bool {
        !matches!(self, Command::BootFirmware | Command::Reboot)
    }

    /// Encode the (unframed) command header: opcode followed by little-endian u32 arguments
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 3 * 4);
        buf.push(self.opcode() as u8);

        let mut push = |v: u32| buf.extend_from_slice(&v.to_le_bytes());

        match self {
            Command::EraseRegion(region) => {
                push(region.addr());
                push(region.len());
            }
            Command::WriteRegion { region, erase } => {
                push(region.addr());
                push(region.len());
                push(*erase as u32);
            }
            Command::ReadRegion { region, block_size }
            | Command::DigestRegion { region, block_size } => {
                push(region.addr());
                push(region.len());
                push(*block_size);
            }
            Command::ReadChipId | Command::EraseChip | Command::BootFirmware | Command::Reboot => (),
        }

        buf
    }
}

/// JEDEC flash ID as reported by the stub, only the low 24 bits are meaningful
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChipId(pub u32);

impl ChipId {
    /// The meaningful 24 bits of the ID
    pub fn jedec(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    pub fn manufacturer(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    pub fn memory_type(&self) -> u8 {
        ((self.0 >> 8) & 0xFF) as u8
    }

    pub fn capacity(&self) -> u8 {
        ((self.0 >> 16) & 0xFF) as u8
    }

    /// Flash size in bytes, derived from the capacity byte
    pub fn size_bytes(&self) -> Option<u64> {
        match self.capacity() {
            c @ 0x10..=0x3F => Some(1u64 << c),
            _ => None,
        }
    }
}

impl core::fmt::Display for ChipId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:06x}", self.jedec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_header_layout() {
        let cmd = Command::WriteRegion {
            region: FlashRegion::new(0x1000, 0x2000),
            erase: true,
        };
        assert_eq!(
            cmd.encode(),
            vec![0x01, 0x00, 0x10, 0x00, 0x00, 0x00, 0x20, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn argless_commands_are_a_single_byte() {
        assert_eq!(Command::ReadChipId.encode(), vec![0x04]);
        assert_eq!(Command::EraseChip.encode(), vec![0x05]);
        assert_eq!(Command::BootFirmware.encode(), vec![0x06]);
        assert_eq!(Command::Reboot.encode(), vec![0x07]);
    }

    #[test]
    fn erase_and_write_require_alignment() {
        let bad = [
            FlashRegion::new(0x1001, 0x1000),
            FlashRegion::new(0x1000, 0x0fff),
        ];
        for region in bad.iter() {
            assert!(matches!(
                Command::EraseRegion(*region).validate(),
                Err(PreconditionError::Unaligned { .. })
            ));
            assert!(matches!(
                Command::WriteRegion { region: *region, erase: false }.validate(),
                Err(PreconditionError::Unaligned { .. })
            ));
        }
        assert!(Command::EraseRegion(FlashRegion::new(0x3000, 0x2000))
            .validate()
            .is_ok());
    }

    #[test]
    fn read_allows_unaligned_but_bounds_block_size() {
        let region = FlashRegion::new(0x123, 77);
        assert!(Command::ReadRegion { region, block_size: 4096 }.validate().is_ok());
        assert!(matches!(
            Command::ReadRegion { region, block_size: 4097 }.validate(),
            Err(PreconditionError::BlockSize { .. })
        ));
        assert!(matches!(
            Command::ReadRegion { region, block_size: 0 }.validate(),
            Err(PreconditionError::BlockSize { .. })
        ));
    }

    #[test]
    fn region_overflow_is_rejected() {
        let region = FlashRegion::new(0xFFFF_F000, 0x2000);
        assert!(matches!(
            Command::DigestRegion { region, block_size: 0 }.validate(),
            Err(PreconditionError::RegionOverflow { .. })
        ));
    }

    #[test]
    fn chip_id_ignores_top_byte() {
        let id = ChipId(0xAB16_40EF);
        assert_eq!(id.jedec(), 0x16_40EF);
        assert_eq!(id.manufacturer(), 0xEF);
        assert_eq!(id.memory_type(), 0x40);
        assert_eq!(id.capacity(), 0x16);
        assert_eq!(id.size_bytes(), Some(4 * 1024 * 1024));
        assert_eq!(id.to_string(), "1640ef");
    }
}
