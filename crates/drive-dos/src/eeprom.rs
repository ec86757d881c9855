//! EEPROM façade and the persisted configuration record.
//!
//! The first [`CONFIG_RECORD_LEN`] bytes hold the drive settings guarded
//! by a CRC16; the remainder is the window the host reaches through the
//! `E-R`/`E-W` commands.

use crate::crc::crc16;
use crate::state::{DriveState, IecFlags};

/// Total EEPROM size in bytes.
pub const EEPROM_SIZE: u16 = 1024;

/// Bytes reserved for the configuration record at offset 0.
pub const CONFIG_RECORD_LEN: u16 = 8;

/// Record layout: magic, version, device address, flags, calibration,
/// pad, CRC16 lo/hi.
const CONFIG_MAGIC: u8 = 0x49;
const CONFIG_VERSION: u8 = 1;

/// Byte-addressable non-volatile storage.
pub trait Eeprom {
    fn read_byte(&self, address: u16) -> u8;
    fn write_byte(&mut self, address: u16, value: u8);

    /// Capacity in bytes.
    fn size(&self) -> u16 {
        EEPROM_SIZE
    }
}

/// RAM-backed EEPROM.
pub struct MemEeprom {
    cells: Vec<u8>,
}

impl MemEeprom {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cells: vec![0xFF; EEPROM_SIZE as usize],
        }
    }
}

impl Default for MemEeprom {
    fn default() -> Self {
        Self::new()
    }
}

impl Eeprom for MemEeprom {
    fn read_byte(&self, address: u16) -> u8 {
        self.cells.get(address as usize).copied().unwrap_or(0xFF)
    }

    fn write_byte(&mut self, address: u16, value: u8) {
        if let Some(cell) = self.cells.get_mut(address as usize) {
            *cell = value;
        }
    }
}

/// Persist the drive settings.
pub fn write_configuration(eeprom: &mut dyn Eeprom, state: &DriveState) {
    let record = [
        CONFIG_MAGIC,
        CONFIG_VERSION,
        state.device_address,
        state.flags.bits(),
        state.calibration,
        0,
    ];
    for (i, &b) in record.iter().enumerate() {
        eeprom.write_byte(i as u16, b);
    }
    let crc = crc16(0xFFFF, &record);
    eeprom.write_byte(6, crc as u8);
    eeprom.write_byte(7, (crc >> 8) as u8);
}

/// Restore persisted settings into `state`. Leaves the defaults in place
/// when the record is missing or fails its checksum; returns whether a
/// valid record was applied.
pub fn read_configuration(eeprom: &dyn Eeprom, state: &mut DriveState) -> bool {
    let mut record = [0u8; 6];
    for (i, b) in record.iter_mut().enumerate() {
        *b = eeprom.read_byte(i as u16);
    }
    if record[0] != CONFIG_MAGIC || record[1] != CONFIG_VERSION {
        return false;
    }
    let stored = u16::from(eeprom.read_byte(6)) | u16::from(eeprom.read_byte(7)) << 8;
    if crc16(0xFFFF, &record) != stored {
        return false;
    }

    let address = record[2];
    if (4..=30).contains(&address) {
        state.device_address = address;
    }
    state.flags = IecFlags::from_bits_truncate(record[3]);
    state.calibration = record[4];
    true
}
