//! Command-channel DOS core for an SD-backed Commodore-style drive.
//!
//! The host talks to the drive over the three-wire serial bus; completed
//! command strings land in the command buffer and [`parse_doscommand`]
//! interprets them: block I/O, memory peek/poke, partition switching,
//! directory management, rename, scratch, utility commands and EEPROM
//! access. Memory-write streams are fingerprinted by CRC16 so uploaded
//! fast-loader code can be recognised and armed for execution.

pub mod buffers;
pub mod crc;
pub mod doscmd;
pub mod drive;
pub mod eeprom;
pub mod fs;
pub mod imagefs;
pub mod path;
pub mod state;
pub mod status;

pub use buffers::{Buffer, BufferPool, ERROR_CHANNEL, SectorRef};
pub use doscmd::{COMMAND_BUFFER_SIZE, parse_doscommand};
pub use drive::Drive;
pub use eeprom::{Eeprom, MemEeprom};
pub use fs::{DirEntry, EntryKind, FileOps, FsError, MatchFlags, Medium, Partition};
pub use imagefs::ImageFs;
pub use state::{DiskState, DriveConfig, DriveState, IecFlags, LoaderKind, LoaderSignature};
pub use status::{DosError, ErrorCode};
