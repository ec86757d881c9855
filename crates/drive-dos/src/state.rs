//! Process-wide drive state: IEC flags, loader detection, configuration.

use bitflags::bitflags;

use crate::fs::DirHandle;

bitflags! {
    /// Bus-behaviour flags, persisted as one byte in the configuration
    /// record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IecFlags: u8 {
        /// Jiffy-protocol handshake enabled.
        const JIFFY_ENABLED = 0b0000_0001;
        /// VIC-20 bus timing (slower edges).
        const VC20MODE = 0b0000_0010;
        /// A disk-swap list is active.
        const AUTOSWAP_ACTIVE = 0b0000_0100;
    }
}

/// Media state reported by the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiskState {
    /// Medium present and readable.
    #[default]
    Ok,
    /// Medium present but unreadable.
    NoSync,
    /// Medium removed.
    Removed,
}

/// Fast loaders this drive can recognise from uploaded code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderKind {
    /// Turbodisk (detection and upload quirks only; transfer unsupported).
    Turbodisk,
    /// Another World trackloader: lockstep bytes on CLOCK edges.
    AnotherWorld,
    /// N0stalgia IFFL scanner: builds the vfile track/sector table.
    IfflScan,
    /// N0stalgia IFFL loader: serves vfile reads and writes.
    IfflLoad,
    /// Wings of Fury: checksummed commands, time-quantized bytes.
    WingsOfFury,
}

/// Fingerprint of one uploaded loader: the cumulative CRC16 of its
/// memory-write stream plus the execute address the title jumps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderSignature {
    pub crc: u16,
    pub exec_address: u16,
    pub loader: LoaderKind,
}

/// Built-in signature table. Kept as data so firmware variants can extend
/// or replace it and tests can probe it.
#[must_use]
pub fn default_signatures() -> Vec<LoaderSignature> {
    vec![
        LoaderSignature {
            crc: 0xE1CB,
            exec_address: 0x0303,
            loader: LoaderKind::Turbodisk,
        },
        LoaderSignature {
            crc: 0x61A4,
            exec_address: 0x0300,
            loader: LoaderKind::AnotherWorld,
        },
        LoaderSignature {
            crc: 0x9FCC,
            exec_address: 0x0500,
            loader: LoaderKind::IfflScan,
        },
        LoaderSignature {
            crc: 0x4E2B,
            exec_address: 0x0300,
            loader: LoaderKind::IfflLoad,
        },
        LoaderSignature {
            crc: 0xB2D5,
            exec_address: 0x0300,
            loader: LoaderKind::WingsOfFury,
        },
    ]
}

/// Build-time knobs plus the loader signature table.
pub struct DriveConfig {
    /// Delay performed by the format command. One speed-test program
    /// divides by the elapsed time and traps on zero, so a real pause is
    /// the default; tests set this to 0.
    pub format_delay_ms: u32,
    /// Loader fingerprints checked after every memory write.
    pub signatures: Vec<LoaderSignature>,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            format_delay_ms: 500,
            signatures: default_signatures(),
        }
    }
}

/// Base address of the host-visible RAM window captured from memory
/// writes (drive pages $04-$07).
pub const RAM_SHADOW_BASE: u16 = 0x0400;

/// Size of the captured RAM window.
pub const RAM_SHADOW_SIZE: usize = 0x0400;

/// Disk-swap list installed by the `XS` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapList {
    pub part: u8,
    pub dir: DirHandle,
    pub name: Vec<u8>,
}

/// Mutable drive-wide state threaded through the parser and the loaders.
pub struct DriveState {
    /// Bus device address, 4..=30.
    pub device_address: u8,
    /// Partition new commands operate on when they name partition 0.
    pub current_part: u8,
    /// Bus-behaviour flags.
    pub flags: IecFlags,
    /// CPU oscillator calibration byte (persisted, applied by the board).
    pub calibration: u8,
    /// Loader recognised from the memory-write CRC, awaiting its execute.
    pub detected_loader: Option<LoaderKind>,
    /// Loader selected by a matching execute; the event loop runs it when
    /// the host releases ATN.
    pub pending_loader: Option<LoaderKind>,
    /// Rolling CRC16 over memory-write command bytes.
    pub datacrc: u16,
    /// Media state, owned by the storage layer.
    pub disk_state: DiskState,
    /// Shadow of drive RAM $0400-$07FF, filled by memory writes. Loaders
    /// read host-uploaded tables from here.
    pub ram_shadow: Box<[u8; RAM_SHADOW_SIZE]>,
    /// Track/sector of the most recent sector read; the IFFL scanner
    /// starts its chain walk here.
    pub last_read: (u8, u8),
    /// Active swap list, if any.
    pub swap_list: Option<SwapList>,
}

impl Default for DriveState {
    fn default() -> Self {
        Self {
            device_address: 8,
            current_part: 0,
            flags: IecFlags::default(),
            calibration: 0,
            detected_loader: None,
            pending_loader: None,
            datacrc: 0xFFFF,
            disk_state: DiskState::Ok,
            ram_shadow: Box::new([0; RAM_SHADOW_SIZE]),
            last_read: (0, 0),
            swap_list: None,
        }
    }
}

impl DriveState {
    /// Slice of the RAM shadow starting at an absolute drive address.
    /// Returns `None` when the range falls outside the captured window.
    #[must_use]
    pub fn shadow(&self, address: u16, len: usize) -> Option<&[u8]> {
        let start = address.checked_sub(RAM_SHADOW_BASE)? as usize;
        let end = start.checked_add(len)?;
        self.ram_shadow.get(start..end)
    }

    /// Store a memory-write payload into the RAM shadow. Bytes falling
    /// outside the window are dropped.
    pub fn capture_shadow(&mut self, address: u16, payload: &[u8]) {
        for (i, &b) in payload.iter().enumerate() {
            let Some(offset) = (address as usize + i).checked_sub(RAM_SHADOW_BASE as usize)
            else {
                continue;
            };
            if let Some(cell) = self.ram_shadow.get_mut(offset) {
                *cell = b;
            }
        }
    }

    /// Install or clear the swap list, maintaining the autoswap flag.
    pub fn set_swap_list(&mut self, list: Option<SwapList>) {
        self.flags.set(IecFlags::AUTOSWAP_ACTIVE, list.is_some());
        self.swap_list = list;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let state = DriveState::default();
        assert_eq!(state.device_address, 8);
        assert_eq!(state.datacrc, 0xFFFF);
        assert_eq!(state.detected_loader, None);
        assert_eq!(state.disk_state, DiskState::Ok);
    }

    #[test]
    fn shadow_capture_and_read() {
        let mut state = DriveState::default();
        state.capture_shadow(0x0590, &[1, 2, 3]);
        assert_eq!(state.shadow(0x0590, 3), Some(&[1, 2, 3][..]));
        // Below the window: dropped
        state.capture_shadow(0x0200, &[9; 4]);
        assert_eq!(state.shadow(0x0400, 1), Some(&[0][..]));
        // Above the window: out of range
        assert_eq!(state.shadow(0x0800, 1), None);
    }

    #[test]
    fn shadow_capture_straddles_base() {
        let mut state = DriveState::default();
        state.capture_shadow(0x03FE, &[1, 2, 3, 4]);
        // Only the in-window tail lands
        assert_eq!(state.shadow(0x0400, 2), Some(&[3, 4][..]));
    }

    #[test]
    fn swap_list_tracks_flag() {
        let mut state = DriveState::default();
        assert!(!state.flags.contains(IecFlags::AUTOSWAP_ACTIVE));
        state.set_swap_list(Some(SwapList {
            part: 0,
            dir: 0,
            name: b"GAMES".to_vec(),
        }));
        assert!(state.flags.contains(IecFlags::AUTOSWAP_ACTIVE));
        state.set_swap_list(None);
        assert!(!state.flags.contains(IecFlags::AUTOSWAP_ACTIVE));
    }

    #[test]
    fn signature_table_is_unique() {
        let sigs = default_signatures();
        for (i, a) in sigs.iter().enumerate() {
            for b in &sigs[i + 1..] {
                assert!(
                    a.crc != b.crc,
                    "duplicate fingerprint {:04X}",
                    a.crc
                );
            }
        }
    }
}
