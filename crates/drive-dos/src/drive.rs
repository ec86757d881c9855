//! The drive aggregate: everything a command or a loader can touch.

use crate::buffers::{BufferPool, ERROR_BUFFER, SectorRef};
use crate::doscmd::COMMAND_BUFFER_SIZE;
use crate::eeprom::{Eeprom, read_configuration};
use crate::fs::Partition;
use crate::state::{DriveConfig, DriveState};
use crate::status::{DosError, ErrorCode, format_status};

/// Command bytes accumulated by the bus layer, CR-terminated.
pub struct CommandBuffer {
    pub data: [u8; COMMAND_BUFFER_SIZE + 2],
    pub len: usize,
}

impl CommandBuffer {
    fn new() -> Self {
        Self {
            data: [0; COMMAND_BUFFER_SIZE + 2],
            len: 0,
        }
    }

    /// The received bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

/// One emulated drive: configuration, mutable state, buffer pool,
/// partition table, EEPROM and the command buffer.
pub struct Drive {
    pub config: DriveConfig,
    pub state: DriveState,
    pub buffers: BufferPool,
    pub partitions: Vec<Partition>,
    pub eeprom: Box<dyn Eeprom>,
    pub command: CommandBuffer,
    current_status: DosError,
    restart: Option<Box<dyn FnMut()>>,
}

impl Drive {
    /// Assemble a drive. Settings persisted in the EEPROM are applied
    /// over the defaults when the stored record is intact.
    #[must_use]
    pub fn new(config: DriveConfig, partitions: Vec<Partition>, eeprom: Box<dyn Eeprom>) -> Self {
        assert!(!partitions.is_empty(), "at least one partition required");
        let mut state = DriveState::default();
        read_configuration(eeprom.as_ref(), &mut state);
        let mut drive = Self {
            config,
            state,
            buffers: BufferPool::new(),
            partitions,
            eeprom,
            command: CommandBuffer::new(),
            current_status: DosError::new(ErrorCode::Ok),
            restart: None,
        };
        drive.set_error(ErrorCode::Ok);
        drive
    }

    /// Install the routine the hard-reset command jumps to.
    pub fn set_restart_hook(&mut self, hook: Box<dyn FnMut()>) {
        self.restart = Some(hook);
    }

    /// Invoke the hard-reset hook, if any.
    pub(crate) fn trigger_restart(&mut self) {
        if let Some(hook) = self.restart.as_mut() {
            hook();
        }
    }

    /// Copy a received command into the buffer. Hosts that send more than
    /// the capacity get a truncated command, which the parser reports as
    /// too long.
    pub fn queue_command(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(COMMAND_BUFFER_SIZE);
        self.command.data[..len].copy_from_slice(&bytes[..len]);
        self.command.len = len;
    }

    // --- Status channel ---

    /// Set the status with zero track/sector.
    pub fn set_error(&mut self, code: ErrorCode) {
        self.set_error_ts(code, 0, 0);
    }

    /// Set the status with auxiliary values and render the line into the
    /// error buffer.
    pub fn set_error_ts(&mut self, code: ErrorCode, track: u8, sector: u8) {
        self.current_status = DosError::with_ts(code, track, sector);
        let line = format_status(code, track, sector);
        let buf = self.buffers.buf_mut(ERROR_BUFFER);
        buf.data[..line.len()].copy_from_slice(&line);
        buf.position = 0;
        buf.lastused = (line.len() - 1) as u8;
    }

    /// Set the status from a parser error.
    pub fn set_dos_error(&mut self, err: DosError) {
        self.set_error_ts(err.code, err.track, err.sector);
    }

    /// Current status tuple (for tests and the event loop).
    #[must_use]
    pub fn current_status(&self) -> DosError {
        self.current_status
    }

    /// Read channel 15: drains the error buffer and resets the status
    /// to OK.
    pub fn read_error_channel(&mut self) -> Vec<u8> {
        let buf = self.buffers.buf(ERROR_BUFFER);
        let out = if buf.window_valid() && buf.position <= buf.lastused {
            buf.data[usize::from(buf.position)..=usize::from(buf.lastused)].to_vec()
        } else {
            Vec::new()
        };
        self.set_error(ErrorCode::Ok);
        out
    }

    // --- Buffers ---

    /// What `OPEN "#"` does: bind a pool buffer to a user channel.
    pub fn open_buffer_channel(&mut self, channel: u8) -> Result<usize, DosError> {
        let idx = self
            .buffers
            .allocate_user(channel)
            .ok_or(DosError::new(ErrorCode::NoChannel))?;
        self.buffers.buf_mut(idx).secondary = channel;
        Ok(idx)
    }

    /// Free one buffer, flushing its write-back sector first.
    pub fn free_buffer(&mut self, idx: usize) -> Result<(), DosError> {
        if let Some(SectorRef {
            part,
            track,
            sector,
        }) = self.buffers.buf_mut(idx).writeback.take()
        {
            self.write_sector(idx, part, track, sector)?;
        }
        self.buffers.release(idx);
        Ok(())
    }

    /// Free buffers in bulk; with `keep_system` the loader-owned ones
    /// survive.
    pub fn free_all_buffers(&mut self, keep_system: bool) -> Result<(), DosError> {
        for idx in self.buffers.allocated_indices(keep_system) {
            self.free_buffer(idx)?;
        }
        Ok(())
    }

    // --- Sector I/O through the partition table ---

    fn check_part(&self, part: u8) -> Result<usize, DosError> {
        if (part as usize) < self.partitions.len() {
            Ok(part as usize)
        } else {
            Err(DosError::with_ts(
                ErrorCode::PartitionIllegal,
                part.wrapping_add(1),
                0,
            ))
        }
    }

    /// Read a sector into a pool buffer and remember it as the most
    /// recently read one.
    pub fn read_sector(
        &mut self,
        idx: usize,
        part: u8,
        track: u8,
        sector: u8,
    ) -> Result<(), DosError> {
        let p = self.check_part(part)?;
        let buf = self.buffers.buf_mut(idx);
        self.partitions[p]
            .fs
            .read_sector(track, sector, &mut buf.data)?;
        self.state.last_read = (track, sector);
        Ok(())
    }

    /// Write a pool buffer out to a sector.
    pub fn write_sector(
        &mut self,
        idx: usize,
        part: u8,
        track: u8,
        sector: u8,
    ) -> Result<(), DosError> {
        let p = self.check_part(part)?;
        let buf = self.buffers.buf(idx);
        self.partitions[p].fs.write_sector(track, sector, &buf.data)?;
        Ok(())
    }
}
