//! Sector buffer pool.
//!
//! A fixed array of 256-byte buffers backs all channel I/O: block commands,
//! loader page buffers, and the status line. Slot `BUFFER_COUNT` is
//! reserved for the error buffer, pinned to channel 15 and never freed.
//! User buffers bind to one channel (0..14) each; system buffers carry a
//! sentinel channel and survive `free_all(keep_system = true)` so that
//! loaders keep their pages across command cycles.

/// Number of general-purpose data buffers.
pub const BUFFER_COUNT: usize = 8;

/// Pool slot reserved for the error buffer.
pub const ERROR_BUFFER: usize = BUFFER_COUNT;

/// Channel number of the command/status channel.
pub const ERROR_CHANNEL: u8 = 15;

/// Channel sentinel marking a buffer as system-owned.
pub const SYSTEM_CHANNEL: u8 = 0xFF;

/// Sector a dirty buffer must be written back to when it is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorRef {
    pub part: u8,
    pub track: u8,
    pub sector: u8,
}

/// One 256-byte buffer plus its channel bookkeeping.
pub struct Buffer {
    /// Sector-sized data area.
    pub data: [u8; 256],
    /// Slot is in use.
    pub allocated: bool,
    /// Survives `free_all(keep_system = true)`.
    pub system: bool,
    /// Owning channel (0..14 user, 15 error, `SYSTEM_CHANNEL` system).
    pub channel: u8,
    /// Next byte to read or write.
    pub position: u8,
    /// Index of the final valid byte (usable length = lastused + 1).
    pub lastused: u8,
    /// Secondary address recorded at open time.
    pub secondary: u8,
    /// Set when the buffer holds unwritten sector data; freeing flushes it.
    pub writeback: Option<SectorRef>,
}

impl Buffer {
    fn empty() -> Self {
        Self {
            data: [0; 256],
            allocated: false,
            system: false,
            channel: 0,
            position: 0,
            lastused: 0,
            secondary: 0,
            writeback: None,
        }
    }

    /// Window the host can read: `position` must never pass `lastused + 1`.
    #[must_use]
    pub fn window_valid(&self) -> bool {
        u16::from(self.position) <= u16::from(self.lastused) + 1
    }
}

/// Fixed pool of `BUFFER_COUNT + 1` buffers; the extra slot is the error
/// buffer.
pub struct BufferPool {
    slots: Vec<Buffer>,
}

impl BufferPool {
    /// Create a pool with the error buffer already allocated.
    #[must_use]
    pub fn new() -> Self {
        let mut slots: Vec<Buffer> = (0..=BUFFER_COUNT).map(|_| Buffer::empty()).collect();
        let err = &mut slots[ERROR_BUFFER];
        err.allocated = true;
        err.system = true;
        err.channel = ERROR_CHANNEL;
        Self { slots }
    }

    /// Allocate a buffer for a user channel (0..14). First fit; `None`
    /// when the pool is exhausted (the caller reports NO CHANNEL).
    pub fn allocate_user(&mut self, channel: u8) -> Option<usize> {
        debug_assert!(channel < ERROR_CHANNEL);
        self.allocate(channel, false)
    }

    /// Allocate a system buffer (loader pages, scan scratch space).
    pub fn allocate_system(&mut self) -> Option<usize> {
        self.allocate(SYSTEM_CHANNEL, true)
    }

    fn allocate(&mut self, channel: u8, system: bool) -> Option<usize> {
        let idx = self.slots[..BUFFER_COUNT]
            .iter()
            .position(|b| !b.allocated)?;
        let buf = &mut self.slots[idx];
        *buf = Buffer::empty();
        buf.allocated = true;
        buf.system = system;
        buf.channel = channel;
        buf.lastused = 255;
        Some(idx)
    }

    /// Find the live buffer bound to a channel. Channel 15 always resolves
    /// to the error buffer.
    #[must_use]
    pub fn find_by_channel(&self, channel: u8) -> Option<usize> {
        if channel == ERROR_CHANNEL {
            return Some(ERROR_BUFFER);
        }
        self.slots[..BUFFER_COUNT]
            .iter()
            .position(|b| b.allocated && b.channel == channel)
    }

    /// Mark a slot free. The caller is responsible for flushing the
    /// write-back target first (see `Drive::free_buffer`). The error
    /// buffer cannot be released.
    pub fn release(&mut self, idx: usize) {
        if idx == ERROR_BUFFER {
            return;
        }
        self.slots[idx].allocated = false;
        self.slots[idx].writeback = None;
    }

    /// Slot accessor.
    #[must_use]
    pub fn buf(&self, idx: usize) -> &Buffer {
        &self.slots[idx]
    }

    /// Mutable slot accessor.
    pub fn buf_mut(&mut self, idx: usize) -> &mut Buffer {
        &mut self.slots[idx]
    }

    /// Indices of allocated data buffers, optionally skipping system ones.
    #[must_use]
    pub fn allocated_indices(&self, skip_system: bool) -> Vec<usize> {
        self.slots[..BUFFER_COUNT]
            .iter()
            .enumerate()
            .filter(|(_, b)| b.allocated && !(skip_system && b.system))
            .map(|(i, _)| i)
            .collect()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
