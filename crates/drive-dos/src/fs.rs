//! Filesystem façade.
//!
//! The command parser and the loaders never touch storage directly; every
//! partition carries one implementation of [`FileOps`] and all sector and
//! directory traffic goes through it. Directory positions are opaque
//! [`DirHandle`] values owned by the implementation.

use bitflags::bitflags;
use thiserror::Error;

use crate::status::{DosError, ErrorCode};

/// Opaque reference to a directory inside one filesystem.
pub type DirHandle = u32;

/// Failures surfaced by a filesystem implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("entry not found")]
    NotFound,
    #[error("entry already exists")]
    Exists,
    #[error("not a directory")]
    NotDirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("not a mountable image")]
    InvalidImage,
    #[error("bad sector {track}/{sector}")]
    BadSector { track: u8, sector: u8 },
}

impl From<FsError> for DosError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotFound | FsError::NotDirectory => DosError::new(ErrorCode::FileNotFound),
            FsError::Exists | FsError::NotEmpty => DosError::new(ErrorCode::FileExists),
            FsError::InvalidImage => DosError::new(ErrorCode::ImageInvalid),
            FsError::BadSector { track, sector } => {
                DosError::with_ts(ErrorCode::ReadNoSync, track, sector)
            }
        }
    }
}

bitflags! {
    /// Directory-match options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MatchFlags: u8 {
        /// Include hidden entries.
        const HIDDEN = 0b0000_0001;
    }
}

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One directory entry as reported by the façade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub kind: EntryKind,
    pub hidden: bool,
    /// Directory handle for directories; first track/sector packed as
    /// `track << 8 | sector` for files.
    pub id: DirHandle,
}

impl DirEntry {
    /// First sector of a file entry.
    #[must_use]
    pub fn start(&self) -> (u8, u8) {
        ((self.id >> 8) as u8, self.id as u8)
    }
}

/// Operations a mounted medium must provide. One directory iteration is
/// live at a time, mirroring the single global match handle of the
/// classic firmware.
pub trait FileOps {
    /// Read a 256-byte sector.
    fn read_sector(&mut self, track: u8, sector: u8, out: &mut [u8; 256]) -> Result<(), FsError>;

    /// Write a 256-byte sector.
    fn write_sector(&mut self, track: u8, sector: u8, data: &[u8; 256]) -> Result<(), FsError>;

    /// Start iterating a directory.
    fn open_dir(&mut self, dir: DirHandle) -> Result<(), FsError>;

    /// Next entry of the open iteration matching `pattern`.
    fn next_match(
        &mut self,
        pattern: &[u8],
        flags: MatchFlags,
    ) -> Result<Option<DirEntry>, FsError>;

    /// Single-entry lookup: `Ok(None)` when nothing matches.
    fn first_match(
        &mut self,
        dir: DirHandle,
        name: &[u8],
        flags: MatchFlags,
    ) -> Result<Option<DirEntry>, FsError>;

    /// Delete one file; returns the number of directory entries removed.
    fn file_delete(&mut self, dir: DirHandle, name: &[u8]) -> Result<u8, FsError>;

    /// Create a subdirectory.
    fn mkdir(&mut self, dir: DirHandle, name: &[u8]) -> Result<(), FsError>;

    /// Change directory: handles the `_` parent shorthand and named
    /// subdirectories; names that resolve to files fail with
    /// `InvalidImage` unless the medium can mount them.
    fn chdir(&mut self, dir: DirHandle, name: &[u8]) -> Result<DirHandle, FsError>;

    /// Parent of a directory; the root is its own parent.
    fn parent_dir(&mut self, dir: DirHandle) -> Result<DirHandle, FsError>;

    /// Rename an entry within one directory.
    fn rename(&mut self, dir: DirHandle, old: &[u8], new: &[u8]) -> Result<(), FsError>;

    /// Root directory handle.
    fn root_dir(&self) -> DirHandle;
}

/// What a partition is backed by; some loaders only run on mounted
/// images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Medium {
    /// Raw native filesystem (SD card FAT).
    Native,
    /// Mounted disk image with track/sector geometry.
    Image,
}

/// One mounted storage unit.
pub struct Partition {
    pub fs: Box<dyn FileOps>,
    pub medium: Medium,
    pub current_dir: DirHandle,
}

impl Partition {
    /// Wrap a filesystem, starting at its root.
    #[must_use]
    pub fn new(fs: Box<dyn FileOps>, medium: Medium) -> Self {
        let current_dir = fs.root_dir();
        Self {
            fs,
            medium,
            current_dir,
        }
    }
}

/// Wildcard match in the drive dialect: `?` matches any single byte, `*`
/// matches everything from its position on.
#[must_use]
pub fn name_matches(pattern: &[u8], name: &[u8]) -> bool {
    let mut p = 0;
    for &n in name {
        match pattern.get(p) {
            Some(&b'*') => return true,
            Some(&b'?') => p += 1,
            Some(&c) if c == n => p += 1,
            _ => return false,
        }
    }
    matches!(pattern.get(p), None | Some(&b'*'))
}
