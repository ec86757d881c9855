//! In-memory disk image with classic Commodore geometry.
//!
//! 35 tracks with variable sectors per track:
//!   Tracks  1-17: 21 sectors (zone 0)
//!   Tracks 18-24: 19 sectors (zone 1)
//!   Tracks 25-30: 18 sectors (zone 2)
//!   Tracks 31-35: 17 sectors (zone 3)
//!
//! File data lives in sector chains: bytes 0..1 of each sector hold the
//! next track/sector, track 0 terminates the chain and the second byte
//! then holds the index of the last valid byte. The catalog (names,
//! kinds, subdirectories) is kept beside the sector store, so the
//! command layer and the loaders both see the same chains without a
//! directory-sector format getting in the way.

use crate::fs::{DirEntry, DirHandle, EntryKind, FileOps, FsError, MatchFlags, name_matches};

/// Bytes per sector.
pub const SECTOR_SIZE: usize = 256;

/// Payload bytes per chained sector (after the 2-byte link).
pub const CHAIN_PAYLOAD: usize = SECTOR_SIZE - 2;

/// Sectors per track, indexed by track number (1-based, index 0 unused).
const SECTORS_PER_TRACK: [u8; 36] = [
    0, // track 0 doesn't exist
    21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, // 1-17
    19, 19, 19, 19, 19, 19, 19, // 18-24
    18, 18, 18, 18, 18, 18, // 25-30
    17, 17, 17, 17, 17, // 31-35
];

/// Byte offset of the first sector of each track (1-indexed).
const TRACK_OFFSETS: [usize; 36] = {
    let mut offsets = [0usize; 36];
    let mut track = 1;
    let mut offset = 0;
    while track < 36 {
        offsets[track] = offset;
        offset += SECTORS_PER_TRACK[track] as usize * SECTOR_SIZE;
        track += 1;
    }
    offsets
};

/// Total sectors on the medium.
const TOTAL_SECTORS: usize = 683;

/// Root directory handle.
pub const ROOT_DIR: DirHandle = 0;

/// Sectors on a given track; 0 for invalid tracks.
#[must_use]
pub fn sectors_per_track(track: u8) -> u8 {
    if (1..=35).contains(&track) {
        SECTORS_PER_TRACK[track as usize]
    } else {
        0
    }
}

/// Byte offset of a sector within the image, `None` when out of range.
fn sector_offset(track: u8, sector: u8) -> Option<usize> {
    if !(1..=35).contains(&track) {
        return None;
    }
    if sector >= SECTORS_PER_TRACK[track as usize] {
        return None;
    }
    Some(TRACK_OFFSETS[track as usize] + sector as usize * SECTOR_SIZE)
}

struct CatEntry {
    /// Directory handle when `kind` is a directory.
    id: DirHandle,
    parent: DirHandle,
    name: Vec<u8>,
    kind: EntryKind,
    hidden: bool,
    /// First sector of the chain for files.
    start: (u8, u8),
}

impl CatEntry {
    fn to_dir_entry(&self) -> DirEntry {
        DirEntry {
            name: self.name.clone(),
            kind: self.kind,
            hidden: self.hidden,
            id: match self.kind {
                EntryKind::Directory => self.id,
                EntryKind::File => u32::from(self.start.0) << 8 | u32::from(self.start.1),
            },
        }
    }
}

/// Mounted in-memory disk image.
pub struct ImageFs {
    data: Vec<u8>,
    used: Vec<bool>,
    catalog: Vec<CatEntry>,
    next_dir_id: DirHandle,
    iter: Option<(DirHandle, usize)>,
}

impl ImageFs {
    /// Blank image, empty root directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: vec![0; TOTAL_SECTORS * SECTOR_SIZE],
            used: vec![false; TOTAL_SECTORS],
            catalog: Vec::new(),
            next_dir_id: ROOT_DIR + 1,
            iter: None,
        }
    }

    fn dir_exists(&self, dir: DirHandle) -> bool {
        dir == ROOT_DIR
            || self
                .catalog
                .iter()
                .any(|e| e.kind == EntryKind::Directory && e.id == dir)
    }

    fn find_entry(&self, dir: DirHandle, name: &[u8]) -> Option<usize> {
        self.catalog
            .iter()
            .position(|e| e.parent == dir && e.name == name)
    }

    /// Absolute index of the next free sector, allocated track-first.
    fn allocate_sector(&mut self) -> Option<(u8, u8)> {
        for track in 1..=35u8 {
            for sector in 0..SECTORS_PER_TRACK[track as usize] {
                let index = (TRACK_OFFSETS[track as usize] / SECTOR_SIZE) + sector as usize;
                if !self.used[index] {
                    self.used[index] = true;
                    return Some((track, sector));
                }
            }
        }
        None
    }

    fn free_chain(&mut self, mut track: u8, mut sector: u8) {
        while track != 0 {
            let Some(offset) = sector_offset(track, sector) else {
                return;
            };
            self.used[offset / SECTOR_SIZE] = false;
            track = self.data[offset];
            sector = self.data[offset + 1];
        }
    }

    /// Create a file from raw content, building its sector chain.
    /// Returns the first track/sector.
    pub fn add_file(
        &mut self,
        dir: DirHandle,
        name: &[u8],
        content: &[u8],
    ) -> Result<(u8, u8), FsError> {
        if self.find_entry(dir, name).is_some() {
            return Err(FsError::Exists);
        }

        let chunks: Vec<&[u8]> = if content.is_empty() {
            vec![&[][..]]
        } else {
            content.chunks(CHAIN_PAYLOAD).collect()
        };

        let mut sectors = Vec::with_capacity(chunks.len());
        for _ in &chunks {
            sectors.push(self.allocate_sector().ok_or(FsError::BadSector {
                track: 0,
                sector: 0,
            })?);
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let (track, sector) = sectors[i];
            let offset = sector_offset(track, sector).expect("allocated sector is valid");
            let link = if i + 1 < sectors.len() {
                sectors[i + 1]
            } else {
                // Chain end: second byte is the index of the last valid byte
                (0, (chunk.len() + 1) as u8)
            };
            self.data[offset] = link.0;
            self.data[offset + 1] = link.1;
            self.data[offset + 2..offset + 2 + chunk.len()].copy_from_slice(chunk);
        }

        self.catalog.push(CatEntry {
            id: 0,
            parent: dir,
            name: name.to_vec(),
            kind: EntryKind::File,
            hidden: false,
            start: sectors[0],
        });
        Ok(sectors[0])
    }

    /// Create a subdirectory and return its handle.
    pub fn add_dir(&mut self, dir: DirHandle, name: &[u8]) -> Result<DirHandle, FsError> {
        if self.find_entry(dir, name).is_some() {
            return Err(FsError::Exists);
        }
        let id = self.next_dir_id;
        self.next_dir_id += 1;
        self.catalog.push(CatEntry {
            id,
            parent: dir,
            name: name.to_vec(),
            kind: EntryKind::Directory,
            hidden: false,
            start: (0, 0),
        });
        Ok(id)
    }

    /// Collect a file's content by walking its chain.
    #[must_use]
    pub fn read_chain(&self, mut track: u8, mut sector: u8) -> Vec<u8> {
        let mut out = Vec::new();
        while track != 0 {
            let Some(offset) = sector_offset(track, sector) else {
                break;
            };
            let next_track = self.data[offset];
            let next_sector = self.data[offset + 1];
            if next_track == 0 {
                let last = next_sector as usize;
                if last >= 2 {
                    out.extend_from_slice(&self.data[offset + 2..=offset + last]);
                }
                break;
            }
            out.extend_from_slice(&self.data[offset + 2..offset + SECTOR_SIZE]);
            track = next_track;
            sector = next_sector;
        }
        out
    }
}

impl Default for ImageFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileOps for ImageFs {
    fn read_sector(&mut self, track: u8, sector: u8, out: &mut [u8; 256]) -> Result<(), FsError> {
        let offset = sector_offset(track, sector).ok_or(FsError::BadSector { track, sector })?;
        out.copy_from_slice(&self.data[offset..offset + SECTOR_SIZE]);
        Ok(())
    }

    fn write_sector(&mut self, track: u8, sector: u8, data: &[u8; 256]) -> Result<(), FsError> {
        let offset = sector_offset(track, sector).ok_or(FsError::BadSector { track, sector })?;
        self.data[offset..offset + SECTOR_SIZE].copy_from_slice(data);
        Ok(())
    }

    fn open_dir(&mut self, dir: DirHandle) -> Result<(), FsError> {
        if !self.dir_exists(dir) {
            return Err(FsError::NotFound);
        }
        self.iter = Some((dir, 0));
        Ok(())
    }

    fn next_match(
        &mut self,
        pattern: &[u8],
        flags: MatchFlags,
    ) -> Result<Option<DirEntry>, FsError> {
        let Some((dir, mut pos)) = self.iter else {
            return Err(FsError::NotFound);
        };
        while pos < self.catalog.len() {
            let entry = &self.catalog[pos];
            pos += 1;
            if entry.parent != dir {
                continue;
            }
            if entry.hidden && !flags.contains(MatchFlags::HIDDEN) {
                continue;
            }
            if name_matches(pattern, &entry.name) {
                let found = entry.to_dir_entry();
                self.iter = Some((dir, pos));
                return Ok(Some(found));
            }
        }
        self.iter = Some((dir, pos));
        Ok(None)
    }

    fn first_match(
        &mut self,
        dir: DirHandle,
        name: &[u8],
        flags: MatchFlags,
    ) -> Result<Option<DirEntry>, FsError> {
        if !self.dir_exists(dir) {
            return Err(FsError::NotFound);
        }
        Ok(self
            .catalog
            .iter()
            .filter(|e| e.parent == dir)
            .filter(|e| !e.hidden || flags.contains(MatchFlags::HIDDEN))
            .find(|e| name_matches(name, &e.name))
            .map(CatEntry::to_dir_entry))
    }

    fn file_delete(&mut self, dir: DirHandle, name: &[u8]) -> Result<u8, FsError> {
        let idx = self.find_entry(dir, name).ok_or(FsError::NotFound)?;
        match self.catalog[idx].kind {
            EntryKind::File => {
                let (track, sector) = self.catalog[idx].start;
                self.free_chain(track, sector);
            }
            EntryKind::Directory => {
                let id = self.catalog[idx].id;
                if self.catalog.iter().any(|e| e.parent == id) {
                    return Err(FsError::NotEmpty);
                }
            }
        }
        self.catalog.remove(idx);
        // Keep a live directory iteration in step with the shifted catalog
        if let Some((_, pos)) = self.iter.as_mut() {
            if *pos > idx {
                *pos -= 1;
            }
        }
        Ok(1)
    }

    fn mkdir(&mut self, dir: DirHandle, name: &[u8]) -> Result<(), FsError> {
        self.add_dir(dir, name).map(|_| ())
    }

    fn chdir(&mut self, dir: DirHandle, name: &[u8]) -> Result<DirHandle, FsError> {
        if name == b"_" {
            return self.parent_dir(dir);
        }
        let idx = self.find_entry(dir, name).ok_or(FsError::NotFound)?;
        match self.catalog[idx].kind {
            EntryKind::Directory => Ok(self.catalog[idx].id),
            // A file name here means "mount this as an image"; nested
            // images are not supported on this medium.
            EntryKind::File => Err(FsError::InvalidImage),
        }
    }

    fn parent_dir(&mut self, dir: DirHandle) -> Result<DirHandle, FsError> {
        if dir == ROOT_DIR {
            return Ok(ROOT_DIR);
        }
        self.catalog
            .iter()
            .find(|e| e.kind == EntryKind::Directory && e.id == dir)
            .map(|e| e.parent)
            .ok_or(FsError::NotFound)
    }

    fn rename(&mut self, dir: DirHandle, old: &[u8], new: &[u8]) -> Result<(), FsError> {
        if self.find_entry(dir, new).is_some() {
            return Err(FsError::Exists);
        }
        let idx = self.find_entry(dir, old).ok_or(FsError::NotFound)?;
        self.catalog[idx].name = new.to_vec();
        Ok(())
    }

    fn root_dir(&self) -> DirHandle {
        ROOT_DIR
    }
}
