//! Textual path resolution.
//!
//! Paths look like `[part]:[comp/]*name`. The optional partition number
//! sits before the colon (`0` or absent = current partition), components
//! are separated by `/`, `_` steps to the parent directory, and the
//! residual name after the last separator belongs to the caller — it may
//! be a file name, a pattern, or empty when the command allows that.

use crate::fs::{DirHandle, EntryKind, MatchFlags, Partition};
use crate::status::{DosError, ErrorCode};

/// A resolved directory position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosPath {
    pub part: u8,
    pub dir: DirHandle,
}

/// Parse the digits of a partition prefix. Empty or `0` selects the
/// current partition; anything but digits and spaces is a syntax error.
fn parse_partition_prefix(prefix: &[u8], current: u8) -> Option<u8> {
    let mut value: u8 = 0;
    let mut any = false;
    for &b in prefix {
        match b {
            b' ' => {}
            b'0'..=b'9' => {
                value = value.wrapping_mul(10).wrapping_add(b - b'0');
                any = true;
            }
            _ => return None,
        }
    }
    if !any || value == 0 {
        Some(current)
    } else {
        Some(value - 1)
    }
}

/// Resolve a path string against the partition table.
///
/// Returns the resolved directory plus the residual name slice. With
/// `allow_empty` false an empty residual fails with `SYNTAX ERROR`
/// (missing name).
pub fn parse_path<'a>(
    partitions: &mut [Partition],
    current_part: u8,
    input: &'a [u8],
    allow_empty: bool,
) -> Result<(DosPath, &'a [u8]), DosError> {
    let (part, rest) = match input.iter().position(|&b| b == b':') {
        Some(colon) => {
            let part = parse_partition_prefix(&input[..colon], current_part)
                .ok_or(DosError::new(ErrorCode::SyntaxUnknown))?;
            (part, &input[colon + 1..])
        }
        None => (current_part, input),
    };

    if part as usize >= partitions.len() {
        return Err(DosError::with_ts(
            ErrorCode::PartitionIllegal,
            part.wrapping_add(1),
            0,
        ));
    }

    let partition = &mut partitions[part as usize];
    let mut dir = partition.current_dir;

    let mut name = rest;
    while let Some(slash) = name.iter().position(|&b| b == b'/') {
        let component = &name[..slash];
        name = &name[slash + 1..];
        if component.is_empty() {
            continue;
        }
        if component == b"_" {
            dir = partition.fs.parent_dir(dir)?;
            continue;
        }
        let entry = partition
            .fs
            .first_match(dir, component, MatchFlags::HIDDEN)?
            .ok_or(DosError::new(ErrorCode::FileNotFound))?;
        if entry.kind != EntryKind::Directory {
            return Err(DosError::new(ErrorCode::FileNotFound));
        }
        dir = entry.id;
    }

    if name.is_empty() && !allow_empty {
        return Err(DosError::new(ErrorCode::SyntaxNoName));
    }

    Ok((DosPath { part, dir }, name))
}
