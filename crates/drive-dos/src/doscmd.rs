//! Command-channel parser.
//!
//! Interprets the byte string the host wrote to channel 15: block I/O,
//! memory peek/poke, partition switching, directory management, rename,
//! scratch, utility commands and EEPROM access. Memory writes feed the
//! rolling CRC that recognises uploaded fast-loader code; a matching
//! execute arms the loader for the event loop.
//!
//! Dialect quirks are kept on purpose: `U1`/`U2` are handled by rewriting
//! the command header in place, `MD`/`CD`/`RD` are dispatched before the
//! single-letter commands because their first letters collide, and the
//! cursor-right code counts as parameter whitespace.

use iec_bus::IecPort;
use log::debug;

use crate::buffers::{ERROR_BUFFER, ERROR_CHANNEL};
use crate::crc::crc16_update;
use crate::drive::Drive;
use crate::eeprom::{CONFIG_RECORD_LEN, write_configuration};
use crate::fs::{EntryKind, MatchFlags};
use crate::path::parse_path;
use crate::state::{DiskState, IecFlags, LoaderKind, SwapList};
use crate::status::{DosError, ErrorCode};

/// Command buffer capacity; a command of exactly this length was
/// truncated by the bus layer and is reported as too long.
pub const COMMAND_BUFFER_SIZE: usize = 120;

/// Screen code the host editor inserts for cursor-right; counts as
/// whitespace between block parameters.
const CURSOR_RIGHT: u8 = 0x1D;

/// Parse and execute the command sitting in the drive's command buffer.
pub fn parse_doscommand(drive: &mut Drive, port: &mut dyn IecPort) {
    drive.set_error(ErrorCode::Ok);

    if drive.command.len == COMMAND_BUFFER_SIZE {
        drive.set_error(ErrorCode::SyntaxTooLong);
        return;
    }

    // Trim trailing carriage returns
    let mut len = drive.command.len;
    while len > 0 && drive.command.data[len - 1] == 0x0D {
        len -= 1;
    }
    drive.command.len = len;

    if len == 0 {
        drive.set_error(ErrorCode::SyntaxUnable);
        return;
    }

    if drive.state.detected_loader == Some(LoaderKind::Turbodisk) {
        // The final Turbodisk memory write carries a file name; don't
        // clobber the bytes after it
        drive.command.data[len] = 0;
    } else {
        // Clear the remainder, simplifies substring checks
        drive.command.data[len..].fill(0);
    }

    if let Err(err) = dispatch(drive, port) {
        drive.set_dos_error(err);
    }
}

fn dispatch(drive: &mut Drive, port: &mut dyn IecPort) -> Result<(), DosError> {
    // MD/CD/RD clash with other first letters, so they're checked first
    if drive.command.data[1] == b'D' {
        return parse_dircommand(drive);
    }

    match drive.command.data[0] {
        b'B' => parse_block(drive),
        b'C' => parse_change(drive),
        b'E' => parse_eeprom(drive),
        b'I' => parse_initialize(drive),
        b'M' => parse_memory(drive),
        b'N' => {
            // Format is a timed no-op: one speed-test program divides by
            // the elapsed time and hangs on zero
            port.delay_ms(drive.config.format_delay_ms);
            Ok(())
        }
        b'R' => parse_rename(drive),
        b'S' => parse_scratch(drive),
        b'U' => parse_user(drive, port),
        b'X' => parse_xcommand(drive),
        _ => Err(ErrorCode::SyntaxUnknown.into()),
    }
}

/* ------------------------------------------------------------------ */
/*  Parsing helpers                                                   */
/* ------------------------------------------------------------------ */

/// Parse a decimal number, skipping leading spaces. Advances `pos` past
/// the digits; overflow wraps like the original 8-bit accumulator.
fn parse_number(data: &[u8], pos: &mut usize) -> u8 {
    while data.get(*pos) == Some(&b' ') {
        *pos += 1;
    }
    let mut value: u8 = 0;
    while let Some(&b) = data.get(*pos) {
        if !b.is_ascii_digit() {
            break;
        }
        value = value.wrapping_mul(10).wrapping_add(b - b'0');
        *pos += 1;
    }
    value
}

/// Parse up to four decimal block parameters after the colon (or after
/// the command header when no colon is present). `None` means the
/// command is too short to carry parameters; the caller stays silent
/// in that case.
fn parse_blockparam(drive: &Drive) -> Option<[u8; 4]> {
    let data = drive.command.bytes();
    let mut pos = match data.iter().position(|&b| b == b':') {
        Some(i) => i + 1,
        None => {
            if data.len() < 3 {
                return None;
            }
            3
        }
    };

    let mut params = [0u8; 4];
    let mut count = 0;
    while pos < data.len() && count < 4 {
        // Skip spaces, cursor-rights and commas
        while matches!(data.get(pos), Some(&b) if b == b' ' || b == CURSOR_RIGHT || b == b',') {
            pos += 1;
        }
        if pos >= data.len() {
            break;
        }
        params[count] = parse_number(data, &mut pos);
        count += 1;
    }
    Some(params)
}

/// Look up the live buffer of a user channel.
fn find_user_buffer(drive: &Drive, channel: u8) -> Result<usize, DosError> {
    if channel >= ERROR_CHANNEL {
        return Err(ErrorCode::NoChannel.into());
    }
    drive
        .buffers
        .find_by_channel(channel)
        .ok_or(ErrorCode::NoChannel.into())
}

/* ------------------------------------------------------------------ */
/*  B commands                                                        */
/* ------------------------------------------------------------------ */

fn parse_block(drive: &mut Drive) -> Result<(), DosError> {
    let data = drive.command.bytes();
    let dash = data
        .iter()
        .position(|&b| b == b'-')
        .ok_or(ErrorCode::SyntaxUnable)?;
    let sub = drive.command.data[dash + 1];

    let Some(params) = parse_blockparam(drive) else {
        return Ok(());
    };

    // "B-R" reads with the length-byte convention; the "U1" alias
    // arrives rewritten with '-' in the first byte and transfers the
    // whole sector
    let buffer_mode = drive.command.data[0] == b'B';

    match sub {
        b'R' | b'W' => {
            let idx = find_user_buffer(drive, params[0])?;
            let part = if params[1] == 0 {
                drive.state.current_part
            } else {
                params[1]
            };

            if sub == b'R' {
                drive.read_sector(idx, part, params[2], params[3])?;
                let buf = drive.buffers.buf_mut(idx);
                if buffer_mode {
                    buf.position = 1;
                    buf.lastused = buf.data[0];
                } else {
                    buf.position = 0;
                    buf.lastused = 255;
                }
            } else {
                if buffer_mode {
                    // TODO: verify on real hardware - stores position-1
                    // as the length byte before writing
                    let buf = drive.buffers.buf_mut(idx);
                    buf.data[0] = buf.position.wrapping_sub(1);
                }
                drive.write_sector(idx, part, params[2], params[3])?;
            }
            Ok(())
        }

        b'P' => {
            let idx = find_user_buffer(drive, params[0])?;
            drive.buffers.buf_mut(idx).position = params[1];
            Ok(())
        }

        _ => Err(ErrorCode::SyntaxUnable.into()),
    }
}

/* ------------------------------------------------------------------ */
/*  C commands                                                        */
/* ------------------------------------------------------------------ */

fn parse_change(drive: &mut Drive) -> Result<(), DosError> {
    match drive.command.data[1] {
        b'P' => {
            let mut pos = 2;
            let raw = parse_number(drive.command.bytes(), &mut pos);
            let part = if raw == 0 {
                drive.state.current_part
            } else {
                raw - 1
            };
            if part as usize >= drive.partitions.len() {
                return Err(DosError::with_ts(
                    ErrorCode::PartitionIllegal,
                    part.wrapping_add(1),
                    0,
                ));
            }
            drive.state.current_part = part;
            if drive.state.flags.contains(IecFlags::AUTOSWAP_ACTIVE) {
                drive.state.set_swap_list(None);
            }
            Ok(())
        }

        0xD0 => {
            // Shift-P: binary partition number, 1-based
            let value = drive.command.data[2];
            if value as usize > drive.partitions.len() {
                return Err(DosError::with_ts(ErrorCode::PartitionIllegal, value, 0));
            }
            if value != 0 {
                drive.state.current_part = value - 1;
                if drive.state.flags.contains(IecFlags::AUTOSWAP_ACTIVE) {
                    drive.state.set_swap_list(None);
                }
            }
            Ok(())
        }

        // General copy is not implemented
        _ => Err(ErrorCode::SyntaxUnknown.into()),
    }
}

/* ------------------------------------------------------------------ */
/*  E commands                                                        */
/* ------------------------------------------------------------------ */

fn parse_eeprom(drive: &mut Drive) -> Result<(), DosError> {
    if drive.command.len < 6 {
        return Ok(());
    }
    let d = &drive.command.data;
    if d[1] != b'-' || (d[2] != b'W' && d[2] != b'R') {
        return Err(ErrorCode::SyntaxUnknown.into());
    }
    let address = u16::from(d[3]) | u16::from(d[4]) << 8;
    let length = d[5];
    let window = drive.eeprom.size() - CONFIG_RECORD_LEN;
    if u32::from(address) + u32::from(length) > u32::from(window) {
        return Err(ErrorCode::SyntaxTooLong.into());
    }

    if d[2] == b'W' {
        for i in 0..length {
            let byte = drive
                .command
                .data
                .get(6 + i as usize)
                .copied()
                .unwrap_or(0);
            drive
                .eeprom
                .write_byte(CONFIG_RECORD_LEN + address + u16::from(i), byte);
        }
    } else {
        // Reads land in the error buffer; the host fetches them by
        // reading channel 15
        let mut bytes = [0u8; 256];
        for i in 0..length {
            bytes[i as usize] = drive
                .eeprom
                .read_byte(CONFIG_RECORD_LEN + address + u16::from(i));
        }
        let err = drive.buffers.buf_mut(ERROR_BUFFER);
        err.data[..length as usize].copy_from_slice(&bytes[..length as usize]);
        err.position = 0;
        err.lastused = length.wrapping_sub(1);
    }
    Ok(())
}

/* ------------------------------------------------------------------ */
/*  I command                                                         */
/* ------------------------------------------------------------------ */

fn parse_initialize(drive: &mut Drive) -> Result<(), DosError> {
    if drive.state.disk_state != DiskState::Ok {
        return Err(DosError::with_ts(ErrorCode::ReadNoSync, 18, 0));
    }
    drive.free_all_buffers(true)
}

/* ------------------------------------------------------------------ */
/*  M commands                                                        */
/* ------------------------------------------------------------------ */

fn parse_memory(drive: &mut Drive) -> Result<(), DosError> {
    match drive.command.data[2] {
        b'W' => handle_memwrite(drive),
        b'E' => handle_memexec(drive),
        b'R' => handle_memread(drive),
        _ => Err(ErrorCode::SyntaxUnknown.into()),
    }
}

fn handle_memwrite(drive: &mut Drive) -> Result<(), DosError> {
    if drive.command.len < 6 {
        return Ok(());
    }
    let d = &drive.command.data;
    let address = u16::from(d[3]) | u16::from(d[4]) << 8;
    let length = d[5];

    if address == 0x0077 {
        // Device address poke, classic drive style
        let new = d[6] & 0x1F;
        if (4..=30).contains(&new) {
            drive.state.device_address = new;
        }
        return Ok(());
    }

    if address == 0x1C06 || address == 0x1C07 {
        // Ignore attempts to raise the VIA timer frequency
        return Ok(());
    }

    // Capture uploads into the RAM shadow so loaders can read their
    // tables back out of drive memory
    let end = (6 + length as usize).min(drive.command.len).max(6);
    let payload = drive.command.data[6..end].to_vec();
    drive.state.capture_shadow(address, &payload);

    if drive.state.detected_loader == Some(LoaderKind::Turbodisk) {
        // Final Turbodisk write carries the file name; the tag stays
        // armed for the execute that follows
        return Ok(());
    }

    let mut crc = drive.state.datacrc;
    for &b in drive.command.bytes() {
        crc = crc16_update(crc, b);
    }
    drive.state.datacrc = crc;

    let detected = drive
        .config
        .signatures
        .iter()
        .find(|s| s.crc == crc)
        .map(|s| s.loader);
    drive.state.detected_loader = detected;
    if detected.is_none() {
        debug!("memory write to {address:04X}, CRC {crc:04X} matches no loader");
    }
    Ok(())
}

fn handle_memexec(drive: &mut Drive) -> Result<(), DosError> {
    if drive.command.len < 5 {
        return Ok(());
    }
    let address = u16::from(drive.command.data[3]) | u16::from(drive.command.data[4]) << 8;

    match drive.state.detected_loader.take() {
        Some(kind) => {
            let armed = drive
                .config
                .signatures
                .iter()
                .any(|s| s.loader == kind && s.exec_address == address);
            if armed {
                drive.state.pending_loader = Some(kind);
            } else {
                debug!("execute at {address:04X} does not match {kind:?}");
            }
        }
        None => {
            debug!(
                "memory execute at {address:04X}, CRC {:04X}",
                drive.state.datacrc
            );
        }
    }
    drive.state.datacrc = 0xFFFF;
    Ok(())
}

fn handle_memread(drive: &mut Drive) -> Result<(), DosError> {
    if drive.command.len < 6 {
        return Ok(());
    }
    // Return the first buffer's contents instead of raw memory; reading
    // arbitrary addresses could hit live I/O registers
    let requested = drive.command.data[5];
    let page = drive.buffers.buf(0).data;
    let err = drive.buffers.buf_mut(ERROR_BUFFER);
    err.data = page;
    err.position = 0;
    err.lastused = requested.wrapping_sub(1);
    Ok(())
}

/* ------------------------------------------------------------------ */
/*  R command                                                         */
/* ------------------------------------------------------------------ */

fn parse_rename(drive: &mut Drive) -> Result<(), DosError> {
    let bytes = drive.command.bytes();
    let eq = bytes
        .iter()
        .position(|&b| b == b'=')
        .ok_or(ErrorCode::SyntaxUnknown)?;
    let new_spec = bytes[1..eq].to_vec();
    let old_spec = bytes[eq + 1..].to_vec();

    let current = drive.state.current_part;
    let (new_path, new_name) = parse_path(&mut drive.partitions, current, &new_spec, false)?;
    let new_name = new_name.to_vec();
    let (old_path, old_name) = parse_path(&mut drive.partitions, current, &old_spec, false)?;
    let old_name = old_name.to_vec();

    // Rename can't move files across directories
    if old_path != new_path {
        return Err(ErrorCode::FileNotFound.into());
    }

    if new_name
        .iter()
        .any(|&b| matches!(b, b'*' | b'?' | b'/' | b'=' | b','))
    {
        return Err(ErrorCode::SyntaxUnknown.into());
    }

    let fs = &mut drive.partitions[new_path.part as usize].fs;
    if fs
        .first_match(new_path.dir, &new_name, MatchFlags::HIDDEN)?
        .is_some()
    {
        return Err(ErrorCode::FileExists.into());
    }
    if fs
        .first_match(old_path.dir, &old_name, MatchFlags::HIDDEN)?
        .is_none()
    {
        return Err(ErrorCode::FileNotFound.into());
    }
    fs.rename(old_path.dir, &old_name, &new_name)?;
    Ok(())
}

/* ------------------------------------------------------------------ */
/*  S command                                                         */
/* ------------------------------------------------------------------ */

fn parse_scratch(drive: &mut Drive) -> Result<(), DosError> {
    let bytes = drive.command.bytes();
    if bytes.len() == 3 && bytes[1] == b'-' {
        // Swap drive number: not supported
        return Err(ErrorCode::SyntaxUnable.into());
    }

    let input = bytes[1..].to_vec();
    let current = drive.state.current_part;
    let (path, pattern) = parse_path(&mut drive.partitions, current, &input, false)?;
    let pattern = pattern.to_vec();

    let fs = &mut drive.partitions[path.part as usize].fs;
    fs.open_dir(path.dir)?;
    let mut count: u8 = 0;
    while let Some(entry) = fs.next_match(&pattern, MatchFlags::HIDDEN)? {
        // Directories are never scratched
        if entry.kind == EntryKind::Directory {
            continue;
        }
        count = count.saturating_add(fs.file_delete(path.dir, &entry.name)?);
    }
    drive.set_error_ts(ErrorCode::Scratched, count, 0);
    Ok(())
}

/* ------------------------------------------------------------------ */
/*  U commands                                                        */
/* ------------------------------------------------------------------ */

fn parse_user(drive: &mut Drive, port: &mut dyn IecPort) -> Result<(), DosError> {
    match drive.command.data[1] {
        b'A' | b'1' => {
            // Rewrite as (B)-R and reparse: either the string carries a
            // colon or block parsing starts right after the header
            drive.command.data[0] = b'-';
            drive.command.data[1] = b'R';
            parse_block(drive)
        }

        b'B' | b'2' => {
            drive.command.data[0] = b'-';
            drive.command.data[1] = b'W';
            parse_block(drive)
        }

        b'I' | b'9' => match drive.command.data[2] {
            // Soft reset: answer with the version banner
            0 => Err(ErrorCode::DosVersion.into()),
            b'+' => {
                drive.state.flags.remove(IecFlags::VC20MODE);
                Ok(())
            }
            b'-' => {
                drive.state.flags.insert(IecFlags::VC20MODE);
                Ok(())
            }
            _ => Err(ErrorCode::SyntaxUnknown.into()),
        },

        b'J' | b':' => {
            // Hard reset: interrupts off, jump to the restart routine
            port.irq_disable();
            drive.trigger_restart();
            Ok(())
        }

        b'0' => {
            // Only the "change device address" subform is honoured
            let d = &drive.command.data;
            if d[2] & 0x1F == 0x1E && (4..=30).contains(&d[3]) {
                let new = d[3];
                drive.state.device_address = new;
                Ok(())
            } else {
                Err(ErrorCode::SyntaxUnknown.into())
            }
        }

        _ => Err(ErrorCode::SyntaxUnknown.into()),
    }
}

/* ------------------------------------------------------------------ */
/*  X commands                                                        */
/* ------------------------------------------------------------------ */

fn status_with_address(drive: &mut Drive) {
    let address = drive.state.device_address;
    drive.set_error_ts(ErrorCode::Ok, address, 0);
}

fn parse_xcommand(drive: &mut Drive) -> Result<(), DosError> {
    match drive.command.data[1] {
        b'J' => {
            match drive.command.data[2] {
                b'+' => drive.state.flags.insert(IecFlags::JIFFY_ENABLED),
                b'-' => drive.state.flags.remove(IecFlags::JIFFY_ENABLED),
                _ => return Err(ErrorCode::SyntaxUnknown.into()),
            }
            status_with_address(drive);
            Ok(())
        }

        b'C' => {
            let mut pos = 2;
            let value = parse_number(drive.command.bytes(), &mut pos);
            drive.state.calibration = value;
            status_with_address(drive);
            Ok(())
        }

        b'W' => {
            write_configuration(drive.eeprom.as_mut(), &drive.state);
            status_with_address(drive);
            Ok(())
        }

        b'S' => {
            let input = drive.command.bytes()[2..].to_vec();
            let current = drive.state.current_part;
            let (path, name) = parse_path(&mut drive.partitions, current, &input, false)?;
            let name = name.to_vec();
            drive.state.set_swap_list(Some(SwapList {
                part: path.part,
                dir: path.dir,
                name,
            }));
            Ok(())
        }

        // Anything else just reports the status
        _ => {
            status_with_address(drive);
            Ok(())
        }
    }
}

/* ------------------------------------------------------------------ */
/*  MD / CD / RD                                                      */
/* ------------------------------------------------------------------ */

fn parse_dircommand(drive: &mut Drive) -> Result<(), DosError> {
    match drive.command.data[0] {
        b'M' => handle_mkdir(drive),
        b'C' => handle_chdir(drive),
        b'R' => handle_rmdir(drive),
        _ => Err(ErrorCode::SyntaxUnknown.into()),
    }
}

fn handle_mkdir(drive: &mut Drive) -> Result<(), DosError> {
    if !drive.command.bytes().contains(&b':') {
        return Err(ErrorCode::SyntaxNoName.into());
    }
    let input = drive.command.bytes()[2..].to_vec();
    let current = drive.state.current_part;
    let (path, name) = parse_path(&mut drive.partitions, current, &input, false)?;
    let name = name.to_vec();
    drive.partitions[path.part as usize].fs.mkdir(path.dir, &name)?;
    Ok(())
}

fn handle_chdir(drive: &mut Drive) -> Result<(), DosError> {
    let had_slash = drive.command.bytes().contains(&b'/');
    let input = drive.command.bytes()[2..].to_vec();
    let current = drive.state.current_part;
    let (path, name) = parse_path(&mut drive.partitions, current, &input, true)?;
    let name = name.to_vec();
    let part = &mut drive.partitions[path.part as usize];

    if name.is_empty() {
        if had_slash {
            // "CD:DIR/" — the walked path itself becomes the working
            // directory
            part.current_dir = path.dir;
        } else {
            return Err(ErrorCode::DirNotFound.into());
        }
    } else if name[0] == b'_' {
        // Going up a level; the filesystem resolves it
        part.current_dir = part.fs.chdir(path.dir, &name)?;
    } else {
        let entry = part
            .fs
            .first_match(path.dir, &name, MatchFlags::HIDDEN)?
            .ok_or(ErrorCode::FileNotFound)?;
        if entry.kind == EntryKind::Directory {
            part.current_dir = entry.id;
        } else {
            // A file: try to mount it as an image
            part.current_dir = part.fs.chdir(path.dir, &entry.name)?;
        }
    }

    if drive.state.flags.contains(IecFlags::AUTOSWAP_ACTIVE) {
        drive.state.set_swap_list(None);
    }
    Ok(())
}

fn handle_rmdir(drive: &mut Drive) -> Result<(), DosError> {
    // No deletion across subdirectories
    if drive.command.bytes().contains(&b'/') {
        return Err(ErrorCode::SyntaxNoName.into());
    }

    let bytes = drive.command.bytes();
    let mut pos = 2;
    let raw = parse_number(bytes, &mut pos);
    if bytes.get(pos) != Some(&b':') {
        return Err(ErrorCode::SyntaxNoName.into());
    }
    let name = bytes[pos + 1..].to_vec();

    let part = if raw == 0 {
        drive.state.current_part
    } else {
        raw - 1
    };
    if part as usize >= drive.partitions.len() {
        return Err(DosError::with_ts(
            ErrorCode::PartitionIllegal,
            part.wrapping_add(1),
            0,
        ));
    }

    let dir = drive.partitions[part as usize].current_dir;
    let count = drive.partitions[part as usize].fs.file_delete(dir, &name)?;
    drive.set_error_ts(ErrorCode::Scratched, count, 0);
    Ok(())
}
