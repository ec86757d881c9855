//! N0stalgia IFFL loader.
//!
//! The title packs many small "virtual files" into one container file
//! and uploads a table of their starting positions (as logical sector
//! numbers plus byte offsets) into drive pages $05-$07. A scanner pass
//! walks the container's sector chain once and rewrites the table as
//! physical track/sector pairs; the load pass then serves single-byte
//! commands: values below $E0 stream a vfile to the host, values from
//! $E0 up receive one, with the low five bits selecting the vfile.
//!
//! Every bit is exchanged with a mutual ack: the sender asserts its
//! line (CLOCK for a one, DATA for a zero), the receiver answers on the
//! other line, and both release in turn. No fixed timing is involved,
//! so the handshake runs without the interrupt lock.

use drive_dos::{Drive, DosError, ErrorCode, Medium};
use iec_bus::IecPort;
use log::warn;

use crate::{Abort, flash_leds};

/// Entries in the uploaded vfile table.
const VFILE_COUNT: usize = 208;

/// Uploaded table addresses in drive RAM: logical sector low bytes
/// (rewritten to start sectors), high bytes (rewritten to start
/// tracks), and byte offsets within the starting sector.
const TABLE_LBA_LO: u16 = 0x0590;
const TABLE_LBA_HI: u16 = 0x0660;
const TABLE_OFFSET: u16 = 0x0730;

/* ------------------------------------------------------------------ */
/*  Scanner                                                           */
/* ------------------------------------------------------------------ */

/// Translate the uploaded logical-sector table into physical
/// track/sector pairs by walking the container's chain. The host opened
/// the container and read its first byte just before this runs, so the
/// chain start is the most recently read sector.
pub(crate) fn scan(drive: &mut Drive, _port: &mut dyn IecPort) {
    let part = drive.state.current_part;
    if drive.partitions[usize::from(part)].medium != Medium::Image {
        drive.set_error(ErrorCode::ImageInvalid);
        return;
    }

    let Some(buf) = drive.buffers.allocate_system() else {
        drive.set_error(ErrorCode::NoChannel);
        return;
    };

    let lba_lo = drive
        .state
        .shadow(TABLE_LBA_LO, VFILE_COUNT)
        .expect("table window within shadow")
        .to_vec();
    let lba_hi = drive
        .state
        .shadow(TABLE_LBA_HI, VFILE_COUNT)
        .expect("table window within shadow")
        .to_vec();

    let mut start_track = [0u8; VFILE_COUNT];
    let mut start_sector = [0u8; VFILE_COUNT];

    let (mut track, mut sector) = drive.state.last_read;
    let mut index = 0usize;
    let mut count: u16 = 0;

    while track != 0 && index < VFILE_COUNT {
        if let Err(err) = drive.read_sector(buf, part, track, sector) {
            drive.set_dos_error(err);
            break;
        }
        let target = u16::from(lba_hi[index]) << 8 | u16::from(lba_lo[index]);
        if count == target {
            start_track[index] = track;
            start_sector[index] = sector;
            index += 1;
        }
        let data = &drive.buffers.buf(buf).data;
        track = data[0];
        sector = data[1];
        count = count.wrapping_add(1);
    }

    // The translated tables replace the uploaded ones in place
    drive.state.capture_shadow(TABLE_LBA_LO, &start_sector);
    drive.state.capture_shadow(TABLE_LBA_HI, &start_track);

    let _ = drive.free_buffer(buf);
}

/* ------------------------------------------------------------------ */
/*  Bit handshake                                                     */
/* ------------------------------------------------------------------ */

/// Wait until any of ATN/CLOCK/DATA goes active.
fn wait_any_active(port: &mut dyn IecPort) -> iec_bus::IecLines {
    loop {
        let lines = port.bus_read();
        if !(lines.atn() && lines.clock() && lines.data()) {
            return lines;
        }
    }
}

/// Receive one byte, MSb first, acking every bit.
fn get_byte(port: &mut dyn IecPort) -> Result<u8, Abort> {
    port.set_clock(true);
    port.set_data(true);

    let mut b = 0;
    for _ in 0..8 {
        let lines = wait_any_active(port);
        if !lines.atn() {
            return Err(Abort);
        }
        b <<= 1;
        if !lines.clock() {
            // Host pulled CLOCK: a one. Ack on DATA, wait for release.
            b |= 1;
            port.set_data(false);
            while !port.bus_read().clock() {}
        } else {
            // Host pulled DATA: a zero. Ack on CLOCK.
            port.set_clock(false);
            while !port.bus_read().data() {}
        }
        port.set_clock(true);
        port.set_data(true);
    }
    Ok(b)
}

/// Send one byte, MSb first, waiting for the host's ack per bit.
fn put_byte(port: &mut dyn IecPort, b: u8) -> Result<(), Abort> {
    for i in (0..8).rev() {
        if b >> i & 1 != 0 {
            port.set_clock(false);
            loop {
                let lines = port.bus_read();
                if !lines.atn() {
                    return Err(Abort);
                }
                if !lines.data() {
                    break;
                }
            }
            port.set_clock(true);
            while !port.bus_read().data() {}
        } else {
            port.set_data(false);
            loop {
                let lines = port.bus_read();
                if !lines.atn() {
                    return Err(Abort);
                }
                if !lines.clock() {
                    break;
                }
            }
            port.set_data(true);
            while !port.bus_read().clock() {}
        }
    }
    Ok(())
}

/* ------------------------------------------------------------------ */
/*  Vfile access                                                      */
/* ------------------------------------------------------------------ */

/// Current physical sector of the open vfile, remembered for
/// write-back.
struct VfilePos {
    track: u8,
    sector: u8,
}

fn vfile_seek(
    drive: &mut Drive,
    buf: usize,
    track: u8,
    sector: u8,
    offset: u8,
) -> Result<VfilePos, DosError> {
    let part = drive.state.current_part;
    drive.read_sector(buf, part, track, sector)?;
    // Skip the two-byte chain link
    drive.buffers.buf_mut(buf).position = offset.wrapping_add(2);
    Ok(VfilePos { track, sector })
}

/// Next vfile byte; position 0 means the read wrapped past the sector
/// end and the chain continues.
fn vfile_read_byte(drive: &mut Drive, buf: usize, pos: &mut VfilePos) -> Result<u8, DosError> {
    if drive.buffers.buf(buf).position == 0 {
        let data = &drive.buffers.buf(buf).data;
        let (track, sector) = (data[0], data[1]);
        *pos = vfile_seek(drive, buf, track, sector, 0)?;
    }
    let b = drive.buffers.buf_mut(buf);
    let value = b.data[usize::from(b.position)];
    b.position = b.position.wrapping_add(1);
    Ok(value)
}

/// Store a vfile byte; on wraparound the full sector goes back to disk
/// and the next chain sector is loaded.
fn vfile_write_byte(
    drive: &mut Drive,
    buf: usize,
    pos: &mut VfilePos,
    value: u8,
) -> Result<(), DosError> {
    if drive.buffers.buf(buf).position == 0 {
        let part = drive.state.current_part;
        drive.write_sector(buf, part, pos.track, pos.sector)?;
        let data = &drive.buffers.buf(buf).data;
        let (track, sector) = (data[0], data[1]);
        *pos = vfile_seek(drive, buf, track, sector, 0)?;
    }
    let b = drive.buffers.buf_mut(buf);
    b.data[usize::from(b.position)] = value;
    b.position = b.position.wrapping_add(1);
    Ok(())
}

/* ------------------------------------------------------------------ */
/*  Loader                                                            */
/* ------------------------------------------------------------------ */

enum Stop {
    Abort,
    Status(DosError),
}

impl From<Abort> for Stop {
    fn from(_: Abort) -> Self {
        Self::Abort
    }
}

impl From<DosError> for Stop {
    fn from(err: DosError) -> Self {
        Self::Status(err)
    }
}

fn serve(
    drive: &mut Drive,
    port: &mut dyn IecPort,
    buf: usize,
    start_track: &[u8],
    start_sector: &[u8],
    offsets: &[u8],
) -> Result<(), Stop> {
    loop {
        let c = get_byte(port)?;

        // High command values write; the low five bits pick the vfile
        let index = usize::from(if c >= 0xE0 { c & 0x1F } else { c });
        if index >= VFILE_COUNT {
            warn!("vfile index {index} out of range");
            return Err(Stop::Status(DosError::new(ErrorCode::UnknownDriveCode)));
        }

        let mut pos = vfile_seek(
            drive,
            buf,
            start_track[index],
            start_sector[index],
            offsets[index],
        )?;
        let hi = vfile_read_byte(drive, buf, &mut pos)?;
        let lo = vfile_read_byte(drive, buf, &mut pos)?;
        let mut size = u16::from(hi) << 8 | u16::from(lo);

        // The host wants to know where the size field ended
        put_byte(port, drive.buffers.buf(buf).position)?;

        // The size arrives complemented, so count up to zero
        while size != 0 {
            if c < 0xE0 {
                let value = vfile_read_byte(drive, buf, &mut pos)?;
                put_byte(port, value)?;
            } else {
                let value = get_byte(port)?;
                vfile_write_byte(drive, buf, &mut pos, value)?;
            }
            size = size.wrapping_add(1);
        }
    }
}

pub(crate) fn run(drive: &mut Drive, port: &mut dyn IecPort) {
    port.set_data(true);
    port.set_clock(true);

    let start_sector = drive
        .state
        .shadow(TABLE_LBA_LO, VFILE_COUNT)
        .expect("table window within shadow")
        .to_vec();
    let start_track = drive
        .state
        .shadow(TABLE_LBA_HI, VFILE_COUNT)
        .expect("table window within shadow")
        .to_vec();
    let offsets = drive
        .state
        .shadow(TABLE_OFFSET, VFILE_COUNT)
        .expect("table window within shadow")
        .to_vec();

    let Some(buf) = drive.buffers.allocate_system() else {
        drive.set_error(ErrorCode::NoChannel);
        return;
    };

    match serve(drive, port, buf, &start_track, &start_sector, &offsets) {
        Ok(()) | Err(Stop::Abort) => {}
        Err(Stop::Status(err)) => drive.set_dos_error(err),
    }

    port.set_data(true);
    port.set_clock(true);
    let _ = drive.free_buffer(buf);
    flash_leds(port);
}
