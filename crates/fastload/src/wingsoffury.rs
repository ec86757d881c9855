//! Wings of Fury loader.
//!
//! Commands are four bytes `(c, t, s, chk)` with `chk = c ^ t ^ s`; a
//! mismatch is answered with `$A1` and the command repeated, a match
//! with `$89`. Bytes move as four 2-bit pairs driven onto CLOCK and
//! DATA simultaneously, separated by fixed microsecond gaps, so both
//! ends must share a timing reference: `sync()` establishes it with a
//! DATA/CLOCK exchange before every byte group. The fixed gaps are why
//! this loader refuses to start on an untrustworthy oscillator.

use drive_dos::{Drive, ErrorCode};
use iec_bus::{AtomicSection, IecPort};
use log::warn;

use crate::{Abort, flash_leds};

const ACK: u8 = 0x89;
const NAK: u8 = 0xA1;

/// Wait until the host releases DATA; ATN aborts.
fn wait_data_released(port: &mut dyn IecPort) -> Result<(), Abort> {
    loop {
        let lines = port.bus_read();
        if !lines.atn() {
            return Err(Abort);
        }
        if lines.data() {
            return Ok(());
        }
    }
}

/// Wait until the host asserts DATA; ATN aborts.
fn wait_data_asserted(port: &mut dyn IecPort) -> Result<(), Abort> {
    loop {
        let lines = port.bus_read();
        if !lines.atn() {
            return Err(Abort);
        }
        if !lines.data() {
            return Ok(());
        }
    }
}

/// Establish the mutual timing reference: release both lines, wait for
/// DATA high, answer on CLOCK, wait for the host's DATA ack.
fn sync(port: &mut dyn IecPort) -> Result<(), Abort> {
    port.set_clock(true);
    port.set_data(true);
    port.delay_us(10);
    wait_data_released(port)?;
    port.set_clock(false);
    wait_data_asserted(port)?;
    Ok(())
}

/// Receive one byte: the host lays two bits at a time onto CLOCK/DATA
/// with fixed gaps; sample at the agreed instants.
fn get_byte(port: &mut dyn IecPort) -> Result<u8, Abort> {
    let mut b = 0;
    sync(port)?;
    wait_data_released(port)?;
    port.set_data(true);
    port.set_clock(true);
    port.delay_us(18);
    let lines = port.bus_read();
    if !lines.clock() {
        b |= 1;
    }
    if !lines.data() {
        b |= 2;
    }
    port.delay_us(11);
    let lines = port.bus_read();
    if !lines.clock() {
        b |= 4;
    }
    if !lines.data() {
        b |= 8;
    }
    port.delay_us(11);
    let lines = port.bus_read();
    if !lines.clock() {
        b |= 16;
    }
    if !lines.data() {
        b |= 32;
    }
    port.delay_us(11);
    let lines = port.bus_read();
    if !lines.clock() {
        b |= 64;
    }
    if !lines.data() {
        b |= 128;
    }
    port.set_clock(false); // busy until the next exchange
    Ok(b)
}

/// Send one byte as four timed 2-bit pairs.
fn put_single_byte(port: &mut dyn IecPort, b: u8) -> Result<(), Abort> {
    port.set_data(true);
    port.set_clock(true);
    wait_data_released(port)?;

    port.set_clock(b & 1 == 0);
    port.set_data(b & 2 == 0);
    port.delay_us(19);
    port.set_clock(b & 4 == 0);
    port.set_data(b & 8 == 0);
    port.delay_us(10);
    port.set_clock(b & 16 == 0);
    port.set_data(b & 32 == 0);
    port.delay_us(11);
    port.set_clock(b & 64 == 0);
    port.set_data(b & 128 == 0);
    port.delay_us(10); // let the host latch the last pair
    Ok(())
}

fn sync_and_put_byte(port: &mut dyn IecPort, b: u8) -> Result<(), Abort> {
    sync(port)?;
    put_single_byte(port, b)
}

/// Read a sector, report a status byte (1 = good, 4 = read error), then
/// stream all 256 bytes.
fn read_and_send(
    drive: &mut Drive,
    port: &mut dyn IecPort,
    buf: usize,
    track: u8,
    sector: u8,
) -> Result<(), Abort> {
    let part = drive.state.current_part;
    let status = match drive.read_sector(buf, part, track, sector) {
        Ok(()) => 0x01,
        Err(err) => {
            drive.set_dos_error(err);
            0x04
        }
    };
    let data = drive.buffers.buf(buf).data;

    let mut bus = AtomicSection::enter(port);
    sync_and_put_byte(&mut *bus, status)?;
    sync(&mut *bus)?;
    for &byte in &data {
        put_single_byte(&mut *bus, byte)?;
    }
    Ok(())
}

/// Follow the sector chain, streaming every full sector (link bytes
/// included; the host follows them itself).
fn send_chain(
    drive: &mut Drive,
    port: &mut dyn IecPort,
    buf: usize,
    track: u8,
    sector: u8,
) -> Result<(), Abort> {
    let part = drive.state.current_part;
    let (mut track, mut sector) = (track, sector);
    while track != 0 {
        if let Err(err) = drive.read_sector(buf, part, track, sector) {
            drive.set_dos_error(err);
            return Ok(());
        }
        let data = drive.buffers.buf(buf).data;
        {
            let mut bus = AtomicSection::enter(port);
            sync(&mut *bus)?;
            for &byte in &data {
                put_single_byte(&mut *bus, byte)?;
            }
        }
        track = data[0];
        sector = data[1];
    }
    Ok(())
}

/// Receive a sector plus an XOR checksum; on mismatch answer `$A1` and
/// take the whole sector again, on match answer `$89` and commit it.
fn receive_and_write(
    drive: &mut Drive,
    port: &mut dyn IecPort,
    buf: usize,
    track: u8,
    sector: u8,
) -> Result<(), Abort> {
    loop {
        let mut data = [0u8; 256];
        let sum = {
            let mut bus = AtomicSection::enter(port);
            for byte in &mut data {
                *byte = get_byte(&mut *bus)?;
            }
            get_byte(&mut *bus)?
        };

        let computed = data.iter().fold(0u8, |acc, &b| acc ^ b);
        if sum == computed {
            {
                let mut bus = AtomicSection::enter(port);
                sync_and_put_byte(&mut *bus, ACK)?;
            }
            drive.buffers.buf_mut(buf).data = data;
            let part = drive.state.current_part;
            if let Err(err) = drive.write_sector(buf, part, track, sector) {
                drive.set_dos_error(err);
            }
            return Ok(());
        }

        let mut bus = AtomicSection::enter(port);
        sync_and_put_byte(&mut *bus, NAK)?;
    }
}

fn serve(drive: &mut Drive, port: &mut dyn IecPort, buf: usize) -> Result<(), Abort> {
    loop {
        port.set_busy_led(false);

        let (c, t, s, chk) = {
            let mut bus = AtomicSection::enter(port);
            let c = get_byte(&mut *bus)?;
            let t = get_byte(&mut *bus)?;
            let s = get_byte(&mut *bus)?;
            let chk = get_byte(&mut *bus)?;
            (c, t, s, chk)
        };

        port.set_busy_led(true);
        port.delay_ms(1);

        if chk != c ^ t ^ s {
            let mut bus = AtomicSection::enter(port);
            sync_and_put_byte(&mut *bus, NAK)?;
            continue;
        }
        {
            let mut bus = AtomicSection::enter(port);
            sync_and_put_byte(&mut *bus, ACK)?;
        }

        match c {
            0 => read_and_send(drive, port, buf, t, s)?,
            1 => {
                port.set_dirty_led(true);
                let result = receive_and_write(drive, port, buf, t, s);
                port.set_dirty_led(false);
                result?;
            }
            2 => send_chain(drive, port, buf, t, s)?,
            _ if c & 0x80 != 0 => return Ok(()),
            _ => {
                warn!("unknown loader opcode {c:02X}");
                drive.set_error(ErrorCode::UnknownDriveCode);
                return Ok(());
            }
        }
    }
}

pub(crate) fn run(drive: &mut Drive, port: &mut dyn IecPort) {
    // The fixed bit gaps leave no margin on a drifting oscillator
    if !port.timing_stable() {
        drive.set_error(ErrorCode::ClockUnstable);
        return;
    }

    let Some(buf) = drive.buffers.allocate_system() else {
        drive.set_error(ErrorCode::NoChannel);
        return;
    };

    port.set_data(true);
    port.set_clock(true);

    let _ = serve(drive, port, buf);

    port.set_data(true);
    port.set_clock(true);
    let _ = drive.free_buffer(buf);
    flash_leds(port);
}

#[cfg(test)]
mod tests {
    use super::*;
    use drive_dos::imagefs::ROOT_DIR;
    use drive_dos::{DriveConfig, FileOps, ImageFs, Medium, MemEeprom, Partition};
    use iec_bus::{BusState, IecLines};
    use std::collections::VecDeque;

    enum WOp {
        /// Bytes for the drive; every byte is preceded by the drive's
        /// sync exchange.
        Send(Vec<u8>),
        /// One sync-prefixed byte from the drive (ACK/NAK/status).
        RecvSynced,
        /// One sync, then this many timed stream bytes from the drive.
        RecvStream(usize),
    }

    #[derive(Clone, Copy, PartialEq)]
    enum WState {
        Idle,
        /// Waiting for the drive to assert CLOCK during sync.
        AwaitSyncClock,
        /// DATA ack asserted; counting the drive's reads before letting
        /// go and starting the byte proper.
        SyncAcked { reads: u8 },
        /// Laying out 2-bit pairs against the shared timing reference.
        Transmit { t0: u64 },
        /// Collecting the drive's pair updates by call order.
        Capture,
        /// Stream byte boundary: skip the line releases, wait for the
        /// drive's ready poll.
        AwaitStreamRead,
        Done,
    }

    #[derive(Clone, Copy, PartialEq)]
    enum CurOp {
        Send,
        RecvSynced,
        RecvStream,
    }

    /// Simulated host half of the timed protocol. Sending follows the
    /// microsecond timeline the drive announces through its delay
    /// calls; receiving decodes the drive's line updates in call order.
    struct WofHost {
        bus: BusState,
        now_us: u64,
        script: VecDeque<WOp>,
        state: WState,
        cur: CurOp,
        send_queue: VecDeque<u8>,
        stream_remaining: usize,
        capture_count: u8,
        capture_byte: u8,
        received: Vec<u8>,
        drive_clock_low: bool,
        steps: u64,
    }

    impl WofHost {
        fn new(script: Vec<WOp>) -> Self {
            Self {
                bus: BusState::new(),
                now_us: 0,
                script: script.into(),
                state: WState::Idle,
                cur: CurOp::Send,
                send_queue: VecDeque::new(),
                stream_remaining: 0,
                capture_count: 0,
                capture_byte: 0,
                received: Vec::new(),
                drive_clock_low: false,
                steps: 0,
            }
        }

        fn pop_op(&mut self) {
            match self.script.pop_front() {
                Some(WOp::Send(bytes)) => {
                    self.send_queue = bytes.into();
                    self.cur = CurOp::Send;
                    self.state = WState::AwaitSyncClock;
                }
                Some(WOp::RecvSynced) => {
                    self.cur = CurOp::RecvSynced;
                    self.state = WState::AwaitSyncClock;
                }
                Some(WOp::RecvStream(n)) => {
                    self.stream_remaining = n;
                    self.cur = CurOp::RecvStream;
                    self.state = WState::AwaitSyncClock;
                }
                None => {
                    // Script exhausted: a bus reset ends the session
                    self.bus.set_host_atn(true);
                    self.state = WState::Done;
                }
            }
        }

        /// Present the pair for the current transmit instant.
        fn update_transmit_lines(&mut self) {
            let WState::Transmit { t0 } = self.state else {
                return;
            };
            let byte = *self.send_queue.front().expect("byte in flight");
            let elapsed = self.now_us - t0;
            if elapsed == 0 {
                // The drive is still polling for DATA released; the
                // first pair goes out only once its sample delay runs
                self.bus.set_host_clock(false);
                self.bus.set_host_data(false);
                return;
            }
            let pair = match elapsed {
                1..=18 => 0,
                19..=29 => 1,
                30..=40 => 2,
                _ => 3,
            };
            let clock_bit = byte >> (pair * 2) & 1 != 0;
            let data_bit = byte >> (pair * 2 + 1) & 1 != 0;
            self.bus.set_host_clock(clock_bit);
            self.bus.set_host_data(data_bit);
        }

        fn byte_captured(&mut self) {
            self.received.push(self.capture_byte);
            self.capture_count = 0;
            self.capture_byte = 0;
            match self.cur {
                CurOp::RecvSynced => self.pop_op(),
                CurOp::RecvStream => {
                    self.stream_remaining -= 1;
                    if self.stream_remaining == 0 {
                        self.pop_op();
                    } else {
                        self.state = WState::AwaitStreamRead;
                    }
                }
                CurOp::Send => unreachable!("capture while sending"),
            }
        }

        fn on_read(&mut self) {
            self.bump();
            match self.state {
                WState::Idle => self.pop_op(),
                WState::SyncAcked { reads } => {
                    if reads + 1 >= 2 {
                        self.bus.set_host_data(false);
                        match self.cur {
                            CurOp::Send => {
                                self.state = WState::Transmit { t0: self.now_us };
                                self.update_transmit_lines();
                            }
                            CurOp::RecvSynced | CurOp::RecvStream => {
                                self.state = WState::Capture;
                            }
                        }
                    } else {
                        self.state = WState::SyncAcked { reads: reads + 1 };
                    }
                }
                WState::AwaitStreamRead => self.state = WState::Capture,
                _ => {}
            }
            self.update_transmit_lines();
        }

        fn on_drive_set(&mut self, is_clock: bool, released: bool) {
            self.bump();
            let was_low = self.drive_clock_low;
            if is_clock {
                self.drive_clock_low = !released;
            }
            let clock_asserted_edge = is_clock && !released && !was_low;

            match self.state {
                WState::Idle => {
                    self.pop_op();
                    // Re-dispatch the edge to the fresh state
                    if clock_asserted_edge && self.state == WState::AwaitSyncClock {
                        self.bus.set_host_data(true);
                        self.state = WState::SyncAcked { reads: 0 };
                    }
                }
                WState::AwaitSyncClock => {
                    if clock_asserted_edge {
                        self.bus.set_host_data(true);
                        self.state = WState::SyncAcked { reads: 0 };
                    }
                }
                WState::Transmit { .. } => {
                    if clock_asserted_edge {
                        // Busy marker: the byte was consumed
                        self.bus.set_host_clock(false);
                        self.bus.set_host_data(false);
                        self.send_queue.pop_front();
                        if self.send_queue.is_empty() {
                            self.pop_op();
                        } else {
                            self.state = WState::AwaitSyncClock;
                        }
                    }
                }
                WState::Capture => {
                    let bit = u8::from(!released);
                    self.capture_byte |= bit << self.capture_count;
                    self.capture_count += 1;
                    if self.capture_count == 8 {
                        self.byte_captured();
                    }
                }
                _ => {}
            }
        }

        fn bump(&mut self) {
            self.steps += 1;
            assert!(self.steps < 5_000_000, "bus stalled");
        }
    }

    impl IecPort for WofHost {
        fn bus_read(&mut self) -> IecLines {
            self.on_read();
            self.bus.lines()
        }

        fn set_clock(&mut self, released: bool) {
            self.bus.set_drive_clock(!released);
            self.on_drive_set(true, released);
        }

        fn set_data(&mut self, released: bool) {
            self.bus.set_drive_data(!released);
            self.on_drive_set(false, released);
        }

        fn delay_us(&mut self, us: u32) {
            self.now_us += u64::from(us);
            self.update_transmit_lines();
        }

        fn delay_ms(&mut self, ms: u32) {
            self.now_us += u64::from(ms) * 1000;
        }
    }

    fn cmd(c: u8, t: u8, s: u8) -> Vec<u8> {
        vec![c, t, s, c ^ t ^ s]
    }

    fn make_drive(fs: ImageFs) -> Drive {
        Drive::new(
            DriveConfig::default(),
            vec![Partition::new(Box::new(fs), Medium::Image)],
            Box::new(MemEeprom::new()),
        )
    }

    #[test]
    fn read_sector_with_status() {
        let mut fs = ImageFs::new();
        let mut sector = [0u8; 256];
        for (i, b) in sector.iter_mut().enumerate() {
            *b = (i * 7 % 256) as u8;
        }
        fs.write_sector(9, 2, &sector).expect("seed");
        let mut drive = make_drive(fs);

        let mut host = WofHost::new(vec![
            WOp::Send(cmd(0, 9, 2)),
            WOp::RecvSynced,      // command ACK
            WOp::RecvSynced,      // read status
            WOp::RecvStream(256), // sector data
        ]);
        run(&mut drive, &mut host);

        assert_eq!(host.received.len(), 258);
        assert_eq!(host.received[0], ACK);
        assert_eq!(host.received[1], 0x01);
        assert_eq!(&host.received[2..], &sector[..]);
        assert!(drive.buffers.allocated_indices(false).is_empty());
    }

    #[test]
    fn bad_checksum_gets_nak_then_retry_works() {
        let mut drive = make_drive(ImageFs::new());

        let mut bad = cmd(0, 1, 0);
        bad[3] ^= 0xFF;
        let mut host = WofHost::new(vec![
            WOp::Send(bad),
            WOp::RecvSynced, // NAK
            WOp::Send(cmd(0x80, 0, 0)),
            WOp::RecvSynced, // ACK, then the loader exits
        ]);
        run(&mut drive, &mut host);

        assert_eq!(host.received, vec![NAK, ACK]);
        assert_eq!(drive.current_status().code, ErrorCode::Ok);
    }

    #[test]
    fn write_sector_with_checksum_retry() {
        let mut drive = make_drive(ImageFs::new());
        let payload: Vec<u8> = (0..256u32).map(|i| (i * 3 % 256) as u8).collect();
        let xor = payload.iter().fold(0u8, |a, &b| a ^ b);

        let mut corrupted = payload.clone();
        corrupted[10] ^= 0x55; // data changed but the old checksum sent

        let mut first = corrupted;
        first.push(xor);
        let mut second = payload.clone();
        second.push(xor);

        let mut host = WofHost::new(vec![
            WOp::Send(cmd(1, 12, 4)),
            WOp::RecvSynced, // command ACK
            WOp::Send(first),
            WOp::RecvSynced, // NAK: checksum mismatch
            WOp::Send(second),
            WOp::RecvSynced, // ACK: sector committed
            WOp::Send(cmd(0x80, 0, 0)),
            WOp::RecvSynced,
        ]);
        run(&mut drive, &mut host);

        assert_eq!(host.received, vec![ACK, NAK, ACK, ACK]);
        let mut sector = [0u8; 256];
        drive.partitions[0]
            .fs
            .read_sector(12, 4, &mut sector)
            .expect("read");
        assert_eq!(sector.to_vec(), payload);
    }

    #[test]
    fn chain_transfer_streams_full_sectors() {
        let mut fs = ImageFs::new();
        let content: Vec<u8> = (0..500u32).map(|i| (i % 249) as u8).collect();
        let (t, s) = fs.add_file(ROOT_DIR, b"STAGE", &content).expect("file");
        let mut drive = make_drive(fs);

        let mut host = WofHost::new(vec![
            WOp::Send(cmd(2, t, s)),
            WOp::RecvSynced, // command ACK
            WOp::RecvStream(256),
            WOp::RecvStream(256), // 500 bytes = two sectors
        ]);
        run(&mut drive, &mut host);

        assert_eq!(host.received.len(), 1 + 512);
        assert_eq!(host.received[0], ACK);
        // Sector payloads carry the content; link bytes travel too
        assert_eq!(&host.received[3..257], &content[..254]);
        assert_eq!(host.received[257], 0); // last sector: chain end marker
    }

    #[test]
    fn unstable_clock_refused() {
        struct UnstablePort(iec_bus::LoopbackPort);
        impl IecPort for UnstablePort {
            fn bus_read(&mut self) -> IecLines {
                self.0.bus_read()
            }
            fn set_clock(&mut self, released: bool) {
                self.0.set_clock(released);
            }
            fn set_data(&mut self, released: bool) {
                self.0.set_data(released);
            }
            fn delay_us(&mut self, us: u32) {
                self.0.delay_us(us);
            }
            fn delay_ms(&mut self, ms: u32) {
                self.0.delay_ms(ms);
            }
            fn timing_stable(&self) -> bool {
                false
            }
        }

        let mut drive = make_drive(ImageFs::new());
        let mut port = UnstablePort(iec_bus::LoopbackPort::new());
        run(&mut drive, &mut port);
        assert_eq!(drive.current_status().code, ErrorCode::ClockUnstable);
        // Refused before any buffer was taken
        assert!(drive.buffers.allocated_indices(false).is_empty());
    }

    #[test]
    fn unknown_opcode_reports_drivecode() {
        let mut drive = make_drive(ImageFs::new());
        let mut host = WofHost::new(vec![
            WOp::Send(cmd(0x23, 0, 0)),
            WOp::RecvSynced, // command ACK arrives before the opcode check
        ]);
        run(&mut drive, &mut host);
        assert_eq!(drive.current_status().code, ErrorCode::UnknownDriveCode);
    }

    #[test]
    fn atn_mid_command_is_clean() {
        let mut drive = make_drive(ImageFs::new());
        // Empty script: the host asserts ATN at the first sync
        let mut host = WofHost::new(vec![]);
        run(&mut drive, &mut host);
        assert_eq!(drive.current_status().code, ErrorCode::Ok);
        assert!(drive.buffers.allocated_indices(false).is_empty());
    }
}
