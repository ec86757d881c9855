//! Another World trackloader.
//!
//! Bytes travel over DATA one bit at a time on every CLOCK edge, MSb
//! first, active-low, with the host driving CLOCK in both directions. A
//! command is three bytes `(a, b, c)` - track/sector or a page address
//! in `a`/`b`, the operation in `c` - dispatched on `c / 2`. The title
//! buffers disk data in drive pages $04-$07 and moves whole pages, so
//! the loader pins four page buffers for the whole session.

use drive_dos::{Drive, ErrorCode};
use iec_bus::{AtomicSection, IecPort};

use crate::{Abort, flash_leds};

/// Receive one byte: two bits per CLOCK cycle, sampled after each edge.
fn get_byte(port: &mut dyn IecPort) -> u8 {
    let mut b = 0;
    for _ in 0..4 {
        while port.bus_read().clock() {}
        b = b << 1 | u8::from(!port.bus_read().data());
        while !port.bus_read().clock() {}
        b = b << 1 | u8::from(!port.bus_read().data());
    }
    b
}

/// Send one byte: present a bit on DATA, let the host clock it out.
fn put_byte(port: &mut dyn IecPort, mut b: u8) {
    for _ in 0..4 {
        port.set_data(b & 0x80 == 0);
        b <<= 1;
        while port.bus_read().clock() {}
        port.set_data(b & 0x80 == 0);
        b <<= 1;
        while !port.bus_read().clock() {}
    }
}

/// Read a sector into a page buffer; failures become drive status.
fn read_page(drive: &mut Drive, idx: usize, track: u8, sector: u8) -> bool {
    let part = drive.state.current_part;
    match drive.read_sector(idx, part, track, sector) {
        Ok(()) => true,
        Err(err) => {
            drive.set_dos_error(err);
            false
        }
    }
}

/// Write a page buffer out to a sector.
fn write_page(drive: &mut Drive, idx: usize, track: u8, sector: u8) {
    let part = drive.state.current_part;
    if let Err(err) = drive.write_sector(idx, part, track, sector) {
        drive.set_dos_error(err);
    }
}

/// Follow a sector chain from `track`/`sector`, sending the 254 payload
/// bytes of each sector followed by the next-track byte; a zero track
/// byte tells the host the chain ended.
fn read_sector_chain(
    drive: &mut Drive,
    port: &mut dyn IecPort,
    pages: &[usize; 4],
    mut track: u8,
    mut sector: u8,
) {
    while track != 0 {
        port.set_clock(false); // busy while the sector loads
        let ok = read_page(drive, pages[3], track, sector);
        port.set_clock(true);
        if !ok {
            return;
        }

        let data = drive.buffers.buf(pages[3]).data;
        let mut bus = AtomicSection::enter(port);
        let mut i: u8 = 2;
        loop {
            put_byte(&mut *bus, data[usize::from(i)]);
            i = i.wrapping_add(1);
            if i == 0 {
                break;
            }
        }
        track = data[0];
        sector = data[1];
        put_byte(&mut *bus, track);
    }
}

/// Copy the staging page ($07) to another page. Only $04-$06 are
/// sensible targets; $07 would copy onto itself.
fn copy_page(drive: &mut Drive, pages: &[usize; 4], b: u8) {
    if !(4..=6).contains(&b) {
        return;
    }
    let src = drive.buffers.buf(pages[3]).data;
    drive.buffers.buf_mut(pages[usize::from(b - 4)]).data = src;
}

/// Receive a full page from the host into the staging page.
fn download_page(drive: &mut Drive, port: &mut dyn IecPort, pages: &[usize; 4]) {
    let mut data = [0u8; 256];
    {
        let mut bus = AtomicSection::enter(port);
        for byte in &mut data {
            *byte = get_byte(&mut *bus);
        }
    }
    drive.buffers.buf_mut(pages[3]).data = data;
}

/// Send a page ($04-$07) to the host.
fn upload_page(drive: &mut Drive, port: &mut dyn IecPort, pages: &[usize; 4], b: u8) {
    if !(4..=7).contains(&b) {
        return;
    }
    let data = drive.buffers.buf(pages[usize::from(b - 4)]).data;
    let mut bus = AtomicSection::enter(port);
    for &byte in &data {
        put_byte(&mut *bus, byte);
    }
}

fn serve(drive: &mut Drive, port: &mut dyn IecPort, pages: &[usize; 4]) -> Result<(), Abort> {
    loop {
        port.set_busy_led(false);

        let (a, b, c) = {
            let mut bus = AtomicSection::enter(port);

            // Wiggle DATA to tell the host we're ready; the host answers
            // by asserting CLOCK
            loop {
                bus.delay_us(10);
                let data_high = bus.bus_read().data();
                bus.set_data(!data_high);
                if !bus.bus_read().clock() {
                    break;
                }
            }
            bus.set_data(true);

            // Wait for the host to release CLOCK; ATN here is a bus reset
            loop {
                let lines = bus.bus_read();
                if lines.clock() {
                    break;
                }
                if !lines.atn() {
                    return Err(Abort);
                }
            }

            bus.set_busy_led(true);
            let a = get_byte(&mut *bus);
            let b = get_byte(&mut *bus);
            let c = get_byte(&mut *bus);
            (a, b, c)
        };

        match c / 2 {
            // Read a sector chain (a file) starting at track/sector a/b
            0 => read_sector_chain(drive, port, pages, a, b),
            // Read one sector into the staging page
            1 => {
                read_page(drive, pages[3], a, b);
            }
            // Copy the staging page to page b
            2 => copy_page(drive, pages, b),
            // Write the staging page to track/sector a/b
            3 => {
                port.set_dirty_led(true);
                write_page(drive, pages[3], a, b);
                port.set_dirty_led(false);
            }
            // Bump the head
            4 => {}
            // Read BAM: nothing to refresh on this medium
            5 => {}
            // Download a page from the host into the staging page
            6 => download_page(drive, port, pages),
            // Upload page b to the host
            7 => upload_page(drive, port, pages, b),
            // Drive-control register: report "write enabled"
            8 => {
                let mut bus = AtomicSection::enter(port);
                put_byte(&mut *bus, 0x10);
            }
            // Unload the drive code
            9 => return Ok(()),
            _ => {
                drive.set_error(ErrorCode::UnknownDriveCode);
                return Ok(());
            }
        }
    }
}

pub(crate) fn run(drive: &mut Drive, port: &mut dyn IecPort) {
    // The title's stage-two code reads two more sectors before the
    // first handshake
    port.delay_ms(500);

    let mut pages = [0usize; 4];
    for i in 0..pages.len() {
        match drive.buffers.allocate_system() {
            Some(idx) => pages[i] = idx,
            None => {
                for &idx in &pages[..i] {
                    let _ = drive.free_buffer(idx);
                }
                drive.set_error(ErrorCode::NoChannel);
                return;
            }
        }
    }

    let _ = serve(drive, port, &pages);

    port.set_data(true);
    port.set_clock(true);
    for idx in pages {
        let _ = drive.free_buffer(idx);
    }
    flash_leds(port);
}

#[cfg(test)]
mod tests {
    use super::*;
    use drive_dos::imagefs::ROOT_DIR;
    use drive_dos::{DriveConfig, FileOps, ImageFs, Medium, MemEeprom, Partition};
    use iec_bus::{BusState, IecLines};
    use std::collections::VecDeque;

    /// One host-side action in the scripted session.
    enum Op {
        /// Send `(a, b, c)`, then stream `payload` to the drive, then
        /// expect `recv` bytes back.
        Command {
            a: u8,
            b: u8,
            c: u8,
            payload: Vec<u8>,
            recv: usize,
        },
        /// Answer the ready-wiggle, then yank ATN instead of a command.
        AtnReset,
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mode {
        Idle,
        ClockAsserted { reset: bool },
        SendBits,
        Recv,
        Done,
    }

    /// Simulated C64 running the title's loader stub.
    ///
    /// Advances on every bus poll the drive makes. The lockstep byte
    /// transfer acts on every second poll, which matches the drive's
    /// wait-then-sample read pattern in both directions.
    struct AwHost {
        bus: BusState,
        script: VecDeque<Op>,
        mode: Mode,
        counter: u32,
        total_reads: u64,
        send_bits: VecDeque<bool>,
        recv_bits: Vec<bool>,
        received: Vec<u8>,
        pending_recv: usize,
        remaining_recv: usize,
        clock_low: bool,
    }

    impl AwHost {
        fn new(script: Vec<Op>) -> Self {
            Self {
                bus: BusState::new(),
                script: script.into(),
                mode: Mode::Idle,
                counter: 0,
                total_reads: 0,
                send_bits: VecDeque::new(),
                recv_bits: Vec::new(),
                received: Vec::new(),
                pending_recv: 0,
                remaining_recv: 0,
                clock_low: false,
            }
        }

        fn push_byte_bits(&mut self, byte: u8) {
            for i in (0..8).rev() {
                self.send_bits.push_back(byte >> i & 1 != 0);
            }
        }

        fn toggle_clock(&mut self) {
            self.clock_low = !self.clock_low;
            self.bus.set_host_clock(self.clock_low);
        }

        fn on_read(&mut self) {
            self.total_reads += 1;
            assert!(self.total_reads < 1_000_000, "bus stalled");

            self.counter += 1;
            match self.mode {
                Mode::Idle => {
                    if self.counter >= 4 {
                        self.counter = 0;
                        match self.script.pop_front() {
                            Some(Op::Command {
                                a,
                                b,
                                c,
                                payload,
                                recv,
                            }) => {
                                self.push_byte_bits(a);
                                self.push_byte_bits(b);
                                self.push_byte_bits(c);
                                for byte in payload {
                                    self.push_byte_bits(byte);
                                }
                                self.pending_recv = recv;
                                self.bus.set_host_clock(true);
                                self.clock_low = true;
                                self.mode = Mode::ClockAsserted { reset: false };
                            }
                            Some(Op::AtnReset) => {
                                self.bus.set_host_clock(true);
                                self.clock_low = true;
                                self.mode = Mode::ClockAsserted { reset: true };
                            }
                            None => {}
                        }
                    }
                }

                Mode::ClockAsserted { reset } => {
                    if self.counter >= 2 {
                        self.counter = 0;
                        if reset {
                            self.bus.set_host_atn(true);
                            self.mode = Mode::Done;
                        } else {
                            self.bus.set_host_clock(false);
                            self.clock_low = false;
                            self.mode = Mode::SendBits;
                        }
                    }
                }

                Mode::SendBits => {
                    if self.counter >= 2 {
                        self.counter = 0;
                        match self.send_bits.pop_front() {
                            Some(bit) => {
                                self.toggle_clock();
                                self.bus.set_host_data(bit);
                            }
                            None => {
                                // Everything sent: stop driving DATA so it
                                // doesn't shadow the drive's replies
                                self.bus.set_host_data(false);
                                if self.pending_recv > 0 {
                                    self.remaining_recv = self.pending_recv;
                                    self.pending_recv = 0;
                                    self.recv_bits.clear();
                                    self.mode = Mode::Recv;
                                } else {
                                    self.mode = Mode::Idle;
                                }
                            }
                        }
                    }
                }

                Mode::Recv => {
                    if self.counter >= 2 {
                        self.counter = 0;
                        self.recv_bits.push(!self.bus.data());
                        self.toggle_clock();
                        if self.recv_bits.len() == 8 {
                            let mut byte = 0u8;
                            for &bit in &self.recv_bits {
                                byte = byte << 1 | u8::from(bit);
                            }
                            self.received.push(byte);
                            self.recv_bits.clear();
                            self.remaining_recv -= 1;
                            if self.remaining_recv == 0 {
                                self.mode = Mode::Idle;
                            }
                        }
                    }
                }

                Mode::Done => {}
            }
        }
    }

    impl IecPort for AwHost {
        fn bus_read(&mut self) -> IecLines {
            self.on_read();
            self.bus.lines()
        }

        fn set_clock(&mut self, released: bool) {
            self.bus.set_drive_clock(!released);
        }

        fn set_data(&mut self, released: bool) {
            self.bus.set_drive_data(!released);
        }

        fn delay_us(&mut self, _us: u32) {}

        fn delay_ms(&mut self, _ms: u32) {}
    }

    fn make_drive(fs: ImageFs) -> Drive {
        Drive::new(
            DriveConfig::default(),
            vec![Partition::new(Box::new(fs), Medium::Image)],
            Box::new(MemEeprom::new()),
        )
    }

    #[test]
    fn read_sector_and_upload_page() {
        let mut fs = ImageFs::new();
        let mut sector = [0u8; 256];
        for (i, b) in sector.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        fs.write_sector(5, 3, &sector).expect("seed");
        let mut drive = make_drive(fs);

        let mut host = AwHost::new(vec![
            // Read track 5 sector 3 into the staging page
            Op::Command { a: 5, b: 3, c: 2, payload: vec![], recv: 0 },
            // Upload page $07 back to the host
            Op::Command { a: 0, b: 7, c: 14, payload: vec![], recv: 256 },
            // Unload
            Op::Command { a: 0, b: 0, c: 18, payload: vec![], recv: 0 },
        ]);

        run(&mut drive, &mut host);

        assert_eq!(host.received.len(), 256);
        assert_eq!(host.received, sector.to_vec());
        assert_eq!(drive.current_status().code, ErrorCode::Ok);
        // All four page buffers are gone again
        assert!(drive.buffers.allocated_indices(false).is_empty());
    }

    #[test]
    fn sector_chain_transfer() {
        let mut fs = ImageFs::new();
        let content: Vec<u8> = (0..600u32).map(|i| (i % 241) as u8).collect();
        let (t, s) = fs.add_file(ROOT_DIR, b"LEVEL", &content).expect("file");
        let mut drive = make_drive(fs);

        // 600 bytes span three sectors; each sector moves 254 payload
        // bytes plus the next-track byte
        let mut host = AwHost::new(vec![
            Op::Command { a: t, b: s, c: 0, payload: vec![], recv: 3 * 255 },
            Op::Command { a: 0, b: 0, c: 18, payload: vec![], recv: 0 },
        ]);

        run(&mut drive, &mut host);

        assert_eq!(host.received.len(), 3 * 255);
        // First sector payload arrives verbatim
        assert_eq!(&host.received[..254], &content[..254]);
        // Chain terminator after the last sector
        assert_eq!(*host.received.last().expect("bytes"), 0);
    }

    #[test]
    fn download_copy_write_cycle() {
        let mut drive = make_drive(ImageFs::new());
        let payload: Vec<u8> = (0..256u32).map(|i| (255 - i) as u8).collect();

        let mut host = AwHost::new(vec![
            // Download the page into $07
            Op::Command { a: 0, b: 7, c: 12, payload: payload.clone(), recv: 0 },
            // Copy $07 to $04
            Op::Command { a: 0, b: 4, c: 4, payload: vec![], recv: 0 },
            // Write $07 to track 10 sector 1
            Op::Command { a: 10, b: 1, c: 6, payload: vec![], recv: 0 },
            // Upload $04 - proves the copy, not just the download
            Op::Command { a: 0, b: 4, c: 14, payload: vec![], recv: 256 },
            Op::Command { a: 0, b: 0, c: 18, payload: vec![], recv: 0 },
        ]);

        run(&mut drive, &mut host);

        assert_eq!(host.received, payload);
        let mut sector = [0u8; 256];
        drive.partitions[0]
            .fs
            .read_sector(10, 1, &mut sector)
            .expect("read");
        assert_eq!(sector.to_vec(), payload);
    }

    #[test]
    fn drive_control_register_constant() {
        let mut drive = make_drive(ImageFs::new());
        let mut host = AwHost::new(vec![
            Op::Command { a: 0, b: 0, c: 16, payload: vec![], recv: 1 },
            Op::Command { a: 0, b: 0, c: 18, payload: vec![], recv: 0 },
        ]);
        run(&mut drive, &mut host);
        assert_eq!(host.received, vec![0x10]);
    }

    #[test]
    fn atn_reset_is_a_clean_exit() {
        let mut drive = make_drive(ImageFs::new());
        let mut host = AwHost::new(vec![Op::AtnReset]);
        run(&mut drive, &mut host);

        // Bus reset is not an error, and the loader buffers are gone
        assert_eq!(drive.current_status().code, ErrorCode::Ok);
        assert!(drive.buffers.allocated_indices(false).is_empty());
    }

    #[test]
    fn unknown_opcode_reports_drivecode() {
        let mut drive = make_drive(ImageFs::new());
        let mut host = AwHost::new(vec![Op::Command {
            a: 0,
            b: 0,
            c: 20,
            payload: vec![],
            recv: 0,
        }]);
        run(&mut drive, &mut host);
        assert_eq!(drive.current_status().code, ErrorCode::UnknownDriveCode);
        assert!(drive.buffers.allocated_indices(false).is_empty());
    }
}
