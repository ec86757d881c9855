//! IEC serial bus line model and hardware port facade.
//!
//! Three open-collector lines: ATN, CLOCK, DATA. Each participant (host
//! computer and drive) can independently pull a line low. A line reads high
//! only when nobody pulls it low. This matches real hardware where each line
//! has a pull-up resistor and any device can ground it.
//!
//! [`IecPort`] is the seam between protocol code and the board: reading the
//! line states, driving CLOCK/DATA, microsecond delays, the interrupt lock
//! used around timing-critical handshakes, and the two status LEDs.
//! [`BusState`] resolves the pull-downs of both participants into line
//! levels and backs the simulated hosts in the loader tests.

use bitflags::bitflags;

bitflags! {
    /// Snapshot of the three bus lines. A set bit means the line is
    /// released (reads high); a cleared bit means somebody pulls it low.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IecLines: u8 {
        const ATN   = 0b001;
        const CLOCK = 0b010;
        const DATA  = 0b100;
    }
}

impl IecLines {
    /// ATN line level. `true` = released (high).
    #[must_use]
    pub fn atn(self) -> bool {
        self.contains(Self::ATN)
    }

    /// CLOCK line level. `true` = released (high).
    #[must_use]
    pub fn clock(self) -> bool {
        self.contains(Self::CLOCK)
    }

    /// DATA line level. `true` = released (high).
    #[must_use]
    pub fn data(self) -> bool {
        self.contains(Self::DATA)
    }
}

/// Hardware port the drive core runs against.
///
/// Open-collector semantics for the output lines: passing `true` releases
/// the line (pull-up wins), passing `false` asserts it low.
///
/// `bus_read` takes `&mut self` so that test doubles can advance a
/// simulated host on every poll; real implementations just sample pins.
pub trait IecPort {
    /// Sample all three bus lines.
    fn bus_read(&mut self) -> IecLines;

    /// Drive the CLOCK line. `true` releases, `false` asserts low.
    fn set_clock(&mut self, released: bool);

    /// Drive the DATA line. `true` releases, `false` asserts low.
    fn set_data(&mut self, released: bool);

    /// Busy-wait for the given number of microseconds.
    fn delay_us(&mut self, us: u32);

    /// Busy-wait for the given number of milliseconds.
    fn delay_ms(&mut self, ms: u32);

    /// Disable interrupts. Paired with [`IecPort::irq_enable`]; protocol
    /// code uses [`AtomicSection`] instead of calling these directly.
    fn irq_disable(&mut self) {}

    /// Re-enable interrupts.
    fn irq_enable(&mut self) {}

    /// Whether the MCU clock source is accurate enough for loaders with
    /// fixed-delay bit timing.
    fn timing_stable(&self) -> bool {
        true
    }

    /// Busy LED (command / transfer in progress).
    fn set_busy_led(&mut self, _on: bool) {}

    /// Dirty LED (unflushed write data).
    fn set_dirty_led(&mut self, _on: bool) {}
}

/// Interrupt-locked scope around a timing-critical handshake.
///
/// Interrupts are disabled on construction and re-enabled when the section
/// is dropped, on every exit path. Filesystem and allocator calls belong
/// outside the section; code inside only has the port itself to work with.
pub struct AtomicSection<'a, P: IecPort + ?Sized> {
    port: &'a mut P,
}

impl<'a, P: IecPort + ?Sized> AtomicSection<'a, P> {
    /// Enter the section, disabling interrupts.
    pub fn enter(port: &'a mut P) -> Self {
        port.irq_disable();
        Self { port }
    }
}

impl<P: IecPort + ?Sized> Drop for AtomicSection<'_, P> {
    fn drop(&mut self) {
        self.port.irq_enable();
    }
}

impl<P: IecPort + ?Sized> core::ops::Deref for AtomicSection<'_, P> {
    type Target = P;

    fn deref(&self) -> &P {
        self.port
    }
}

impl<P: IecPort + ?Sized> core::ops::DerefMut for AtomicSection<'_, P> {
    fn deref_mut(&mut self) -> &mut P {
        self.port
    }
}

/// IEC bus with two participants: host and drive.
///
/// Tracks which side pulls which line low and resolves the wired-AND line
/// levels. Simulated hosts embed one of these and expose the drive side
/// through [`IecPort`].
#[derive(Default)]
pub struct BusState {
    /// ATN pull-down: [host, drive]. true = pulling low.
    atn_pulls: [bool; 2],
    /// CLOCK pull-down: [host, drive].
    clock_pulls: [bool; 2],
    /// DATA pull-down: [host, drive].
    data_pulls: [bool; 2],
}

impl BusState {
    /// Create a bus with all lines released (high).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // --- Host side ---

    /// Set whether the host pulls ATN low.
    pub fn set_host_atn(&mut self, pull_low: bool) {
        self.atn_pulls[0] = pull_low;
    }

    /// Set whether the host pulls CLOCK low.
    pub fn set_host_clock(&mut self, pull_low: bool) {
        self.clock_pulls[0] = pull_low;
    }

    /// Set whether the host pulls DATA low.
    pub fn set_host_data(&mut self, pull_low: bool) {
        self.data_pulls[0] = pull_low;
    }

    // --- Drive side ---

    /// Set whether the drive pulls CLOCK low.
    pub fn set_drive_clock(&mut self, pull_low: bool) {
        self.clock_pulls[1] = pull_low;
    }

    /// Set whether the drive pulls DATA low.
    pub fn set_drive_data(&mut self, pull_low: bool) {
        self.data_pulls[1] = pull_low;
    }

    // --- Line state (true = high, false = low) ---

    /// ATN line state. High when nobody pulls it low.
    #[must_use]
    pub fn atn(&self) -> bool {
        !self.atn_pulls[0] && !self.atn_pulls[1]
    }

    /// CLOCK line state. High when nobody pulls it low.
    #[must_use]
    pub fn clock(&self) -> bool {
        !self.clock_pulls[0] && !self.clock_pulls[1]
    }

    /// DATA line state. High when nobody pulls it low.
    #[must_use]
    pub fn data(&self) -> bool {
        !self.data_pulls[0] && !self.data_pulls[1]
    }

    /// Resolve all three lines into an [`IecLines`] snapshot.
    #[must_use]
    pub fn lines(&self) -> IecLines {
        let mut lines = IecLines::empty();
        if self.atn() {
            lines |= IecLines::ATN;
        }
        if self.clock() {
            lines |= IecLines::CLOCK;
        }
        if self.data() {
            lines |= IecLines::DATA;
        }
        lines
    }
}

/// Port with no host attached: reads reflect only the drive's own
/// pull-downs, delays return immediately. Useful for bring-up and for
/// exercising command paths that never touch the bus.
#[derive(Default)]
pub struct LoopbackPort {
    bus: BusState,
    /// Nesting depth of interrupt-disable requests.
    pub irq_depth: u32,
    /// Milliseconds accumulated through `delay_ms`.
    pub slept_ms: u32,
}

impl LoopbackPort {
    /// Create a loopback port with all lines released.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl IecPort for LoopbackPort {
    fn bus_read(&mut self) -> IecLines {
        self.bus.lines()
    }

    fn set_clock(&mut self, released: bool) {
        self.bus.set_drive_clock(!released);
    }

    fn set_data(&mut self, released: bool) {
        self.bus.set_drive_data(!released);
    }

    fn delay_us(&mut self, _us: u32) {}

    fn delay_ms(&mut self, ms: u32) {
        self.slept_ms += ms;
    }

    fn irq_disable(&mut self) {
        self.irq_depth += 1;
    }

    fn irq_enable(&mut self) {
        self.irq_depth -= 1;
    }
}
