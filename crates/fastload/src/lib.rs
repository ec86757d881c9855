//! Fast-loader protocol state machines.
//!
//! A title uploads its drive code through memory writes; the command
//! parser fingerprints the stream and arms the matching loader. Once the
//! host releases ATN, [`run_pending`] hands control to that loader's
//! routine, which bit-bangs CLOCK/DATA in its own dialect until the title
//! exits the loader or the host yanks ATN (bus reset).
//!
//! Every loader shares the escape contract: ATN asserted outside an
//! expected handshake ends the session cleanly — release both lines,
//! free the loader's buffers, flash both LEDs as a visual cue. Protocol
//! violations additionally report UNKNOWN DRIVE CODE.

use drive_dos::{Drive, LoaderKind};
use iec_bus::IecPort;
use log::warn;

mod anotherworld;
mod iffl;
mod wingsoffury;

/// The host asserted ATN outside a handshake: leave the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Abort;

/// Run the armed loader, if any. Control transfers only once the host
/// has released ATN; with ATN still low the loader stays pending and
/// the call returns `false`.
pub fn run_pending(drive: &mut Drive, port: &mut dyn IecPort) -> bool {
    if drive.state.pending_loader.is_none() {
        return false;
    }
    if !port.bus_read().atn() {
        return false;
    }
    let kind = drive
        .state
        .pending_loader
        .take()
        .expect("pending loader checked above");
    run_loader(kind, drive, port);
    true
}

/// Dispatch one loader routine to completion.
pub fn run_loader(kind: LoaderKind, drive: &mut Drive, port: &mut dyn IecPort) {
    match kind {
        LoaderKind::AnotherWorld => anotherworld::run(drive, port),
        LoaderKind::IfflScan => iffl::scan(drive, port),
        LoaderKind::IfflLoad => iffl::run(drive, port),
        LoaderKind::WingsOfFury => wingsoffury::run(drive, port),
        LoaderKind::Turbodisk => {
            // Detection keeps the upload sequence happy, but the byte
            // protocol itself is not implemented
            warn!("turbodisk transfer requested, not implemented");
        }
    }
}

/// Visual cue that a loader session ended.
pub(crate) fn flash_leds(port: &mut dyn IecPort) {
    port.set_dirty_led(true);
    port.set_busy_led(true);
    port.delay_ms(200);
    port.set_dirty_led(false);
    port.set_busy_led(false);
}
