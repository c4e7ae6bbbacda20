//! the character sink
//!
//! the kernel core doesn't know how to draw text; the platform registers
//! whatever it has (VGA text buffer, serial port) here once at startup, and
//! the write/paint syscalls go through it

use core::fmt::{self, Write};
use spin::Once;

/// what the platform's display can do for us
pub trait Console: Sync {
    /// writes a string at the cursor
    fn write_str(&self, s: &str);

    /// repaints the colour attribute of the cell at (x, y)
    fn paint(&self, x: usize, y: usize, colour: u8);
}

static CONSOLE: Once<&'static dyn Console> = Once::new();

/// registers the platform's sink; later registrations are ignored
pub fn set_console(console: &'static dyn Console) {
    CONSOLE.call_once(|| console);
}

pub fn get_console() -> Option<&'static dyn Console> {
    CONSOLE.get().copied()
}

/// adapter so `core::fmt` can drive the sink
struct ConsoleWriter;

impl Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Some(console) = get_console() {
            console.write_str(s);
        }
        Ok(())
    }
}

pub fn write(s: &str) {
    if let Some(console) = get_console() {
        console.write_str(s);
    }
}

/// writes `value` in base 16
pub fn write_hex(value: usize) {
    let _ = write!(ConsoleWriter, "{value:x}");
}

/// writes `value` in base 10
pub fn write_dec(value: usize) {
    let _ = write!(ConsoleWriter, "{value}");
}

pub fn paint(x: usize, y: usize, colour: u8) {
    if let Some(console) = get_console() {
        console.paint(x, y, colour);
    }
}
