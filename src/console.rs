//! Console log sink for swapvm
//!
//! Backs the `log` facade. Records are formatted into fixed-size lines and
//! kept in a ring of the most recent `LOG_LINES` entries, so a panic handler
//! or a test can dump what the pager was doing. On a RISC-V kernel build the
//! lines also go out on the UART.

use core::fmt::{self, Write};
use heapless::{Deque, String};
use log::{LevelFilter, Log, Metadata, Record};
use spin::{Mutex, Once};

/// Lines kept in the ring
pub const LOG_LINES: usize = 64;

/// Bytes per line; longer records are cut
pub const LINE_LEN: usize = 160;

pub type LogLine = String<LINE_LEN>;

// xv6 UART0 on the QEMU virt machine
#[cfg(all(target_arch = "riscv64", not(test)))]
const UART_BASE: usize = 0x1000_0000;

#[cfg(all(target_arch = "riscv64", not(test)))]
struct Uart {
    base: usize,
}

#[cfg(all(target_arch = "riscv64", not(test)))]
impl Uart {
    const fn new(base: usize) -> Self {
        Self { base }
    }

    unsafe fn putc(&self, c: u8) {
        let ptr = self.base as *mut u8;
        ptr.write_volatile(c);
    }

    fn puts(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                unsafe { self.putc(b'\r') };
            }
            unsafe { self.putc(byte) };
        }
    }
}

/// Writes into a line, dropping whatever does not fit
struct Truncating<'a>(&'a mut LogLine);

impl Write for Truncating<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            if self.0.push(c).is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Ring of recent log lines
pub struct Console {
    lines: Mutex<Deque<LogLine, LOG_LINES>>,
}

impl Console {
    pub const fn new() -> Self {
        Self {
            lines: Mutex::new(Deque::new()),
        }
    }

    /// Append a line, dropping the oldest when full
    pub fn push(&self, line: LogLine) {
        let mut lines = self.lines.lock();
        if lines.is_full() {
            lines.pop_front();
        }
        let _ = lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    /// Visit the buffered lines, oldest first
    pub fn for_each(&self, mut f: impl FnMut(&str)) {
        for line in self.lines.lock().iter() {
            f(line.as_str());
        }
    }

    /// Any buffered line containing `needle`?
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|line| line.contains(needle))
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for Console {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut line = LogLine::new();
        let _ = write!(
            Truncating(&mut line),
            "[{:<5} {}] {}",
            record.level(),
            record.target(),
            record.args()
        );

        #[cfg(all(target_arch = "riscv64", not(test)))]
        {
            let uart = Uart::new(UART_BASE);
            uart.puts(line.as_str());
            uart.puts("\n");
        }

        self.push(line);
    }

    fn flush(&self) {}
}

/// Global console
static CONSOLE: Console = Console::new();
static LOGGER: Once<bool> = Once::new();

/// Install the console as the `log` backend and set the level.
///
/// Returns false if another logger was installed first.
pub fn init(level: LevelFilter) -> bool {
    let installed = *LOGGER.call_once(|| log::set_logger(&CONSOLE).is_ok());
    log::set_max_level(level);
    installed
}

/// The global console
pub fn console() -> &'static Console {
    &CONSOLE
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    fn record(console: &Console, level: Level, msg: fmt::Arguments) {
        console.log(
            &Record::builder()
                .args(msg)
                .level(level)
                .target("swapvm::test")
                .build(),
        );
    }

    #[test]
    fn test_format() {
        log::set_max_level(LevelFilter::Trace);
        let console = Console::new();
        record(&console, Level::Warn, format_args!("slot {} failed", 3));
        assert!(console.contains("[WARN  swapvm::test] slot 3 failed"));
    }

    #[test]
    fn test_ring_drops_oldest() {
        log::set_max_level(LevelFilter::Trace);
        let console = Console::new();
        for i in 0..LOG_LINES + 3 {
            record(&console, Level::Error, format_args!("line {}", i));
        }
        assert_eq!(console.len(), LOG_LINES);

        let mut first = LogLine::new();
        console.for_each(|line| {
            if first.is_empty() {
                let _ = first.push_str(line);
            }
        });
        assert!(first.ends_with("line 3"));
    }

    #[test]
    fn test_long_line_truncated() {
        log::set_max_level(LevelFilter::Trace);
        let console = Console::new();
        let long = [b'x'; 400];
        let text = core::str::from_utf8(&long).unwrap();
        record(&console, Level::Error, format_args!("{}", text));
        console.for_each(|line| assert_eq!(line.len(), LINE_LEN));
    }

    #[test]
    fn test_init_is_idempotent() {
        let first = init(LevelFilter::Info);
        let second = init(LevelFilter::Info);
        assert_eq!(first, second);
    }
}
