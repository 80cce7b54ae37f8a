/// COM1 console and the `log` backend that writes to it.
use core::fmt;
use spin::Mutex;

const COM1: u16 = 0x3F8;

pub static SERIAL: Mutex<Serial> = Mutex::new(Serial::new(COM1));

pub struct Serial {
    port: u16,
}

impl Serial {
    pub const fn new(port: u16) -> Self {
        Self { port }
    }

    /// 115200 baud, 8N1, FIFO on, interrupts off.
    pub fn init(&self) {
        super::outb(self.port + 1, 0x00);
        super::outb(self.port + 3, 0x80);
        super::outb(self.port, 0x01);
        super::outb(self.port + 1, 0x00);
        super::outb(self.port + 3, 0x03);
        super::outb(self.port + 2, 0xC7);
        super::outb(self.port + 4, 0x03);
    }

    fn transmit_empty(&self) -> bool {
        super::inb(self.port + 5) & 0x20 != 0
    }

    pub fn write_byte(&self, byte: u8) {
        while !self.transmit_empty() {
            core::hint::spin_loop();
        }
        super::outb(self.port, byte);
    }
}

impl fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        {
            use core::fmt::Write;
            let mut serial = $crate::arch::x86_64::serial::SERIAL.lock();
            let _ = write!(serial, $($arg)*);
        }
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => {
        $crate::serial_print!("{}\n", format_args!($($arg)*))
    };
}

// ---- Logger ----

/// Writes each record as `[level target] message`.
pub struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            crate::serial_println!("[{} {}] {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Route `log` to the serial console. Only the first call takes effect.
pub fn init_logger(level: log::LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
