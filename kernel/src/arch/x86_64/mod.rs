/// x86_64 platform glue: port I/O, the COM1 console and logger, and the
/// TSC clock the disk layer uses for idle cache invalidation.
pub mod cpu;
pub mod serial;
pub mod timer;

use alloc::boxed::Box;

use crate::time::TimeSource;

/// Bring up the console, route `log` to it and calibrate the clock.
///
/// Returns the clock to install with `Kernel::install_clock`.
pub fn init_platform(level: log::LevelFilter) -> Box<dyn TimeSource> {
    serial::SERIAL.lock().init();
    serial::init_logger(level);
    timer::calibrate_tsc();
    log::debug!(target: "platform", "tsc at {} kHz", timer::tsc_per_ms());
    Box::new(timer::TscClock)
}

#[inline(always)]
pub fn outb(port: u16, val: u8) {
    unsafe {
        core::arch::asm!(
            "out dx, al",
            in("dx") port,
            in("al") val,
            options(nostack, preserves_flags),
        );
    }
}

#[inline(always)]
pub fn inb(port: u16) -> u8 {
    let val: u8;
    unsafe {
        core::arch::asm!(
            "in al, dx",
            in("dx") port,
            out("al") val,
            options(nostack, preserves_flags),
        );
    }
    val
}
