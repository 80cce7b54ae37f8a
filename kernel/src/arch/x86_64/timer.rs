/// Millisecond clock from the TSC, calibrated against PIT channel 2.
///
/// Channel 2 is driven through the speaker gate in one-shot mode, so no
/// interrupt is needed: count TSC ticks while the PIT counts down ~10 ms.
use core::sync::atomic::{AtomicU64, Ordering};

use super::cpu::{has_invariant_tsc, rdtsc};
use super::{inb, outb};
use crate::time::TimeSource;

/// Assume 2 GHz until calibrated.
static TSC_PER_MS: AtomicU64 = AtomicU64::new(2_000_000);
static BOOT_TSC: AtomicU64 = AtomicU64::new(0);

const PIT_CH2_DATA: u16 = 0x42;
const PIT_CMD: u16 = 0x43;
const PIT_GATE: u16 = 0x61;
const PIT_FREQ: u64 = 1_193_182;

/// Counter value for a ~10 ms window.
const CALIBRATION_COUNT: u16 = 11_932;

/// Must run during early init with interrupts disabled.
pub fn calibrate_tsc() {
    let window_us = (CALIBRATION_COUNT as u64 * 1_000_000) / PIT_FREQ;

    // Gate low, speaker off.
    let gate = inb(PIT_GATE);
    outb(PIT_GATE, (gate & !0x02) | 0x01);

    // Channel 2, mode 0, lobyte/hibyte.
    outb(PIT_CMD, 0xB0);
    outb(PIT_CH2_DATA, (CALIBRATION_COUNT & 0xFF) as u8);
    outb(PIT_CH2_DATA, (CALIBRATION_COUNT >> 8) as u8);

    let gate = inb(PIT_GATE);
    outb(PIT_GATE, gate & !0x01);
    outb(PIT_GATE, gate | 0x01);

    let start = rdtsc();
    while inb(PIT_GATE) & 0x20 == 0 {
        core::hint::spin_loop();
    }
    let end = rdtsc();

    let per_ms = end.saturating_sub(start) * 1000 / window_us;
    if per_ms != 0 {
        TSC_PER_MS.store(per_ms, Ordering::Release);
    }
    BOOT_TSC.store(end, Ordering::Release);

    if !has_invariant_tsc() {
        log::warn!(target: "platform", "TSC is not invariant, cache timeouts may drift");
    }
}

pub fn tsc_per_ms() -> u64 {
    TSC_PER_MS.load(Ordering::Acquire)
}

/// Milliseconds since calibration.
pub fn monotonic_ms() -> u64 {
    let boot = BOOT_TSC.load(Ordering::Acquire);
    rdtsc().saturating_sub(boot) / tsc_per_ms().max(1)
}

/// `TimeSource` over `monotonic_ms`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TscClock;

impl TimeSource for TscClock {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }
}
