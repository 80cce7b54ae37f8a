/// Millisecond clock used by the disk layer's idle-cache policy.
///
/// The platform installs a source once during early init; until then the
/// clock reads zero.
use alloc::boxed::Box;

/// A monotonic millisecond counter.
pub trait TimeSource {
    fn now_ms(&self) -> u64;
}

impl<F: Fn() -> u64> TimeSource for F {
    fn now_ms(&self) -> u64 {
        self()
    }
}

#[derive(Default)]
pub struct Clock {
    source: Option<Box<dyn TimeSource>>,
}

impl Clock {
    pub fn new() -> Self {
        Self { source: None }
    }

    /// Install (or replace) the time source.
    pub fn install(&mut self, source: Box<dyn TimeSource>) {
        self.source = Some(source);
    }

    pub fn is_installed(&self) -> bool {
        self.source.is_some()
    }

    pub fn now_ms(&self) -> u64 {
        self.source.as_ref().map_or(0, |s| s.now_ms())
    }
}
