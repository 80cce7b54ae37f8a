/// Boot-time configuration consumed by the core.
///
/// The environment store lives outside this crate; whoever owns it copies
/// the relevant values in here.
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;

/// Idle period after which cached sectors are considered stale.
pub const DEFAULT_CACHE_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Clone)]
pub struct BootConfig {
    /// Device used when a device name is empty, e.g. `hd0,msdos1`.
    pub root: Option<String>,
    /// Directory modules are loaded from, e.g. `(hd0,msdos1)/boot`.
    pub prefix: Option<String>,
    pub target_cpu: String,
    pub platform: String,
    pub cache_timeout_ms: u64,
    /// Values of `.module_license` a module may carry.
    pub accepted_licenses: Vec<String>,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            root: None,
            prefix: None,
            target_cpu: "x86_64".to_string(),
            platform: "efi".to_string(),
            cache_timeout_ms: DEFAULT_CACHE_TIMEOUT_MS,
            accepted_licenses: vec![
                "LICENSE=GPLv3".to_string(),
                "LICENSE=GPLv3+".to_string(),
                "LICENSE=GPLv2+".to_string(),
            ],
        }
    }
}

impl BootConfig {
    /// Directory holding modules for this cpu/platform pair.
    pub fn module_dir(&self) -> Option<String> {
        self.prefix
            .as_ref()
            .map(|prefix| alloc::format!("{}/{}-{}", prefix, self.target_cpu, self.platform))
    }
}
