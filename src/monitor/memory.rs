//! Process memory sampling through `sysinfo`.

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// One memory reading of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemorySample {
    /// Milliseconds since the monitor started.
    pub at_ms: u64,
    /// Resident set size in bytes.
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
}

/// Reads this process's memory usage.
pub(crate) struct MemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl MemoryProbe {
    pub(crate) fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// `(rss, virtual)` in bytes, or `None` where the platform hides them.
    pub(crate) fn read(&self) -> Option<(u64, u64)> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let process = system.process(pid)?;
        Some((process.memory(), process.virtual_memory()))
    }
}

/// Format a byte count as `12.3 MiB`.
pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
