use std::fs;

use crate::error::CoreError;

/// Free and total byte counts for one memory tier.
#[derive(Clone, Copy, Debug)]
pub struct MemoryInfo {
    pub free: usize,
    pub total: usize,
}

/// Reads host memory availability from `/proc/meminfo`.
///
/// Used to cap the host block pool so a large
/// `block_host_memory_factor` cannot oversubscribe the machine.
pub fn host_memory_info() -> Result<MemoryInfo, CoreError> {
    let raw = fs::read_to_string("/proc/meminfo")
        .map_err(|e| CoreError::Runtime(format!("failed to read /proc/meminfo: {e}")))?;

    let mut free = None;
    let mut total = None;
    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_kb(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            free = parse_kb(rest);
        }
    }

    match (free, total) {
        (Some(free), Some(total)) => Ok(MemoryInfo { free, total }),
        _ => Err(CoreError::Runtime("failed to get host memory info".into())),
    }
}

/// Memory availability of one accelerator.
///
/// The host-backed build reports the host numbers; an accelerator
/// backend replaces this with its device query.
pub fn device_memory_info(_device_id: u32) -> Result<MemoryInfo, CoreError> {
    host_memory_info()
}

fn parse_kb(rest: &str) -> Option<usize> {
    let kb: usize = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
    Some(kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_memory_info_is_sane() {
        let info = host_memory_info().unwrap();
        assert!(info.total > 0);
        assert!(info.free <= info.total);
    }
}
