/// Container-aware CPU limit detection for sizing the tokio worker thread
/// pool. Probe workers are I/O bound, but a 4-core cgroup on a 64-core host
/// should still not get 64 runtime threads.
///
/// Detection order: `NUMPROBE_CPU_LIMIT` env var (supports "4" or "4000m"),
/// cgroup v2 `cpu.max`, then host CPU count.
pub fn worker_thread_count() -> usize {
    if let Ok(limit) = std::env::var("NUMPROBE_CPU_LIMIT") {
        if let Some(cores) = parse_cpu_value(&limit) {
            return cores.max(1);
        }
    }

    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(cores) = parse_cgroup_cpu(&max) {
            return cores.max(1);
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// "4" (cores) or "4000m" (millicores).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    if let Some(millicores) = value.strip_suffix('m') {
        millicores.parse::<usize>().ok().map(|m| m / 1000)
    } else {
        value.parse::<usize>().ok()
    }
}

/// cgroup v2 `cpu.max` format: "quota period" or "max period".
fn parse_cgroup_cpu(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?;
    if quota == "max" {
        return None;
    }
    let quota: i64 = quota.parse().ok()?;
    let period: i64 = period.parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period) as usize)
    } else {
        None
    }
}
