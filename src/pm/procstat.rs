use std::fs;

/// Point-in-time `/proc` sample for one pid.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcSample {
    pub rss_bytes: Option<u64>,
    /// Average CPU use over the process lifetime, in percent of one core.
    pub cpu_percent: Option<f64>,
    pub uptime_ms: Option<i64>,
}

pub(crate) fn clock_ticks_per_second() -> Option<f64> {
    let v = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if v <= 0 { None } else { Some(v as f64) }
}

fn page_size() -> Option<u64> {
    let v = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if v <= 0 { None } else { Some(v as u64) }
}

pub(crate) fn read_system_uptime_seconds() -> Option<f64> {
    let s = fs::read_to_string("/proc/uptime").ok()?;
    let first = s.split_whitespace().next()?;
    first.parse::<f64>().ok()
}

/// Fields of `/proc/<pid>/stat` after the command name; index 0 is the state (field 3).
fn read_stat_fields(pid: u32) -> Option<Vec<String>> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let rparen = stat.rfind(')')?;
    let after = stat.get(rparen + 2..)?;
    Some(after.split_whitespace().map(|s| s.to_string()).collect())
}

fn field_u64(fields: &[String], stat_index: usize) -> Option<u64> {
    fields.get(stat_index - 3)?.parse().ok()
}

pub(crate) fn pid_uptime_ms(pid: u32, sys_uptime_s: Option<f64>, hz: Option<f64>) -> Option<i64> {
    let sys_uptime_s = sys_uptime_s?;
    let hz = hz?;
    let start_ticks = field_u64(&read_stat_fields(pid)?, 22)?;
    let started_s = (start_ticks as f64) / hz;
    let up_s = (sys_uptime_s - started_s).max(0.0);
    Some((up_s * 1000.0).round() as i64)
}

/// Resident set size from `/proc/<pid>/statm`.
pub fn rss_bytes(pid: u32) -> Option<u64> {
    let s = fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let resident: u64 = s.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident * page_size()?)
}

fn cpu_percent(fields: &[String], sys_uptime_s: f64, hz: f64) -> Option<f64> {
    let utime = field_u64(fields, 14)?;
    let stime = field_u64(fields, 15)?;
    let start = field_u64(fields, 22)?;
    let elapsed_s = sys_uptime_s - (start as f64) / hz;
    if elapsed_s <= 0.0 {
        return Some(0.0);
    }
    let busy_s = (utime + stime) as f64 / hz;
    Some(((busy_s / elapsed_s) * 1000.0).round() / 10.0)
}

pub fn sample(pid: u32) -> ProcSample {
    let hz = clock_ticks_per_second();
    let up = read_system_uptime_seconds();
    let cpu = match (read_stat_fields(pid), up, hz) {
        (Some(f), Some(up), Some(hz)) => cpu_percent(&f, up, hz),
        _ => None,
    };
    ProcSample {
        rss_bytes: rss_bytes(pid),
        cpu_percent: cpu,
        uptime_ms: pid_uptime_ms(pid, up, hz),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_sampled() {
        let s = sample(std::process::id());
        assert!(s.rss_bytes.unwrap_or(0) > 0);
        assert!(s.uptime_ms.unwrap_or(-1) >= 0);
        assert!(s.cpu_percent.is_some());
    }

    #[test]
    fn missing_pid_samples_empty() {
        assert_eq!(sample(u32::MAX - 1), ProcSample::default());
    }
}
