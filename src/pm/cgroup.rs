use crate::pm::config::MasterConfig;
use crate::pm::error::Advisory;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Per-instance cgroup-v2 memory ceilings.
///
/// Layout: `${cgroup_root}/${cgroup_name}/${namespace}-${instance}`. Every operation is
/// advisory: failures are logged and reported as `false`/`None`, never as errors, so the
/// supervisor keeps working on hosts without cgroup v2 or without delegation.
#[derive(Debug, Clone)]
pub struct MemoryLimiter {
    root: PathBuf,
    master: PathBuf,
    namespace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// `memory.current` in bytes.
    pub current: u64,
    /// `memory.max` in bytes; `None` when unlimited.
    pub max: Option<u64>,
    pub percent: Option<f64>,
}

fn write_file(path: &Path, content: &str) -> anyhow::Result<()> {
    // `create` is harmless on cgroupfs (files already exist) and keeps plain directories usable.
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| {
            anyhow::anyhow!(
                "open for write {} failed: kind={:?} os_error={:?} err={}",
                path.display(),
                e.kind(),
                e.raw_os_error(),
                e
            )
        })?;
    f.write_all(content.as_bytes()).map_err(|e| {
        anyhow::anyhow!(
            "write {} failed: kind={:?} os_error={:?} err={}",
            path.display(),
            e.kind(),
            e.raw_os_error(),
            e
        )
    })?;
    Ok(())
}

fn read_trimmed_opt(path: &Path) -> anyhow::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s.trim().to_string()).filter(|s| !s.is_empty())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

fn read_u64_opt(path: &Path) -> anyhow::Result<Option<u64>> {
    let Some(s) = read_trimmed_opt(path)? else {
        return Ok(None);
    };
    let v: u64 = s
        .parse()
        .with_context(|| format!("parse u64 from {}: {s}", path.display()))?;
    Ok(Some(v))
}

/// Pids listed in `cgroup.procs` (this cgroup only; a missing cgroup is empty).
pub(crate) fn list_pids(cgroup_dir: &Path) -> anyhow::Result<Vec<u32>> {
    let procs = cgroup_dir.join("cgroup.procs");
    let Some(s) = read_trimmed_opt(&procs)? else {
        return Ok(vec![]);
    };
    let mut out = Vec::new();
    for (idx, line) in s.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let pid: u32 = line
            .parse()
            .with_context(|| format!("parse pid from {} line {}: {line}", procs.display(), idx + 1))?;
        out.push(pid);
    }
    Ok(out)
}

fn enable_subtree_controllers(parent: &Path, wanted: &[&str]) -> anyhow::Result<()> {
    let controllers_path = parent.join("cgroup.controllers");
    let controllers = fs::read_to_string(&controllers_path)
        .with_context(|| format!("read {}", controllers_path.display()))?;
    let ops: Vec<String> = controllers
        .split_whitespace()
        .filter(|c| wanted.contains(c))
        .map(|c| format!("+{c}"))
        .collect();
    if ops.is_empty() {
        return Ok(());
    }
    let subtree_path = parent.join("cgroup.subtree_control");
    fs::write(&subtree_path, format!("{}\n", ops.join(" ")))
        .with_context(|| format!("write {}", subtree_path.display()))?;
    Ok(())
}

fn advisory(instance: &str, op: &str, e: impl std::fmt::Display) {
    let adv = Advisory::ResourceLimitUnavailable(format!("{op}: {e}"));
    tracing::warn!(target: "cgroup", app = instance, "{adv}");
}

impl MemoryLimiter {
    pub fn new(cfg: &MasterConfig) -> Self {
        Self::with_paths(&cfg.cgroup_root, &cfg.cgroup_name, &cfg.supervisor.namespace)
    }

    pub fn with_paths(root: &Path, name: &str, namespace: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            master: root.join(name),
            namespace: namespace.to_string(),
        }
    }

    pub fn group_dir(&self, instance: &str) -> PathBuf {
        self.master.join(format!("{}-{instance}", self.namespace))
    }

    /// True when the root exposes cgroup v2 with the memory controller. Pure query.
    pub fn is_available(&self) -> bool {
        fs::read_to_string(self.root.join("cgroup.controllers"))
            .map(|s| s.split_whitespace().any(|c| c == "memory"))
            .unwrap_or(false)
    }

    /// Create the instance group with `memory.max = mb` and `memory.high = 90%` of it.
    pub fn create_group(&self, instance: &str, memory_mb: u32) -> bool {
        if !self.is_available() {
            advisory(
                instance,
                "create_group",
                format!("no cgroup v2 memory controller under {}", self.root.display()),
            );
            return false;
        }
        match self.try_create_group(instance, memory_mb) {
            Ok(()) => {
                tracing::info!(
                    target: "cgroup",
                    app = instance,
                    "group=created dir={} memory_max_mb={memory_mb}",
                    self.group_dir(instance).display()
                );
                true
            }
            Err(e) => {
                advisory(instance, "create_group", format!("{e:#}"));
                false
            }
        }
    }

    fn try_create_group(&self, instance: &str, memory_mb: u32) -> anyhow::Result<()> {
        fs::create_dir_all(&self.master)
            .with_context(|| format!("create_dir_all {}", self.master.display()))?;
        // Delegation may already be in place (or owned by someone else); only the writes below are required.
        if let Err(e) = enable_subtree_controllers(&self.root, &["memory"]) {
            tracing::debug!(target: "cgroup", "enable memory controller at root skipped: {e:#}");
        }
        if let Err(e) = enable_subtree_controllers(&self.master, &["memory"]) {
            tracing::debug!(target: "cgroup", "enable memory controller at master skipped: {e:#}");
        }

        let dir = self.group_dir(instance);
        fs::create_dir_all(&dir).with_context(|| format!("create_dir_all {}", dir.display()))?;
        let max_bytes = u64::from(memory_mb) * 1024 * 1024;
        let high_bytes = max_bytes / 10 * 9;
        write_file(&dir.join("memory.max"), &format!("{max_bytes}\n"))
            .with_context(|| format!("set memory.max for {}", dir.display()))?;
        write_file(&dir.join("memory.high"), &format!("{high_bytes}\n"))
            .with_context(|| format!("set memory.high for {}", dir.display()))?;
        Ok(())
    }

    /// Remove the instance group. Absent groups count as removed.
    pub fn delete_group(&self, instance: &str) -> bool {
        let dir = self.group_dir(instance);
        if !dir.exists() {
            return true;
        }
        if fs::remove_dir(&dir).is_ok() {
            return true;
        }
        // Still populated: kill what is left, wait for the kernel to drain it, then retry.
        self.kill_all(instance);
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if list_pids(&dir).map(|p| p.is_empty()).unwrap_or(true) {
                break;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        match fs::remove_dir(&dir) {
            Ok(()) => true,
            Err(e) => {
                advisory(instance, "delete_group", format!("rmdir {}: {e}", dir.display()));
                false
            }
        }
    }

    /// Move `pid` into the instance group.
    pub fn assign_process(&self, instance: &str, pid: u32) -> bool {
        let dir = self.group_dir(instance);
        if !dir.is_dir() {
            advisory(instance, "assign_process", format!("group {} does not exist", dir.display()));
            return false;
        }
        match write_file(&dir.join("cgroup.procs"), &format!("{pid}\n")) {
            Ok(()) => true,
            Err(e) => {
                advisory(instance, "assign_process", format!("pid={pid} {e:#}"));
                false
            }
        }
    }

    pub fn get_memory_usage(&self, instance: &str) -> Option<MemoryUsage> {
        let dir = self.group_dir(instance);
        let current = read_u64_opt(&dir.join("memory.current")).ok().flatten()?;
        let max = read_trimmed_opt(&dir.join("memory.max"))
            .ok()
            .flatten()
            .and_then(|s| s.parse::<u64>().ok());
        let percent = max
            .filter(|m| *m > 0)
            .map(|m| ((current as f64 / m as f64) * 1000.0).round() / 10.0);
        Some(MemoryUsage {
            current,
            max,
            percent,
        })
    }

    /// `cgroup.procs` path when the group exists, for attaching children before exec.
    pub(crate) fn procs_file(&self, instance: &str) -> Option<PathBuf> {
        let dir = self.group_dir(instance);
        dir.is_dir().then(|| dir.join("cgroup.procs"))
    }

    /// Kill everything in the group through `cgroup.kill`. Best-effort.
    pub(crate) fn kill_all(&self, instance: &str) -> bool {
        let killf = self.group_dir(instance).join("cgroup.kill");
        if !killf.exists() {
            return false;
        }
        write_file(&killf, "1\n").is_ok()
    }
}
