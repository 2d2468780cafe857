use botmaster::pm::cgroup::MemoryLimiter;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn fake_root(root: &Path) {
    fs::create_dir_all(root).unwrap();
    fs::write(root.join("cgroup.controllers"), "cpuset cpu io memory pids\n").unwrap();
}

#[test]
fn create_group_writes_ceiling_and_soft_limit() {
    let tmp = TempDir::new().unwrap();
    fake_root(tmp.path());
    let l = MemoryLimiter::with_paths(tmp.path(), "botmaster", "bm");
    assert!(l.is_available());

    assert!(l.create_group("bot1", 100));
    let dir = l.group_dir("bot1");
    assert_eq!(dir, tmp.path().join("botmaster/bm-bot1"));
    let max = fs::read_to_string(dir.join("memory.max")).unwrap();
    let high = fs::read_to_string(dir.join("memory.high")).unwrap();
    assert_eq!(max.trim(), "104857600");
    assert_eq!(high.trim(), (104_857_600u64 / 10 * 9).to_string());
    assert_eq!(
        fs::read_to_string(tmp.path().join("cgroup.subtree_control")).unwrap().trim(),
        "+memory"
    );
}

#[test]
fn usage_reads_current_against_max() {
    let tmp = TempDir::new().unwrap();
    fake_root(tmp.path());
    let l = MemoryLimiter::with_paths(tmp.path(), "botmaster", "bm");
    assert!(l.create_group("bot1", 100));
    // No memory.current yet: nothing to report.
    assert!(l.get_memory_usage("bot1").is_none());

    fs::write(l.group_dir("bot1").join("memory.current"), "52428800\n").unwrap();
    let u = l.get_memory_usage("bot1").unwrap();
    assert_eq!(u.current, 52_428_800);
    assert_eq!(u.max, Some(104_857_600));
    assert_eq!(u.percent, Some(50.0));
}

#[test]
fn unlimited_group_has_no_percent() {
    let tmp = TempDir::new().unwrap();
    fake_root(tmp.path());
    let l = MemoryLimiter::with_paths(tmp.path(), "botmaster", "bm");
    assert!(l.create_group("bot1", 64));
    let dir = l.group_dir("bot1");
    fs::write(dir.join("memory.max"), "max\n").unwrap();
    fs::write(dir.join("memory.current"), "4096\n").unwrap();
    let u = l.get_memory_usage("bot1").unwrap();
    assert_eq!(u.max, None);
    assert_eq!(u.percent, None);
}

#[test]
fn assign_process_writes_pid_into_existing_group_only() {
    let tmp = TempDir::new().unwrap();
    fake_root(tmp.path());
    let l = MemoryLimiter::with_paths(tmp.path(), "botmaster", "bm");
    assert!(!l.assign_process("bot1", 4242));

    assert!(l.create_group("bot1", 64));
    assert!(l.assign_process("bot1", 4242));
    let procs = fs::read_to_string(l.group_dir("bot1").join("cgroup.procs")).unwrap();
    assert_eq!(procs.trim(), "4242");
}

#[test]
fn delete_group_removes_empty_and_absent_groups() {
    let tmp = TempDir::new().unwrap();
    fake_root(tmp.path());
    let l = MemoryLimiter::with_paths(tmp.path(), "botmaster", "bm");
    assert!(l.delete_group("never-created"));

    // The kernel owns the interface files on cgroupfs; a bare directory stands in here.
    fs::create_dir_all(l.group_dir("bot1")).unwrap();
    assert!(l.delete_group("bot1"));
    assert!(!l.group_dir("bot1").exists());
}

#[test]
fn hosts_without_memory_controller_degrade_to_no_ops() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("cgroup.controllers"), "cpu io pids\n").unwrap();
    let l = MemoryLimiter::with_paths(tmp.path(), "botmaster", "bm");
    assert!(!l.is_available());
    assert!(!l.create_group("bot1", 100));
    assert!(!l.group_dir("bot1").exists());
    assert!(!l.assign_process("bot1", 1));
    assert!(l.get_memory_usage("bot1").is_none());

    let missing = MemoryLimiter::with_paths(&tmp.path().join("nope"), "botmaster", "bm");
    assert!(!missing.is_available());
    assert!(!missing.create_group("bot1", 100));
}
