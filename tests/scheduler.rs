use async_trait::async_trait;
use botmaster::pm::asyncutil::TaskTracker;
use botmaster::pm::clock::ManualClock;
use botmaster::pm::config::LogConfig;
use botmaster::pm::error::{PmError, PmResult};
use botmaster::pm::events::EventLog;
use botmaster::pm::logsink::LogSink;
use botmaster::pm::scheduler::{ActionTarget, Scheduler, SchedulerDeps, TaskAction, TaskPatch, TaskSpec};
use chrono::{DateTime, Duration as ChronoDuration, Local, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Records every action instead of touching processes.
struct Recorder {
    dir: PathBuf,
    calls: Mutex<Vec<String>>,
    fail_restart: bool,
}

impl Recorder {
    fn new(dir: &Path, fail_restart: bool) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.to_path_buf(),
            calls: Mutex::new(Vec::new()),
            fail_restart,
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, what: &str, id: &str) -> PmResult<()> {
        if id != "bot1" {
            return Err(PmError::instance_not_found(id));
        }
        self.calls.lock().unwrap().push(format!("{what}:{id}"));
        Ok(())
    }
}

#[async_trait]
impl ActionTarget for Recorder {
    async fn start(&self, id: &str) -> PmResult<()> {
        self.record("start", id)
    }

    async fn stop(&self, id: &str) -> PmResult<()> {
        self.record("stop", id)
    }

    async fn restart(&self, id: &str) -> PmResult<()> {
        self.record("restart", id)?;
        if self.fail_restart {
            return Err(PmError::SpawnFailed {
                id: id.to_string(),
                reason: "boom".to_string(),
            });
        }
        Ok(())
    }

    async fn instance_dir(&self, id: &str) -> PmResult<PathBuf> {
        if id != "bot1" {
            return Err(PmError::instance_not_found(id));
        }
        Ok(self.dir.clone())
    }

    async fn backup(&self, id: &str) -> anyhow::Result<String> {
        self.record("backup", id)?;
        Ok(format!("{id}-x.tar.gz"))
    }
}

struct Harness {
    _tmp: TempDir,
    store: PathBuf,
    clock: ManualClock,
    target: Arc<Recorder>,
    logs: LogSink,
    sched: Scheduler,
}

fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Local
        .with_ymd_and_hms(y, m, d, h, min, 0)
        .single()
        .unwrap()
        .with_timezone(&Utc)
}

fn harness_with(start: DateTime<Utc>, fail_restart: bool) -> Harness {
    let tmp = TempDir::new().unwrap();
    let inst = tmp.path().join("bot1");
    std::fs::create_dir_all(&inst).unwrap();
    let rec = Recorder::new(&inst, fail_restart);
    let clock = ManualClock::new(start);
    let logs = LogSink::new(&tmp.path().join("logs"), &LogConfig::default());
    let store = tmp.path().join("schedules.json");
    let sched = open(&store, &clock, &rec, &logs);
    Harness {
        _tmp: tmp,
        store,
        clock,
        target: rec,
        logs,
        sched,
    }
}

fn open(store: &Path, clock: &ManualClock, target: &Arc<Recorder>, logs: &LogSink) -> Scheduler {
    Scheduler::open(
        store,
        SchedulerDeps {
            clock: Arc::new(clock.clone()),
            target: target.clone(),
            logs: logs.clone(),
            events: EventLog::new(),
            tasks: TaskTracker::new(),
            command_timeout: Duration::from_secs(5),
        },
    )
    .unwrap()
}

fn harness(start: DateTime<Utc>) -> Harness {
    harness_with(start, false)
}

fn spec(action: TaskAction, cron: &str) -> TaskSpec {
    TaskSpec {
        instance_id: "bot1".into(),
        name: String::new(),
        action,
        command: None,
        cron_expression: cron.into(),
        enabled: true,
    }
}

async fn wait_next_run(sched: &Scheduler, id: &str, want: DateTime<Utc>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if sched.get(id).await.unwrap().next_run == Some(want) {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "nextRun never became {want}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, f: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !f() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn create_computes_next_run_from_cron() {
    let h = harness(local(2026, 10, 19, 10, 7));
    let t = h.sched.create(spec(TaskAction::Restart, "*/15 * * * *")).await.unwrap();
    assert_eq!(t.next_run, Some(local(2026, 10, 19, 10, 15)));
    assert_eq!(t.last_run, None);
    assert_eq!(t.name, "restart */15 * * * *");
    assert_eq!(h.sched.armed_count(), 1);
}

#[tokio::test]
async fn create_rejects_bad_input() {
    let h = harness(local(2026, 10, 19, 10, 7));
    let err = h.sched.create(spec(TaskAction::Restart, "* * *")).await.unwrap_err();
    assert!(matches!(err, PmError::Invalid { .. }));

    let mut ghost = spec(TaskAction::Start, "0 * * * *");
    ghost.instance_id = "ghost".into();
    assert!(h.sched.create(ghost).await.unwrap_err().is_not_found());

    let err = h.sched.create(spec(TaskAction::RunCommand, "0 * * * *")).await.unwrap_err();
    assert!(matches!(err, PmError::Invalid { field: "command", .. }));
    assert!(h.sched.list(None).await.is_empty());
}

#[tokio::test]
async fn nightly_restart_fires_exactly_once_when_time_passes_three() {
    let h = harness(local(2026, 10, 19, 2, 50));
    let t = h.sched.create(spec(TaskAction::Restart, "0 3 * * *")).await.unwrap();
    assert_eq!(t.next_run, Some(local(2026, 10, 19, 3, 0)));

    h.clock.set(local(2026, 10, 19, 3, 1));
    eventually("restart call", || h.target.calls().len() == 1).await;
    assert_eq!(h.target.calls(), vec!["restart:bot1"]);

    let sched = h.sched.clone();
    let id = t.id.clone();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let after = loop {
        let cur = sched.get(&id).await.unwrap();
        if cur.last_run.is_some() {
            break cur;
        }
        assert!(tokio::time::Instant::now() < deadline, "lastRun never set");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(after.last_run, Some(local(2026, 10, 19, 3, 1)));
    assert_eq!(after.next_run, Some(local(2026, 10, 20, 3, 0)));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.target.calls().len(), 1);

    let text = h.logs.tail("bot1", 10).await.unwrap().join("\n");
    assert!(text.contains("[schedule] restart 0 3 * * * (restart) completed: restarted"), "{text}");
}

#[tokio::test]
async fn each_fire_advances_next_run_by_one_period() {
    let h = harness(local(2026, 10, 19, 10, 7));
    let t = h.sched.create(spec(TaskAction::Start, "*/15 * * * *")).await.unwrap();

    h.clock.set(local(2026, 10, 19, 10, 15));
    eventually("first fire", || h.target.calls().len() == 1).await;
    wait_next_run(&h.sched, &t.id, local(2026, 10, 19, 10, 30)).await;

    h.clock.set(local(2026, 10, 19, 10, 30));
    eventually("second fire", || h.target.calls().len() == 2).await;
}

#[tokio::test]
async fn run_now_consumes_the_pending_occurrence() {
    let h = harness(local(2026, 10, 19, 10, 7));
    let t = h.sched.create(spec(TaskAction::Stop, "*/15 * * * *")).await.unwrap();

    assert!(h.sched.run_now(&t.id).await.unwrap());
    assert_eq!(h.target.calls(), vec!["stop:bot1"]);
    let after = h.sched.get(&t.id).await.unwrap();
    assert_eq!(after.last_run, Some(local(2026, 10, 19, 10, 7)));
    assert_eq!(after.next_run, Some(local(2026, 10, 19, 10, 30)));

    // The 10:15 occurrence was consumed: reaching it does not fire again.
    h.clock.set(local(2026, 10, 19, 10, 16));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.target.calls().len(), 1);

    assert!(!h.sched.run_now("no-such-task").await.unwrap());
}

#[tokio::test]
async fn toggle_disarms_and_rearms() {
    let h = harness(local(2026, 10, 19, 10, 7));
    let t = h.sched.create(spec(TaskAction::Restart, "*/15 * * * *")).await.unwrap();

    let off = h.sched.toggle(&t.id).await.unwrap();
    assert!(!off.enabled);
    assert_eq!(off.next_run, None);
    assert_eq!(h.sched.armed_count(), 0);

    h.clock.set(local(2026, 10, 19, 10, 20));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(h.target.calls().is_empty());

    let on = h.sched.toggle(&t.id).await.unwrap();
    assert!(on.enabled);
    assert_eq!(on.next_run, Some(local(2026, 10, 19, 10, 30)));
    assert_eq!(h.sched.armed_count(), 1);
}

#[tokio::test]
async fn update_validates_before_changing_anything() {
    let h = harness(local(2026, 10, 19, 10, 7));
    let t = h.sched.create(spec(TaskAction::Restart, "*/15 * * * *")).await.unwrap();

    let bad = TaskPatch {
        name: Some("renamed".into()),
        cron_expression: Some("99 * * * *".into()),
        ..TaskPatch::default()
    };
    assert!(h.sched.update(&t.id, bad).await.is_err());
    assert_eq!(h.sched.get(&t.id).await.unwrap(), t);

    let good = TaskPatch {
        cron_expression: Some("0 12 * * *".into()),
        ..TaskPatch::default()
    };
    let u = h.sched.update(&t.id, good).await.unwrap();
    assert_eq!(u.next_run, Some(local(2026, 10, 19, 12, 0)));
    assert!(h.sched.update("nope", TaskPatch::default()).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn failing_action_still_records_the_run() {
    let h = harness_with(local(2026, 10, 19, 10, 7), true);
    let t = h.sched.create(spec(TaskAction::Restart, "0 * * * *")).await.unwrap();
    assert!(h.sched.run_now(&t.id).await.unwrap());
    let after = h.sched.get(&t.id).await.unwrap();
    assert!(after.last_run.is_some());
    let text = h.logs.tail("bot1", 10).await.unwrap().join("\n");
    assert!(text.contains("scheduled action failed"), "{text}");
}

#[tokio::test]
async fn run_command_output_lands_in_the_instance_log() {
    let h = harness(local(2026, 10, 19, 10, 7));
    let mut s = spec(TaskAction::RunCommand, "0 * * * *");
    s.command = Some("echo from-cron; pwd".into());
    let t = h.sched.create(s).await.unwrap();
    assert!(h.sched.run_now(&t.id).await.unwrap());
    let text = h.logs.tail("bot1", 10).await.unwrap().join("\n");
    assert!(text.contains("from-cron"), "{text}");
    assert!(text.contains("bot1"), "{text}");
}

#[tokio::test]
async fn store_survives_reopen_without_catch_up() {
    let h = harness(local(2026, 10, 19, 10, 7));
    let t = h.sched.create(spec(TaskAction::Backup, "*/15 * * * *")).await.unwrap();
    h.sched.shutdown();
    assert!(h.store.is_file());

    // Down across two occurrences; they are skipped, not replayed.
    h.clock.set(local(2026, 10, 19, 10, 40));
    let again = open(&h.store, &h.clock, &h.target, &h.logs);
    assert_eq!(again.restore().await.unwrap(), 1);
    let restored = again.get(&t.id).await.unwrap();
    assert_eq!(restored.next_run, Some(local(2026, 10, 19, 10, 45)));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(h.target.calls().is_empty());

    h.clock.advance(ChronoDuration::minutes(5));
    eventually("backup after restore", || h.target.calls() == vec!["backup:bot1"]).await;
    again.shutdown();
}

#[tokio::test]
async fn delete_for_instance_drops_only_that_instance() {
    let h = harness(local(2026, 10, 19, 10, 7));
    h.sched.create(spec(TaskAction::Start, "0 8 * * *")).await.unwrap();
    h.sched.create(spec(TaskAction::Stop, "0 20 * * *")).await.unwrap();
    assert_eq!(h.sched.delete_for_instance("bot1").await.unwrap(), 2);
    assert!(h.sched.list(None).await.is_empty());
    assert_eq!(h.sched.armed_count(), 0);
}

#[tokio::test]
async fn failed_store_write_leaves_tasks_unchanged() {
    let h = harness(local(2026, 10, 19, 10, 7));
    let t = h.sched.create(spec(TaskAction::Restart, "*/15 * * * *")).await.unwrap();

    // A non-empty directory where the store file should be makes the rename fail.
    std::fs::remove_file(&h.store).unwrap();
    std::fs::create_dir_all(h.store.join("blocker")).unwrap();

    assert!(h.sched.create(spec(TaskAction::Stop, "0 * * * *")).await.is_err());
    assert_eq!(h.sched.list(None).await.len(), 1);

    let patch = TaskPatch {
        cron_expression: Some("0 4 * * *".into()),
        ..TaskPatch::default()
    };
    assert!(h.sched.update(&t.id, patch).await.is_err());
    let kept = h.sched.get(&t.id).await.unwrap();
    assert_eq!(kept.cron_expression, "*/15 * * * *");
    assert_eq!(kept.next_run, Some(local(2026, 10, 19, 10, 15)));

    assert!(h.sched.delete(&t.id).await.is_err());
    assert!(h.sched.get(&t.id).await.is_ok());
    assert_eq!(h.sched.armed_count(), 1);

    std::fs::remove_dir_all(&h.store).unwrap();
    h.sched.delete(&t.id).await.unwrap();
    assert!(h.sched.list(None).await.is_empty());
}
