use crate::pm::asyncutil::{TaskKind, TaskTracker};
use crate::pm::clock::Clock;
use crate::pm::cronexpr::CronExpr;
use crate::pm::error::{Advisory, PmError, PmResult};
use crate::pm::events::EventLog;
use crate::pm::exec::run_logged;
use crate::pm::instance::validate_instance_id;
use crate::pm::logsink::LogSink;
use crate::pm::persist::{read_json_or_default, write_json_atomic};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskAction {
    Start,
    Stop,
    Restart,
    RunCommand,
    Backup,
}

impl TaskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskAction::Start => "start",
            TaskAction::Stop => "stop",
            TaskAction::Restart => "restart",
            TaskAction::RunCommand => "run-command",
            TaskAction::Backup => "backup",
        }
    }
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskAction {
    type Err = PmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(TaskAction::Start),
            "stop" => Ok(TaskAction::Stop),
            "restart" => Ok(TaskAction::Restart),
            "run-command" | "run_command" | "command" => Ok(TaskAction::RunCommand),
            "backup" => Ok(TaskAction::Backup),
            other => Err(PmError::invalid(
                "action",
                format!("unknown action {other:?} (start, stop, restart, run-command, backup)"),
            )),
        }
    }
}

/// One persisted schedule record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: String,
    pub instance_id: String,
    pub name: String,
    pub action: TaskAction,
    #[serde(default)]
    pub command: Option<String>,
    pub cron_expression: String,
    pub enabled: bool,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub instance_id: String,
    #[serde(default)]
    pub name: String,
    pub action: TaskAction,
    #[serde(default)]
    pub command: Option<String>,
    pub cron_expression: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Partial update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub action: Option<TaskAction>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// What a scheduled action runs against.
#[async_trait]
pub trait ActionTarget: Send + Sync {
    async fn start(&self, instance_id: &str) -> PmResult<()>;
    async fn stop(&self, instance_id: &str) -> PmResult<()>;
    async fn restart(&self, instance_id: &str) -> PmResult<()>;
    async fn instance_dir(&self, instance_id: &str) -> PmResult<PathBuf>;
    /// Archive the instance directory; returns the archive name.
    async fn backup(&self, instance_id: &str) -> anyhow::Result<String>;
}

fn validate_command(action: TaskAction, command: Option<&str>) -> PmResult<()> {
    if action == TaskAction::RunCommand && command.map(str::trim).unwrap_or("").is_empty() {
        return Err(PmError::invalid("command", "run-command tasks need a non-empty command"));
    }
    Ok(())
}

struct Inner {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    target: Arc<dyn ActionTarget>,
    logs: LogSink,
    events: EventLog,
    tasks: TaskTracker,
    command_timeout: Duration,
    state: tokio::sync::Mutex<Vec<ScheduledTask>>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Owns every `ScheduledTask` and one software timer per enabled task.
///
/// Timers sleep until the stored `nextRun`, then re-read it: a `runNow` or update that moved
/// `nextRun` in the meantime sends the timer back to sleep instead of firing. Runs of the same
/// task (timer or `runNow`) are serialized by a per-task lock.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

pub struct SchedulerDeps {
    pub clock: Arc<dyn Clock>,
    pub target: Arc<dyn ActionTarget>,
    pub logs: LogSink,
    pub events: EventLog,
    pub tasks: TaskTracker,
    pub command_timeout: Duration,
}

impl Scheduler {
    /// Load the store at `path` without arming anything; call [`Scheduler::restore`] next.
    pub fn open(path: &Path, deps: SchedulerDeps) -> anyhow::Result<Self> {
        let records: Vec<ScheduledTask> = read_json_or_default(path)?;
        Ok(Self {
            inner: Arc::new(Inner {
                path: path.to_path_buf(),
                clock: deps.clock,
                target: deps.target,
                logs: deps.logs,
                events: deps.events,
                tasks: deps.tasks,
                command_timeout: deps.command_timeout,
                state: tokio::sync::Mutex::new(records),
                timers: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        })
    }

    fn event(&self, task: Option<&ScheduledTask>, msg: impl AsRef<str>) {
        match task {
            Some(t) => self.inner.events.push(
                "schedule",
                Some(&t.instance_id),
                format!("task={} {}", t.id, msg.as_ref()),
            ),
            None => self.inner.events.push("schedule", None, msg),
        }
    }

    async fn persist(&self, tasks: &[ScheduledTask]) -> PmResult<()> {
        write_json_atomic(&self.inner.path, &tasks).await?;
        Ok(())
    }

    /// Re-arm every enabled task after a daemon start. Occurrences missed while down are
    /// skipped: a stale `nextRun` is recomputed from now.
    pub async fn restore(&self) -> PmResult<usize> {
        let now = self.inner.clock.now();
        let mut st = self.inner.state.lock().await;
        let mut changed = false;
        let mut armed = Vec::new();
        for t in st.iter_mut() {
            if !t.enabled {
                if t.next_run.take().is_some() {
                    changed = true;
                }
                continue;
            }
            let cron = match CronExpr::parse(&t.cron_expression) {
                Ok(c) => c,
                Err(e) => {
                    self.event(Some(&*t), format!("restore=skip reason=bad_expression err={e}"));
                    continue;
                }
            };
            if t.next_run.is_none_or(|n| n <= now) {
                let next = cron.next_after(now);
                self.event(
                    Some(&*t),
                    format!(
                        "restore=recompute stale_next_run={} next_run={}",
                        fmt_opt(t.next_run),
                        fmt_opt(next)
                    ),
                );
                t.next_run = next;
                changed = true;
            }
            armed.push(t.id.clone());
        }
        if changed {
            self.persist(&st).await?;
        }
        drop(st);
        for id in &armed {
            self.arm(id);
        }
        self.event(None, format!("restore=done armed={}", armed.len()));
        Ok(armed.len())
    }

    pub async fn create(&self, spec: TaskSpec) -> PmResult<ScheduledTask> {
        validate_instance_id(&spec.instance_id)?;
        validate_command(spec.action, spec.command.as_deref())?;
        let cron = CronExpr::parse(&spec.cron_expression)?;
        self.inner.target.instance_dir(&spec.instance_id).await?;

        let now = self.inner.clock.now();
        let id = uuid::Uuid::new_v4().to_string();
        let name = if spec.name.trim().is_empty() {
            format!("{} {}", spec.action, cron.source())
        } else {
            spec.name.trim().to_string()
        };
        let task = ScheduledTask {
            id: id.clone(),
            instance_id: spec.instance_id,
            name,
            action: spec.action,
            command: spec.command.filter(|_| spec.action == TaskAction::RunCommand),
            cron_expression: cron.source().to_string(),
            enabled: spec.enabled,
            last_run: None,
            next_run: if spec.enabled { cron.next_after(now) } else { None },
            created_at: now,
        };
        {
            let mut st = self.inner.state.lock().await;
            let mut next = st.clone();
            next.push(task.clone());
            self.persist(&next).await?;
            *st = next;
        }
        if task.enabled {
            self.arm(&id);
        }
        self.event(
            Some(&task),
            format!("created action={} cron={:?} next_run={}", task.action, task.cron_expression, fmt_opt(task.next_run)),
        );
        Ok(task)
    }

    pub async fn list(&self, instance_id: Option<&str>) -> Vec<ScheduledTask> {
        let st = self.inner.state.lock().await;
        st.iter()
            .filter(|t| instance_id.is_none_or(|i| t.instance_id == i))
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: &str) -> PmResult<ScheduledTask> {
        let st = self.inner.state.lock().await;
        st.iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| PmError::task_not_found(id))
    }

    /// Merge `patch`; the timer is always torn down and re-armed to match the result.
    pub async fn update(&self, id: &str, patch: TaskPatch) -> PmResult<ScheduledTask> {
        let now = self.inner.clock.now();
        let updated = {
            let mut st = self.inner.state.lock().await;
            let mut next = st.clone();
            let t = next
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| PmError::task_not_found(id))?;

            let action = patch.action.unwrap_or(t.action);
            let command = patch.command.clone().or_else(|| t.command.clone());
            validate_command(action, command.as_deref())?;
            let enabled = patch.enabled.unwrap_or(t.enabled);
            let cron = match patch.cron_expression.as_deref() {
                Some(expr) => CronExpr::parse(expr)?,
                None => CronExpr::parse(&t.cron_expression)?,
            };
            let reschedule = cron.source() != t.cron_expression || !t.enabled || t.next_run.is_none();

            if let Some(name) = patch.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
                t.name = name.to_string();
            }
            t.action = action;
            t.command = command.filter(|_| action == TaskAction::RunCommand);
            t.cron_expression = cron.source().to_string();
            t.enabled = enabled;
            if !enabled {
                t.next_run = None;
            } else if reschedule {
                t.next_run = cron.next_after(now);
            }
            let updated = t.clone();
            self.persist(&next).await?;
            *st = next;
            updated
        };
        self.disarm(id);
        if updated.enabled {
            self.arm(id);
        }
        self.event(
            Some(&updated),
            format!("updated enabled={} cron={:?} next_run={}", updated.enabled, updated.cron_expression, fmt_opt(updated.next_run)),
        );
        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> PmResult<()> {
        self.disarm(id);
        let removed = {
            let mut st = self.inner.state.lock().await;
            let pos = st
                .iter()
                .position(|t| t.id == id)
                .ok_or_else(|| PmError::task_not_found(id))?;
            let mut next = st.clone();
            let removed = next.remove(pos);
            if let Err(e) = self.persist(&next).await {
                if removed.enabled {
                    self.arm(id);
                }
                return Err(e);
            }
            *st = next;
            removed
        };
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id);
        self.event(Some(&removed), "deleted");
        Ok(())
    }

    pub async fn toggle(&self, id: &str) -> PmResult<ScheduledTask> {
        let enabled = !self.get(id).await?.enabled;
        self.update(
            id,
            TaskPatch {
                enabled: Some(enabled),
                ..TaskPatch::default()
            },
        )
        .await
    }

    /// Drop every task that targets `instance_id`. Returns how many were removed.
    pub async fn delete_for_instance(&self, instance_id: &str) -> PmResult<usize> {
        let ids: Vec<String> = self
            .list(Some(instance_id))
            .await
            .into_iter()
            .map(|t| t.id)
            .collect();
        for id in &ids {
            match self.delete(id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(ids.len())
    }

    /// Execute now, outside the timer. The pending occurrence counts as consumed, so the
    /// timer does not fire again for the same period. `Ok(false)` when the id is unknown.
    pub async fn run_now(&self, id: &str) -> PmResult<bool> {
        match self.execute(id, None).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Stop all timers. Running actions finish on their own.
    pub fn shutdown(&self) {
        let mut timers = self.inner.timers.lock().unwrap_or_else(|p| p.into_inner());
        for (_, h) in timers.drain() {
            h.abort();
        }
    }

    pub fn armed_count(&self) -> usize {
        self.inner
            .timers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }

    fn arm(&self, id: &str) {
        let weak = Arc::downgrade(&self.inner);
        let clock = Arc::clone(&self.inner.clock);
        let task_id = id.to_string();
        let h = self.inner.tasks.spawn_as(TaskKind::Timer, timer_loop(weak, clock, task_id));
        let old = self
            .inner
            .timers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.to_string(), h);
        if let Some(old) = old {
            old.abort();
        }
    }

    fn disarm(&self, id: &str) {
        let h = self
            .inner
            .timers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id);
        if let Some(h) = h {
            h.abort();
        }
    }

    fn in_flight_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut m = self.inner.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(m.entry(id.to_string()).or_default())
    }

    /// Run the task's action and record the run. With `due = Some(t)` (timer path) the run is
    /// skipped unless `t` is still the task's pending occurrence.
    async fn execute(&self, id: &str, due: Option<DateTime<Utc>>) -> PmResult<Option<ScheduledTask>> {
        let lock = self.in_flight_lock(id);
        let _running = lock.lock().await;

        let task = self.get(id).await?;
        if let Some(due) = due
            && !(task.enabled && task.next_run == Some(due))
        {
            return Ok(None);
        }
        let pending = task.next_run;
        let trigger = if due.is_some() { "timer" } else { "run_now" };
        self.event(Some(&task), format!("due trigger={trigger} action={}", task.action));

        let outcome = self.run_action(&task).await;
        let line = match &outcome {
            Ok(detail) => format!("[schedule] {} ({}) completed: {detail}", task.name, task.action),
            Err(e) => {
                let adv = Advisory::ActionExecutionError(format!("{} ({}): {e:#}", task.name, task.action));
                tracing::warn!(target: "schedule", app = %task.instance_id, task = %task.id, "{adv}");
                format!("[schedule] {adv}")
            }
        };
        self.inner.logs.append(&task.instance_id, &line).await;

        let now = self.inner.clock.now();
        let updated = {
            let mut st = self.inner.state.lock().await;
            let mut next = st.clone();
            let Some(t) = next.iter_mut().find(|t| t.id == id) else {
                // Deleted while running.
                return Ok(None);
            };
            t.last_run = Some(now);
            t.next_run = if t.enabled {
                let base = pending.map_or(now, |p| p.max(now));
                CronExpr::parse(&t.cron_expression)?.next_after(base)
            } else {
                None
            };
            let updated = t.clone();
            self.persist(&next).await?;
            *st = next;
            updated
        };
        self.event(
            Some(&updated),
            format!(
                "outcome={} last_run={} next_run={}",
                if outcome.is_ok() { "ok" } else { "error" },
                now.to_rfc3339(),
                fmt_opt(updated.next_run)
            ),
        );
        Ok(Some(updated))
    }

    async fn run_action(&self, task: &ScheduledTask) -> anyhow::Result<String> {
        let target = &self.inner.target;
        let iid = task.instance_id.as_str();
        match task.action {
            TaskAction::Start => {
                target.start(iid).await?;
                Ok("started".to_string())
            }
            TaskAction::Stop => {
                target.stop(iid).await?;
                Ok("stopped".to_string())
            }
            TaskAction::Restart => {
                target.restart(iid).await?;
                Ok("restarted".to_string())
            }
            TaskAction::RunCommand => {
                let command = task.command.as_deref().unwrap_or("").trim();
                anyhow::ensure!(!command.is_empty(), "no command configured");
                let dir = target.instance_dir(iid).await?;
                let argv = vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()];
                let exit = run_logged(
                    &argv,
                    &dir,
                    self.inner.command_timeout,
                    &self.inner.logs,
                    &self.inner.tasks,
                    iid,
                )
                .await?;
                if exit.success() {
                    Ok(exit.describe())
                } else {
                    anyhow::bail!("command {command:?} {}", exit.describe())
                }
            }
            TaskAction::Backup => {
                let name = target.backup(iid).await?;
                Ok(format!("archive={name}"))
            }
        }
    }
}

fn fmt_opt(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
}

async fn timer_loop(weak: Weak<Inner>, clock: Arc<dyn Clock>, id: String) {
    loop {
        let next = {
            let Some(inner) = weak.upgrade() else { return };
            let st = inner.state.lock().await;
            match st.iter().find(|t| t.id == id) {
                Some(t) if t.enabled => t.next_run,
                _ => None,
            }
        };
        let Some(next) = next else { return };
        clock.sleep_until(next).await;

        let Some(inner) = weak.upgrade() else { return };
        let sched = Scheduler { inner };
        let tracker = sched.inner.tasks.clone();
        let task_id = id.clone();
        // Detached so disarming the timer never cancels an action halfway.
        let run = tracker.spawn(async move { sched.execute(&task_id, Some(next)).await });
        match run.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.is_not_found() => return,
            Ok(Err(e)) => tracing::warn!(target: "schedule", task = %id, "timer run failed: {e}"),
            Err(e) => tracing::warn!(target: "schedule", task = %id, "timer run join error: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_use_kebab_case_on_the_wire() {
        assert_eq!(serde_json::to_string(&TaskAction::RunCommand).unwrap(), "\"run-command\"");
        assert_eq!("run-command".parse::<TaskAction>().unwrap(), TaskAction::RunCommand);
        assert!("reboot".parse::<TaskAction>().is_err());
    }

    #[test]
    fn store_shape_is_camel_case() {
        let t = ScheduledTask {
            id: "t1".into(),
            instance_id: "bot1".into(),
            name: "nightly".into(),
            action: TaskAction::Restart,
            command: None,
            cron_expression: "0 3 * * *".into(),
            enabled: true,
            last_run: None,
            next_run: None,
            created_at: Utc::now(),
        };
        let v = serde_json::to_value(&t).unwrap();
        for key in ["id", "instanceId", "name", "action", "command", "cronExpression", "enabled", "lastRun", "nextRun", "createdAt"] {
            assert!(v.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn run_command_requires_command() {
        assert!(validate_command(TaskAction::RunCommand, None).is_err());
        assert!(validate_command(TaskAction::RunCommand, Some("  ")).is_err());
        assert!(validate_command(TaskAction::RunCommand, Some("echo hi")).is_ok());
        assert!(validate_command(TaskAction::Backup, None).is_ok());
    }
}
