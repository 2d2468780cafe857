use crate::pm::asyncutil::{TaskKind, TaskTracker};
use crate::pm::cgroup::MemoryLimiter;
use crate::pm::config::MasterConfig;
use crate::pm::error::{PmError, PmResult};
use crate::pm::events::EventLog;
use crate::pm::instance::{Instance, Runtime, validate_instance_id};
use crate::pm::logsink::LogSink;
use crate::pm::prepare::{prepare_instance, resolve_interpreter};
use crate::pm::procstat;
use chrono::{DateTime, Utc};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::{Pid, setsid};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::Write as _;
use std::os::unix::process::{CommandExt as _, ExitStatusExt as _};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const KILL_SETTLE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Online,
    Stopping,
    Stopped,
    Errored,
    NotFound,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Starting => "starting",
            ProcessStatus::Online => "online",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Errored => "errored",
            ProcessStatus::NotFound => "not_found",
        }
    }

    fn has_process(&self) -> bool {
        matches!(self, ProcessStatus::Starting | ProcessStatus::Online | ProcessStatus::Stopping)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOptions {
    pub auto_install: bool,
    pub auto_restart: bool,
    /// Entry point relative to the instance directory; the runtime default when `None`.
    pub main_file: Option<String>,
    pub deps_file: Option<String>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            auto_install: true,
            auto_restart: true,
            main_file: None,
            deps_file: None,
        }
    }
}

impl From<&Instance> for StartOptions {
    fn from(i: &Instance) -> Self {
        Self {
            auto_install: i.auto_install,
            auto_restart: i.auto_restart,
            main_file: Some(i.main_file.clone()),
            deps_file: Some(i.deps_file.clone()),
        }
    }
}

/// The live binding between an instance and its OS process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedProcess {
    pub instance_id: String,
    pub pid: Option<u32>,
    pub interpreter: String,
    pub working_dir: PathBuf,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub status: ProcessStatus,
    pub max_memory_mb: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub instance_id: String,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    pub memory_bytes: Option<u64>,
    pub memory_max_bytes: Option<u64>,
    pub cpu_percent: Option<f64>,
    pub uptime_ms: Option<i64>,
    pub restart_count: u32,
}

impl StatusReport {
    fn not_found(id: &str) -> Self {
        Self {
            instance_id: id.to_string(),
            status: ProcessStatus::NotFound,
            pid: None,
            memory_bytes: None,
            memory_max_bytes: None,
            cpu_percent: None,
            uptime_ms: None,
            restart_count: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum StartOutcome {
    Started(ManagedProcess),
    /// A live process already owned the id; nothing was spawned.
    AlreadyRunning(ManagedProcess),
}

impl StartOutcome {
    pub fn process(&self) -> &ManagedProcess {
        match self {
            StartOutcome::Started(p) | StartOutcome::AlreadyRunning(p) => p,
        }
    }

    pub fn already_running(&self) -> bool {
        matches!(self, StartOutcome::AlreadyRunning(_))
    }
}

#[derive(Debug, Clone)]
struct LaunchSpec {
    runtime: Runtime,
    max_memory_mb: u32,
    options: StartOptions,
}

enum Cmd {
    Start {
        spec: LaunchSpec,
        resp: oneshot::Sender<PmResult<StartOutcome>>,
    },
    Stop {
        resp: oneshot::Sender<PmResult<()>>,
    },
    Restart {
        resp: oneshot::Sender<PmResult<ManagedProcess>>,
    },
    Delete {
        resp: oneshot::Sender<()>,
    },
    Exited {
        epoch: u64,
        code: Option<i32>,
        signal: Option<i32>,
    },
    MemoryExceeded {
        epoch: u64,
        used_bytes: u64,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
struct Slot {
    tx: mpsc::UnboundedSender<Cmd>,
    view: Arc<Mutex<Option<ManagedProcess>>>,
}

struct Shared {
    cfg: MasterConfig,
    limiter: MemoryLimiter,
    logs: LogSink,
    events: EventLog,
    tasks: TaskTracker,
    slots: Mutex<HashMap<String, Slot>>,
}

/// Owns one OS process per instance id.
///
/// Each id gets a long-lived actor task; lifecycle calls for the same id queue on its channel
/// and run one at a time, while different ids proceed independently. Status reads go to a
/// shared snapshot and never wait behind a lifecycle call.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    pub fn new(cfg: MasterConfig, limiter: MemoryLimiter, logs: LogSink, events: EventLog, tasks: TaskTracker) -> Self {
        Self {
            shared: Arc::new(Shared {
                cfg,
                limiter,
                logs,
                events,
                tasks,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn limiter(&self) -> &MemoryLimiter {
        &self.shared.limiter
    }

    pub fn logs(&self) -> &LogSink {
        &self.shared.logs
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.shared.tasks
    }

    fn existing_slot(&self, id: &str) -> Option<Slot> {
        let slots = self.shared.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.get(id).cloned()
    }

    fn slot(&self, id: &str) -> Slot {
        let mut slots = self.shared.slots.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(s) = slots.get(id) {
            return s.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel::<Cmd>();
        let view = Arc::new(Mutex::new(None));
        let actor = Actor {
            id: id.to_string(),
            shared: Arc::clone(&self.shared),
            tx: tx.downgrade(),
            view: Arc::clone(&view),
            spec: None,
            running: None,
            epoch: 0,
            restart_times: VecDeque::new(),
            pending_restart_at: None,
        };
        self.shared.tasks.spawn_as(TaskKind::Actor, actor.run(rx));
        let slot = Slot { tx, view };
        slots.insert(id.to_string(), slot.clone());
        slot
    }

    /// A request that was still queued when a delete retired the actor reports `NotFound`.
    async fn call<T>(&self, id: &str, slot: &Slot, make: impl FnOnce(oneshot::Sender<T>) -> Cmd) -> PmResult<T> {
        let (resp, rx) = oneshot::channel();
        let retired = |slot: &Slot, why: &str| {
            if slot.tx.is_closed() {
                PmError::instance_not_found(id)
            } else {
                PmError::SupervisorUnavailable(format!("supervisor for {id} {why}"))
            }
        };
        slot.tx.send(make(resp)).map_err(|_| retired(slot, "is not running"))?;
        rx.await.map_err(|_| retired(slot, "dropped the request"))
    }

    /// Prepare and spawn the instance's process. Starting a live instance spawns nothing and
    /// reports `AlreadyRunning` with the existing descriptor.
    pub async fn start_process(
        &self,
        id: &str,
        runtime: Runtime,
        max_memory_mb: u32,
        options: StartOptions,
    ) -> PmResult<StartOutcome> {
        validate_instance_id(id)?;
        let spec = LaunchSpec {
            runtime,
            max_memory_mb,
            options,
        };
        let slot = self.slot(id);
        let first = self.call(id, &slot, |resp| Cmd::Start { spec: spec.clone(), resp }).await;
        match first {
            // Queued behind a delete that retired the actor.
            Err(e) if e.is_not_found() => {
                let slot = self.slot(id);
                self.call(id, &slot, |resp| Cmd::Start { spec, resp }).await?
            }
            r => r?,
        }
    }

    /// Graceful stop: SIGTERM to the process group, SIGKILL after the grace period.
    pub async fn stop_process(&self, id: &str) -> PmResult<()> {
        let slot = self.existing_slot(id).ok_or_else(|| PmError::instance_not_found(id))?;
        self.call(id, &slot, |resp| Cmd::Stop { resp }).await?
    }

    pub async fn restart_process(&self, id: &str) -> PmResult<ManagedProcess> {
        let slot = self.existing_slot(id).ok_or_else(|| PmError::instance_not_found(id))?;
        self.call(id, &slot, |resp| Cmd::Restart { resp }).await?
    }

    /// Kill and forget the instance, then drop its memory group. Safe to repeat.
    pub async fn delete_process(&self, id: &str) -> PmResult<()> {
        match self.existing_slot(id) {
            Some(slot) => match self.call(id, &slot, |resp| Cmd::Delete { resp }).await {
                Err(e) if e.is_not_found() => Ok(()),
                r => r,
            },
            None => {
                let limiter = self.shared.limiter.clone();
                let id = id.to_string();
                tokio::task::spawn_blocking(move || limiter.delete_group(&id))
                    .await
                    .map_err(|e| PmError::Internal(anyhow::anyhow!("join error: {e}")))?;
                Ok(())
            }
        }
    }

    pub async fn get_status(&self, id: &str) -> StatusReport {
        let Some(slot) = self.existing_slot(id) else {
            return StatusReport::not_found(id);
        };
        let view = slot.view.lock().unwrap_or_else(|p| p.into_inner()).clone();
        match view {
            Some(mp) => self.report(&mp),
            None => StatusReport::not_found(id),
        }
    }

    /// Every instance this supervisor currently knows, sorted by id.
    pub async fn list_all(&self) -> Vec<StatusReport> {
        let views: Vec<ManagedProcess> = {
            let slots = self.shared.slots.lock().unwrap_or_else(|p| p.into_inner());
            slots
                .values()
                .filter_map(|s| s.view.lock().unwrap_or_else(|p| p.into_inner()).clone())
                .collect()
        };
        let mut out: Vec<StatusReport> = views.iter().map(|mp| self.report(mp)).collect();
        out.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        out
    }

    fn report(&self, mp: &ManagedProcess) -> StatusReport {
        let limit = Some(u64::from(mp.max_memory_mb) * 1024 * 1024);
        let mut r = StatusReport {
            instance_id: mp.instance_id.clone(),
            status: mp.status,
            pid: mp.pid,
            memory_bytes: None,
            memory_max_bytes: limit,
            cpu_percent: None,
            uptime_ms: None,
            restart_count: mp.restart_count,
        };
        if let Some(pid) = mp.pid
            && mp.status.has_process()
        {
            let sample = procstat::sample(pid);
            let group = self.shared.limiter.get_memory_usage(&mp.instance_id);
            r.memory_bytes = group.map(|u| u.current).filter(|c| *c > 0).or(sample.rss_bytes);
            r.memory_max_bytes = group.and_then(|u| u.max).or(limit);
            r.cpu_percent = sample.cpu_percent;
            r.uptime_ms = sample
                .uptime_ms
                .or_else(|| mp.started_at.map(|t| (Utc::now() - t).num_milliseconds().max(0)));
        }
        r
    }

    /// Stop every live process (graceful) and end all actors.
    pub async fn shutdown(&self) {
        let slots: Vec<(String, Slot)> = {
            let slots = self.shared.slots.lock().unwrap_or_else(|p| p.into_inner());
            slots.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut set = tokio::task::JoinSet::new();
        for (id, slot) in slots {
            let this = self.clone();
            set.spawn(async move {
                let _ = this.call(&id, &slot, |resp| Cmd::Shutdown { resp }).await;
            });
        }
        while set.join_next().await.is_some() {}
    }
}

struct Running {
    pid: u32,
    exited: watch::Receiver<bool>,
    watchdog: JoinHandle<()>,
}

struct Actor {
    id: String,
    shared: Arc<Shared>,
    tx: mpsc::WeakUnboundedSender<Cmd>,
    view: Arc<Mutex<Option<ManagedProcess>>>,
    spec: Option<LaunchSpec>,
    running: Option<Running>,
    /// Bumped whenever the current child is abandoned, so its late exit report is ignored.
    epoch: u64,
    restart_times: VecDeque<Instant>,
    pending_restart_at: Option<Instant>,
}

impl Actor {
    fn event(&self, msg: impl AsRef<str>) {
        self.shared.events.push("supervisor", Some(&self.id), msg);
    }

    async fn log(&self, msg: &str) {
        self.shared.logs.append(&self.id, &format!("[botmaster] {msg}")).await;
    }

    fn publish(&self, mp: Option<ManagedProcess>) {
        *self.view.lock().unwrap_or_else(|p| p.into_inner()) = mp;
    }

    fn update(&self, f: impl FnOnce(&mut ManagedProcess)) {
        if let Some(mp) = self.view.lock().unwrap_or_else(|p| p.into_inner()).as_mut() {
            f(mp);
        }
    }

    fn snapshot(&self) -> Option<ManagedProcess> {
        self.view.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_status(&self, status: ProcessStatus) {
        self.update(|mp| {
            mp.status = status;
            if !status.has_process() {
                mp.pid = None;
            }
        });
    }

    fn instance_dir(&self) -> PathBuf {
        self.shared.cfg.instance_dir(&self.id)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Cmd>) {
        loop {
            let mut timer_fired = false;
            let cmd_opt = if let Some(at) = self.pending_restart_at {
                let timeout = at.saturating_duration_since(Instant::now());
                tokio::select! {
                    cmd = rx.recv() => cmd,
                    _ = tokio::time::sleep(timeout) => {
                        timer_fired = true;
                        None
                    },
                }
            } else {
                rx.recv().await
            };

            let cmd = match cmd_opt {
                Some(c) => c,
                None if timer_fired => {
                    self.pending_restart_at = None;
                    self.auto_restart().await;
                    continue;
                }
                None => break,
            };

            match cmd {
                Cmd::Start { spec, resp } => {
                    let r = self.handle_start(spec).await;
                    let never_started = r.is_err() && self.snapshot().is_none();
                    if never_started {
                        self.retire();
                    }
                    let _ = resp.send(r);
                    if never_started {
                        break;
                    }
                }
                Cmd::Stop { resp } => {
                    let r = self.handle_stop().await;
                    let _ = resp.send(r);
                }
                Cmd::Restart { resp } => {
                    let r = self.handle_restart().await;
                    let _ = resp.send(r);
                }
                Cmd::Delete { resp } => {
                    self.handle_delete().await;
                    self.retire();
                    let _ = resp.send(());
                    break;
                }
                Cmd::Exited { epoch, code, signal } => {
                    if epoch != self.epoch || self.running.is_none() {
                        tracing::debug!(target: "supervisor", app = %self.id, "ignore_exit reason=stale_epoch got={epoch} want={}", self.epoch);
                        continue;
                    }
                    self.handle_exit(code, signal).await;
                }
                Cmd::MemoryExceeded { epoch, used_bytes } => {
                    if epoch != self.epoch || self.running.is_none() {
                        continue;
                    }
                    self.handle_memory_exceeded(used_bytes).await;
                }
                Cmd::Shutdown { resp } => {
                    self.pending_restart_at = None;
                    if self.running.is_some() {
                        self.set_status(ProcessStatus::Stopping);
                        if let Err(e) = self.stop_running().await {
                            self.event(format!("attempt=shutdown_stop outcome=error err={e}"));
                        }
                        self.set_status(ProcessStatus::Stopped);
                    }
                    let _ = resp.send(());
                    break;
                }
            }
        }
        tracing::debug!(target: "supervisor", app = %self.id, "supervisor=exit");
    }

    /// Drop this actor's slot so the next call for the id spawns a fresh actor.
    fn retire(&self) {
        let mut slots = self.shared.slots.lock().unwrap_or_else(|p| p.into_inner());
        if slots.get(&self.id).is_some_and(|s| Arc::ptr_eq(&s.view, &self.view)) {
            slots.remove(&self.id);
        }
    }

    async fn handle_start(&mut self, spec: LaunchSpec) -> PmResult<StartOutcome> {
        if self.running.is_some()
            && let Some(mp) = self.snapshot()
        {
            self.event(format!("attempt=start outcome=already_running pid={}", mp.pid.unwrap_or(0)));
            return Ok(StartOutcome::AlreadyRunning(mp));
        }
        let dir = self.instance_dir();
        if !dir.is_dir() {
            return Err(PmError::instance_not_found(&self.id));
        }

        self.restart_times.clear();
        self.pending_restart_at = None;
        let restart_count = self.snapshot().map(|mp| mp.restart_count).unwrap_or(0);
        self.publish(Some(ManagedProcess {
            instance_id: self.id.clone(),
            pid: None,
            interpreter: self.shared.cfg.runtime(spec.runtime).interpreter.clone(),
            working_dir: dir,
            started_at: None,
            restart_count,
            status: ProcessStatus::Starting,
            max_memory_mb: spec.max_memory_mb,
        }));
        self.spec = Some(spec.clone());

        self.launch(&spec, true).await?;
        self.snapshot()
            .map(StartOutcome::Started)
            .ok_or_else(|| PmError::SupervisorUnavailable(format!("{} vanished during start", self.id)))
    }

    async fn handle_stop(&mut self) -> PmResult<()> {
        if self.snapshot().is_none() {
            return Err(PmError::instance_not_found(&self.id));
        }
        self.pending_restart_at = None;
        self.restart_times.clear();
        if self.running.is_none() {
            self.event("attempt=stop outcome=not_running");
            self.set_status(ProcessStatus::Stopped);
            return Ok(());
        }
        self.set_status(ProcessStatus::Stopping);
        match self.stop_running().await {
            Ok(()) => {
                self.set_status(ProcessStatus::Stopped);
                self.log("stopped").await;
                Ok(())
            }
            Err(e) => {
                self.set_status(ProcessStatus::Errored);
                Err(e)
            }
        }
    }

    async fn handle_restart(&mut self) -> PmResult<ManagedProcess> {
        let Some(spec) = self.spec.clone() else {
            return Err(PmError::instance_not_found(&self.id));
        };
        if self.snapshot().is_none() {
            return Err(PmError::instance_not_found(&self.id));
        }
        self.pending_restart_at = None;
        self.restart_times.clear();
        if self.running.is_some() {
            self.set_status(ProcessStatus::Stopping);
            if let Err(e) = self.stop_running().await {
                self.set_status(ProcessStatus::Errored);
                return Err(e);
            }
        }
        self.update(|mp| mp.restart_count += 1);
        self.launch(&spec, false).await?;
        self.event("attempt=restart outcome=online");
        self.snapshot()
            .ok_or_else(|| PmError::SupervisorUnavailable(format!("{} vanished during restart", self.id)))
    }

    async fn handle_delete(&mut self) {
        self.pending_restart_at = None;
        self.restart_times.clear();
        let existed = self.snapshot().is_some();
        if self.running.is_some() {
            self.kill_running("delete").await;
        }
        self.spec = None;
        self.publish(None);

        let limiter = self.shared.limiter.clone();
        let id = self.id.clone();
        let removed = tokio::task::spawn_blocking(move || limiter.delete_group(&id))
            .await
            .unwrap_or(false);
        if existed {
            self.event(format!("attempt=delete outcome=removed group_removed={removed}"));
            self.log("deleted").await;
        }
    }

    async fn handle_exit(&mut self, code: Option<i32>, signal: Option<i32>) {
        if let Some(run) = self.running.take() {
            run.watchdog.abort();
        }
        self.epoch = self.epoch.wrapping_add(1);
        let code_s = code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string());
        let sig_s = signal.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
        self.event(format!("event=exit_observed code={code_s} signal={sig_s}"));
        self.log(&format!("process exited code={code_s} signal={sig_s}")).await;

        if code == Some(0) {
            self.set_status(ProcessStatus::Stopped);
            return;
        }
        let auto_restart = self.spec.as_ref().map(|s| s.options.auto_restart).unwrap_or(false);
        if auto_restart {
            self.schedule_auto_restart("crash").await;
        } else {
            self.set_status(ProcessStatus::Errored);
        }
    }

    async fn handle_memory_exceeded(&mut self, used_bytes: u64) {
        let max_mb = self.spec.as_ref().map(|s| s.max_memory_mb).unwrap_or(0);
        let used_mb = used_bytes / (1024 * 1024);
        self.event(format!("event=memory_exceeded used_mb={used_mb} max_mb={max_mb}"));
        self.log(&format!("memory {used_mb}MB exceeds ceiling {max_mb}MB")).await;
        if let Err(e) = self.stop_running().await {
            self.event(format!("attempt=memory_stop outcome=error err={e}"));
        }
        let auto_restart = self.spec.as_ref().map(|s| s.options.auto_restart).unwrap_or(false);
        if auto_restart {
            self.schedule_auto_restart("memory").await;
        } else {
            self.set_status(ProcessStatus::Errored);
        }
    }

    /// Mark errored and arm a backoff restart, unless too many restarts happened in the window.
    async fn schedule_auto_restart(&mut self, reason: &str) {
        self.set_status(ProcessStatus::Errored);
        let sv = &self.shared.cfg.supervisor;
        let window = Duration::from_millis(sv.restart_window_ms);
        let now = Instant::now();
        while let Some(front) = self.restart_times.front() {
            if now.duration_since(*front) > window {
                self.restart_times.pop_front();
            } else {
                break;
            }
        }
        self.restart_times.push_back(now);
        if self.restart_times.len() > sv.max_restarts {
            let msg = format!(
                "decision=suppress reason=tolerance_exceeded trigger={reason} max_restarts={} window_ms={}",
                sv.max_restarts, sv.restart_window_ms
            );
            self.event(&msg);
            self.log(&format!("auto-restart suppressed ({msg})")).await;
            self.pending_restart_at = None;
            return;
        }
        let backoff_ms = sv.restart_backoff_ms;
        self.event(format!(
            "decision=backoff trigger={reason} backoff_ms={backoff_ms} recent_restarts_in_window={}",
            self.restart_times.len()
        ));
        self.pending_restart_at = Some(now + Duration::from_millis(backoff_ms));
    }

    async fn auto_restart(&mut self) {
        let Some(spec) = self.spec.clone() else {
            return;
        };
        if self.running.is_some() {
            return;
        }
        self.update(|mp| mp.restart_count += 1);
        match self.launch(&spec, false).await {
            Ok(()) => self.event("attempt=auto_restart outcome=online"),
            Err(e) => {
                self.event(format!("attempt=auto_restart outcome=error err={e}"));
                self.schedule_auto_restart("spawn_failed").await;
            }
        }
    }

    /// Prepare (optionally), spawn, attach to the memory group, and start the exit waiter and
    /// memory watchdog. Leaves the view `online` on success and `errored` on failure.
    async fn launch(&mut self, spec: &LaunchSpec, install: bool) -> PmResult<()> {
        let dir = self.instance_dir();
        if !dir.is_dir() {
            self.set_status(ProcessStatus::Errored);
            return Err(PmError::instance_not_found(&self.id));
        }
        let rc = self.shared.cfg.runtime(spec.runtime).clone();
        let main_file = spec.options.main_file.clone().unwrap_or_else(|| rc.main_file.clone());
        let deps_file = spec.options.deps_file.clone().unwrap_or_else(|| rc.deps_file.clone());
        self.set_status(ProcessStatus::Starting);

        let interpreter = if install {
            prepare_instance(
                &self.id,
                &dir,
                &rc,
                &deps_file,
                spec.options.auto_install,
                self.shared.cfg.supervisor.install_timeout(),
                &self.shared.logs,
                &self.shared.tasks,
            )
            .await
        } else {
            resolve_interpreter(&rc, &dir)
        };

        let limiter = &self.shared.limiter;
        if limiter.is_available() {
            limiter.create_group(&self.id, spec.max_memory_mb);
        }

        let mut child = match self.spawn_child(&dir, &interpreter, &main_file, limiter.procs_file(&self.id)) {
            Ok(c) => c,
            Err(e) => {
                let reason = format!(
                    "cwd={} argv=[{interpreter} {main_file}] kind={:?} os_error={:?} err={e}",
                    dir.display(),
                    e.kind(),
                    e.raw_os_error()
                );
                self.set_status(ProcessStatus::Errored);
                self.event(format!("attempt=spawn outcome=error {reason}"));
                self.log(&format!("spawn failed: {reason}")).await;
                return Err(PmError::SpawnFailed {
                    id: self.id.clone(),
                    reason,
                });
            }
        };
        let Some(pid) = child.id() else {
            self.set_status(ProcessStatus::Errored);
            return Err(PmError::SpawnFailed {
                id: self.id.clone(),
                reason: "child exited before its pid was observed".to_string(),
            });
        };
        if limiter.procs_file(&self.id).is_some() {
            limiter.assign_process(&self.id, pid);
        }

        let tasks = &self.shared.tasks;
        if let Some(out) = child.stdout.take() {
            self.shared.logs.spawn_pump(tasks, &self.id, out, None);
        }
        if let Some(err) = child.stderr.take() {
            self.shared.logs.spawn_pump(tasks, &self.id, err, Some("[err]"));
        }

        self.epoch = self.epoch.wrapping_add(1);
        let epoch = self.epoch;
        let (exit_tx, exit_rx) = watch::channel(false);
        let tx = self.tx.clone();
        tasks.spawn(async move {
            let (code, signal) = match child.wait().await {
                Ok(st) => (st.code(), st.signal()),
                Err(_) => (None, None),
            };
            let _ = exit_tx.send(true);
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Cmd::Exited { epoch, code, signal });
            }
        });
        let watchdog = self.spawn_memory_watchdog(pid, spec.max_memory_mb, epoch);
        self.running = Some(Running {
            pid,
            exited: exit_rx,
            watchdog,
        });

        self.update(|mp| {
            mp.pid = Some(pid);
            mp.interpreter = interpreter.clone();
            mp.started_at = Some(Utc::now());
            mp.max_memory_mb = spec.max_memory_mb;
            mp.status = ProcessStatus::Online;
        });
        self.event(format!("attempt=spawn outcome=online pid={pid} interpreter={interpreter}"));
        self.log(&format!("started pid={pid} interpreter={interpreter} main={main_file}")).await;
        Ok(())
    }

    fn spawn_child(
        &self,
        dir: &Path,
        interpreter: &str,
        main_file: &str,
        procs_file: Option<PathBuf>,
    ) -> std::io::Result<tokio::process::Child> {
        let mut cmd = std::process::Command::new(interpreter);
        cmd.arg(main_file)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("BOTMASTER_INSTANCE", &self.id)
            .env("BOTMASTER_NAMESPACE", &self.shared.cfg.supervisor.namespace);
        unsafe {
            cmd.pre_exec(move || {
                let _ = setsid();
                // "0" means "self" in cgroup.procs. Attaching is best-effort.
                if let Some(p) = procs_file.as_ref()
                    && let Ok(mut f) = std::fs::OpenOptions::new().write(true).open(p)
                {
                    let _ = f.write_all(b"0\n");
                }
                Ok(())
            });
        }
        let mut cmd = tokio::process::Command::from(cmd);
        cmd.kill_on_drop(true);
        cmd.spawn()
    }

    fn spawn_memory_watchdog(&self, pid: u32, max_memory_mb: u32, epoch: u64) -> JoinHandle<()> {
        let limit = u64::from(max_memory_mb) * 1024 * 1024;
        let interval = self.shared.cfg.supervisor.memory_check_interval();
        let limiter = self.shared.limiter.clone();
        let id = self.id.clone();
        let tx = self.tx.clone();
        self.shared.tasks.spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tick.tick().await;
                let group = limiter.get_memory_usage(&id).map(|u| u.current);
                let used = group.max(procstat::rss_bytes(pid));
                if let Some(used) = used
                    && used > limit
                {
                    if let Some(tx) = tx.upgrade() {
                        let _ = tx.send(Cmd::MemoryExceeded { epoch, used_bytes: used });
                    }
                    break;
                }
            }
        })
    }

    /// SIGTERM the process group, wait up to the grace period, then SIGKILL.
    async fn stop_running(&mut self) -> PmResult<()> {
        let Some(mut run) = self.running.take() else {
            return Ok(());
        };
        self.epoch = self.epoch.wrapping_add(1);
        run.watchdog.abort();

        let grace = self.shared.cfg.supervisor.stop_grace_period();
        let pgid = Pid::from_raw(run.pid as i32);
        self.event(format!("attempt=signal sig=SIGTERM pid={}", run.pid));
        let _ = killpg(pgid, Signal::SIGTERM);

        let t0 = Instant::now();
        if tokio::time::timeout(grace, run.exited.wait_for(|e| *e)).await.is_ok() {
            self.event(format!("outcome=grace_exit elapsed_ms={}", t0.elapsed().as_millis()));
            return Ok(());
        }

        self.event(format!(
            "outcome=grace_expired elapsed_ms={} decision=kill",
            t0.elapsed().as_millis()
        ));
        self.log(&format!(
            "no exit within {}ms of SIGTERM, sending SIGKILL",
            grace.as_millis()
        ))
        .await;
        let _ = killpg(pgid, Signal::SIGKILL);
        self.shared.limiter.kill_all(&self.id);
        if tokio::time::timeout(KILL_SETTLE, run.exited.wait_for(|e| *e)).await.is_err() {
            self.event("outcome=kill_failed");
            return Err(PmError::Internal(anyhow::anyhow!(
                "{}: still running after SIGKILL",
                self.id
            )));
        }
        self.event("outcome=killed");
        Ok(())
    }

    /// Immediate SIGKILL, used by delete.
    async fn kill_running(&mut self, reason: &str) {
        let Some(mut run) = self.running.take() else {
            return;
        };
        self.epoch = self.epoch.wrapping_add(1);
        run.watchdog.abort();
        self.event(format!("attempt=kill sig=SIGKILL pid={} reason={reason}", run.pid));
        let _ = killpg(Pid::from_raw(run.pid as i32), Signal::SIGKILL);
        self.shared.limiter.kill_all(&self.id);
        if tokio::time::timeout(KILL_SETTLE, run.exited.wait_for(|e| *e)).await.is_err() {
            self.event("outcome=kill_unconfirmed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_match_wire_format() {
        assert_eq!(ProcessStatus::NotFound.as_str(), "not_found");
        assert_eq!(
            serde_json::to_string(&ProcessStatus::Online).unwrap(),
            "\"online\""
        );
        assert_eq!(
            serde_json::to_string(&ProcessStatus::NotFound).unwrap(),
            "\"not_found\""
        );
    }

    #[test]
    fn start_options_follow_instance_record() {
        let cfg = MasterConfig::with_data_directory("/tmp/x");
        let mut inst = Instance::new(&cfg, "bot1", Runtime::Python, 64);
        inst.auto_install = false;
        let opts = StartOptions::from(&inst);
        assert!(!opts.auto_install);
        assert!(opts.auto_restart);
        assert_eq!(opts.main_file.as_deref(), Some("main.py"));
    }
}
