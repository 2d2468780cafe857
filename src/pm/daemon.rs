use crate::pm::archive::TarArchiver;
use crate::pm::asyncutil::TaskTracker;
use crate::pm::cgroup::MemoryLimiter;
use crate::pm::clock::{Clock, SystemClock};
use crate::pm::config::MasterConfig;
use crate::pm::control::{Control, InstanceReport};
use crate::pm::error::PmError;
use crate::pm::events::EventLog;
use crate::pm::instance::{Instance, Runtime};
use crate::pm::logsink::LogSink;
use crate::pm::registry::{InstanceRegistry, JsonRegistry};
use crate::pm::rpc::{Request, Response, StatusEntry};
use crate::pm::scheduler::{Scheduler, SchedulerDeps};
use crate::pm::supervisor::Supervisor;
use anyhow::Context as _;
use nix::unistd::geteuid;
use std::fs;
use std::os::unix::fs::PermissionsExt as _;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};

const TASK_STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Everything one daemon owns, wired together.
pub struct Daemon {
    cfg: MasterConfig,
    control: Arc<Control>,
    scheduler: Scheduler,
    logs: LogSink,
    events: EventLog,
    tasks: TaskTracker,
}

impl Daemon {
    /// Build the component graph over `cfg`'s data directory. Nothing is started yet.
    pub fn build(cfg: MasterConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        for dir in [
            &cfg.data_directory,
            &cfg.instances_directory,
            &cfg.logs_directory,
            &cfg.backups_directory,
        ] {
            fs::create_dir_all(dir).with_context(|| format!("create_dir_all {}", dir.display()))?;
        }

        let tasks = TaskTracker::new();
        let events = EventLog::new();
        let logs = LogSink::new(&cfg.logs_directory, &cfg.logs);
        let limiter = MemoryLimiter::new(&cfg);
        let supervisor = Supervisor::new(cfg.clone(), limiter, logs.clone(), events.clone(), tasks.clone());
        let registry = Arc::new(JsonRegistry::open(&cfg.registry_file, &cfg.instances_directory)?);
        let archiver = Arc::new(TarArchiver::new(&cfg.backups_directory));
        let control = Arc::new(Control::new(registry, supervisor, archiver, events.clone()));
        let scheduler = Scheduler::open(
            &cfg.schedules_file,
            SchedulerDeps {
                clock,
                target: control.clone(),
                logs: logs.clone(),
                events: events.clone(),
                tasks: tasks.clone(),
                command_timeout: Duration::from_millis(cfg.scheduler.command_timeout_ms),
            },
        )?;

        Ok(Self {
            cfg,
            control,
            scheduler,
            logs,
            events,
            tasks,
        })
    }

    pub fn control(&self) -> &Control {
        &self.control
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Start persisted-running instances, then arm persisted schedules.
    pub async fn restore(&self) -> anyhow::Result<()> {
        let limiter = self.control.supervisor().limiter();
        if !limiter.is_available() {
            self.events.push(
                "cgroup",
                None,
                format!(
                    "memory_controller=unavailable root={} (limits are watchdog-only)",
                    self.cfg.cgroup_root.display()
                ),
            );
        }
        let started = self.control.boot_restore().await;
        let armed = self.scheduler.restore().await?;
        self.events.push(
            "boot",
            None,
            format!("restored instances_started={started} schedules_armed={armed}"),
        );
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        self.control.supervisor().shutdown().await;
        self.events.push("shutdown", None, "done");
    }

    pub async fn dispatch(&self, req: Request) -> anyhow::Result<Response> {
        match req {
            Request::Create {
                name,
                runtime,
                max_memory_mb,
                main_file,
                deps_file,
                auto_install,
                auto_restart,
            } => {
                let runtime: Runtime = runtime.parse()?;
                let mut inst = Instance::new(&self.cfg, &name, runtime, max_memory_mb);
                if let Some(f) = main_file {
                    inst.main_file = f;
                }
                if let Some(f) = deps_file {
                    inst.deps_file = f;
                }
                inst.auto_install = auto_install;
                inst.auto_restart = auto_restart;
                let inst = self.control.provision(inst).await?;
                Ok(Response::ok(format!(
                    "created {} runtime={} max_memory_mb={} dir={}",
                    inst.id,
                    inst.runtime,
                    inst.max_memory_mb,
                    self.control.registry().instance_dir(&inst.id).display()
                )))
            }
            Request::Remove { name } => {
                self.control.remove_instance(&name).await?;
                let dropped = self.scheduler.delete_for_instance(&name).await?;
                Ok(Response::ok(format!("removed {name} schedules_deleted={dropped}")))
            }
            Request::Start { name } => {
                let outcome = self.control.start_instance(&name).await?;
                let mp = outcome.process();
                let pid = mp.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
                if outcome.already_running() {
                    Ok(Response::ok(format!("{name} already running pid={pid}")))
                } else {
                    Ok(Response::ok(format!("started {name} pid={pid}")))
                }
            }
            Request::Stop { name } => {
                self.control.stop_instance(&name).await?;
                Ok(Response::ok(format!("stopped {name}")))
            }
            Request::Restart { name } => {
                let mp = self.control.restart_instance(&name).await?;
                let pid = mp.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
                Ok(Response::ok(format!("restarted {name} pid={pid}")))
            }
            Request::Status { name } => {
                let reports = self.control.reports(name.as_deref()).await?;
                Ok(Response {
                    ok: true,
                    statuses: reports.iter().map(status_entry).collect(),
                    ..Default::default()
                })
            }
            Request::Logs { name, n } => {
                self.control.registry().get(&name).await?;
                let lines = self.logs.tail(&name, n).await?;
                Ok(Response::ok(lines.join("\n")))
            }
            Request::ClearLogs { name } => {
                self.control.registry().get(&name).await?;
                self.logs.clear(&name).await?;
                Ok(Response::ok(format!("cleared logs for {name}")))
            }
            Request::ScheduleList { instance } => Ok(Response {
                ok: true,
                schedules: self.scheduler.list(instance.as_deref()).await,
                ..Default::default()
            }),
            Request::ScheduleCreate(spec) => {
                let task = self.scheduler.create(spec).await?;
                Ok(Response {
                    ok: true,
                    message: format!("created schedule {}", task.id),
                    schedules: vec![task],
                    ..Default::default()
                })
            }
            Request::ScheduleUpdate { id, patch } => {
                let task = self.scheduler.update(&id, patch).await?;
                Ok(Response {
                    ok: true,
                    message: format!("updated schedule {id}"),
                    schedules: vec![task],
                    ..Default::default()
                })
            }
            Request::ScheduleDelete { id } => {
                self.scheduler.delete(&id).await?;
                Ok(Response::ok(format!("deleted schedule {id}")))
            }
            Request::ScheduleToggle { id } => {
                let task = self.scheduler.toggle(&id).await?;
                let state = if task.enabled { "enabled" } else { "disabled" };
                Ok(Response {
                    ok: true,
                    message: format!("schedule {id} {state}"),
                    schedules: vec![task],
                    ..Default::default()
                })
            }
            Request::ScheduleRun { id } => {
                if !self.scheduler.run_now(&id).await? {
                    return Err(PmError::task_not_found(id).into());
                }
                let task = self.scheduler.get(&id).await?;
                Ok(Response {
                    ok: true,
                    message: format!("ran schedule {id}"),
                    schedules: vec![task],
                    ..Default::default()
                })
            }
            Request::Events { name, n } => Ok(Response {
                ok: true,
                events: self.events.recent(name.as_deref(), n),
                ..Default::default()
            }),
            Request::ServerVersion => Ok(Response::ok(crate::pm::build_info::banner())),
        }
    }

    fn start_task_stats_reporter(&self) {
        let events = self.events.clone();
        let tasks = self.tasks.clone();
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(TASK_STATS_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                events.push(
                    "taskstats",
                    None,
                    format!("active={} ({}) spawned={}", tasks.active_count(), tasks.summary(), tasks.total_spawned()),
                );
            }
        });
    }
}

fn status_entry(r: &InstanceReport) -> StatusEntry {
    let p = &r.process;
    StatusEntry {
        instance: r.instance.id.clone(),
        runtime: r.instance.runtime.to_string(),
        desired: r.instance.status.as_str().to_string(),
        status: p.status.to_string(),
        pid: p.pid,
        memory_bytes: p.memory_bytes,
        memory_max_bytes: p.memory_max_bytes,
        cpu_percent: p.cpu_percent,
        uptime_ms: p.uptime_ms,
        restart_count: p.restart_count,
    }
}

pub fn run_daemon(cfg: &MasterConfig) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    rt.block_on(run_daemon_async(cfg.clone()))
}

pub async fn run_daemon_async(cfg: MasterConfig) -> anyhow::Result<()> {
    let sock = cfg.sock.clone();
    let sock_mode = cfg.sock_mode;
    let daemon = Arc::new(Daemon::build(cfg, Arc::new(SystemClock))?);

    daemon
        .events
        .push("boot", None, crate::pm::build_info::banner());
    if !geteuid().is_root() {
        daemon.events.push(
            "boot",
            None,
            "not running as root; memory groups need a delegated cgroup subtree",
        );
    }

    prepare_socket(&sock)?;
    let listener = UnixListener::bind(&sock)
        .map_err(|e| anyhow::anyhow!("failed to bind socket {}: {e}", sock.display()))?;
    fs::set_permissions(&sock, fs::Permissions::from_mode(sock_mode)).map_err(|e| {
        anyhow::anyhow!("failed to chmod socket {} to {:o}: {e}", sock.display(), sock_mode)
    })?;

    daemon.restore().await?;
    daemon.start_task_stats_reporter();

    let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("install SIGINT handler")?;

    daemon
        .events
        .push("rpc", None, format!("listening sock={}", sock.display()));

    loop {
        tokio::select! {
            r = listener.accept() => {
                match r {
                    Ok((stream, _addr)) => {
                        let d = Arc::clone(&daemon);
                        daemon.tasks.spawn(async move {
                            if let Err(e) = handle_connection(d, stream).await {
                                tracing::warn!(target: "rpc", "connection error: {e:#}");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(target: "rpc", "accept error: {e}");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
            _ = term.recv() => break,
            _ = int.recv() => break,
        }
    }

    daemon
        .events
        .push("shutdown", None, "signal received; stopping all instances");
    daemon.shutdown().await;
    let _ = fs::remove_file(&sock);
    Ok(())
}

fn prepare_socket(sock: &Path) -> anyhow::Result<()> {
    if let Some(parent) = sock.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            anyhow::anyhow!(
                "failed to create socket directory {}: {e}",
                parent.display()
            )
        })?;
    }

    if sock.exists() {
        // If something is already listening, fail. Otherwise remove stale socket.
        match UnixStream::connect(sock) {
            Ok(_) => anyhow::bail!(
                "botmaster already running (socket {} is accepting connections)",
                sock.display()
            ),
            Err(_) => {
                fs::remove_file(sock).map_err(|e| {
                    anyhow::anyhow!("failed to remove stale socket {}: {e}", sock.display())
                })?;
            }
        }
    }
    Ok(())
}

async fn handle_connection(daemon: Arc<Daemon>, stream: tokio::net::UnixStream) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 || line.trim().is_empty() {
        return Ok(());
    }
    let resp = match serde_json::from_str::<Request>(line.trim_end()) {
        Ok(req) => match daemon.dispatch(req).await {
            Ok(r) => r,
            // Full chain so clients see spawn and cgroup causes.
            Err(e) => Response::err(format!("{e:#}")),
        },
        Err(e) => Response::err(format!("bad request: {e}")),
    };
    let mut stream = reader.into_inner();
    let resp_line = serde_json::to_string(&resp)? + "\n";
    stream.write_all(resp_line.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
