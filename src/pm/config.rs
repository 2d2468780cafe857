use crate::pm::instance::Runtime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    pub data_directory: PathBuf,
    /// One sandbox directory per instance: `${instances_directory}/${id}`.
    pub instances_directory: PathBuf,
    pub logs_directory: PathBuf,
    pub backups_directory: PathBuf,
    pub schedules_file: PathBuf,
    pub registry_file: PathBuf,

    pub cgroup_root: PathBuf,
    pub cgroup_name: String,

    pub sock: PathBuf,
    pub sock_mode: u32,

    pub supervisor: SupervisorConfig,
    pub node: RuntimeConfig,
    pub python: RuntimeConfig,
    pub logs: LogConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Prefix for cgroup names and process decoration; keeps our processes apart from others.
    pub namespace: String,
    pub stop_grace_period_ms: u64,
    pub memory_check_interval_ms: u64,
    pub install_timeout_ms: u64,
    pub restart_backoff_ms: u64,
    pub max_restarts: usize,
    pub restart_window_ms: u64,
}

impl SupervisorConfig {
    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }

    pub fn memory_check_interval(&self) -> Duration {
        Duration::from_millis(self.memory_check_interval_ms.max(100))
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_millis(self.install_timeout_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            stop_grace_period_ms: default_stop_grace_period_ms(),
            memory_check_interval_ms: default_memory_check_interval_ms(),
            install_timeout_ms: default_install_timeout_ms(),
            restart_backoff_ms: default_restart_backoff_ms(),
            max_restarts: default_max_restarts(),
            restart_window_ms: default_restart_window_ms(),
        }
    }
}

/// How to run, prepare and install dependencies for one runtime kind.
///
/// In `install_command`, `{deps}` expands to the dependency manifest file name and `{python}`
/// to the resolved interpreter (the venv interpreter when `env_dir` is set).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    pub interpreter: String,
    pub main_file: String,
    pub deps_file: String,
    pub install_command: Vec<String>,
    /// Isolated environment directory relative to the instance directory (python venv).
    #[serde(default)]
    pub env_dir: Option<String>,
}

impl RuntimeConfig {
    pub fn node_defaults() -> Self {
        Self {
            interpreter: "node".to_string(),
            main_file: "index.js".to_string(),
            deps_file: "package.json".to_string(),
            install_command: vec!["npm".into(), "install".into(), "--omit=dev".into()],
            env_dir: None,
        }
    }

    pub fn python_defaults() -> Self {
        Self {
            interpreter: "python3".to_string(),
            main_file: "main.py".to_string(),
            deps_file: "requirements.txt".to_string(),
            install_command: vec![
                "{python}".into(),
                "-m".into(),
                "pip".into(),
                "install".into(),
                "-r".into(),
                "{deps}".into(),
            ],
            env_dir: Some(".venv".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub max_bytes: u64,
    pub backups: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_log_max_bytes(),
            backups: default_log_backups(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub command_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl MasterConfig {
    /// Defaults for everything, with all data paths derived from `data_directory`.
    pub fn with_data_directory(data_directory: impl Into<PathBuf>) -> Self {
        let data: PathBuf = data_directory.into();
        Self {
            instances_directory: data.join("instances"),
            logs_directory: data.join("logs"),
            backups_directory: data.join("backups"),
            schedules_file: data.join("schedules.json"),
            registry_file: data.join("instances.json"),
            data_directory: data,
            cgroup_root: default_cgroup_root(),
            cgroup_name: default_cgroup_name(),
            sock: default_sock(),
            sock_mode: default_sock_mode(),
            supervisor: SupervisorConfig::default(),
            node: RuntimeConfig::node_defaults(),
            python: RuntimeConfig::python_defaults(),
            logs: LogConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }

    pub fn runtime(&self, runtime: Runtime) -> &RuntimeConfig {
        match runtime {
            Runtime::Node => &self.node,
            Runtime::Python => &self.python,
        }
    }

    pub fn instance_dir(&self, id: &str) -> PathBuf {
        self.instances_directory.join(id)
    }
}

// -------- YAML file schema (grouped; strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct MasterConfigFile {
    global: GlobalConfigFile,
    #[serde(default)]
    cgroup: Option<CgroupConfigFile>,
    #[serde(default)]
    unix_socket: Option<UnixSocketConfigFile>,
    #[serde(default)]
    supervisor: Option<SupervisorConfigFile>,
    #[serde(default)]
    runtimes: Option<RuntimesConfigFile>,
    #[serde(default)]
    logs: Option<LogConfigFile>,
    #[serde(default)]
    scheduler: Option<SchedulerConfigFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct GlobalConfigFile {
    data_directory: PathBuf,
    #[serde(default)]
    instances_directory: Option<PathBuf>,
    #[serde(default)]
    logs_directory: Option<PathBuf>,
    #[serde(default)]
    backups_directory: Option<PathBuf>,
    #[serde(default)]
    schedules_file: Option<PathBuf>,
    #[serde(default)]
    registry_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CgroupConfigFile {
    #[serde(default = "default_cgroup_root")]
    root: PathBuf,
    #[serde(default = "default_cgroup_name")]
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnixSocketConfigFile {
    #[serde(default = "default_sock")]
    path: PathBuf,
    #[serde(default = "default_sock_mode", deserialize_with = "deserialize_sock_mode")]
    mode: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SupervisorConfigFile {
    #[serde(default = "default_namespace")]
    namespace: String,
    #[serde(default = "default_stop_grace_period_ms", deserialize_with = "deserialize_duration_ms")]
    stop_grace_period: u64,
    #[serde(default = "default_memory_check_interval_ms", deserialize_with = "deserialize_duration_ms")]
    memory_check_interval: u64,
    #[serde(default = "default_install_timeout_ms", deserialize_with = "deserialize_duration_ms")]
    install_timeout: u64,
    #[serde(default)]
    restart: Option<RestartConfigFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RestartConfigFile {
    #[serde(default = "default_restart_backoff_ms", deserialize_with = "deserialize_duration_ms")]
    backoff: u64,
    #[serde(default)]
    tolerance: Option<RestartToleranceFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RestartToleranceFile {
    #[serde(default = "default_max_restarts")]
    max_restarts: usize,
    #[serde(default = "default_restart_window_ms", deserialize_with = "deserialize_duration_ms")]
    duration: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuntimesConfigFile {
    #[serde(default)]
    node: Option<RuntimeConfig>,
    #[serde(default)]
    python: Option<RuntimeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LogConfigFile {
    #[serde(default = "default_log_max_bytes")]
    max_bytes: u64,
    #[serde(default = "default_log_backups")]
    backups: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SchedulerConfigFile {
    #[serde(default = "default_command_timeout_ms", deserialize_with = "deserialize_duration_ms")]
    command_timeout: u64,
}

fn default_cgroup_root() -> PathBuf {
    "/sys/fs/cgroup".into()
}
fn default_cgroup_name() -> String {
    "botmaster".to_string()
}
fn default_sock() -> PathBuf {
    "/tmp/botmaster.sock".into()
}
fn default_sock_mode() -> u32 {
    0o600
}
fn default_namespace() -> String {
    "bm".to_string()
}
fn default_stop_grace_period_ms() -> u64 {
    5_000
}
fn default_memory_check_interval_ms() -> u64 {
    5_000
}
fn default_install_timeout_ms() -> u64 {
    120_000
}
fn default_restart_backoff_ms() -> u64 {
    1_000
}
fn default_max_restarts() -> usize {
    10
}
fn default_restart_window_ms() -> u64 {
    3 * 60_000
}
fn default_log_max_bytes() -> u64 {
    5 * 1024 * 1024
}
fn default_log_backups() -> usize {
    1
}
fn default_command_timeout_ms() -> u64 {
    60_000
}

fn deserialize_sock_mode<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    match v {
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .map(|x| x as u32)
            .ok_or_else(|| D::Error::custom("mode must be an integer")),
        serde_yaml::Value::String(s) => parse_mode_str(&s).map_err(D::Error::custom),
        _ => Err(D::Error::custom(
            "mode must be an integer or string (e.g. 660 or \"0660\")",
        )),
    }
}

fn parse_mode_str(s: &str) -> Result<u32, String> {
    let t = s.trim();
    let t = t.strip_prefix("0o").unwrap_or(t);
    let t = t.strip_prefix("0O").unwrap_or(t);
    let t = t.strip_prefix("0").unwrap_or(t);
    u32::from_str_radix(t, 8).map_err(|e| format!("invalid socket mode {s:?}: {e}"))
}

fn deserialize_duration_ms<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    match v {
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| D::Error::custom("duration must be a positive integer (ms)")),
        serde_yaml::Value::String(s) => parse_duration_str(&s).map_err(D::Error::custom),
        _ => Err(D::Error::custom(
            "duration must be an integer milliseconds or string like \"5s\"",
        )),
    }
}

/// Parse `1500ms`, `10s`, `1m`, `2h` (fractions allowed) into milliseconds.
pub(crate) fn parse_duration_str(s: &str) -> Result<u64, String> {
    let t = s.trim();
    if t.is_empty() {
        return Err("empty duration".to_string());
    }
    if t.chars().all(|c| c.is_ascii_digit()) {
        return t.parse().map_err(|e| format!("invalid duration {s:?}: {e}"));
    }
    let idx = t
        .char_indices()
        .find(|(_, ch)| !(ch.is_ascii_digit() || *ch == '.'))
        .map(|(i, _)| i)
        .unwrap_or(0);
    if idx == 0 {
        return Err(format!("invalid duration: {s}"));
    }
    let (num_s, unit_s) = t.split_at(idx);
    let num: f64 = num_s.parse().map_err(|e| format!("invalid duration number: {e}"))?;
    let unit = unit_s.trim().to_ascii_lowercase();
    let mult: f64 = match unit.as_str() {
        "ms" => 1.0,
        "s" => 1000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        _ => return Err(format!("unknown duration unit {unit_s:?} (use ms/s/m/h)")),
    };
    Ok((num * mult).round() as u64)
}

pub fn load_master_config(config_path: &Path) -> anyhow::Result<MasterConfig> {
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    parse_master_config(&raw, base)
        .map_err(|e| anyhow::anyhow!("failed to load config {}: {e:#}", config_path.display()))
}

/// Parse config YAML, resolving relative paths against `base`.
pub fn parse_master_config(raw: &str, base: &Path) -> anyhow::Result<MasterConfig> {
    let file_cfg: MasterConfigFile = serde_yaml::from_str(raw)?;

    let resolve = |p: PathBuf| if p.is_relative() { base.join(p) } else { p };

    let gl = file_cfg.global;
    let mut cfg = MasterConfig::with_data_directory(resolve(gl.data_directory));
    if let Some(p) = gl.instances_directory {
        cfg.instances_directory = resolve(p);
    }
    if let Some(p) = gl.logs_directory {
        cfg.logs_directory = resolve(p);
    }
    if let Some(p) = gl.backups_directory {
        cfg.backups_directory = resolve(p);
    }
    if let Some(p) = gl.schedules_file {
        cfg.schedules_file = resolve(p);
    }
    if let Some(p) = gl.registry_file {
        cfg.registry_file = resolve(p);
    }

    if let Some(cg) = file_cfg.cgroup {
        cfg.cgroup_root = cg.root;
        anyhow::ensure!(
            !cg.name.trim().is_empty() && !cg.name.contains('/'),
            "cgroup.name must be a single non-empty path component"
        );
        cfg.cgroup_name = cg.name;
    }
    if let Some(us) = file_cfg.unix_socket {
        cfg.sock = resolve(us.path);
        cfg.sock_mode = us.mode;
    }
    if let Some(sv) = file_cfg.supervisor {
        anyhow::ensure!(
            !sv.namespace.is_empty() && sv.namespace.chars().all(|c| c.is_ascii_alphanumeric()),
            "supervisor.namespace must be non-empty and alphanumeric"
        );
        cfg.supervisor.namespace = sv.namespace;
        cfg.supervisor.stop_grace_period_ms = sv.stop_grace_period;
        cfg.supervisor.memory_check_interval_ms = sv.memory_check_interval;
        cfg.supervisor.install_timeout_ms = sv.install_timeout;
        if let Some(r) = sv.restart {
            cfg.supervisor.restart_backoff_ms = r.backoff;
            if let Some(t) = r.tolerance {
                cfg.supervisor.max_restarts = t.max_restarts;
                cfg.supervisor.restart_window_ms = t.duration;
            }
        }
    }
    if let Some(rt) = file_cfg.runtimes {
        if let Some(node) = rt.node {
            cfg.node = node;
        }
        if let Some(python) = rt.python {
            cfg.python = python;
        }
    }
    for (label, rc) in [("node", &cfg.node), ("python", &cfg.python)] {
        anyhow::ensure!(
            !rc.interpreter.trim().is_empty(),
            "runtimes.{label}.interpreter must not be empty"
        );
        anyhow::ensure!(
            !rc.main_file.trim().is_empty(),
            "runtimes.{label}.main_file must not be empty"
        );
    }
    if let Some(l) = file_cfg.logs {
        cfg.logs.max_bytes = l.max_bytes;
        cfg.logs.backups = l.backups;
    }
    if let Some(s) = file_cfg.scheduler {
        cfg.scheduler.command_timeout_ms = s.command_timeout;
    }

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_derives_paths_from_data_directory() {
        let cfg = parse_master_config("global:\n  data_directory: data\n", Path::new("/etc/bm")).unwrap();
        assert_eq!(cfg.data_directory, PathBuf::from("/etc/bm/data"));
        assert_eq!(cfg.instances_directory, PathBuf::from("/etc/bm/data/instances"));
        assert_eq!(cfg.schedules_file, PathBuf::from("/etc/bm/data/schedules.json"));
        assert_eq!(cfg.supervisor.stop_grace_period_ms, 5_000);
        assert_eq!(cfg.python.env_dir.as_deref(), Some(".venv"));
    }

    #[test]
    fn grouped_sections_override_defaults() {
        let raw = r#"
global:
  data_directory: /srv/bots
  logs_directory: /var/log/bots
cgroup:
  name: bots
unix_socket:
  path: run/bm.sock
  mode: "0660"
supervisor:
  stop_grace_period: 2s
  install_timeout: 3m
  restart:
    backoff: 500ms
    tolerance:
      max_restarts: 4
      duration: 1m
scheduler:
  command_timeout: 90s
"#;
        let cfg = parse_master_config(raw, Path::new("/opt")).unwrap();
        assert_eq!(cfg.logs_directory, PathBuf::from("/var/log/bots"));
        assert_eq!(cfg.cgroup_name, "bots");
        assert_eq!(cfg.sock, PathBuf::from("/opt/run/bm.sock"));
        assert_eq!(cfg.sock_mode, 0o660);
        assert_eq!(cfg.supervisor.stop_grace_period_ms, 2_000);
        assert_eq!(cfg.supervisor.install_timeout_ms, 180_000);
        assert_eq!(cfg.supervisor.restart_backoff_ms, 500);
        assert_eq!(cfg.supervisor.max_restarts, 4);
        assert_eq!(cfg.supervisor.restart_window_ms, 60_000);
        assert_eq!(cfg.scheduler.command_timeout_ms, 90_000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = parse_master_config("global:\n  data_directory: x\n  bogus: 1\n", Path::new("."));
        assert!(err.is_err());
    }

    #[test]
    fn durations_parse_units() {
        assert_eq!(parse_duration_str("1500").unwrap(), 1500);
        assert_eq!(parse_duration_str("1.5s").unwrap(), 1500);
        assert_eq!(parse_duration_str("2h").unwrap(), 7_200_000);
        assert!(parse_duration_str("3d").is_err());
        assert!(parse_duration_str("").is_err());
    }
}
