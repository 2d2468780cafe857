use crate::pm::config::MasterConfig;
use crate::pm::error::PmError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const MIN_MEMORY_MB: u32 = 32;
pub const MAX_MEMORY_MB: u32 = 4096;
const MAX_ID_LEN: usize = 64;

/// Interpreter family an instance runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Node,
    Python,
}

impl Runtime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Runtime::Node => "node",
            Runtime::Python => "python",
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Runtime {
    type Err = PmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "node" | "nodejs" => Ok(Runtime::Node),
            "python" | "python3" => Ok(Runtime::Python),
            other => Err(PmError::invalid(
                "runtime",
                format!("unsupported runtime {other:?} (supported: node, python)"),
            )),
        }
    }
}

/// Persisted run intent, written by the control layer after lifecycle calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    #[default]
    Stopped,
    Running,
    Errored,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Running => "running",
            InstanceStatus::Errored => "errored",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub runtime: Runtime,
    pub max_memory_mb: u32,
    pub main_file: String,
    pub deps_file: String,
    #[serde(default = "default_true")]
    pub auto_install: bool,
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default)]
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl Instance {
    /// A new instance with the runtime's default entry point and dependency manifest.
    pub fn new(cfg: &MasterConfig, id: &str, runtime: Runtime, max_memory_mb: u32) -> Self {
        let rc = cfg.runtime(runtime);
        Self {
            id: id.to_string(),
            name: id.to_string(),
            runtime,
            max_memory_mb,
            main_file: rc.main_file.clone(),
            deps_file: rc.deps_file.clone(),
            auto_install: true,
            auto_restart: true,
            status: InstanceStatus::Stopped,
            created_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<(), PmError> {
        validate_instance_id(&self.id)?;
        validate_memory_mb(self.max_memory_mb)?;
        validate_relative_file("mainFile", &self.main_file)?;
        validate_relative_file("depsFile", &self.deps_file)?;
        Ok(())
    }
}

/// Instance ids double as directory, cgroup and log file names.
pub fn validate_instance_id(id: &str) -> Result<(), PmError> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(PmError::invalid(
            "instance id",
            format!("length must be 1..={MAX_ID_LEN}, got {}", id.len()),
        ));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(PmError::invalid(
            "instance id",
            format!("{id:?} contains {bad:?} (allowed: A-Z a-z 0-9 - _)"),
        ));
    }
    Ok(())
}

pub fn validate_memory_mb(mb: u32) -> Result<(), PmError> {
    if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&mb) {
        return Err(PmError::invalid(
            "maxMemoryMb",
            format!("{mb} outside {MIN_MEMORY_MB}..={MAX_MEMORY_MB}"),
        ));
    }
    Ok(())
}

fn validate_relative_file(field: &'static str, name: &str) -> Result<(), PmError> {
    let t = name.trim();
    if t.is_empty() || t.starts_with('/') || t.split('/').any(|c| c == "..") {
        return Err(PmError::invalid(
            field,
            format!("{name:?} must be a relative path inside the instance directory"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_ids_are_identifier_safe() {
        assert!(validate_instance_id("bot1").is_ok());
        assert!(validate_instance_id("my_bot-2").is_ok());
        assert!(validate_instance_id("").is_err());
        assert!(validate_instance_id("../etc").is_err());
        assert!(validate_instance_id("a b").is_err());
        assert!(validate_instance_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn memory_ceiling_is_bounded() {
        assert!(validate_memory_mb(100).is_ok());
        assert!(validate_memory_mb(MIN_MEMORY_MB - 1).is_err());
        assert!(validate_memory_mb(MAX_MEMORY_MB + 1).is_err());
    }

    #[test]
    fn new_instance_takes_runtime_defaults() {
        let cfg = MasterConfig::with_data_directory("/tmp/x");
        let py = Instance::new(&cfg, "bot1", Runtime::Python, 128);
        assert_eq!(py.main_file, "main.py");
        assert_eq!(py.deps_file, "requirements.txt");
        assert!(py.validate().is_ok());

        let mut bad = py.clone();
        bad.main_file = "../escape.py".to_string();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn runtime_parses_aliases() {
        assert_eq!("NodeJS".parse::<Runtime>().unwrap(), Runtime::Node);
        assert_eq!("python3".parse::<Runtime>().unwrap(), Runtime::Python);
        assert!("ruby".parse::<Runtime>().is_err());
    }
}
