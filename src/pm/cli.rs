use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "botmaster", version, about = "botmaster daemon: supervises and schedules bot instances")]
pub struct Args {
    /// Path to master config YAML
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    pub config: PathBuf,
}

/// Client commands; shared by `botctl`.
#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Provision a new instance (directory, registry record, memory group)
    Create {
        name: String,
        /// node or python
        #[arg(short = 'r', long = "runtime")]
        runtime: String,
        /// Memory ceiling in MB (32..=4096)
        #[arg(short = 'm', long = "memory", default_value_t = 256)]
        memory: u32,
        /// Entry point relative to the instance directory
        #[arg(long = "main")]
        main_file: Option<String>,
        /// Dependency manifest relative to the instance directory
        #[arg(long = "deps")]
        deps_file: Option<String>,
        /// Skip dependency installation on start
        #[arg(long = "no-install")]
        no_install: bool,
        /// Leave crashed processes down
        #[arg(long = "no-restart")]
        no_restart: bool,
    },
    /// Stop an instance, drop its memory group and forget it (its directory is kept)
    Remove { name: String },
    /// Start an instance
    Start { name: String },
    /// Stop an instance (SIGTERM, SIGKILL after the grace period)
    Stop { name: String },
    /// Restart an instance
    Restart { name: String },
    /// Show status for an instance, or all (default)
    Status {
        name: Option<String>,
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Show the last lines of an instance's log
    Logs {
        name: String,
        /// Number of lines to show
        #[arg(short = 'n', default_value_t = 50)]
        n: usize,
    },
    /// Truncate an instance's log and drop rotated backups
    ClearLogs { name: String },
    /// Manage scheduled tasks
    #[command(subcommand)]
    Schedule(ScheduleCmd),
    /// Show recent daemon events ("what happened")
    Events {
        /// Optional instance filter
        name: Option<String>,
        /// Number of events to show
        #[arg(short = 'n', default_value_t = 200)]
        n: usize,
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Show the daemon's version and build
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ScheduleCmd {
    /// List scheduled tasks, optionally for one instance
    List {
        instance: Option<String>,
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Add a task. Example: `schedule add bot1 restart "0 3 * * *"`
    Add {
        instance: String,
        /// start, stop, restart, run-command or backup
        action: String,
        /// 5-field cron expression (minute hour day-of-month month day-of-week)
        cron: String,
        /// Shell command for run-command
        #[arg(long = "command")]
        command: Option<String>,
        #[arg(long = "name")]
        name: Option<String>,
        /// Create the task disabled
        #[arg(long = "disabled")]
        disabled: bool,
    },
    /// Change fields of a task
    Edit {
        id: String,
        #[arg(long = "action")]
        action: Option<String>,
        #[arg(long = "cron")]
        cron: Option<String>,
        #[arg(long = "command")]
        command: Option<String>,
        #[arg(long = "name")]
        name: Option<String>,
    },
    /// Delete a task
    Delete { id: String },
    /// Flip a task between enabled and disabled
    Toggle { id: String },
    /// Run a task now (consumes the pending occurrence)
    Run { id: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}
