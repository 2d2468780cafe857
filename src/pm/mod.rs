pub mod archive;
pub mod asyncutil;
pub mod botctl_cli;
pub mod build_info;
pub mod cgroup;
pub mod cli;
pub mod clock;
pub mod config;
pub mod control;
pub mod cronexpr;
pub mod daemon;
pub mod error;
pub mod events;
mod exec;
pub mod instance;
pub mod logsink;
mod persist;
mod prepare;
pub mod procstat;
pub mod registry;
pub mod rpc;
pub mod scheduler;
pub mod supervisor;
