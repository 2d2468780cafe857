use crate::pm::cli::{Cmd, OutputFormat, ScheduleCmd};
use crate::pm::rpc::{self, Request, Response};
use crate::pm::scheduler::{TaskAction, TaskPatch, TaskSpec};
use clap::Parser;
use std::path::PathBuf;
use std::{env, fmt};

#[derive(Debug, Parser)]
#[command(name = "botctl", version, about = "botmaster control client")]
pub struct BotctlArgs {
    /// Unix socket path to the botmaster daemon
    #[arg(short = 's', long = "sock")]
    pub sock: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Option<Cmd>,
}

fn resolve_sock(args: &BotctlArgs) -> anyhow::Result<PathBuf> {
    if let Some(sock) = args.sock.clone() {
        return Ok(sock);
    }
    if let Ok(v) = env::var("BOTCTL_SOCK") {
        let t = v.trim();
        if !t.is_empty() {
            return Ok(PathBuf::from(t));
        }
    }

    anyhow::bail!("{}", MissingSockHelp);
}

struct MissingSockHelp;

impl fmt::Display for MissingSockHelp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "no botmaster socket specified")?;
        writeln!(f)?;
        writeln!(f, "botctl does not read the botmaster config file.")?;
        writeln!(f, "Provide the daemon unix socket path via one of:")?;
        writeln!(f, "  - botctl --sock /path/to/botmaster.sock <command>")?;
        writeln!(f, "  - botctl -s /path/to/botmaster.sock <command>")?;
        writeln!(f, "  - export BOTCTL_SOCK=/path/to/botmaster.sock")?;
        writeln!(f)?;
        writeln!(f, "Examples:")?;
        writeln!(f, "  botctl --sock /tmp/botmaster.sock status")?;
        writeln!(f, "  BOTCTL_SOCK=/tmp/botmaster.sock botctl schedule list bot1")?;
        Ok(())
    }
}

fn print_message(resp: &Response) {
    if !resp.message.trim().is_empty() {
        println!("{}", resp.message.trim_end());
    }
}

fn print_formatted(resp: &Response, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Text => println!("{}", resp.render_text()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(resp)?),
    }
    Ok(())
}

fn schedule_request(cmd: ScheduleCmd) -> anyhow::Result<Request> {
    Ok(match cmd {
        ScheduleCmd::List { instance, .. } => Request::ScheduleList { instance },
        ScheduleCmd::Add {
            instance,
            action,
            cron,
            command,
            name,
            disabled,
        } => Request::ScheduleCreate(TaskSpec {
            instance_id: instance,
            name: name.unwrap_or_default(),
            action: action.parse::<TaskAction>()?,
            command,
            cron_expression: cron,
            enabled: !disabled,
        }),
        ScheduleCmd::Edit {
            id,
            action,
            cron,
            command,
            name,
        } => Request::ScheduleUpdate {
            id,
            patch: TaskPatch {
                name,
                action: action.map(|a| a.parse::<TaskAction>()).transpose()?,
                command,
                cron_expression: cron,
                enabled: None,
            },
        },
        ScheduleCmd::Delete { id } => Request::ScheduleDelete { id },
        ScheduleCmd::Toggle { id } => Request::ScheduleToggle { id },
        ScheduleCmd::Run { id } => Request::ScheduleRun { id },
    })
}

pub fn run() -> anyhow::Result<()> {
    let args = BotctlArgs::parse();
    let sock = resolve_sock(&args)?;

    let cmd = args.cmd.unwrap_or(Cmd::Status {
        name: None,
        format: OutputFormat::Text,
    });

    match cmd {
        Cmd::Create {
            name,
            runtime,
            memory,
            main_file,
            deps_file,
            no_install,
            no_restart,
        } => {
            let req = Request::Create {
                name,
                runtime,
                max_memory_mb: memory,
                main_file,
                deps_file,
                auto_install: !no_install,
                auto_restart: !no_restart,
            };
            print_message(&rpc::client_call(&sock, &req)?);
        }
        Cmd::Remove { name } => print_message(&rpc::client_call(&sock, &Request::Remove { name })?),
        Cmd::Start { name } => print_message(&rpc::client_call(&sock, &Request::Start { name })?),
        Cmd::Stop { name } => print_message(&rpc::client_call(&sock, &Request::Stop { name })?),
        Cmd::Restart { name } => print_message(&rpc::client_call(&sock, &Request::Restart { name })?),
        Cmd::Status { name, format } => {
            let resp = rpc::client_call(&sock, &Request::Status { name })?;
            if resp.statuses.is_empty() && matches!(format, OutputFormat::Text) {
                println!("(no instances)");
            } else {
                print_formatted(&resp, format)?;
            }
        }
        Cmd::Logs { name, n } => print_message(&rpc::client_call(&sock, &Request::Logs { name, n })?),
        Cmd::ClearLogs { name } => print_message(&rpc::client_call(&sock, &Request::ClearLogs { name })?),
        Cmd::Schedule(sc) => {
            let format = match &sc {
                ScheduleCmd::List { format, .. } => *format,
                _ => OutputFormat::Text,
            };
            let listing = matches!(sc, ScheduleCmd::List { .. });
            let resp = rpc::client_call(&sock, &schedule_request(sc)?)?;
            if listing {
                if resp.schedules.is_empty() && matches!(format, OutputFormat::Text) {
                    println!("(no schedules)");
                } else {
                    print_formatted(&resp, format)?;
                }
            } else {
                print_message(&resp);
            }
        }
        Cmd::Events { name, n, format } => {
            let resp = rpc::client_call(&sock, &Request::Events { name, n })?;
            match format {
                OutputFormat::Text => {
                    for e in resp.events {
                        if let Some(app) = e.app {
                            println!("{} [{}] app={} {}", e.ts, e.component, app, e.message);
                        } else {
                            println!("{} [{}] {}", e.ts, e.component, e.message);
                        }
                    }
                }
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&resp)?),
            }
        }
        Cmd::Version => print_message(&rpc::client_call(&sock, &Request::ServerVersion)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_add_builds_a_task_spec() {
        let req = schedule_request(ScheduleCmd::Add {
            instance: "bot1".into(),
            action: "run-command".into(),
            cron: "*/15 * * * *".into(),
            command: Some("echo hi".into()),
            name: None,
            disabled: false,
        })
        .unwrap();
        match req {
            Request::ScheduleCreate(spec) => {
                assert_eq!(spec.action, TaskAction::RunCommand);
                assert!(spec.enabled);
                assert!(spec.name.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_action_is_rejected_client_side() {
        let r = schedule_request(ScheduleCmd::Edit {
            id: "t1".into(),
            action: Some("explode".into()),
            cron: None,
            command: None,
            name: None,
        });
        assert!(r.is_err());
    }

    #[test]
    fn botctl_parses_nested_schedule_commands() {
        let args = BotctlArgs::try_parse_from([
            "botctl", "-s", "/tmp/bm.sock", "schedule", "add", "bot1", "restart", "0 3 * * *",
        ])
        .unwrap();
        assert_eq!(args.sock.as_deref(), Some(std::path::Path::new("/tmp/bm.sock")));
        assert!(matches!(args.cmd, Some(Cmd::Schedule(ScheduleCmd::Add { .. }))));
    }
}
