use crate::pm::asyncutil::TaskTracker;
use crate::pm::logsink::LogSink;
use anyhow::Context as _;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::os::unix::process::CommandExt as _;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

/// How a bounded helper command (installer, scheduled command) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    Code(Option<i32>),
    TimedOut,
}

impl Exit {
    pub(crate) fn success(&self) -> bool {
        matches!(self, Exit::Code(Some(0)))
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Exit::Code(Some(c)) => format!("exit_code={c}"),
            Exit::Code(None) => "exit_code=- (signalled)".to_string(),
            Exit::TimedOut => "timed_out".to_string(),
        }
    }
}

/// Run `argv` in `cwd` with output appended to the instance log. The command gets its own
/// process group so a timeout kills whatever it started, not just the leader.
pub(crate) async fn run_logged(
    argv: &[String],
    cwd: &Path,
    timeout: Duration,
    logs: &LogSink,
    tasks: &TaskTracker,
    id: &str,
) -> anyhow::Result<Exit> {
    let (program, args) = argv.split_first().context("empty command")?;
    let mut std_cmd = std::process::Command::new(program);
    std_cmd
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    let mut cmd = tokio::process::Command::from(std_cmd);
    cmd.kill_on_drop(true);

    let t0 = Instant::now();
    let mut child = cmd.spawn().map_err(|e| {
        anyhow::anyhow!(
            "spawn cwd={} argv={} failed: kind={:?} os_error={:?} err={}",
            cwd.display(),
            argv.join(" "),
            e.kind(),
            e.raw_os_error(),
            e
        )
    })?;
    let pid = child.id();
    let pumps: Vec<_> = [
        child.stdout.take().map(|s| logs.spawn_pump(tasks, id, s, None)),
        child.stderr.take().map(|s| logs.spawn_pump(tasks, id, s, Some("[err]"))),
    ]
    .into_iter()
    .flatten()
    .collect();

    let exit = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => Exit::Code(status.context("wait for command")?.code()),
        Err(_) => {
            if let Some(pid) = pid {
                let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
            let _ = child.wait().await;
            Exit::TimedOut
        }
    };
    // A background grandchild can hold the pipes open; do not wait on it forever.
    for h in pumps {
        let _ = tokio::time::timeout(Duration::from_secs(2), h).await;
    }
    tracing::debug!(
        target: "exec",
        app = id,
        "argv={argv:?} {} elapsed_ms={}",
        exit.describe(),
        t0.elapsed().as_millis()
    );
    Ok(exit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pm::config::LogConfig;

    fn sh(cmd: &str) -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into(), cmd.into()]
    }

    #[tokio::test]
    async fn output_lands_in_instance_log() {
        let tmp = tempfile::TempDir::new().unwrap();
        let logs = LogSink::new(tmp.path(), &LogConfig::default());
        let tasks = TaskTracker::new();
        let exit = run_logged(&sh("echo out; echo oops >&2; exit 3"), tmp.path(), Duration::from_secs(5), &logs, &tasks, "bot1")
            .await
            .unwrap();
        assert_eq!(exit, Exit::Code(Some(3)));
        let lines = logs.tail("bot1", 10).await.unwrap().join("\n");
        assert!(lines.contains("out"));
        assert!(lines.contains("[err] oops"));
    }

    #[tokio::test]
    async fn slow_command_is_killed_at_timeout() {
        let tmp = tempfile::TempDir::new().unwrap();
        let logs = LogSink::new(tmp.path(), &LogConfig::default());
        let tasks = TaskTracker::new();
        let t0 = Instant::now();
        let exit = run_logged(&sh("sleep 30"), tmp.path(), Duration::from_millis(200), &logs, &tasks, "bot1")
            .await
            .unwrap();
        assert_eq!(exit, Exit::TimedOut);
        assert!(t0.elapsed() < Duration::from_secs(10));
    }
}
