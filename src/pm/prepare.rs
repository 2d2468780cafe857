use crate::pm::asyncutil::TaskTracker;
use crate::pm::config::RuntimeConfig;
use crate::pm::error::Advisory;
use crate::pm::exec::{Exit, run_logged};
use crate::pm::logsink::LogSink;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Interpreter to launch for an instance: the isolated environment's interpreter when the
/// runtime uses one and it exists, the configured interpreter otherwise.
pub(crate) fn resolve_interpreter(rc: &RuntimeConfig, instance_dir: &Path) -> String {
    if let Some(env) = env_interpreter(rc, instance_dir)
        && env.exists()
    {
        return env.to_string_lossy().into_owned();
    }
    rc.interpreter.clone()
}

fn env_interpreter(rc: &RuntimeConfig, instance_dir: &Path) -> Option<PathBuf> {
    let env = rc.env_dir.as_deref()?;
    Some(instance_dir.join(env).join("bin").join("python"))
}

/// Expand `{deps}` and `{python}` in the configured install argv.
pub(crate) fn install_argv(rc: &RuntimeConfig, deps_file: &str, interpreter: &str) -> Vec<String> {
    rc.install_command
        .iter()
        .map(|a| a.replace("{deps}", deps_file).replace("{python}", interpreter))
        .collect()
}

fn warn(notes: &mut Vec<String>, id: &str, msg: String) {
    let adv = Advisory::InstallWarning(msg);
    tracing::warn!(target: "prepare", app = id, "{adv}");
    notes.push(format!("[botmaster] {adv}"));
}

/// Everything that must happen before spawn: the isolated environment (created once) and,
/// when asked, dependency installation. Failures are advisory; the start always proceeds.
/// Returns the interpreter to launch.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn prepare_instance(
    id: &str,
    instance_dir: &Path,
    rc: &RuntimeConfig,
    deps_file: &str,
    auto_install: bool,
    timeout: Duration,
    logs: &LogSink,
    tasks: &TaskTracker,
) -> String {
    let mut notes: Vec<String> = Vec::new();

    if let (Some(env_dir), Some(env_python)) = (rc.env_dir.as_deref(), env_interpreter(rc, instance_dir))
        && !env_python.exists()
    {
        logs.append(id, &format!("[botmaster] creating environment {env_dir}")).await;
        let argv = vec![rc.interpreter.clone(), "-m".into(), "venv".into(), env_dir.to_string()];
        match run_logged(&argv, instance_dir, timeout, logs, tasks, id).await {
            Ok(exit) if exit.success() => {}
            Ok(exit) => warn(&mut notes, id, format!("environment creation failed: {}", exit.describe())),
            Err(e) => warn(&mut notes, id, format!("environment creation failed: {e:#}")),
        }
    }
    let interpreter = resolve_interpreter(rc, instance_dir);

    if auto_install && instance_dir.join(deps_file).is_file() && !rc.install_command.is_empty() {
        let argv = install_argv(rc, deps_file, &interpreter);
        logs.append(id, &format!("[botmaster] installing dependencies: {}", argv.join(" "))).await;
        match run_logged(&argv, instance_dir, timeout, logs, tasks, id).await {
            Ok(exit) if exit.success() => {
                logs.append(id, "[botmaster] dependencies installed").await;
            }
            Ok(Exit::TimedOut) => warn(
                &mut notes,
                id,
                format!("install timed out after {}ms", timeout.as_millis()),
            ),
            Ok(exit) => warn(&mut notes, id, format!("install failed: {}", exit.describe())),
            Err(e) => warn(&mut notes, id, format!("install failed: {e:#}")),
        }
    }

    for n in notes {
        logs.append(id, &n).await;
    }
    interpreter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pm::config::LogConfig;

    fn shell_runtime(install: &str) -> RuntimeConfig {
        RuntimeConfig {
            interpreter: "/bin/sh".into(),
            main_file: "main.sh".into(),
            deps_file: "deps.txt".into(),
            install_command: vec!["/bin/sh".into(), "-c".into(), install.into()],
            env_dir: None,
        }
    }

    #[test]
    fn placeholders_expand_in_install_argv() {
        let rc = RuntimeConfig::python_defaults();
        let argv = install_argv(&rc, "requirements.txt", "/srv/bot/.venv/bin/python");
        assert_eq!(argv[0], "/srv/bot/.venv/bin/python");
        assert_eq!(argv.last().unwrap(), "requirements.txt");
    }

    #[test]
    fn env_interpreter_wins_only_when_present() {
        let tmp = tempfile::TempDir::new().unwrap();
        let rc = RuntimeConfig::python_defaults();
        assert_eq!(resolve_interpreter(&rc, tmp.path()), "python3");
        let bin = tmp.path().join(".venv/bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("python"), "").unwrap();
        assert!(resolve_interpreter(&rc, tmp.path()).ends_with(".venv/bin/python"));
    }

    #[tokio::test]
    async fn failed_install_is_logged_and_not_fatal() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("deps.txt"), "x\n").unwrap();
        let logs = LogSink::new(&tmp.path().join("logs"), &LogConfig::default());
        let tasks = TaskTracker::new();
        let rc = shell_runtime("echo installing; exit 7");
        let interp = prepare_instance("bot1", tmp.path(), &rc, "deps.txt", true, Duration::from_secs(5), &logs, &tasks).await;
        assert_eq!(interp, "/bin/sh");
        let text = logs.tail("bot1", 20).await.unwrap().join("\n");
        assert!(text.contains("installing"));
        assert!(text.contains("dependency install failed"));
    }

    #[tokio::test]
    async fn install_skipped_without_manifest() {
        let tmp = tempfile::TempDir::new().unwrap();
        let logs = LogSink::new(&tmp.path().join("logs"), &LogConfig::default());
        let tasks = TaskTracker::new();
        let rc = shell_runtime("echo should-not-run");
        prepare_instance("bot1", tmp.path(), &rc, "deps.txt", true, Duration::from_secs(5), &logs, &tasks).await;
        assert!(logs.tail("bot1", 20).await.unwrap().is_empty());
    }
}
