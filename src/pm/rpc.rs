use crate::pm::events::EventEntry;
use crate::pm::scheduler::{ScheduledTask, TaskPatch, TaskSpec};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Request {
    Create {
        name: String,
        runtime: String,
        max_memory_mb: u32,
        #[serde(default)]
        main_file: Option<String>,
        #[serde(default)]
        deps_file: Option<String>,
        #[serde(default = "default_true")]
        auto_install: bool,
        #[serde(default = "default_true")]
        auto_restart: bool,
    },
    Remove { name: String },
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    Status { name: Option<String> },
    Logs { name: String, #[serde(default = "default_log_lines")] n: usize },
    ClearLogs { name: String },
    ScheduleList {
        #[serde(default)]
        instance: Option<String>,
    },
    ScheduleCreate(TaskSpec),
    ScheduleUpdate { id: String, patch: TaskPatch },
    ScheduleDelete { id: String },
    ScheduleToggle { id: String },
    ScheduleRun { id: String },
    Events {
        #[serde(default)]
        name: Option<String>,
        #[serde(default = "default_event_lines")]
        n: usize,
    },
    ServerVersion,
}

fn default_true() -> bool {
    true
}

fn default_log_lines() -> usize {
    50
}

fn default_event_lines() -> usize {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEntry {
    pub instance: String,
    pub runtime: String,
    /// Persisted run intent: running / stopped / errored.
    #[serde(default)]
    pub desired: String,
    /// Live supervisor state.
    pub status: String,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub memory_bytes: Option<u64>,
    #[serde(default)]
    pub memory_max_bytes: Option<u64>,
    #[serde(default)]
    pub cpu_percent: Option<f64>,
    #[serde(default)]
    pub uptime_ms: Option<i64>,
    #[serde(default)]
    pub restart_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub statuses: Vec<StatusEntry>,
    #[serde(default)]
    pub schedules: Vec<ScheduledTask>,
    #[serde(default)]
    pub events: Vec<EventEntry>,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn render_text(&self) -> String {
        if !self.statuses.is_empty() {
            return self.render_statuses();
        }
        if !self.schedules.is_empty() {
            return self.render_schedules();
        }
        if !self.message.is_empty() {
            return self.message.clone();
        }
        "(nothing to show)".to_string()
    }

    fn render_statuses(&self) -> String {
        let headers = [
            "instance", "runtime", "desired", "status", "pid", "memory", "cpu", "uptime", "restarts",
        ];
        let rows: Vec<Vec<String>> = self
            .statuses
            .iter()
            .map(|s| {
                let memory = match (s.memory_bytes, s.memory_max_bytes) {
                    (Some(cur), Some(max)) => format!("{}/{}", fmt_mib(cur), fmt_mib(max)),
                    (Some(cur), None) => fmt_mib(cur),
                    (None, Some(max)) => format!("-/{}", fmt_mib(max)),
                    (None, None) => "-".to_string(),
                };
                vec![
                    s.instance.clone(),
                    s.runtime.clone(),
                    dash(&s.desired),
                    s.status.clone(),
                    s.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                    memory,
                    s.cpu_percent
                        .map(|c| format!("{c:.1}%"))
                        .unwrap_or_else(|| "-".to_string()),
                    s.uptime_ms.map(fmt_uptime_ms).unwrap_or_else(|| "-".to_string()),
                    s.restart_count.to_string(),
                ]
            })
            .collect();
        render_table(&headers, &rows)
    }

    fn render_schedules(&self) -> String {
        let headers = [
            "id", "instance", "name", "action", "cron", "enabled", "last_run", "next_run",
        ];
        let rows: Vec<Vec<String>> = self
            .schedules
            .iter()
            .map(|t| {
                let mut action = t.action.to_string();
                if let Some(c) = t.command.as_deref() {
                    action = format!("{action}: {c}");
                }
                vec![
                    t.id.clone(),
                    t.instance_id.clone(),
                    t.name.clone(),
                    action,
                    t.cron_expression.clone(),
                    if t.enabled { "enabled" } else { "disabled" }.to_string(),
                    fmt_local(t.last_run),
                    fmt_local(t.next_run),
                ]
            })
            .collect();
        render_table(&headers, &rows)
    }
}

fn dash(s: &str) -> String {
    if s.is_empty() { "-".to_string() } else { s.to_string() }
}

fn fmt_local(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.with_timezone(&Local).format("%Y-%m-%d_%H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn fmt_mib(bytes: u64) -> String {
    format!("{:.1}M", bytes as f64 / (1024.0 * 1024.0))
}

fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    fn pad(s: &str, width: usize) -> String {
        let len = s.chars().count();
        if len >= width {
            return s.to_string();
        }
        format!("{s}{}", " ".repeat(width - len))
    }

    fn border(widths: &[usize]) -> String {
        let mut out = String::from("+");
        for w in widths {
            // 1 leading + 1 trailing padding space per cell.
            out.push_str(&"-".repeat(*w + 2));
            out.push('+');
        }
        out
    }

    fn row_line(cols: &[String], widths: &[usize]) -> String {
        let mut out = String::from("|");
        for (i, w) in widths.iter().enumerate() {
            let v = cols.get(i).map(|s| s.as_str()).unwrap_or("");
            out.push(' ');
            out.push_str(&pad(v, *w));
            out.push_str(" |");
        }
        out
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for r in rows {
        for (i, c) in r.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(c.chars().count());
            }
        }
    }

    let top = border(&widths);
    let mut out = String::new();
    out.push_str(&top);
    out.push('\n');
    let header_cols: Vec<String> = headers.iter().map(|s| s.to_string()).collect();
    out.push_str(&row_line(&header_cols, &widths));
    out.push('\n');
    out.push_str(&top);
    out.push('\n');
    for r in rows {
        out.push_str(&row_line(r, &widths));
        out.push('\n');
    }
    out.push_str(&top);
    out
}

fn fmt_uptime_ms(ms: i64) -> String {
    if ms < 0 {
        return "-".to_string();
    }
    let mut s = (ms as u64 + 500) / 1000;
    let days = s / 86_400;
    s %= 86_400;
    let hours = s / 3_600;
    s %= 3_600;
    let mins = s / 60;
    let secs = s % 60;
    if days > 0 {
        format!("{days}d{hours:02}h")
    } else if hours > 0 {
        format!("{hours}h{mins:02}m")
    } else if mins > 0 {
        format!("{mins}m{secs:02}s")
    } else {
        format!("{secs}s")
    }
}

/// One request, one response line. A `ok: false` response becomes an error.
pub fn client_call(sock: &Path, req: &Request) -> anyhow::Result<Response> {
    let mut stream = UnixStream::connect(sock).map_err(|e| {
        anyhow::anyhow!(
            "failed to connect to botmaster socket {}: {e}",
            sock.display()
        )
    })?;

    let line = serde_json::to_string(req)? + "\n";
    stream.write_all(line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut resp_line = String::new();
    reader.read_line(&mut resp_line)?;
    if resp_line.trim().is_empty() {
        anyhow::bail!("empty response from daemon");
    }
    let resp: Response = serde_json::from_str(resp_line.trim_end())?;
    if !resp.ok {
        anyhow::bail!("{}", resp.message);
    }
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_use_type_and_data_tags() {
        let v = serde_json::to_value(Request::Start { name: "bot1".into() }).unwrap();
        assert_eq!(v, serde_json::json!({"type": "Start", "data": {"name": "bot1"}}));

        let raw = r#"{"type":"ScheduleCreate","data":{"instanceId":"bot1","action":"run-command","command":"echo hi","cronExpression":"*/5 * * * *"}}"#;
        match serde_json::from_str::<Request>(raw).unwrap() {
            Request::ScheduleCreate(spec) => {
                assert_eq!(spec.instance_id, "bot1");
                assert!(spec.enabled);
                assert_eq!(spec.command.as_deref(), Some("echo hi"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let raw = r#"{"type":"Logs","data":{"name":"bot1"}}"#;
        assert!(matches!(serde_json::from_str::<Request>(raw).unwrap(), Request::Logs { n: 50, .. }));
    }

    #[test]
    fn status_table_has_one_row_per_instance() {
        let resp = Response {
            ok: true,
            statuses: vec![StatusEntry {
                instance: "bot1".into(),
                runtime: "python".into(),
                desired: "running".into(),
                status: "online".into(),
                pid: Some(4242),
                memory_bytes: Some(10 * 1024 * 1024),
                memory_max_bytes: Some(128 * 1024 * 1024),
                cpu_percent: Some(1.25),
                uptime_ms: Some(61_000),
                restart_count: 2,
            }],
            ..Default::default()
        };
        let text = resp.render_text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[1].contains("instance"));
        assert!(lines[3].contains("4242"));
        assert!(lines[3].contains("10.0M/128.0M"));
        assert!(lines[3].contains("1m01s"));
        assert!(lines.iter().all(|l| l.len() == lines[0].len()));
    }

    #[test]
    fn uptime_picks_the_two_largest_units() {
        assert_eq!(fmt_uptime_ms(4_000), "4s");
        assert_eq!(fmt_uptime_ms(3_600_000 + 120_000), "1h02m");
        assert_eq!(fmt_uptime_ms(2 * 86_400_000 + 3_600_000), "2d01h");
        assert_eq!(fmt_uptime_ms(-1), "-");
    }
}
