use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const MAX_EVENTS: usize = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    pub ts: String,
    pub component: String,
    #[serde(default)]
    pub app: Option<String>,
    pub message: String,
}

/// Bounded ring of daemon events ("what happened"), mirrored to tracing.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    inner: Arc<Mutex<VecDeque<EventEntry>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, component: &str, app: Option<&str>, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        match app {
            Some(a) => tracing::info!(target: "botmaster", "[{component}] app={a} {msg}"),
            None => tracing::info!(target: "botmaster", "[{component}] {msg}"),
        }
        let entry = EventEntry {
            ts: Local::now().format("%Y-%m-%d_%H:%M:%S%.3f").to_string(),
            component: component.to_string(),
            app: app.map(|s| s.to_string()),
            message: msg.to_string(),
        };
        let mut q = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        q.push_back(entry);
        while q.len() > MAX_EVENTS {
            q.pop_front();
        }
    }

    /// The last `n` events, oldest first, optionally for one instance.
    pub fn recent(&self, app: Option<&str>, n: usize) -> Vec<EventEntry> {
        let q = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<EventEntry> = q
            .iter()
            .rev()
            .filter(|e| app.is_none() || e.app.as_deref() == app)
            .take(n)
            .cloned()
            .collect();
        out.reverse();
        out
    }
}
