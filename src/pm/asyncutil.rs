use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinHandle;

/// What a tracked task is for; the stats event breaks live tasks down by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Per-instance supervisor actor.
    Actor,
    /// stdout/stderr pump feeding the log sink.
    Pump,
    /// Per-task scheduler timer.
    Timer,
    Other,
}

impl TaskKind {
    const ALL: [TaskKind; 4] = [TaskKind::Actor, TaskKind::Pump, TaskKind::Timer, TaskKind::Other];

    fn slot(self) -> usize {
        match self {
            TaskKind::Actor => 0,
            TaskKind::Pump => 1,
            TaskKind::Timer => 2,
            TaskKind::Other => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Actor => "actors",
            TaskKind::Pump => "pumps",
            TaskKind::Timer => "timers",
            TaskKind::Other => "other",
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    live: [AtomicUsize; 4],
    spawned: AtomicUsize,
}

/// Counts the background tasks the daemon spawns so leaks show up in the periodic stats event.
#[derive(Debug, Clone, Default)]
pub struct TaskTracker {
    counters: Arc<Counters>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_count(&self) -> usize {
        self.counters.live.iter().map(|c| c.load(Ordering::SeqCst)).sum()
    }

    pub fn active_of(&self, kind: TaskKind) -> usize {
        self.counters.live[kind.slot()].load(Ordering::SeqCst)
    }

    /// Total number of tasks ever spawned via this tracker.
    pub fn total_spawned(&self) -> usize {
        self.counters.spawned.load(Ordering::SeqCst)
    }

    /// One-line breakdown, e.g. `actors=2 pumps=4 timers=1 other=0`.
    pub fn summary(&self) -> String {
        TaskKind::ALL
            .iter()
            .map(|k| format!("{}={}", k.as_str(), self.active_of(*k)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn spawn<F, T>(&self, fut: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_as(TaskKind::Other, fut)
    }

    /// Spawn on the runtime; the count for `kind` drops when the task completes, panics or is aborted.
    pub fn spawn_as<F, T>(&self, kind: TaskKind, fut: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.counters.spawned.fetch_add(1, Ordering::SeqCst);
        self.counters.live[kind.slot()].fetch_add(1, Ordering::SeqCst);
        let live = LiveGuard {
            counters: Arc::clone(&self.counters),
            slot: kind.slot(),
        };
        tokio::spawn(async move {
            let _live = live;
            fut.await
        })
    }
}

struct LiveGuard {
    counters: Arc<Counters>,
    slot: usize,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.counters.live[self.slot].fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn aborted_tasks_are_no_longer_active() {
        let tracker = TaskTracker::new();
        let h = tracker.spawn_as(TaskKind::Timer, std::future::pending::<()>());
        assert_eq!(tracker.active_of(TaskKind::Timer), 1);
        assert_eq!(tracker.active_count(), 1);
        h.abort();
        let _ = h.await;
        assert_eq!(tracker.active_count(), 0);
        assert_eq!(tracker.total_spawned(), 1);
    }

    #[tokio::test]
    async fn summary_lists_every_kind() {
        let tracker = TaskTracker::new();
        let a = tracker.spawn_as(TaskKind::Actor, std::future::pending::<()>());
        let p = tracker.spawn_as(TaskKind::Pump, std::future::pending::<()>());
        assert_eq!(tracker.summary(), "actors=1 pumps=1 timers=0 other=0");
        a.abort();
        p.abort();
    }
}
