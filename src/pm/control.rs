use crate::pm::archive::Archiver;
use crate::pm::error::{PmError, PmResult};
use crate::pm::events::EventLog;
use crate::pm::instance::{Instance, InstanceStatus};
use crate::pm::registry::{InstanceRegistry, JsonRegistry};
use crate::pm::scheduler::ActionTarget;
use crate::pm::supervisor::{ManagedProcess, StartOptions, StartOutcome, StatusReport, Supervisor};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// Registry record joined with live supervisor state.
#[derive(Debug, Clone)]
pub struct InstanceReport {
    pub instance: Instance,
    pub process: StatusReport,
}

/// Lifecycle entry point for the daemon and the scheduler: resolves instance records from
/// the registry, drives the supervisor, and keeps the persisted run intent in step.
pub struct Control {
    registry: Arc<JsonRegistry>,
    supervisor: Supervisor,
    archiver: Arc<dyn Archiver>,
    events: EventLog,
}

impl Control {
    pub fn new(
        registry: Arc<JsonRegistry>,
        supervisor: Supervisor,
        archiver: Arc<dyn Archiver>,
        events: EventLog,
    ) -> Self {
        Self {
            registry,
            supervisor,
            archiver,
            events,
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn registry(&self) -> &JsonRegistry {
        &self.registry
    }

    /// Record a new instance and give it a directory and a memory group.
    pub async fn provision(&self, instance: Instance) -> PmResult<Instance> {
        instance.validate()?;
        let dir = self.registry.instance_dir(&instance.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| PmError::Internal(anyhow::anyhow!("create_dir_all {}: {e}", dir.display())))?;
        self.registry.insert(instance.clone()).await?;

        // A missing memory controller only costs the limit; the instance still runs.
        self.supervisor
            .limiter()
            .create_group(&instance.id, instance.max_memory_mb);
        self.events.push(
            "control",
            Some(&instance.id),
            format!(
                "provisioned runtime={} max_memory_mb={} dir={}",
                instance.runtime,
                instance.max_memory_mb,
                dir.display()
            ),
        );
        Ok(instance)
    }

    pub async fn start_instance(&self, id: &str) -> PmResult<StartOutcome> {
        let inst = self.registry.get(id).await?;
        let outcome = self
            .supervisor
            .start_process(id, inst.runtime, inst.max_memory_mb, StartOptions::from(&inst))
            .await?;
        self.registry.update_status(id, InstanceStatus::Running).await?;
        Ok(outcome)
    }

    /// Stopping an instance the supervisor has never run this session only resets the
    /// persisted intent.
    pub async fn stop_instance(&self, id: &str) -> PmResult<()> {
        self.registry.get(id).await?;
        match self.supervisor.stop_process(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.registry.update_status(id, InstanceStatus::Stopped).await
    }

    /// Restarting an instance the supervisor has never run this session starts it.
    pub async fn restart_instance(&self, id: &str) -> PmResult<ManagedProcess> {
        let inst = self.registry.get(id).await?;
        let mp = match self.supervisor.restart_process(id).await {
            Ok(mp) => mp,
            Err(e) if e.is_not_found() => self
                .supervisor
                .start_process(id, inst.runtime, inst.max_memory_mb, StartOptions::from(&inst))
                .await?
                .process()
                .clone(),
            Err(e) => return Err(e),
        };
        self.registry.update_status(id, InstanceStatus::Running).await?;
        Ok(mp)
    }

    /// Kill the process, drop its memory group and forget the record. The directory stays.
    pub async fn remove_instance(&self, id: &str) -> PmResult<Instance> {
        self.registry.get(id).await?;
        self.supervisor.delete_process(id).await?;
        let removed = self.registry.remove(id).await?;
        self.events.push("control", Some(id), "removed");
        Ok(removed)
    }

    /// Bring back every instance whose persisted intent is `running`. Failures are logged
    /// and marked `errored`; they do not stop the others.
    pub async fn boot_restore(&self) -> usize {
        let mut started = 0;
        for inst in self.registry.list().await {
            if inst.status != InstanceStatus::Running {
                continue;
            }
            match self.start_instance(&inst.id).await {
                Ok(_) => started += 1,
                Err(e) => {
                    self.events
                        .push("control", Some(&inst.id), format!("boot start failed: {e}"));
                    if let Err(e) = self.registry.update_status(&inst.id, InstanceStatus::Errored).await {
                        tracing::warn!(target: "control", app = %inst.id, "attempt=mark_errored outcome=error err={e}");
                        self.events
                            .push("control", Some(&inst.id), format!("could not record errored status: {e}"));
                    }
                }
            }
        }
        started
    }

    /// One instance (NotFound if unknown) or all of them, sorted by id.
    pub async fn reports(&self, id: Option<&str>) -> PmResult<Vec<InstanceReport>> {
        let instances = match id {
            Some(id) => vec![self.registry.get(id).await?],
            None => self.registry.list().await,
        };
        let mut out = Vec::with_capacity(instances.len());
        for instance in instances {
            let process = self.supervisor.get_status(&instance.id).await;
            out.push(InstanceReport { instance, process });
        }
        Ok(out)
    }
}

#[async_trait]
impl ActionTarget for Control {
    async fn start(&self, instance_id: &str) -> PmResult<()> {
        self.start_instance(instance_id).await.map(|_| ())
    }

    async fn stop(&self, instance_id: &str) -> PmResult<()> {
        self.stop_instance(instance_id).await
    }

    async fn restart(&self, instance_id: &str) -> PmResult<()> {
        self.restart_instance(instance_id).await.map(|_| ())
    }

    async fn instance_dir(&self, instance_id: &str) -> PmResult<PathBuf> {
        self.registry.get(instance_id).await?;
        Ok(self.registry.instance_dir(instance_id))
    }

    async fn backup(&self, instance_id: &str) -> anyhow::Result<String> {
        let dir = self.instance_dir(instance_id).await?;
        self.archiver.archive(instance_id, &dir).await
    }
}
