use crate::pm::error::{PmError, PmResult};
use crate::pm::instance::{Instance, InstanceStatus};
use crate::pm::persist::{read_json_or_default, write_json_atomic};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Durable record of provisioned instances.
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    async fn get(&self, id: &str) -> PmResult<Instance>;
    async fn list(&self) -> Vec<Instance>;
    async fn update_status(&self, id: &str, status: InstanceStatus) -> PmResult<()>;
    fn instance_dir(&self, id: &str) -> PathBuf;
}

/// Flat JSON file registry (`[{id, runtime, maxMemoryMb, ...}, ...]`).
///
/// The in-memory table and the file are only touched under one lock, so concurrent
/// read-modify-write callers cannot lose each other's updates.
pub struct JsonRegistry {
    path: PathBuf,
    instances_dir: PathBuf,
    table: Mutex<BTreeMap<String, Instance>>,
}

impl JsonRegistry {
    pub fn open(path: &Path, instances_dir: &Path) -> anyhow::Result<Self> {
        let records: Vec<Instance> = read_json_or_default(path)?;
        let table = records.into_iter().map(|i| (i.id.clone(), i)).collect();
        Ok(Self {
            path: path.to_path_buf(),
            instances_dir: instances_dir.to_path_buf(),
            table: Mutex::new(table),
        })
    }

    pub async fn insert(&self, instance: Instance) -> PmResult<()> {
        instance.validate()?;
        let mut table = self.table.lock().await;
        if table.contains_key(&instance.id) {
            return Err(PmError::invalid(
                "instance id",
                format!("{} already exists", instance.id),
            ));
        }
        let mut next = table.clone();
        next.insert(instance.id.clone(), instance);
        self.flush(&next).await?;
        *table = next;
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> PmResult<Instance> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let removed = next
            .remove(id)
            .ok_or_else(|| PmError::instance_not_found(id))?;
        self.flush(&next).await?;
        *table = next;
        Ok(removed)
    }

    /// Callers flush a modified copy and swap it in only on success, so a failed write
    /// leaves memory matching the file.
    async fn flush(&self, table: &BTreeMap<String, Instance>) -> PmResult<()> {
        let records: Vec<&Instance> = table.values().collect();
        write_json_atomic(&self.path, &records).await?;
        Ok(())
    }
}

#[async_trait]
impl InstanceRegistry for JsonRegistry {
    async fn get(&self, id: &str) -> PmResult<Instance> {
        self.table
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PmError::instance_not_found(id))
    }

    async fn list(&self) -> Vec<Instance> {
        self.table.lock().await.values().cloned().collect()
    }

    async fn update_status(&self, id: &str, status: InstanceStatus) -> PmResult<()> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let entry = next
            .get_mut(id)
            .ok_or_else(|| PmError::instance_not_found(id))?;
        if entry.status == status {
            return Ok(());
        }
        entry.status = status;
        self.flush(&next).await?;
        *table = next;
        Ok(())
    }

    fn instance_dir(&self, id: &str) -> PathBuf {
        self.instances_dir.join(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pm::config::MasterConfig;
    use crate::pm::instance::Runtime;

    #[tokio::test]
    async fn records_survive_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = MasterConfig::with_data_directory(tmp.path());
        let reg = JsonRegistry::open(&cfg.registry_file, &cfg.instances_directory).unwrap();
        reg.insert(Instance::new(&cfg, "bot1", Runtime::Node, 100)).await.unwrap();
        reg.update_status("bot1", InstanceStatus::Running).await.unwrap();

        let again = JsonRegistry::open(&cfg.registry_file, &cfg.instances_directory).unwrap();
        let bot = again.get("bot1").await.unwrap();
        assert_eq!(bot.status, InstanceStatus::Running);
        assert_eq!(again.instance_dir("bot1"), cfg.instances_directory.join("bot1"));
    }

    #[tokio::test]
    async fn duplicate_and_unknown_ids_are_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = MasterConfig::with_data_directory(tmp.path());
        let reg = JsonRegistry::open(&cfg.registry_file, &cfg.instances_directory).unwrap();
        reg.insert(Instance::new(&cfg, "bot1", Runtime::Node, 100)).await.unwrap();
        assert!(reg.insert(Instance::new(&cfg, "bot1", Runtime::Node, 100)).await.is_err());
        assert!(reg.get("nope").await.unwrap_err().is_not_found());
        assert!(reg.update_status("nope", InstanceStatus::Running).await.unwrap_err().is_not_found());
        assert!(reg.remove("nope").await.unwrap_err().is_not_found());
    }
}
