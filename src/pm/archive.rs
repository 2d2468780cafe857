use anyhow::Context as _;
use async_trait::async_trait;
use chrono::Local;
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// Snapshots an instance directory for the `backup` action.
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Returns the archive's file name.
    async fn archive(&self, instance_id: &str, instance_dir: &Path) -> anyhow::Result<String>;
}

/// `tar -czf <backups>/<id>-<timestamp>.tar.gz`, skipping interpreter environments and
/// installed packages.
#[derive(Debug, Clone)]
pub struct TarArchiver {
    backups_dir: PathBuf,
}

const EXCLUDES: [&str; 2] = [".venv", "node_modules"];

impl TarArchiver {
    pub fn new(backups_dir: &Path) -> Self {
        Self {
            backups_dir: backups_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl Archiver for TarArchiver {
    async fn archive(&self, instance_id: &str, instance_dir: &Path) -> anyhow::Result<String> {
        anyhow::ensure!(
            instance_dir.is_dir(),
            "instance directory {} does not exist",
            instance_dir.display()
        );
        tokio::fs::create_dir_all(&self.backups_dir)
            .await
            .with_context(|| format!("create_dir_all {}", self.backups_dir.display()))?;

        let name = format!("{instance_id}-{}.tar.gz", Local::now().format("%Y%m%d-%H%M%S%.3f"));
        let dest = self.backups_dir.join(&name);
        let mut cmd = tokio::process::Command::new("tar");
        cmd.arg("-czf").arg(&dest);
        for ex in EXCLUDES {
            cmd.arg(format!("--exclude=./{ex}"));
        }
        cmd.arg("-C")
            .arg(instance_dir)
            .arg(".")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let out = cmd.output().await.context("spawn tar")?;
        if !out.status.success() {
            let _ = tokio::fs::remove_file(&dest).await;
            anyhow::bail!(
                "tar exit_code={:?}: {}",
                out.status.code(),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(name)
    }
}
