use std::path::Path;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

use common::Settings;

/// WAL-shipping backup tool, consumed only through its command-line verbs.
/// The supervisor never looks inside a backup; it counts catalog entries and
/// fires push/fetch/prune.
#[async_trait]
pub trait BackupTool: Send + Sync {
    /// Raw line count of the catalog listing, header row included.
    async fn catalog_len(&self) -> Result<usize>;

    async fn backup_push(&self, data_dir: &Path) -> Result<()>;

    async fn backup_fetch(&self, data_dir: &Path, name: &str) -> Result<()>;

    /// Delete everything but the `retain` most recent backups.
    async fn prune(&self, retain: u32) -> Result<()>;
}

/// Subprocess-backed [`BackupTool`] driving the configured wal binary.
pub struct WalTool {
    cmd: String,
    wal_prefix: String,
}

impl WalTool {
    pub fn new(settings: &Settings) -> Self {
        Self {
            cmd: settings.wal_cmd.clone(),
            wal_prefix: format!("s3://{}", settings.bucket_name),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.cmd);
        cmd.env("WALE_S3_PREFIX", &self.wal_prefix);
        cmd
    }

    async fn run_checked(&self, args: &[&str]) -> Result<()> {
        let status = self
            .command()
            .args(args)
            .status()
            .await
            .with_context(|| format!("failed to run {} {}", self.cmd, args.join(" ")))?;
        if !status.success() {
            bail!("{} {} exited with {status}", self.cmd, args.join(" "));
        }
        Ok(())
    }
}

#[async_trait]
impl BackupTool for WalTool {
    async fn catalog_len(&self) -> Result<usize> {
        let output = self
            .command()
            .arg("backup-list")
            .output()
            .await
            .with_context(|| format!("failed to run {} backup-list", self.cmd))?;
        if !output.status.success() {
            bail!(
                "{} backup-list exited with {}: {}",
                self.cmd,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().filter(|line| !line.trim().is_empty()).count())
    }

    async fn backup_push(&self, data_dir: &Path) -> Result<()> {
        let dir = data_dir.to_string_lossy();
        self.run_checked(&["backup-push", dir.as_ref()]).await
    }

    async fn backup_fetch(&self, data_dir: &Path, name: &str) -> Result<()> {
        let dir = data_dir.to_string_lossy();
        self.run_checked(&["backup-fetch", dir.as_ref(), name]).await
    }

    async fn prune(&self, retain: u32) -> Result<()> {
        let retain = retain.to_string();
        self.run_checked(&["delete", "--confirm", "retain", &retain])
            .await
    }
}
