use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use tokio::process::Command;

use common::Settings;

/// Templating tool that renders engine configuration from store state.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// One-shot render. `Ok(true)` when the tool exited cleanly; a missing
    /// or failing tool is reported as `Ok(false)` so callers can keep
    /// retrying during startup ordering races.
    async fn render_once(&self) -> Result<bool>;
}

/// Subprocess-backed [`Renderer`] driving a confd-style binary.
pub struct ConfdRenderer {
    cmd: String,
    node: String,
    prefix: String,
}

impl ConfdRenderer {
    pub fn new(settings: &Settings) -> Self {
        Self {
            cmd: settings.render_cmd.clone(),
            node: settings.store_url(),
            prefix: settings.etcd_path.clone(),
        }
    }

    /// Start the renderer in watch mode. The child runs detached and is not
    /// monitored further; it is an unmanaged collaborator.
    pub fn spawn_watch(&self) -> Result<()> {
        let child = Command::new(&self.cmd)
            .args(["-watch", "-node", &self.node, "-prefix", &self.prefix])
            .spawn()
            .with_context(|| format!("failed to start {} in watch mode", self.cmd))?;
        info!(
            "configuration watcher running (pid {})",
            child.id().map_or_else(|| "?".to_string(), |p| p.to_string())
        );
        Ok(())
    }
}

#[async_trait]
impl Renderer for ConfdRenderer {
    async fn render_once(&self) -> Result<bool> {
        let status = Command::new(&self.cmd)
            .args(["-onetime", "-node", &self.node, "-prefix", &self.prefix])
            .status()
            .await;
        match status {
            Ok(status) => Ok(status.success()),
            Err(e) => {
                debug!("renderer {} not runnable yet: {e}", self.cmd);
                Ok(false)
            }
        }
    }
}
