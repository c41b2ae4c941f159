use anyhow::Result;
use log::{debug, info, warn};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use common::Settings;

use crate::engine;
use crate::store::ConfigStore;
use crate::wal::BackupTool;

/// Why the discovery/backup loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Shutdown was requested; the supervisor exits cleanly.
    Cancelled,
    /// The advertised port stopped listening. Fail fast; restarts belong to
    /// the platform, not this supervisor.
    LivenessLost,
}

/// Backup cadence in loop iterations rather than wall-clock time.
pub struct TickCounter {
    ticks: u32,
    threshold: u32,
}

impl TickCounter {
    pub fn new(threshold: u32) -> Self {
        Self { ticks: 0, threshold }
    }

    /// Advance one iteration. True when the threshold is reached. The count
    /// restarts from zero at the threshold whether or not the caller acts,
    /// so a skipped backup defers by a whole period instead of retrying
    /// every tick.
    pub fn advance(&mut self) -> bool {
        self.ticks += 1;
        if self.ticks >= self.threshold {
            self.ticks = 0;
            true
        } else {
            false
        }
    }
}

/// Republish the service address with a TTL and fire scheduled backups, one
/// cooperative loop at half-TTL cadence. Only called when an external port
/// is configured.
pub async fn run_loop(
    settings: &Settings,
    store: &dyn ConfigStore,
    wal: &dyn BackupTool,
    token: &CancellationToken,
) -> Result<LoopExit> {
    let Some(registration) = settings.registration() else {
        return Ok(LoopExit::Cancelled);
    };
    let payload = serde_json::to_string(&registration)?;
    let key = settings.service_key();
    let interval = settings.loop_interval();
    let mut counter = TickCounter::new(settings.backup_frequency);

    info!(
        "publishing {key} -> {}:{} every {}s (ttl {}s)",
        registration.host,
        registration.port,
        interval.as_secs(),
        settings.ttl_secs
    );

    loop {
        if token.is_cancelled() {
            return Ok(LoopExit::Cancelled);
        }
        if !engine::port_listening(registration.port).await {
            warn!(
                "advertised port {} is no longer listening",
                registration.port
            );
            return Ok(LoopExit::LivenessLost);
        }

        match store
            .set_with_ttl(&key, &payload, settings.ttl_secs as i64)
            .await
        {
            Ok(expiry) => debug!("registration refreshed, lease expires {expiry}"),
            Err(e) => warn!("failed to refresh registration (record expires if this persists): {e}"),
        }

        if counter.advance() {
            if settings.recovery_conf_path().exists() {
                info!("restore still replaying logs, skipping scheduled backup");
            } else {
                run_backup(settings, wal).await;
            }
        }

        tokio::select! {
            _ = sleep(interval) => {}
            _ = token.cancelled() => return Ok(LoopExit::Cancelled),
        }
    }
}

/// Push a backup, then prune the catalog down to the retention count. Both
/// are best-effort; the next threshold retries.
pub async fn run_backup(settings: &Settings, wal: &dyn BackupTool) {
    info!("pushing scheduled backup of {}", settings.data_dir.display());
    if let Err(e) = wal.backup_push(&settings.data_dir).await {
        warn!("scheduled backup failed: {e}");
        return;
    }
    if let Err(e) = wal.prune(settings.backups_to_retain).await {
        warn!("pruning old backups failed: {e}");
    }
}
