use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info};
use tokio::process::Command;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use common::Settings;

use crate::render::Renderer;
use crate::store::{ConfigStore, SeedOutcome};
use crate::wal::BackupTool;

/// Startup state machine. Runs once per supervisor start; the init-or-restore
/// decision itself runs at most once per data directory lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    AwaitingDependencies,
    SeedingDefaults,
    DecidingInit,
    Restoring,
    FreshInit,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootOutcome {
    /// True when a new empty database was set up; the caller owes one
    /// unconditional initial backup once the engine is confirmed listening.
    pub fresh_init: bool,
}

/// Drive the state machine to `Ready`. Returns `None` when shutdown was
/// requested while waiting on a dependency.
pub async fn run(
    settings: &Settings,
    store: &dyn ConfigStore,
    wal: &dyn BackupTool,
    renderer: &dyn Renderer,
    token: &CancellationToken,
) -> Result<Option<BootOutcome>> {
    let mut fresh_init = false;
    let mut state = BootState::AwaitingDependencies;
    loop {
        debug!("bootstrap state: {state:?}");
        state = match state {
            BootState::AwaitingDependencies => {
                if !await_dependencies(settings, store, renderer, token).await {
                    return Ok(None);
                }
                BootState::SeedingDefaults
            }
            BootState::SeedingDefaults => {
                seed_defaults(settings, store).await?;
                BootState::DecidingInit
            }
            BootState::DecidingInit => {
                if common::marker_present(&settings.data_dir) {
                    info!("existing data directory found, skipping init decision");
                    BootState::Ready
                } else {
                    let entries = wal.catalog_len().await.context("listing backup catalog")?;
                    if backups_exist(entries) {
                        BootState::Restoring
                    } else {
                        BootState::FreshInit
                    }
                }
            }
            BootState::Restoring => {
                restore(settings, wal).await?;
                write_marker(settings).await?;
                BootState::Ready
            }
            BootState::FreshInit => {
                info!("no backups found, initializing a fresh database");
                ensure_data_dir(&settings.data_dir).await?;
                fresh_init = true;
                write_marker(settings).await?;
                BootState::Ready
            }
            BootState::Ready => return Ok(Some(BootOutcome { fresh_init })),
        };
    }
}

/// The catalog listing leads with a header row; anything past it is a real
/// backup.
fn backups_exist(catalog_len: usize) -> bool {
    catalog_len > 1
}

async fn await_dependencies(
    settings: &Settings,
    store: &dyn ConfigStore,
    renderer: &dyn Renderer,
    token: &CancellationToken,
) -> bool {
    loop {
        let store_up = store.list(&settings.etcd_path).await.is_ok();
        let renderer_up = store_up && renderer.render_once().await.unwrap_or(false);
        if store_up && renderer_up {
            return true;
        }
        info!("waiting for dependencies (store up: {store_up}, renderer up: {renderer_up})");
        tokio::select! {
            _ = sleep(settings.loop_interval()) => {}
            _ = token.cancelled() => return false,
        }
    }
}

async fn seed_defaults(settings: &Settings, store: &dyn ConfigStore) -> Result<()> {
    for (key, value) in settings.seed_defaults() {
        match store.set_if_absent(&key, &value).await {
            Ok(SeedOutcome::Created) => info!("seeded default {key}"),
            Ok(SeedOutcome::AlreadyExists) => debug!("{key} already set, keeping stored value"),
            Err(e) => return Err(e).with_context(|| format!("seeding default {key}")),
        }
    }
    Ok(())
}

/// Rebuild the data directory from the most recent backup and leave a
/// recovery instruction so the engine replays the remaining logs itself.
async fn restore(settings: &Settings, wal: &dyn BackupTool) -> Result<()> {
    let data_dir = &settings.data_dir;
    info!(
        "backups found, restoring {} from the latest one",
        data_dir.display()
    );
    if data_dir.exists() {
        tokio::fs::remove_dir_all(data_dir)
            .await
            .with_context(|| format!("clearing partial data directory {}", data_dir.display()))?;
    }
    ensure_data_dir(data_dir).await?;
    disable_copy_on_write(data_dir).await;

    wal.backup_fetch(data_dir, "LATEST")
        .await
        .context("fetching the latest backup")?;
    write_recovery_conf(settings).await?;
    Ok(())
}

async fn ensure_data_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating data directory {}", dir.display()))?;
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
        .await
        .with_context(|| format!("restricting permissions on {}", dir.display()))?;
    Ok(())
}

/// Databases rewrite pages in place; on btrfs-style filesystems the data
/// directory should opt out of copy-on-write. Unsupported filesystems reject
/// the flag, which is fine.
async fn disable_copy_on_write(dir: &Path) {
    match Command::new("chattr").arg("+C").arg(dir).status().await {
        Ok(status) if status.success() => {
            debug!("copy-on-write disabled on {}", dir.display());
        }
        Ok(_) | Err(_) => {
            debug!("chattr +C not supported on {}, leaving it as is", dir.display());
        }
    }
}

async fn write_recovery_conf(settings: &Settings) -> Result<()> {
    let path = settings.recovery_conf_path();
    let contents = format!(
        "restore_command = '{} wal-fetch \"%f\" \"%p\"'\n",
        settings.wal_cmd
    );
    tokio::fs::write(&path, contents)
        .await
        .with_context(|| format!("writing recovery instructions to {}", path.display()))
}

/// Record that the init-or-restore decision completed. Overwriting an
/// existing marker is tolerated: a crash between restore and marker lands
/// back here on the next run.
async fn write_marker(settings: &Settings) -> Result<()> {
    let path = settings.init_marker_path();
    tokio::fs::write(&path, b"")
        .await
        .with_context(|| format!("writing init marker {}", path.display()))
}
