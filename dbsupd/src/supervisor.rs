use anyhow::{Context, Result, bail};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use common::Settings;

use crate::bootstrap;
use crate::engine::{self, EngineProcess};
use crate::publish::{self, LoopExit};
use crate::render::{ConfdRenderer, Renderer};
use crate::store::etcd::EtcdStore;
use crate::wal::{BackupTool, WalTool};

/// Full supervisor lifecycle: wait for the store, bootstrap the data
/// directory, start the engine, then publish and back up until told to stop.
///
/// Returns `Ok(())` for a clean signal-driven shutdown (exit 0); any fatal
/// condition surfaces as an error and the process exits 1.
pub async fn run(settings: Settings) -> Result<()> {
    let token = CancellationToken::new();
    engine::spawn_signal_watcher(token.clone());

    let Some(store) = EtcdStore::wait_available(&settings, &token).await else {
        info!("shutdown requested before the config store came up");
        return Ok(());
    };
    let wal = WalTool::new(&settings);
    let renderer = ConfdRenderer::new(&settings);

    let Some(outcome) = bootstrap::run(&settings, &store, &wal, &renderer, &token).await? else {
        info!("shutdown requested during bootstrap");
        return Ok(());
    };

    let mut engine_proc = EngineProcess::spawn(&settings)?;
    if !engine::await_listening(settings.service_port, settings.loop_interval(), &token).await {
        return shutdown(engine_proc).await;
    }
    info!("database is listening on port {}", settings.service_port);

    // the first render ran before the init decision was final; render once
    // more from current store state and leave a watcher behind
    if !renderer.render_once().await.unwrap_or(false) {
        warn!("post-start configuration render did not succeed");
    }
    if let Err(e) = renderer.spawn_watch() {
        warn!("could not start the configuration watcher: {e}");
    }

    if outcome.fresh_init {
        info!("fresh database initialized, taking the initial backup");
        if let Err(e) = wal.backup_push(&settings.data_dir).await {
            warn!("initial backup failed: {e}");
        }
    }

    match settings.external_port {
        Some(port) => {
            if !engine::await_listening(port, settings.loop_interval(), &token).await {
                return shutdown(engine_proc).await;
            }
            match publish::run_loop(&settings, &store, &wal, &token).await? {
                LoopExit::Cancelled => shutdown(engine_proc).await,
                LoopExit::LivenessLost => {
                    bail!("advertised port {port} stopped listening")
                }
            }
        }
        None => {
            info!("no external port configured, supervising without discovery");
            let status = tokio::select! {
                status = engine_proc.wait() => Some(status.context("waiting on engine")?),
                _ = token.cancelled() => None,
            };
            match status {
                Some(status) if status.success() => Ok(()),
                Some(status) => bail!("engine exited unexpectedly: {status}"),
                None => shutdown(engine_proc).await,
            }
        }
    }
}

async fn shutdown(engine_proc: EngineProcess) -> Result<()> {
    let status = engine_proc.shutdown().await?;
    info!("supervisor exiting after engine shutdown ({status})");
    Ok(())
}
