use std::process::ExitStatus;
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use common::Settings;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// The database engine child process. The supervisor owns the handle for its
/// whole lifetime; liveness is observed only via TCP listen-state polling.
pub struct EngineProcess {
    child: Child,
    pid: i32,
}

impl EngineProcess {
    /// Launch the engine against its config file and listen address.
    pub fn spawn(settings: &Settings) -> Result<Self> {
        let mut cmd = Command::new(&settings.engine);
        cmd.arg("-D")
            .arg(&settings.data_dir)
            .arg(format!("--config-file={}", settings.engine_config))
            .arg("-h")
            .arg("0.0.0.0")
            .arg("-p")
            .arg(settings.service_port.to_string());
        Self::launch(cmd)
    }

    pub fn launch(mut cmd: Command) -> Result<Self> {
        let child = cmd.spawn().context("failed to start the database engine")?;
        let pid = child
            .id()
            .context("engine exited before a pid could be observed")? as i32;
        info!("engine started (pid {pid})");
        Ok(Self { child, pid })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Block until the engine exits on its own.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.child.wait().await.context("waiting on engine process")
    }

    /// Ask the engine to stop with SIGTERM and wait for it to exit. The wait
    /// is unbounded; the engine owns how long a clean shutdown takes.
    pub async fn shutdown(mut self) -> Result<ExitStatus> {
        info!("stopping engine (pid {})", self.pid);
        kill(Pid::from_raw(self.pid), Signal::SIGTERM)
            .context("sending SIGTERM to engine")?;
        let status = self
            .child
            .wait()
            .await
            .context("waiting for engine to exit")?;
        info!("engine exited: {status}");
        Ok(status)
    }
}

/// Single probe of local listen state on `port`.
pub async fn port_listening(port: u16) -> bool {
    matches!(
        timeout(PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Poll until `port` is listening. Returns false when shutdown is requested
/// before that happens.
pub async fn await_listening(port: u16, poll: Duration, token: &CancellationToken) -> bool {
    loop {
        if port_listening(port).await {
            return true;
        }
        info!("waiting for port {port} to start listening");
        tokio::select! {
            _ = sleep(poll) => {}
            _ = token.cancelled() => return false,
        }
    }
}

/// Cancel `token` once SIGINT or SIGTERM arrives. Installed before any of
/// the long-running loops so an external stop request is honored wherever
/// the supervisor happens to be.
pub fn spawn_signal_watcher(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("termination signal received, shutting down");
        token.cancel();
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
