use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use dbsupd::publish::{self, LoopExit};

use crate::common::{MemStore, MockWal, test_settings};

mod common;

struct LoopHarness {
    settings: Arc<::common::Settings>,
    store: Arc<MemStore>,
    wal: Arc<MockWal>,
    token: CancellationToken,
}

impl LoopHarness {
    fn spawn(&self) -> tokio::task::JoinHandle<anyhow::Result<LoopExit>> {
        let settings = self.settings.clone();
        let store = self.store.clone();
        let wal = self.wal.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            publish::run_loop(&settings, store.as_ref(), wal.as_ref(), &token).await
        })
    }
}

fn harness(port: u16, data_dir: &std::path::Path, frequency: &str) -> LoopHarness {
    let port = port.to_string();
    let settings = test_settings(&[
        ("DATA_DIR", data_dir.to_str().unwrap()),
        ("EXTERNAL_PORT", &port),
        ("EXTERNAL_HOST", "node-1"),
        // ttl 2 -> one-second iterations, short enough to observe
        ("ETCD_TTL", "2"),
        ("BACKUP_FREQUENCY", frequency),
    ]);
    LoopHarness {
        settings: Arc::new(settings),
        store: Arc::new(MemStore::default()),
        wal: Arc::new(MockWal::new(2)),
        token: CancellationToken::new(),
    }
}

#[tokio::test]
async fn test_refresh_and_scheduled_backups() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(port, dir.path(), "2");

    let handle = h.spawn();
    sleep(Duration::from_millis(3500)).await;
    h.token.cancel();
    let exit = handle.await.unwrap().expect("loop should not error");

    assert_eq!(exit, LoopExit::Cancelled);
    // refreshed every iteration, strictly below the 2s ttl
    assert!(*h.store.refresh_attempts.lock().unwrap() >= 3);
    let published = h.store.value_of(&h.settings.service_key()).unwrap();
    assert_eq!(published, format!(r#"{{"host":"node-1","port":{port}}}"#));
    // threshold of 2 iterations fired at least once
    assert!(h.wal.pushes() >= 1);
    assert!(h.wal.calls().iter().any(|c| c == "prune:5"));
}

#[tokio::test]
async fn test_backup_skipped_while_restore_in_progress() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(::common::RECOVERY_CONF), b"restore_command = '...'\n")
        .unwrap();
    let h = harness(port, dir.path(), "2");

    let handle = h.spawn();
    sleep(Duration::from_millis(3500)).await;
    assert_eq!(h.wal.pushes(), 0, "no backup while recovery.conf is present");

    // recovery completed; the next threshold must fire a real backup
    std::fs::remove_file(dir.path().join(::common::RECOVERY_CONF)).unwrap();
    sleep(Duration::from_millis(2500)).await;
    h.token.cancel();
    let exit = handle.await.unwrap().expect("loop should not error");

    assert_eq!(exit, LoopExit::Cancelled);
    assert!(h.wal.pushes() >= 1);
}

#[tokio::test]
async fn test_liveness_lost_ends_the_loop() {
    // grab a free port, then close it before the loop starts
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let dir = tempfile::tempdir().unwrap();
    let h = harness(port, dir.path(), "2160");

    let handle = h.spawn();
    let exit = handle.await.unwrap().expect("loop should not error");

    assert_eq!(exit, LoopExit::LivenessLost);
    assert_eq!(h.wal.pushes(), 0);
}

#[tokio::test]
async fn test_refresh_failure_does_not_kill_the_loop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(port, dir.path(), "2160");
    *h.store.refresh_failures.lock().unwrap() = 1;

    let handle = h.spawn();
    sleep(Duration::from_millis(2500)).await;
    h.token.cancel();
    let exit = handle.await.unwrap().expect("loop should survive a failed refresh");

    assert_eq!(exit, LoopExit::Cancelled);
    // the failed cycle was followed by a successful one
    assert!(*h.store.refresh_attempts.lock().unwrap() >= 2);
    assert!(h.store.value_of(&h.settings.service_key()).is_some());
}
