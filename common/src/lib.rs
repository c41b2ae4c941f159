use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Name of the sentinel file marking a data directory whose init-or-restore
/// decision has completed.
pub const INIT_MARKER: &str = ".dbsup_initialized";

/// Recovery instruction file consumed by the engine. Its presence means a
/// restore is still replaying logs.
pub const RECOVERY_CONF: &str = "recovery.conf";

/// Address record published to the store for service discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Registration {
    pub host: String,
    pub port: u16,
}

/// Environment-derived supervisor configuration. Built once at startup and
/// passed by reference everywhere; never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Settings {
    pub etcd_host: String,
    pub etcd_port: u16,
    /// Namespace prefix for every key this supervisor touches.
    pub etcd_path: String,
    pub ttl_secs: u64,

    pub bucket_name: String,
    pub backups_to_retain: u32,
    /// Backup cadence expressed in publish-loop iterations.
    pub backup_frequency: u32,

    /// Presence enables the discovery/backup loop.
    pub external_port: Option<u16>,
    pub external_host: String,

    pub service_name: String,
    pub service_port: u16,

    pub data_dir: PathBuf,
    pub engine: String,
    pub engine_config: String,

    pub admin_user: String,
    pub admin_password: String,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,

    pub render_cmd: String,
    pub wal_cmd: String,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup. `None` means "unset",
    /// which falls back to the documented default.
    pub fn from_source<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let external_port = match get("EXTERNAL_PORT") {
            Some(raw) => Some(
                raw.trim()
                    .parse::<u16>()
                    .map_err(|e| anyhow!("invalid EXTERNAL_PORT={raw}: {e}"))?,
            ),
            None => None,
        };
        let external_host = get("EXTERNAL_HOST")
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned());

        Ok(Settings {
            etcd_host: string_or(&get, "ETCD_HOST", "127.0.0.1"),
            etcd_port: parse_or(&get, "ETCD_PORT", 4001)?,
            etcd_path: string_or(&get, "ETCD_PATH", "/dbsup"),
            ttl_secs: parse_or(&get, "ETCD_TTL", 10)?,
            bucket_name: string_or(&get, "BUCKET_NAME", "db_wal"),
            backups_to_retain: parse_or(&get, "BACKUPS_TO_RETAIN", 5)?,
            backup_frequency: parse_or(&get, "BACKUP_FREQUENCY", 2160)?,
            external_port,
            external_host,
            service_name: string_or(&get, "SERVICE_NAME", "db"),
            service_port: parse_or(&get, "SERVICE_PORT", 5432)?,
            data_dir: PathBuf::from(string_or(&get, "DATA_DIR", "/data")),
            engine: string_or(&get, "ENGINE", "postgres"),
            engine_config: string_or(&get, "ENGINE_CONFIG", "/etc/db/server.conf"),
            admin_user: string_or(&get, "ADMIN_USER", "admin"),
            admin_password: string_or(&get, "ADMIN_PASSWORD", "admin"),
            db_name: string_or(&get, "DB_NAME", "app"),
            db_user: string_or(&get, "DB_USER", "app"),
            db_password: string_or(&get, "DB_PASSWORD", "app"),
            render_cmd: string_or(&get, "RENDER_CMD", "confd"),
            wal_cmd: string_or(&get, "WAL_CMD", "wal-e"),
        })
    }

    /// Store endpoint in `host:port` form, as the client library expects.
    pub fn store_endpoint(&self) -> String {
        format!("{}:{}", self.etcd_host, self.etcd_port)
    }

    /// Store endpoint as a URL, for collaborators invoked on the command
    /// line (the templating renderer).
    pub fn store_url(&self) -> String {
        format!("http://{}:{}", self.etcd_host, self.etcd_port)
    }

    /// Interval between publish-loop iterations and between dependency-wait
    /// retries. Half the TTL so a registration is refreshed strictly before
    /// it can expire.
    pub fn loop_interval(&self) -> Duration {
        Duration::from_secs((self.ttl_secs / 2).max(1))
    }

    /// How long to wait after the store first answers, so keys leased by a
    /// crashed predecessor expire instead of being read as live.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.ttl_secs + 1)
    }

    pub fn service_key(&self) -> String {
        format!("{}/service/{}", self.etcd_path, self.service_name)
    }

    pub fn registration(&self) -> Option<Registration> {
        self.external_port.map(|port| Registration {
            host: self.external_host.clone(),
            port,
        })
    }

    pub fn init_marker_path(&self) -> PathBuf {
        self.data_dir.join(INIT_MARKER)
    }

    pub fn recovery_conf_path(&self) -> PathBuf {
        self.data_dir.join(RECOVERY_CONF)
    }

    /// Configuration keys seeded on first boot. Writes are first-writer-wins;
    /// an existing key is never overwritten.
    pub fn seed_defaults(&self) -> Vec<(String, String)> {
        [
            ("engine", self.engine.as_str()),
            ("adminUser", self.admin_user.as_str()),
            ("adminPassword", self.admin_password.as_str()),
            ("dbName", self.db_name.as_str()),
            ("dbUser", self.db_user.as_str()),
            ("dbPassword", self.db_password.as_str()),
            ("bucketName", self.bucket_name.as_str()),
        ]
        .into_iter()
        .map(|(key, value)| (format!("{}/{}", self.etcd_path, key), value.to_string()))
        .collect()
    }
}

fn string_or<F>(get: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    get(key).unwrap_or_else(|| default.to_string())
}

fn parse_or<F, T>(get: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid {key}={raw}: {e}")),
        None => Ok(default),
    }
}

/// True when `path` looks like a data directory with completed init.
pub fn marker_present(data_dir: &Path) -> bool {
    data_dir.join(INIT_MARKER).exists()
}
