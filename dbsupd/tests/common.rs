// helpers shared across the test binaries; not every binary uses every one
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ::common::Settings;
use dbsupd::render::Renderer;
use dbsupd::store::{ConfigStore, SeedOutcome, StoreError};
use dbsupd::wal::BackupTool;

/// In-memory store with first-writer-wins semantics and optional injected
/// refresh failures.
#[derive(Default)]
pub struct MemStore {
    pub keys: Mutex<HashMap<String, String>>,
    /// Fail this many `set_with_ttl` calls before succeeding again.
    pub refresh_failures: Mutex<u32>,
    pub refresh_attempts: Mutex<u32>,
}

impl MemStore {
    pub fn with_key(key: &str, value: &str) -> Self {
        let store = Self::default();
        store
            .keys
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        store
    }

    pub fn value_of(&self, key: &str) -> Option<String> {
        self.keys.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl ConfigStore for MemStore {
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .keys
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<SeedOutcome, StoreError> {
        let mut keys = self.keys.lock().unwrap();
        if keys.contains_key(key) {
            Ok(SeedOutcome::AlreadyExists)
        } else {
            keys.insert(key.to_string(), value.to_string());
            Ok(SeedOutcome::Created)
        }
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_secs: i64,
    ) -> Result<DateTime<Utc>, StoreError> {
        *self.refresh_attempts.lock().unwrap() += 1;
        {
            let mut failures = self.refresh_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(StoreError::Other(anyhow!("injected store outage")));
            }
        }
        self.keys
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(Utc::now() + chrono::Duration::seconds(ttl_secs))
    }
}

/// Backup tool double that records every call it receives.
pub struct MockWal {
    pub catalog: usize,
    pub calls: Mutex<Vec<String>>,
}

impl MockWal {
    pub fn new(catalog: usize) -> Self {
        Self {
            catalog,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn pushes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with("push:"))
            .count()
    }
}

#[async_trait]
impl BackupTool for MockWal {
    async fn catalog_len(&self) -> Result<usize> {
        self.calls.lock().unwrap().push("list".to_string());
        Ok(self.catalog)
    }

    async fn backup_push(&self, data_dir: &Path) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("push:{}", data_dir.display()));
        Ok(())
    }

    async fn backup_fetch(&self, data_dir: &Path, name: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("fetch:{}:{name}", data_dir.display()));
        Ok(())
    }

    async fn prune(&self, retain: u32) -> Result<()> {
        self.calls.lock().unwrap().push(format!("prune:{retain}"));
        Ok(())
    }
}

/// Renderer double that always succeeds.
pub struct OkRenderer;

#[async_trait]
impl Renderer for OkRenderer {
    async fn render_once(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Settings built from explicit pairs instead of the process environment.
pub fn test_settings(pairs: &[(&str, &str)]) -> Settings {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Settings::from_source(move |key| map.get(key).cloned()).expect("test settings should parse")
}
