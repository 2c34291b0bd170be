//! In-memory appliance for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use super::Appliance;

/// Records files and commands instead of touching a real host.
#[derive(Debug, Default)]
pub struct MockAppliance {
    files: Mutex<BTreeMap<String, String>>,
    commands: Mutex<Vec<String>>,
    fail_push_prefix: Mutex<Option<String>>,
    fail_commands: AtomicBool,
    fail_fetch: AtomicBool,
    pushes: AtomicUsize,
}

impl MockAppliance {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail pushes to any path starting with `prefix`. `None` clears it.
    pub async fn fail_push_matching(&self, prefix: Option<&str>) {
        *self.fail_push_prefix.lock().await = prefix.map(str::to_string);
    }

    /// Make every command fail (or succeed again).
    pub fn fail_commands(&self, fail: bool) {
        self.fail_commands.store(fail, Ordering::SeqCst);
    }

    /// Make every fetch fail (or succeed again).
    pub fn fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    /// Place a file on the appliance without counting it as a push.
    pub async fn seed_file(&self, remote_path: &str, content: &str) {
        self.files
            .lock()
            .await
            .insert(remote_path.to_string(), content.to_string());
    }

    pub async fn file(&self, remote_path: &str) -> Option<String> {
        self.files.lock().await.get(remote_path).cloned()
    }

    pub async fn files(&self) -> BTreeMap<String, String> {
        self.files.lock().await.clone()
    }

    /// Commands run so far, in order.
    pub async fn commands(&self) -> Vec<String> {
        self.commands.lock().await.clone()
    }

    /// Number of successful pushes.
    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Appliance for MockAppliance {
    async fn push_file(&self, remote_path: &str, content: &str) -> Result<()> {
        if let Some(prefix) = self.fail_push_prefix.lock().await.as_deref() {
            if remote_path.starts_with(prefix) {
                anyhow::bail!("injected push failure for {remote_path}");
            }
        }

        info!(path = %remote_path, bytes = content.len(), "mock: push file");
        self.files
            .lock()
            .await
            .insert(remote_path.to_string(), content.to_string());
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_file(&self, remote_path: &str) -> Result<()> {
        info!(path = %remote_path, "mock: remove file");
        self.files.lock().await.remove(remote_path);
        Ok(())
    }

    async fn run_command(&self, command: &str) -> Result<()> {
        if self.fail_commands.load(Ordering::SeqCst) {
            anyhow::bail!("injected failure for `{command}`");
        }

        info!(%command, "mock: run command");
        self.commands.lock().await.push(command.to_string());
        Ok(())
    }

    async fn fetch_file(&self, remote_path: &str) -> Result<String> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            anyhow::bail!("injected fetch failure for {remote_path}");
        }
        Ok(self.file(remote_path).await.unwrap_or_default())
    }
}
