//! In-memory record store for tests and dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{validate_record_key, RecordStore};

/// Record store held in memory, with optional write-failure injection.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<String, Vec<u8>>>,
    fail_puts: AtomicBool,
    puts: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with one record.
    pub fn with_record(key: &str, value: impl Into<Vec<u8>>) -> Self {
        Self {
            records: Mutex::new(HashMap::from([(key.to_string(), value.into())])),
            ..Self::default()
        }
    }

    /// Make every subsequent `put` fail (or succeed again).
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Current content of a record.
    pub async fn contents(&self, key: &str) -> Option<Vec<u8>> {
        self.records.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_record_key(key)?;
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        validate_record_key(key)?;
        if self.fail_puts.load(Ordering::SeqCst) {
            anyhow::bail!("injected write failure for record {key}");
        }

        self.records
            .lock()
            .await
            .insert(key.to_string(), value.to_vec());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
