//! Durable key/value records backing the controller's ledgers.
//!
//! Two records are kept: the address allocation list and the local
//! redundancy-identifier ledger. Writes replace the whole record.

use anyhow::Result;
use async_trait::async_trait;

mod file;
mod memory;

pub use file::FileRecordStore;
pub use memory::MemoryRecordStore;

/// Record holding the JSON allocation list.
pub const ALLOCATIONS_KEY: &str = "ip-allocations";

/// Record holding the local `tenant: id1,id2` ledger.
pub const VRID_LEDGER_KEY: &str = "vrid-allocations";

/// Durable record store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Read a record. Returns `None` if it has never been written.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace a record. Either the new content is stored in full or the
    /// previous content is left in place.
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;
}

/// Record keys become file names, so keep them to a conservative alphabet.
pub(crate) fn validate_record_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if !valid {
        anyhow::bail!("invalid record key {key:?}");
    }
    Ok(())
}
