//! VIP pool sources.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;
use vlb_networking::parse_pool;

/// Supplies the raw pool specification text.
#[async_trait]
pub trait PoolSource: Send + Sync {
    async fn pool_spec(&self) -> Result<String>;
}

/// Reads the pool specification from a file.
#[derive(Debug, Clone)]
pub struct FilePoolSource {
    path: PathBuf,
}

impl FilePoolSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PoolSource for FilePoolSource {
    async fn pool_spec(&self) -> Result<String> {
        tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read pool file {}", self.path.display()))
    }
}

/// Fixed pool specification, for tests.
#[derive(Debug, Clone)]
pub struct StaticPoolSource(pub String);

#[async_trait]
impl PoolSource for StaticPoolSource {
    async fn pool_spec(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Read and expand the pool.
pub async fn load_pool(source: &dyn PoolSource) -> Result<Vec<Ipv4Addr>> {
    let spec = source.pool_spec().await?;
    let pool = parse_pool(&spec)?;
    info!(pool_size = pool.len(), "VIP pool loaded");
    Ok(pool)
}
