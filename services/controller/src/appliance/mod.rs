//! Transport to the load-balancer appliance.
//!
//! The appliance is a host running nginx (stream proxy) and keepalived. The
//! controller only ever writes whole files, removes files, reads files and
//! runs reload commands there.

use anyhow::Result;
use async_trait::async_trait;

mod mock;
mod ssh;

pub use mock::MockAppliance;
pub use ssh::{SshAppliance, SshTarget};

/// Remote file and command operations on the appliance.
#[async_trait]
pub trait Appliance: Send + Sync {
    /// Write `content` to `remote_path`, replacing any existing file.
    async fn push_file(&self, remote_path: &str, content: &str) -> Result<()>;

    /// Remove `remote_path`. Removing an absent file succeeds.
    async fn remove_file(&self, remote_path: &str) -> Result<()>;

    /// Run a shell command and fail if it exits non-zero.
    async fn run_command(&self, command: &str) -> Result<()>;

    /// Read `remote_path`. An absent file reads as empty.
    async fn fetch_file(&self, remote_path: &str) -> Result<String>;
}
