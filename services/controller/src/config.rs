//! Configuration for the controller.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use vlb_id::TenantKey;

use crate::appliance::SshTarget;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Tenant (cluster) identity used in appliance file names and the VRID
    /// ledger.
    pub tenant: TenantKey,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory holding durable records.
    pub state_dir: PathBuf,

    /// VIP pool specification file.
    pub pool_file: PathBuf,

    /// Orchestrator API URL.
    pub orchestrator_url: String,

    /// Orchestrator request timeout.
    pub orchestrator_timeout: Duration,

    /// Where to persist the event feed cursor.
    pub cursor_file: Option<PathBuf>,

    /// Appliance SSH host. Required unless running dry.
    pub appliance_host: Option<String>,
    pub appliance_port: u16,
    pub appliance_user: String,
    pub appliance_ssh_key: PathBuf,
    pub appliance_known_hosts: PathBuf,

    /// Interface keepalived binds the VIPs to.
    pub network_interface: String,

    /// Shared VRRP authentication secret.
    pub keepalived_auth_pass: String,

    pub settle_delay: Duration,
    pub backend_retry_delay: Duration,
    pub max_concurrent_passes: usize,
    pub feed_poll_interval: Duration,
    pub feed_limit: i64,

    /// Record appliance changes in memory instead of applying them.
    pub dry_run: bool,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {name}={raw:?}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_millis(name: &str, default_ms: u64) -> Result<Duration> {
    env_parse(name, default_ms).map(Duration::from_millis)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let tenant_raw = env_or("VLB_CLUSTER_NAME", "default-cluster");
        let tenant = TenantKey::parse(&tenant_raw)
            .with_context(|| format!("Invalid VLB_CLUSTER_NAME {tenant_raw:?}"))?;

        let log_level = env_or("VLB_LOG_LEVEL", "info");

        let state_dir = PathBuf::from(env_or("VLB_STATE_DIR", "/var/lib/vlb"));
        let pool_file = PathBuf::from(env_or("VLB_POOL_FILE", "/etc/vlb/pool.conf"));

        let orchestrator_url = env_or("VLB_ORCHESTRATOR_URL", "http://127.0.0.1:8080");
        let orchestrator_timeout = env_millis("VLB_ORCHESTRATOR_TIMEOUT_MS", 30_000)?;
        let cursor_file = std::env::var("VLB_CURSOR_FILE").ok().map(PathBuf::from);

        let dry_run = env_flag("VLB_DRY_RUN");

        let appliance_host = std::env::var("VLB_APPLIANCE_HOST").ok();
        if appliance_host.is_none() && !dry_run {
            anyhow::bail!("VLB_APPLIANCE_HOST is required unless VLB_DRY_RUN is set");
        }
        let appliance_port = env_parse("VLB_APPLIANCE_PORT", 22u16)?;
        let appliance_user = env_or("VLB_APPLIANCE_USER", "vlb");
        let appliance_ssh_key = PathBuf::from(env_or("VLB_APPLIANCE_SSH_KEY", "/etc/vlb/ssh/id_ed25519"));
        let appliance_known_hosts =
            PathBuf::from(env_or("VLB_APPLIANCE_KNOWN_HOSTS", "/etc/vlb/ssh/known_hosts"));

        let network_interface = env_or("VLB_NETWORK_INTERFACE", "eth0");
        let keepalived_auth_pass = std::env::var("VLB_KEEPALIVED_AUTH_PASS")
            .context("VLB_KEEPALIVED_AUTH_PASS must be set")?;
        if keepalived_auth_pass.trim().is_empty() {
            anyhow::bail!("VLB_KEEPALIVED_AUTH_PASS must not be empty");
        }

        let settle_delay = env_millis("VLB_SETTLE_DELAY_MS", 3_000)?;
        let backend_retry_delay = env_millis("VLB_BACKEND_RETRY_MS", 10_000)?;
        let max_concurrent_passes = env_parse("VLB_MAX_CONCURRENT_PASSES", 4usize)?;
        if max_concurrent_passes == 0 {
            anyhow::bail!("VLB_MAX_CONCURRENT_PASSES must be at least 1");
        }
        let feed_poll_interval = env_millis("VLB_FEED_POLL_MS", 2_000)?;
        let feed_limit = env_parse("VLB_FEED_LIMIT", 100i64)?;

        Ok(Self {
            tenant,
            log_level,
            state_dir,
            pool_file,
            orchestrator_url,
            orchestrator_timeout,
            cursor_file,
            appliance_host,
            appliance_port,
            appliance_user,
            appliance_ssh_key,
            appliance_known_hosts,
            network_interface,
            keepalived_auth_pass,
            settle_delay,
            backend_retry_delay,
            max_concurrent_passes,
            feed_poll_interval,
            feed_limit,
            dry_run,
        })
    }

    /// SSH target for the appliance, if one is configured.
    pub fn ssh_target(&self) -> Option<SshTarget> {
        let host = self.appliance_host.clone()?;
        Some(SshTarget {
            host,
            port: self.appliance_port,
            user: self.appliance_user.clone(),
            identity_file: self.appliance_ssh_key.clone(),
            known_hosts_file: self.appliance_known_hosts.clone(),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(60),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_defaults_and_errors() {
        assert_eq!(env_parse("VLB_TEST_UNSET_PORT", 22u16).unwrap(), 22);

        std::env::set_var("VLB_TEST_BAD_PORT", "ninety");
        assert!(env_parse("VLB_TEST_BAD_PORT", 22u16).is_err());

        std::env::set_var("VLB_TEST_DELAY_MS", " 250 ");
        assert_eq!(
            env_millis("VLB_TEST_DELAY_MS", 3_000).unwrap(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_env_flag() {
        assert!(!env_flag("VLB_TEST_UNSET_FLAG"));
        std::env::set_var("VLB_TEST_FLAG_ON", "TRUE");
        assert!(env_flag("VLB_TEST_FLAG_ON"));
        std::env::set_var("VLB_TEST_FLAG_OFF", "0");
        assert!(!env_flag("VLB_TEST_FLAG_OFF"));
    }
}
