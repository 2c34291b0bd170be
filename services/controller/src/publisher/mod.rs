//! Publishes rendered configuration to the appliance.
//!
//! Each service gets its own nginx file. The keepalived pair (primary and
//! secondary) always describes the whole allocated fleet, split into two VIP
//! groups with one VRID each.
//!
//! Digests of the last successfully applied content are remembered per path,
//! so an unchanged file is neither pushed nor followed by a reload.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{debug, info};
use vlb_id::{ServiceKey, TenantKey};
use vlb_networking::split_vip_groups;
use vlb_reconcile::ContentDigest;

use crate::appliance::Appliance;
use crate::ipam::Allocation;
use crate::service::ServiceSpec;
use crate::vrid::VridPair;

mod render;

pub use render::{render_keepalived, render_nginx, KeepalivedParams, NodeRole, BACKUP_PRIORITY, MASTER_PRIORITY};

/// Validates and reloads nginx.
pub const NGINX_RELOAD_COMMAND: &str = "sudo nginx -t && sudo nginx -s reload";

/// Restarts keepalived.
pub const KEEPALIVED_RESTART_COMMAND: &str = "sudo systemctl restart keepalived";

/// Appliance layout and identity.
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub tenant: TenantKey,
    pub interface: String,
    pub auth_pass: String,
    pub nginx_conf_dir: String,
    pub keepalived_dir: String,
}

impl PublisherSettings {
    /// Settings with the standard appliance directories.
    pub fn new(tenant: TenantKey, interface: impl Into<String>, auth_pass: impl Into<String>) -> Self {
        Self {
            tenant,
            interface: interface.into(),
            auth_pass: auth_pass.into(),
            nginx_conf_dir: "/etc/nginx/conf.d".to_string(),
            keepalived_dir: "/etc/keepalived".to_string(),
        }
    }

    pub fn nginx_path(&self, key: &ServiceKey) -> String {
        format!(
            "{}/vip-{}-{}-{}.conf",
            self.nginx_conf_dir,
            self.tenant,
            key.namespace(),
            key.name()
        )
    }

    pub fn keepalived_primary_path(&self) -> String {
        format!("{}/{}_keepalived.conf", self.keepalived_dir, self.tenant)
    }

    pub fn keepalived_secondary_path(&self) -> String {
        format!("{}/{}_keepalived.conf.secondary", self.keepalived_dir, self.tenant)
    }

    /// Appliance-wide VRID ledger shared by every tenant.
    pub fn vrid_ledger_path(&self) -> String {
        format!("{}/VRID_allocations.conf", self.keepalived_dir)
    }
}

/// Renders configuration and applies it on the appliance.
pub struct Publisher {
    appliance: Arc<dyn Appliance>,
    settings: PublisherSettings,
    applied: Mutex<HashMap<String, ContentDigest>>,
}

impl Publisher {
    pub fn new(appliance: Arc<dyn Appliance>, settings: PublisherSettings) -> Self {
        Self {
            appliance,
            settings,
            applied: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &PublisherSettings {
        &self.settings
    }

    /// Push the nginx file for one service and reload nginx.
    ///
    /// Returns whether anything was applied.
    pub async fn publish_service(
        &self,
        service: &ServiceSpec,
        allocation: &Allocation,
        backends: &[String],
    ) -> Result<bool> {
        let path = self.settings.nginx_path(&service.key);
        let content = render_nginx(&self.settings.tenant, service, allocation, backends);

        let changed = self.apply(&[(path, content)], NGINX_RELOAD_COMMAND).await?;
        if changed {
            info!(service = %service.key, address = %allocation.address, backends = backends.len(), "nginx config published");
        }
        Ok(changed)
    }

    /// Remove the nginx file for one service and reload nginx. Succeeds if the
    /// file is already gone.
    pub async fn remove_service(&self, key: &ServiceKey) -> Result<()> {
        let path = self.settings.nginx_path(key);
        self.appliance.remove_file(&path).await?;
        self.applied.lock().await.remove(&path);
        self.appliance.run_command(NGINX_RELOAD_COMMAND).await?;
        info!(service = %key, "nginx config removed");
        Ok(())
    }

    /// Push both keepalived files for the given fleet and restart keepalived.
    ///
    /// Returns whether anything was applied.
    pub async fn publish_redundancy(&self, vrids: VridPair, addresses: &[Ipv4Addr]) -> Result<bool> {
        let (group1, group2) = split_vip_groups(addresses.iter().copied());
        let params = KeepalivedParams {
            tenant: &self.settings.tenant,
            interface: &self.settings.interface,
            auth_pass: &self.settings.auth_pass,
            vrids,
            group1: &group1,
            group2: &group2,
        };

        let files = [
            (
                self.settings.keepalived_primary_path(),
                render_keepalived(&params, NodeRole::Primary),
            ),
            (
                self.settings.keepalived_secondary_path(),
                render_keepalived(&params, NodeRole::Secondary),
            ),
        ];

        let changed = self.apply(&files, KEEPALIVED_RESTART_COMMAND).await?;
        if changed {
            info!(
                vrids = %vrids,
                group1 = ?group1,
                group2 = ?group2,
                "keepalived config published"
            );
        }
        Ok(changed)
    }

    /// Push every file whose content changed, then run `command` once.
    /// Digests are recorded only after the command succeeds.
    async fn apply(&self, files: &[(String, String)], command: &str) -> Result<bool> {
        let mut pending = Vec::new();
        {
            let applied = self.applied.lock().await;
            for (path, content) in files {
                let digest = ContentDigest::of(content.as_bytes());
                if applied.get(path) == Some(&digest) {
                    debug!(path = %path, digest = %digest, "unchanged; skipping push");
                    continue;
                }
                pending.push((path, content, digest));
            }
        }

        if pending.is_empty() {
            return Ok(false);
        }

        for (path, content, _) in &pending {
            self.appliance.push_file(path, content).await?;
        }
        self.appliance.run_command(command).await?;

        let mut applied = self.applied.lock().await;
        for (path, _, digest) in pending {
            applied.insert(path.clone(), digest);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appliance::MockAppliance;

    fn settings() -> PublisherSettings {
        PublisherSettings::new(TenantKey::parse("prod").unwrap(), "eth0", "pw")
    }

    fn allocation(key: &ServiceKey) -> Allocation {
        Allocation {
            owner: key.clone(),
            address: Ipv4Addr::new(10, 1, 1, 55),
            ports: vec![80],
        }
    }

    #[test]
    fn test_paths() {
        let s = settings();
        let key = ServiceKey::new("default", "web").unwrap();
        assert_eq!(s.nginx_path(&key), "/etc/nginx/conf.d/vip-prod-default-web.conf");
        assert_eq!(s.keepalived_primary_path(), "/etc/keepalived/prod_keepalived.conf");
        assert_eq!(
            s.keepalived_secondary_path(),
            "/etc/keepalived/prod_keepalived.conf.secondary"
        );
        assert_eq!(s.vrid_ledger_path(), "/etc/keepalived/VRID_allocations.conf");
    }

    #[tokio::test]
    async fn test_unchanged_service_is_not_republished() {
        let appliance = Arc::new(MockAppliance::new());
        let publisher = Publisher::new(appliance.clone(), settings());
        let key = ServiceKey::new("default", "web").unwrap();
        let spec = ServiceSpec::load_balancer(key.clone(), &[80]);
        let backends = vec!["192.168.0.10".to_string()];

        assert!(publisher.publish_service(&spec, &allocation(&key), &backends).await.unwrap());
        assert!(!publisher.publish_service(&spec, &allocation(&key), &backends).await.unwrap());

        assert_eq!(appliance.push_count(), 1);
        assert_eq!(appliance.commands().await, vec![NGINX_RELOAD_COMMAND.to_string()]);
    }

    #[tokio::test]
    async fn test_failed_reload_forces_retry() {
        let appliance = Arc::new(MockAppliance::new());
        let publisher = Publisher::new(appliance.clone(), settings());
        let key = ServiceKey::new("default", "web").unwrap();
        let spec = ServiceSpec::load_balancer(key.clone(), &[80]);
        let backends = vec!["192.168.0.10".to_string()];

        appliance.fail_commands(true);
        assert!(publisher.publish_service(&spec, &allocation(&key), &backends).await.is_err());

        appliance.fail_commands(false);
        assert!(publisher.publish_service(&spec, &allocation(&key), &backends).await.unwrap());
        assert_eq!(appliance.push_count(), 2);
    }

    #[tokio::test]
    async fn test_redundancy_files_written_together() {
        let appliance = Arc::new(MockAppliance::new());
        let publisher = Publisher::new(appliance.clone(), settings());
        let fleet = [Ipv4Addr::new(10, 1, 1, 56), Ipv4Addr::new(10, 1, 1, 55)];

        assert!(publisher.publish_redundancy(VridPair(1, 2), &fleet).await.unwrap());

        let primary = appliance.file("/etc/keepalived/prod_keepalived.conf").await.unwrap();
        let secondary = appliance
            .file("/etc/keepalived/prod_keepalived.conf.secondary")
            .await
            .unwrap();
        assert!(primary.contains("virtual_router_id 1"));
        assert!(secondary.contains("virtual_router_id 2"));
        assert_eq!(appliance.commands().await, vec![KEEPALIVED_RESTART_COMMAND.to_string()]);

        assert!(!publisher.publish_redundancy(VridPair(1, 2), &fleet).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_forgets_digest() {
        let appliance = Arc::new(MockAppliance::new());
        let publisher = Publisher::new(appliance.clone(), settings());
        let key = ServiceKey::new("default", "web").unwrap();
        let spec = ServiceSpec::load_balancer(key.clone(), &[80]);
        let backends = vec!["192.168.0.10".to_string()];

        publisher.publish_service(&spec, &allocation(&key), &backends).await.unwrap();
        publisher.remove_service(&key).await.unwrap();
        publisher.remove_service(&key).await.unwrap();
        assert!(appliance.file(&settings().nginx_path(&key)).await.is_none());

        // Same content again must be pushed since the file is gone.
        assert!(publisher.publish_service(&spec, &allocation(&key), &backends).await.unwrap());
    }
}
