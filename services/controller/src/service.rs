//! Service model as observed from the orchestrator.

use serde::{Deserialize, Serialize};
use vlb_id::ServiceKey;

/// Deletion marker this controller places on every load-balancer service it
/// manages. The orchestrator holds deletion until the marker is removed.
pub const FINALIZER: &str = "vlb.io/lb-finalizer";

/// Service exposure kind. Only `LoadBalancer` services are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceKind {
    LoadBalancer,
    #[serde(rename = "ClusterIP")]
    ClusterIp,
    NodePort,
    ExternalName,
}

/// Transport protocol of a service port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortProtocol {
    #[default]
    Tcp,
    Udp,
}

impl PortProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// A port exposed by a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub protocol: PortProtocol,

    /// Port clients connect to on the virtual address.
    pub port: u16,

    /// Port the backends listen on. Falls back to `port` when absent.
    #[serde(default)]
    pub node_port: Option<u16>,
}

impl ServicePort {
    pub fn tcp(port: u16) -> Self {
        Self {
            name: None,
            protocol: PortProtocol::Tcp,
            port,
            node_port: None,
        }
    }

    /// Port traffic is forwarded to on each backend.
    pub fn target_port(&self) -> u16 {
        self.node_port.unwrap_or(self.port)
    }
}

/// Desired state of a single service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub key: ServiceKey,

    pub kind: ServiceKind,

    #[serde(default)]
    pub ports: Vec<ServicePort>,

    #[serde(default)]
    pub finalizers: Vec<String>,

    /// Set once the orchestrator has requested deletion.
    #[serde(default)]
    pub deleting: bool,
}

impl ServiceSpec {
    /// Build a load-balancer service exposing the given TCP ports.
    pub fn load_balancer(key: ServiceKey, ports: &[u16]) -> Self {
        Self {
            key,
            kind: ServiceKind::LoadBalancer,
            ports: ports.iter().copied().map(ServicePort::tcp).collect(),
            finalizers: Vec::new(),
            deleting: false,
        }
    }

    pub fn is_load_balancer(&self) -> bool {
        self.kind == ServiceKind::LoadBalancer
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers.iter().any(|f| f == FINALIZER)
    }

    /// Frontend ports this service needs on its virtual address, sorted and
    /// deduplicated.
    pub fn required_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.ports.iter().map(|p| p.port).collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }
}

/// Change notification delivered to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// The service was created or changed.
    Upserted(ServiceSpec),

    /// The service no longer exists in the orchestrator.
    Deleted(ServiceKey),

    /// Re-run the last known state for this key.
    Retry(ServiceKey),
}

impl ServiceEvent {
    pub fn key(&self) -> &ServiceKey {
        match self {
            Self::Upserted(spec) => &spec.key,
            Self::Deleted(key) | Self::Retry(key) => key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ServiceKey {
        ServiceKey::new("default", "web").unwrap()
    }

    #[test]
    fn test_required_ports_sorted_and_deduplicated() {
        let mut spec = ServiceSpec::load_balancer(key(), &[443, 80]);
        spec.ports.push(ServicePort {
            name: Some("http-udp".to_string()),
            protocol: PortProtocol::Udp,
            port: 80,
            node_port: None,
        });
        assert_eq!(spec.required_ports(), vec![80, 443]);
    }

    #[test]
    fn test_finalizer_detection() {
        let mut spec = ServiceSpec::load_balancer(key(), &[80]);
        assert!(!spec.has_finalizer());
        spec.finalizers.push("other.io/finalizer".to_string());
        assert!(!spec.has_finalizer());
        spec.finalizers.push(FINALIZER.to_string());
        assert!(spec.has_finalizer());
    }

    #[test]
    fn test_spec_deserializes_from_feed_payload() {
        let json = r#"{
            "key": "shop/frontend",
            "kind": "LoadBalancer",
            "ports": [
                {"name": "http", "protocol": "TCP", "port": 80, "nodePort": 30080},
                {"protocol": "UDP", "port": 53}
            ],
            "finalizers": ["vlb.io/lb-finalizer"]
        }"#;

        let spec: ServiceSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.key.namespace(), "shop");
        assert!(spec.is_load_balancer());
        assert!(spec.has_finalizer());
        assert!(!spec.deleting);
        assert_eq!(spec.ports[0].target_port(), 30080);
        assert_eq!(spec.ports[1].protocol, PortProtocol::Udp);
        assert_eq!(spec.ports[1].target_port(), 53);
    }

    #[test]
    fn test_cluster_ip_kind_name() {
        let kind: ServiceKind = serde_json::from_str("\"ClusterIP\"").unwrap();
        assert_eq!(kind, ServiceKind::ClusterIp);
    }
}
