//! Appliance configuration rendering.

use std::fmt::Write;
use std::net::Ipv4Addr;

use vlb_id::TenantKey;

use crate::ipam::Allocation;
use crate::service::{PortProtocol, ServiceSpec};
use crate::vrid::VridPair;

/// VRRP priority of the node that owns a group.
pub const MASTER_PRIORITY: u8 = 150;

/// VRRP priority of the standby node for a group.
pub const BACKUP_PRIORITY: u8 = 100;

/// Which keepalived node a file is rendered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// MASTER for group 1, BACKUP for group 2.
    Primary,
    /// BACKUP for group 1, MASTER for group 2.
    Secondary,
}

/// Inputs shared by both keepalived files.
#[derive(Debug, Clone)]
pub struct KeepalivedParams<'a> {
    pub tenant: &'a TenantKey,
    pub interface: &'a str,
    pub auth_pass: &'a str,
    pub vrids: VridPair,
    pub group1: &'a [Ipv4Addr],
    pub group2: &'a [Ipv4Addr],
}

fn upstream_name(tenant: &TenantKey, service: &ServiceSpec, port: u16, protocol: PortProtocol) -> String {
    let raw = format!(
        "{}_{}_{}_{}_{}",
        tenant,
        service.key.namespace(),
        service.key.name(),
        protocol.as_str(),
        port
    );
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Render the nginx stream configuration for one service.
///
/// The appliance includes these files from inside its `stream {}` block, so
/// only `upstream` and `server` blocks are emitted. Only ports held by the
/// allocation get a listener.
pub fn render_nginx(tenant: &TenantKey, service: &ServiceSpec, allocation: &Allocation, backends: &[String]) -> String {
    let address = allocation.address;
    let mut out = String::new();
    let _ = writeln!(out, "# Managed by vlb-controller for {} ({tenant}). Do not edit.", service.key);

    for port in service.ports.iter().filter(|p| allocation.ports.contains(&p.port)) {
        let upstream = upstream_name(tenant, service, port.port, port.protocol);

        let _ = writeln!(out);
        let _ = writeln!(out, "upstream {upstream} {{");
        for backend in backends {
            let _ = writeln!(out, "    server {backend}:{};", port.target_port());
        }
        let _ = writeln!(out, "}}");
        let _ = writeln!(out);
        let _ = writeln!(out, "server {{");
        match port.protocol {
            PortProtocol::Tcp => {
                let _ = writeln!(out, "    listen {address}:{};", port.port);
            }
            PortProtocol::Udp => {
                let _ = writeln!(out, "    listen {address}:{} udp;", port.port);
            }
        }
        let _ = writeln!(out, "    proxy_pass {upstream};");
        let _ = writeln!(out, "}}");
    }

    out
}

fn render_instance(
    out: &mut String,
    params: &KeepalivedParams<'_>,
    group: u8,
    vrid: u8,
    master: bool,
    addresses: &[Ipv4Addr],
) {
    let (state, priority) = if master {
        ("MASTER", MASTER_PRIORITY)
    } else {
        ("BACKUP", BACKUP_PRIORITY)
    };
    let name = params.tenant.as_str().replace(|c: char| !c.is_ascii_alphanumeric(), "_").to_uppercase();

    let _ = writeln!(out);
    let _ = writeln!(out, "vrrp_instance {name}_VIP_{group} {{");
    let _ = writeln!(out, "    state {state}");
    let _ = writeln!(out, "    interface {}", params.interface);
    let _ = writeln!(out, "    virtual_router_id {vrid}");
    let _ = writeln!(out, "    priority {priority}");
    let _ = writeln!(out, "    advert_int 1");
    let _ = writeln!(out, "    authentication {{");
    let _ = writeln!(out, "        auth_type PASS");
    let _ = writeln!(out, "        auth_pass {}", params.auth_pass);
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out, "    virtual_ipaddress {{");
    for address in addresses {
        let _ = writeln!(out, "        {address}");
    }
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out, "}}");
}

/// Render one keepalived file holding both VIP group instances.
pub fn render_keepalived(params: &KeepalivedParams<'_>, role: NodeRole) -> String {
    let primary = role == NodeRole::Primary;

    let mut out = String::new();
    let _ = writeln!(
        out,
        "# Managed by vlb-controller for {} ({}). Do not edit.",
        params.tenant,
        match role {
            NodeRole::Primary => "primary",
            NodeRole::Secondary => "secondary",
        }
    );
    render_instance(&mut out, params, 1, params.vrids.first(), primary, params.group1);
    render_instance(&mut out, params, 2, params.vrids.second(), !primary, params.group2);
    out
}
