use serde::{Deserialize, Serialize};

use crate::{api_bail, Ipv4Cidr, Ulid};

/// A named, CIDR-scoped private network, realized as a Linux bridge plus a
/// pair of iptables chains on every host carrying one of its VMs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vpc {
    pub name: String,
    pub cidr: Ipv4Cidr,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<Ulid>,
    pub gateway: std::net::Ipv4Addr,
    pub mtu: u32,
    /// Base name for the per-VPC iptables chains and the bridge device,
    /// derived once at creation and stable for the VPC lifetime.
    pub chain: String,
    pub created_at: i64,
}

impl Vpc {
    /// Deterministic bridge device name on every host.
    pub fn bridge_name(&self) -> String {
        format!("vdcbr-{}", self.chain)
    }
}

/// A CIDR inside a VPC, partitioning private-IP allocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subnet {
    pub id: Ulid,
    pub vpc: String,
    pub cidr: Ipv4Cidr,
    pub created_at: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct VpcCreateRequest {
    pub name: String,
    /// Defaults to the region's configured VPC CIDR.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cidr: Option<Ipv4Cidr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

impl VpcCreateRequest {
    /// Validate and resolve the effective CIDR.
    pub fn validate(&self, default_cidr: Ipv4Cidr) -> Result<Ipv4Cidr, anyhow::Error> {
        crate::verify_entity_name(&self.name)?;
        let cidr = self.cidr.unwrap_or(default_cidr);
        if cidr.mask() > 29 {
            api_bail!(Validation, "vpc cidr {cidr} is too small");
        }
        if cidr.canonical() != cidr {
            api_bail!(
                Validation,
                "vpc cidr {cidr} has host bits set (expected {})",
                cidr.canonical()
            );
        }
        if let Some(mtu) = self.mtu {
            if !(576..=9000).contains(&mtu) {
                api_bail!(Validation, "mtu must be between 576 and 9000");
            }
        }
        Ok(cidr)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SubnetCreateRequest {
    pub cidr: Ipv4Cidr,
}

/// Traffic direction a firewall rule applies to, from the VM's perspective.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallDirection {
    Inbound,
    Outbound,
}

serde_plain::derive_display_from_serialize!(FirewallDirection);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallProtocol {
    Tcp,
    Udp,
    Icmp,
}

serde_plain::derive_display_from_serialize!(FirewallProtocol);

/// A single rule, scoped to a VPC and applied to every VM NIC on it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FirewallRule {
    pub id: Ulid,
    pub vpc: String,
    pub direction: FirewallDirection,
    pub protocol: FirewallProtocol,
    /// Inclusive port range; ignored for icmp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_start: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_end: Option<u16>,
    /// Source CIDR for inbound rules, destination CIDR for outbound.
    pub cidr: Ipv4Cidr,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Lower values sort earlier in the generated chain.
    pub priority: u16,
    pub created_at: i64,
}

pub const DEFAULT_RULE_PRIORITY: u16 = 1000;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FirewallRuleCreateRequest {
    pub direction: FirewallDirection,
    pub protocol: FirewallProtocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_start: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_end: Option<u16>,
    pub cidr: Ipv4Cidr,
    #[serde(default)]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u16>,
}

impl FirewallRuleCreateRequest {
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        match self.protocol {
            FirewallProtocol::Icmp => {
                if self.port_start.is_some() || self.port_end.is_some() {
                    api_bail!(Validation, "icmp rules cannot carry a port range");
                }
            }
            FirewallProtocol::Tcp | FirewallProtocol::Udp => {
                let start = match self.port_start {
                    Some(port) => port,
                    None => api_bail!(Validation, "missing port_start"),
                };
                if start == 0 {
                    api_bail!(Validation, "port_start must not be 0");
                }
                if let Some(end) = self.port_end {
                    if end < start {
                        api_bail!(Validation, "port range end {end} below start {start}");
                    }
                }
            }
        }
        if self.description.len() > 256 {
            api_bail!(Validation, "description longer than 256 characters");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vpc_request_validation() {
        let default: Ipv4Cidr = "10.0.0.0/24".parse().unwrap();

        let req = VpcCreateRequest {
            name: "v1".into(),
            cidr: Some("10.1.0.0/24".parse().unwrap()),
            mtu: None,
        };
        assert_eq!(req.validate(default).unwrap().to_string(), "10.1.0.0/24");

        // absent cidr resolves to the default
        let req = VpcCreateRequest {
            name: "v1".into(),
            cidr: None,
            mtu: None,
        };
        assert_eq!(req.validate(default).unwrap(), default);

        let req = VpcCreateRequest {
            name: "v1".into(),
            cidr: Some("10.0.0.5/24".parse().unwrap()),
            mtu: None,
        };
        req.validate(default).unwrap_err();

        let req = VpcCreateRequest {
            name: "v1".into(),
            cidr: Some("10.0.0.0/30".parse().unwrap()),
            mtu: None,
        };
        req.validate(default).unwrap_err();
    }

    #[test]
    fn firewall_rule_validation() {
        let mut req = FirewallRuleCreateRequest {
            direction: FirewallDirection::Inbound,
            protocol: FirewallProtocol::Tcp,
            port_start: Some(80),
            port_end: None,
            cidr: "0.0.0.0/0".parse().unwrap(),
            description: String::new(),
            priority: None,
        };
        req.validate().unwrap();

        req.port_end = Some(79);
        req.validate().unwrap_err();

        req.protocol = FirewallProtocol::Icmp;
        req.port_start = None;
        req.port_end = Some(80);
        req.validate().unwrap_err();
    }
}
