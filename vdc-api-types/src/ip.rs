use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

use crate::Ulid;

#[derive(Error, Debug)]
#[error("invalid allocation scope")]
pub struct AllocScopeError;

/// Address allocation scope: one per VPC for private addresses, one shared
/// public pool per region.
#[derive(Clone, Debug, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub enum AllocScope {
    VpcPrivate(String),
    Public,
}

impl std::fmt::Display for AllocScope {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            AllocScope::VpcPrivate(vpc) => write!(f, "vpc:{vpc}"),
            AllocScope::Public => f.write_str("public"),
        }
    }
}

impl FromStr for AllocScope {
    type Err = AllocScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "public" {
            return Ok(AllocScope::Public);
        }
        match s.split_once(':') {
            Some(("vpc", name)) if !name.is_empty() => Ok(AllocScope::VpcPrivate(name.to_string())),
            _ => Err(AllocScopeError),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocStatus {
    Reserved,
    Bound,
    Released,
}

serde_plain::derive_display_from_serialize!(AllocStatus);

/// One row per `(scope, address)`. The Store key carries the same pair, so a
/// compare-and-set insert is the uniqueness guarantee.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IpAllocation {
    pub scope: AllocScope,
    pub address: Ipv4Addr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<Ulid>,
    pub status: AllocStatus,
    /// Timestamp of the last status change; drives reserved-row reaping and
    /// the release grace period.
    pub updated_at: i64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloatingIpStatus {
    Available,
    Bound,
}

serde_plain::derive_display_from_serialize!(FloatingIpStatus);

/// A publicly routable address exposed via DNAT to a VM's private IP.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FloatingIp {
    pub address: Ipv4Addr,
    pub status: FloatingIpStatus,
    /// Never two bindings at the same time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm: Option<Ulid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_rebind_time: Option<i64>,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_round_trip() {
        let scope: AllocScope = "vpc:v1".parse().unwrap();
        assert_eq!(scope, AllocScope::VpcPrivate("v1".into()));
        assert_eq!(scope.to_string(), "vpc:v1");
        assert_eq!("public".parse::<AllocScope>().unwrap(), AllocScope::Public);
        assert!("vpc:".parse::<AllocScope>().is_err());
        assert!("global".parse::<AllocScope>().is_err());
    }
}
