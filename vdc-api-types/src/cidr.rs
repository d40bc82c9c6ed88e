//! IPv4 CIDR handling for VPC and pool definitions.

use std::net::{AddrParseError, Ipv4Addr};

use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CidrError {
    #[error("invalid netmask")]
    InvalidNetmask,
    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddrParseError),
}

const IPV4_LENGTH: u8 = 32;

/// An IPv4 CIDR (e.g. 192.0.2.0/24)
#[derive(
    Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr,
)]
pub struct Ipv4Cidr {
    addr: Ipv4Addr,
    mask: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: impl Into<Ipv4Addr>, mask: u8) -> Result<Self, CidrError> {
        if mask > IPV4_LENGTH {
            return Err(CidrError::InvalidNetmask);
        }

        Ok(Self {
            addr: addr.into(),
            mask,
        })
    }

    pub fn address(&self) -> &Ipv4Addr {
        &self.addr
    }

    pub fn mask(&self) -> u8 {
        self.mask
    }

    /// Checks whether this CIDR contains an IPv4 address.
    pub fn contains_address(&self, other: &Ipv4Addr) -> bool {
        let bits = u32::from_be_bytes(self.addr.octets());
        let other_bits = u32::from_be_bytes(other.octets());

        let shift_amount: u32 = IPV4_LENGTH.saturating_sub(self.mask).into();

        bits.checked_shr(shift_amount).unwrap_or(0)
            == other_bits.checked_shr(shift_amount).unwrap_or(0)
    }

    fn normalize(addr: u32, mask: u8) -> u32 {
        addr & u32::MAX.checked_shl((32 - mask).into()).unwrap_or(0)
    }

    /// Checks if the two CIDRs overlap.
    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        let min_mask = self.mask().min(other.mask());
        Self::normalize(self.address().to_bits(), min_mask)
            == Self::normalize(other.address().to_bits(), min_mask)
    }

    /// Get the canonical version of the CIDR, with the host part zeroed
    /// (e.g. 2.2.2.5/24 -> 2.2.2.0/24).
    pub fn canonical(&self) -> Self {
        Self {
            addr: Ipv4Addr::from_bits(Self::normalize(self.addr.to_bits(), self.mask())),
            mask: self.mask(),
        }
    }

    /// The network address (first address of the subnet).
    pub fn network(&self) -> Ipv4Addr {
        *self.canonical().address()
    }

    /// The broadcast address (last address of the subnet).
    pub fn broadcast(&self) -> Ipv4Addr {
        let hostmask = u32::MAX
            .checked_shr(self.mask.into())
            .unwrap_or(0);
        Ipv4Addr::from_bits(self.network().to_bits() | hostmask)
    }

    /// The conventional gateway address (first host of the subnet).
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from_bits(self.network().to_bits().wrapping_add(1))
    }

    /// Number of assignable host addresses, with network, gateway and
    /// broadcast excluded.
    pub fn host_capacity(&self) -> u64 {
        let total = 1u64 << (IPV4_LENGTH - self.mask);
        total.saturating_sub(3)
    }

    /// Number of usable addresses with only network and broadcast excluded.
    /// This is the counting rule for public pool ranges, which have no
    /// gateway convention.
    pub fn usable_capacity(&self) -> u64 {
        let total = 1u64 << (IPV4_LENGTH - self.mask);
        total.saturating_sub(2)
    }

    /// The n-th usable address (network + 1 + n), never the broadcast.
    pub fn nth_usable(&self, n: u64) -> Option<Ipv4Addr> {
        if n >= self.usable_capacity() {
            return None;
        }
        let base = self.network().to_bits() as u64;
        Some(Ipv4Addr::from_bits((base + 1 + n) as u32))
    }

    /// The n-th assignable host address, counting from zero. Skips the
    /// network address and the gateway; never yields the broadcast address.
    pub fn nth_host(&self, n: u64) -> Option<Ipv4Addr> {
        if n >= self.host_capacity() {
            return None;
        }
        let base = self.network().to_bits() as u64;
        Some(Ipv4Addr::from_bits((base + 2 + n) as u32))
    }

    /// Iterate all assignable host addresses in ascending order.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        (0..self.host_capacity()).map_while(|n| self.nth_host(n))
    }
}

impl<T: Into<Ipv4Addr>> From<T> for Ipv4Cidr {
    fn from(value: T) -> Self {
        Self {
            addr: value.into(),
            mask: 32,
        }
    }
}

impl std::str::FromStr for Ipv4Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.split_once('/') {
            None => Self {
                addr: s.parse()?,
                mask: 32,
            },
            Some((addr, mask)) => Self::new(
                addr.parse::<Ipv4Addr>()?,
                mask.parse::<u8>().map_err(|_| CidrError::InvalidNetmask)?,
            )?,
        })
    }
}

impl std::fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let cidr: Ipv4Cidr = "10.0.0.0/24".parse().unwrap();
        assert_eq!(cidr.to_string(), "10.0.0.0/24");
        assert_eq!(cidr.mask(), 24);
        assert!("10.0.0.0/33".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0/24".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn host_addressing() {
        let cidr: Ipv4Cidr = "10.0.0.0/24".parse().unwrap();
        assert_eq!(cidr.network(), Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(cidr.gateway(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(cidr.broadcast(), Ipv4Addr::new(10, 0, 0, 255));
        assert_eq!(cidr.host_capacity(), 253);
        assert_eq!(cidr.nth_host(0), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(cidr.nth_host(252), Some(Ipv4Addr::new(10, 0, 0, 254)));
        assert_eq!(cidr.nth_host(253), None);
    }

    #[test]
    fn tiny_subnets() {
        let cidr: Ipv4Cidr = "10.0.0.0/30".parse().unwrap();
        // network, gateway, one host, broadcast
        assert_eq!(cidr.host_capacity(), 1);
        assert_eq!(cidr.nth_host(0), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(cidr.nth_host(1), None);

        let cidr: Ipv4Cidr = "10.0.0.0/30".parse().unwrap();
        assert_eq!(cidr.usable_capacity(), 2);
        assert_eq!(cidr.nth_usable(1), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(cidr.nth_usable(2), None);

        let cidr: Ipv4Cidr = "10.0.0.0/32".parse().unwrap();
        assert_eq!(cidr.host_capacity(), 0);
        assert_eq!(cidr.usable_capacity(), 0);
    }

    #[test]
    fn containment_and_overlap() {
        let cidr: Ipv4Cidr = "192.168.1.0/24".parse().unwrap();
        assert!(cidr.contains_address(&Ipv4Addr::new(192, 168, 1, 77)));
        assert!(!cidr.contains_address(&Ipv4Addr::new(192, 168, 2, 1)));

        let other: Ipv4Cidr = "192.168.0.0/16".parse().unwrap();
        assert!(cidr.overlaps(&other));
        let disjoint: Ipv4Cidr = "10.0.0.0/8".parse().unwrap();
        assert!(!cidr.overlaps(&disjoint));
    }
}
