//! IPv4 subnets and the allocator that hands them out to bridges

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{AppError, AppResult};

/// An IPv4 network in CIDR notation, always stored in canonical form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> AppResult<Self> {
        if prefix > 32 {
            return Err(AppError::invalid_topology(format!(
                "prefix length {} is out of range",
                prefix
            )));
        }
        let network = Ipv4Addr::from(u32::from(addr) & Self::mask(prefix));
        Ok(Self { network, prefix })
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn first(&self) -> u32 {
        u32::from(self.network)
    }

    fn last(&self) -> u32 {
        self.first() | !Self::mask(self.prefix)
    }

    /// First and last address as integers, inclusive
    pub fn range(&self) -> (u32, u32) {
        (self.first(), self.last())
    }

    pub fn overlaps(&self, other: &Subnet) -> bool {
        self.first() <= other.last() && other.first() <= self.last()
    }

    /// Iterate over the `prefix`-sized blocks inside this subnet
    pub fn blocks(&self, prefix: u8) -> impl Iterator<Item = Subnet> {
        let valid = prefix >= self.prefix && prefix <= 32;
        let step: u64 = if valid { 1u64 << (32 - prefix) } else { 0 };
        let count: u64 = if valid {
            1u64 << (prefix - self.prefix)
        } else {
            0
        };
        let base = self.first() as u64;
        (0..count).map(move |i| Subnet {
            network: Ipv4Addr::from((base + i * step) as u32),
            prefix,
        })
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Subnet {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| AppError::invalid_topology(format!("'{}' is not in CIDR notation", s)))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| AppError::invalid_topology(format!("'{}' has an invalid address", s)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| AppError::invalid_topology(format!("'{}' has an invalid prefix", s)))?;
        Subnet::new(addr, prefix)
    }
}

impl Serialize for Subnet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Subnet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Hands out non-overlapping bridge subnets from a pool.
///
/// `taken` holds every subnet that must be avoided: explicit subnets of the
/// topology being created and reservations held by other deployments.
#[derive(Debug, Clone)]
pub struct SubnetAllocator {
    pool: Subnet,
    block_prefix: u8,
    taken: Vec<Subnet>,
}

impl SubnetAllocator {
    pub const DEFAULT_BLOCK_PREFIX: u8 = 24;

    pub fn new(pool: Subnet) -> Self {
        let block_prefix = Self::DEFAULT_BLOCK_PREFIX.max(pool.prefix());
        Self {
            pool,
            block_prefix,
            taken: Vec::new(),
        }
    }

    pub fn reserve(&mut self, subnet: Subnet) {
        self.taken.push(subnet);
    }

    pub fn is_free(&self, subnet: &Subnet) -> bool {
        !self.taken.iter().any(|t| t.overlaps(subnet))
    }

    /// Candidate blocks in pool order that do not collide with anything taken
    pub fn candidates(&self) -> impl Iterator<Item = Subnet> + '_ {
        self.pool
            .blocks(self.block_prefix)
            .filter(move |b| self.is_free(b))
    }

    /// Take the first free block and mark it as taken
    pub fn allocate(&mut self) -> AppResult<Subnet> {
        let next = self.candidates().next().ok_or_else(|| {
            AppError::bridge_conflict(format!("subnet pool {} is exhausted", self.pool))
        })?;
        self.taken.push(next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(s: &str) -> Subnet {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_canonicalizes() {
        let s = subnet("172.30.1.7/24");
        assert_eq!(s.to_string(), "172.30.1.0/24");
        assert!("172.30.0.0".parse::<Subnet>().is_err());
        assert!("172.30.0.0/33".parse::<Subnet>().is_err());
        assert!("300.1.1.1/8".parse::<Subnet>().is_err());
    }

    #[test]
    fn test_overlap() {
        assert!(subnet("10.0.0.0/16").overlaps(&subnet("10.0.5.0/24")));
        assert!(!subnet("10.0.0.0/24").overlaps(&subnet("10.0.1.0/24")));
        assert_eq!(
            subnet("10.0.1.0/24").range(),
            (0x0a00_0100, 0x0a00_01ff)
        );
    }

    #[test]
    fn test_allocator_skips_taken_blocks() {
        let mut alloc = SubnetAllocator::new(subnet("172.30.0.0/16"));
        alloc.reserve(subnet("172.30.0.0/24"));
        alloc.reserve(subnet("172.30.2.0/23"));

        assert_eq!(alloc.allocate().unwrap(), subnet("172.30.1.0/24"));
        assert_eq!(alloc.allocate().unwrap(), subnet("172.30.4.0/24"));
    }

    #[test]
    fn test_allocator_exhaustion() {
        let mut alloc = SubnetAllocator::new(subnet("10.1.0.0/23"));
        alloc.allocate().unwrap();
        alloc.allocate().unwrap();
        let err = alloc.allocate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BridgeConflict);
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&subnet("192.168.10.0/24")).unwrap();
        assert_eq!(json, "\"192.168.10.0/24\"");
        let back: Subnet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, subnet("192.168.10.0/24"));
    }
}
