//! Guest IP allocator.
//!
//! Hands out the numerically lowest unallocated address in a CIDR —
//! network and broadcast addresses included — skipping only the bridge's
//! own address. Deterministic so tests are reproducible.

use ipnet::Ipv4Net;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedIp {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl std::fmt::Display for AllocatedIp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

#[derive(Debug)]
pub struct IpAllocator {
    net: Ipv4Net,
    bridge_ip: Ipv4Addr,
    allocated: BTreeSet<Ipv4Addr>,
}

impl IpAllocator {
    /// Fails if `cidr` cannot be parsed or has no usable addresses once the
    /// bridge address is excluded. Unlike `Ipv4Net::hosts()`, the allocatable
    /// range is every address in the CIDR (network and broadcast included)
    /// with only the bridge's own address carved out — a `/30` has 4 total
    /// addresses and therefore 3 allocatable ones.
    pub fn new(cidr: &str, bridge_ip: Ipv4Addr) -> Result<Self> {
        let net: Ipv4Net = cidr
            .parse()
            .map_err(|e| OrchestratorError::InvalidConfig(format!("bad CIDR `{cidr}`: {e}")))?;
        if address_range(&net).all(|a| a == bridge_ip) {
            return Err(OrchestratorError::InvalidConfig(format!(
                "CIDR `{cidr}` has no usable addresses besides the bridge IP"
            )));
        }
        Ok(Self {
            net,
            bridge_ip,
            allocated: BTreeSet::new(),
        })
    }

    pub fn prefix_len(&self) -> u8 {
        self.net.prefix_len()
    }

    /// Returns the lowest unallocated address in the CIDR, skipping the
    /// bridge IP.
    pub fn allocate(&mut self) -> Result<AllocatedIp> {
        for addr in address_range(&self.net) {
            if addr == self.bridge_ip {
                continue;
            }
            if !self.allocated.contains(&addr) {
                self.allocated.insert(addr);
                return Ok(AllocatedIp {
                    addr,
                    prefix_len: self.net.prefix_len(),
                });
            }
        }
        Err(OrchestratorError::Exhausted)
    }

    /// Marks `addr` available again. Errors if `addr` was never handed out.
    pub fn free(&mut self, addr: Ipv4Addr) -> Result<()> {
        if self.allocated.remove(&addr) {
            Ok(())
        } else {
            Err(OrchestratorError::NotAllocated(addr.to_string()))
        }
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }
}

/// Every address in `net`, network and broadcast included, in ascending
/// order. `net.hosts()` excludes both for any prefix shorter than /31, which
/// is not what the allocator wants: only the bridge IP is carved out, not
/// the network/broadcast addresses.
fn address_range(net: &Ipv4Net) -> impl Iterator<Item = Ipv4Addr> {
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    (start..=end).map(Ipv4Addr::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc() -> IpAllocator {
        IpAllocator::new("10.20.1.0/30", "10.20.1.1".parse().unwrap()).unwrap()
    }

    #[test]
    fn allocates_lowest_free_first_and_skips_bridge() {
        let mut a = alloc();
        let first = a.allocate().unwrap();
        // .0 is the network address (not excluded), .1 is the bridge (skipped)
        assert_eq!(first.addr, "10.20.1.0".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn exhausts_after_all_addresses_in_cidr_taken() {
        let mut a = alloc();
        // a /30 has 4 total addresses (.0-.3); excluding only the bridge's
        // .1 leaves .0, .2, .3 allocatable per spec.md scenario 5.
        assert_eq!(a.allocate().unwrap().addr, "10.20.1.0".parse::<Ipv4Addr>().unwrap());
        assert_eq!(a.allocate().unwrap().addr, "10.20.1.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(a.allocate().unwrap().addr, "10.20.1.3".parse::<Ipv4Addr>().unwrap());
        assert!(matches!(a.allocate(), Err(OrchestratorError::Exhausted)));
    }

    #[test]
    fn freeing_never_allocated_address_is_an_error() {
        let mut a = alloc();
        let err = a.free("10.20.1.2".parse().unwrap());
        assert!(matches!(err, Err(OrchestratorError::NotAllocated(_))));
    }

    #[test]
    fn free_then_reallocate_returns_the_same_address() {
        let mut a = alloc();
        let ip = a.allocate().unwrap();
        a.free(ip.addr).unwrap();
        let ip2 = a.allocate().unwrap();
        assert_eq!(ip.addr, ip2.addr);
    }

    #[test]
    fn double_free_is_an_error() {
        let mut a = alloc();
        let ip = a.allocate().unwrap();
        a.free(ip.addr).unwrap();
        assert!(matches!(
            a.free(ip.addr),
            Err(OrchestratorError::NotAllocated(_))
        ));
    }

    #[test]
    fn cidr_with_no_addresses_besides_the_bridge_ip_is_rejected() {
        // a /32's sole address is the bridge's own, leaving nothing allocatable.
        let err = IpAllocator::new("10.20.1.1/32", "10.20.1.1".parse().unwrap());
        assert!(err.is_err());
    }
}
