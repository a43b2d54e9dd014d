//! vsock context ID allocator.
//!
//! Same contract shape as the IP allocator, over an integer range. CIDs 0-2
//! are reserved by vsock semantics (VMADDR_CID_HYPERVISOR/LOCAL/HOST), hence
//! the low=3 default.

use std::collections::BTreeSet;

use crate::error::{OrchestratorError, Result};

#[derive(Debug)]
pub struct CidAllocator {
    low: u32,
    high: u32,
    allocated: BTreeSet<u32>,
}

impl CidAllocator {
    pub fn new(low: u32, high: u32) -> Result<Self> {
        if low > high {
            return Err(OrchestratorError::InvalidConfig(
                "cid low must be <= high".to_string(),
            ));
        }
        Ok(Self {
            low,
            high,
            allocated: BTreeSet::new(),
        })
    }

    pub fn allocate(&mut self) -> Result<u32> {
        for cid in self.low..=self.high {
            if !self.allocated.contains(&cid) {
                self.allocated.insert(cid);
                return Ok(cid);
            }
        }
        Err(OrchestratorError::Exhausted)
    }

    pub fn free(&mut self, cid: u32) -> Result<()> {
        if self.allocated.remove(&cid) {
            Ok(())
        } else {
            Err(OrchestratorError::NotAllocated(cid.to_string()))
        }
    }
}

impl Default for CidAllocator {
    fn default() -> Self {
        Self::new(3, 1000).expect("default cid range is valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_within_bounds_and_skips_reserved_range() {
        let mut a = CidAllocator::new(3, 5).unwrap();
        assert_eq!(a.allocate().unwrap(), 3);
        assert_eq!(a.allocate().unwrap(), 4);
        assert_eq!(a.allocate().unwrap(), 5);
        assert!(matches!(a.allocate(), Err(OrchestratorError::Exhausted)));
    }

    #[test]
    fn at_most_range_size_concurrent_allocations() {
        let mut a = CidAllocator::new(10, 12).unwrap();
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(a.allocate().unwrap());
        }
        assert!(a.allocate().is_err());
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|c| (10..=12).contains(c)));
    }

    #[test]
    fn free_then_reallocate_makes_value_available_again() {
        let mut a = CidAllocator::new(3, 3).unwrap();
        let cid = a.allocate().unwrap();
        a.free(cid).unwrap();
        assert_eq!(a.allocate().unwrap(), cid);
    }

    #[test]
    fn freeing_unallocated_cid_errors() {
        let mut a = CidAllocator::new(3, 10).unwrap();
        assert!(matches!(
            a.free(7),
            Err(OrchestratorError::NotAllocated(_))
        ));
    }
}
