pub mod cid_allocator;
pub mod ip_allocator;
pub mod netplane;
pub mod tap;

pub use cid_allocator::CidAllocator;
pub use ip_allocator::{AllocatedIp, IpAllocator};
pub use netplane::HostNetplane;
pub use tap::{TapFactory, TapRecord};
