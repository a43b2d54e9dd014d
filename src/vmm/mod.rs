pub mod client;
pub mod config;

pub use client::VmmClient;
pub use config::{build_create_vm_request, CreateVmRequest, VmConfigInputs};
