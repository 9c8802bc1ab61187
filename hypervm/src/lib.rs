//! hypervm: the sandbox core of a hypervisor-based OCI runtime.
//!
//! Each container workload runs inside a lightweight VM. This crate owns
//! the host-side supervisor state machine: it launches a pluggable
//! hypervisor [`vmm::Driver`], speaks the framed control protocol to the
//! guest init over [`agent::AgentChannel`], tracks hotplugged devices in
//! the [`devices::DeviceRegistry`], and serializes every structural change
//! through the per-sandbox event loop behind [`sandbox::Vm`].
//!
//! What it does not do: execute processes, mount filesystems, or speak a
//! hypervisor wire protocol. Those live in the driver, the guest agent,
//! and the CLI front-end.

pub mod agent;
pub mod console;
pub mod devices;
pub mod layout;
pub mod logging;
pub mod pod;
pub mod sandbox;
pub mod vmm;

pub use hypervm_shared::{VmError, VmResult};

pub use layout::{BASE_DIR, PCI_ADDR_FROM, VmLayout};
pub use pod::PodSpec;
pub use sandbox::response::{ResponseCode, VmResponse};
pub use sandbox::state::SandboxStatus;
pub use sandbox::{SandboxOptions, Vm, random_vm_id};
pub use vmm::{BootConfig, Driver, DriverKind, PodStats};
