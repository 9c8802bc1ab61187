//! Hypervisor driver capability.
//!
//! The sandbox core never speaks a hypervisor wire protocol itself; it
//! drives one of these. Every structural operation is asynchronous: the
//! driver returns once the request is accepted and delivers completion by
//! posting an event on the sandbox queue. Completions for the same resource
//! id must stay in submission order.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hypervm_shared::{VmError, VmResult};

use crate::layout::VmLayout;
use crate::pod::{InterfaceDescription, SerialPortDescription};
use crate::sandbox::events::EventHub;

/// Boot parameters of a sandbox VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootConfig {
    pub kernel: String,
    pub initrd: String,
    pub bios: String,
    pub cbfs: String,
    /// Boot ISO for the VirtualBox driver.
    pub vbox: String,
    pub cpu: u32,
    /// Memory size in MB.
    pub memory: u32,
}

/// Available hypervisor backends.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum DriverKind {
    Qemu,
    Libvirt,
    Xen,
    Vbox,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Qemu => "qemu",
            DriverKind::Libvirt => "libvirt",
            DriverKind::Xen => "xen",
            DriverKind::Vbox => "vbox",
        }
    }
}

impl FromStr for DriverKind {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "qemu" | "kvm" => Ok(DriverKind::Qemu),
            "libvirt" => Ok(DriverKind::Libvirt),
            "xen" => Ok(DriverKind::Xen),
            "vbox" => Ok(DriverKind::Vbox),
            _ => Err(VmError::BadRequest(format!(
                "unknown driver '{}'. Supported: qemu, libvirt, xen, vbox",
                s
            ))),
        }
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Host-side network settings produced by the network capability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub ip: String,
    pub gateway: String,
    pub mac: String,
    /// Host tap device wired to the guest NIC.
    pub tap_name: String,
    pub mtu: u32,
}

/// Description of a block device to hotplug.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDescription {
    /// Registry id: the volume name, or the container id for block rootfs.
    pub id: String,
    /// Host device or image path.
    pub source: String,
    pub format: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    pub usage_total: u64,
    pub usage_user: u64,
    pub usage_system: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub usage: u64,
    pub available: u64,
    pub rss: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub device: String,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockStats {
    pub device: String,
    pub rd_requests: u64,
    pub rd_bytes: u64,
    pub wr_requests: u64,
    pub wr_bytes: u64,
}

/// Resource usage snapshot pulled from the hypervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodStats {
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub network: Vec<NetworkStats>,
    pub block: Vec<BlockStats>,
    pub timestamp: DateTime<Utc>,
}

impl PodStats {
    pub fn empty() -> Self {
        Self {
            cpu: CpuStats::default(),
            memory: MemoryStats::default(),
            network: Vec::new(),
            block: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Hypervisor backend capability.
///
/// `launch` must arrange for either `VmStartFailed` or the guest agent
/// socket to come up; process termination must surface as `VmExit` or
/// `VmKilled` through the driver's watchdog.
#[async_trait::async_trait]
pub trait Driver: Send + Sync {
    /// First bus slot available for hotplugged devices.
    fn pci_base(&self) -> u32 {
        crate::layout::PCI_ADDR_FROM
    }

    /// Start the VM described by `boot` with its devices and sockets laid
    /// out under `layout`.
    async fn launch(&self, boot: &BootConfig, layout: &VmLayout, hub: EventHub) -> VmResult<()>;

    /// Re-attach to an already-running VM (supervisor restart path).
    async fn associate(&self, layout: &VmLayout, hub: EventHub) -> VmResult<()>;

    /// Hotplug a NIC. Completion: `InterfaceInserted { id, slot, tap_name }`.
    async fn add_nic(
        &self,
        nic: &InterfaceDescription,
        settings: &NetworkSettings,
        slot: u32,
        hub: EventHub,
    ) -> VmResult<()>;

    /// Unplug a NIC. Completion: `InterfaceEjected { id }`.
    async fn remove_nic(&self, id: &str, slot: u32, hub: EventHub) -> VmResult<()>;

    /// Hotplug a block device. Completion: `BlockInserted { id, slot, device }`.
    async fn add_block(&self, block: &BlockDescription, slot: u32, hub: EventHub) -> VmResult<()>;

    /// Unplug a block device. Completion: `BlockEjected { id }`.
    async fn remove_block(&self, id: &str, slot: u32, hub: EventHub) -> VmResult<()>;

    /// Attach a serial channel. Completion: `TtyOpen { id, slot }`.
    async fn add_serial(
        &self,
        serial: &SerialPortDescription,
        slot: u32,
        hub: EventHub,
    ) -> VmResult<()>;

    /// Detach a serial channel. Completion: `TtyClose { id }`.
    async fn remove_serial(&self, id: &str, slot: u32, hub: EventHub) -> VmResult<()>;

    async fn set_cpus(&self, cpus: u32) -> VmResult<()>;

    /// Hotplug memory into `slot`, in MB.
    async fn add_mem(&self, slot: u32, size_mb: u32) -> VmResult<()>;

    /// Freeze or thaw vcpus. Must not change sandbox pause bookkeeping.
    async fn pause(&self, pause: bool) -> VmResult<()>;

    /// Save a paused VM to `path`.
    async fn save(&self, path: &Path) -> VmResult<()>;

    async fn stats(&self) -> VmResult<PodStats>;

    /// Graceful hypervisor exit; the watchdog posts `VmExit` when the
    /// process is gone.
    async fn quit(&self, hub: EventHub) -> VmResult<()>;

    /// Force-kill the hypervisor process; the watchdog posts `VmKilled`.
    async fn kill(&self, hub: EventHub) -> VmResult<()>;

    /// Allocate host-side networking for an interface with no requested
    /// address.
    async fn allocate_network(&self, vm_id: &str) -> VmResult<NetworkSettings>;

    /// Configure host-side networking for a requested address.
    async fn configure_network(
        &self,
        vm_id: &str,
        nic: &InterfaceDescription,
    ) -> VmResult<NetworkSettings>;

    /// Release host-side networking claimed by `allocate`/`configure`.
    async fn release_network(&self, vm_id: &str, settings: &NetworkSettings) -> VmResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_kind_from_str() {
        assert_eq!("qemu".parse::<DriverKind>().unwrap(), DriverKind::Qemu);
        assert_eq!("KVM".parse::<DriverKind>().unwrap(), DriverKind::Qemu);
        assert_eq!("libvirt".parse::<DriverKind>().unwrap(), DriverKind::Libvirt);
        assert_eq!("xen".parse::<DriverKind>().unwrap(), DriverKind::Xen);
        assert_eq!("vbox".parse::<DriverKind>().unwrap(), DriverKind::Vbox);
        assert!("hyperkit".parse::<DriverKind>().is_err());
    }

    #[test]
    fn test_pod_stats_serialization() {
        let stats = PodStats {
            cpu: CpuStats {
                usage_total: 100,
                usage_user: 60,
                usage_system: 40,
            },
            memory: MemoryStats {
                usage: 64 << 20,
                available: 128 << 20,
                rss: 32 << 20,
            },
            network: vec![NetworkStats {
                device: "tap0".into(),
                rx_bytes: 10,
                ..Default::default()
            }],
            block: Vec::new(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&stats).unwrap();
        let back: PodStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cpu, stats.cpu);
        assert_eq!(back.network, stats.network);
    }
}
