//! Device registry: slot allocation and lifecycle tracking for the devices
//! attached to one sandbox.
//!
//! The registry is owned by the event loop; nothing else mutates it. Slots
//! are drawn from a free list starting at `PCI_ADDR_FROM`: the lowest free
//! slot is taken when an insert is dispatched and returned when the insert
//! fails or the device is ejected, so no two live entries ever share one.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use hypervm_shared::{VmError, VmResult};

use crate::layout::PCI_ADDR_FROM;
use crate::pod::{InterfaceDescription, SerialPortDescription};

/// Structural resource classes tracked by the registry and the pending-op
/// table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Container,
    Volume,
    Interface,
    Block,
    Serial,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Container => "container",
            ResourceKind::Volume => "volume",
            ResourceKind::Interface => "interface",
            ResourceKind::Block => "block",
            ResourceKind::Serial => "serial",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Hotplug lifecycle of one device entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Pending,
    Inserted,
    Ejecting,
    Ejected,
}

/// Free-list slot allocator.
///
/// Dense: always hands out the lowest free slot at or above the base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotAllocator {
    base: u32,
    next: u32,
    freed: BTreeSet<u32>,
}

impl SlotAllocator {
    pub fn new(base: u32) -> Self {
        Self {
            base,
            next: base,
            freed: BTreeSet::new(),
        }
    }

    /// Take the lowest free slot.
    pub fn take(&mut self) -> u32 {
        if let Some(&slot) = self.freed.iter().next() {
            self.freed.remove(&slot);
            return slot;
        }
        let slot = self.next;
        self.next += 1;
        slot
    }

    /// Return a slot to the free list.
    pub fn put_back(&mut self, slot: u32) {
        if slot < self.base || slot >= self.next {
            return;
        }
        self.freed.insert(slot);
    }

    /// Mark a slot as in use, growing the allocated range as needed.
    /// Used when rebuilding the registry from a snapshot.
    pub fn claim(&mut self, slot: u32) {
        if slot >= self.next {
            for s in self.next..slot {
                self.freed.insert(s);
            }
            self.next = slot + 1;
        } else {
            self.freed.remove(&slot);
        }
    }
}

impl Default for SlotAllocator {
    fn default() -> Self {
        Self::new(PCI_ADDR_FROM)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceEntry {
    pub desc: InterfaceDescription,
    pub status: DeviceStatus,
    pub slot: Option<u32>,
    /// Host tap actually wired by the driver; may differ from the request.
    pub tap_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockEntry {
    /// Volume name, or container id for a block rootfs.
    pub id: String,
    pub status: DeviceStatus,
    pub slot: Option<u32>,
    /// Device name inside the guest, e.g. "vdb".
    pub guest_device: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialEntry {
    pub desc: SerialPortDescription,
    pub status: DeviceStatus,
    pub slot: Option<u32>,
}

/// Per-sandbox device table.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    slots: SlotAllocator,
    interfaces: BTreeMap<String, InterfaceEntry>,
    blocks: BTreeMap<String, BlockEntry>,
    serials: BTreeMap<String, SerialEntry>,
    /// Confirmed insertions in order, for reverse-order cleanup.
    insertion_log: Vec<(ResourceKind, String)>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose slots start at a driver-specified base.
    pub fn with_base(base: u32) -> Self {
        Self {
            slots: SlotAllocator::new(base),
            ..Self::default()
        }
    }

    fn live(status: DeviceStatus) -> bool {
        !matches!(status, DeviceStatus::Ejected)
    }

    /// Begin an interface insertion: allocate a slot, record Pending.
    pub fn begin_interface_insert(
        &mut self,
        desc: InterfaceDescription,
    ) -> VmResult<u32> {
        if self
            .interfaces
            .get(&desc.id)
            .map(|e| Self::live(e.status))
            .unwrap_or(false)
        {
            return Err(VmError::BadRequest(format!(
                "interface {} already attached",
                desc.id
            )));
        }
        let slot = self.slots.take();
        self.interfaces.insert(
            desc.id.clone(),
            InterfaceEntry {
                desc,
                status: DeviceStatus::Pending,
                slot: Some(slot),
                tap_name: None,
            },
        );
        Ok(slot)
    }

    /// Driver confirmed the NIC; the slot is now firmly held.
    pub fn confirm_interface(&mut self, id: &str, slot: u32, tap_name: String) -> VmResult<()> {
        let entry = self
            .interfaces
            .get_mut(id)
            .ok_or_else(|| VmError::BadRequest(format!("unknown interface {}", id)))?;
        entry.status = DeviceStatus::Inserted;
        entry.slot = Some(slot);
        entry.tap_name = Some(tap_name);
        self.insertion_log
            .push((ResourceKind::Interface, id.to_string()));
        Ok(())
    }

    pub fn begin_interface_eject(&mut self, id: &str) -> VmResult<u32> {
        let entry = self
            .interfaces
            .get_mut(id)
            .filter(|e| Self::live(e.status))
            .ok_or_else(|| VmError::BadRequest(format!("unknown interface {}", id)))?;
        if entry.status != DeviceStatus::Inserted {
            return Err(VmError::Busy(format!("interface {} is {:?}", id, entry.status)));
        }
        entry.status = DeviceStatus::Ejecting;
        entry
            .slot
            .ok_or_else(|| VmError::DriverFail(format!("interface {} has no slot", id)))
    }

    /// Remove a failed or ejected entry; its slot returns to the free list.
    pub fn drop_interface(&mut self, id: &str) -> Option<InterfaceEntry> {
        let entry = self.interfaces.remove(id)?;
        if let Some(slot) = entry.slot {
            self.slots.put_back(slot);
        }
        self.insertion_log
            .retain(|(k, i)| !(*k == ResourceKind::Interface && i == id));
        Some(entry)
    }

    pub fn interface(&self, id: &str) -> Option<&InterfaceEntry> {
        self.interfaces.get(id)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &InterfaceEntry> {
        self.interfaces.values()
    }

    pub fn begin_block_insert(&mut self, id: &str) -> VmResult<u32> {
        if self
            .blocks
            .get(id)
            .map(|e| Self::live(e.status))
            .unwrap_or(false)
        {
            return Err(VmError::BadRequest(format!("block {} already attached", id)));
        }
        let slot = self.slots.take();
        self.blocks.insert(
            id.to_string(),
            BlockEntry {
                id: id.to_string(),
                status: DeviceStatus::Pending,
                slot: Some(slot),
                guest_device: None,
            },
        );
        Ok(slot)
    }

    pub fn confirm_block(&mut self, id: &str, slot: u32, guest_device: String) -> VmResult<()> {
        let entry = self
            .blocks
            .get_mut(id)
            .ok_or_else(|| VmError::BadRequest(format!("unknown block {}", id)))?;
        entry.status = DeviceStatus::Inserted;
        entry.slot = Some(slot);
        entry.guest_device = Some(guest_device);
        self.insertion_log.push((ResourceKind::Block, id.to_string()));
        Ok(())
    }

    pub fn begin_block_eject(&mut self, id: &str) -> VmResult<u32> {
        let entry = self
            .blocks
            .get_mut(id)
            .filter(|e| Self::live(e.status))
            .ok_or_else(|| VmError::BadRequest(format!("unknown block {}", id)))?;
        if entry.status != DeviceStatus::Inserted {
            return Err(VmError::Busy(format!("block {} is {:?}", id, entry.status)));
        }
        entry.status = DeviceStatus::Ejecting;
        entry
            .slot
            .ok_or_else(|| VmError::DriverFail(format!("block {} has no slot", id)))
    }

    pub fn drop_block(&mut self, id: &str) -> Option<BlockEntry> {
        let entry = self.blocks.remove(id)?;
        if let Some(slot) = entry.slot {
            self.slots.put_back(slot);
        }
        self.insertion_log
            .retain(|(k, i)| !(*k == ResourceKind::Block && i == id));
        Some(entry)
    }

    pub fn block(&self, id: &str) -> Option<&BlockEntry> {
        self.blocks.get(id)
    }

    pub fn begin_serial_insert(&mut self, desc: SerialPortDescription) -> VmResult<u32> {
        if self
            .serials
            .get(&desc.id)
            .map(|e| Self::live(e.status))
            .unwrap_or(false)
        {
            return Err(VmError::BadRequest(format!(
                "serial {} already attached",
                desc.id
            )));
        }
        let slot = self.slots.take();
        self.serials.insert(
            desc.id.clone(),
            SerialEntry {
                desc,
                status: DeviceStatus::Pending,
                slot: Some(slot),
            },
        );
        Ok(slot)
    }

    pub fn confirm_serial(&mut self, id: &str, slot: u32) -> VmResult<()> {
        let entry = self
            .serials
            .get_mut(id)
            .ok_or_else(|| VmError::BadRequest(format!("unknown serial {}", id)))?;
        entry.status = DeviceStatus::Inserted;
        entry.slot = Some(slot);
        self.insertion_log.push((ResourceKind::Serial, id.to_string()));
        Ok(())
    }

    pub fn begin_serial_eject(&mut self, id: &str) -> VmResult<u32> {
        let entry = self
            .serials
            .get_mut(id)
            .filter(|e| Self::live(e.status))
            .ok_or_else(|| VmError::BadRequest(format!("unknown serial {}", id)))?;
        if entry.status != DeviceStatus::Inserted {
            return Err(VmError::Busy(format!("serial {} is {:?}", id, entry.status)));
        }
        entry.status = DeviceStatus::Ejecting;
        entry
            .slot
            .ok_or_else(|| VmError::DriverFail(format!("serial {} has no slot", id)))
    }

    pub fn drop_serial(&mut self, id: &str) -> Option<SerialEntry> {
        let entry = self.serials.remove(id)?;
        if let Some(slot) = entry.slot {
            self.slots.put_back(slot);
        }
        self.insertion_log
            .retain(|(k, i)| !(*k == ResourceKind::Serial && i == id));
        Some(entry)
    }

    pub fn serial(&self, id: &str) -> Option<&SerialEntry> {
        self.serials.get(id)
    }

    /// Undo a failed eject: the device is still attached.
    pub fn revert_eject(&mut self, kind: ResourceKind, id: &str) {
        let status = match kind {
            ResourceKind::Interface => self.interfaces.get_mut(id).map(|e| &mut e.status),
            ResourceKind::Block | ResourceKind::Volume => {
                self.blocks.get_mut(id).map(|e| &mut e.status)
            }
            ResourceKind::Serial => self.serials.get_mut(id).map(|e| &mut e.status),
            ResourceKind::Container => None,
        };
        if let Some(status) = status
            && *status == DeviceStatus::Ejecting
        {
            *status = DeviceStatus::Inserted;
        }
    }

    /// Confirmed insertions, most recent first. Cleaning ejects in this
    /// order.
    pub fn inserted_reverse(&self) -> Vec<(ResourceKind, String)> {
        self.insertion_log.iter().rev().cloned().collect()
    }

    /// Rebuild a registry from snapshotted entries.
    pub fn restore(
        interfaces: Vec<InterfaceEntry>,
        blocks: Vec<BlockEntry>,
        serials: Vec<SerialEntry>,
        insertion_log: Vec<(ResourceKind, String)>,
    ) -> Self {
        let mut registry = Self::new();
        for entry in interfaces {
            if let Some(slot) = entry.slot {
                registry.slots.claim(slot);
            }
            registry.interfaces.insert(entry.desc.id.clone(), entry);
        }
        for entry in blocks {
            if let Some(slot) = entry.slot {
                registry.slots.claim(slot);
            }
            registry.blocks.insert(entry.id.clone(), entry);
        }
        for entry in serials {
            if let Some(slot) = entry.slot {
                registry.slots.claim(slot);
            }
            registry.serials.insert(entry.desc.id.clone(), entry);
        }
        registry.insertion_log = insertion_log;
        registry
    }

    /// Snapshot the registry contents for `dump()`.
    pub fn snapshot(
        &self,
    ) -> (
        Vec<InterfaceEntry>,
        Vec<BlockEntry>,
        Vec<SerialEntry>,
        Vec<(ResourceKind, String)>,
    ) {
        (
            self.interfaces.values().cloned().collect(),
            self.blocks.values().cloned().collect(),
            self.serials.values().cloned().collect(),
            self.insertion_log.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nic(id: &str) -> InterfaceDescription {
        InterfaceDescription {
            id: id.to_string(),
            index: 1,
            device: "eth0".to_string(),
            ip: Some("10.0.0.2/24".to_string()),
            mac: None,
            mtu: 1500,
            gateway: None,
            tap_name: None,
        }
    }

    #[test]
    fn test_slots_are_dense_from_base() {
        let mut slots = SlotAllocator::new(0x05);
        assert_eq!(slots.take(), 0x05);
        assert_eq!(slots.take(), 0x06);
        assert_eq!(slots.take(), 0x07);

        slots.put_back(0x06);
        // Lowest free slot is reused first.
        assert_eq!(slots.take(), 0x06);
        assert_eq!(slots.take(), 0x08);
    }

    #[test]
    fn test_put_back_ignores_foreign_slots() {
        let mut slots = SlotAllocator::new(0x05);
        let s = slots.take();
        slots.put_back(0x02);
        slots.put_back(0x40);
        slots.put_back(s);
        assert_eq!(slots.take(), s);
    }

    #[test]
    fn test_interface_lifecycle_reuses_slot() {
        let mut registry = DeviceRegistry::new();

        let slot = registry.begin_interface_insert(nic("net0")).unwrap();
        assert_eq!(slot, PCI_ADDR_FROM);
        registry
            .confirm_interface("net0", slot, "tap0".to_string())
            .unwrap();
        assert_eq!(
            registry.interface("net0").unwrap().status,
            DeviceStatus::Inserted
        );

        let eject_slot = registry.begin_interface_eject("net0").unwrap();
        assert_eq!(eject_slot, slot);
        registry.drop_interface("net0");

        // Slot is reusable after eject.
        let slot2 = registry.begin_interface_insert(nic("net1")).unwrap();
        assert_eq!(slot2, slot);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut registry = DeviceRegistry::new();
        registry.begin_interface_insert(nic("net0")).unwrap();
        let err = registry.begin_interface_insert(nic("net0")).unwrap_err();
        assert!(matches!(err, VmError::BadRequest(_)));
    }

    #[test]
    fn test_eject_requires_inserted() {
        let mut registry = DeviceRegistry::new();
        registry.begin_interface_insert(nic("net0")).unwrap();
        // Still pending; eject must wait.
        assert!(matches!(
            registry.begin_interface_eject("net0"),
            Err(VmError::Busy(_))
        ));
    }

    #[test]
    fn test_no_two_live_entries_share_a_slot() {
        let mut registry = DeviceRegistry::new();
        let s1 = registry.begin_interface_insert(nic("net0")).unwrap();
        let s2 = registry.begin_block_insert("v1").unwrap();
        let s3 = registry.begin_serial_insert(SerialPortDescription {
            id: "tty1".into(),
            socket_path: "/tmp/tty1.sock".into(),
        })
        .unwrap();
        assert_ne!(s1, s2);
        assert_ne!(s2, s3);
        assert_ne!(s1, s3);
    }

    #[test]
    fn test_insertion_log_reversed_for_cleanup() {
        let mut registry = DeviceRegistry::new();
        let s1 = registry.begin_block_insert("v1").unwrap();
        registry.confirm_block("v1", s1, "vda".into()).unwrap();
        let s2 = registry.begin_interface_insert(nic("net0")).unwrap();
        registry.confirm_interface("net0", s2, "tap0".into()).unwrap();

        let order = registry.inserted_reverse();
        assert_eq!(
            order,
            vec![
                (ResourceKind::Interface, "net0".to_string()),
                (ResourceKind::Block, "v1".to_string()),
            ]
        );
    }

    #[test]
    fn test_restore_claims_snapshotted_slots() {
        let mut registry = DeviceRegistry::new();
        let slot = registry.begin_interface_insert(nic("net0")).unwrap();
        registry.confirm_interface("net0", slot, "tap0".into()).unwrap();

        let (interfaces, blocks, serials, log) = registry.snapshot();
        let mut restored = DeviceRegistry::restore(interfaces, blocks, serials, log);

        // A new insert must not collide with the restored slot.
        let next = restored.begin_block_insert("v1").unwrap();
        assert_ne!(next, slot);
    }
}
