//! In-memory pod model: containers, volumes, network interfaces and their
//! runtime status.
//!
//! The spec side (`PodSpec` and the `*Description` types) is frozen at
//! launch and shipped to the guest; the status side changes as devices are
//! inserted and containers start and stop.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use hypervm_shared::{VmError, VmResult};

/// Length of a full container id (64 hex chars = 256 bits).
pub const CONTAINER_ID_LEN: usize = 64;
/// Length of the truncated display form.
pub const CONTAINER_ID_SHORT_LEN: usize = 12;

/// Generate a random container id.
///
/// 32 random bytes hashed through SHA-256 and hex encoded. Regenerates when
/// the truncated form parses as a base-10 integer, which would break hosts
/// that use the short id as a hostname.
pub fn generate_container_id() -> String {
    loop {
        let mut random_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut random_bytes);

        let mut hasher = Sha256::new();
        hasher.update(random_bytes);
        let id = hex::encode(hasher.finalize());

        if truncate_id(&id).parse::<i64>().is_err() {
            return id;
        }
    }
}

/// Truncated display form of a container id.
pub fn truncate_id(id: &str) -> &str {
    if id.len() < CONTAINER_ID_SHORT_LEN {
        id
    } else {
        &id[..CONTAINER_ID_SHORT_LEN]
    }
}

/// How a container's root filesystem reaches the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "fstype")]
pub enum RootfsKind {
    /// Directory bind inside the share directory.
    Dir,
    /// Dedicated block device hotplugged into the guest.
    Block { volume: String },
    /// Overlay assembled by the guest from layer directories.
    Overlay {
        lower_dirs: Vec<String>,
        upper_dir: String,
        work_dir: String,
    },
}

/// Process to run as the container init.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub workdir: String,
    pub terminal: bool,
}

/// A mount of a pod volume into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRef {
    /// Name of the referenced volume; must exist in the pod volume table.
    pub volume: String,
    /// Mount point inside the container.
    pub path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDescription {
    pub id: String,
    pub name: Option<String>,
    /// Image reference or rootfs path as handed to the guest.
    pub image: String,
    pub rootfs: RootfsKind,
    pub mounts: Vec<MountRef>,
    pub process: ProcessSpec,
}

/// Backing store of a pod volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum VolumeKind {
    /// Host path bind exposed through the share directory.
    HostBind { source: String },
    /// Raw block device hotplugged into the guest.
    Block { device: String, format: String },
    /// Dedicated filesystem the guest mounts itself.
    Filesystem { fstype: String, source: String },
}

impl VolumeKind {
    /// Whether inserting this volume requires hypervisor hotplug.
    pub fn needs_block_device(&self) -> bool {
        matches!(self, VolumeKind::Block { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDescription {
    /// Unique within the pod.
    pub name: String,
    pub kind: VolumeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescription {
    /// Unique within the pod.
    pub id: String,
    /// Ordering index; the loopback device is index 0 by convention.
    pub index: usize,
    /// Guest-side device name, e.g. "eth0" or "lo".
    pub device: String,
    /// Requested address in CIDR form, e.g. "192.168.5.2/24".
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub mtu: u32,
    pub gateway: Option<String>,
    /// Host-side tap device; filled by the network capability when absent.
    pub tap_name: Option<String>,
}

impl InterfaceDescription {
    pub fn is_loopback(&self) -> bool {
        self.device == "lo"
    }
}

/// Serial channel exported to the guest, used for tty multiplexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialPortDescription {
    pub id: String,
    /// Host-side unix socket backing the channel.
    pub socket_path: String,
}

/// The workload spec: ordered containers plus the volumes and interfaces
/// they share. Frozen when the pod starts; runtime mutations go through the
/// sandbox context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSpec {
    pub id: String,
    pub hostname: String,
    pub containers: Vec<ContainerDescription>,
    pub volumes: Vec<VolumeDescription>,
    pub interfaces: Vec<InterfaceDescription>,
}

impl PodSpec {
    /// Validate the cross-reference invariants before the spec is frozen.
    ///
    /// Container mounts must reference declared volumes, and container,
    /// volume, and interface ids must be unique.
    pub fn validate(&self) -> VmResult<()> {
        let mut volumes = std::collections::HashSet::new();
        for v in &self.volumes {
            if !volumes.insert(v.name.as_str()) {
                return Err(VmError::BadRequest(format!(
                    "duplicate volume {}",
                    v.name
                )));
            }
        }

        let mut containers = std::collections::HashSet::new();
        for c in &self.containers {
            if !containers.insert(c.id.as_str()) {
                return Err(VmError::BadRequest(format!(
                    "duplicate container {}",
                    truncate_id(&c.id)
                )));
            }
            for m in &c.mounts {
                if !volumes.contains(m.volume.as_str()) {
                    return Err(VmError::BadRequest(format!(
                        "container {} mounts unknown volume {}",
                        truncate_id(&c.id),
                        m.volume
                    )));
                }
            }
        }

        let mut interfaces = std::collections::HashSet::new();
        for i in &self.interfaces {
            if !interfaces.insert(i.id.as_str()) {
                return Err(VmError::BadRequest(format!(
                    "duplicate interface {}",
                    i.id
                )));
            }
        }
        Ok(())
    }

    pub fn container(&self, id: &str) -> Option<&ContainerDescription> {
        self.containers.iter().find(|c| c.id == id)
    }

    pub fn volume(&self, name: &str) -> Option<&VolumeDescription> {
        self.volumes.iter().find(|v| v.name == name)
    }

    pub fn interface(&self, id: &str) -> Option<&InterfaceDescription> {
        self.interfaces.iter().find(|i| i.id == id)
    }
}

/// Lifecycle state of a container inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Stopped,
    Failed,
}

impl ContainerState {
    pub fn can_transition_to(&self, target: ContainerState) -> bool {
        use ContainerState::*;
        matches!(
            (self, target),
            (Created, Running)
                | (Created, Failed)
                | (Created, Stopped)
                | (Running, Stopped)
                | (Running, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Stopped => "stopped",
            ContainerState::Failed => "failed",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runtime status of one container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub state: ContainerState,
    pub last_updated: DateTime<Utc>,
}

impl ContainerStatus {
    pub fn new() -> Self {
        Self {
            state: ContainerState::Created,
            last_updated: Utc::now(),
        }
    }

    pub fn transition_to(&mut self, target: ContainerState) -> VmResult<()> {
        if !self.state.can_transition_to(target) {
            return Err(VmError::BadRequest(format!(
                "cannot transition container from {} to {}",
                self.state, target
            )));
        }
        self.state = target;
        self.last_updated = Utc::now();
        Ok(())
    }
}

impl Default for ContainerStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable pod state owned by the sandbox context.
///
/// Tracks the frozen spec together with container states and volume
/// refcounts. Volume refcount = number of containers referencing it; a
/// volume is destroyed only when its refcount is zero and removal was
/// requested.
#[derive(Debug, Default)]
pub struct PodModel {
    pub spec: PodSpec,
    containers: HashMap<String, ContainerStatus>,
    volume_refs: HashMap<String, usize>,
    volume_removal: HashMap<String, bool>,
}

impl PodModel {
    pub fn new(spec: PodSpec) -> VmResult<Self> {
        spec.validate()?;
        let mut model = Self {
            spec,
            containers: HashMap::new(),
            volume_refs: HashMap::new(),
            volume_removal: HashMap::new(),
        };
        for v in &model.spec.volumes {
            model.volume_refs.insert(v.name.clone(), 0);
            model.volume_removal.insert(v.name.clone(), false);
        }
        let ids: Vec<String> = model.spec.containers.iter().map(|c| c.id.clone()).collect();
        for id in ids {
            model.containers.insert(id.clone(), ContainerStatus::new());
            model.ref_container_volumes(&id, 1);
        }
        Ok(model)
    }

    fn ref_container_volumes(&mut self, container_id: &str, delta: isize) {
        let mounts: Vec<String> = self
            .spec
            .container(container_id)
            .map(|c| c.mounts.iter().map(|m| m.volume.clone()).collect())
            .unwrap_or_default();
        for volume in mounts {
            let count = self.volume_refs.entry(volume).or_insert(0);
            *count = count.saturating_add_signed(delta);
        }
    }

    pub fn container_state(&self, id: &str) -> Option<ContainerState> {
        self.containers.get(id).map(|s| s.state)
    }

    pub fn set_container_state(&mut self, id: &str, state: ContainerState) -> VmResult<()> {
        let status = self
            .containers
            .get_mut(id)
            .ok_or_else(|| VmError::BadRequest(format!("unknown container {}", truncate_id(id))))?;
        status.transition_to(state)
    }

    /// Register a container added at runtime. Mount references are counted
    /// against their volumes.
    pub fn add_container(&mut self, desc: ContainerDescription) -> VmResult<()> {
        if self.containers.contains_key(&desc.id) {
            return Err(VmError::BadRequest(format!(
                "duplicate container {}",
                truncate_id(&desc.id)
            )));
        }
        for m in &desc.mounts {
            if self.spec.volume(&m.volume).is_none() {
                return Err(VmError::BadRequest(format!(
                    "container {} mounts unknown volume {}",
                    truncate_id(&desc.id),
                    m.volume
                )));
            }
        }
        let id = desc.id.clone();
        self.spec.containers.push(desc);
        self.containers.insert(id.clone(), ContainerStatus::new());
        self.ref_container_volumes(&id, 1);
        Ok(())
    }

    /// Drop a container and release its volume references. Returns the
    /// names of volumes whose removal was requested and whose refcount just
    /// reached zero; those are ready to be destroyed.
    pub fn remove_container(&mut self, id: &str) -> VmResult<Vec<String>> {
        if self.containers.remove(id).is_none() {
            return Err(VmError::BadRequest(format!(
                "unknown container {}",
                truncate_id(id)
            )));
        }
        self.ref_container_volumes(id, -1);
        let released: Vec<String> = self
            .spec
            .container(id)
            .map(|c| c.mounts.iter().map(|m| m.volume.clone()).collect())
            .unwrap_or_default();
        self.spec.containers.retain(|c| c.id != id);

        Ok(released
            .into_iter()
            .filter(|v| {
                self.volume_refs.get(v).copied().unwrap_or(0) == 0
                    && self.volume_removal.get(v).copied().unwrap_or(false)
            })
            .collect())
    }

    pub fn add_volume(&mut self, desc: VolumeDescription) -> VmResult<()> {
        if self.spec.volume(&desc.name).is_some() {
            return Err(VmError::BadRequest(format!(
                "duplicate volume {}",
                desc.name
            )));
        }
        self.volume_refs.insert(desc.name.clone(), 0);
        self.volume_removal.insert(desc.name.clone(), false);
        self.spec.volumes.push(desc);
        Ok(())
    }

    /// Request volume removal. Returns true when the volume can be
    /// destroyed right away (no container references it).
    pub fn request_volume_removal(&mut self, name: &str) -> VmResult<bool> {
        if self.spec.volume(name).is_none() {
            return Err(VmError::BadRequest(format!("unknown volume {}", name)));
        }
        self.volume_removal.insert(name.to_string(), true);
        Ok(self.volume_refs.get(name).copied().unwrap_or(0) == 0)
    }

    pub fn drop_volume(&mut self, name: &str) {
        self.spec.volumes.retain(|v| v.name != name);
        self.volume_refs.remove(name);
        self.volume_removal.remove(name);
    }

    pub fn volume_refcount(&self, name: &str) -> usize {
        self.volume_refs.get(name).copied().unwrap_or(0)
    }

    pub fn add_interface(&mut self, desc: InterfaceDescription) -> VmResult<()> {
        if self.spec.interface(&desc.id).is_some() {
            return Err(VmError::BadRequest(format!(
                "duplicate interface {}",
                desc.id
            )));
        }
        self.spec.interfaces.push(desc);
        Ok(())
    }

    pub fn drop_interface(&mut self, id: &str) {
        self.spec.interfaces.retain(|i| i.id != id);
    }

    /// IP addresses of all non-loopback interfaces, in interface order.
    pub fn ip_addrs(&self) -> Vec<String> {
        let mut interfaces: Vec<&InterfaceDescription> =
            self.spec.interfaces.iter().filter(|i| !i.is_loopback()).collect();
        interfaces.sort_by_key(|i| i.index);
        interfaces
            .into_iter()
            .filter_map(|i| i.ip.clone())
            .collect()
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.spec.containers.iter().map(|c| c.id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind_volume(name: &str) -> VolumeDescription {
        VolumeDescription {
            name: name.to_string(),
            kind: VolumeKind::HostBind {
                source: format!("/tmp/{}", name),
            },
        }
    }

    fn container(id: &str, volumes: &[&str]) -> ContainerDescription {
        ContainerDescription {
            id: id.to_string(),
            name: None,
            image: "busybox".to_string(),
            rootfs: RootfsKind::Dir,
            mounts: volumes
                .iter()
                .map(|v| MountRef {
                    volume: v.to_string(),
                    path: format!("/mnt/{}", v),
                    read_only: false,
                })
                .collect(),
            process: ProcessSpec {
                args: vec!["sh".to_string()],
                ..Default::default()
            },
        }
    }

    fn interface(id: &str, device: &str, index: usize, ip: Option<&str>) -> InterfaceDescription {
        InterfaceDescription {
            id: id.to_string(),
            index,
            device: device.to_string(),
            ip: ip.map(str::to_string),
            mac: None,
            mtu: 1500,
            gateway: None,
            tap_name: None,
        }
    }

    #[test]
    fn test_generate_container_id_shape() {
        let id = generate_container_id();
        assert_eq!(id.len(), CONTAINER_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
        // The truncated form must never be purely numeric.
        assert!(truncate_id(&id).parse::<i64>().is_err());
    }

    #[test]
    fn test_truncate_short_ids() {
        assert_eq!(truncate_id("abc"), "abc");
        assert_eq!(truncate_id("0123456789abcdef"), "0123456789ab");
    }

    #[test]
    fn test_spec_validation_rejects_unknown_volume() {
        let spec = PodSpec {
            id: "pod-1".into(),
            containers: vec![container("c1", &["missing"])],
            ..Default::default()
        };
        assert!(matches!(spec.validate(), Err(VmError::BadRequest(_))));
    }

    #[test]
    fn test_spec_validation_rejects_duplicates() {
        let spec = PodSpec {
            id: "pod-1".into(),
            interfaces: vec![
                interface("net0", "eth0", 1, None),
                interface("net0", "eth1", 2, None),
            ],
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_volume_refcounts_follow_containers() {
        let spec = PodSpec {
            id: "pod-1".into(),
            volumes: vec![bind_volume("v1")],
            containers: vec![container("c1", &["v1"]), container("c2", &["v1"])],
            ..Default::default()
        };
        let mut model = PodModel::new(spec).unwrap();
        assert_eq!(model.volume_refcount("v1"), 2);

        // Removal is deferred while containers still reference the volume.
        assert!(!model.request_volume_removal("v1").unwrap());
        let freed = model.remove_container("c1").unwrap();
        assert!(freed.is_empty());
        let freed = model.remove_container("c2").unwrap();
        assert_eq!(freed, vec!["v1".to_string()]);
    }

    #[test]
    fn test_ip_enumeration_skips_loopback() {
        let spec = PodSpec {
            id: "pod-1".into(),
            interfaces: vec![
                interface("lo", "lo", 0, Some("127.0.0.1/8")),
                interface("net1", "eth1", 2, Some("10.0.0.3/24")),
                interface("net0", "eth0", 1, Some("10.0.0.2/24")),
            ],
            ..Default::default()
        };
        let model = PodModel::new(spec).unwrap();
        assert_eq!(model.ip_addrs(), vec!["10.0.0.2/24", "10.0.0.3/24"]);
    }

    #[test]
    fn test_container_state_machine() {
        let mut status = ContainerStatus::new();
        assert_eq!(status.state, ContainerState::Created);
        status.transition_to(ContainerState::Running).unwrap();
        status.transition_to(ContainerState::Stopped).unwrap();
        assert!(status.transition_to(ContainerState::Running).is_err());
    }

    #[test]
    fn test_runtime_add_remove_container() {
        let spec = PodSpec {
            id: "pod-1".into(),
            volumes: vec![bind_volume("v1")],
            ..Default::default()
        };
        let mut model = PodModel::new(spec).unwrap();

        model.add_container(container("c1", &["v1"])).unwrap();
        assert_eq!(model.volume_refcount("v1"), 1);

        let err = model.add_container(container("c1", &[])).unwrap_err();
        assert!(matches!(err, VmError::BadRequest(_)));

        model.remove_container("c1").unwrap();
        assert_eq!(model.volume_refcount("v1"), 0);
    }
}
