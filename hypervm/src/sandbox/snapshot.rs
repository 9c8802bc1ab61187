//! Sandbox persistence: the associate/dump snapshot and the runtime
//! `state.json` record.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use hypervm_shared::{VmError, VmResult};

use crate::devices::{BlockEntry, InterfaceEntry, ResourceKind, SerialEntry};
use crate::pod::PodSpec;
use crate::vmm::BootConfig;

/// Snapshot format version; bumped on incompatible layout changes.
pub const SNAPSHOT_VERSION: u32 = 2;

/// Device registry contents with slot assignments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub interfaces: Vec<InterfaceEntry>,
    pub blocks: Vec<BlockEntry>,
    pub serials: Vec<SerialEntry>,
    pub insertion_log: Vec<(ResourceKind, String)>,
}

/// Everything `associate` needs to rejoin a running VM without
/// relaunching it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSnapshot {
    pub version: u32,
    pub id: String,
    pub boot: BootConfig,
    pub pod: PodSpec,
    pub devices: DeviceSnapshot,
    pub generation: u64,
    pub paused: bool,
}

impl SandboxSnapshot {
    pub fn serialize(&self) -> VmResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(data: &[u8]) -> VmResult<Self> {
        let snapshot: SandboxSnapshot = serde_json::from_slice(data)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(VmError::BadRequest(format!(
                "snapshot version {} not supported (want {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        Ok(snapshot)
    }
}

/// The `state.json` record under the runtime root. `pid` is -1 when no
/// host-side init child exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Pid")]
    pub pid: i64,
    #[serde(rename = "Root", skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    #[serde(rename = "BundlePath", skip_serializing_if = "Option::is_none")]
    pub bundle_path: Option<String>,
}

impl PersistedState {
    pub const FILE_NAME: &'static str = "state.json";

    pub fn path(root: &Path, id: &str) -> PathBuf {
        root.join(id).join(Self::FILE_NAME)
    }

    pub async fn save(&self, root: &Path) -> VmResult<()> {
        let dir = root.join(&self.id);
        tokio::fs::create_dir_all(&dir).await?;
        let data = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(dir.join(Self::FILE_NAME), data).await?;
        Ok(())
    }

    pub async fn load(root: &Path, id: &str) -> VmResult<Self> {
        let data = tokio::fs::read(Self::path(root, id)).await?;
        Ok(serde_json::from_slice(&data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceStatus;
    use crate::pod::InterfaceDescription;

    fn sample_snapshot() -> SandboxSnapshot {
        SandboxSnapshot {
            version: SNAPSHOT_VERSION,
            id: "vm-roundtrip".into(),
            boot: BootConfig {
                kernel: "/var/lib/hyper/kernel".into(),
                initrd: "/var/lib/hyper/hyper-initrd.img".into(),
                cpu: 2,
                memory: 256,
                ..Default::default()
            },
            pod: PodSpec {
                id: "pod-roundtrip".into(),
                hostname: "sandbox".into(),
                ..Default::default()
            },
            devices: DeviceSnapshot {
                interfaces: vec![InterfaceEntry {
                    desc: InterfaceDescription {
                        id: "net0".into(),
                        index: 1,
                        device: "eth0".into(),
                        ip: Some("10.0.0.2/24".into()),
                        mac: Some("52:54:00:12:34:56".into()),
                        mtu: 1500,
                        gateway: Some("10.0.0.1".into()),
                        tap_name: Some("tap0".into()),
                    },
                    status: DeviceStatus::Inserted,
                    slot: Some(0x05),
                    tap_name: Some("tap0".into()),
                }],
                blocks: Vec::new(),
                serials: Vec::new(),
                insertion_log: vec![(ResourceKind::Interface, "net0".into())],
            },
            generation: 17,
            paused: false,
        }
    }

    #[test]
    fn test_snapshot_round_trip() {
        let snapshot = sample_snapshot();
        let data = snapshot.serialize().unwrap();
        let back = SandboxSnapshot::deserialize(&data).unwrap();

        assert_eq!(back.id, snapshot.id);
        assert_eq!(back.boot, snapshot.boot);
        assert_eq!(back.pod, snapshot.pod);
        assert_eq!(back.generation, 17);
        assert_eq!(back.devices.interfaces.len(), 1);
        assert_eq!(back.devices.interfaces[0].slot, Some(0x05));
        assert_eq!(back.devices.insertion_log, snapshot.devices.insertion_log);
    }

    #[test]
    fn test_snapshot_version_mismatch_rejected() {
        let mut snapshot = sample_snapshot();
        snapshot.version = SNAPSHOT_VERSION + 1;
        let data = serde_json::to_vec(&snapshot).unwrap();
        assert!(SandboxSnapshot::deserialize(&data).is_err());
    }

    #[test]
    fn test_persisted_state_key_names() {
        let state = PersistedState {
            version: "0.2.0".into(),
            id: "c1".into(),
            pid: -1,
            root: Some("/run/hypervm".into()),
            bundle_path: None,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"Version\""));
        assert!(json.contains("\"ID\""));
        assert!(json.contains("\"Pid\":-1"));
        assert!(json.contains("\"Root\""));
        assert!(!json.contains("BundlePath"));
    }

    #[tokio::test]
    async fn test_persisted_state_save_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = PersistedState {
            version: "0.2.0".into(),
            id: "c1".into(),
            pid: 4242,
            root: None,
            bundle_path: Some("/tmp/bundle".into()),
        };
        state.save(dir.path()).await.unwrap();
        let back = PersistedState::load(dir.path(), "c1").await.unwrap();
        assert_eq!(back, state);
    }
}
