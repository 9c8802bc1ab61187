//! Per-VM filesystem layout.
//!
//! Every sandbox owns `<base_dir>/<vm_id>/` exclusively: the agent and
//! console sockets live at its root, container rootfs binds live under the
//! exported share directory.

use std::path::{Path, PathBuf};

use hypervm_shared::VmResult;

/// Default root for per-VM state.
pub const BASE_DIR: &str = "/var/run/hyper";
/// Agent control stream socket name.
pub const HYPER_SOCK: &str = "hyper.sock";
/// Multiplexed container stdio socket name.
pub const TTY_SOCK: &str = "tty.sock";
/// Raw console socket name.
pub const CONSOLE_SOCK: &str = "console.sock";
/// Host directory exported to the guest, and its in-guest tag.
pub const SHARE_DIR_TAG: &str = "share_dir";

/// First hypervisor bus slot handed out to hotplugged devices.
pub const PCI_ADDR_FROM: u32 = 0x05;

/// Filesystem layout of a single sandbox.
#[derive(Debug, Clone)]
pub struct VmLayout {
    root: PathBuf,
}

impl VmLayout {
    pub fn new(base_dir: &Path, vm_id: &str) -> Self {
        Self {
            root: base_dir.join(vm_id),
        }
    }

    /// `<base_dir>/<vm_id>/`
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn hyper_sock(&self) -> PathBuf {
        self.root.join(HYPER_SOCK)
    }

    pub fn tty_sock(&self) -> PathBuf {
        self.root.join(TTY_SOCK)
    }

    pub fn console_sock(&self) -> PathBuf {
        self.root.join(CONSOLE_SOCK)
    }

    /// Host side of the directory exported to the guest.
    pub fn share_dir(&self) -> PathBuf {
        self.root.join(SHARE_DIR_TAG)
    }

    /// Host-side bind target for a volume inside the share directory.
    pub fn volume_dir(&self, volume: &str) -> PathBuf {
        self.share_dir().join(volume)
    }

    /// `share_dir/<containerId>/rootfs/` as exposed to the guest.
    pub fn container_rootfs(&self, container_id: &str) -> PathBuf {
        self.share_dir().join(container_id).join("rootfs")
    }

    /// Create the VM directory and the exported share directory.
    pub async fn create(&self) -> VmResult<()> {
        tokio::fs::create_dir_all(self.share_dir()).await?;
        Ok(())
    }

    /// Remove the whole per-VM directory tree.
    pub async fn cleanup(&self) -> VmResult<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths_are_rooted_under_vm_dir() {
        let layout = VmLayout::new(Path::new("/var/run/hyper"), "vm-abc");
        assert_eq!(
            layout.hyper_sock(),
            PathBuf::from("/var/run/hyper/vm-abc/hyper.sock")
        );
        assert_eq!(
            layout.console_sock(),
            PathBuf::from("/var/run/hyper/vm-abc/console.sock")
        );
        assert_eq!(
            layout.container_rootfs("c1"),
            PathBuf::from("/var/run/hyper/vm-abc/share_dir/c1/rootfs")
        );
    }

    #[tokio::test]
    async fn test_create_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let layout = VmLayout::new(dir.path(), "vm-test");

        layout.create().await.unwrap();
        assert!(layout.share_dir().is_dir());

        layout.cleanup().await.unwrap();
        assert!(!layout.root().exists());

        // Cleaning an already removed tree is not an error.
        layout.cleanup().await.unwrap();
    }
}
