//! The sandbox: a per-VM state machine mediating between external callers,
//! a hypervisor driver, and the guest init agent.
//!
//! [`Vm`] is the external handle. Every operation is turned into an event
//! on the sandbox queue; the event loop owns all mutable state. Responses
//! flow back two ways: per-request oneshot results, and the totally ordered
//! response stream consumed through [`fanout::Fanout`] subscribers.

pub mod context;
pub mod events;
pub mod fanout;
pub mod pending;
pub mod response;
pub mod snapshot;
pub mod state;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};

use hypervm_shared::{VmError, VmResult};

use crate::agent::AgentChannel;
use crate::console;
use crate::layout::{BASE_DIR, VmLayout};
use crate::pod::{
    ContainerDescription, InterfaceDescription, PodModel, PodSpec, ProcessSpec,
    SerialPortDescription, VolumeDescription,
};
use crate::vmm::{BootConfig, Driver, PodStats};
use context::VmContext;
use events::{EventHub, OpOutcome, VmEvent};
use fanout::{Fanout, SUBSCRIBER_BUFFER, Subscriber};
use response::VmResponse;
use snapshot::SandboxSnapshot;
use state::SandboxStatus;

/// Depth of the outbound response stream between the loop and the fanout
/// dispatcher.
const RESPONSE_STREAM_DEPTH: usize = 128;

/// Host-side sandbox configuration.
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    /// Root for per-VM state directories.
    pub base_dir: PathBuf,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(BASE_DIR),
        }
    }
}

/// Generate a VM id of the form `vm-xxxxxxxxxx`.
pub fn random_vm_id() -> String {
    const ALPHA: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    let suffix: String = (0..10)
        .map(|_| ALPHA[rng.random_range(0..ALPHA.len())] as char)
        .collect();
    format!("vm-{}", suffix)
}

/// External handle to one sandbox.
///
/// Cheap to clone conceptually but deliberately not `Clone`: callers share
/// it behind their own `Arc` and release subscribers explicitly.
pub struct Vm {
    id: String,
    layout: VmLayout,
    hub: EventHub,
    clients: Fanout,
    status: watch::Receiver<SandboxStatus>,
}

impl Vm {
    /// Launch a new sandbox: create its directories, start the hypervisor,
    /// and run the startup protocol against the frozen `pod` spec.
    ///
    /// Returns once the VM is launching; observe `E_VM_RUNNING` /
    /// `E_POD_RUNNING` on the response stream or call
    /// [`Vm::wait_pod_running`].
    pub async fn launch(
        options: &SandboxOptions,
        driver: Arc<dyn Driver>,
        boot: BootConfig,
        pod: PodSpec,
        vm_id: Option<String>,
    ) -> VmResult<Vm> {
        let id = vm_id.unwrap_or_else(random_vm_id);
        let pod = PodModel::new(pod)?;

        let layout = VmLayout::new(&options.base_dir, &id);
        layout.create().await?;

        let (hub, queue) = EventHub::channel();
        let (response_tx, response_rx) = mpsc::channel(RESPONSE_STREAM_DEPTH);
        let (status_tx, status_rx) = watch::channel(SandboxStatus::Init);

        let context = VmContext::new(
            id.clone(),
            boot.clone(),
            layout.clone(),
            Arc::clone(&driver),
            pod,
            hub.clone(),
            response_tx,
            status_tx,
        );

        if let Err(e) = driver.launch(&boot, &layout, hub.clone()).await {
            let _ = layout.cleanup().await;
            return Err(e);
        }

        // The agent socket comes up once the guest init is running; its
        // READY frame turns into InitConnected on the queue.
        {
            let hub = hub.clone();
            let sock = layout.hyper_sock();
            tokio::spawn(async move {
                match AgentChannel::connect_unix(&sock, hub.clone()).await {
                    Ok(agent) => {
                        let _ = hub.post(VmEvent::InitConnected { agent });
                    }
                    Err(e) => {
                        let _ = hub.post(VmEvent::VmStartFailed {
                            message: format!("agent transport: {}", e),
                        });
                    }
                }
            });
        }

        tokio::spawn(context.run(queue));

        Ok(Vm {
            id,
            layout,
            hub,
            clients: Fanout::start(response_rx, SUBSCRIBER_BUFFER),
            status: status_rx,
        })
    }

    /// Reconstruct a sandbox around an already-running VM from a snapshot
    /// produced by [`Vm::dump`]. The VM is not relaunched; the agent socket
    /// is reopened and the guest rejoined.
    pub async fn associate(
        options: &SandboxOptions,
        driver: Arc<dyn Driver>,
        data: &[u8],
    ) -> VmResult<Vm> {
        let snapshot = SandboxSnapshot::deserialize(data)?;
        let id = snapshot.id.clone();
        let pod = PodModel::new(snapshot.pod.clone())?;
        let layout = VmLayout::new(&options.base_dir, &id);

        let (hub, queue) = EventHub::channel();
        let (response_tx, response_rx) = mpsc::channel(RESPONSE_STREAM_DEPTH);
        let (status_tx, status_rx) = watch::channel(SandboxStatus::Init);

        let context = VmContext::new(
            id.clone(),
            snapshot.boot.clone(),
            layout.clone(),
            Arc::clone(&driver),
            pod,
            hub.clone(),
            response_tx,
            status_tx,
        )
        .restore(&snapshot);

        driver.associate(&layout, hub.clone()).await?;

        // Rejoin the control stream. The guest sent READY to the previous
        // supervisor, so no handshake here.
        {
            let hub = hub.clone();
            let sock = layout.hyper_sock();
            tokio::spawn(async move {
                match tokio::net::UnixStream::connect(&sock).await {
                    Ok(stream) => {
                        let agent = AgentChannel::resume(stream, hub.clone());
                        let _ = hub.post(VmEvent::InitConnected { agent });
                    }
                    Err(e) => {
                        let _ = hub.post(VmEvent::InitFail {
                            cause: format!("reopening agent socket: {}", e),
                        });
                    }
                }
            });
        }

        tokio::spawn(context.run(queue));

        Ok(Vm {
            id,
            layout,
            hub,
            clients: Fanout::start(response_rx, SUBSCRIBER_BUFFER),
            status: status_rx,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> SandboxStatus {
        *self.status.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.status().is_running()
    }

    /// Forward the VM console to the log sink, via the external log daemon
    /// when one is available.
    pub fn watch_console(&self) {
        console::spawn_console_watcher(self.id.clone(), self.layout.clone());
    }

    /// Subscribe to responses emitted from now on.
    pub fn responses(&self) -> Subscriber {
        self.clients.acquire()
    }

    pub fn release_responses(&self, subscriber: Subscriber) {
        self.clients.release(subscriber)
    }

    /// Non-blocking event submission. Fails when the queue is closed or
    /// saturated.
    pub fn submit(&self, event: VmEvent) -> VmResult<()> {
        self.hub.post(event)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(events::ResultSink<T>) -> VmEvent,
    ) -> VmResult<T> {
        let (tx, rx) = oneshot::channel();
        self.hub.post(build(tx))?;
        rx.await
            .map_err(|_| VmError::Interrupted("sandbox terminated".to_string()))?
    }

    /// Wait for a response matching `matcher`. `None` waits forever.
    pub async fn wait_response(
        &self,
        mut matcher: impl FnMut(&VmResponse) -> bool,
        timeout: Option<Duration>,
    ) -> VmResult<VmResponse> {
        let mut subscriber = self.responses();
        let wait = async {
            while let Some(response) = subscriber.recv().await {
                if matcher(&response) {
                    return Ok(response);
                }
            }
            Err(VmError::Interrupted("response stream closed".to_string()))
        };
        let result = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait)
                .await
                .unwrap_or_else(|_| Err(VmError::Timeout("waiting for response".to_string()))),
            None => wait.await,
        };
        result
    }

    /// Block until the pod reports running, or fail on the terminal error.
    pub async fn wait_pod_running(&self, timeout: Option<Duration>) -> VmResult<()> {
        let response = self
            .wait_response(
                |r| {
                    matches!(
                        r.code,
                        response::ResponseCode::PodRunning
                            | response::ResponseCode::Failed
                            | response::ResponseCode::VmShutdown
                    )
                },
                timeout,
            )
            .await?;
        match response.code {
            response::ResponseCode::PodRunning => Ok(()),
            _ => Err(VmError::DriverFail(response.cause)),
        }
    }

    // ------------------------------------------------------------------
    // Structural operations
    // ------------------------------------------------------------------

    pub async fn add_container(&self, desc: ContainerDescription) -> VmResult<OpOutcome> {
        self.request(|sink| VmEvent::AddContainer { desc, sink }).await
    }

    pub async fn remove_container(&self, id: &str) -> VmResult<OpOutcome> {
        let id = id.to_string();
        self.request(|sink| VmEvent::RemoveContainer { id, sink }).await
    }

    pub async fn add_volume(&self, desc: VolumeDescription) -> VmResult<OpOutcome> {
        self.request(|sink| VmEvent::AddVolume { desc, sink }).await
    }

    pub async fn remove_volume(&self, name: &str) -> VmResult<OpOutcome> {
        let name = name.to_string();
        self.request(|sink| VmEvent::RemoveVolume { name, sink }).await
    }

    pub async fn add_interface(&self, desc: InterfaceDescription) -> VmResult<OpOutcome> {
        self.request(|sink| VmEvent::AddInterface { desc, sink }).await
    }

    pub async fn remove_interface(&self, id: &str) -> VmResult<OpOutcome> {
        let id = id.to_string();
        self.request(|sink| VmEvent::RemoveInterface { id, sink }).await
    }

    pub async fn add_serial(&self, desc: SerialPortDescription) -> VmResult<OpOutcome> {
        self.request(|sink| VmEvent::AddSerial { desc, sink }).await
    }

    pub async fn remove_serial(&self, id: &str) -> VmResult<OpOutcome> {
        let id = id.to_string();
        self.request(|sink| VmEvent::RemoveSerial { id, sink }).await
    }

    /// Start a registered container inside the guest.
    pub async fn new_container(&self, id: &str) -> VmResult<OpOutcome> {
        let id = id.to_string();
        self.request(|sink| VmEvent::NewContainer { id, sink }).await
    }

    // ------------------------------------------------------------------
    // Pod operations
    // ------------------------------------------------------------------

    pub async fn stop_pod(&self) -> VmResult<OpOutcome> {
        self.request(|sink| VmEvent::StopPod { sink }).await
    }

    pub async fn get_pod(&self) -> VmResult<serde_json::Value> {
        self.request(|sink| VmEvent::GetPod { sink }).await
    }

    /// IP addresses of the pod's non-loopback interfaces.
    pub async fn get_ip_addrs(&self) -> VmResult<Vec<String>> {
        self.request(|sink| VmEvent::GetPodIp { sink }).await
    }

    pub async fn stats(&self) -> VmResult<PodStats> {
        self.request(|sink| VmEvent::Stats { sink }).await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Freeze (`true`) or thaw (`false`) the sandbox. Idempotent.
    pub async fn pause(&self, pause: bool) -> VmResult<OpOutcome> {
        self.request(|sink| VmEvent::Pause { pause, sink }).await
    }

    /// Save a paused VM to `path`. Rejected `NotReady` unless paused.
    pub async fn save(&self, path: impl Into<PathBuf>) -> VmResult<OpOutcome> {
        let path = path.into();
        self.request(|sink| VmEvent::Save { path, sink }).await
    }

    /// Graceful teardown: destroy the pod, eject devices, stop the
    /// hypervisor, remove directories. Idempotent once terminated.
    pub async fn shutdown(&self) -> VmResult<OpOutcome> {
        self.request(|sink| VmEvent::Shutdown { sink }).await
    }

    /// Force-kill the hypervisor and clean up. Idempotent once terminated.
    pub async fn kill(&self) -> VmResult<OpOutcome> {
        self.request(|sink| VmEvent::Kill { sink }).await
    }

    /// Detach from the VM without stopping it; `associate` can rejoin.
    pub async fn release(&self) -> VmResult<OpOutcome> {
        self.request(|sink| VmEvent::Release { sink }).await
    }

    // ------------------------------------------------------------------
    // Guest operations
    // ------------------------------------------------------------------

    pub async fn exec(&self, container: &str, process: ProcessSpec) -> VmResult<OpOutcome> {
        let container = container.to_string();
        self.request(|sink| VmEvent::Exec { container, process, sink })
            .await
    }

    pub async fn kill_container(&self, container: &str, signal: i32) -> VmResult<OpOutcome> {
        let container = container.to_string();
        self.request(|sink| VmEvent::KillContainer { container, signal, sink })
            .await
    }

    /// Resize the tty of `process` inside `container`. An empty process
    /// targets the container init.
    pub async fn tty_resize(
        &self,
        container: &str,
        process: &str,
        row: u16,
        column: u16,
    ) -> VmResult<OpOutcome> {
        let container = container.to_string();
        let process = if process.is_empty() {
            "init".to_string()
        } else {
            process.to_string()
        };
        self.request(|sink| VmEvent::WinSize {
            container,
            process,
            row,
            column,
            sink,
        })
        .await
    }

    pub async fn write_file(&self, container: &str, path: &str, data: &[u8]) -> VmResult<OpOutcome> {
        let container = container.to_string();
        let path = path.to_string();
        let data = data.to_vec();
        self.request(|sink| VmEvent::WriteFile {
            container,
            path,
            data,
            sink,
        })
        .await
    }

    pub async fn read_file(&self, container: &str, path: &str) -> VmResult<Vec<u8>> {
        let container = container.to_string();
        let path = path.to_string();
        self.request(|sink| VmEvent::ReadFile { container, path, sink })
            .await
    }

    // ------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------

    /// Grow the vcpu count. A target at or below the current allocation is
    /// a no-op.
    pub async fn set_cpus(&self, cpus: u32) -> VmResult<OpOutcome> {
        self.request(|sink| VmEvent::SetCpus { cpus, sink }).await
    }

    /// Grow memory to `size_mb` total. A target at or below the current
    /// allocation is a no-op.
    pub async fn add_mem(&self, size_mb: u32) -> VmResult<OpOutcome> {
        self.request(|sink| VmEvent::AddMem { size_mb, sink }).await
    }

    /// Serialize the sandbox for a later [`Vm::associate`]. Round-trips.
    pub async fn dump(&self) -> VmResult<Vec<u8>> {
        let snapshot = self.request(|sink| VmEvent::Dump { sink }).await?;
        snapshot.serialize()
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

/// Paths of a sandbox base directory, re-exported for collaborators.
pub fn vm_layout(options: &SandboxOptions, vm_id: &str) -> VmLayout {
    VmLayout::new(Path::new(&options.base_dir), vm_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_vm_id_shape() {
        let id = random_vm_id();
        assert!(id.starts_with("vm-"));
        assert_eq!(id.len(), 13);
        assert!(id[3..].chars().all(|c| c.is_ascii_lowercase()));
        assert_ne!(random_vm_id(), random_vm_id());
    }

    #[test]
    fn test_default_options_use_base_dir() {
        let options = SandboxOptions::default();
        assert_eq!(options.base_dir, PathBuf::from("/var/run/hyper"));
        let layout = vm_layout(&options, "vm-abc");
        assert_eq!(
            layout.hyper_sock(),
            PathBuf::from("/var/run/hyper/vm-abc/hyper.sock")
        );
    }
}
