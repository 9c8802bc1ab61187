//! The per-sandbox event loop.
//!
//! One task owns all mutable sandbox state: the pod model, the device
//! registry, the pending-op table, the driver handle, and the agent
//! channel. Every structural change flows through the queue, so no lock
//! guards the model. The loop suspends only on the queue itself or on a
//! single driver/agent round-trip.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use hypervm_shared::{VmError, VmResult};

use crate::agent::{AgentChannel, KEEPALIVE_INTERVAL, NewContainerMessage, StartPodMessage};
use crate::devices::{DeviceRegistry, DeviceStatus, ResourceKind};
use crate::layout::{SHARE_DIR_TAG, VmLayout};
use crate::pod::{
    ContainerDescription, ContainerState, InterfaceDescription, PodModel, RootfsKind,
    SerialPortDescription, VolumeDescription, VolumeKind, truncate_id,
};
use crate::sandbox::events::{EventHub, OpOutcome, ResultSink, VmEvent};
use crate::sandbox::pending::{OpDirection, PendingOps};
use crate::sandbox::response::{Reporter, VmResponse};
use crate::sandbox::snapshot::{DeviceSnapshot, SNAPSHOT_VERSION, SandboxSnapshot};
use crate::sandbox::state::{SandboxState, SandboxStatus};
use crate::vmm::{BlockDescription, BootConfig, Driver, NetworkSettings};

/// Teardown progress while the sandbox is `Cleaning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanupPhase {
    /// Graceful shutdown sent INIT_DESTROYPOD; waiting for FINISHPOD.
    WaitPodFinish,
    /// Ejecting devices in reverse insertion order.
    Ejecting,
    /// Hypervisor asked to quit or die; waiting for the watchdog.
    WaitVmExit,
}

struct CleanupPlan {
    phase: CleanupPhase,
    pending_ejects: HashSet<(ResourceKind, String)>,
    graceful: bool,
}

/// The device plan driven during `Starting`.
///
/// Devices are inserted one at a time in plan order; each completion event
/// dispatches the next. Sequencing keeps failure recovery exact: everything
/// before the failing device is confirmed and will be ejected in reverse.
struct StartupPlan {
    queue: std::collections::VecDeque<StartupItem>,
    current: Option<(ResourceKind, String)>,
}

enum StartupItem {
    Volume(VolumeDescription),
    Interface(InterfaceDescription),
}

pub(crate) struct VmContext {
    id: String,
    boot: BootConfig,
    layout: VmLayout,
    driver: Arc<dyn Driver>,
    pod: PodModel,
    registry: DeviceRegistry,
    pending: PendingOps,
    agent: Option<Arc<AgentChannel>>,
    state: SandboxState,
    paused: bool,
    reporter: Reporter,
    hub: EventHub,
    status_tx: watch::Sender<SandboxStatus>,
    nic_settings: HashMap<String, NetworkSettings>,
    /// Devices still outstanding before the pod can be declared running.
    startup: Option<StartupPlan>,
    cleanup: Option<CleanupPlan>,
    shutdown_waiters: Vec<ResultSink<OpOutcome>>,
    terminal_fault: Option<String>,
    vm_dead: bool,
    /// Rejoined an existing VM; suppress the startup protocol.
    associated: bool,
    /// Released sandboxes keep their VM and directories alive.
    keep_dirs: bool,
}

impl VmContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        boot: BootConfig,
        layout: VmLayout,
        driver: Arc<dyn Driver>,
        pod: PodModel,
        hub: EventHub,
        client: mpsc::Sender<VmResponse>,
        status_tx: watch::Sender<SandboxStatus>,
    ) -> Self {
        let reporter = Reporter::new(id.clone(), client);
        let registry = DeviceRegistry::with_base(driver.pci_base());
        Self {
            id,
            boot,
            layout,
            driver,
            pod,
            registry,
            pending: PendingOps::new(),
            agent: None,
            state: SandboxState::new(),
            paused: false,
            reporter,
            hub,
            status_tx,
            nic_settings: HashMap::new(),
            startup: None,
            cleanup: None,
            shutdown_waiters: Vec::new(),
            terminal_fault: None,
            vm_dead: false,
            associated: false,
            keep_dirs: false,
        }
    }

    /// Rebuild a context around an already-running VM.
    pub(crate) fn restore(mut self, snapshot: &SandboxSnapshot) -> Self {
        let (interfaces, blocks, serials) = (
            snapshot.devices.interfaces.clone(),
            snapshot.devices.blocks.clone(),
            snapshot.devices.serials.clone(),
        );
        self.registry = DeviceRegistry::restore(
            interfaces,
            blocks,
            serials,
            snapshot.devices.insertion_log.clone(),
        );
        self.reporter.restore_generation(snapshot.generation);
        self.paused = snapshot.paused;
        let status = if snapshot.paused {
            SandboxStatus::Paused
        } else {
            SandboxStatus::Running
        };
        self.state = SandboxState::restored(status);
        let _ = self.status_tx.send(status);
        self.associated = true;
        self
    }

    fn set_status(&mut self, status: SandboxStatus) -> VmResult<()> {
        self.state.transition_to(status)?;
        let _ = self.status_tx.send(status);
        Ok(())
    }

    fn status(&self) -> SandboxStatus {
        self.state.status()
    }

    pub(crate) async fn run(mut self, mut queue: mpsc::Receiver<VmEvent>) {
        if !self.associated {
            let _ = self.set_status(SandboxStatus::Starting);
        }

        // Terminated sandboxes keep answering until the last handle is
        // gone; shutdown and kill stay idempotent.
        while let Some(event) = queue.recv().await {
            tracing::trace!(vm_id = %self.id, event = event.kind(), state = %self.status(), "handling event");
            self.handle(event).await;
        }

        if !self.status().is_terminal() {
            // Queue closed from outside: treat as an interrupt.
            self.pending.interrupt_all("sandbox queue closed");
            if let Some(agent) = self.agent.take() {
                agent.close();
            }
        }
        tracing::debug!(vm_id = %self.id, "event loop exited");
    }

    async fn handle(&mut self, event: VmEvent) {
        if self.status().is_terminal() {
            self.handle_after_terminated(event);
            return;
        }

        match event {
            // ----- VM lifecycle -------------------------------------------------
            VmEvent::VmStartFailed { message } => {
                self.vm_dead = true;
                self.enter_cleaning(Some(format!("VM start failed: {}", message)), false)
                    .await;
            }
            VmEvent::VmExit => self.handle_vm_gone("VM exited").await,
            VmEvent::VmKilled { success } => {
                if !success {
                    tracing::warn!(vm_id = %self.id, "kill reported failure; treating VM as gone");
                }
                self.handle_vm_gone("VM killed").await;
            }
            VmEvent::VmTimeout => {
                self.enter_cleaning(Some("guest agent stopped responding".to_string()), false)
                    .await;
            }
            VmEvent::InitFail { cause } => {
                match self.cleanup.as_ref().map(|plan| plan.phase) {
                    // Agent died while we were shutting down; skip straight
                    // to device teardown.
                    Some(CleanupPhase::WaitPodFinish) => self.begin_ejects().await,
                    Some(_) => {}
                    None => {
                        self.enter_cleaning(Some(format!("agent failure: {}", cause)), false)
                            .await;
                    }
                }
            }
            VmEvent::DriverFault { cause } => {
                self.enter_cleaning(Some(format!("driver failure: {}", cause)), false)
                    .await;
            }
            VmEvent::InitConnected { agent } => self.handle_init_connected(agent).await,
            VmEvent::PodFinished { results } => {
                self.reporter.pod_finished(results);
                for id in self.pod.container_ids() {
                    if self.pod.container_state(&id) == Some(ContainerState::Running) {
                        let _ = self.pod.set_container_state(&id, ContainerState::Stopped);
                    }
                }
                if self
                    .cleanup
                    .as_ref()
                    .is_some_and(|plan| plan.phase == CleanupPhase::WaitPodFinish)
                {
                    self.begin_ejects().await;
                }
            }

            // ----- structural commands ------------------------------------------
            VmEvent::AddContainer { desc, sink } => self.handle_add_container(desc, sink),
            VmEvent::RemoveContainer { id, sink } => self.handle_remove_container(id, sink).await,
            VmEvent::AddVolume { desc, sink } => self.handle_add_volume(desc, sink).await,
            VmEvent::RemoveVolume { name, sink } => self.handle_remove_volume(name, sink).await,
            VmEvent::AddInterface { desc, sink } => self.handle_add_interface(desc, sink).await,
            VmEvent::RemoveInterface { id, sink } => self.handle_remove_interface(id, sink).await,
            VmEvent::AddSerial { desc, sink } => self.handle_add_serial(desc, sink).await,
            VmEvent::RemoveSerial { id, sink } => self.handle_remove_serial(id, sink).await,

            // ----- device completions -------------------------------------------
            VmEvent::VolumeAdded { name } => {
                self.handle_insert_done(ResourceKind::Volume, &name).await;
            }
            VmEvent::VolumeRemoved { name } => {
                self.pod.drop_volume(&name);
                self.handle_eject_done(ResourceKind::Volume, &name).await;
            }
            VmEvent::BlockInserted { id, slot, device } => {
                if self.cleanup.is_some() {
                    self.registry.drop_block(&id);
                    return;
                }
                if let Err(e) = self.registry.confirm_block(&id, slot, device) {
                    tracing::warn!(vm_id = %self.id, block = %id, "stray block insertion: {}", e);
                    return;
                }
                self.handle_insert_done(ResourceKind::Volume, &id).await;
            }
            VmEvent::BlockEjected { id } => {
                self.registry.drop_block(&id);
                self.pod.drop_volume(&id);
                self.handle_eject_done(ResourceKind::Volume, &id).await;
            }
            VmEvent::InterfaceInserted { id, slot, tap_name } => {
                self.handle_interface_inserted(id, slot, tap_name).await;
            }
            VmEvent::InterfaceEjected { id } => {
                if let Some(entry) = self.registry.drop_interface(&id)
                    && let Some(settings) = self.nic_settings.remove(&entry.desc.id)
                {
                    let driver = Arc::clone(&self.driver);
                    let vm_id = self.id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = driver.release_network(&vm_id, &settings).await {
                            tracing::warn!(vm_id = %vm_id, "release network failed: {}", e);
                        }
                    });
                }
                self.pod.drop_interface(&id);
                self.handle_eject_done(ResourceKind::Interface, &id).await;
            }
            VmEvent::TtyOpen { id, slot } => {
                if self.cleanup.is_some() {
                    self.registry.drop_serial(&id);
                    return;
                }
                if let Err(e) = self.registry.confirm_serial(&id, slot) {
                    tracing::warn!(vm_id = %self.id, serial = %id, "stray serial insertion: {}", e);
                    return;
                }
                self.handle_insert_done(ResourceKind::Serial, &id).await;
            }
            VmEvent::TtyClose { id } => {
                self.registry.drop_serial(&id);
                self.handle_eject_done(ResourceKind::Serial, &id).await;
            }
            VmEvent::DevSkip { kind, id } => {
                self.pending.complete(kind, &id, Ok(OpOutcome::Skipped));
                self.startup_mark_done(kind, &id).await;
            }
            VmEvent::DeviceFailed { kind, id, cause }
            | VmEvent::DeviceSetupFailed { kind, id, cause } => {
                self.handle_device_failed(kind, id, cause).await;
            }

            // ----- inline commands ----------------------------------------------
            VmEvent::NewContainer { id, sink } => self.handle_new_container(id, sink).await,
            VmEvent::StopPod { sink } => self.handle_stop_pod(sink).await,
            VmEvent::GetPodIp { sink } => {
                if !self.status().is_running() {
                    complete(sink, Err(self.not_ready("get pod ip")));
                    return;
                }
                let ips = self.pod.ip_addrs();
                self.reporter.pod_ip(ips.clone());
                complete(sink, Ok(ips));
            }
            VmEvent::GetPod { sink } => {
                let result = match self.running_agent("get pod") {
                    Ok(agent) => agent.get_pod().await,
                    Err(e) => Err(e),
                };
                complete(sink, result);
            }
            VmEvent::Stats { sink } => {
                if !self.status().is_running() && !self.paused {
                    complete(sink, Err(self.not_ready("stats")));
                    return;
                }
                match self.driver.stats().await {
                    Ok(stats) => {
                        self.reporter.pod_stats(stats.clone());
                        complete(sink, Ok(stats));
                    }
                    Err(e) => complete(sink, Err(e)),
                }
            }
            VmEvent::Pause { pause, sink } => self.handle_pause(pause, sink).await,
            VmEvent::Save { path, sink } => self.handle_save(path, sink).await,
            VmEvent::Shutdown { sink } => self.handle_shutdown(sink).await,
            VmEvent::Kill { sink } => self.handle_kill(sink).await,
            VmEvent::Release { sink } => self.handle_release(sink).await,
            VmEvent::Exec { container, process, sink } => {
                let result = match self.running_agent("exec") {
                    Ok(agent) => agent.exec_cmd(&container, &process).await.map(|_| OpOutcome::Done),
                    Err(e) => Err(e),
                };
                complete(sink, result);
            }
            VmEvent::KillContainer { container, signal, sink } => {
                let result = match self.running_agent("kill container") {
                    Ok(agent) => agent
                        .kill_container(&container, signal)
                        .await
                        .map(|_| OpOutcome::Done),
                    Err(e) => Err(e),
                };
                if result.is_ok() {
                    let _ = self.pod.set_container_state(&container, ContainerState::Stopped);
                }
                complete(sink, result);
            }
            VmEvent::WinSize { container, process, row, column, sink } => {
                let result = match self.running_agent("window size") {
                    Ok(agent) => agent
                        .winsize(&container, &process, row, column)
                        .await
                        .map(|_| OpOutcome::Done),
                    Err(e) => Err(e),
                };
                complete(sink, result);
            }
            VmEvent::WriteFile { container, path, data, sink } => {
                let result = match self.running_agent("write file") {
                    Ok(agent) => agent
                        .write_file(&container, &path, &data)
                        .await
                        .map(|_| OpOutcome::Done),
                    Err(e) => Err(e),
                };
                complete(sink, result);
            }
            VmEvent::ReadFile { container, path, sink } => {
                let result = match self.running_agent("read file") {
                    Ok(agent) => agent.read_file(&container, &path).await,
                    Err(e) => Err(e),
                };
                complete(sink, result);
            }
            VmEvent::SetCpus { cpus, sink } => {
                let result = self.handle_set_cpus(cpus).await;
                complete(sink, result);
            }
            VmEvent::AddMem { size_mb, sink } => {
                let result = self.handle_add_mem(size_mb).await;
                complete(sink, result);
            }
            VmEvent::Dump { sink } => {
                let snapshot = self.dump();
                complete(sink, Ok(snapshot));
            }
        }
    }

    fn handle_after_terminated(&mut self, event: VmEvent) {
        match event {
            // Shutdown and kill are idempotent once terminated.
            VmEvent::Shutdown { sink } | VmEvent::Kill { sink } => {
                complete(sink, Ok(OpOutcome::Skipped));
            }
            VmEvent::AddContainer { sink, .. }
            | VmEvent::RemoveContainer { sink, .. }
            | VmEvent::AddVolume { sink, .. }
            | VmEvent::RemoveVolume { sink, .. }
            | VmEvent::AddInterface { sink, .. }
            | VmEvent::RemoveInterface { sink, .. }
            | VmEvent::AddSerial { sink, .. }
            | VmEvent::RemoveSerial { sink, .. }
            | VmEvent::NewContainer { sink, .. }
            | VmEvent::StopPod { sink }
            | VmEvent::Pause { sink, .. }
            | VmEvent::Save { sink, .. }
            | VmEvent::Release { sink }
            | VmEvent::Exec { sink, .. }
            | VmEvent::KillContainer { sink, .. }
            | VmEvent::WinSize { sink, .. }
            | VmEvent::WriteFile { sink, .. }
            | VmEvent::SetCpus { sink, .. }
            | VmEvent::AddMem { sink, .. } => {
                complete(sink, Err(VmError::NotReady("sandbox terminated".to_string())));
            }
            VmEvent::GetPodIp { sink } => {
                complete(sink, Err(VmError::NotReady("sandbox terminated".to_string())));
            }
            VmEvent::GetPod { sink } => {
                complete(sink, Err(VmError::NotReady("sandbox terminated".to_string())));
            }
            VmEvent::Stats { sink } => {
                complete(sink, Err(VmError::NotReady("sandbox terminated".to_string())));
            }
            VmEvent::ReadFile { sink, .. } => {
                complete(sink, Err(VmError::NotReady("sandbox terminated".to_string())));
            }
            VmEvent::Dump { sink } => {
                complete(sink, Err(VmError::NotReady("sandbox terminated".to_string())));
            }
            other => {
                tracing::debug!(vm_id = %self.id, event = other.kind(), "event after termination ignored");
            }
        }
    }

    // ---------------------------------------------------------------------
    // Startup
    // ---------------------------------------------------------------------

    async fn handle_init_connected(&mut self, agent: Arc<AgentChannel>) {
        match self.status() {
            SandboxStatus::Starting => {
                agent.start_keepalive(KEEPALIVE_INTERVAL, self.hub.clone());
                self.agent = Some(agent);
                self.reporter.vm_running();
                self.start_pod().await;
            }
            SandboxStatus::Running | SandboxStatus::Paused if self.associated => {
                agent.start_keepalive(KEEPALIVE_INTERVAL, self.hub.clone());
                self.agent = Some(agent);
                tracing::info!(vm_id = %self.id, "rejoined running guest");
            }
            state => {
                self.reporter.unexpected("INIT_CONNECTED", state.as_str());
            }
        }
    }

    async fn start_pod(&mut self) {
        let agent = match self.agent.as_ref() {
            Some(agent) => Arc::clone(agent),
            None => return,
        };

        let message = StartPodMessage {
            id: self.pod.spec.id.clone(),
            hostname: self.pod.spec.hostname.clone(),
            share_dir: SHARE_DIR_TAG.to_string(),
            containers: self.pod.spec.containers.clone(),
        };
        if let Err(e) = agent.start_pod(&message).await {
            self.fail_startup(format!("STARTPOD rejected: {}", e)).await;
            return;
        }

        // Dir and overlay rootfs binds are host-side only.
        for container in self.pod.spec.containers.clone() {
            if !matches!(container.rootfs, RootfsKind::Block { .. }) {
                let dir = self.layout.container_rootfs(&container.id);
                if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                    self.fail_startup(format!(
                        "rootfs for container {}: {}",
                        truncate_id(&container.id),
                        e
                    ))
                    .await;
                    return;
                }
            }
        }

        // Volumes first (containers mount them), then interfaces, one at a
        // time: each completion dispatches the next.
        let mut queue = std::collections::VecDeque::new();
        for volume in self.pod.spec.volumes.clone() {
            queue.push_back(StartupItem::Volume(volume));
        }
        for nic in self.pod.spec.interfaces.clone() {
            if !nic.is_loopback() {
                queue.push_back(StartupItem::Interface(nic));
            }
        }

        self.startup = Some(StartupPlan {
            queue,
            current: None,
        });
        self.startup_dispatch_next().await;
    }

    async fn startup_dispatch_next(&mut self) {
        let item = match self.startup.as_mut() {
            Some(plan) if plan.current.is_none() => plan.queue.pop_front(),
            _ => return,
        };
        let Some(item) = item else {
            self.startup_finish().await;
            return;
        };

        match item {
            StartupItem::Volume(volume) => {
                if let Some(plan) = self.startup.as_mut() {
                    plan.current = Some((ResourceKind::Volume, volume.name.clone()));
                }
                match &volume.kind {
                    VolumeKind::HostBind { .. } | VolumeKind::Filesystem { .. } => {
                        self.spawn_bind_volume(volume.name.clone());
                    }
                    VolumeKind::Block { .. } => {
                        if let Err(e) = self.dispatch_block_insert(&volume).await {
                            self.fail_startup(format!("volume {}: {}", volume.name, e))
                                .await;
                        }
                    }
                }
            }
            StartupItem::Interface(nic) => {
                if let Some(plan) = self.startup.as_mut() {
                    plan.current = Some((ResourceKind::Interface, nic.id.clone()));
                }
                if let Err(e) = self.dispatch_interface_insert(&nic).await {
                    self.fail_startup(format!("interface {}: {}", nic.id, e)).await;
                }
            }
        }
    }

    async fn startup_mark_done(&mut self, kind: ResourceKind, id: &str) {
        let advanced = match self.startup.as_mut() {
            Some(plan) if plan.current.as_ref().is_some_and(|(k, i)| *k == kind && i == id) => {
                plan.current = None;
                true
            }
            _ => false,
        };
        if advanced {
            self.startup_dispatch_next().await;
        }
    }

    async fn startup_finish(&mut self) {
        if self.status() != SandboxStatus::Starting {
            return;
        }
        self.startup = None;

        // All planned devices inserted; start the initial containers.
        for container in self.pod.spec.containers.clone() {
            if let Err(e) = self.send_new_container(&container).await {
                let _ = self
                    .pod
                    .set_container_state(&container.id, ContainerState::Failed);
                self.fail_startup(format!(
                    "container {}: {}",
                    truncate_id(&container.id),
                    e
                ))
                .await;
                return;
            }
            let _ = self
                .pod
                .set_container_state(&container.id, ContainerState::Running);
        }

        if self.set_status(SandboxStatus::Running).is_ok() {
            self.reporter.pod_running();
        }
    }

    async fn send_new_container(&mut self, container: &ContainerDescription) -> VmResult<()> {
        let agent = self
            .agent
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| VmError::AgentFail("agent not connected".to_string()))?;
        let rootfs = self.container_rootfs_ref(container)?;
        agent
            .new_container(&NewContainerMessage {
                container: container.clone(),
                rootfs,
            })
            .await
            .map(|_| ())
    }

    /// Rootfs location as the guest sees it.
    fn container_rootfs_ref(&self, container: &ContainerDescription) -> VmResult<String> {
        match &container.rootfs {
            // Overlay layers also live under the container's share dir;
            // the guest assembles them from the description.
            RootfsKind::Dir | RootfsKind::Overlay { .. } => {
                Ok(format!("{}/rootfs", container.id))
            }
            RootfsKind::Block { volume } => {
                let entry = self.registry.block(volume).ok_or_else(|| {
                    VmError::BadRequest(format!("rootfs volume {} not attached", volume))
                })?;
                entry.guest_device.clone().ok_or_else(|| {
                    VmError::DriverFail(format!("rootfs volume {} has no guest device", volume))
                })
            }
        }
    }

    async fn fail_startup(&mut self, cause: String) {
        tracing::error!(vm_id = %self.id, "startup failed: {}", cause);
        self.enter_cleaning(Some(cause), false).await;
    }

    // ---------------------------------------------------------------------
    // Device dispatch helpers
    // ---------------------------------------------------------------------

    /// Create the host-side bind for a share-directory volume off-loop and
    /// post the completion.
    fn spawn_bind_volume(&self, name: String) {
        let dir = self.layout.volume_dir(&name);
        let hub = self.hub.clone();
        tokio::spawn(async move {
            let event = match tokio::fs::create_dir_all(&dir).await {
                Ok(()) => VmEvent::VolumeAdded { name },
                Err(e) => VmEvent::DeviceSetupFailed {
                    kind: ResourceKind::Volume,
                    id: name,
                    cause: e.to_string(),
                },
            };
            let _ = hub.post(event);
        });
    }

    fn spawn_bind_volume_removal(&self, name: String) {
        let dir = self.layout.volume_dir(&name);
        let hub = self.hub.clone();
        tokio::spawn(async move {
            let event = match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => VmEvent::VolumeRemoved { name },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    VmEvent::VolumeRemoved { name }
                }
                Err(e) => VmEvent::DeviceSetupFailed {
                    kind: ResourceKind::Volume,
                    id: name,
                    cause: e.to_string(),
                },
            };
            let _ = hub.post(event);
        });
    }

    async fn dispatch_block_insert(&mut self, volume: &VolumeDescription) -> VmResult<()> {
        let VolumeKind::Block { device, format } = &volume.kind else {
            return Err(VmError::BadRequest(format!(
                "volume {} is not block backed",
                volume.name
            )));
        };
        let desc = BlockDescription {
            id: volume.name.clone(),
            source: device.clone(),
            format: format.clone(),
            read_only: false,
        };
        let slot = self.registry.begin_block_insert(&volume.name)?;
        if let Err(e) = self.driver.add_block(&desc, slot, self.hub.clone()).await {
            self.registry.drop_block(&volume.name);
            return Err(e);
        }
        Ok(())
    }

    async fn dispatch_interface_insert(&mut self, nic: &InterfaceDescription) -> VmResult<()> {
        let settings = if nic.ip.is_some() {
            self.driver.configure_network(&self.id, nic).await?
        } else {
            self.driver.allocate_network(&self.id).await?
        };

        let slot = self.registry.begin_interface_insert(nic.clone())?;
        if let Err(e) = self
            .driver
            .add_nic(nic, &settings, slot, self.hub.clone())
            .await
        {
            self.registry.drop_interface(&nic.id);
            let _ = self.driver.release_network(&self.id, &settings).await;
            return Err(e);
        }
        self.nic_settings.insert(nic.id.clone(), settings);
        Ok(())
    }

    async fn handle_interface_inserted(&mut self, id: String, slot: u32, tap_name: String) {
        if self.cleanup.is_some() {
            self.registry.drop_interface(&id);
            return;
        }
        if let Err(e) = self.registry.confirm_interface(&id, slot, tap_name) {
            tracing::warn!(vm_id = %self.id, interface = %id, "stray interface insertion: {}", e);
            return;
        }

        // Configure the device inside the guest.
        if let Some(agent) = self.agent.as_ref().map(Arc::clone)
            && let Some(desc) = self.pod.spec.interface(&id).cloned()
        {
            if let Some(ip) = desc.ip.as_deref()
                && let Err(e) = agent.setup_interface(&desc.device, ip, desc.mtu).await
            {
                self.handle_device_failed(
                    ResourceKind::Interface,
                    id,
                    format!("guest interface setup: {}", e),
                )
                .await;
                return;
            }
            if let Some(gateway) = desc.gateway.as_deref()
                && let Err(e) = agent.setup_route(gateway, &desc.device).await
            {
                self.handle_device_failed(
                    ResourceKind::Interface,
                    id,
                    format!("guest route setup: {}", e),
                )
                .await;
                return;
            }
        }

        self.handle_insert_done(ResourceKind::Interface, &id).await;
    }

    async fn handle_insert_done(&mut self, kind: ResourceKind, id: &str) {
        self.pending.complete(kind, id, Ok(OpOutcome::Done));
        self.startup_mark_done(kind, id).await;
    }

    async fn handle_eject_done(&mut self, kind: ResourceKind, id: &str) {
        self.pending.complete(kind, id, Ok(OpOutcome::Done));
        let drained = match self.cleanup.as_mut() {
            Some(plan) => {
                plan.pending_ejects.remove(&(kind, id.to_string()));
                plan.phase == CleanupPhase::Ejecting && plan.pending_ejects.is_empty()
            }
            None => false,
        };
        if drained {
            self.quit_driver().await;
        }
    }

    async fn handle_device_failed(&mut self, kind: ResourceKind, id: String, cause: String) {
        tracing::warn!(vm_id = %self.id, %kind, %id, "device operation failed: {}", cause);

        if self.cleanup.is_some() {
            // Best-effort teardown: record and move on.
            self.reporter.fault(format!("{} {}: {}", kind, id, cause));
            let drained = match self.cleanup.as_mut() {
                Some(plan) => {
                    plan.pending_ejects.remove(&(kind, id.clone()));
                    plan.phase == CleanupPhase::Ejecting && plan.pending_ejects.is_empty()
                }
                None => false,
            };
            if drained {
                self.quit_driver().await;
            }
            return;
        }

        if self.status() == SandboxStatus::Starting {
            self.fail_startup(format!("{} {}: {}", kind, id, cause)).await;
            return;
        }

        // Runtime failure: surface to the caller, repair the registry.
        let was_ejecting = match kind {
            ResourceKind::Interface => self
                .registry
                .interface(&id)
                .is_some_and(|e| e.status == DeviceStatus::Ejecting),
            ResourceKind::Volume | ResourceKind::Block => self
                .registry
                .block(&id)
                .is_some_and(|e| e.status == DeviceStatus::Ejecting),
            ResourceKind::Serial => self
                .registry
                .serial(&id)
                .is_some_and(|e| e.status == DeviceStatus::Ejecting),
            ResourceKind::Container => false,
        };
        if was_ejecting {
            self.registry.revert_eject(kind, &id);
        } else {
            match kind {
                ResourceKind::Interface => {
                    self.registry.drop_interface(&id);
                    self.pod.drop_interface(&id);
                    if let Some(settings) = self.nic_settings.remove(&id) {
                        let _ = self.driver.release_network(&self.id, &settings).await;
                    }
                }
                ResourceKind::Volume | ResourceKind::Block => {
                    self.registry.drop_block(&id);
                    self.pod.drop_volume(&id);
                }
                ResourceKind::Serial => {
                    self.registry.drop_serial(&id);
                }
                ResourceKind::Container => {}
            }
        }
        self.pending
            .complete(kind, &id, Err(VmError::DriverFail(cause)));
    }

    // ---------------------------------------------------------------------
    // Runtime structural commands
    // ---------------------------------------------------------------------

    fn mutation_guard(&mut self, what: &str) -> VmResult<()> {
        if self.status().is_running() {
            Ok(())
        } else {
            Err(self.not_ready(what))
        }
    }

    fn not_ready(&mut self, what: &str) -> VmError {
        VmError::NotReady(format!(
            "cannot {} while sandbox is {}",
            what,
            self.status()
        ))
    }

    fn handle_add_container(&mut self, desc: ContainerDescription, sink: ResultSink<OpOutcome>) {
        if let Err(e) = self.mutation_guard("add container") {
            complete(sink, Err(e));
            return;
        }
        if let RootfsKind::Block { volume } = &desc.rootfs
            && self.registry.block(volume).is_none()
        {
            let err = VmError::BadRequest(format!("rootfs volume {} not attached", volume));
            self.reporter.bad_request(err.to_string());
            complete(sink, Err(err));
            return;
        }
        if self.pending.contains(ResourceKind::Container, &desc.id) {
            let err = VmError::Busy(format!(
                "container {} already has an operation in flight",
                truncate_id(&desc.id)
            ));
            self.reporter.busy(err.to_string());
            complete(sink, Err(err));
            return;
        }
        if let Err(e) = self.pod.add_container(desc.clone()) {
            self.reporter.bad_request(e.to_string());
            complete(sink, Err(e));
            return;
        }
        if self
            .pending
            .insert(ResourceKind::Container, &desc.id, OpDirection::Insert, Some(sink))
            .is_err()
        {
            // Checked above; unreachable in practice.
            return;
        }

        // Host-side rootfs prep, then the no-op completion marker.
        let hub = self.hub.clone();
        let id = desc.id.clone();
        let dir = match &desc.rootfs {
            RootfsKind::Dir | RootfsKind::Overlay { .. } => {
                Some(self.layout.container_rootfs(&desc.id))
            }
            RootfsKind::Block { .. } => None,
        };
        tokio::spawn(async move {
            if let Some(dir) = dir
                && let Err(e) = tokio::fs::create_dir_all(&dir).await
            {
                let _ = hub.post(VmEvent::DeviceSetupFailed {
                    kind: ResourceKind::Container,
                    id,
                    cause: e.to_string(),
                });
                return;
            }
            let _ = hub.post(VmEvent::DevSkip {
                kind: ResourceKind::Container,
                id,
            });
        });
    }

    async fn handle_remove_container(&mut self, id: String, sink: ResultSink<OpOutcome>) {
        if let Err(e) = self.mutation_guard("remove container") {
            complete(sink, Err(e));
            return;
        }
        if self.pod.container_state(&id).is_none() {
            let err = VmError::BadRequest(format!("unknown container {}", truncate_id(&id)));
            self.reporter.bad_request(err.to_string());
            complete(sink, Err(err));
            return;
        }
        if self.pending.contains(ResourceKind::Container, &id) {
            let err = VmError::Busy(format!(
                "container {} already has an operation in flight",
                truncate_id(&id)
            ));
            self.reporter.busy(err.to_string());
            complete(sink, Err(err));
            return;
        }
        if self
            .pending
            .insert(ResourceKind::Container, &id, OpDirection::Eject, Some(sink))
            .is_err()
        {
            return;
        }

        // Stop the workload first, best effort.
        if self.pod.container_state(&id) == Some(ContainerState::Running)
            && let Some(agent) = self.agent.as_ref().map(Arc::clone)
            && let Err(e) = agent.kill_container(&id, 9).await
        {
            tracing::warn!(vm_id = %self.id, container = %truncate_id(&id), "kill before remove failed: {}", e);
        }

        let freed = match self.pod.remove_container(&id) {
            Ok(freed) => freed,
            Err(e) => {
                self.pending
                    .complete(ResourceKind::Container, &id, Err(e));
                return;
            }
        };

        // Volumes whose removal was deferred on this container.
        for volume in freed {
            self.destroy_volume(&volume).await;
        }

        let hub = self.hub.clone();
        let dir = self.layout.share_dir().join(&id);
        tokio::spawn(async move {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!("container dir cleanup failed: {}", e);
            }
            let _ = hub.post(VmEvent::DevSkip {
                kind: ResourceKind::Container,
                id,
            });
        });
    }

    async fn handle_add_volume(&mut self, desc: VolumeDescription, sink: ResultSink<OpOutcome>) {
        if let Err(e) = self.mutation_guard("add volume") {
            complete(sink, Err(e));
            return;
        }
        if self.pending.contains(ResourceKind::Volume, &desc.name) {
            let err = VmError::Busy(format!(
                "volume {} already has an operation in flight",
                desc.name
            ));
            self.reporter.busy(err.to_string());
            complete(sink, Err(err));
            return;
        }
        if let Err(e) = self.pod.add_volume(desc.clone()) {
            self.reporter.bad_request(e.to_string());
            complete(sink, Err(e));
            return;
        }
        if self
            .pending
            .insert(ResourceKind::Volume, &desc.name, OpDirection::Insert, Some(sink))
            .is_err()
        {
            return;
        }

        match &desc.kind {
            VolumeKind::HostBind { .. } | VolumeKind::Filesystem { .. } => {
                self.spawn_bind_volume(desc.name.clone());
            }
            VolumeKind::Block { .. } => {
                if let Err(e) = self.dispatch_block_insert(&desc).await {
                    self.pod.drop_volume(&desc.name);
                    self.pending
                        .complete(ResourceKind::Volume, &desc.name, Err(e));
                }
            }
        }
    }

    async fn handle_remove_volume(&mut self, name: String, sink: ResultSink<OpOutcome>) {
        if let Err(e) = self.mutation_guard("remove volume") {
            complete(sink, Err(e));
            return;
        }
        if self.pending.contains(ResourceKind::Volume, &name) {
            let err = VmError::Busy(format!("volume {} already has an operation in flight", name));
            self.reporter.busy(err.to_string());
            complete(sink, Err(err));
            return;
        }
        match self.pod.request_volume_removal(&name) {
            Err(e) => {
                self.reporter.bad_request(e.to_string());
                complete(sink, Err(e));
            }
            Ok(false) => {
                // Still referenced; destruction happens when the refcount
                // drops.
                tracing::debug!(vm_id = %self.id, volume = %name, "volume removal deferred");
                complete(sink, Ok(OpOutcome::Skipped));
            }
            Ok(true) => {
                if self
                    .pending
                    .insert(ResourceKind::Volume, &name, OpDirection::Eject, Some(sink))
                    .is_err()
                {
                    return;
                }
                self.destroy_volume(&name).await;
            }
        }
    }

    /// Tear down an unreferenced volume whose removal was requested.
    async fn destroy_volume(&mut self, name: &str) {
        let Some(desc) = self.pod.spec.volume(name).cloned() else {
            return;
        };
        match &desc.kind {
            VolumeKind::HostBind { .. } | VolumeKind::Filesystem { .. } => {
                self.spawn_bind_volume_removal(name.to_string());
            }
            VolumeKind::Block { .. } => match self.registry.begin_block_eject(name) {
                Ok(slot) => {
                    if let Err(e) = self.driver.remove_block(name, slot, self.hub.clone()).await {
                        self.handle_device_failed(
                            ResourceKind::Volume,
                            name.to_string(),
                            e.to_string(),
                        )
                        .await;
                    }
                }
                Err(e) => {
                    self.pending.complete(ResourceKind::Volume, name, Err(e));
                }
            },
        }
    }

    async fn handle_add_interface(
        &mut self,
        desc: InterfaceDescription,
        sink: ResultSink<OpOutcome>,
    ) {
        if let Err(e) = self.mutation_guard("add interface") {
            complete(sink, Err(e));
            return;
        }
        if desc.is_loopback() {
            let err = VmError::BadRequest("loopback is managed by the guest".to_string());
            self.reporter.bad_request(err.to_string());
            complete(sink, Err(err));
            return;
        }
        if self.pending.contains(ResourceKind::Interface, &desc.id) {
            let err = VmError::Busy(format!(
                "interface {} already has an operation in flight",
                desc.id
            ));
            self.reporter.busy(err.to_string());
            complete(sink, Err(err));
            return;
        }
        if let Err(e) = self.pod.add_interface(desc.clone()) {
            self.reporter.bad_request(e.to_string());
            complete(sink, Err(e));
            return;
        }
        if self
            .pending
            .insert(ResourceKind::Interface, &desc.id, OpDirection::Insert, Some(sink))
            .is_err()
        {
            return;
        }
        if let Err(e) = self.dispatch_interface_insert(&desc).await {
            self.pod.drop_interface(&desc.id);
            self.pending
                .complete(ResourceKind::Interface, &desc.id, Err(e));
        }
    }

    async fn handle_remove_interface(&mut self, id: String, sink: ResultSink<OpOutcome>) {
        if let Err(e) = self.mutation_guard("remove interface") {
            complete(sink, Err(e));
            return;
        }
        if self.pending.contains(ResourceKind::Interface, &id) {
            let err = VmError::Busy(format!(
                "interface {} already has an operation in flight",
                id
            ));
            self.reporter.busy(err.to_string());
            complete(sink, Err(err));
            return;
        }
        let slot = match self.registry.begin_interface_eject(&id) {
            Ok(slot) => slot,
            Err(e) => {
                self.reporter.bad_request(e.to_string());
                complete(sink, Err(e));
                return;
            }
        };
        if self
            .pending
            .insert(ResourceKind::Interface, &id, OpDirection::Eject, Some(sink))
            .is_err()
        {
            self.registry.revert_eject(ResourceKind::Interface, &id);
            return;
        }
        if let Err(e) = self.driver.remove_nic(&id, slot, self.hub.clone()).await {
            self.handle_device_failed(ResourceKind::Interface, id, e.to_string())
                .await;
        }
    }

    async fn handle_add_serial(
        &mut self,
        desc: SerialPortDescription,
        sink: ResultSink<OpOutcome>,
    ) {
        if let Err(e) = self.mutation_guard("add serial") {
            complete(sink, Err(e));
            return;
        }
        if self.pending.contains(ResourceKind::Serial, &desc.id) {
            let err = VmError::Busy(format!(
                "serial {} already has an operation in flight",
                desc.id
            ));
            self.reporter.busy(err.to_string());
            complete(sink, Err(err));
            return;
        }
        let slot = match self.registry.begin_serial_insert(desc.clone()) {
            Ok(slot) => slot,
            Err(e) => {
                self.reporter.bad_request(e.to_string());
                complete(sink, Err(e));
                return;
            }
        };
        if self
            .pending
            .insert(ResourceKind::Serial, &desc.id, OpDirection::Insert, Some(sink))
            .is_err()
        {
            self.registry.drop_serial(&desc.id);
            return;
        }
        if let Err(e) = self.driver.add_serial(&desc, slot, self.hub.clone()).await {
            self.handle_device_failed(ResourceKind::Serial, desc.id, e.to_string())
                .await;
        }
    }

    async fn handle_remove_serial(&mut self, id: String, sink: ResultSink<OpOutcome>) {
        if let Err(e) = self.mutation_guard("remove serial") {
            complete(sink, Err(e));
            return;
        }
        if self.pending.contains(ResourceKind::Serial, &id) {
            let err = VmError::Busy(format!("serial {} already has an operation in flight", id));
            self.reporter.busy(err.to_string());
            complete(sink, Err(err));
            return;
        }
        let slot = match self.registry.begin_serial_eject(&id) {
            Ok(slot) => slot,
            Err(e) => {
                self.reporter.bad_request(e.to_string());
                complete(sink, Err(e));
                return;
            }
        };
        if self
            .pending
            .insert(ResourceKind::Serial, &id, OpDirection::Eject, Some(sink))
            .is_err()
        {
            self.registry.revert_eject(ResourceKind::Serial, &id);
            return;
        }
        if let Err(e) = self.driver.remove_serial(&id, slot, self.hub.clone()).await {
            self.handle_device_failed(ResourceKind::Serial, id, e.to_string())
                .await;
        }
    }

    // ---------------------------------------------------------------------
    // Inline commands
    // ---------------------------------------------------------------------

    fn running_agent(&mut self, what: &str) -> VmResult<Arc<AgentChannel>> {
        if !self.status().is_running() {
            return Err(self.not_ready(what));
        }
        self.agent
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| VmError::AgentFail("agent not connected".to_string()))
    }

    async fn handle_new_container(&mut self, id: String, sink: ResultSink<OpOutcome>) {
        if let Err(e) = self.running_agent("start container") {
            complete(sink, Err(e));
            return;
        }
        match self.pod.container_state(&id) {
            None => {
                let err = VmError::BadRequest(format!("unknown container {}", truncate_id(&id)));
                self.reporter.bad_request(err.to_string());
                complete(sink, Err(err));
            }
            Some(ContainerState::Running) => complete(sink, Ok(OpOutcome::Skipped)),
            Some(_) => {
                let Some(container) = self.pod.spec.container(&id).cloned() else {
                    complete(
                        sink,
                        Err(VmError::BadRequest(format!(
                            "unknown container {}",
                            truncate_id(&id)
                        ))),
                    );
                    return;
                };
                match self.send_new_container(&container).await {
                    Ok(()) => {
                        let _ = self.pod.set_container_state(&id, ContainerState::Running);
                        complete(sink, Ok(OpOutcome::Done));
                    }
                    Err(e) => {
                        let _ = self.pod.set_container_state(&id, ContainerState::Failed);
                        complete(sink, Err(e));
                    }
                }
            }
        }
    }

    async fn handle_stop_pod(&mut self, sink: ResultSink<OpOutcome>) {
        let agent = match self.running_agent("stop pod") {
            Ok(agent) => agent,
            Err(e) => {
                complete(sink, Err(e));
                return;
            }
        };
        match agent.stop_pod().await {
            Ok(()) => {
                for id in self.pod.container_ids() {
                    if self.pod.container_state(&id) == Some(ContainerState::Running) {
                        let _ = self.pod.set_container_state(&id, ContainerState::Stopped);
                    }
                }
                self.reporter.pod_stopped();
                complete(sink, Ok(OpOutcome::Done));
            }
            Err(e) => complete(sink, Err(e)),
        }
    }

    /// Pause or resume. The whole flip runs inside one event, so pause
    /// state can never interleave with save.
    async fn handle_pause(&mut self, pause: bool, sink: ResultSink<OpOutcome>) {
        let status = self.status();
        if status != SandboxStatus::Running && status != SandboxStatus::Paused {
            complete(sink, Err(self.not_ready("pause")));
            return;
        }
        if self.paused == pause {
            complete(sink, Ok(OpOutcome::Skipped));
            return;
        }

        let agent = self.agent.as_ref().map(Arc::clone);
        let result = if pause {
            // Quiesce the agent first, then freeze vcpus. On any failure
            // the state is left unchanged.
            let sync = match agent.as_ref() {
                Some(agent) => agent.pause_sync().await,
                None => Err(VmError::AgentFail("agent not connected".to_string())),
            };
            match sync {
                Ok(()) => self.driver.pause(true).await,
                Err(e) => Err(e),
            }
        } else {
            match self.driver.pause(false).await {
                Ok(()) => match agent.as_ref() {
                    Some(agent) => agent.unpause().await,
                    None => Err(VmError::AgentFail("agent not connected".to_string())),
                },
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => {
                self.paused = pause;
                let target = if pause {
                    SandboxStatus::Paused
                } else {
                    SandboxStatus::Running
                };
                if let Err(e) = self.set_status(target) {
                    complete(sink, Err(e));
                    return;
                }
                complete(sink, Ok(OpOutcome::Done));
            }
            Err(e) => {
                tracing::error!(vm_id = %self.id, pause, "pause flip failed: {}", e);
                complete(sink, Err(e));
            }
        }
    }

    async fn handle_save(&mut self, path: PathBuf, sink: ResultSink<OpOutcome>) {
        if !self.paused || self.status() != SandboxStatus::Paused {
            complete(
                sink,
                Err(VmError::NotReady("save requires a paused sandbox".to_string())),
            );
            return;
        }
        match self.driver.save(&path).await {
            Ok(()) => complete(sink, Ok(OpOutcome::Done)),
            Err(e) => complete(sink, Err(e)),
        }
    }

    async fn handle_shutdown(&mut self, sink: ResultSink<OpOutcome>) {
        match self.status() {
            SandboxStatus::Cleaning => {
                self.shutdown_waiters.push(sink);
            }
            SandboxStatus::Running | SandboxStatus::Paused => {
                self.shutdown_waiters.push(sink);
                let destroyed = match self.agent.as_ref().map(Arc::clone) {
                    Some(agent) => agent.destroy_pod().await.is_ok(),
                    None => false,
                };
                self.enter_cleaning(None, destroyed).await;
            }
            SandboxStatus::Init | SandboxStatus::Starting => {
                self.shutdown_waiters.push(sink);
                self.enter_cleaning(None, false).await;
            }
            SandboxStatus::Terminated => complete(sink, Ok(OpOutcome::Skipped)),
        }
    }

    async fn handle_kill(&mut self, sink: ResultSink<OpOutcome>) {
        self.shutdown_waiters.push(sink);
        if self.status() != SandboxStatus::Cleaning
            && let Err(e) = self.set_status(SandboxStatus::Cleaning)
        {
            tracing::warn!(vm_id = %self.id, "kill: {}", e);
        }
        self.pending.interrupt_all("sandbox killed");
        if let Some(agent) = self.agent.take() {
            agent.close();
        }
        self.cleanup = Some(CleanupPlan {
            phase: CleanupPhase::WaitVmExit,
            pending_ejects: HashSet::new(),
            graceful: false,
        });
        if let Err(e) = self.driver.kill(self.hub.clone()).await {
            tracing::error!(vm_id = %self.id, "driver kill failed: {}", e);
            self.vm_dead = true;
            self.finish_termination().await;
        }
    }

    async fn handle_release(&mut self, sink: ResultSink<OpOutcome>) {
        // Detach without stopping the VM: close the agent, keep the
        // directories, end the response stream.
        if let Some(agent) = self.agent.take() {
            agent.close();
        }
        self.pending.interrupt_all("sandbox released");
        self.keep_dirs = true;
        self.reporter.success("sandbox released");
        let _ = self.set_status(SandboxStatus::Cleaning);
        let _ = self.set_status(SandboxStatus::Terminated);
        self.reporter.close();
        self.hub = EventHub::closed();
        complete(sink, Ok(OpOutcome::Done));
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(Ok(OpOutcome::Done));
        }
    }

    async fn handle_set_cpus(&mut self, cpus: u32) -> VmResult<OpOutcome> {
        if !self.status().is_running() {
            return Err(self.not_ready("set cpus"));
        }
        if cpus <= self.boot.cpu {
            return Ok(OpOutcome::Skipped);
        }
        self.driver.set_cpus(cpus).await?;
        self.boot.cpu = cpus;
        if let Some(agent) = self.agent.as_ref() {
            agent.online_cpu_mem().await?;
        }
        Ok(OpOutcome::Done)
    }

    async fn handle_add_mem(&mut self, size_mb: u32) -> VmResult<OpOutcome> {
        if !self.status().is_running() {
            return Err(self.not_ready("add memory"));
        }
        if size_mb <= self.boot.memory {
            return Ok(OpOutcome::Skipped);
        }
        let delta = size_mb - self.boot.memory;
        self.driver.add_mem(1, delta).await?;
        self.boot.memory = size_mb;
        if let Some(agent) = self.agent.as_ref() {
            agent.online_cpu_mem().await?;
        }
        Ok(OpOutcome::Done)
    }

    fn dump(&self) -> SandboxSnapshot {
        let (interfaces, blocks, serials, insertion_log) = self.registry.snapshot();
        SandboxSnapshot {
            version: SNAPSHOT_VERSION,
            id: self.id.clone(),
            boot: self.boot.clone(),
            pod: self.pod.spec.clone(),
            devices: DeviceSnapshot {
                interfaces,
                blocks,
                serials,
                insertion_log,
            },
            generation: self.reporter.generation(),
            paused: self.paused,
        }
    }

    // ---------------------------------------------------------------------
    // Cleaning and termination
    // ---------------------------------------------------------------------

    async fn handle_vm_gone(&mut self, what: &str) {
        self.vm_dead = true;
        match self.cleanup.as_ref() {
            Some(_) => {
                // Expected during teardown, whatever the phase.
                self.finish_termination().await;
            }
            None => {
                self.enter_cleaning(Some(format!("{} unexpectedly", what)), false)
                    .await;
            }
        }
    }

    /// Transition to Cleaning and start the teardown pipeline.
    ///
    /// `wait_pod_finish` keeps the agent open until the guest confirms the
    /// pod is gone (graceful shutdown); every other path ejects right away.
    async fn enter_cleaning(&mut self, cause: Option<String>, wait_pod_finish: bool) {
        if let Some(cause) = cause {
            if self.terminal_fault.is_none() {
                self.terminal_fault = Some(cause);
            }
            if self.cleanup.is_some() {
                return;
            }
        } else if self.cleanup.is_some() {
            return;
        }

        if self.status() != SandboxStatus::Cleaning
            && let Err(e) = self.set_status(SandboxStatus::Cleaning)
        {
            tracing::warn!(vm_id = %self.id, "cleaning: {}", e);
        }
        self.startup = None;
        self.pending.interrupt_all("sandbox cleaning");

        self.cleanup = Some(CleanupPlan {
            phase: CleanupPhase::WaitPodFinish,
            pending_ejects: HashSet::new(),
            graceful: wait_pod_finish,
        });

        if self.vm_dead || !wait_pod_finish {
            self.begin_ejects().await;
        }
    }

    /// Walk the registry in reverse insertion order, best-effort ejecting
    /// every inserted device.
    async fn begin_ejects(&mut self) {
        if let Some(agent) = self.agent.take() {
            agent.close();
        }

        if self.vm_dead {
            // Nothing to unplug from a dead hypervisor.
            for (kind, id) in self.registry.inserted_reverse() {
                match kind {
                    ResourceKind::Interface => {
                        self.registry.drop_interface(&id);
                    }
                    ResourceKind::Block | ResourceKind::Volume => {
                        self.registry.drop_block(&id);
                    }
                    ResourceKind::Serial => {
                        self.registry.drop_serial(&id);
                    }
                    ResourceKind::Container => {}
                }
            }
            if let Some(plan) = self.cleanup.as_mut() {
                plan.phase = CleanupPhase::WaitVmExit;
            }
            self.finish_termination().await;
            return;
        }

        let order = self.registry.inserted_reverse();
        let mut dispatched: HashSet<(ResourceKind, String)> = HashSet::new();

        for (kind, id) in order {
            let result = match kind {
                ResourceKind::Interface => match self.registry.begin_interface_eject(&id) {
                    Ok(slot) => self.driver.remove_nic(&id, slot, self.hub.clone()).await,
                    Err(e) => Err(e),
                },
                ResourceKind::Block | ResourceKind::Volume => {
                    match self.registry.begin_block_eject(&id) {
                        Ok(slot) => self.driver.remove_block(&id, slot, self.hub.clone()).await,
                        Err(e) => Err(e),
                    }
                }
                ResourceKind::Serial => match self.registry.begin_serial_eject(&id) {
                    Ok(slot) => self.driver.remove_serial(&id, slot, self.hub.clone()).await,
                    Err(e) => Err(e),
                },
                ResourceKind::Container => Ok(()),
            };
            match result {
                Ok(()) => {
                    if kind != ResourceKind::Container {
                        let key_kind = if kind == ResourceKind::Block {
                            ResourceKind::Volume
                        } else {
                            kind
                        };
                        dispatched.insert((key_kind, id));
                    }
                }
                Err(e) => {
                    // Best effort: report and keep walking.
                    self.reporter.fault(format!("eject {} {}: {}", kind, id, e));
                }
            }
        }

        let drained = match self.cleanup.as_mut() {
            Some(plan) => {
                plan.phase = CleanupPhase::Ejecting;
                plan.pending_ejects = dispatched;
                plan.pending_ejects.is_empty()
            }
            None => return,
        };
        if drained {
            self.quit_driver().await;
        }
    }

    async fn quit_driver(&mut self) {
        if self.vm_dead {
            self.finish_termination().await;
            return;
        }
        if let Some(plan) = self.cleanup.as_mut() {
            plan.phase = CleanupPhase::WaitVmExit;
        }
        let graceful = self.cleanup.as_ref().is_some_and(|p| p.graceful);
        let result = if graceful && self.terminal_fault.is_none() {
            self.driver.quit(self.hub.clone()).await
        } else {
            self.driver.kill(self.hub.clone()).await
        };
        if let Err(e) = result {
            tracing::error!(vm_id = %self.id, "hypervisor stop failed: {}", e);
            self.vm_dead = true;
            self.finish_termination().await;
        }
    }

    async fn finish_termination(&mut self) {
        self.pending.interrupt_all("sandbox terminated");
        if let Some(agent) = self.agent.take() {
            agent.close();
        }

        match self.terminal_fault.take() {
            Some(cause) => self.reporter.fault(cause),
            None => self.reporter.vm_shutdown(),
        }

        if !self.keep_dirs
            && let Err(e) = self.layout.cleanup().await
        {
            tracing::warn!(vm_id = %self.id, "directory teardown failed: {}", e);
        }

        let _ = self.set_status(SandboxStatus::Terminated);
        // The stream ends after the terminal response, and the loop's own
        // queue handle goes away so the sandbox can drain out.
        self.reporter.close();
        self.hub = EventHub::closed();

        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(Ok(OpOutcome::Done));
        }
        tracing::info!(vm_id = %self.id, "sandbox terminated");
    }
}

/// Non-blocking sink completion; a dropped caller is not an error.
fn complete<T>(sink: ResultSink<T>, result: VmResult<T>) {
    let _ = sink.send(result);
}
