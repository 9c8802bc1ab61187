//! The tagged event queue feeding the sandbox state machine.
//!
//! Everything that can happen to a sandbox arrives here: commands from
//! external callers, completions from the hypervisor driver, and
//! notifications from the guest agent. The loop matches exhaustively on the
//! sum type; there is no dynamic dispatch on event values.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use hypervm_shared::{VmError, VmResult};

use crate::agent::AgentChannel;
use crate::devices::ResourceKind;
use crate::pod::{ContainerDescription, InterfaceDescription, SerialPortDescription, VolumeDescription};
use crate::vmm::PodStats;

/// Capacity of the inbound event queue.
pub const EVENT_QUEUE_DEPTH: usize = 128;

/// Per-request completion sink. Sends never block; a dropped receiver is
/// not an error.
pub type ResultSink<T> = oneshot::Sender<VmResult<T>>;

/// Outcome of a structural operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    /// The operation ran to completion.
    Done,
    /// The operation was a no-op (device skipped or already in the target
    /// state).
    Skipped,
}

#[derive(Debug)]
pub enum VmEvent {
    // VM lifecycle, posted by the driver and the agent transport.
    VmStartFailed { message: String },
    VmExit,
    VmKilled { success: bool },
    VmTimeout,
    InitConnected { agent: Arc<AgentChannel> },
    /// The guest init reported the whole pod finished, with per-container
    /// exit codes.
    PodFinished { results: Vec<i64> },
    /// Agent transport fault (read error, poisoned codec).
    InitFail { cause: String },
    /// Hypervisor-side fault outside a specific device operation.
    DriverFault { cause: String },

    // Structural commands from external callers.
    AddContainer { desc: ContainerDescription, sink: ResultSink<OpOutcome> },
    RemoveContainer { id: String, sink: ResultSink<OpOutcome> },
    AddVolume { desc: VolumeDescription, sink: ResultSink<OpOutcome> },
    RemoveVolume { name: String, sink: ResultSink<OpOutcome> },
    AddInterface { desc: InterfaceDescription, sink: ResultSink<OpOutcome> },
    RemoveInterface { id: String, sink: ResultSink<OpOutcome> },
    AddSerial { desc: SerialPortDescription, sink: ResultSink<OpOutcome> },
    RemoveSerial { id: String, sink: ResultSink<OpOutcome> },

    // Device completions, posted by the driver or by host-side setup tasks.
    /// A share-directory bind volume became available to the guest.
    VolumeAdded { name: String },
    /// A share-directory bind volume was torn down on the host side.
    VolumeRemoved { name: String },
    BlockInserted { id: String, slot: u32, device: String },
    BlockEjected { id: String },
    InterfaceInserted { id: String, slot: u32, tap_name: String },
    InterfaceEjected { id: String },
    /// Serial channel attached; the completion for `add_serial`.
    TtyOpen { id: String, slot: u32 },
    /// Serial channel detached; the completion for `remove_serial`.
    TtyClose { id: String },
    /// The driver determined no work was needed.
    DevSkip { kind: ResourceKind, id: String },
    /// A device operation failed on the hypervisor side.
    DeviceFailed { kind: ResourceKind, id: String, cause: String },
    /// Host-side device setup failed before reaching the driver.
    DeviceSetupFailed { kind: ResourceKind, id: String, cause: String },

    // Commands executed inline by the loop.
    NewContainer { id: String, sink: ResultSink<OpOutcome> },
    StopPod { sink: ResultSink<OpOutcome> },
    GetPodIp { sink: ResultSink<Vec<String>> },
    GetPod { sink: ResultSink<serde_json::Value> },
    Stats { sink: ResultSink<PodStats> },
    Pause { pause: bool, sink: ResultSink<OpOutcome> },
    Save { path: PathBuf, sink: ResultSink<OpOutcome> },
    Shutdown { sink: ResultSink<OpOutcome> },
    Kill { sink: ResultSink<OpOutcome> },
    /// Detach the supervisor without stopping the VM.
    Release { sink: ResultSink<OpOutcome> },
    Exec { container: String, process: crate::pod::ProcessSpec, sink: ResultSink<OpOutcome> },
    KillContainer { container: String, signal: i32, sink: ResultSink<OpOutcome> },
    WinSize { container: String, process: String, row: u16, column: u16, sink: ResultSink<OpOutcome> },
    WriteFile { container: String, path: String, data: Vec<u8>, sink: ResultSink<OpOutcome> },
    ReadFile { container: String, path: String, sink: ResultSink<Vec<u8>> },
    SetCpus { cpus: u32, sink: ResultSink<OpOutcome> },
    AddMem { size_mb: u32, sink: ResultSink<OpOutcome> },
    /// Serialize the sandbox for a later `associate`.
    Dump { sink: ResultSink<crate::sandbox::snapshot::SandboxSnapshot> },
}

impl VmEvent {
    /// Stable name for logging.
    pub fn kind(&self) -> &'static str {
        use VmEvent::*;
        match self {
            VmStartFailed { .. } => "VM_START_FAILED",
            VmExit => "VM_EXIT",
            VmKilled { .. } => "VM_KILL",
            VmTimeout => "VM_TIMEOUT",
            InitConnected { .. } => "INIT_CONNECTED",
            PodFinished { .. } => "POD_FINISHED",
            InitFail { .. } => "INIT_FAIL",
            DriverFault { .. } => "DRIVER_FAULT",
            AddContainer { .. } => "CONTAINER_ADD",
            RemoveContainer { .. } => "CONTAINER_DELETE",
            AddVolume { .. } => "VOLUME_ADD",
            RemoveVolume { .. } => "VOLUME_DELETE",
            AddInterface { .. } => "INTERFACE_ADD",
            RemoveInterface { .. } => "INTERFACE_DELETE",
            AddSerial { .. } => "SERIAL_ADD",
            RemoveSerial { .. } => "SERIAL_DELETE",
            VolumeAdded { .. } => "VOLUME_ADDED",
            VolumeRemoved { .. } => "VOLUME_REMOVED",
            BlockInserted { .. } => "BLOCK_INSERTED",
            BlockEjected { .. } => "BLOCK_EJECTED",
            InterfaceInserted { .. } => "INTERFACE_INSERTED",
            InterfaceEjected { .. } => "INTERFACE_EJECTED",
            TtyOpen { .. } => "TTY_OPEN",
            TtyClose { .. } => "TTY_CLOSE",
            DevSkip { .. } => "DEV_SKIP",
            DeviceFailed { .. } => "DEVICE_FAILED",
            DeviceSetupFailed { .. } => "DEVICE_SETUP_FAILED",
            NewContainer { .. } => "NEWCONTAINER",
            StopPod { .. } => "STOP_POD",
            GetPodIp { .. } => "GET_POD_IP",
            GetPod { .. } => "GET_POD",
            Stats { .. } => "POD_STATS",
            Pause { .. } => "PAUSE",
            Save { .. } => "SAVE",
            Shutdown { .. } => "SHUTDOWN",
            Kill { .. } => "KILL",
            Release { .. } => "RELEASE",
            Exec { .. } => "EXEC",
            KillContainer { .. } => "KILL_CONTAINER",
            WinSize { .. } => "WINDOW_SIZE",
            WriteFile { .. } => "WRITE_FILE",
            ReadFile { .. } => "READ_FILE",
            SetCpus { .. } => "SET_CPUS",
            AddMem { .. } => "ADD_MEM",
            Dump { .. } => "DUMP",
        }
    }
}

/// Cloneable handle for posting events onto a sandbox queue.
///
/// Posting never blocks: a full queue is reported as `Busy`, a closed queue
/// (sandbox gone) as `Interrupted`.
#[derive(Clone)]
pub struct EventHub {
    tx: mpsc::Sender<VmEvent>,
}

impl EventHub {
    pub fn new(tx: mpsc::Sender<VmEvent>) -> Self {
        Self { tx }
    }

    /// Create a queue and its hub.
    pub fn channel() -> (Self, mpsc::Receiver<VmEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        (Self::new(tx), rx)
    }

    /// A hub whose queue is already gone. Used to drop the loop's own
    /// sender once the sandbox reaches its terminal state.
    pub fn closed() -> Self {
        let (tx, _) = mpsc::channel(1);
        Self { tx }
    }

    pub fn post(&self, event: VmEvent) -> VmResult<()> {
        let kind = event.kind();
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                VmError::Busy(format!("event queue full, dropping {}", kind))
            }
            mpsc::error::TrySendError::Closed(_) => {
                VmError::Interrupted(format!("sandbox gone, dropping {}", kind))
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_post_is_non_blocking() {
        let (hub, mut rx) = EventHub::channel();
        hub.post(VmEvent::VmExit).unwrap();
        match rx.recv().await.unwrap() {
            VmEvent::VmExit => {}
            other => panic!("unexpected event {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_post_to_closed_queue_fails() {
        let (hub, rx) = EventHub::channel();
        drop(rx);
        let err = hub.post(VmEvent::VmTimeout).unwrap_err();
        assert!(matches!(err, VmError::Interrupted(_)));
        assert!(hub.is_closed());
    }

    #[tokio::test]
    async fn test_post_to_full_queue_fails() {
        let (tx, _rx) = mpsc::channel(1);
        let hub = EventHub::new(tx);
        hub.post(VmEvent::VmExit).unwrap();
        let err = hub.post(VmEvent::VmExit).unwrap_err();
        assert!(matches!(err, VmError::Busy(_)));
    }
}
