//! Request/response transport to the guest init.
//!
//! One duplex stream carries framed messages (see [`codec`]). The guest
//! processes requests in order, so replies are matched FIFO: the oldest
//! outstanding request owns the next reply frame. Unsolicited frames
//! (READY, FINISHPOD, FINISHCMD, NEXT) are routed to the sandbox queue or
//! logged. A transport error poisons the channel; every outstanding and
//! future request then resolves `Interrupted`/`AgentFail`.

pub mod codec;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex as AsyncMutex, oneshot};

use hypervm_shared::{VmError, VmResult};

use crate::pod::{ContainerDescription, ProcessSpec};
use crate::sandbox::events::{EventHub, VmEvent};
use codec::{AgentCode, AgentMessage, read_frame, write_frame};

/// Deadline for transport establishment (socket dial plus READY handshake).
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Default per-request deadline; device hotplug is the slowest caller.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Keepalive cadence; three consecutive misses report the VM dead.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const KEEPALIVE_MISS_LIMIT: u32 = 3;

/// A matched reply from the guest.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub code: AgentCode,
    pub payload: Vec<u8>,
}

struct Waiter {
    seq: u64,
    code: AgentCode,
    tx: oneshot::Sender<VmResult<AgentReply>>,
}

/// The framed duplex channel to the guest init.
pub struct AgentChannel {
    writer: AsyncMutex<Box<dyn AsyncWrite + Send + Unpin>>,
    waiters: Mutex<VecDeque<Waiter>>,
    next_seq: AtomicU64,
    poisoned: AtomicBool,
    /// Set on deliberate close; suppresses the fault event from the reader.
    closing: AtomicBool,
}

impl AgentChannel {
    /// Perform the READY handshake on `stream` and start the reader task.
    ///
    /// The guest announces itself with a READY frame as soon as the init is
    /// up; nothing may be sent before it arrives.
    pub async fn connect<S>(stream: S, hub: EventHub, deadline: Duration) -> VmResult<Arc<Self>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, write_half) = tokio::io::split(stream);

        let first = tokio::time::timeout(deadline, read_frame(&mut read_half))
            .await
            .map_err(|_| VmError::Timeout("waiting for guest READY".to_string()))??;
        if first.code != AgentCode::Ready {
            return Err(VmError::AgentFail(format!(
                "expected INIT_READY, got {}",
                first.code
            )));
        }

        let channel = Arc::new(Self {
            writer: AsyncMutex::new(Box::new(write_half)),
            waiters: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(1),
            poisoned: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });

        let reader_channel = Arc::clone(&channel);
        tokio::spawn(async move {
            reader_channel.read_loop(read_half, hub).await;
        });

        Ok(channel)
    }

    /// Rejoin an already-running guest. No READY handshake: the init sent
    /// it to the previous supervisor. Used by `associate`.
    pub fn resume<S>(stream: S, hub: EventHub) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let channel = Arc::new(Self {
            writer: AsyncMutex::new(Box::new(write_half)),
            waiters: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(1),
            poisoned: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });
        let reader_channel = Arc::clone(&channel);
        tokio::spawn(async move {
            reader_channel.read_loop(read_half, hub).await;
        });
        channel
    }

    /// Dial the agent unix socket, retrying until `DIAL_TIMEOUT` since the
    /// hypervisor may create it slightly after launch returns.
    pub async fn connect_unix(path: &std::path::Path, hub: EventHub) -> VmResult<Arc<Self>> {
        let started = tokio::time::Instant::now();
        let stream = loop {
            match tokio::net::UnixStream::connect(path).await {
                Ok(stream) => break stream,
                Err(e) => {
                    if started.elapsed() >= DIAL_TIMEOUT {
                        return Err(VmError::Timeout(format!(
                            "dialing agent socket {}: {}",
                            path.display(),
                            e
                        )));
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        };
        Self::connect(stream, hub, DIAL_TIMEOUT).await
    }

    async fn read_loop<R: AsyncRead + Unpin>(self: Arc<Self>, mut reader: R, hub: EventHub) {
        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(frame) => frame,
                Err(e) => {
                    self.poisoned.store(true, Ordering::SeqCst);
                    self.cancel_all("agent stream closed");
                    if !self.closing.load(Ordering::SeqCst) {
                        tracing::warn!("agent read loop terminated: {}", e);
                        let _ = hub.post(VmEvent::InitFail {
                            cause: e.to_string(),
                        });
                    }
                    return;
                }
            };

            match frame.code {
                AgentCode::Ready => {
                    tracing::debug!("duplicate INIT_READY ignored");
                }
                AgentCode::FinishPod => {
                    let results: Vec<i64> =
                        serde_json::from_slice(&frame.payload).unwrap_or_default();
                    let _ = hub.post(VmEvent::PodFinished { results });
                }
                AgentCode::FinishCmd => {
                    tracing::debug!("guest reported command finished");
                }
                AgentCode::Next => {
                    // Flow control for chunked pod specs; nothing to do on
                    // a fully buffered writer.
                    tracing::trace!("INIT_NEXT");
                }
                AgentCode::Error => {
                    let cause = String::from_utf8_lossy(&frame.payload).to_string();
                    self.complete_front(Err(VmError::AgentFail(cause)));
                }
                _ => {
                    self.complete_front(Ok(AgentReply {
                        code: frame.code,
                        payload: frame.payload,
                    }));
                }
            }
        }
    }

    fn complete_front(&self, result: VmResult<AgentReply>) {
        let waiter = self.waiters.lock().pop_front();
        match waiter {
            Some(waiter) => {
                if waiter.tx.send(result).is_err() {
                    // Caller timed out or went away; the reply is stale.
                    tracing::debug!(code = %waiter.code, "discarding reply for abandoned request");
                }
            }
            None => {
                tracing::warn!("discarding unexpected agent reply with no outstanding request");
            }
        }
    }

    /// Resolve every outstanding request with `Interrupted`. Called when
    /// the VM dies or the sandbox tears down.
    pub fn cancel_all(&self, reason: &str) {
        let drained: Vec<Waiter> = self.waiters.lock().drain(..).collect();
        for waiter in drained {
            let _ = waiter
                .tx
                .send(Err(VmError::Interrupted(reason.to_string())));
        }
    }

    /// Close deliberately: poison without raising a fault event.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.poisoned.store(true, Ordering::SeqCst);
        self.cancel_all("agent channel closed");
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Send a request and wait for its FIFO-matched reply.
    pub async fn call(&self, code: AgentCode, payload: Vec<u8>) -> VmResult<AgentReply> {
        self.call_with_deadline(code, payload, REQUEST_TIMEOUT).await
    }

    pub async fn call_with_deadline(
        &self,
        code: AgentCode,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> VmResult<AgentReply> {
        if self.is_poisoned() {
            return Err(VmError::AgentFail("agent channel poisoned".to_string()));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        // Enqueue the waiter and write the frame under one writer lock so
        // concurrent callers keep queue order equal to wire order.
        {
            let mut writer = self.writer.lock().await;
            self.waiters.lock().push_back(Waiter { seq, code, tx });
            let msg = AgentMessage::new(code, payload);
            if let Err(e) = write_frame(&mut *writer, &msg).await {
                self.waiters.lock().retain(|w| w.seq != seq);
                self.poisoned.store(true, Ordering::SeqCst);
                self.cancel_all("agent write failed");
                return Err(e);
            }
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(VmError::Interrupted(format!("{} abandoned", code))),
            Err(_) => {
                // Drop our waiter so later replies realign with later
                // requests; if the reply does arrive it is discarded.
                self.waiters.lock().retain(|w| w.seq != seq);
                Err(VmError::Timeout(format!("{} reply", code)))
            }
        }
    }

    /// Spawn the liveness task. Three consecutive ping misses post
    /// `VmTimeout`; any other failure ends the task quietly (the reader
    /// reports transport faults itself).
    pub fn start_keepalive(self: &Arc<Self>, interval: Duration, hub: EventHub) {
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            let mut misses = 0u32;
            loop {
                tokio::time::sleep(interval).await;
                if channel.is_poisoned() || hub.is_closed() {
                    return;
                }
                match channel
                    .call_with_deadline(AgentCode::Ping, Vec::new(), interval)
                    .await
                {
                    Ok(_) => misses = 0,
                    Err(VmError::Timeout(_)) => {
                        misses += 1;
                        tracing::warn!(misses, "agent ping missed");
                        if misses >= KEEPALIVE_MISS_LIMIT {
                            let _ = hub.post(VmEvent::VmTimeout);
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Typed operations
    // ------------------------------------------------------------------

    async fn call_json<T: Serialize>(&self, code: AgentCode, body: &T) -> VmResult<AgentReply> {
        self.call(code, serde_json::to_vec(body)?).await
    }

    pub async fn ping(&self) -> VmResult<()> {
        self.call(AgentCode::Ping, Vec::new()).await.map(|_| ())
    }

    pub async fn start_pod(&self, pod: &StartPodMessage) -> VmResult<()> {
        self.call_json(AgentCode::StartPod, pod).await.map(|_| ())
    }

    pub async fn get_pod(&self) -> VmResult<serde_json::Value> {
        let reply = self.call(AgentCode::GetPod, Vec::new()).await?;
        Ok(serde_json::from_slice(&reply.payload)?)
    }

    pub async fn stop_pod(&self) -> VmResult<()> {
        self.call(AgentCode::StopPod, Vec::new()).await.map(|_| ())
    }

    pub async fn destroy_pod(&self) -> VmResult<()> {
        self.call(AgentCode::DestroyPod, Vec::new()).await.map(|_| ())
    }

    pub async fn new_container(&self, msg: &NewContainerMessage) -> VmResult<()> {
        self.call_json(AgentCode::NewContainer, msg).await.map(|_| ())
    }

    pub async fn kill_container(&self, container: &str, signal: i32) -> VmResult<()> {
        self.call_json(
            AgentCode::KillContainer,
            &KillContainerMessage {
                container: container.to_string(),
                signal,
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn restart_container(&self, container: &str) -> VmResult<()> {
        self.call_json(
            AgentCode::RestartContainer,
            &ContainerRefMessage {
                container: container.to_string(),
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn exec_cmd(&self, container: &str, process: &ProcessSpec) -> VmResult<()> {
        self.call_json(
            AgentCode::ExecCmd,
            &ExecMessage {
                container: container.to_string(),
                process: process.clone(),
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn winsize(&self, container: &str, process: &str, row: u16, column: u16) -> VmResult<()> {
        self.call_json(
            AgentCode::WinSize,
            &WinsizeMessage {
                container: container.to_string(),
                process: process.to_string(),
                row,
                column,
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn write_file(&self, container: &str, path: &str, data: &[u8]) -> VmResult<()> {
        self.call_json(
            AgentCode::WriteFile,
            &FileMessage {
                container: container.to_string(),
                file: path.to_string(),
                data: Some(data.to_vec()),
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn read_file(&self, container: &str, path: &str) -> VmResult<Vec<u8>> {
        let reply = self
            .call_json(
                AgentCode::ReadFile,
                &FileMessage {
                    container: container.to_string(),
                    file: path.to_string(),
                    data: None,
                },
            )
            .await?;
        Ok(reply.payload)
    }

    pub async fn online_cpu_mem(&self) -> VmResult<()> {
        self.call(AgentCode::OnlineCpuMem, Vec::new()).await.map(|_| ())
    }

    pub async fn setup_interface(&self, device: &str, ip: &str, mtu: u32) -> VmResult<()> {
        self.call_json(
            AgentCode::SetupInterface,
            &SetupInterfaceMessage {
                device: device.to_string(),
                ip: ip.to_string(),
                mtu,
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn setup_route(&self, gateway: &str, device: &str) -> VmResult<()> {
        self.call_json(
            AgentCode::SetupRoute,
            &SetupRouteMessage {
                gateway: gateway.to_string(),
                device: device.to_string(),
            },
        )
        .await
        .map(|_| ())
    }

    /// Drain the guest request queue before the hypervisor freezes vcpus.
    ///
    /// The wire has no dedicated pause op; a ping round-trip gives the same
    /// barrier because the guest serves requests in order.
    pub async fn pause_sync(&self) -> VmResult<()> {
        self.ping().await
    }

    /// Confirm the guest is serving again after the hypervisor thawed it.
    pub async fn unpause(&self) -> VmResult<()> {
        self.ping().await
    }
}

impl std::fmt::Debug for AgentChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentChannel")
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

// ----------------------------------------------------------------------
// Wire payloads
// ----------------------------------------------------------------------

/// The frozen pod spec as shipped to the guest: containers and identity,
/// no devices. Devices are announced one by one as they are inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartPodMessage {
    pub id: String,
    pub hostname: String,
    pub share_dir: String,
    pub containers: Vec<ContainerDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewContainerMessage {
    pub container: ContainerDescription,
    /// Rootfs location relative to the share directory, or the guest block
    /// device for block-backed roots.
    pub rootfs: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContainerRefMessage {
    container: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KillContainerMessage {
    container: String,
    signal: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExecMessage {
    container: String,
    process: ProcessSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WinsizeMessage {
    container: String,
    process: String,
    row: u16,
    column: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileMessage {
    container: String,
    file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SetupInterfaceMessage {
    device: String,
    ip: String,
    mtu: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SetupRouteMessage {
    gateway: String,
    device: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    /// Minimal scripted guest: replies ACK to everything except the codes
    /// listed in `drop_once`, which are swallowed a single time.
    async fn run_stub_guest(stream: DuplexStream, drop_once: Vec<AgentCode>) {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let mut to_drop = drop_once;

        write_frame(&mut write_half, &AgentMessage::new(AgentCode::Ready, Vec::new()))
            .await
            .unwrap();

        while let Ok(frame) = read_frame(&mut read_half).await {
            if let Some(pos) = to_drop.iter().position(|c| *c == frame.code) {
                to_drop.remove(pos);
                continue;
            }
            let reply = AgentMessage::new(AgentCode::Ack, Vec::new());
            if write_frame(&mut write_half, &reply).await.is_err() {
                return;
            }
        }
    }

    async fn connect_stub(
        drop_once: Vec<AgentCode>,
    ) -> (
        Arc<AgentChannel>,
        EventHub,
        tokio::sync::mpsc::Receiver<VmEvent>,
    ) {
        let (host, guest) = tokio::io::duplex(64 * 1024);
        tokio::spawn(run_stub_guest(guest, drop_once));
        let (hub, rx) = EventHub::channel();
        let channel = AgentChannel::connect(host, hub.clone(), DIAL_TIMEOUT)
            .await
            .unwrap();
        (channel, hub, rx)
    }

    #[tokio::test]
    async fn test_ready_handshake_and_ping() {
        let (channel, _hub, _rx) = connect_stub(Vec::new()).await;
        channel.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_fifo_matching_over_many_requests() {
        let (channel, _hub, _rx) = connect_stub(Vec::new()).await;
        for _ in 0..32 {
            channel
                .write_file("c1", "/etc/hostname", b"sandbox")
                .await
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_request_times_out_and_channel_recovers() {
        let (channel, _hub, _rx) = connect_stub(vec![AgentCode::WriteFile]).await;

        let err = channel
            .call_with_deadline(
                AgentCode::WriteFile,
                b"{}".to_vec(),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::Timeout(_)));

        // The next request realigns with the reply stream.
        channel.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_error_reply_surfaces_agent_fail() {
        let (host, guest) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (mut read_half, mut write_half) = tokio::io::split(guest);
            write_frame(&mut write_half, &AgentMessage::new(AgentCode::Ready, Vec::new()))
                .await
                .unwrap();
            let _ = read_frame(&mut read_half).await.unwrap();
            write_frame(
                &mut write_half,
                &AgentMessage::new(AgentCode::Error, b"no such container".to_vec()),
            )
            .await
            .unwrap();
        });

        let (hub, _rx) = EventHub::channel();
        let channel = AgentChannel::connect(host, hub, DIAL_TIMEOUT).await.unwrap();

        let err = channel.restart_container("missing").await.unwrap_err();
        assert!(matches!(err, VmError::AgentFail(_)));
    }

    #[tokio::test]
    async fn test_cancel_all_resolves_outstanding_interrupted() {
        // Guest that never replies after READY.
        let (host, guest) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (mut read_half, mut write_half) = tokio::io::split(guest);
            write_frame(&mut write_half, &AgentMessage::new(AgentCode::Ready, Vec::new()))
                .await
                .unwrap();
            loop {
                if read_frame(&mut read_half).await.is_err() {
                    return;
                }
            }
        });

        let (hub, _rx) = EventHub::channel();
        let channel = AgentChannel::connect(host, hub, DIAL_TIMEOUT).await.unwrap();

        let pending = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.ping().await })
        };
        // Let the ping hit the wire before cancelling.
        tokio::time::sleep(Duration::from_millis(50)).await;
        channel.cancel_all("vm exited");

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, VmError::Interrupted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_three_misses_posts_vm_timeout() {
        // Guest that goes silent after READY.
        let (host, guest) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (mut read_half, mut write_half) = tokio::io::split(guest);
            write_frame(&mut write_half, &AgentMessage::new(AgentCode::Ready, Vec::new()))
                .await
                .unwrap();
            loop {
                if read_frame(&mut read_half).await.is_err() {
                    return;
                }
            }
        });

        let (hub, mut rx) = EventHub::channel();
        let channel = AgentChannel::connect(host, hub.clone(), DIAL_TIMEOUT)
            .await
            .unwrap();
        channel.start_keepalive(Duration::from_secs(1), hub);

        let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("keepalive must give up")
            .expect("queue open");
        assert!(matches!(event, VmEvent::VmTimeout));
    }

    #[tokio::test]
    async fn test_handshake_rejects_non_ready_frame() {
        let (host, guest) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (_read_half, mut write_half) = tokio::io::split(guest);
            write_frame(&mut write_half, &AgentMessage::new(AgentCode::Ack, Vec::new()))
                .await
                .unwrap();
        });

        let (hub, _rx) = EventHub::channel();
        let err = AgentChannel::connect(host, hub, DIAL_TIMEOUT)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, VmError::AgentFail(_)));
    }
}
