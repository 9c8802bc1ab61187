//! Outbound responses and their emission helpers.
//!
//! Responses are totally ordered on one stream and reflect event-loop
//! observation order. Every send is a `try_send` that tolerates a closed or
//! saturated sink; losing a report must never wedge the loop.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::vmm::PodStats;

/// Externally visible response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseCode {
    #[serde(rename = "E_VM_RUNNING")]
    VmRunning,
    #[serde(rename = "E_VM_SHUTDOWN")]
    VmShutdown,
    #[serde(rename = "E_POD_RUNNING")]
    PodRunning,
    #[serde(rename = "E_POD_STOPPED")]
    PodStopped,
    #[serde(rename = "E_POD_FINISHED")]
    PodFinished,
    #[serde(rename = "E_POD_IP")]
    PodIp,
    #[serde(rename = "E_POD_STATS")]
    PodStats,
    #[serde(rename = "E_OK")]
    Ok,
    #[serde(rename = "E_BUSY")]
    Busy,
    #[serde(rename = "E_BAD_REQUEST")]
    BadRequest,
    #[serde(rename = "E_UNEXPECTED")]
    Unexpected,
    #[serde(rename = "E_FAILED")]
    Failed,
}

impl ResponseCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseCode::VmRunning => "E_VM_RUNNING",
            ResponseCode::VmShutdown => "E_VM_SHUTDOWN",
            ResponseCode::PodRunning => "E_POD_RUNNING",
            ResponseCode::PodStopped => "E_POD_STOPPED",
            ResponseCode::PodFinished => "E_POD_FINISHED",
            ResponseCode::PodIp => "E_POD_IP",
            ResponseCode::PodStats => "E_POD_STATS",
            ResponseCode::Ok => "E_OK",
            ResponseCode::Busy => "E_BUSY",
            ResponseCode::BadRequest => "E_BAD_REQUEST",
            ResponseCode::Unexpected => "E_UNEXPECTED",
            ResponseCode::Failed => "E_FAILED",
        }
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured payload attached to some responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "value")]
pub enum ResponseData {
    Ips(Vec<String>),
    Stats(PodStats),
    ExitCodes(Vec<i64>),
}

/// One item on the outbound response stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmResponse {
    pub vm_id: String,
    pub code: ResponseCode,
    pub cause: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
    /// Monotonically incrementing per-sandbox stamp.
    pub generation: u64,
}

/// Emitter owned by the event loop. Stamps the generation counter onto
/// every outbound response.
pub struct Reporter {
    vm_id: String,
    client: Option<mpsc::Sender<VmResponse>>,
    generation: u64,
}

impl Reporter {
    pub fn new(vm_id: String, client: mpsc::Sender<VmResponse>) -> Self {
        Self {
            vm_id,
            client: Some(client),
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn restore_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Close the response stream. Called after the terminal response;
    /// subscribers observe end-of-stream.
    pub fn close(&mut self) {
        self.client = None;
    }

    fn emit(&mut self, code: ResponseCode, cause: impl Into<String>, data: Option<ResponseData>) {
        let Some(client) = self.client.as_ref() else {
            return;
        };
        self.generation += 1;
        let response = VmResponse {
            vm_id: self.vm_id.clone(),
            code,
            cause: cause.into(),
            data,
            generation: self.generation,
        };
        // A closed or saturated stream only costs the report.
        if let Err(e) = client.try_send(response) {
            tracing::warn!(code = %code, "dropping response: {}", e);
        }
    }

    /// VM booted and the init is accepting commands.
    pub fn vm_running(&mut self) {
        self.emit(ResponseCode::VmRunning, "VM runs", None);
    }

    pub fn vm_shutdown(&mut self) {
        self.emit(ResponseCode::VmShutdown, "VM shut down", None);
    }

    pub fn pod_running(&mut self) {
        self.emit(ResponseCode::PodRunning, "pod is running", None);
    }

    pub fn pod_stopped(&mut self) {
        self.emit(ResponseCode::PodStopped, "all containers stopped", None);
    }

    pub fn pod_finished(&mut self, results: Vec<i64>) {
        self.emit(
            ResponseCode::PodFinished,
            "pod run finished",
            Some(ResponseData::ExitCodes(results)),
        );
    }

    pub fn pod_ip(&mut self, ips: Vec<String>) {
        self.emit(ResponseCode::PodIp, "", Some(ResponseData::Ips(ips)));
    }

    pub fn pod_stats(&mut self, stats: PodStats) {
        self.emit(ResponseCode::PodStats, "", Some(ResponseData::Stats(stats)));
    }

    pub fn success(&mut self, msg: impl Into<String>) {
        self.emit(ResponseCode::Ok, msg, None);
    }

    pub fn busy(&mut self, msg: impl Into<String>) {
        self.emit(ResponseCode::Busy, msg, None);
    }

    pub fn bad_request(&mut self, cause: impl Into<String>) {
        self.emit(ResponseCode::BadRequest, cause, None);
    }

    /// An event arrived in a state that does not accept it.
    pub fn unexpected(&mut self, event: &str, state: &str) {
        self.emit(
            ResponseCode::Unexpected,
            format!("unexpected event {} during {}", event, state),
            None,
        );
    }

    pub fn fault(&mut self, cause: impl Into<String>) {
        self.emit(ResponseCode::Failed, cause, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generation_is_monotonic() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut reporter = Reporter::new("vm-test".into(), tx);

        reporter.vm_running();
        reporter.pod_running();
        reporter.success("ok");

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let third = rx.recv().await.unwrap();
        assert_eq!(first.generation, 1);
        assert_eq!(second.generation, 2);
        assert_eq!(third.generation, 3);
        assert_eq!(first.code, ResponseCode::VmRunning);
        assert_eq!(third.code, ResponseCode::Ok);
    }

    #[tokio::test]
    async fn test_closed_stream_does_not_panic() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut reporter = Reporter::new("vm-test".into(), tx);
        reporter.vm_shutdown();
        assert_eq!(reporter.generation(), 1);
    }

    #[test]
    fn test_code_wire_names() {
        assert_eq!(ResponseCode::VmRunning.as_str(), "E_VM_RUNNING");
        assert_eq!(ResponseCode::Failed.as_str(), "E_FAILED");
        let json = serde_json::to_string(&ResponseCode::PodIp).unwrap();
        assert_eq!(json, "\"E_POD_IP\"");
    }
}
