//! VM console forwarding.
//!
//! The console socket speaks telnet framing and starts with firmware and
//! kernel boot noise. The pump first offers the socket to an external log
//! daemon via a one-shot JSON handshake; when that fails it decodes the
//! stream in process, drops the boot prologue, and forwards each line to
//! the log sink. Terminates on EOF.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use hypervm_shared::{VmError, VmResult};

use crate::layout::VmLayout;

/// Socket of the external console log daemon.
pub const VM_LOGD_SOCK: &str = "/var/run/vmlogd.sock";

/// Lines of boot noise dropped before forwarding begins.
pub const CONSOLE_SKIP_LINES: u64 = 128;

/// One-shot handshake message exchanged with the log daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Path")]
    pub path: String,
}

/// Ask the log daemon to take over the console at `console_path`.
pub async fn enable_log_daemon(
    daemon_sock: &Path,
    vm_id: &str,
    console_path: &Path,
) -> VmResult<()> {
    let mut conn = tokio::net::UnixStream::connect(daemon_sock).await?;

    let request = LogMessage {
        message: "start".to_string(),
        id: vm_id.to_string(),
        path: console_path.to_string_lossy().into_owned(),
    };
    conn.write_all(&serde_json::to_vec(&request)?).await?;

    // The daemon answers with a single JSON object and keeps the console.
    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 256];
    let reply: LogMessage = loop {
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            return Err(VmError::AgentFail(
                "log daemon closed during handshake".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Ok(msg) = serde_json::from_slice(&buf) {
            break msg;
        }
        if buf.len() > 4096 {
            return Err(VmError::Codec("oversized log daemon reply".to_string()));
        }
    };

    if reply.message != "success" || reply.id != vm_id {
        return Err(VmError::AgentFail("log daemon refused console".to_string()));
    }
    Ok(())
}

/// Strips telnet in-band commands from the console byte stream.
#[derive(Debug, Default)]
pub struct TelnetFilter {
    state: TelnetState,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum TelnetState {
    #[default]
    Data,
    /// Saw IAC; next byte is a command.
    Command,
    /// Saw IAC WILL/WONT/DO/DONT; next byte is the option.
    Option,
    /// Inside IAC SB ... IAC SE subnegotiation.
    Subnegotiation,
    /// Saw IAC inside a subnegotiation.
    SubnegotiationCommand,
}

const IAC: u8 = 255;
const SE: u8 = 240;
const SB: u8 = 250;
const WILL: u8 = 251;
const DONT: u8 = 254;

impl TelnetFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte; returns the data byte to keep, if any.
    pub fn push(&mut self, byte: u8) -> Option<u8> {
        match self.state {
            TelnetState::Data => match byte {
                IAC => {
                    self.state = TelnetState::Command;
                    None
                }
                b => Some(b),
            },
            TelnetState::Command => match byte {
                IAC => {
                    // Escaped 0xff data byte.
                    self.state = TelnetState::Data;
                    Some(IAC)
                }
                SB => {
                    self.state = TelnetState::Subnegotiation;
                    None
                }
                b if (WILL..=DONT).contains(&b) => {
                    self.state = TelnetState::Option;
                    None
                }
                _ => {
                    self.state = TelnetState::Data;
                    None
                }
            },
            TelnetState::Option => {
                self.state = TelnetState::Data;
                None
            }
            TelnetState::Subnegotiation => {
                if byte == IAC {
                    self.state = TelnetState::SubnegotiationCommand;
                }
                None
            }
            TelnetState::SubnegotiationCommand => {
                self.state = if byte == SE {
                    TelnetState::Data
                } else {
                    TelnetState::Subnegotiation
                };
                None
            }
        }
    }
}

/// Folds the console byte stream into CR/LF-delimited lines.
///
/// A lone CR emits; a CR followed by LF emits once.
#[derive(Debug, Default)]
pub struct LineDecoder {
    line: Vec<u8>,
    cr: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one data byte; returns a completed line when one ends.
    pub fn push(&mut self, byte: u8) -> Option<String> {
        let emit = match byte {
            b'\n' => {
                let emit = !self.cr;
                self.cr = false;
                emit
            }
            b'\r' => {
                self.cr = true;
                true
            }
            b => {
                self.cr = false;
                self.line.push(b);
                false
            }
        };
        if emit {
            let line = String::from_utf8_lossy(&self.line).into_owned();
            self.line.clear();
            Some(line)
        } else {
            None
        }
    }
}

/// Decode the console stream and hand each line to `on_line` with its
/// 0-based index. Returns at EOF.
pub async fn pump_lines<R>(reader: R, mut on_line: impl FnMut(u64, String)) -> VmResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = reader;
    let mut filter = TelnetFilter::new();
    let mut decoder = LineDecoder::new();
    let mut count = 0u64;
    let mut buf = [0u8; 512];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) => return Err(e.into()),
        };
        for &byte in &buf[..n] {
            if let Some(data) = filter.push(byte)
                && let Some(line) = decoder.push(data)
            {
                on_line(count, line);
                count += 1;
            }
        }
    }
}

/// Background console watcher for one sandbox.
///
/// Prefers the external log daemon; falls back to in-process decoding with
/// the boot prologue dropped at trace level.
pub fn spawn_console_watcher(vm_id: String, layout: VmLayout) {
    tokio::spawn(async move {
        watch_console(&vm_id, &layout, Path::new(VM_LOGD_SOCK)).await;
    });
}

pub(crate) async fn watch_console(vm_id: &str, layout: &VmLayout, daemon_sock: &Path) {
    let console_path: PathBuf = layout.console_sock();

    match enable_log_daemon(daemon_sock, vm_id, &console_path).await {
        Ok(()) => {
            tracing::info!(vm_id = %vm_id, "console handed to log daemon");
            return;
        }
        Err(e) => {
            tracing::debug!(vm_id = %vm_id, "log daemon unavailable: {}", e);
        }
    }

    let stream = match tokio::net::UnixStream::connect(&console_path).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(vm_id = %vm_id, "console connect failed: {}", e);
            return;
        }
    };

    let result = pump_lines(stream, |index, line| {
        if index < CONSOLE_SKIP_LINES {
            tracing::trace!(vm_id = %vm_id, "[CNL] {}", line);
        } else {
            tracing::debug!(vm_id = %vm_id, "[CNL] {}", line);
        }
    })
    .await;

    match result {
        Ok(()) => tracing::debug!(vm_id = %vm_id, "console output end"),
        Err(e) => tracing::warn!(vm_id = %vm_id, "console pump failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_line_decoder_lf_and_crlf() {
        let mut decoder = LineDecoder::new();
        let mut lines = Vec::new();
        for byte in b"one\ntwo\r\nthree\rfour\n" {
            if let Some(line) = decoder.push(*byte) {
                lines.push(line);
            }
        }
        // CRLF emits once; a lone CR emits by itself.
        assert_eq!(lines, vec!["one", "two", "three", "four"]);
    }

    #[test]
    fn test_telnet_filter_strips_negotiation() {
        let mut filter = TelnetFilter::new();
        // IAC WILL ECHO, then "hi", then IAC SB ... IAC SE, then "!".
        let input = [255, 251, 1, b'h', b'i', 255, 250, 24, 0, 255, 240, b'!'];
        let out: Vec<u8> = input.iter().filter_map(|b| filter.push(*b)).collect();
        assert_eq!(out, b"hi!");
    }

    #[test]
    fn test_telnet_filter_escaped_iac() {
        let mut filter = TelnetFilter::new();
        let out: Vec<u8> = [255u8, 255, 7].iter().filter_map(|b| filter.push(*b)).collect();
        assert_eq!(out, vec![255, 7]);
    }

    #[tokio::test]
    async fn test_pump_counts_lines_and_ends_on_eof() {
        let (mut tx, rx) = tokio::io::duplex(4096);

        let writer = tokio::spawn(async move {
            for i in 0..200 {
                tx.write_all(format!("line {}\r\n", i).as_bytes()).await.unwrap();
            }
            // tx dropped: EOF.
        });

        let mut seen = Vec::new();
        pump_lines(rx, |index, line| seen.push((index, line)))
            .await
            .unwrap();
        writer.await.unwrap();

        assert_eq!(seen.len(), 200);
        assert_eq!(seen[0], (0, "line 0".to_string()));
        assert_eq!(seen[199].0, 199);
        // The watcher drops everything below this threshold.
        assert!(CONSOLE_SKIP_LINES < 200);
    }

    #[tokio::test]
    async fn test_log_daemon_handshake() {
        let dir = tempfile::TempDir::new().unwrap();
        let sock = dir.path().join("vmlogd.sock");
        let listener = tokio::net::UnixListener::bind(&sock).unwrap();

        let daemon = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = conn.read(&mut buf).await.unwrap();
            let request: LogMessage = serde_json::from_slice(&buf[..n]).unwrap();
            assert_eq!(request.message, "start");
            let reply = LogMessage {
                message: "success".to_string(),
                id: request.id,
                path: request.path,
            };
            conn.write_all(&serde_json::to_vec(&reply).unwrap())
                .await
                .unwrap();
        });

        enable_log_daemon(&sock, "vm-test", Path::new("/tmp/console.sock"))
            .await
            .unwrap();
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_log_daemon_wrong_id_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let sock = dir.path().join("vmlogd.sock");
        let listener = tokio::net::UnixListener::bind(&sock).unwrap();

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = conn.read(&mut buf).await.unwrap();
            let reply = LogMessage {
                message: "success".to_string(),
                id: "someone-else".to_string(),
                path: String::new(),
            };
            conn.write_all(&serde_json::to_vec(&reply).unwrap())
                .await
                .unwrap();
        });

        let err = enable_log_daemon(&sock, "vm-test", Path::new("/tmp/console.sock"))
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::AgentFail(_)));
    }
}
