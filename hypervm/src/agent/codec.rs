//! Framing for the guest init control stream.
//!
//! Every frame is a big-endian 32-bit code, a big-endian 32-bit payload
//! length, then the payload bytes. Codes in the INIT_* space are wire-exact;
//! the guest replies with the request code or with ACK/ERROR.

use hypervm_shared::{VmError, VmResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame payload. Anything larger poisons the
/// channel rather than allocating unbounded memory on a corrupt stream.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Control codes understood by the guest init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AgentCode {
    Reserved = 0,
    StartPod = 1,
    GetPod = 2,
    StopPod = 3,
    DestroyPod = 4,
    RestartContainer = 5,
    ExecCmd = 6,
    FinishCmd = 7,
    Ready = 8,
    Ack = 9,
    Error = 10,
    WinSize = 11,
    Ping = 12,
    FinishPod = 13,
    Next = 14,
    WriteFile = 15,
    ReadFile = 16,
    NewContainer = 17,
    KillContainer = 18,
    OnlineCpuMem = 19,
    SetupInterface = 20,
    SetupRoute = 21,
}

impl AgentCode {
    pub fn from_u32(code: u32) -> Option<Self> {
        use AgentCode::*;
        Some(match code {
            0 => Reserved,
            1 => StartPod,
            2 => GetPod,
            3 => StopPod,
            4 => DestroyPod,
            5 => RestartContainer,
            6 => ExecCmd,
            7 => FinishCmd,
            8 => Ready,
            9 => Ack,
            10 => Error,
            11 => WinSize,
            12 => Ping,
            13 => FinishPod,
            14 => Next,
            15 => WriteFile,
            16 => ReadFile,
            17 => NewContainer,
            18 => KillContainer,
            19 => OnlineCpuMem,
            20 => SetupInterface,
            21 => SetupRoute,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        use AgentCode::*;
        match self {
            Reserved => "INIT_RESERVED",
            StartPod => "INIT_STARTPOD",
            GetPod => "INIT_GETPOD",
            StopPod => "INIT_STOPPOD",
            DestroyPod => "INIT_DESTROYPOD",
            RestartContainer => "INIT_RESTARTCONTAINER",
            ExecCmd => "INIT_EXECCMD",
            FinishCmd => "INIT_FINISHCMD",
            Ready => "INIT_READY",
            Ack => "INIT_ACK",
            Error => "INIT_ERROR",
            WinSize => "INIT_WINSIZE",
            Ping => "INIT_PING",
            FinishPod => "INIT_FINISHPOD",
            Next => "INIT_NEXT",
            WriteFile => "INIT_WRITEFILE",
            ReadFile => "INIT_READFILE",
            NewContainer => "INIT_NEWCONTAINER",
            KillContainer => "INIT_KILLCONTAINER",
            OnlineCpuMem => "INIT_ONLINECPUMEM",
            SetupInterface => "INIT_SETUPINTERFACE",
            SetupRoute => "INIT_SETUPROUTE",
        }
    }
}

impl std::fmt::Display for AgentCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One framed message on the agent stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentMessage {
    pub code: AgentCode,
    pub payload: Vec<u8>,
}

impl AgentMessage {
    pub fn new(code: AgentCode, payload: Vec<u8>) -> Self {
        Self { code, payload }
    }

    /// Serialize into the 8-byte header plus payload form.
    pub fn encode(&self) -> VmResult<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(VmError::Codec(format!(
                "payload of {} exceeds {} bytes",
                self.code,
                MAX_PAYLOAD
            )));
        }
        let mut buf = Vec::with_capacity(8 + self.payload.len());
        buf.extend_from_slice(&(self.code as u32).to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse one complete frame from a byte slice.
    pub fn decode(buf: &[u8]) -> VmResult<Self> {
        if buf.len() < 8 {
            return Err(VmError::Codec(format!("short frame: {} bytes", buf.len())));
        }
        let code = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(VmError::Codec(format!("oversized frame: {} bytes", len)));
        }
        if buf.len() != 8 + len {
            return Err(VmError::Codec(format!(
                "frame length mismatch: header says {}, got {}",
                len,
                buf.len() - 8
            )));
        }
        let code = AgentCode::from_u32(code)
            .ok_or_else(|| VmError::Codec(format!("unknown agent code {}", code)))?;
        Ok(Self {
            code,
            payload: buf[8..].to_vec(),
        })
    }
}

/// Write one frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &AgentMessage,
) -> VmResult<()> {
    let buf = msg.encode()?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame from the stream. EOF before the header yields
/// `AgentFail`; a malformed header yields `Codec`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> VmResult<AgentMessage> {
    let mut header = [0u8; 8];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| VmError::AgentFail(format!("agent stream closed: {}", e)))?;

    let code = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(VmError::Codec(format!("oversized frame: {} bytes", len)));
    }
    let code = AgentCode::from_u32(code)
        .ok_or_else(|| VmError::Codec(format!("unknown agent code {}", code)))?;

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| VmError::AgentFail(format!("agent stream truncated: {}", e)))?;

    Ok(AgentMessage { code, payload })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values_are_exact() {
        assert_eq!(AgentCode::StartPod as u32, 1);
        assert_eq!(AgentCode::GetPod as u32, 2);
        assert_eq!(AgentCode::StopPod as u32, 3);
        assert_eq!(AgentCode::DestroyPod as u32, 4);
        assert_eq!(AgentCode::RestartContainer as u32, 5);
        assert_eq!(AgentCode::ExecCmd as u32, 6);
        assert_eq!(AgentCode::FinishCmd as u32, 7);
        assert_eq!(AgentCode::Ready as u32, 8);
        assert_eq!(AgentCode::Ack as u32, 9);
        assert_eq!(AgentCode::Error as u32, 10);
        assert_eq!(AgentCode::WinSize as u32, 11);
        assert_eq!(AgentCode::Ping as u32, 12);
        assert_eq!(AgentCode::FinishPod as u32, 13);
        assert_eq!(AgentCode::Next as u32, 14);
        assert_eq!(AgentCode::WriteFile as u32, 15);
        assert_eq!(AgentCode::ReadFile as u32, 16);
        assert_eq!(AgentCode::NewContainer as u32, 17);
        assert_eq!(AgentCode::KillContainer as u32, 18);
    }

    #[test]
    fn test_roundtrip() {
        let msg = AgentMessage::new(AgentCode::WriteFile, b"{\"container\":\"c1\"}".to_vec());
        let decoded = AgentMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_roundtrip_empty_payload() {
        let msg = AgentMessage::new(AgentCode::Ping, Vec::new());
        let buf = msg.encode().unwrap();
        assert_eq!(buf.len(), 8);
        assert_eq!(AgentMessage::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(AgentMessage::decode(&[0, 0, 0]).is_err());

        // Unknown code.
        let mut buf = Vec::new();
        buf.extend_from_slice(&99u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        assert!(AgentMessage::decode(&buf).is_err());

        // Header length disagrees with the buffer.
        let mut buf = Vec::new();
        buf.extend_from_slice(&(AgentCode::Ping as u32).to_be_bytes());
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(b"ab");
        assert!(AgentMessage::decode(&buf).is_err());
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let msg = AgentMessage::new(AgentCode::StartPod, b"{\"id\":\"pod-1\"}".to_vec());
        write_frame(&mut client, &msg).await.unwrap();

        let got = read_frame(&mut server).await.unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn test_read_frame_reports_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, VmError::AgentFail(_)));
    }
}
