//! Control channel wire protocol.
//!
//! Hand-encoded, length-delimited request/response messages exchanged over
//! the TCP control socket. The request kind is a closed tag: unknown tags
//! are rejected at decode time, and dispatch over the decoded kind happens
//! against a router constructed once at startup (see
//! [`control`](crate::transport::control)).
//!
//! Payloads are JSON-serialized structs, so the frontend can evolve its
//! parameter set without wire-format changes.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::Direction;
use crate::error::{IsiError, IsiResult};

/// Upper bound on a single wire message; anything larger is a protocol
/// violation, not a legitimate command.
const MAX_MESSAGE_BYTES: u32 = 1024 * 1024;

/// Closed set of control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RequestKind {
    /// Begin an acquisition run.
    StartAcquisition = 0,
    /// Abort the active acquisition run.
    AbortAcquisition = 1,
    /// Fetch the current status snapshot. Idempotent.
    GetStatus = 2,
    /// Start analysis of a persisted session.
    StartAnalysis = 3,
    /// Fetch the analysis status. Idempotent.
    GetAnalysisStatus = 4,
    /// Liveness probe. Idempotent.
    Heartbeat = 5,
    /// Switch this connection into a status broadcast stream.
    SubscribeStatus = 6,
    /// Switch this connection into a health broadcast stream.
    SubscribeHealth = 7,
}

impl RequestKind {
    /// Decode the wire tag.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RequestKind::StartAcquisition),
            1 => Some(RequestKind::AbortAcquisition),
            2 => Some(RequestKind::GetStatus),
            3 => Some(RequestKind::StartAnalysis),
            4 => Some(RequestKind::GetAnalysisStatus),
            5 => Some(RequestKind::Heartbeat),
            6 => Some(RequestKind::SubscribeStatus),
            7 => Some(RequestKind::SubscribeHealth),
            _ => None,
        }
    }

    /// Whether a caller may retry this command after a transport fault.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            RequestKind::GetStatus | RequestKind::GetAnalysisStatus | RequestKind::Heartbeat
        )
    }
}

/// Response status tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResponseStatus {
    /// Command executed.
    Success = 0,
    /// Command failed; `error_message` carries the reason.
    Error = 1,
    /// Malformed or unknown request.
    InvalidRequest = 2,
    /// The handler missed its reply deadline.
    Timeout = 3,
}

impl ResponseStatus {
    /// Decode the wire tag.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ResponseStatus::Success),
            1 => Some(ResponseStatus::Error),
            2 => Some(ResponseStatus::InvalidRequest),
            3 => Some(ResponseStatus::Timeout),
            _ => None,
        }
    }
}

/// A single control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    /// Caller-assigned correlation id echoed in the response.
    pub request_id: u32,
    /// Command tag.
    pub kind: RequestKind,
    /// JSON payload (may be empty).
    pub payload: Vec<u8>,
    /// Sender wall-clock stamp in milliseconds.
    pub timestamp: u64,
}

impl ControlRequest {
    /// Build a request stamped with the current wall clock.
    pub fn new(request_id: u32, kind: RequestKind, payload: Vec<u8>) -> Self {
        Self {
            request_id,
            kind,
            payload,
            timestamp: Utc::now().timestamp_millis() as u64,
        }
    }

    /// Encode to the wire layout:
    /// `kind u8 | request_id u32 | payload_len u32 | payload | timestamp u64`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(17 + self.payload.len());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    /// Decode from the wire layout.
    pub fn decode(data: &[u8]) -> IsiResult<Self> {
        if data.len() < 17 {
            return Err(IsiError::Transport(
                "insufficient data for control request".into(),
            ));
        }

        let kind = RequestKind::from_u8(data[0])
            .ok_or_else(|| IsiError::Transport(format!("unknown request kind {}", data[0])))?;
        let request_id = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
        let payload_len = u32::from_le_bytes([data[5], data[6], data[7], data[8]]) as usize;

        if data.len() != 17 + payload_len {
            return Err(IsiError::Transport("request payload size mismatch".into()));
        }

        let payload = data[9..9 + payload_len].to_vec();
        let timestamp = u64::from_le_bytes(
            data[9 + payload_len..17 + payload_len]
                .try_into()
                .map_err(|_| IsiError::Transport("truncated request timestamp".into()))?,
        );

        Ok(Self {
            request_id,
            kind,
            payload,
            timestamp,
        })
    }
}

/// A single control response. Every request receives exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    /// Correlation id copied from the request.
    pub request_id: u32,
    /// Outcome tag.
    pub status: ResponseStatus,
    /// JSON payload (may be empty).
    pub payload: Vec<u8>,
    /// Reason string when `status != Success`.
    pub error_message: String,
    /// Responder wall-clock stamp in milliseconds.
    pub timestamp: u64,
}

impl ControlResponse {
    /// Build a success response carrying `payload`.
    pub fn success(request_id: u32, payload: Vec<u8>) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Success,
            payload,
            error_message: String::new(),
            timestamp: Utc::now().timestamp_millis() as u64,
        }
    }

    /// Build an error response with a structured reason.
    pub fn error(request_id: u32, status: ResponseStatus, message: String) -> Self {
        Self {
            request_id,
            status,
            payload: Vec::new(),
            error_message: message,
            timestamp: Utc::now().timestamp_millis() as u64,
        }
    }

    /// Encode to the wire layout:
    /// `status u8 | request_id u32 | payload_len u32 | payload |
    ///  error_len u32 | error | timestamp u64`.
    pub fn encode(&self) -> Vec<u8> {
        let error_bytes = self.error_message.as_bytes();
        let mut buf = Vec::with_capacity(21 + self.payload.len() + error_bytes.len());
        buf.push(self.status as u8);
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&(error_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(error_bytes);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    /// Decode from the wire layout.
    pub fn decode(data: &[u8]) -> IsiResult<Self> {
        if data.len() < 21 {
            return Err(IsiError::Transport(
                "insufficient data for control response".into(),
            ));
        }

        let status = ResponseStatus::from_u8(data[0])
            .ok_or_else(|| IsiError::Transport(format!("unknown response status {}", data[0])))?;
        let request_id = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
        let payload_len = u32::from_le_bytes([data[5], data[6], data[7], data[8]]) as usize;

        if data.len() < 13 + payload_len {
            return Err(IsiError::Transport("response payload size mismatch".into()));
        }
        let payload = data[9..9 + payload_len].to_vec();

        let error_off = 9 + payload_len;
        let error_len = u32::from_le_bytes(
            data[error_off..error_off + 4]
                .try_into()
                .map_err(|_| IsiError::Transport("truncated error length".into()))?,
        ) as usize;

        if data.len() != error_off + 4 + error_len + 8 {
            return Err(IsiError::Transport("response size mismatch".into()));
        }
        let error_message = String::from_utf8(data[error_off + 4..error_off + 4 + error_len].to_vec())
            .map_err(|_| IsiError::Transport("error message is not UTF-8".into()))?;

        let ts_off = error_off + 4 + error_len;
        let timestamp = u64::from_le_bytes(
            data[ts_off..ts_off + 8]
                .try_into()
                .map_err(|_| IsiError::Transport("truncated response timestamp".into()))?,
        );

        Ok(Self {
            request_id,
            status,
            payload,
            error_message,
            timestamp,
        })
    }
}

/// Parameters accepted by `StartAcquisition`. Unset fields fall back to the
/// engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartAcquisitionParams {
    /// Override the configured cycle count.
    #[serde(default)]
    pub cycles: Option<u32>,
    /// Override the configured direction ordering.
    #[serde(default)]
    pub directions: Option<Vec<Direction>>,
}

/// Parameters accepted by `StartAnalysis`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartAnalysisParams {
    /// Identifier of the persisted session to analyze.
    pub session_id: String,
}

/// JSON body carried by every successful command response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    /// Whether the command succeeded.
    pub success: bool,
    /// Command-specific result document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Structured error when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

/// Structured error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyError {
    /// Stable reason code (see `IsiError::reason_code`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl CommandReply {
    /// Build a success reply with a result document.
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Build a failure reply from an engine error.
    pub fn err(error: &IsiError) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(ReplyError {
                code: error.reason_code().to_string(),
                message: error.to_string(),
            }),
        }
    }
}

/// Write one length-delimited message to the stream.
pub async fn send_message<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> IsiResult<()> {
    if body.len() as u32 > MAX_MESSAGE_BYTES {
        return Err(IsiError::Transport(format!(
            "outgoing message of {} bytes exceeds limit",
            body.len()
        )));
    }
    writer
        .write_all(&(body.len() as u32).to_le_bytes())
        .await
        .map_err(|e| IsiError::Transport(format!("write length: {e}")))?;
    writer
        .write_all(body)
        .await
        .map_err(|e| IsiError::Transport(format!("write body: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| IsiError::Transport(format!("flush: {e}")))?;
    Ok(())
}

/// Read one length-delimited message from the stream.
pub async fn recv_message<R: AsyncRead + Unpin>(reader: &mut R) -> IsiResult<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| IsiError::Transport(format!("read length: {e}")))?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_MESSAGE_BYTES {
        return Err(IsiError::Transport(format!(
            "incoming message of {len} bytes exceeds limit"
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| IsiError::Transport(format!("read body: {e}")))?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let params = StartAcquisitionParams {
            cycles: Some(2),
            directions: Some(vec![Direction::LR, Direction::RL]),
        };
        let payload = serde_json::to_vec(&params).unwrap();
        let request = ControlRequest::new(42, RequestKind::StartAcquisition, payload);

        let decoded = ControlRequest::decode(&request.encode()).unwrap();
        assert_eq!(decoded, request);

        let decoded_params: StartAcquisitionParams =
            serde_json::from_slice(&decoded.payload).unwrap();
        assert_eq!(decoded_params.cycles, Some(2));
    }

    #[test]
    fn response_round_trip_with_error() {
        let response = ControlResponse::error(
            7,
            ResponseStatus::Error,
            "camera not ready".to_string(),
        );
        let decoded = ControlResponse::decode(&response.encode()).unwrap();
        assert_eq!(decoded, response);
        assert_eq!(decoded.error_message, "camera not ready");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut bytes = ControlRequest::new(1, RequestKind::Heartbeat, Vec::new()).encode();
        bytes[0] = 0xEE;
        assert!(ControlRequest::decode(&bytes).is_err());
    }

    #[test]
    fn truncated_request_is_rejected() {
        let bytes = ControlRequest::new(1, RequestKind::GetStatus, vec![1, 2, 3]).encode();
        assert!(ControlRequest::decode(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn idempotency_flags() {
        assert!(RequestKind::GetStatus.is_idempotent());
        assert!(RequestKind::Heartbeat.is_idempotent());
        assert!(!RequestKind::StartAcquisition.is_idempotent());
        assert!(!RequestKind::AbortAcquisition.is_idempotent());
    }

    #[tokio::test]
    async fn framed_messages_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        send_message(&mut a, b"hello").await.unwrap();
        let body = recv_message(&mut b).await.unwrap();
        assert_eq!(body, b"hello");
    }
}
