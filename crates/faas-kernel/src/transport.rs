//! Sandbox host↔guest wire protocol (spec §4.1/§6): a framed,
//! request/response protocol over a reliable byte stream, one connection per
//! sandbox, exactly one in-flight request at a time.
//!
//! Grounded on `cave-kernel`'s `tokio::time::timeout`-around-an-operation
//! idiom (`ProcessSandboxInstance::exec`), generalized from a subprocess call
//! to a length-prefixed socket frame, and on the connect-with-backoff /
//! single-request-in-flight shape of a host↔guest RPC client.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
const DIAL_MAX_ATTEMPTS: u32 = 10;
const DIAL_BACKOFF_UNIT_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Init = 1,
    Exec = 2,
    Response = 3,
    Ping = 4,
    Pong = 5,
}

impl FrameType {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(FrameType::Init),
            2 => Some(FrameType::Exec),
            3 => Some(FrameType::Response),
            4 => Some(FrameType::Ping),
            5 => Some(FrameType::Pong),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    frame_type: u8,
    request_id: String,
    payload: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitPayload {
    pub runtime: String,
    pub handler: String,
    pub code: Option<String>,
    pub binary: Option<Vec<u8>>,
    pub env: std::collections::HashMap<String, String>,
    pub memory_mb: u32,
    pub timeout_seconds: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteResponse {
    pub success: bool,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub memory_used_mb: Option<u32>,
}

/// Reads one length-prefixed frame from `stream`. The 4-byte big-endian
/// length must be non-zero and at most `max_frame_bytes`.
async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S, max_frame_bytes: usize) -> CoreResult<WireFrame> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| CoreError::Transport(format!("truncated length prefix: {e}")))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > max_frame_bytes {
        return Err(CoreError::Transport(format!(
            "frame length {len} out of bounds (max {max_frame_bytes})"
        )));
    }
    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| CoreError::Transport(format!("truncated frame body: {e}")))?;
    serde_json::from_slice(&payload).map_err(|e| CoreError::Transport(format!("malformed frame: {e}")))
}

async fn write_frame<S: AsyncWrite + Unpin>(
    stream: &mut S,
    frame_type: FrameType,
    request_id: &str,
    payload: Value,
) -> CoreResult<()> {
    let wire = WireFrame {
        frame_type: frame_type as u8,
        request_id: request_id.to_string(),
        payload,
    };
    let bytes = serde_json::to_vec(&wire).map_err(|e| CoreError::Transport(e.to_string()))?;
    let len = u32::try_from(bytes.len()).map_err(|_| CoreError::Transport("frame too large".into()))?;
    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| CoreError::Transport(e.to_string()))?;
    stream
        .write_all(&bytes)
        .await
        .map_err(|e| CoreError::Transport(e.to_string()))?;
    stream.flush().await.map_err(|e| CoreError::Transport(e.to_string()))?;
    Ok(())
}

/// Dials `dial` with bounded retry, ~100 ms·i backoff, up to 10 attempts, per
/// spec §4.1.
pub async fn connect_with_backoff<F, Fut, S>(mut dial: F) -> anyhow::Result<S>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::io::Result<S>>,
{
    let mut last_err = None;
    for attempt in 1..=DIAL_MAX_ATTEMPTS {
        match dial().await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                last_err = Some(err);
                tokio::time::sleep(Duration::from_millis(DIAL_BACKOFF_UNIT_MS * attempt as u64)).await;
            }
        }
    }
    Err(anyhow::anyhow!(
        "failed to dial sandbox after {DIAL_MAX_ATTEMPTS} attempts: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

/// The operations a pool/scheduler needs from a live sandbox connection.
/// Implemented generically by `FramedConnection<S>` for any duplex byte
/// stream; a real deployment launches a microVM or container and connects
/// over a unix socket or vsock — that launcher is an external collaborator
/// (spec §1), so this trait is the seam it plugs into.
#[async_trait]
pub trait SandboxConnection: Send + Sync {
    async fn init(&self, payload: InitPayload) -> CoreResult<()>;
    async fn execute(&self, input: Value, timeout: Duration) -> CoreResult<ExecuteResponse>;
    async fn ping(&self) -> CoreResult<bool>;
    async fn close(&self) -> CoreResult<()>;
}

/// Generic framed connection over any `AsyncRead + AsyncWrite` stream.
/// `exec_lock` enforces the single-in-flight-request contract (spec §4.1) —
/// the caller serializes, matching `cave-kernel`'s per-instance `exec_lock`.
pub struct FramedConnection<S> {
    stream: Mutex<S>,
    max_frame_bytes: usize,
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self::with_max_frame_bytes(stream, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(stream: S, max_frame_bytes: usize) -> Self {
        Self {
            stream: Mutex::new(stream),
            max_frame_bytes,
        }
    }

    #[instrument(skip(self, payload))]
    async fn request(&self, frame_type: FrameType, payload: Value) -> CoreResult<WireFrame> {
        let request_id = Uuid::new_v4().to_string();
        let mut stream = self.stream.lock().await;
        write_frame(&mut *stream, frame_type, &request_id, payload).await?;
        let reply = read_frame(&mut *stream, self.max_frame_bytes).await?;
        if reply.request_id != request_id {
            return Err(CoreError::Transport(format!(
                "request id mismatch: sent {request_id}, got {}",
                reply.request_id
            )));
        }
        Ok(reply)
    }
}

#[async_trait]
impl<S> SandboxConnection for FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn init(&self, payload: InitPayload) -> CoreResult<()> {
        let payload_json = serde_json::to_value(&payload).map_err(|e| CoreError::Transport(e.to_string()))?;
        let reply = self.request(FrameType::Init, payload_json).await?;
        let response: ExecuteResponse =
            serde_json::from_value(reply.payload).map_err(|e| CoreError::Transport(e.to_string()))?;
        if !response.success {
            return Err(CoreError::InitFailed(anyhow::anyhow!(
                response.error.unwrap_or_else(|| "sandbox init refused".into())
            )));
        }
        Ok(())
    }

    async fn execute(&self, input: Value, timeout: Duration) -> CoreResult<ExecuteResponse> {
        let fut = self.request(FrameType::Exec, input);
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(reply)) => {
                serde_json::from_value(reply.payload).map_err(|e| CoreError::Transport(e.to_string()))
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(CoreError::Timeout),
        }
    }

    async fn ping(&self) -> CoreResult<bool> {
        let reply = self.request(FrameType::Ping, Value::Null).await?;
        Ok(FrameType::from_u8(reply.frame_type) == Some(FrameType::Pong))
    }

    async fn close(&self) -> CoreResult<()> {
        let mut stream = self.stream.lock().await;
        stream
            .shutdown()
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))
    }
}

/// Launches a fresh sandbox connection for a given runtime tag. The actual
/// microVM/container boot is an external collaborator; implementations of
/// this trait only need to hand back a connected transport.
#[async_trait]
pub trait SandboxLauncher: Send + Sync {
    async fn launch(&self, runtime_tag: &str) -> anyhow::Result<Box<dyn SandboxConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn ping_round_trip_over_duplex_stream() {
        let (client_io, mut server_io) = duplex(4096);
        let client = FramedConnection::new(client_io);

        let server = tokio::spawn(async move {
            let frame = read_frame(&mut server_io, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
            assert_eq!(frame.frame_type, FrameType::Ping as u8);
            write_frame(
                &mut server_io,
                FrameType::Pong,
                &frame.request_id,
                serde_json::json!({"type": 5}),
            )
            .await
            .unwrap();
        });

        let alive = client.ping().await.unwrap();
        assert!(alive);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn truncated_frame_is_transport_error() {
        let (mut client_io, mut server_io) = duplex(4096);
        tokio::spawn(async move {
            // Announce a 10-byte payload, then close without sending it.
            server_io.write_all(&10u32.to_be_bytes()).await.unwrap();
        });
        let err = read_frame(&mut client_io, DEFAULT_MAX_FRAME_BYTES).await.unwrap_err();
        assert!(matches!(err, CoreError::Transport(_)));
    }
}
