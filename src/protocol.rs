//! Wire protocol between inference client and engine host.
//!
//! Every message is one frame:
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────┐
//! │ body length (u64 LE) │ JSON body (ClientMessage or  │
//! │       8 bytes        │ ServerMessage, tag "type")   │
//! └──────────────────────┴──────────────────────────────┘
//! ```
//!
//! A session is strictly request/response:
//!
//! ```text
//! client                          server
//!   │ Hello{version}          ──►   │
//!   │                         ◄──   │ Hello{version, backend}
//!   │ Execute{request}        ──►   │
//!   │                         ◄──   │ Accepted{request_id}
//!   │ Status{request_id}      ──►   │   (repeat until completed/failed)
//!   │                         ◄──   │ Status{state}
//!   │ FetchResult{request_id} ──►   │
//!   │                         ◄──   │ Result{outputs} | Error{message}
//!   │ Goodbye                 ──►   │
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::{EncryptionConfig, TensorDirective};
use crate::packing::{PackedBatch, PackingMeta};
use crate::slots::SlotVector;

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 34000;
/// Largest accepted frame body.
pub const MAX_FRAME_BYTES: u64 = 1 << 30;

// =============================================================================
// Request / result
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("request has no tensors")]
    EmptyRequest,
    #[error("batch size must be non-zero")]
    EmptyBatch,
    #[error("tensor '{tensor}' has batch size {actual}, request batch size is {expected}")]
    BatchSizeMismatch {
        tensor: String,
        expected: usize,
        actual: usize,
    },
    #[error("tensor '{tensor}' packed with factor {actual}, config requires {expected}")]
    PackingFactorMismatch {
        tensor: String,
        expected: usize,
        actual: usize,
    },
    #[error("tensor '{tensor}' needs {required} slots per ciphertext, parameters provide {capacity}")]
    SlotCapacityExceeded {
        tensor: String,
        required: usize,
        capacity: usize,
    },
    #[error("tensor '{0}' added twice")]
    DuplicateTensor(String),
}

/// One inference request: packed tensors plus the frozen configuration
/// they were packed under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub batch_size: usize,
    pub tensors: BTreeMap<String, SlotVector>,
    pub packing: BTreeMap<String, PackingMeta>,
    pub directives: BTreeMap<String, TensorDirective>,
    pub parameters: BTreeMap<String, String>,
    #[serde(skip)]
    config: Option<Arc<EncryptionConfig>>,
}

impl InferenceRequest {
    pub fn new(batch_size: usize, config: Arc<EncryptionConfig>) -> Self {
        Self {
            batch_size,
            tensors: BTreeMap::new(),
            packing: BTreeMap::new(),
            directives: config.directives().clone(),
            parameters: config.to_parameter_map(),
            config: Some(config),
        }
    }

    /// Config the request was built from. `None` once decoded off the wire.
    pub fn config(&self) -> Option<&Arc<EncryptionConfig>> {
        self.config.as_ref()
    }

    /// Add a packed tensor, checking it against the request and config.
    pub fn with_tensor(
        mut self,
        name: impl Into<String>,
        packed: PackedBatch,
    ) -> Result<Self, RequestError> {
        let name = name.into();
        if self.tensors.contains_key(&name) {
            return Err(RequestError::DuplicateTensor(name));
        }
        if packed.meta.batch_size != self.batch_size {
            return Err(RequestError::BatchSizeMismatch {
                tensor: name,
                expected: self.batch_size,
                actual: packed.meta.batch_size,
            });
        }
        if let Some(config) = &self.config {
            let expected = config.packing_factor();
            if packed.meta.factor != expected {
                return Err(RequestError::PackingFactorMismatch {
                    tensor: name,
                    expected: expected.value(),
                    actual: packed.meta.factor.value(),
                });
            }
            // Batch-axis packing puts one element of every example (per
            // lane) into each ciphertext.
            let directive = config.directive(&name);
            if config.pack_data() || directive == TensorDirective::Packed {
                let required = packed.meta.batch_size / packed.meta.factor.value();
                let capacity = config.slot_capacity();
                if required > capacity {
                    return Err(RequestError::SlotCapacityExceeded {
                        tensor: name,
                        required,
                        capacity,
                    });
                }
            }
            self.directives.entry(name.clone()).or_insert(directive);
        }
        self.packing.insert(name.clone(), packed.meta);
        self.tensors.insert(name, packed.slots);
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        if self.batch_size == 0 {
            return Err(RequestError::EmptyBatch);
        }
        if self.tensors.is_empty() {
            return Err(RequestError::EmptyRequest);
        }
        Ok(())
    }
}

/// Raw outputs of a completed request, keyed by output tensor name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub request_id: String,
    pub outputs: BTreeMap<String, SlotVector>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Messages
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello { protocol_version: u32 },
    Execute { request: InferenceRequest },
    Status { request_id: String },
    FetchResult { request_id: String },
    Goodbye,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Hello { .. } => "hello",
            ClientMessage::Execute { .. } => "execute",
            ClientMessage::Status { .. } => "status",
            ClientMessage::FetchResult { .. } => "fetch_result",
            ClientMessage::Goodbye => "goodbye",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello {
        protocol_version: u32,
        backend: String,
    },
    Accepted {
        request_id: String,
    },
    Status {
        request_id: String,
        state: JobState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Result(InferenceResult),
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Hello { .. } => "hello",
            ServerMessage::Accepted { .. } => "accepted",
            ServerMessage::Status { .. } => "status",
            ServerMessage::Result(_) => "result",
            ServerMessage::Error { .. } => "error",
        }
    }
}

// =============================================================================
// Framing
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: u64, max: u64 },
    #[error("invalid frame body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("peer closed the connection")]
    Closed,
}

/// Serialize `message` into a complete frame (header + body).
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(message)?;
    let len = body.len() as u64;
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge {
            len,
            max: MAX_FRAME_BYTES,
        });
    }
    let mut frame = Vec::with_capacity(8 + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. A clean EOF before the header is [`FrameError::Closed`].
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 8];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::Closed)
        }
        Err(e) => return Err(e.into()),
    }
    let len = u64::from_le_bytes(header);
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge {
            len,
            max: MAX_FRAME_BYTES,
        });
    }
    // Grow with the bytes that actually arrive; the header is untrusted.
    let mut body = Vec::new();
    (&mut *reader).take(len).read_to_end(&mut body).await?;
    if (body.len() as u64) < len {
        return Err(FrameError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("frame body ended after {} of {len} bytes", body.len()),
        )));
    }
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncryptionConfigBuilder;
    use crate::layout::{FlattenOrder, PackingFactor};
    use crate::packing::BatchPacker;
    use crate::params::ParameterSource;
    use ndarray::Array2;

    fn config(complex: bool) -> Arc<EncryptionConfig> {
        EncryptionConfigBuilder::new()
            .input_tensor("x")
            .encrypt_server_data(true)
            .complex_packing(complex)
            .build_shared()
            .unwrap()
    }

    fn packed(batch: usize, factor: PackingFactor) -> PackedBatch {
        let data = Array2::from_shape_fn((batch, 4), |(i, j)| (i * 4 + j) as f64);
        BatchPacker::new(FlattenOrder::RowMajor, factor)
            .pack(&data)
            .unwrap()
    }

    #[test]
    fn test_request_collects_tensors_and_directives() {
        let request = InferenceRequest::new(2, config(false))
            .with_tensor("x", packed(2, PackingFactor::One))
            .unwrap();
        request.validate().unwrap();
        assert_eq!(request.tensors["x"].len(), 8);
        assert_eq!(request.directives["x"], TensorDirective::Encrypt);
        assert_eq!(request.packing["x"].batch_size, 2);
        assert_eq!(request.parameters["encrypt_server_data"], "True");
        assert!(request.config().is_some());
    }

    #[test]
    fn test_request_rejects_mismatches() {
        let err = InferenceRequest::new(4, config(false))
            .with_tensor("x", packed(2, PackingFactor::One))
            .unwrap_err();
        assert!(matches!(err, RequestError::BatchSizeMismatch { expected: 4, actual: 2, .. }));

        let err = InferenceRequest::new(2, config(true))
            .with_tensor("x", packed(2, PackingFactor::One))
            .unwrap_err();
        assert!(matches!(err, RequestError::PackingFactorMismatch { expected: 2, actual: 1, .. }));

        let err = InferenceRequest::new(2, config(false))
            .with_tensor("x", packed(2, PackingFactor::One))
            .unwrap()
            .with_tensor("x", packed(2, PackingFactor::One))
            .unwrap_err();
        assert_eq!(err, RequestError::DuplicateTensor("x".into()));

        assert_eq!(
            InferenceRequest::new(2, config(false)).validate(),
            Err(RequestError::EmptyRequest)
        );
        assert_eq!(
            InferenceRequest::new(0, config(false)).validate(),
            Err(RequestError::EmptyBatch)
        );
    }

    #[test]
    fn test_slot_capacity_enforced_for_packed_tensors() {
        // Default parameters: 1024-degree ring, 512 slots.
        let config = EncryptionConfigBuilder::new()
            .encryption_parameters(ParameterSource::Default)
            .packed("x")
            .build_shared()
            .unwrap();
        let ok = InferenceRequest::new(512, config.clone()).with_tensor("x", packed(512, PackingFactor::One));
        assert!(ok.is_ok());
        let err = InferenceRequest::new(513, config.clone())
            .with_tensor("x", packed(513, PackingFactor::One))
            .unwrap_err();
        assert!(matches!(
            err,
            RequestError::SlotCapacityExceeded { required: 513, capacity: 512, .. }
        ));
        // Unpacked tensors are not limited by slot capacity.
        let config = EncryptionConfigBuilder::new().plain("y").build_shared().unwrap();
        assert!(InferenceRequest::new(513, config)
            .with_tensor("y", packed(513, PackingFactor::One))
            .is_ok());
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        let request = InferenceRequest::new(2, config(false))
            .with_tensor("x", packed(2, PackingFactor::One))
            .unwrap();
        let msg = ClientMessage::Execute { request };
        write_frame(&mut a, &msg).await.unwrap();
        write_frame(&mut a, &ClientMessage::Goodbye).await.unwrap();

        let got: ClientMessage = read_frame(&mut b).await.unwrap();
        match (&got, &msg) {
            (ClientMessage::Execute { request: r }, ClientMessage::Execute { request: s }) => {
                assert_eq!(r.tensors, s.tensors);
                assert_eq!(r.packing, s.packing);
                assert_eq!(r.parameters, s.parameters);
                assert!(r.config().is_none());
            }
            _ => panic!("unexpected message {got:?}"),
        }
        let got: ClientMessage = read_frame(&mut b).await.unwrap();
        assert_eq!(got, ClientMessage::Goodbye);

        drop(a);
        let err = read_frame::<_, ClientMessage>(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::Closed));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_BYTES + 1).to_le_bytes()).await.unwrap();
        let err = read_frame::<_, ServerMessage>(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn test_truncated_body_under_large_header() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&MAX_FRAME_BYTES.to_le_bytes()).await.unwrap();
        a.write_all(b"{\"type\":").await.unwrap();
        drop(a);
        let err = read_frame::<_, ServerMessage>(&mut b).await.unwrap_err();
        match err {
            FrameError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_server_message_json_tags() {
        let msg = ServerMessage::Status {
            request_id: "r".into(),
            state: JobState::Running,
            error: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["state"], "running");
        assert!(json.get("error").is_none());

        let result = ServerMessage::Result(InferenceResult {
            request_id: "r".into(),
            outputs: BTreeMap::from([("y".to_string(), SlotVector::Real(vec![1.0]))]),
        });
        let frame = encode_frame(&result).unwrap();
        let len = u64::from_le_bytes(frame[..8].try_into().unwrap());
        assert_eq!(len as usize, frame.len() - 8);
        let back: ServerMessage = serde_json::from_slice(&frame[8..]).unwrap();
        assert_eq!(back, result);
    }
}
