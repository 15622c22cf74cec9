//! Reference engine host speaking the client protocol.
//!
//! Each connection is served by its own task. Accepted requests become jobs
//! in a shared table and run on the blocking pool, so a slow engine never
//! stalls status polls:
//!
//! ```text
//! Execute ──► Queued ──spawn_blocking──► Running ──► Completed ──FetchResult──────────► (removed)
//!                                            └─────► Failed    ──Status / FetchResult──► (removed)
//! ```
//!
//! Jobs belong to the connection that submitted them. When the session ends
//! (goodbye, disconnect or a broken frame), its uncollected jobs are dropped.
//!
//! The engine itself is pluggable ([`InferenceEngine`]); [`EchoEngine`]
//! returns every input tensor unchanged.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, EncryptionConfig};
use crate::protocol::{
    read_frame, write_frame, ClientMessage, FrameError, InferenceRequest, InferenceResult,
    JobState, ServerMessage, PROTOCOL_VERSION,
};
use crate::slots::SlotVector;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unsupported request: {0}")]
    Unsupported(String),
    #[error("evaluation failed: {0}")]
    Failed(String),
}

/// Computation behind the server. Runs on a blocking thread.
pub trait InferenceEngine: Send + Sync + 'static {
    fn backend(&self) -> &str;

    /// Evaluate a request, producing raw outputs by name.
    fn evaluate(
        &self,
        request: &InferenceRequest,
    ) -> Result<BTreeMap<String, SlotVector>, EngineError>;
}

/// Returns each input tensor as an output of the same name.
#[derive(Debug, Clone, Default)]
pub struct EchoEngine;

impl InferenceEngine for EchoEngine {
    fn backend(&self) -> &str {
        "echo"
    }

    fn evaluate(
        &self,
        request: &InferenceRequest,
    ) -> Result<BTreeMap<String, SlotVector>, EngineError> {
        Ok(request.tensors.clone())
    }
}

struct Job {
    state: JobState,
    started_at: Instant,
    error: Option<String>,
    outputs: Option<BTreeMap<String, SlotVector>>,
}

struct ServerState<E> {
    engine: Arc<E>,
    jobs: RwLock<HashMap<String, Job>>,
}

pub struct InferenceServer<E> {
    state: Arc<ServerState<E>>,
}

impl<E> Clone for InferenceServer<E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<E: InferenceEngine> InferenceServer<E> {
    pub fn new(engine: E) -> Self {
        Self {
            state: Arc::new(ServerState {
                engine: Arc::new(engine),
                jobs: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Accept connections until the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!(
            addr = %listener.local_addr()?,
            backend = self.state.engine.backend(),
            "inference server listening"
        );
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(peer = %peer, "accepted connection");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    warn!(peer = %peer, error = %e, "connection ended with error");
                }
            });
        }
    }

    /// Number of jobs not yet collected.
    pub async fn pending_jobs(&self) -> usize {
        self.state.jobs.read().await.len()
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<(), FrameError> {
        let mut owned = HashSet::new();
        let outcome = self.session(&mut stream, &mut owned).await;
        self.evict(&owned).await;
        outcome
    }

    async fn session(
        &self,
        stream: &mut TcpStream,
        owned: &mut HashSet<String>,
    ) -> Result<(), FrameError> {
        loop {
            let message: ClientMessage = match read_frame(stream).await {
                Ok(message) => message,
                Err(FrameError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            };
            let Some(reply) = self.handle(message).await else {
                return Ok(());
            };
            match &reply {
                ServerMessage::Accepted { request_id } => {
                    owned.insert(request_id.clone());
                }
                ServerMessage::Result(result) => {
                    owned.remove(&result.request_id);
                }
                _ => {}
            }
            write_frame(stream, &reply).await?;
        }
    }

    /// Drop jobs nobody will collect.
    async fn evict(&self, request_ids: &HashSet<String>) {
        if request_ids.is_empty() {
            return;
        }
        let mut jobs = self.state.jobs.write().await;
        let before = jobs.len();
        for id in request_ids {
            jobs.remove(id);
        }
        let dropped = before - jobs.len();
        if dropped > 0 {
            debug!(dropped, "evicted uncollected jobs");
        }
    }

    /// Reply to one message; `None` ends the session.
    pub async fn handle(&self, message: ClientMessage) -> Option<ServerMessage> {
        let reply = match message {
            ClientMessage::Hello { protocol_version } => {
                if protocol_version != PROTOCOL_VERSION {
                    warn!(
                        client = protocol_version,
                        server = PROTOCOL_VERSION,
                        "protocol version mismatch"
                    );
                }
                ServerMessage::Hello {
                    protocol_version: PROTOCOL_VERSION,
                    backend: self.state.engine.backend().to_string(),
                }
            }
            ClientMessage::Execute { request } => match self.submit(request).await {
                Ok(request_id) => ServerMessage::Accepted { request_id },
                Err(message) => ServerMessage::Error { message },
            },
            ClientMessage::Status { request_id } => self.status(&request_id).await,
            ClientMessage::FetchResult { request_id } => self.fetch(&request_id).await,
            ClientMessage::Goodbye => return None,
        };
        Some(reply)
    }

    async fn submit(&self, request: InferenceRequest) -> Result<String, String> {
        request.validate().map_err(|e| e.to_string())?;
        check_request(&request).map_err(|e| e.to_string())?;

        let request_id = Uuid::new_v4().to_string();
        let job = Job {
            state: JobState::Queued,
            started_at: Instant::now(),
            error: None,
            outputs: None,
        };
        self.state.jobs.write().await.insert(request_id.clone(), job);
        info!(
            request_id = %request_id,
            batch_size = request.batch_size,
            tensors = request.tensors.len(),
            "job queued"
        );

        let state = Arc::clone(&self.state);
        let jid = request_id.clone();
        tokio::spawn(async move {
            if let Some(j) = state.jobs.write().await.get_mut(&jid) {
                j.state = JobState::Running;
            }

            let engine = Arc::clone(&state.engine);
            let result = tokio::task::spawn_blocking(move || engine.evaluate(&request)).await;

            let mut jobs = state.jobs.write().await;
            let Some(j) = jobs.get_mut(&jid) else {
                return;
            };
            match result.map(|r| r.and_then(check_outputs)) {
                Ok(Ok(outputs)) => {
                    j.state = JobState::Completed;
                    j.outputs = Some(outputs);
                    info!(
                        request_id = %jid,
                        elapsed_ms = j.started_at.elapsed().as_millis() as u64,
                        "job completed"
                    );
                }
                Ok(Err(e)) => {
                    warn!(request_id = %jid, error = %e, "job failed");
                    j.state = JobState::Failed;
                    j.error = Some(e.to_string());
                }
                Err(e) => {
                    warn!(request_id = %jid, error = %e, "job panicked");
                    j.state = JobState::Failed;
                    j.error = Some(format!("engine task panicked: {e}"));
                }
            }
        });

        Ok(request_id)
    }

    /// A failed job is removed once its error has been reported.
    async fn status(&self, request_id: &str) -> ServerMessage {
        let mut jobs = self.state.jobs.write().await;
        let Some(job) = jobs.get(request_id) else {
            return not_found(request_id);
        };
        let reply = ServerMessage::Status {
            request_id: request_id.to_string(),
            state: job.state,
            error: job.error.clone(),
        };
        if job.state == JobState::Failed {
            jobs.remove(request_id);
        }
        reply
    }

    async fn fetch(&self, request_id: &str) -> ServerMessage {
        let mut jobs = self.state.jobs.write().await;
        let Some(job) = jobs.get(request_id) else {
            return not_found(request_id);
        };
        if !job.state.is_terminal() {
            return ServerMessage::Error {
                message: format!("request '{request_id}' is still {}", job.state),
            };
        }
        let Some(job) = jobs.remove(request_id) else {
            return not_found(request_id);
        };
        match job.outputs {
            Some(outputs) if job.state == JobState::Completed => {
                ServerMessage::Result(InferenceResult {
                    request_id: request_id.to_string(),
                    outputs,
                })
            }
            _ => ServerMessage::Error {
                message: job.error.unwrap_or_else(|| "unknown error".to_string()),
            },
        }
    }
}

fn not_found(request_id: &str) -> ServerMessage {
    ServerMessage::Error {
        message: format!("request '{request_id}' not found"),
    }
}

/// Outputs must survive JSON encoding, which has no NaN or infinity.
fn check_outputs(
    outputs: BTreeMap<String, SlotVector>,
) -> Result<BTreeMap<String, SlotVector>, EngineError> {
    for (name, slots) in &outputs {
        if let Some(index) = slots.first_non_finite() {
            return Err(EngineError::Failed(format!(
                "output '{name}' holds a non-finite value at slot {index}"
            )));
        }
    }
    Ok(outputs)
}

/// Re-validate the configuration a request carries.
fn check_request(request: &InferenceRequest) -> Result<(), ConfigError> {
    let config = EncryptionConfig::from_parameter_map(&request.parameters)?;
    for (name, directive) in &request.directives {
        if config.directive(name) != *directive {
            return Err(ConfigError::InvalidEntry {
                key: name.clone(),
                value: directive.to_string(),
                reason: format!("parameter map says {}", config.directive(name)),
            });
        }
    }
    Ok(())
}
