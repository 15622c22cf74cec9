//! Inference client: connection lifecycle for one request at a time.
//!
//! ```text
//!            connect/attach        send             poll (pending)
//!   Idle ───────────────► Connected ─────► Sent ─────────────► Polling ─┐
//!    ▲                                      ▲                    │  ▲   │
//!    │ close / timeout / cancel             │ send               │  └───┘
//!    │                                      │                    │ get_results
//!    └───────────────────────────────────── Done ◄───────────────┘ (after completed)
//! ```
//!
//! Waiting is timer driven: [`InferenceClient::wait_for_completion`] polls on
//! a tokio interval and can be bounded by a timeout and a cancellation
//! future. An abandoned wait drops the connection, since the server still
//! owns the request and a reply may be half read.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::channel::{handshake, Channel, ConnectOptions, ConnectionError, TcpChannel};
use crate::protocol::{ClientMessage, InferenceRequest, InferenceResult, JobState, RequestError, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connected,
    Sent,
    Polling,
    Done,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientState::Idle => "idle",
            ClientState::Connected => "connected",
            ClientState::Sent => "sent",
            ClientState::Polling => "polling",
            ClientState::Done => "done",
        };
        f.write_str(s)
    }
}

/// Outcome of a single [`InferenceClient::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Pending,
    Completed,
}

/// How [`InferenceClient::wait_for_completion`] polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Give up after this long; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("invalid request: {0}")]
    Request(#[from] RequestError),
    #[error("client is not connected")]
    NotConnected,
    #[error("a request is already in flight")]
    RequestInFlight,
    #[error("{op} is not valid in state {state}")]
    InvalidState { op: &'static str, state: ClientState },
    #[error("server reported failure: {0}")]
    Remote(String),
    #[error("expected {expected} reply, got {got}")]
    UnexpectedResponse {
        expected: &'static str,
        got: &'static str,
    },
    #[error("request did not complete within {0:?}")]
    Timeout(Duration),
    #[error("wait cancelled")]
    Cancelled,
}

enum WaitOutcome {
    Finished(Result<(), ClientError>),
    TimedOut(Duration),
    Cancelled,
}

/// Client for one remote engine session.
#[derive(Debug)]
pub struct InferenceClient<C = TcpChannel> {
    channel: Option<C>,
    state: ClientState,
    request_id: Option<String>,
    completed: bool,
    backend: Option<String>,
}

impl<C: Channel> Default for InferenceClient<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceClient<TcpChannel> {
    /// Open a TCP connection with a single attempt.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<(), ClientError> {
        self.connect_with(host, port, &ConnectOptions::default()).await
    }

    pub async fn connect_with(
        &mut self,
        host: &str,
        port: u16,
        options: &ConnectOptions,
    ) -> Result<(), ClientError> {
        self.expect_idle("connect")?;
        let channel = TcpChannel::connect(host, port, options).await?;
        self.attach(channel).await
    }
}

impl<C: Channel> InferenceClient<C> {
    pub fn new() -> Self {
        Self {
            channel: None,
            state: ClientState::Idle,
            request_id: None,
            completed: false,
            backend: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Backend name announced by the server during the handshake.
    pub fn backend(&self) -> Option<&str> {
        self.backend.as_deref()
    }

    /// Take over an open channel and run the handshake on it.
    pub async fn attach(&mut self, mut channel: C) -> Result<(), ClientError> {
        self.expect_idle("attach")?;
        let backend = handshake(&mut channel).await?;
        info!(backend = %backend, "session established");
        self.channel = Some(channel);
        self.backend = Some(backend);
        self.transition(ClientState::Connected);
        Ok(())
    }

    /// Submit a request. Returns the server-assigned request id.
    pub async fn send(&mut self, request: InferenceRequest) -> Result<String, ClientError> {
        match self.state {
            ClientState::Idle => return Err(ClientError::NotConnected),
            ClientState::Sent | ClientState::Polling => return Err(ClientError::RequestInFlight),
            ClientState::Connected | ClientState::Done => {}
        }
        request.validate()?;
        let batch_size = request.batch_size;
        let tensors = request.tensors.len();
        match self.call(ClientMessage::Execute { request }).await? {
            ServerMessage::Accepted { request_id } => {
                info!(request_id = %request_id, batch_size, tensors, "request accepted");
                self.request_id = Some(request_id.clone());
                self.completed = false;
                self.transition(ClientState::Sent);
                Ok(request_id)
            }
            ServerMessage::Error { message } => Err(ClientError::Remote(message)),
            other => Err(ClientError::UnexpectedResponse {
                expected: "accepted",
                got: other.kind(),
            }),
        }
    }

    /// One status check; never blocks on the computation itself.
    pub async fn poll(&mut self) -> Result<PollStatus, ClientError> {
        let request_id = self.in_flight("poll")?;
        if self.completed {
            return Ok(PollStatus::Completed);
        }
        match self.call(ClientMessage::Status { request_id }).await? {
            ServerMessage::Status { state, error, .. } => match state {
                JobState::Completed => {
                    debug!("request completed");
                    self.completed = true;
                    self.transition(ClientState::Polling);
                    Ok(PollStatus::Completed)
                }
                JobState::Failed => {
                    self.finish();
                    Err(ClientError::Remote(
                        error.unwrap_or_else(|| "request failed".to_string()),
                    ))
                }
                JobState::Queued | JobState::Running => {
                    self.transition(ClientState::Polling);
                    Ok(PollStatus::Pending)
                }
            },
            ServerMessage::Error { message } => {
                self.finish();
                Err(ClientError::Remote(message))
            }
            other => Err(ClientError::UnexpectedResponse {
                expected: "status",
                got: other.kind(),
            }),
        }
    }

    /// Fetch the raw result. Only valid once a poll reported completion.
    pub async fn get_results(&mut self) -> Result<InferenceResult, ClientError> {
        let request_id = self.in_flight("get_results")?;
        if !self.completed {
            return Err(ClientError::InvalidState {
                op: "get_results",
                state: self.state,
            });
        }
        match self.call(ClientMessage::FetchResult { request_id }).await? {
            ServerMessage::Result(result) => {
                info!(
                    request_id = %result.request_id,
                    outputs = result.outputs.len(),
                    "result received"
                );
                self.finish();
                Ok(result)
            }
            ServerMessage::Error { message } => {
                self.finish();
                Err(ClientError::Remote(message))
            }
            other => Err(ClientError::UnexpectedResponse {
                expected: "result",
                got: other.kind(),
            }),
        }
    }

    pub async fn wait_for_completion(&mut self, policy: &PollPolicy) -> Result<(), ClientError> {
        self.wait_for_completion_or_cancel(policy, std::future::pending::<()>())
            .await
    }

    /// Poll until completion, the policy's timeout, or `cancel` resolving,
    /// whichever comes first.
    pub async fn wait_for_completion_or_cancel<F>(
        &mut self,
        policy: &PollPolicy,
        cancel: F,
    ) -> Result<(), ClientError>
    where
        F: Future<Output = ()>,
    {
        self.in_flight("wait_for_completion")?;
        let interval = policy.interval;
        let timeout = policy.timeout;
        let outcome = {
            let deadline = async {
                match timeout {
                    Some(limit) => {
                        tokio::time::sleep(limit).await;
                        limit
                    }
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                res = self.poll_until_complete(interval) => WaitOutcome::Finished(res),
                limit = deadline => WaitOutcome::TimedOut(limit),
                _ = cancel => WaitOutcome::Cancelled,
            }
        };
        match outcome {
            WaitOutcome::Finished(res) => res,
            WaitOutcome::TimedOut(limit) => {
                warn!(request_id = ?self.request_id, timeout = ?limit, "wait timed out");
                self.abandon();
                Err(ClientError::Timeout(limit))
            }
            WaitOutcome::Cancelled => {
                warn!(request_id = ?self.request_id, "wait cancelled");
                self.abandon();
                Err(ClientError::Cancelled)
            }
        }
    }

    /// Send, wait and fetch in one call.
    pub async fn run(
        &mut self,
        request: InferenceRequest,
        policy: &PollPolicy,
    ) -> Result<InferenceResult, ClientError> {
        self.send(request).await?;
        self.wait_for_completion(policy).await?;
        self.get_results().await
    }

    /// Say goodbye and drop the connection.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        let sent = match self.channel.as_mut() {
            Some(channel) => channel.notify(ClientMessage::Goodbye).await,
            None => Ok(()),
        };
        self.abandon();
        sent.map_err(ClientError::from)
    }

    async fn poll_until_complete(&mut self, interval: Duration) -> Result<(), ClientError> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.poll().await? == PollStatus::Completed {
                return Ok(());
            }
        }
    }

    async fn call(&mut self, message: ClientMessage) -> Result<ServerMessage, ClientError> {
        let channel = self.channel.as_mut().ok_or(ClientError::NotConnected)?;
        match channel.call(message).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                warn!(error = %e, "connection lost");
                self.abandon();
                Err(e.into())
            }
        }
    }

    fn expect_idle(&self, op: &'static str) -> Result<(), ClientError> {
        if self.state == ClientState::Idle {
            Ok(())
        } else {
            Err(ClientError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    fn in_flight(&self, op: &'static str) -> Result<String, ClientError> {
        match (self.state, &self.request_id) {
            (ClientState::Idle, _) => Err(ClientError::NotConnected),
            (ClientState::Sent | ClientState::Polling, Some(id)) => Ok(id.clone()),
            (state, _) => Err(ClientError::InvalidState { op, state }),
        }
    }

    fn finish(&mut self) {
        self.request_id = None;
        self.completed = false;
        self.transition(ClientState::Done);
    }

    fn abandon(&mut self) {
        self.channel = None;
        self.request_id = None;
        self.completed = false;
        self.backend = None;
        self.transition(ClientState::Idle);
    }

    fn transition(&mut self, next: ClientState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "client state");
            self.state = next;
        }
    }
}
