//! Request/response transport underneath [`crate::client::InferenceClient`].
//!
//! The client only needs "send one message, get one reply", so the transport
//! is the [`Channel`] trait. [`TcpChannel`] is the real implementation;
//! tests substitute scripted channels.

use std::future::Future;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::protocol::{
    read_frame, write_frame, ClientMessage, FrameError, ServerMessage, PROTOCOL_VERSION,
};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("frame error: {0}")]
    Frame(FrameError),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("connect to {addr} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        addr: String,
        attempts: u32,
        last_error: String,
    },
    #[error("connection closed by peer")]
    Closed,
}

impl From<FrameError> for ConnectionError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Closed => ConnectionError::Closed,
            other => ConnectionError::Frame(other),
        }
    }
}

/// One request, one reply.
pub trait Channel: Send {
    fn call(
        &mut self,
        message: ClientMessage,
    ) -> impl Future<Output = Result<ServerMessage, ConnectionError>> + Send;

    /// Send without waiting for a reply.
    fn notify(
        &mut self,
        message: ClientMessage,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

/// Retry schedule for connection attempts. The default makes a single
/// attempt; retrying is opt-in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
    pub retry: RetryPolicy,
    /// Per-attempt timeout; `None` waits for the OS.
    pub connect_timeout: Option<Duration>,
}

/// Run `op` under `policy`. A single-attempt policy surfaces the
/// underlying error unchanged.
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    addr: &str,
    mut op: F,
) -> Result<T, ConnectionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;
    for i in 0..attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempts == 1 {
                    return Err(ConnectionError::Connect {
                        addr: addr.to_string(),
                        source: e,
                    });
                }
                warn!(addr, attempt = i + 1, attempts, error = %e, "connect attempt failed");
                last_error = Some(e.to_string());
                if i + 1 < attempts {
                    tokio::time::sleep(policy.backoff).await;
                }
            }
        }
    }
    Err(ConnectionError::RetriesExhausted {
        addr: addr.to_string(),
        attempts,
        last_error: last_error.unwrap_or_else(|| "unknown".to_string()),
    })
}

/// Exchange `Hello`s and return the server's backend name.
pub async fn handshake<C: Channel>(channel: &mut C) -> Result<String, ConnectionError> {
    let reply = channel
        .call(ClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
        })
        .await?;
    match reply {
        ServerMessage::Hello {
            protocol_version,
            backend,
        } if protocol_version == PROTOCOL_VERSION => Ok(backend),
        ServerMessage::Hello {
            protocol_version, ..
        } => Err(ConnectionError::Handshake(format!(
            "server speaks protocol {protocol_version}, client speaks {PROTOCOL_VERSION}"
        ))),
        ServerMessage::Error { message } => Err(ConnectionError::Handshake(message)),
        other => Err(ConnectionError::Handshake(format!(
            "expected hello, got {}",
            other.kind()
        ))),
    }
}

/// Length-prefixed JSON frames over TCP.
#[derive(Debug)]
pub struct TcpChannel {
    stream: TcpStream,
    addr: String,
}

impl TcpChannel {
    pub async fn connect(
        host: &str,
        port: u16,
        options: &ConnectOptions,
    ) -> Result<Self, ConnectionError> {
        let addr = format!("{host}:{port}");
        let timeout = options.connect_timeout;
        let stream = with_retries(&options.retry, &addr, || {
            let addr = addr.clone();
            async move {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, TcpStream::connect(&addr))
                        .await
                        .unwrap_or_else(|_| {
                            Err(std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "connect timed out",
                            ))
                        }),
                    None => TcpStream::connect(&addr).await,
                }
            }
        })
        .await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(addr = %addr, error = %e, "set_nodelay failed");
        }
        info!(addr = %addr, "connected");
        Ok(Self { stream, addr })
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self { stream, addr }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Channel for TcpChannel {
    async fn call(&mut self, message: ClientMessage) -> Result<ServerMessage, ConnectionError> {
        debug!(addr = %self.addr, kind = message.kind(), "send");
        write_frame(&mut self.stream, &message).await?;
        let reply: ServerMessage = read_frame(&mut self.stream).await?;
        debug!(addr = %self.addr, kind = reply.kind(), "recv");
        Ok(reply)
    }

    async fn notify(&mut self, message: ClientMessage) -> Result<(), ConnectionError> {
        debug!(addr = %self.addr, kind = message.kind(), "send");
        write_frame(&mut self.stream, &message).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let policy = RetryPolicy::new(3, Duration::from_millis(500));
        let err = with_retries(&policy, "10.0.0.1:34000", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                ))
            }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            ConnectionError::RetriesExhausted {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("refused"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_later_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let value = with_retries(&RetryPolicy::new(4, Duration::from_secs(1)), "h:1", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(std::io::Error::new(std::io::ErrorKind::Other, "not yet"))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_default_policy_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = TcpChannel::connect("127.0.0.1", port, &ConnectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Connect { .. }), "{err:?}");
    }

    async fn serve_one_hello(version: u32) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let hello: ClientMessage = read_frame(&mut stream).await.unwrap();
            assert!(matches!(hello, ClientMessage::Hello { .. }));
            let reply = ServerMessage::Hello {
                protocol_version: version,
                backend: "HE_SEAL".into(),
            };
            write_frame(&mut stream, &reply).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_tcp_handshake() {
        let port = serve_one_hello(PROTOCOL_VERSION).await;
        let mut channel = TcpChannel::connect("127.0.0.1", port, &ConnectOptions::default())
            .await
            .unwrap();
        assert_eq!(handshake(&mut channel).await.unwrap(), "HE_SEAL");
    }

    #[tokio::test]
    async fn test_handshake_version_mismatch() {
        let port = serve_one_hello(PROTOCOL_VERSION + 1).await;
        let mut channel = TcpChannel::connect("127.0.0.1", port, &ConnectOptions::default())
            .await
            .unwrap();
        let err = handshake(&mut channel).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Handshake(_)));
    }

    #[tokio::test]
    async fn test_peer_close_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });
        let mut channel = TcpChannel::connect("127.0.0.1", port, &ConnectOptions::default())
            .await
            .unwrap();
        let err = channel.call(ClientMessage::Goodbye).await.unwrap_err();
        // Either the write or the read notices the closed socket.
        assert!(
            matches!(err, ConnectionError::Closed | ConnectionError::Frame(FrameError::Io(_))),
            "{err:?}"
        );
    }
}
