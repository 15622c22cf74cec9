//! # he-infer: batched encrypted-inference client
//!
//! Client side of a protocol for running neural-network inference on a
//! remote engine that computes homomorphically, never seeing plaintext
//! inputs.
//!
//! ```text
//!  batch ──BatchPacker──► PackedBatch ─┐
//!                                      ├─► InferenceRequest ──InferenceClient──► engine
//!  EncryptionConfigBuilder ──► Arc<EncryptionConfig> ┘                              │
//!                                                                                   ▼
//!  AccuracyReport ◄──AccuracyEvaluator── scores ◄──ResultUnpacker── InferenceResult
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): the `he-infer-client` binary.
//! - `server` (default): [`server::InferenceServer`], a reference engine host
//!   speaking the same protocol.

pub mod accuracy;
pub mod channel;
pub mod client;
pub mod config;
pub mod layout;
pub mod packing;
pub mod params;
pub mod protocol;
pub mod slots;
pub mod unpacking;

#[cfg(feature = "server")]
pub mod server;

/// Commonly used types.
pub mod prelude {
    pub use crate::accuracy::{labels_from_one_hot, top_k, AccuracyEvaluator, AccuracyReport, EvalError};
    pub use crate::channel::{Channel, ConnectOptions, ConnectionError, RetryPolicy, TcpChannel};
    pub use crate::client::{ClientError, ClientState, InferenceClient, PollPolicy, PollStatus};
    pub use crate::config::{
        parse_flag, ConfigError, EncryptionConfig, EncryptionConfigBuilder, TensorDirective,
    };
    pub use crate::layout::{FlattenOrder, PackingFactor, ScoreLayout};
    pub use crate::packing::{BatchPacker, PackedBatch, PackingError, PackingMeta};
    pub use crate::params::{EncryptionParameters, ParameterError, ParameterSource};
    pub use crate::protocol::{InferenceRequest, InferenceResult, RequestError, DEFAULT_PORT};
    pub use crate::slots::SlotVector;
    pub use crate::unpacking::{ResultUnpacker, UnpackError};

    #[cfg(feature = "server")]
    pub use crate::server::{EchoEngine, EngineError, InferenceEngine, InferenceServer};
}
