//! # Arbiter Core
//!
//! Core library for Arbiter, a retrieval-augmented model comparison server.
//! Provides context retrieval, prompt composition, concurrent fan-out to
//! completion backends, response scoring, per-client sessions, and the
//! websocket gateway that streams results as they land.

pub mod backends;
pub mod classifier;
pub mod composer;
pub mod config;
pub mod dispatcher;
pub mod embeddings;
pub mod error;
pub mod evaluator;
pub mod gateway;
pub mod pipeline;
pub mod retrieval;
pub mod session;
pub mod types;

// Re-export commonly used types at the crate root.
pub use backends::{Backend, BackendPool};
pub use classifier::{Classification, CoherenceClassifier};
pub use composer::compose;
pub use config::{ArbiterConfig, load_config};
pub use dispatcher::{Dispatch, Dispatcher};
pub use error::{ArbiterError, Result};
pub use evaluator::Evaluator;
pub use gateway::{ClientMessage, GatewayConfig, GatewayServer, ServerMessage};
pub use pipeline::Pipeline;
pub use retrieval::Retriever;
pub use session::{ChannelSink, EventSink, SessionChannel, SessionState};
pub use types::{
    AugmentedPrompt, BackendResult, EvaluationOutcome, NO_WINNER, Passage, RetrievalResult,
    ScoreBreakdown,
};
