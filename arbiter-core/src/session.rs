//! Per-client request lifecycle.
//!
//! A [`SessionChannel`] drives one prompt at a time through retrieval,
//! composition, fan-out and scoring, streaming each backend result to its
//! [`EventSink`] as it lands and finishing with exactly one outcome event.
//! Cancelling the session's token (client disconnect) moves it to
//! [`SessionState::Closed`] and nothing further is sent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::composer::compose;
use crate::error::ChannelError;
use crate::gateway::ServerMessage;
use crate::pipeline::Pipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    AwaitingRetrieval,
    Dispatching,
    Evaluating,
    Done,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid session transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

impl SessionState {
    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        match (self, to) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle, AwaitingRetrieval)
            | (AwaitingRetrieval, Dispatching)
            | (Dispatching, Evaluating)
            | (Evaluating, Done)
            | (Done, Idle) => true,
            _ => false,
        }
    }

    pub fn transition(self, to: SessionState) -> Result<SessionState, InvalidTransition> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::Closed)
    }
}

/// Outbound half of a client connection.
///
/// Implementations serialize concurrent sends so one event is never
/// interleaved with another.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: ServerMessage) -> Result<(), ChannelError>;
}

/// Sink backed by an mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ServerMessage>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ServerMessage>) -> Self {
        Self { tx }
    }

    /// A sink and the receiver draining it.
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&self, event: ServerMessage) -> Result<(), ChannelError> {
        self.tx.send(event).await.map_err(|_| ChannelError::Closed)
    }
}

pub struct SessionChannel {
    id: Uuid,
    pipeline: Arc<Pipeline>,
    sink: Arc<dyn EventSink>,
    state: SessionState,
    requests: u64,
}

impl std::fmt::Debug for SessionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionChannel")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("requests", &self.requests)
            .finish()
    }
}

impl SessionChannel {
    pub fn new(pipeline: Arc<Pipeline>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline,
            sink,
            state: SessionState::Idle,
            requests: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Mark the session closed (client gone before or between requests).
    pub fn close(&mut self) {
        self.advance(SessionState::Closed);
    }

    /// Run one prompt to completion and return the terminal state
    /// (`Done`, or `Closed` if the client went away).
    pub async fn handle_prompt(&mut self, prompt: &str, cancel: &CancellationToken) -> SessionState {
        self.requests += 1;
        let span = info_span!("session", session_id = %self.id, request = self.requests);
        self.run(prompt, cancel).instrument(span).await
    }

    async fn run(&mut self, prompt: &str, cancel: &CancellationToken) -> SessionState {
        if self.state == SessionState::Done {
            self.advance(SessionState::Idle);
        }
        if self.state != SessionState::Idle {
            warn!(state = ?self.state, "Prompt received by a session that is not idle");
            return self.state;
        }
        info!(chars = prompt.len(), "Prompt received");
        let pipeline = Arc::clone(&self.pipeline);

        self.advance(SessionState::AwaitingRetrieval);
        let retrieval = tokio::select! {
            _ = cancel.cancelled() => return self.disconnected(),
            retrieval = pipeline.retrieve_context(prompt) => retrieval,
        };
        let augmented = compose(prompt, &retrieval);

        self.advance(SessionState::Dispatching);
        let mut dispatch =
            pipeline
                .dispatcher()
                .dispatch(&augmented, pipeline.pool(), cancel.child_token());
        let mut results = Vec::with_capacity(dispatch.expected());
        while let Some(result) = dispatch.next().await {
            if cancel.is_cancelled() {
                break;
            }
            if self.sink.send(ServerMessage::backend_result(&result)).await.is_err() {
                dispatch.abort();
                return self.disconnected();
            }
            results.push(result);
        }
        if cancel.is_cancelled() {
            dispatch.abort();
            return self.disconnected();
        }

        self.advance(SessionState::Evaluating);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return self.disconnected(),
            outcome = pipeline.evaluator().evaluate(&results, &retrieval) => outcome,
        };
        if self.sink.send(ServerMessage::outcome(&outcome)).await.is_err() {
            return self.disconnected();
        }

        self.advance(SessionState::Done);
        info!(winner = %outcome.winner_label(), "Session complete");
        self.state
    }

    fn disconnected(&mut self) -> SessionState {
        info!(state = ?self.state, "Client disconnected; discarding in-flight work");
        self.advance(SessionState::Closed);
        self.state
    }

    fn advance(&mut self, to: SessionState) {
        match self.state.transition(to) {
            Ok(next) => {
                debug!(from = ?self.state, to = ?next, "Session transition");
                self.state = next;
            }
            Err(e) => warn!(error = %e, "Ignoring invalid session transition"),
        }
    }
}
