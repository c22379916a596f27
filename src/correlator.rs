//! Response correlator.
//!
//! Maps outstanding conversation ids to single-shot completion slots. The
//! producing side is the receive loop (or teardown, for fan-out failure);
//! the consuming side is the caller awaiting `request_response`.
//!
//! Insertion, completion, cancellation, and shutdown are mutually atomic
//! under one lock; nothing awaits while holding it. After `shutdown` the
//! map is terminal: every remaining slot has been failed and new insertions
//! are refused.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::message::{Error, Message};

/// Message used to fail pending slots when the connection dies.
pub(crate) const CLOSED_BEFORE_RESPONSE: &str =
    "Connection was closed before response was received";

/// The correlator was already shut down; no new conversations may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelatorShutdown;

impl std::fmt::Display for CorrelatorShutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "correlator is shut down")
    }
}

impl std::error::Error for CorrelatorShutdown {}

struct State {
    pending: HashMap<u64, oneshot::Sender<Message>>,
    shut_down: bool,
}

/// Pending-request map keyed by conversation id.
pub struct Correlator {
    state: Mutex<State>,
}

impl Correlator {
    /// An empty, live correlator.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                pending: HashMap::new(),
                shut_down: false,
            }),
        }
    }

    /// Register a pending conversation and return its completion handle.
    ///
    /// # Panics
    ///
    /// Panics on a duplicate conversation id: allocation steps the counter
    /// atomically, so a duplicate can only be a programmer error.
    pub fn add(&self, conversation_id: u64) -> Result<oneshot::Receiver<Message>, CorrelatorShutdown> {
        let mut state = self.state.lock().expect("correlator lock poisoned");
        if state.shut_down {
            return Err(CorrelatorShutdown);
        }
        let (tx, rx) = oneshot::channel();
        let previous = state.pending.insert(conversation_id, tx);
        assert!(
            previous.is_none(),
            "conversation id {conversation_id} registered twice"
        );
        Ok(rx)
    }

    /// Resolve and remove a pending conversation.
    ///
    /// Returns false when no slot is pending under that id; the caller logs
    /// and drops the message. A completion racing an abandoned awaiter is
    /// observable (the send fails) but harmless.
    pub fn complete(&self, conversation_id: u64, message: Message) -> bool {
        let sender = {
            let mut state = self.state.lock().expect("correlator lock poisoned");
            state.pending.remove(&conversation_id)
        };
        match sender {
            Some(tx) => {
                if tx.send(message).is_err() {
                    tracing::debug!(
                        conversation_id,
                        "response arrived after the awaiter went away"
                    );
                }
                true
            }
            None => false,
        }
    }

    /// Remove a pending conversation without completing it.
    ///
    /// Used by per-request cancellation; the conversation id is burned and
    /// any late response will be dropped as unmatched.
    pub fn cancel(&self, conversation_id: u64) -> bool {
        let mut state = self.state.lock().expect("correlator lock poisoned");
        state.pending.remove(&conversation_id).is_some()
    }

    /// Number of conversations still awaiting completion.
    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .expect("correlator lock poisoned")
            .pending
            .len()
    }

    /// Mark the map terminal and fail every remaining slot with a
    /// transport error.
    ///
    /// Idempotent: later calls find the map empty and already terminal.
    pub fn shutdown(&self) {
        let drained: Vec<(u64, oneshot::Sender<Message>)> = {
            let mut state = self.state.lock().expect("correlator lock poisoned");
            state.shut_down = true;
            state.pending.drain().collect()
        };
        for (conversation_id, tx) in drained {
            tracing::debug!(conversation_id, "failing pending request at shutdown");
            let _ = tx.send(Message::error(Error::transport(CLOSED_BEFORE_RESPONSE)));
        }
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}
