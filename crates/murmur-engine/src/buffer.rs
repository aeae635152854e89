//! Bounded conversation history.
//!
//! The buffer is the single source of truth for what is sent to the
//! completion service and what the UI layer renders. It keeps only the most
//! recent turns, dropping the oldest first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of turns kept in the sliding window.
pub const DEFAULT_CAPACITY: usize = 5;

/// One exchange: a user input and its (possibly pending) response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Text the user submitted.
    pub user: String,
    /// Response text. Empty until the turn is finalized.
    pub bot: String,
    /// When the user submitted the turn.
    pub submitted_at: DateTime<Utc>,
}

impl Turn {
    /// Create a pending turn for a fresh submission.
    pub fn pending(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            bot: String::new(),
            submitted_at: Utc::now(),
        }
    }
}

/// Ordered, capacity-bounded store of turns.
#[derive(Debug, Clone)]
pub struct ConversationBuffer {
    turns: Vec<Turn>,
    capacity: usize,
}

impl ConversationBuffer {
    /// Create an empty buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create an empty buffer holding at most `capacity` turns.
    ///
    /// A capacity of zero is raised to one so the in-flight turn always fits.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            turns: Vec::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Append a turn, evicting the oldest turns past capacity.
    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
        if self.turns.len() > self.capacity {
            let excess = self.turns.len() - self.capacity;
            self.turns.drain(..excess);
        }
    }

    /// Set the response text of the most recent turn.
    pub fn finalize_last(&mut self, bot_text: impl Into<String>) -> Result<(), BufferError> {
        let last = self.turns.last_mut().ok_or(BufferError::Empty)?;
        last.bot = bot_text.into();
        Ok(())
    }

    /// Read-only view of the turns, oldest first.
    pub fn snapshot(&self) -> &[Turn] {
        &self.turns
    }

    /// Owned copy of the turns, oldest first.
    pub fn to_vec(&self) -> Vec<Turn> {
        self.turns.clone()
    }

    /// The most recent turn, if any.
    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ConversationBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors raised by buffer operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// `finalize_last` was called with no turns in the buffer.
    #[error("cannot finalize a turn: conversation buffer is empty")]
    Empty,
}
