//! Server-wide context shared by every session.
//!
//! Replaces process-wide globals: the event loop and the session handlers
//! receive it explicitly.

use crate::config::{Config, ProtocolType};
use crate::protocols::max::MaxStats;
use crate::protocols::quiz::{QuizBank, QuizEntry, QuizError};
use crate::runtime::Protocol;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::info;

/// State shared by all connections of one server.
#[derive(Debug)]
pub struct ServerContext {
    protocol: Protocol,
    quiz: Option<QuizBank>,
    /// Cleared by SIGUSR1 to turn new peers away.
    accepting: AtomicBool,
    next_question: AtomicUsize,
    max: Mutex<MaxStats>,
}

impl ServerContext {
    /// Create a context for a protocol without a question bank.
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            quiz: None,
            accepting: AtomicBool::new(true),
            next_question: AtomicUsize::new(0),
            max: Mutex::new(MaxStats::default()),
        }
    }

    /// Create a quiz context serving questions from `bank`.
    pub fn with_quiz(bank: QuizBank) -> Self {
        Self {
            quiz: Some(bank),
            ..Self::new(Protocol::Quiz)
        }
    }

    /// Build the context for a configured server, loading the question
    /// bank for the quiz protocol.
    pub fn from_config(config: &Config) -> Result<Self, QuizError> {
        let protocol = match config.protocol {
            ProtocolType::Calc => Protocol::Calc,
            ProtocolType::Quiz => Protocol::Quiz,
            ProtocolType::Max => Protocol::Max,
            ProtocolType::Chunk => Protocol::Chunk,
        };

        match (protocol, &config.quiz_file) {
            (Protocol::Quiz, Some(path)) => {
                let bank = QuizBank::load(path)?;
                info!(path = %path.display(), questions = bank.len(), "Loaded quiz questions");
                Ok(Self::with_quiz(bank))
            }
            _ => Ok(Self::new(protocol)),
        }
    }

    /// Protocol spoken on accepted connections.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Whether new peers are admitted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    /// Flip the accept flag and return the new value.
    pub fn toggle_accepting(&self) -> bool {
        !self.accepting.fetch_xor(true, Ordering::Relaxed)
    }

    /// Pick the question for a new quiz session, rotating through the bank.
    pub fn assign_question(&self) -> Option<usize> {
        let bank = self.quiz.as_ref()?;
        if bank.is_empty() {
            return None;
        }
        Some(self.next_question.fetch_add(1, Ordering::Relaxed) % bank.len())
    }

    /// Look up an assigned question.
    pub fn question(&self, idx: usize) -> Option<&QuizEntry> {
        self.quiz.as_ref()?.get(idx)
    }

    /// Record a number for the running-maximum protocol and return the
    /// maximum seen before it.
    pub fn record_number(&self, value: u32) -> u32 {
        self.max
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(value)
    }

    /// Snapshot of the running-maximum statistics.
    pub fn max_stats(&self) -> MaxStats {
        *self.max.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
