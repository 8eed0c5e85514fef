//! Quiz protocol.
//!
//! Every client gets one question from the question bank:
//!
//! ```text
//! Server: Hello!\n
//! Server: <question>\n
//! Client: <any single byte, "ready for the answer">
//! Server: <answer>\n
//! Server: (closes the connection)
//! ```
//!
//! A client that arrives while all slots are taken receives
//! `Error: too many clients` and is disconnected.

pub mod bank;

pub use bank::{QuizBank, QuizEntry, QuizError};

/// Sent to every admitted client before its question.
pub const GREETING: &[u8] = b"Hello!\n";

/// Sent to a client that is turned away.
pub const REJECTION: &[u8] = b"Error: too many clients";
