//! Running maximum protocol.
//!
//! The client sends unsigned 32-bit numbers in network byte order. For each
//! number the server answers with the largest number it had seen from any
//! client before this one (0 initially), then folds the new number in. After
//! `NUMBERS_PER_SESSION` numbers the server closes the connection.

pub mod parser;

pub use parser::{encode, parse, MaxStats, ParseResult, NUMBERS_PER_SESSION};
