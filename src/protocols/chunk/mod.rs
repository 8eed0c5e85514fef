//! Chunked message transfer over UDP.
//!
//! A client splits a text message into datagrams and sends them one at a
//! time, numbering them from 1 and flagging the final one. The server keeps
//! one transfer slot per client address, accepts chunks strictly in order
//! and acknowledges each accepted (or repeated) chunk by sending the
//! datagram back unchanged. Chunks that skip ahead are dropped without an
//! acknowledgement so the client retransmits.
//!
//! ## Protocol Format
//!
//! ```text
//! | chunk_no: i32 BE | last: i32 BE | payload (text, NUL padded) |
//! ```
//!
//! Datagrams are at most `MAX_DATAGRAM` bytes.

pub mod parser;

pub use parser::{parse, Chunk, MAX_DATAGRAM};
