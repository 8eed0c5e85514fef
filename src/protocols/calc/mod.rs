//! Arithmetic calculator protocol.
//!
//! One request per connection. The client sends a single frame of five
//! 32-bit signed integers in network byte order and the server answers with
//! the same frame, `result` and `status` filled in, then disconnects.
//!
//! ## Protocol Format
//!
//! ```text
//! offset  0        4        8        12         16       20
//!         | op1    | op2    | result | operator | status |
//! ```
//!
//! The low byte of `operator` carries the ASCII code of `+`, `-`, `*` or `/`.
//! `status` is 1 when the operation succeeded and 0 when it is impossible
//! (unknown operator or division by zero); `result` is 0 in that case.
//! Arithmetic wraps modulo 2^32.

pub mod parser;

pub use parser::{evaluate, parse, Frame, Operator, ParseResult, FRAME_LEN};
