//! Protocol implementations.
//!
//! Each protocol has a parser module used by the runtime event loops.
//!
//! ## Stream Protocols
//! - `calc`: fixed-frame arithmetic requests
//! - `quiz`: question/answer sessions backed by a question file
//! - `max`: running maximum across all clients
//!
//! ## Datagram Protocols
//! - `chunk`: ordered chunk reassembly with acknowledgements

pub mod calc;
pub mod chunk;
pub mod max;
pub mod quiz;
