//! Running maximum request parser and server-wide statistics.

use bytes::{Buf, BufMut};

/// Size of one number on the wire.
pub const NUMBER_LEN: usize = std::mem::size_of::<u32>();

/// Numbers a client may send before being disconnected.
pub const NUMBERS_PER_SESSION: u32 = 3;

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// A number with bytes consumed.
    Complete(u32, usize),
    /// Need more data.
    Incomplete,
}

/// Parse one number from the input buffer.
pub fn parse(input: &[u8]) -> ParseResult {
    if input.len() < NUMBER_LEN {
        return ParseResult::Incomplete;
    }
    let mut number = &input[..NUMBER_LEN];
    ParseResult::Complete(number.get_u32(), NUMBER_LEN)
}

/// Append a reply number to `output`.
pub fn encode<B: BufMut>(value: u32, output: &mut B) {
    output.put_u32(value);
}

/// Server-wide state shared by all running-maximum sessions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaxStats {
    /// Largest number received so far.
    pub max: u32,
    /// Total numbers received from all clients.
    pub received: u64,
}

impl MaxStats {
    /// Record a number and return the maximum seen before it.
    pub fn record(&mut self, value: u32) -> u32 {
        let previous = self.max;
        self.max = self.max.max(value);
        self.received += 1;
        previous
    }
}
