//! Chunk datagram parser.

use bytes::{Buf, BufMut};

/// Largest datagram exchanged.
pub const MAX_DATAGRAM: usize = 576;

/// Bytes taken by the chunk number and the last-chunk flag.
pub const HEADER_LEN: usize = 2 * std::mem::size_of::<i32>();

/// A decoded chunk borrowing its payload from the datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    /// Sequence number, starting at 1.
    pub number: i32,
    /// Whether this chunk completes the message.
    pub last: bool,
    /// Text up to the first NUL byte.
    pub payload: &'a [u8],
}

impl Chunk<'_> {
    /// Append the wire encoding of the chunk to `output`.
    pub fn encode<B: BufMut>(&self, output: &mut B) {
        output.put_i32(self.number);
        output.put_i32(i32::from(self.last));
        output.put_slice(self.payload);
    }
}

/// Decode a datagram. Returns `None` for datagrams shorter than the header.
pub fn parse(datagram: &[u8]) -> Option<Chunk<'_>> {
    if datagram.len() < HEADER_LEN {
        return None;
    }
    let (mut header, body) = datagram.split_at(HEADER_LEN);
    let number = header.get_i32();
    let last = header.get_i32() != 0;
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());

    Some(Chunk {
        number,
        last,
        payload: &body[..end],
    })
}
