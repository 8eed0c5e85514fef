//! Request dispatch for the runtimes.
//!
//! Provides synchronous request processing that dispatches to protocol
//! handlers and works with raw byte buffers, so the same code serves the
//! event loop and the blocking worker threads.

use crate::protocols::{calc, max, quiz};
use crate::runtime::ServerContext;
use bytes::{BufMut, BytesMut};
use tracing::{debug, trace};

/// Protocol type for request processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Calc,
    Quiz,
    Max,
    /// Datagram transfers, served by the UDP runtime rather than a session.
    Chunk,
}

impl Protocol {
    /// Message written to a peer that is turned away, if the protocol has one.
    pub fn rejection_notice(self) -> Option<&'static [u8]> {
        match self {
            Protocol::Quiz => Some(quiz::REJECTION),
            Protocol::Calc | Protocol::Max | Protocol::Chunk => None,
        }
    }
}

/// Result of processing a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum ProcessResult {
    /// Need more data to complete parsing.
    NeedData,
    /// Successfully processed, response appended to the output buffer.
    Response {
        /// Bytes consumed from input.
        consumed: usize,
        /// Close the connection once the response is sent.
        close: bool,
    },
    /// Protocol error, connection should be closed.
    Error,
}

/// Process a calculator request buffer.
///
/// Every connection carries exactly one request.
pub fn process_calc(input: &[u8], output: &mut BytesMut) -> ProcessResult {
    match calc::parse(input) {
        calc::ParseResult::Complete(request, consumed) => {
            let response = calc::evaluate(request);
            trace!(?request, ok = response.is_ok(), result = response.result, "Calculated");
            response.encode(output);
            ProcessResult::Response {
                consumed,
                close: true,
            }
        }
        calc::ParseResult::Incomplete => ProcessResult::NeedData,
    }
}

/// Process a running-maximum request buffer.
///
/// `served` is the number of numbers this connection sent before.
pub fn process_max(
    input: &[u8],
    output: &mut BytesMut,
    ctx: &ServerContext,
    served: u32,
) -> ProcessResult {
    match max::parse(input) {
        max::ParseResult::Complete(value, consumed) => {
            let previous = ctx.record_number(value);
            debug!(value, reply = previous, "Received number");
            max::encode(previous, output);
            ProcessResult::Response {
                consumed,
                close: served + 1 >= max::NUMBERS_PER_SESSION,
            }
        }
        max::ParseResult::Incomplete => ProcessResult::NeedData,
    }
}

/// Queue the greeting and an assigned question for a new quiz client.
///
/// Returns the question id, or `None` when no question can be assigned.
pub fn open_quiz(output: &mut BytesMut, ctx: &ServerContext) -> Option<usize> {
    let id = ctx.assign_question()?;
    let entry = ctx.question(id)?;

    output.put_slice(quiz::GREETING);
    output.put_slice(entry.question.as_bytes());
    output.put_u8(b'\n');
    Some(id)
}

/// Process the "ready for the answer" byte of a quiz client.
pub fn process_quiz_ack(
    input: &[u8],
    output: &mut BytesMut,
    ctx: &ServerContext,
    question: usize,
) -> ProcessResult {
    if input.is_empty() {
        return ProcessResult::NeedData;
    }
    let Some(entry) = ctx.question(question) else {
        return ProcessResult::Error;
    };

    output.put_slice(entry.answer.as_bytes());
    output.put_u8(b'\n');
    ProcessResult::Response {
        consumed: 1,
        close: true,
    }
}
