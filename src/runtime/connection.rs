//! Per-connection session state machine and the bounded slot registry.
//!
//! A session moves through
//! `AwaitingRequest -> Processing -> AwaitingAck -> Done`. It owns its
//! inbound and outbound buffers; the runtime only moves bytes between the
//! socket and the session and asks it what to do next.

use crate::runtime::request::{open_quiz, process_calc, process_max, process_quiz_ack};
use crate::runtime::{ProcessResult, Protocol, ServerContext};
use bytes::{Buf, BytesMut};
use slab::Slab;
use std::io;

/// Inbound bytes a session may hold without completing a request.
pub const MAX_BUFFERED: usize = 4096;

/// Current phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for a complete request.
    AwaitingRequest,
    /// A response is queued and being written. Input is buffered, not parsed.
    Processing,
    /// Waiting for the client to acknowledge the question (quiz only).
    AwaitingAck,
    /// Finished; the connection should be closed.
    Done,
}

/// Request/response state of one client.
#[derive(Debug)]
pub struct Session {
    protocol: Protocol,
    phase: Phase,
    inbound: BytesMut,
    outbound: BytesMut,
    /// Bytes of `outbound` already written to the socket.
    written: usize,
    /// Close once the queued response is sent.
    closing: bool,
    /// Requests answered so far.
    served: u32,
    question: Option<usize>,
}

impl Session {
    /// Create a session in initial state.
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            phase: Phase::AwaitingRequest,
            inbound: BytesMut::with_capacity(64),
            outbound: BytesMut::with_capacity(64),
            written: 0,
            closing: false,
            served: 0,
            question: None,
        }
    }

    /// Prepare anything the server sends before the client speaks.
    ///
    /// Quiz sessions queue the greeting and their question.
    pub fn open(&mut self, ctx: &ServerContext) -> ProcessResult {
        if self.protocol != Protocol::Quiz {
            return ProcessResult::NeedData;
        }
        match open_quiz(&mut self.outbound, ctx) {
            Some(id) => {
                self.question = Some(id);
                self.phase = Phase::Processing;
                ProcessResult::Response {
                    consumed: 0,
                    close: false,
                }
            }
            None => {
                self.phase = Phase::Done;
                ProcessResult::Error
            }
        }
    }

    /// Buffer bytes read from the socket and parse as they arrive.
    ///
    /// Only input that does not yet form a complete request counts against
    /// `MAX_BUFFERED`. Bytes arriving after the final request of the session
    /// are discarded.
    pub fn receive(&mut self, mut data: &[u8], ctx: &ServerContext) -> io::Result<()> {
        while !data.is_empty() {
            if self.is_done() || (self.phase == Phase::Processing && self.closing) {
                return Ok(());
            }

            let room = MAX_BUFFERED - self.inbound.len();
            if room == 0 {
                if self.phase == Phase::Processing {
                    // A response is in flight; excess pipelined input is dropped.
                    return Ok(());
                }
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "request exceeds buffer limit",
                ));
            }

            let take = room.min(data.len());
            self.inbound.extend_from_slice(&data[..take]);
            data = &data[take..];
            self.process(ctx);
        }
        Ok(())
    }

    /// Run the protocol handler over buffered input.
    ///
    /// Does nothing while a response is still being written.
    pub fn process(&mut self, ctx: &ServerContext) -> ProcessResult {
        let result = match (self.phase, self.protocol) {
            (Phase::AwaitingRequest, Protocol::Calc) => process_calc(&self.inbound, &mut self.outbound),
            (Phase::AwaitingRequest, Protocol::Max) => {
                process_max(&self.inbound, &mut self.outbound, ctx, self.served)
            }
            (Phase::AwaitingAck, Protocol::Quiz) => match self.question {
                Some(id) => process_quiz_ack(&self.inbound, &mut self.outbound, ctx, id),
                None => ProcessResult::Error,
            },
            _ => return ProcessResult::NeedData,
        };

        match result {
            ProcessResult::NeedData => {}
            ProcessResult::Response { consumed, close } => {
                self.inbound.advance(consumed);
                self.served += 1;
                self.closing = close;
                self.phase = Phase::Processing;
            }
            ProcessResult::Error => self.phase = Phase::Done,
        }
        result
    }

    /// Bytes of the queued response not yet written.
    pub fn pending_output(&self) -> &[u8] {
        &self.outbound[self.written..]
    }

    /// Whether a response is waiting to be written.
    pub fn has_output(&self) -> bool {
        self.written < self.outbound.len()
    }

    /// Record `n` bytes written. Completes the response once all are out.
    pub fn advance_output(&mut self, n: usize) {
        self.written = (self.written + n).min(self.outbound.len());
        if !self.has_output() {
            self.response_sent();
        }
    }

    fn response_sent(&mut self) {
        self.outbound.clear();
        self.written = 0;
        if self.phase != Phase::Processing {
            return;
        }
        self.phase = if self.closing {
            Phase::Done
        } else if self.protocol == Protocol::Quiz {
            Phase::AwaitingAck
        } else {
            Phase::AwaitingRequest
        };
    }

    /// The peer closed its side. A queued response is still delivered,
    /// after which the session is done.
    pub fn peer_closed(&mut self) {
        if self.has_output() {
            self.closing = true;
        } else {
            self.phase = Phase::Done;
        }
    }

    /// Whether unparsed input is buffered.
    pub fn has_input(&self) -> bool {
        !self.inbound.is_empty()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations and refuses inserts
/// beyond its fixed capacity. Entries own their socket, so no two slots can
/// refer to the same one.
pub struct ConnectionRegistry<C> {
    connections: Slab<C>,
    max_connections: usize,
}

impl<C> ConnectionRegistry<C> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: C) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut C> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<C> {
        self.connections.try_remove(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether every slot is taken.
    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Remove and yield every connection.
    pub fn drain(&mut self) -> impl Iterator<Item = C> + '_ {
        self.connections.drain()
    }
}
