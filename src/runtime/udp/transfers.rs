//! Per-address reassembly state for chunked transfers.

use crate::protocols::chunk::Chunk;
use crate::runtime::ConnectionRegistry;
use bytes::BytesMut;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Reassembly state of one sender.
#[derive(Debug)]
struct Transfer {
    addr: SocketAddr,
    /// Number of the last accepted chunk, 0 before the first.
    last: i32,
    message: BytesMut,
}

/// What happened to a received chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Next chunk in sequence. Carries the message once the final chunk
    /// arrived.
    Accepted { complete: Option<Vec<u8>> },
    /// Already accepted earlier; the acknowledgement was probably lost.
    Duplicate,
    /// Skips ahead of the sequence.
    OutOfOrder,
    /// No slot for a new sender.
    NoSlot,
}

impl Verdict {
    /// Whether the datagram should be echoed back as acknowledgement.
    pub fn acknowledged(&self) -> bool {
        matches!(self, Verdict::Accepted { .. } | Verdict::Duplicate)
    }
}

/// Bounded table of in-progress transfers, one slot per sender address.
pub struct TransferTable {
    slots: ConnectionRegistry<Transfer>,
    by_addr: HashMap<SocketAddr, usize>,
}

impl TransferTable {
    pub fn new(max_transfers: usize) -> Self {
        Self {
            slots: ConnectionRegistry::new(max_transfers),
            by_addr: HashMap::with_capacity(max_transfers),
        }
    }

    /// Apply a chunk from `addr`. New senders only get a slot when
    /// `admit_new` is set.
    pub fn receive(&mut self, addr: SocketAddr, chunk: &Chunk<'_>, admit_new: bool) -> Verdict {
        let id = match self.by_addr.get(&addr) {
            Some(&id) => id,
            None if admit_new => {
                let transfer = Transfer {
                    addr,
                    last: 0,
                    message: BytesMut::new(),
                };
                let Some(id) = self.slots.insert(transfer) else {
                    return Verdict::NoSlot;
                };
                self.by_addr.insert(addr, id);
                id
            }
            None => return Verdict::NoSlot,
        };
        let Some(transfer) = self.slots.get_mut(id) else {
            return Verdict::NoSlot;
        };

        let expected = i64::from(transfer.last) + 1;
        let number = i64::from(chunk.number);
        if number > expected {
            return Verdict::OutOfOrder;
        }
        if number < expected {
            return Verdict::Duplicate;
        }

        transfer.message.extend_from_slice(chunk.payload);
        if !chunk.last {
            transfer.last = chunk.number;
            return Verdict::Accepted { complete: None };
        }

        let complete = self.remove(id).map(|transfer| transfer.message.to_vec());
        Verdict::Accepted { complete }
    }

    /// Drop the transfer of `addr`, if any.
    pub fn release(&mut self, addr: SocketAddr) -> bool {
        match self.by_addr.get(&addr) {
            Some(&id) => self.remove(id).is_some(),
            None => false,
        }
    }

    /// Number of transfers in progress.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    fn remove(&mut self, id: usize) -> Option<Transfer> {
        let transfer = self.slots.remove(id)?;
        self.by_addr.remove(&transfer.addr);
        Some(transfer)
    }
}
