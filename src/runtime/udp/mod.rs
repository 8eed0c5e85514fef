//! UDP runtime for the chunk transfer protocol.
//!
//! A single non-blocking datagram socket is multiplexed with the signal
//! pipe and the shutdown waker. There are no connections: each sender
//! address owns at most one slot in the transfer table.

mod transfers;

pub use transfers::{TransferTable, Verdict};

use crate::config::Config;
use crate::protocols::chunk::{self, MAX_DATAGRAM};
use crate::runtime::{listener, signal, ServerContext, Shutdown, SignalPipe};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const SOCKET_TOKEN: Token = Token(0);
const SIGNAL_TOKEN: Token = Token(1);
const WAKER_TOKEN: Token = Token(2);

/// Datagram server reassembling chunked messages.
pub struct UdpServer {
    poll: Poll,
    socket: UdpSocket,
    signals: Option<SignalPipe>,
    transfers: TransferTable,
    ctx: Arc<ServerContext>,
    shutdown: Shutdown,
    timeout: Option<Duration>,
}

impl UdpServer {
    pub fn bind(config: &Config, ctx: Arc<ServerContext>, shutdown: Shutdown) -> io::Result<Self> {
        let poll = Poll::new()?;

        let addr = listener::resolve(&config.listen_addr())?;
        let mut socket = UdpSocket::from_std(listener::bind_udp(addr)?);
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        shutdown.attach(&poll, WAKER_TOKEN)?;

        info!(
            addr = %socket.local_addr()?,
            max_transfers = config.max_clients,
            "UDP server listening"
        );

        Ok(Self {
            poll,
            socket,
            signals: None,
            transfers: TransferTable::new(config.max_clients),
            ctx,
            shutdown,
            timeout: config.poll_timeout,
        })
    }

    /// Watch a signal self-pipe from this loop.
    pub fn with_signals(mut self, signals: Option<SignalPipe>) -> io::Result<Self> {
        if let Some(pipe) = &signals {
            pipe.register(self.poll.registry(), SIGNAL_TOKEN)?;
        }
        self.signals = signals;
        Ok(self)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve datagrams until shutdown is requested.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(16);

        while !self.shutdown.is_triggered() {
            match self.poll.poll(&mut events, self.timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Poll failed");
                    return Err(e);
                }
            }

            for event in events.iter() {
                match event.token() {
                    SOCKET_TOKEN => self.receive_datagrams(),
                    SIGNAL_TOKEN => self.handle_signals()?,
                    _ => {}
                }
            }
        }

        info!(abandoned = self.transfers.len(), "UDP server stopped");
        Ok(())
    }

    fn receive_datagrams(&mut self) {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, addr)) => self.handle_datagram(&buf[..n], addr),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Receive error");
                    break;
                }
            }
        }
    }

    fn handle_datagram(&mut self, datagram: &[u8], addr: SocketAddr) {
        let Some(chunk) = chunk::parse(datagram) else {
            debug!(%addr, len = datagram.len(), "Ignoring short datagram");
            return;
        };

        let verdict = self
            .transfers
            .receive(addr, &chunk, self.ctx.is_accepting());
        match &verdict {
            Verdict::Accepted {
                complete: Some(message),
            } => info!(
                %addr,
                chunks = chunk.number,
                message = %String::from_utf8_lossy(message),
                "Message received"
            ),
            Verdict::Accepted { complete: None } => {
                trace!(%addr, number = chunk.number, "Chunk accepted")
            }
            Verdict::Duplicate => debug!(%addr, number = chunk.number, "Repeated chunk"),
            Verdict::OutOfOrder => {
                debug!(%addr, number = chunk.number, "Out-of-order chunk dropped")
            }
            Verdict::NoSlot => debug!(%addr, "No transfer slot, datagram ignored"),
        }

        if !verdict.acknowledged() {
            return;
        }
        match self.socket.send_to(datagram, addr) {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!(%addr, "Socket busy, acknowledgement dropped");
            }
            Err(e) => {
                warn!(%addr, error = %e, "Failed to acknowledge chunk");
                self.transfers.release(addr);
            }
        }
    }

    fn handle_signals(&mut self) -> io::Result<()> {
        let Some(pipe) = self.signals.as_mut() else {
            return Ok(());
        };
        for received in pipe.drain()? {
            signal::apply(received, &self.ctx, &self.shutdown);
        }
        Ok(())
    }
}

/// Run the chunk transfer service.
pub fn run(
    config: &Config,
    ctx: Arc<ServerContext>,
    shutdown: Shutdown,
    signals: Option<SignalPipe>,
) -> io::Result<()> {
    UdpServer::bind(config, ctx, shutdown)?
        .with_signals(signals)?
        .run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolType;
    use crate::protocols::chunk::Chunk;
    use crate::runtime::Protocol;
    use std::thread;

    fn datagram(number: i32, last: bool, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        Chunk {
            number,
            last,
            payload,
        }
        .encode(&mut out);
        out.push(0);
        out
    }

    fn ack(client: &std::net::UdpSocket) -> Option<Vec<u8>> {
        let mut buf = [0u8; MAX_DATAGRAM];
        match client.recv_from(&mut buf) {
            Ok((n, _)) => Some(buf[..n].to_vec()),
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                None
            }
            Err(e) => panic!("receive failed: {}", e),
        }
    }

    #[test]
    fn test_chunk_transfer() {
        let shutdown = Shutdown::new();
        let server = UdpServer::bind(
            &Config::loopback(ProtocolType::Chunk, 2),
            Arc::new(ServerContext::new(Protocol::Chunk)),
            shutdown.clone(),
        )
        .unwrap();
        let addr = server.local_addr().unwrap();
        let handle = thread::spawn(move || server.run());

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();

        let first = datagram(1, false, b"Hello, ");
        client.send_to(&first, addr).unwrap();
        assert_eq!(ack(&client), Some(first.clone()));

        // Skipping ahead gets no acknowledgement.
        client.send_to(&datagram(3, true, b"!"), addr).unwrap();
        assert_eq!(ack(&client), None);

        // A lost acknowledgement is answered again.
        client.send_to(&first, addr).unwrap();
        assert_eq!(ack(&client), Some(first));

        let last = datagram(2, true, b"world");
        client.send_to(&last, addr).unwrap();
        assert_eq!(ack(&client), Some(last));

        // Short datagrams are ignored.
        client.send_to(&[0, 0, 1], addr).unwrap();
        assert_eq!(ack(&client), None);

        shutdown.trigger();
        handle.join().unwrap().unwrap();
    }
}
