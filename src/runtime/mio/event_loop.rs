//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! The poll set holds the listener(s), the signal self-pipe, a waker for
//! programmatic shutdown and every occupied connection slot. The wait is
//! the only blocking point of the server.

use crate::config::Config;
use crate::runtime::listener::{self, Listener, LocalListener, Stream};
use crate::runtime::{
    signal, ConnectionRegistry, Protocol, ServerContext, Session, Shutdown, SignalPipe,
};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const LOCAL_LISTENER_TOKEN: Token = Token(usize::MAX - 1);
const SIGNAL_TOKEN: Token = Token(usize::MAX - 2);
const WAKER_TOKEN: Token = Token(usize::MAX - 3);

const EVENTS_CAPACITY: usize = 256;
const READ_CHUNK: usize = 1024;

/// An occupied connection slot.
struct MioConnection {
    stream: Stream,
    session: Session,
    peer: String,
    /// Interest the stream is currently registered with.
    interest: Interest,
}

/// Single-threaded connection multiplexer.
pub struct EventLoop {
    poll: Poll,
    listener: Listener,
    local: Option<Listener>,
    signals: Option<SignalPipe>,
    connections: ConnectionRegistry<MioConnection>,
    ctx: Arc<ServerContext>,
    shutdown: Shutdown,
    timeout: Option<Duration>,
}

impl EventLoop {
    /// Bind the listening socket(s) and prepare the poll set.
    pub fn bind(config: &Config, ctx: Arc<ServerContext>, shutdown: Shutdown) -> io::Result<Self> {
        let poll = Poll::new()?;

        let addr = listener::resolve(&config.listen_addr())?;
        let tcp = listener::bind_tcp(addr, config.backlog)?;
        let mut listener = Listener::Tcp(TcpListener::from_std(tcp));
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let local = match &config.local_socket {
            Some(path) => {
                let local = LocalListener::bind(path, config.backlog)?;
                info!(path = %local.path().display(), "Listening on local socket");
                let mut local = Listener::Local(local);
                poll.registry()
                    .register(&mut local, LOCAL_LISTENER_TOKEN, Interest::READABLE)?;
                Some(local)
            }
            None => None,
        };

        shutdown.attach(&poll, WAKER_TOKEN)?;

        info!(
            addr = ?listener.local_addr(),
            max_clients = config.max_clients,
            protocol = ?ctx.protocol(),
            "Event loop listening"
        );

        Ok(Self {
            poll,
            listener,
            local,
            signals: None,
            connections: ConnectionRegistry::new(config.max_clients),
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

    /// Address of the TCP listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until shutdown is requested.
    ///
    /// Returns an error only when the wait itself fails; every client is
    /// closed before returning either way.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while !self.shutdown.is_triggered() {
            match self.poll.poll(&mut events, self.timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Poll failed");
                    self.close_all();
                    return Err(e);
                }
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN | LOCAL_LISTENER_TOKEN => self.accept_connections(event.token()),
                    SIGNAL_TOKEN => self.handle_signals()?,
                    WAKER_TOKEN => {}
                    Token(conn_id) => {
                        let readable = event.is_readable() || event.is_read_closed();
                        match self.drive(conn_id, readable) {
                            Ok(true) => {}
                            Ok(false) => self.close_connection(conn_id),
                            Err(e) => {
                                debug!(conn_id, error = %e, "Connection error");
                                self.close_connection(conn_id);
                            }
                        }
                    }
                }
            }
        }

        self.close_all();
        Ok(())
    }

    fn accept_connections(&mut self, token: Token) {
        loop {
            let listener = if token == LOCAL_LISTENER_TOKEN {
                match &self.local {
                    Some(local) => local,
                    None => return,
                }
            } else {
                &self.listener
            };

            match listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    /// Place a new peer into a free slot or turn it away.
    fn admit(&mut self, stream: Stream, peer: String) {
        let protocol = self.ctx.protocol();

        if !self.ctx.is_accepting() {
            reject(stream, protocol.rejection_notice(), &peer, "accepting paused");
            return;
        }
        if self.connections.is_full() {
            reject(stream, protocol.rejection_notice(), &peer, "too many clients");
            return;
        }

        let mut session = Session::new(protocol);
        session.open(&self.ctx);
        if session.is_done() {
            reject(stream, None, &peer, "session could not start");
            return;
        }

        let interest = if session.has_output() {
            Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let Some(conn_id) = self.connections.insert(MioConnection {
            stream,
            session,
            peer,
            interest,
        }) else {
            return;
        };

        let active = self.connections.len();
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return;
        };
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut conn.stream, Token(conn_id), interest)
        {
            warn!(conn_id, error = %e, "Failed to register connection");
            self.close_connection(conn_id);
            return;
        }

        debug!(conn_id, peer = %conn.peer, active, "Accepted connection");
    }

    /// Move bytes between the socket and the session.
    ///
    /// Returns `Ok(false)` once the session is finished and the slot should
    /// be freed.
    fn drive(&mut self, conn_id: usize, readable: bool) -> io::Result<bool> {
        let ctx = &self.ctx;
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(true);
        };

        let eof = readable && read_available(&mut conn.stream, &mut conn.session, ctx)?;

        conn.session.process(ctx);
        if eof {
            debug!(conn_id, "Peer closed its side");
            conn.session.peer_closed();
        }

        while conn.session.has_output() {
            if !write_pending(&mut conn.stream, &mut conn.session)? {
                break;
            }
            if conn.session.is_done() {
                break;
            }
            // Half-duplex: input that arrived during the response is parsed now.
            conn.session.process(ctx);
        }

        if conn.session.is_done() {
            return Ok(false);
        }

        let desired = if conn.session.has_output() {
            Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if desired != conn.interest {
            self.poll
                .registry()
                .reregister(&mut conn.stream, Token(conn_id), desired)?;
            conn.interest = desired;
        }
        Ok(true)
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

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.connections.remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            debug!(
                conn_id,
                peer = %conn.peer,
                phase = ?conn.session.phase(),
                active = self.connections.len(),
                "Connection closed"
            );
        }
    }

    fn close_all(&mut self) {
        let mut closed = 0;
        for mut conn in self.connections.drain() {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            closed += 1;
        }
        info!(closed, "Event loop stopped, client connections closed");
        if self.ctx.protocol() == Protocol::Max {
            let stats = self.ctx.max_stats();
            info!(max = stats.max, received = stats.received, "Running maximum summary");
        }
    }
}

/// Read everything the socket has, parsing as it arrives. Returns `true`
/// on end of stream.
fn read_available(stream: &mut Stream, session: &mut Session, ctx: &ServerContext) -> io::Result<bool> {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return Ok(true),
            Ok(n) => session.receive(&buf[..n], ctx)?,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Write the queued response. Returns `false` if the socket filled up
/// before everything was written.
fn write_pending(stream: &mut Stream, session: &mut Session) -> io::Result<bool> {
    while session.has_output() {
        match stream.write(session.pending_output()) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => session.advance_output(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Close a peer immediately, optionally telling it why first.
fn reject(mut stream: Stream, notice: Option<&[u8]>, peer: &str, reason: &str) {
    if let Some(notice) = notice {
        if let Err(e) = stream.write(notice) {
            debug!(peer, error = %e, "Failed to send rejection notice");
        }
    }
    info!(peer, reason, "Connection refused");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolType;
    use crate::protocols::calc::{self, Frame, Operator, FRAME_LEN};
    use crate::protocols::quiz::QuizBank;
    use crate::runtime::Signal;
    use std::io::{BufRead, BufReader};
    use std::net::TcpStream;
    use std::thread::{self, JoinHandle};

    struct TestServer {
        addr: SocketAddr,
        shutdown: Shutdown,
        handle: JoinHandle<io::Result<()>>,
    }

    impl TestServer {
        fn start(config: Config, ctx: Arc<ServerContext>) -> Self {
            Self::start_with(config, ctx, None)
        }

        fn start_with(
            config: Config,
            ctx: Arc<ServerContext>,
            signals: Option<SignalPipe>,
        ) -> Self {
            let shutdown = Shutdown::new();
            let event_loop = EventLoop::bind(&config, ctx, shutdown.clone())
                .unwrap()
                .with_signals(signals)
                .unwrap();
            let addr = event_loop.local_addr().unwrap();
            let handle = thread::spawn(move || event_loop.run());
            TestServer {
                addr,
                shutdown,
                handle,
            }
        }

        fn connect(&self) -> TcpStream {
            let stream = TcpStream::connect(self.addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream
        }

        fn stop(self) {
            self.shutdown.trigger();
            self.handle.join().unwrap().unwrap();
        }
    }

    fn calc_server(max_clients: usize) -> TestServer {
        TestServer::start(
            Config::loopback(ProtocolType::Calc, max_clients),
            Arc::new(ServerContext::new(Protocol::Calc)),
        )
    }

    fn exchange<S: Read + Write>(stream: &mut S, request: Frame) -> Frame {
        stream.write_all(&request.to_bytes()).unwrap();
        let mut buf = [0u8; FRAME_LEN];
        stream.read_exact(&mut buf).unwrap();
        match calc::parse(&buf) {
            calc::ParseResult::Complete(frame, _) => frame,
            other => panic!("unexpected: {:?}", other),
        }
    }

    fn assert_closed<S: Read>(stream: &mut S) {
        let mut buf = [0u8; 64];
        match stream.read(&mut buf) {
            Ok(0) => {}
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => {}
            other => panic!("expected closed connection, got {:?}", other),
        }
    }

    #[test]
    fn test_calc_round_trip() {
        let server = calc_server(3);

        let mut client = server.connect();
        let response = exchange(&mut client, Frame::request(6, 3, Operator::Div));
        assert_eq!(response.result, 2);
        assert_eq!(response.status, 1);
        assert_closed(&mut client);

        let mut client = server.connect();
        let response = exchange(&mut client, Frame::request(5, 0, Operator::Div));
        assert_eq!(response.status, 0);
        assert_closed(&mut client);

        server.stop();
    }

    #[test]
    fn test_burst_with_complete_frame() {
        let server = calc_server(1);

        let mut client = server.connect();
        let mut burst = Frame::request(6, 3, Operator::Div).to_bytes().to_vec();
        burst.extend_from_slice(&[0u8; 5000]);
        client.write_all(&burst).unwrap();

        let mut buf = [0u8; FRAME_LEN];
        client.read_exact(&mut buf).unwrap();
        match calc::parse(&buf) {
            calc::ParseResult::Complete(frame, _) => {
                assert_eq!(frame.result, 2);
                assert_eq!(frame.status, 1);
            }
            other => panic!("unexpected: {:?}", other),
        }

        server.stop();
    }

    #[test]
    fn test_request_in_pieces() {
        let server = calc_server(1);

        let mut client = server.connect();
        let bytes = Frame::request(-4, 7, Operator::Mul).to_bytes();
        client.write_all(&bytes[..3]).unwrap();
        thread::sleep(Duration::from_millis(50));
        client.write_all(&bytes[3..]).unwrap();

        let mut buf = [0u8; FRAME_LEN];
        client.read_exact(&mut buf).unwrap();
        match calc::parse(&buf) {
            calc::ParseResult::Complete(frame, _) => assert_eq!(frame.result, -28),
            other => panic!("unexpected: {:?}", other),
        }

        server.stop();
    }

    #[test]
    fn test_rejects_beyond_max_clients() {
        let server = calc_server(3);

        let mut held: Vec<TcpStream> = (0..3).map(|_| server.connect()).collect();
        let mut extra = server.connect();
        assert_closed(&mut extra);

        for (i, client) in held.iter_mut().enumerate() {
            let response = exchange(client, Frame::request(i as i32, 1, Operator::Add));
            assert_eq!(response.result, i as i32 + 1);
        }

        server.stop();
    }

    #[test]
    fn test_disconnect_mid_request_frees_slot() {
        let server = calc_server(1);

        let mut partial = server.connect();
        partial.write_all(&[0, 0, 0]).unwrap();
        drop(partial);

        // The slot is freed once the server sees the end of stream.
        let mut served = None;
        for _ in 0..100 {
            let mut client = server.connect();
            if client.write_all(&Frame::request(2, 2, Operator::Add).to_bytes()).is_err() {
                thread::sleep(Duration::from_millis(20));
                continue;
            }
            let mut buf = [0u8; FRAME_LEN];
            if client.read_exact(&mut buf).is_ok() {
                served = Some(buf);
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }

        let buf = served.expect("slot was never freed");
        match calc::parse(&buf) {
            calc::ParseResult::Complete(frame, _) => assert_eq!(frame.result, 4),
            other => panic!("unexpected: {:?}", other),
        }

        server.stop();
    }

    #[test]
    fn test_shutdown_closes_sockets() {
        let server = calc_server(2);
        let addr = server.addr;

        let mut idle = server.connect();
        // Make sure the idle client holds a slot before stopping.
        let mut active = server.connect();
        exchange(&mut active, Frame::request(1, 1, Operator::Add));

        server.stop();

        assert_closed(&mut idle);
        assert!(TcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_paused_server_rejects() {
        let ctx = Arc::new(ServerContext::new(Protocol::Calc));
        let server = TestServer::start(Config::loopback(ProtocolType::Calc, 2), Arc::clone(&ctx));

        ctx.toggle_accepting();
        let mut refused = server.connect();
        assert_closed(&mut refused);

        ctx.toggle_accepting();
        let mut client = server.connect();
        assert_eq!(exchange(&mut client, Frame::request(3, 4, Operator::Sub)).result, -1);

        server.stop();
    }

    #[test]
    fn test_max_protocol() {
        let ctx = Arc::new(ServerContext::new(Protocol::Max));
        let server = TestServer::start(Config::loopback(ProtocolType::Max, 2), Arc::clone(&ctx));

        let ask = |stream: &mut TcpStream, value: u32| -> u32 {
            stream.write_all(&value.to_be_bytes()).unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            u32::from_be_bytes(buf)
        };

        let mut first = server.connect();
        let mut second = server.connect();
        assert_eq!(ask(&mut first, 5), 0);
        assert_eq!(ask(&mut second, 9), 5);
        assert_eq!(ask(&mut first, 1), 9);
        assert_eq!(ask(&mut first, 2), 9);
        assert_closed(&mut first);

        assert_eq!(ctx.max_stats().max, 9);
        assert_eq!(ctx.max_stats().received, 4);

        server.stop();
    }

    #[test]
    fn test_quiz_session_and_rejection() {
        let bank = QuizBank::parse("What is 2+2?\n4\n\nCapital of Poland?\nWarsaw\n").unwrap();
        let server = TestServer::start(
            Config::loopback(ProtocolType::Quiz, 1),
            Arc::new(ServerContext::with_quiz(bank)),
        );

        let client = server.connect();
        let mut reader = BufReader::new(client.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "Hello!\n");
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "What is 2+2?\n");

        let mut turned_away = server.connect();
        let mut notice = Vec::new();
        turned_away.read_to_end(&mut notice).unwrap();
        assert_eq!(notice, b"Error: too many clients");

        (&client).write_all(b"r").unwrap();
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "4\n");
        line.clear();
        assert_eq!(reader.read_line(&mut line).unwrap(), 0);

        server.stop();
    }

    #[test]
    fn test_local_socket() {
        let path = std::env::temp_dir().join(format!("muxd-loop-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let mut config = Config::loopback(ProtocolType::Calc, 2);
        config.local_socket = Some(path.clone());
        let server = TestServer::start(config, Arc::new(ServerContext::new(Protocol::Calc)));

        let mut client = std::os::unix::net::UnixStream::connect(&path).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let response = exchange(&mut client, Frame::request(10, 4, Operator::Sub));
        assert_eq!(response.result, 6);
        assert_closed(&mut client);

        server.stop();
        assert!(!path.exists());
    }

    #[test]
    fn test_terminate_signal_stops_loop() {
        let _serial = signal::serial_guard();
        let pipe = SignalPipe::install(&[Signal::Interrupt, Signal::Terminate]).unwrap();
        let server = TestServer::start_with(
            Config::loopback(ProtocolType::Calc, 2),
            Arc::new(ServerContext::new(Protocol::Calc)),
            Some(pipe),
        );

        let mut idle = server.connect();
        let mut active = server.connect();
        exchange(&mut active, Frame::request(1, 1, Operator::Add));

        // SAFETY: the SIGTERM handler stays installed until the loop returns.
        assert_eq!(unsafe { libc::raise(libc::SIGTERM) }, 0);
        server.handle.join().unwrap().unwrap();

        assert!(server.shutdown.is_triggered());
        assert_closed(&mut idle);
    }

    #[test]
    fn test_toggle_signal_pauses_admission() {
        let _serial = signal::serial_guard();
        let pipe = SignalPipe::install(&[Signal::ToggleAccept]).unwrap();
        let ctx = Arc::new(ServerContext::new(Protocol::Calc));
        let server = TestServer::start_with(
            Config::loopback(ProtocolType::Calc, 2),
            Arc::clone(&ctx),
            Some(pipe),
        );

        let wait_for = |accepting: bool| {
            for _ in 0..250 {
                if ctx.is_accepting() == accepting {
                    return;
                }
                thread::sleep(Duration::from_millis(20));
            }
            panic!("admission flag never became {}", accepting);
        };

        // SAFETY: the SIGUSR1 handler stays installed until the loop returns.
        assert_eq!(unsafe { libc::raise(libc::SIGUSR1) }, 0);
        wait_for(false);
        let mut refused = server.connect();
        assert_closed(&mut refused);

        assert_eq!(unsafe { libc::raise(libc::SIGUSR1) }, 0);
        wait_for(true);
        let mut client = server.connect();
        assert_eq!(exchange(&mut client, Frame::request(8, 2, Operator::Mul)).result, 16);

        server.stop();
    }
}
