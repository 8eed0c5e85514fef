//! Thread-per-client runtime.
//!
//! The main thread multiplexes the listener, the signal pipe and the
//! shutdown waker with mio and hands every admitted peer to its own
//! worker thread. Concurrency is bounded by a counting semaphore: a peer
//! that cannot get a permit is turned away.

use crate::config::Config;
use crate::runtime::listener::{self, LocalListener};
use crate::runtime::{signal, ServerContext, Session, Shutdown, SignalPipe};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(0);
const SIGNAL_TOKEN: Token = Token(1);
const WAKER_TOKEN: Token = Token(2);
const LOCAL_LISTENER_TOKEN: Token = Token(3);

/// Housekeeping tick used when no poll timeout is configured.
const DEFAULT_TICK: Duration = Duration::from_millis(330);

const READ_CHUNK: usize = 1024;

/// Accept loop dispatching peers to worker threads.
pub struct ThreadedServer {
    poll: Poll,
    listener: TcpListener,
    local: Option<LocalListener<UnixListener>>,
    signals: Option<SignalPipe>,
    ctx: Arc<ServerContext>,
    shutdown: Shutdown,
    slots: Arc<Semaphore>,
    active: Arc<Mutex<usize>>,
    timeout: Option<Duration>,
    tick: Duration,
    workers: Vec<JoinHandle<()>>,
    spawned: u64,
}

impl ThreadedServer {
    pub fn bind(config: &Config, ctx: Arc<ServerContext>, shutdown: Shutdown) -> io::Result<Self> {
        let poll = Poll::new()?;

        let addr = listener::resolve(&config.listen_addr())?;
        let listener = listener::bind_tcp(addr, config.backlog)?;
        poll.registry().register(
            &mut SourceFd(&listener.as_raw_fd()),
            LISTENER_TOKEN,
            Interest::READABLE,
        )?;

        let local = match &config.local_socket {
            Some(path) => {
                let local = LocalListener::bind_std(path, config.backlog)?;
                poll.registry().register(
                    &mut SourceFd(&local.as_raw_fd()),
                    LOCAL_LISTENER_TOKEN,
                    Interest::READABLE,
                )?;
                info!(path = %local.path().display(), "Listening on local socket");
                Some(local)
            }
            None => None,
        };

        shutdown.attach(&poll, WAKER_TOKEN)?;

        info!(
            addr = %listener.local_addr()?,
            max_clients = config.max_clients,
            protocol = ?ctx.protocol(),
            "Threaded server listening"
        );

        Ok(Self {
            poll,
            listener,
            local,
            signals: None,
            ctx,
            shutdown,
            slots: Arc::new(Semaphore::new(config.max_clients)),
            active: Arc::new(Mutex::new(0)),
            timeout: config.poll_timeout,
            tick: config.poll_timeout.unwrap_or(DEFAULT_TICK),
            workers: Vec::new(),
            spawned: 0,
        })
    }

    /// Watch a signal self-pipe from the accept loop.
    pub fn with_signals(mut self, signals: Option<SignalPipe>) -> io::Result<Self> {
        if let Some(pipe) = &signals {
            pipe.register(self.poll.registry(), SIGNAL_TOKEN)?;
        }
        self.signals = signals;
        Ok(self)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of workers currently serving a peer.
    pub fn active_clients(&self) -> usize {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept peers until shutdown, then wait for every worker.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(16);

        while !self.shutdown.is_triggered() {
            match self.poll.poll(&mut events, self.timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Poll failed");
                    self.shutdown.trigger();
                    self.join_workers();
                    return Err(e);
                }
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN | LOCAL_LISTENER_TOKEN => self.accept_connections(event.token()),
                    SIGNAL_TOKEN => self.handle_signals()?,
                    _ => {}
                }
            }

            self.reap_workers();
        }

        self.join_workers();
        Ok(())
    }

    fn accept_connections(&mut self, token: Token) {
        loop {
            let accepted = if token == LOCAL_LISTENER_TOKEN {
                match &self.local {
                    Some(local) => local
                        .accept()
                        .map(|(stream, peer)| (Client::Local(stream), peer)),
                    None => return,
                }
            } else {
                self.listener
                    .accept()
                    .map(|(stream, addr)| (Client::Tcp(stream), addr.to_string()))
            };

            match accepted {
                Ok((client, peer)) => self.admit(client, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn admit(&mut self, stream: Client, peer: String) {
        let notice = self.ctx.protocol().rejection_notice();

        if !self.ctx.is_accepting() {
            reject(stream, notice, &peer, "accepting paused");
            return;
        }
        let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
            reject(stream, notice, &peer, "too many clients");
            return;
        };

        let guard = WorkerGuard::new(Arc::clone(&self.active), permit);
        let ctx = Arc::clone(&self.ctx);
        let shutdown = self.shutdown.clone();
        let tick = self.tick;
        let id = self.spawned;
        self.spawned += 1;
        let worker_peer = peer.clone();

        let spawned = thread::Builder::new()
            .name(format!("client-{}", id))
            .spawn(move || {
                let _guard = guard;
                match serve_blocking(stream, &ctx, &shutdown, tick) {
                    Ok(()) => debug!(peer = %worker_peer, "Client finished"),
                    Err(e) => debug!(peer = %worker_peer, error = %e, "Client error"),
                }
            });

        match spawned {
            Ok(handle) => {
                debug!(%peer, worker = id, active = self.active_clients(), "Accepted connection");
                self.workers.push(handle);
            }
            Err(e) => warn!(%peer, error = %e, "Failed to spawn client thread"),
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

    /// Join workers that already returned.
    fn reap_workers(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) =
            self.workers.drain(..).partition(|handle| handle.is_finished());
        self.workers = running;
        for handle in finished {
            if handle.join().is_err() {
                warn!("Client thread panicked");
            }
        }
    }

    fn join_workers(&mut self) {
        let count = self.workers.len();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("Client thread panicked");
            }
        }
        info!(joined = count, "Threaded server stopped, client threads joined");
    }
}

/// Holds a worker's semaphore permit and its place in the active count.
struct WorkerGuard {
    active: Arc<Mutex<usize>>,
    _permit: OwnedSemaphorePermit,
}

impl WorkerGuard {
    fn new(active: Arc<Mutex<usize>>, permit: OwnedSemaphorePermit) -> Self {
        *active.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Self {
            active,
            _permit: permit,
        }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        *active = active.saturating_sub(1);
    }
}

/// A peer accepted from the TCP or the Unix-domain listener.
enum Client {
    Tcp(TcpStream),
    Local(UnixStream),
}

impl Client {
    /// Switch to blocking mode with reads and writes timing out every `tick`.
    fn set_tick(&self, tick: Duration) -> io::Result<()> {
        match self {
            Client::Tcp(s) => {
                s.set_nonblocking(false)?;
                s.set_read_timeout(Some(tick))?;
                s.set_write_timeout(Some(tick))
            }
            Client::Local(s) => {
                s.set_nonblocking(false)?;
                s.set_read_timeout(Some(tick))?;
                s.set_write_timeout(Some(tick))
            }
        }
    }
}

impl Read for Client {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Client::Tcp(s) => s.read(buf),
            Client::Local(s) => s.read(buf),
        }
    }
}

impl Write for Client {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Client::Tcp(s) => s.write(buf),
            Client::Local(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Client::Tcp(s) => s.flush(),
            Client::Local(s) => s.flush(),
        }
    }
}

/// Serve one peer in blocking mode until its session is done.
///
/// Reads and writes time out every `tick` so the worker notices shutdown.
fn serve_blocking(
    mut stream: Client,
    ctx: &ServerContext,
    shutdown: &Shutdown,
    tick: Duration,
) -> io::Result<()> {
    stream.set_tick(tick)?;

    let mut session = Session::new(ctx.protocol());
    session.open(ctx);
    let mut buf = [0u8; READ_CHUNK];

    loop {
        while session.has_output() {
            if shutdown.is_triggered() {
                return Ok(());
            }
            match stream.write(session.pending_output()) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    session.advance_output(n);
                    if !session.has_output() {
                        session.process(ctx);
                    }
                }
                Err(ref e) if is_tick(e) => continue,
                Err(e) => return Err(e),
            }
        }

        if session.is_done() || shutdown.is_triggered() {
            return Ok(());
        }

        match stream.read(&mut buf) {
            Ok(0) => session.peer_closed(),
            Ok(n) => session.receive(&buf[..n], ctx)?,
            Err(ref e) if is_tick(e) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Timeouts and interruptions only mean the worker should look around.
fn is_tick(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

fn reject(mut stream: Client, notice: Option<&[u8]>, peer: &str, reason: &str) {
    if let Some(notice) = notice {
        if let Err(e) = stream.write(notice) {
            debug!(peer, error = %e, "Failed to send rejection notice");
        }
    }
    info!(peer, reason, "Connection refused");
}

/// Run the server with one thread per client.
pub fn run(
    config: &Config,
    ctx: Arc<ServerContext>,
    shutdown: Shutdown,
    signals: Option<SignalPipe>,
) -> io::Result<()> {
    ThreadedServer::bind(config, ctx, shutdown)?
        .with_signals(signals)?
        .run()
}
