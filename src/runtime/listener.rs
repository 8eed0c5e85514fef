//! Listening socket construction and the stream types accepted from them.

use mio::event::Source;
use mio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol as SockProtocol, SockAddr, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Resolve the configured listen address.
pub fn resolve(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("address '{}' did not resolve", addr),
        )
    })
}

/// Create a non-blocking TCP listener with SO_REUSEADDR and the given backlog.
pub fn bind_tcp(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(SockProtocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Create a non-blocking UDP socket.
pub fn bind_udp(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(SockProtocol::UDP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    Ok(socket.into())
}

/// Unix-domain listener that unlinks its socket path when dropped.
///
/// `L` is the mio listener for the event loop or the std listener for the
/// threaded runtime.
pub struct LocalListener<L = UnixListener> {
    listener: L,
    path: PathBuf,
}

/// Bind a non-blocking Unix-domain stream listener at `path`.
fn bind_local(path: &Path, backlog: i32) -> io::Result<std::os::unix::net::UnixListener> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::unix(path)?)?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

impl LocalListener<UnixListener> {
    pub fn bind(path: &Path, backlog: i32) -> io::Result<Self> {
        Ok(Self {
            listener: UnixListener::from_std(bind_local(path, backlog)?),
            path: path.to_path_buf(),
        })
    }
}

impl LocalListener<std::os::unix::net::UnixListener> {
    pub fn bind_std(path: &Path, backlog: i32) -> io::Result<Self> {
        Ok(Self {
            listener: bind_local(path, backlog)?,
            path: path.to_path_buf(),
        })
    }

    /// Accept one pending connection.
    pub fn accept(&self) -> io::Result<(std::os::unix::net::UnixStream, String)> {
        let (stream, _) = self.listener.accept()?;
        Ok((stream, self.peer_name()))
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

impl<L> LocalListener<L> {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unix peers are unnamed; describe them by the listening path.
    fn peer_name(&self) -> String {
        format!("unix:{}", self.path.display())
    }
}

impl<L> Drop for LocalListener<L> {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to unlink local socket");
        }
    }
}

/// Any listener the event loop accepts stream clients from.
pub enum Listener {
    Tcp(TcpListener),
    Local(LocalListener),
}

impl Listener {
    /// Accept one pending connection, returning the stream and a printable
    /// peer description.
    pub fn accept(&self) -> io::Result<(Stream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept()?;
                Ok((Stream::Tcp(stream), addr.to_string()))
            }
            Listener::Local(local) => {
                let (stream, _) = local.listener.accept()?;
                Ok((Stream::Local(stream), local.peer_name()))
            }
        }
    }

    /// Bound TCP address, if this is a TCP listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Local(_) => None,
        }
    }
}

impl Source for Listener {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.register(registry, token, interests),
            Listener::Local(l) => l.listener.register(registry, token, interests),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.reregister(registry, token, interests),
            Listener::Local(l) => l.listener.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.deregister(registry),
            Listener::Local(l) => l.listener.deregister(registry),
        }
    }
}

/// A client stream over TCP or a Unix-domain socket.
pub enum Stream {
    Tcp(TcpStream),
    Local(UnixStream),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Local(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Local(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Local(s) => s.flush(),
        }
    }
}

impl Source for Stream {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.register(registry, token, interests),
            Stream::Local(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.reregister(registry, token, interests),
            Stream::Local(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.deregister(registry),
            Stream::Local(s) => s.deregister(registry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_tcp_ephemeral() {
        let listener = bind_tcp(resolve("127.0.0.1:0").unwrap(), 8).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let listener = Listener::Tcp(TcpListener::from_std(listener));
        assert!(matches!(listener.accept(), Err(ref e) if e.kind() == io::ErrorKind::WouldBlock));

        let _client = std::net::TcpStream::connect(addr).unwrap();
        // The connection is queued by the kernel; accept may need a moment.
        let mut accepted = None;
        for _ in 0..100 {
            match listener.accept() {
                Ok(pair) => {
                    accepted = Some(pair);
                    break;
                }
                Err(_) => std::thread::sleep(std::time::Duration::from_millis(10)),
            }
        }
        let (_, peer) = accepted.expect("connection not accepted");
        assert!(peer.starts_with("127.0.0.1:"));
    }

    #[test]
    fn test_local_listener_unlinks_path() {
        let path = std::env::temp_dir().join(format!("muxd-listener-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let local = LocalListener::bind(&path, 4).unwrap();
        assert!(path.exists());
        assert_eq!(local.path(), path.as_path());
        drop(local);
        assert!(!path.exists());
    }

    #[test]
    fn test_blocking_local_listener() {
        let path = std::env::temp_dir().join(format!("muxd-listener-std-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let local = LocalListener::bind_std(&path, 4).unwrap();
        assert!(matches!(local.accept(), Err(ref e) if e.kind() == io::ErrorKind::WouldBlock));

        let _client = std::os::unix::net::UnixStream::connect(&path).unwrap();
        let (_, peer) = local.accept().unwrap();
        assert_eq!(peer, format!("unix:{}", path.display()));

        drop(local);
        assert!(!path.exists());
    }

    #[test]
    fn test_resolve_rejects_garbage() {
        assert!(resolve("not an address").is_err());
    }
}
