//! Signal bridge for the event loops.
//!
//! The handler only writes the signal number into a non-blocking self-pipe.
//! The read end is registered with the loop's poll, so signal delivery
//! wakes the wait and the loop acts on it outside signal context.

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::info;

use super::{ServerContext, Shutdown};

/// Write end of the installed self-pipe, -1 when none is installed.
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(signo: libc::c_int) {
    // SAFETY: the errno slot is thread-local and always valid. The
    // interrupted code must see the value it left there.
    let saved = unsafe { *errno_location() };
    let fd = WAKE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signo as u8;
        // SAFETY: write(2) is async-signal-safe and the pipe never blocks.
        unsafe {
            libc::write(fd, (&byte as *const u8).cast(), 1);
        }
    }
    unsafe { *errno_location() = saved };
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno_location()
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__error()
}

/// Signals the server reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT: graceful shutdown.
    Interrupt,
    /// SIGTERM: graceful shutdown.
    Terminate,
    /// SIGUSR1: pause or resume admission of new peers.
    ToggleAccept,
}

impl Signal {
    pub fn from_raw(signo: libc::c_int) -> Option<Self> {
        match signo {
            libc::SIGINT => Some(Signal::Interrupt),
            libc::SIGTERM => Some(Signal::Terminate),
            libc::SIGUSR1 => Some(Signal::ToggleAccept),
            _ => None,
        }
    }

    pub fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::ToggleAccept => libc::SIGUSR1,
        }
    }

    /// Whether the signal asks the server to stop.
    pub fn is_shutdown(self) -> bool {
        matches!(self, Signal::Interrupt | Signal::Terminate)
    }
}

/// Installed signal handlers plus the self-pipe they write to.
///
/// Only one may exist per process. Dropping it restores the default
/// dispositions and closes the pipe.
pub struct SignalPipe {
    read: File,
    _write: OwnedFd,
    installed: Vec<Signal>,
}

impl SignalPipe {
    /// Create the self-pipe and route `signals` into it.
    pub fn install(signals: &[Signal]) -> io::Result<Self> {
        let (read, write) = nonblocking_pipe()?;

        if WAKE_FD
            .compare_exchange(-1, write.as_raw_fd(), Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "signal pipe already installed",
            ));
        }

        let mut pipe = SignalPipe {
            read: File::from(read),
            _write: write,
            installed: Vec::with_capacity(signals.len()),
        };
        for &signal in signals {
            set_disposition(signal.as_raw(), forward_signal as *const () as libc::sighandler_t)?;
            pipe.installed.push(signal);
        }
        Ok(pipe)
    }

    /// Register the read end of the pipe with a poll registry.
    pub fn register(&self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut SourceFd(&self.read.as_raw_fd()), token, Interest::READABLE)
    }

    /// Collect every signal delivered since the last call.
    pub fn drain(&mut self) -> io::Result<Vec<Signal>> {
        let mut signals = Vec::new();
        let mut buf = [0u8; 32];
        loop {
            match self.read.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => signals.extend(
                    buf[..n]
                        .iter()
                        .filter_map(|&b| Signal::from_raw(libc::c_int::from(b))),
                ),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(signals)
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        for signal in &self.installed {
            let _ = set_disposition(signal.as_raw(), libc::SIG_DFL);
        }
        WAKE_FD.store(-1, Ordering::SeqCst);
    }
}

/// React to a delivered signal.
pub fn apply(signal: Signal, ctx: &ServerContext, shutdown: &Shutdown) {
    if signal.is_shutdown() {
        info!(?signal, "Shutdown requested");
        shutdown.trigger();
    } else {
        let accepting = ctx.toggle_accepting();
        info!(accepting, "Toggled admission of new clients");
    }
}

/// Serializes tests that install the process-wide signal pipe.
#[cfg(test)]
pub(crate) fn serial_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Ignore SIGPIPE so writes to vanished peers fail with `BrokenPipe`
/// instead of killing the process.
pub fn ignore_sigpipe() -> io::Result<()> {
    set_disposition(libc::SIGPIPE, libc::SIG_IGN)
}

fn set_disposition(signo: libc::c_int, handler: libc::sighandler_t) -> io::Result<()> {
    // SAFETY: the action is fully initialised before use and the handler
    // only performs async-signal-safe work.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signo, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn nonblocking_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` has room for the two descriptors pipe(2) returns.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created and are owned by nobody else.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    for fd in [read.as_raw_fd(), write.as_raw_fd()] {
        // SAFETY: fcntl on descriptors we own.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok((read, write))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_mapping() {
        for signal in [Signal::Interrupt, Signal::Terminate, Signal::ToggleAccept] {
            assert_eq!(Signal::from_raw(signal.as_raw()), Some(signal));
        }
        assert_eq!(Signal::from_raw(libc::SIGHUP), None);
        assert!(Signal::Interrupt.is_shutdown());
        assert!(!Signal::ToggleAccept.is_shutdown());
    }

    #[test]
    fn test_raised_signal_reaches_pipe() {
        let _serial = serial_guard();
        let mut pipe = SignalPipe::install(&[Signal::ToggleAccept]).unwrap();
        assert!(SignalPipe::install(&[Signal::ToggleAccept]).is_err());
        assert!(pipe.drain().unwrap().is_empty());

        // SAFETY: the handler for SIGUSR1 is installed above.
        assert_eq!(unsafe { libc::raise(libc::SIGUSR1) }, 0);
        assert_eq!(pipe.drain().unwrap(), vec![Signal::ToggleAccept]);
    }

    #[test]
    fn test_handler_preserves_errno() {
        let _serial = serial_guard();
        let mut pipe = SignalPipe::install(&[Signal::ToggleAccept]).unwrap();

        // Fill the pipe so the handler's own write fails with EAGAIN.
        let fill = [0u8; 4096];
        let fd = pipe._write.as_raw_fd();
        while unsafe { libc::write(fd, fill.as_ptr().cast(), fill.len()) } > 0 {}

        unsafe {
            *errno_location() = libc::EINTR;
            assert_eq!(libc::raise(libc::SIGUSR1), 0);
            assert_eq!(*errno_location(), libc::EINTR);
        }
        pipe.drain().unwrap();
    }

    #[test]
    fn test_apply() {
        let ctx = ServerContext::new(crate::runtime::Protocol::Calc);
        let shutdown = Shutdown::new();

        apply(Signal::ToggleAccept, &ctx, &shutdown);
        assert!(!ctx.is_accepting());
        assert!(!shutdown.is_triggered());

        apply(Signal::Terminate, &ctx, &shutdown);
        assert!(shutdown.is_triggered());
    }
}
