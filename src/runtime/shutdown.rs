//! Cooperative shutdown token.
//!
//! Loops check the flag at the top of every iteration. Triggering also
//! wakes every attached poll so a loop blocked without timeout notices
//! within one wait cycle.

use mio::{Poll, Token, Waker};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Cloneable handle to a process-wide stop request.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    triggered: AtomicBool,
    wakers: Mutex<Vec<Arc<Waker>>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waker on `poll` that fires with `token` when shutdown is
    /// triggered.
    pub fn attach(&self, poll: &Poll, token: Token) -> io::Result<()> {
        let waker = Arc::new(Waker::new(poll.registry(), token)?);
        self.inner
            .wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(waker);
        Ok(())
    }

    /// Request shutdown and wake all attached loops.
    pub fn trigger(&self) {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            return;
        }
        let wakers = self.inner.wakers.lock().unwrap_or_else(PoisonError::into_inner);
        for waker in wakers.iter() {
            if let Err(e) = waker.wake() {
                debug!(error = %e, "Failed to wake event loop");
            }
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Events;
    use std::time::Duration;

    #[test]
    fn test_trigger_wakes_poll() {
        let mut poll = Poll::new().unwrap();
        let mut events = Events::with_capacity(8);
        let shutdown = Shutdown::new();
        shutdown.attach(&poll, Token(7)).unwrap();

        let remote = shutdown.clone();
        let handle = std::thread::spawn(move || remote.trigger());

        poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        handle.join().unwrap();

        assert!(events.iter().any(|e| e.token() == Token(7)));
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn test_trigger_is_idempotent() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        shutdown.trigger();
        shutdown.trigger();
        assert!(shutdown.is_triggered());
    }
}
