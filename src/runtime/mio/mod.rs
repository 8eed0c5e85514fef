//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).
//! A single thread owns every socket and the connection registry.

mod event_loop;

pub use event_loop::EventLoop;

use crate::config::Config;
use crate::runtime::{ServerContext, Shutdown, SignalPipe};
use std::sync::Arc;

/// Run the server using mio backend.
pub fn run(
    config: &Config,
    ctx: Arc<ServerContext>,
    shutdown: Shutdown,
    signals: Option<SignalPipe>,
) -> std::io::Result<()> {
    EventLoop::bind(config, ctx, shutdown)?.with_signals(signals)?.run()
}
