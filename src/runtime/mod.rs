//! Server runtimes.
//!
//! Three ways of serving peers share one session model:
//! - `mio`: a single thread multiplexes every client with poll (epoll/kqueue)
//! - `threaded`: one blocking worker thread per client, bounded by a semaphore
//! - `udp`: datagram transfers for the chunk protocol
//!
//! All of them share common abstractions:
//! - `Session`: per-client request/response state machine
//! - `ConnectionRegistry`: bounded slot table
//! - `ServerContext`: state shared by every client
//! - `Shutdown` and `SignalPipe`: cooperative termination

mod connection;
mod context;
pub mod listener;
pub mod mio;
mod request;
mod shutdown;
pub mod signal;
pub mod threaded;
pub mod udp;

pub use connection::{ConnectionRegistry, Session};
pub use context::ServerContext;
pub use request::{ProcessResult, Protocol};
pub use shutdown::Shutdown;
pub use signal::{ignore_sigpipe, Signal, SignalPipe};

use crate::config::{Config, RuntimeType};
use std::sync::Arc;
use tracing::info;

/// Run the configured runtime until shutdown.
///
/// The chunk protocol always uses the datagram runtime.
pub fn run(
    config: &Config,
    ctx: ServerContext,
    shutdown: Shutdown,
    signals: Option<SignalPipe>,
) -> std::io::Result<()> {
    let ctx = Arc::new(ctx);

    if ctx.protocol() == Protocol::Chunk {
        info!("Using UDP runtime");
        return udp::run(config, ctx, shutdown, signals);
    }

    match config.runtime {
        RuntimeType::Mio => {
            info!("Using mio runtime (epoll/kqueue)");
            mio::run(config, ctx, shutdown, signals)
        }
        RuntimeType::Threaded => {
            info!("Using threaded runtime");
            threaded::run(config, ctx, shutdown, signals)
        }
    }
}
