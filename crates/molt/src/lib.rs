//! # molt
//!
//! Zero-downtime restart and shutdown for long-running network servers.
//!
//! ## Overview
//!
//! A server acquires its listeners through molt, starts serving, then waits
//! on [`Handover::on_signal`]:
//! 1. On a terminate signal the shutdown callback runs and the process exits
//! 2. On a reload signal the same binary is spawned with every listening
//!    socket inherited, then the shutdown callback runs
//! 3. The successor adopts the inherited sockets instead of binding, so the
//!    kernel keeps accepting connections throughout the swap
//!
//! ## Signal Conventions
//!
//! - `SIGINT`, `SIGTERM`: graceful shutdown
//! - `SIGHUP`: graceful restart
//! - `SIGINT` or `SIGTERM` again while shutting down: cancel the callback's context
//!
//! ## Environment Variables
//!
//! - `MOLT_INHERITED`: `true` in a successor
//! - `MOLT_LISTENERS`: comma-separated `protocol@address` keys; key `i` is on fd `3 + i`
//!
//! ## Example
//!
//! ```no_run
//! # async fn run() -> Result<(), molt::HandoverError> {
//! let handover = molt::Handover::from_env()?;
//! let listener = handover.listen_tcp(":8080")?;
//! let server = tokio::spawn(async move {
//!     while let Ok((_stream, _peer)) = listener.accept().await {}
//! });
//!
//! handover
//!     .on_signal(|_ctx| async move {
//!         server.abort();
//!         Ok::<(), std::io::Error>(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform
//!
//! Unix only.

#[cfg(not(unix))]
compile_error!("molt requires a Unix platform (Linux or macOS)");

mod acquire;
pub mod codec;
mod coordinator;
mod error;
mod registry;
pub mod respawn;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use acquire::Acquirer;
pub use codec::{Inheritance, SlotTable};
pub use coordinator::{Action, Coordinator, SignalClass, SignalSource, State, UnixSignals};
pub use error::{HandoverError, Result};
pub use registry::{InvalidKey, ListenerKey, Protocol, Registration, Registry, Socket};
pub use respawn::{Respawn, Respawner, SpawnSpec};

/// Listener acquisition and signal handling for one process generation.
pub struct Handover {
    acquirer: Acquirer,
    hurry: CancellationToken,
}

impl Handover {
    /// Handover for this process, reading the inheritance environment.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(Arc::new(Registry::new()), Inheritance::from_env()?))
    }

    pub fn new(registry: Arc<Registry>, inheritance: Inheritance) -> Self {
        Self {
            acquirer: Acquirer::new(registry, inheritance),
            hurry: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.acquirer.registry()
    }

    /// `true` if this process inherited its listeners from a parent.
    pub fn is_inherited(&self) -> bool {
        self.acquirer.inheritance().is_inherited()
    }

    /// Bind or adopt a TCP listener. Must be called inside a Tokio runtime.
    pub fn listen_tcp(&self, address: &str) -> Result<tokio::net::TcpListener> {
        self.acquirer.acquire_tcp(address)
    }

    /// Bind or adopt a UDP socket. Must be called inside a Tokio runtime.
    pub fn listen_udp(&self, address: &str) -> Result<tokio::net::UdpSocket> {
        self.acquirer.acquire_udp(address)
    }

    /// End the acquisition phase. See [`Acquirer::finish`].
    pub fn finish(&self) -> Result<()> {
        self.acquirer.finish()
    }

    /// Cancelling this token cancels the context the shutdown callback receives.
    pub fn hurry_token(&self) -> CancellationToken {
        self.hurry.clone()
    }

    /// Block until `SIGINT`, `SIGTERM` or `SIGHUP`, then run the stop or
    /// hot-swap path and the shutdown callback.
    pub async fn on_signal<F, Fut, E>(self, callback: F) -> Result<SignalClass>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: fmt::Display,
    {
        let source = UnixSignals::subscribe()?;
        let respawner = Respawner::for_current_process(Arc::clone(self.registry()))?;
        self.on_signal_with(source, respawner, callback).await
    }

    /// [`Handover::on_signal`] with an explicit signal source and respawner.
    pub async fn on_signal_with<S, R, F, Fut, E>(
        self,
        source: S,
        respawner: R,
        callback: F,
    ) -> Result<SignalClass>
    where
        S: SignalSource,
        R: Respawn,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: fmt::Display,
    {
        self.finish()?;
        Coordinator::new(Arc::clone(self.registry()), respawner)
            .with_hurry_token(self.hurry)
            .run(source, callback)
            .await
    }
}
