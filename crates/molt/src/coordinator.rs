//! Signal-driven stop / hot-swap coordinator.
//!
//! - `SIGINT`, `SIGTERM`: terminate. Run the shutdown callback and return
//! - `SIGHUP`: reload. Spawn the successor, then run the shutdown callback
//!
//! The coordinator acts on exactly one signal: the callback runs once with a
//! fresh [`CancellationToken`]. While the callback runs the source stays
//! subscribed. A later terminate signal cancels the callback's token, a later
//! reload is rejected, and neither re-enters. The source is dropped once the
//! callback returns.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{HandoverError, Result};
use crate::registry::Registry;
use crate::respawn::Respawn;

/// The two classes of signal the coordinator reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalClass {
    /// Stop this generation.
    Terminate,
    /// Hand the listeners to a successor, then stop this generation.
    Reload,
}

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Waiting,
    Terminating,
    Reloading,
    Done,
}

/// What the coordinator does in response to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Invoke the shutdown callback.
    Shutdown,
    /// Launch the successor, then invoke the shutdown callback.
    Respawn,
    /// Drop the signal.
    Ignore,
    /// A reload is already pending; refuse to start another.
    RejectReload,
    /// Shutdown is under way and the process was asked again: cancel the
    /// callback's context.
    Hurry,
}

impl State {
    /// Transition table. Only `Waiting` starts a shutdown or a respawn. While
    /// one is under way a terminate signal hurries it and a second reload is
    /// rejected.
    pub fn on_signal(self, class: SignalClass) -> (State, Action) {
        match (self, class) {
            (State::Waiting, SignalClass::Terminate) => (State::Terminating, Action::Shutdown),
            (State::Waiting, SignalClass::Reload) => (State::Reloading, Action::Respawn),
            (State::Terminating | State::Reloading, SignalClass::Terminate) => (self, Action::Hurry),
            (State::Reloading, SignalClass::Reload) => (State::Reloading, Action::RejectReload),
            (state, _) => (state, Action::Ignore),
        }
    }
}

/// A stream of classified signals.
pub trait SignalSource: Send {
    /// Next signal, or `None` once the source is closed.
    fn recv(&mut self) -> impl Future<Output = Option<SignalClass>> + Send;
}

/// Programmatic triggers, e.g. from an admin endpoint or a test.
impl SignalSource for mpsc::Receiver<SignalClass> {
    fn recv(&mut self) -> impl Future<Output = Option<SignalClass>> + Send {
        mpsc::Receiver::recv(self)
    }
}

static UNIX_SIGNALS_LIVE: AtomicBool = AtomicBool::new(false);

/// Releases the process-wide subscription flag.
#[derive(Debug)]
struct Subscription;

impl Drop for Subscription {
    fn drop(&mut self) {
        UNIX_SIGNALS_LIVE.store(false, Ordering::SeqCst);
    }
}

/// OS signal subscription. At most one is live per process.
pub struct UnixSignals {
    interrupt: Signal,
    terminate: Signal,
    reload: Signal,
    reload_kind: SignalKind,
    _subscription: Subscription,
}

impl UnixSignals {
    /// Subscribe to `SIGINT`, `SIGTERM` and `SIGHUP`.
    pub fn subscribe() -> Result<Self> {
        Self::with_reload_signal(SignalKind::hangup())
    }

    /// Subscribe with `reload` as the reload signal instead of `SIGHUP`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_reload_signal(reload: SignalKind) -> Result<Self> {
        if UNIX_SIGNALS_LIVE.swap(true, Ordering::SeqCst) {
            return Err(HandoverError::AlreadySubscribed);
        }
        let subscription = Subscription;

        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).map_err(HandoverError::Signal)?,
            terminate: signal(SignalKind::terminate()).map_err(HandoverError::Signal)?,
            reload: signal(reload).map_err(HandoverError::Signal)?,
            reload_kind: reload,
            _subscription: subscription,
        })
    }
}

impl SignalSource for UnixSignals {
    fn recv(&mut self) -> impl Future<Output = Option<SignalClass>> + Send {
        async move {
            tokio::select! {
                received = self.interrupt.recv() => received.map(|()| {
                    info!("Received SIGINT, shutting down");
                    SignalClass::Terminate
                }),
                received = self.terminate.recv() => received.map(|()| {
                    info!("Received SIGTERM, shutting down");
                    SignalClass::Terminate
                }),
                received = self.reload.recv() => received.map(|()| {
                    info!(signal = ?self.reload_kind, "Received reload signal, handing over listeners");
                    SignalClass::Reload
                }),
            }
        }
    }
}

/// Drives one generation from "serving" to "callback returned".
pub struct Coordinator<R> {
    registry: Arc<Registry>,
    respawner: R,
    hurry: CancellationToken,
    state: State,
}

impl<R: Respawn> Coordinator<R> {
    pub fn new(registry: Arc<Registry>, respawner: R) -> Self {
        Self {
            registry,
            respawner,
            hurry: CancellationToken::new(),
            state: State::Waiting,
        }
    }

    /// Use `token` as the hurry token.
    pub fn with_hurry_token(mut self, token: CancellationToken) -> Self {
        self.hurry = token;
        self
    }

    /// Cancelling this token cancels the context handed to the shutdown
    /// callback. A terminate signal during shutdown cancels it too. The
    /// coordinator itself never times out the callback.
    pub fn hurry_token(&self) -> CancellationToken {
        self.hurry.clone()
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Seal the registry, wait for one signal and act on it.
    ///
    /// On terminate, `callback` runs once. On reload, the successor is spawned
    /// first; if that fails the error is returned and `callback` does not run.
    /// Signals arriving while the callback runs go through [`State::on_signal`]
    /// and never start a second callback. Callback errors are logged, not
    /// returned.
    ///
    /// Returns the signal class that ended this generation.
    pub async fn run<S, F, Fut, E>(mut self, mut source: S, callback: F) -> Result<SignalClass>
    where
        S: SignalSource,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: fmt::Display,
    {
        self.registry.seal();
        info!(listeners = self.registry.len(), "Waiting for terminate or reload signal");

        let (class, action) = loop {
            let Some(class) = source.recv().await else {
                return Err(HandoverError::SignalSourceClosed);
            };
            match self.advance(class) {
                action @ (Action::Shutdown | Action::Respawn) => break (class, action),
                _ => continue,
            }
        };

        if action == Action::Respawn {
            match self.respawner.respawn() {
                Ok(pid) => info!(pid, "Successor generation running, shutting down this one"),
                Err(e) => {
                    error!(error = %e, "Reload failed");
                    self.state = State::Done;
                    return Err(e);
                }
            }
        }

        let shutdown = callback(self.hurry.child_token());
        tokio::pin!(shutdown);
        let mut source_open = true;

        let outcome = loop {
            tokio::select! {
                biased;
                outcome = &mut shutdown => break outcome,
                next = source.recv(), if source_open => match next {
                    Some(later) => {
                        self.advance(later);
                    }
                    None => source_open = false,
                },
            }
        };
        drop(source);

        match outcome {
            Ok(()) => info!(?class, "Shutdown callback complete"),
            Err(e) => error!(?class, error = %e, "Shutdown callback failed"),
        }

        self.state = State::Done;
        Ok(class)
    }

    /// Feed one signal through the transition table and apply the side
    /// effects that do not need the caller.
    fn advance(&mut self, class: SignalClass) -> Action {
        let (next, action) = self.state.on_signal(class);
        self.state = next;
        match action {
            Action::Shutdown | Action::Respawn => {}
            Action::Ignore => warn!(?class, state = ?self.state, "Ignoring signal"),
            Action::RejectReload => warn!("Reload already in progress, rejecting"),
            Action::Hurry => {
                warn!(?class, "Asked to hurry, cancelling shutdown context");
                self.hurry.cancel();
            }
        }
        action
    }
}
